//! End-to-end test: runs the compiled binary against a small configuration and local log file,
//! then scrapes its HTTP endpoint directly over a raw socket.

use std::{
    io::{Read, Write},
    net::TcpStream,
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use anyhow::Context as _;
use std::io::{BufRead, BufReader};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_WAIT: Duration = Duration::from_secs(10);

struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.0.kill().ok();
    }
}

fn scrape(addr: &str) -> anyhow::Result<String> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

fn wait_for_scrape(addr: &str, needle: &str) -> anyhow::Result<String> {
    let started_at = Instant::now();
    loop {
        if let Ok(body) = scrape(addr) {
            if body.contains(needle) {
                return Ok(body);
            }
        }
        if started_at.elapsed() > MAX_WAIT {
            anyhow::bail!("timed out waiting for `{needle}` to appear in the scrape");
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[test]
fn tailing_a_local_log_produces_metrics() -> anyhow::Result<()> {
    let temp_dir = tempfile::tempdir().context("failed creating temp dir")?;
    let log_path = temp_dir.path().join("access.log");
    std::fs::write(&log_path, "")?;

    let config_path = temp_dir.path().join("scrapeconfig.yml");
    let config_yaml = format!(
        r#"
global:
  prefix: itest
  ttl: 300
  format:
    - remote_addr: label
    - status: label
    - bytes: clf_number
local:
  - path: {path}
    environment: itest
"#,
        path = log_path.display()
    );
    std::fs::write(&config_path, config_yaml)?;

    let binary = env!("CARGO_BIN_EXE_logscrape");
    let mut child = Command::new(binary)
        .env("SCRAPECONFIG", &config_path)
        .env("LOGSCRAPE_BIND", "127.0.0.1:0")
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .spawn()
        .context("failed spawning logscrape")?;

    let stdout = child.stdout.take().context("no child stdout")?;
    let mut stdout = BufReader::new(stdout);
    let mut line = String::new();
    stdout.read_line(&mut line)?;
    let child = ChildGuard(child);

    let addr = line
        .strip_prefix("local_addr=")
        .with_context(|| format!("malformed startup line: `{line}`"))?
        .trim();

    // Give the local tailing worker a moment to attach before appending.
    std::thread::sleep(Duration::from_millis(500));
    std::fs::write(&log_path, "10.0.0.1 200 512\n10.0.0.1 404 64\n")?;

    let body = wait_for_scrape(addr, "itest:lines_parsed_total")?;
    assert!(body.contains(r#"environment="itest""#), "{body}");
    assert!(body.contains("itest:bytes_total"), "{body}");
    assert!(body.contains("scraper_active_metrics"), "{body}");

    drop(child);
    Ok(())
}
