//! Local-file tailing worker: follows `tail -F -n0 <path>` as a child process.

use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use logscrape_metrics::{Buckets, Registry};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    time::sleep,
};

use super::{base_labels, emit, WorkerHandle};
use crate::parser::LogParser;

const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Runs a local `tail -F` follower until `handle` is asked to stop. Reconnects 5 seconds after
/// any spawn failure or unexpected exit.
pub async fn run(
    handle: Arc<WorkerHandle>,
    path: String,
    parser: LogParser,
    registry: Arc<Registry>,
    histograms: Arc<HashMap<String, Buckets>>,
) {
    while !handle.should_stop() {
        let child = Command::new("tail")
            .args(["-F", "-n0", &path])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(target = %path, %err, "failed to spawn tail");
                sleep(RETRY_BACKOFF).await;
                continue;
            }
        };
        handle.set_connected(true);
        tracing::debug!(target = %path, "local tail started");

        let stdout = child.stdout.take().expect("piped stdout is always present");
        let mut lines = BufReader::new(stdout).lines();

        loop {
            if handle.should_stop() {
                break;
            }
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let byte_len = (line.len() + 1) as u64;
                    registry
                        .process_metrics()
                        .add_in_bytes(&handle.environment, byte_len);
                    let entry = parser.parse_line(&line, &base_labels(&handle.environment));
                    emit(&registry, &handle.environment, entry, &histograms);
                }
                Ok(None) => {
                    tracing::warn!(target = %path, "tail exited, reconnecting");
                    break;
                }
                Err(err) => {
                    tracing::warn!(target = %path, %err, "error reading tail output");
                    break;
                }
            }
        }

        handle.set_connected(false);
        let _ = child.start_kill();
        let _ = child.wait().await;

        if !handle.should_stop() {
            sleep(RETRY_BACKOFF).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Reader;

    #[tokio::test]
    async fn stopped_worker_exits_without_spawning() {
        let handle = WorkerHandle::new("/does/not/matter".to_owned(), "p".to_owned());
        handle.request_stop();
        let parser = LogParser::new(Arc::new(vec![Some(Reader::Label("x".to_owned()))]));
        let registry = Arc::new(Registry::new("test", Duration::from_secs(60)).unwrap());
        run(handle, "/does/not/matter".to_owned(), parser, registry, Arc::new(HashMap::new())).await;
    }
}
