//! SSH-based tailing worker: connects, execs `tail -F`, and streams the remote stdout.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use logscrape_metrics::{Buckets, Registry};
use russh::{client, ChannelMsg};
use tokio::time::timeout;

use super::{base_labels, emit, WorkerHandle};
use crate::{config::SshTarget, parser::LogParser};

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepts any host key, logging a warning. Equivalent to paramiko's `WarningPolicy`.
struct WarnOnlyHostKeys {
    host: String,
}

#[async_trait]
impl client::Handler for WarnOnlyHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::warn!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "accepting SSH host key without verification"
        );
        Ok(true)
    }
}

enum SshError {
    ConnectTimeout,
    ConnectFailed(russh::Error),
    ReadTimeout,
    Unexpected(anyhow::Error),
}

/// Runs an SSH follower until `handle` is asked to stop.
///
/// A connect timeout retries immediately; a hard connect failure stops this worker for good; a
/// mid-stream read timeout reconnects. Any other error is process-fatal, per the "fail loud"
/// policy for misconfigured SSH targets.
pub async fn run(
    handle: Arc<WorkerHandle>,
    target: SshTarget,
    parser: LogParser,
    registry: Arc<Registry>,
    histograms: Arc<HashMap<String, Buckets>>,
) {
    while !handle.should_stop() {
        let outcome = run_once(&handle, &target, &parser, &registry, &histograms).await;
        handle.set_connected(false);
        match outcome {
            Ok(()) => {}
            Err(SshError::ConnectTimeout) => {
                tracing::warn!(host = %target.host, "SSH connect attempt timed out, retrying");
            }
            Err(SshError::ConnectFailed(err)) => {
                tracing::warn!(host = %target.host, %err, "SSH connect attempt failed, not retrying");
                break;
            }
            Err(SshError::ReadTimeout) => {
                tracing::debug!(host = %target.host, "SSH read timed out, reconnecting");
            }
            Err(SshError::Unexpected(err)) => {
                tracing::error!(host = %target.host, %err, "unexpected SSH failure, exiting process");
                std::process::exit(1);
            }
        }
    }
}

async fn run_once(
    handle: &WorkerHandle,
    target: &SshTarget,
    parser: &LogParser,
    registry: &Registry,
    histograms: &HashMap<String, Buckets>,
) -> Result<(), SshError> {
    let config = Arc::new(client::Config::default());
    let handler = WarnOnlyHostKeys {
        host: target.host.clone(),
    };
    let connect = client::connect(config, (target.host.as_str(), 22), handler);

    let mut session = match target.connect_timeout {
        Some(connect_timeout) => match timeout(connect_timeout, connect).await {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => return Err(SshError::ConnectFailed(err)),
            Err(_) => return Err(SshError::ConnectTimeout),
        },
        None => connect.await.map_err(SshError::ConnectFailed)?,
    };

    let authenticated = authenticate(&mut session, target)
        .await
        .map_err(SshError::Unexpected)?;
    if !authenticated {
        return Err(SshError::Unexpected(anyhow::anyhow!(
            "SSH authentication rejected for {}",
            target.host
        )));
    }

    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|err| SshError::Unexpected(err.into()))?;
    let command = format!("tail -n0 -F \"{}\" 2>/dev/null", target.file);
    channel
        .exec(true, command)
        .await
        .map_err(|err| SshError::Unexpected(err.into()))?;

    handle.set_connected(true);
    tracing::debug!(host = %target.host, file = %target.file, "SSH tail started");

    let mut pending = Vec::new();
    loop {
        if handle.should_stop() {
            return Ok(());
        }
        let message = match timeout(READ_TIMEOUT, channel.wait()).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(_) => return Err(SshError::ReadTimeout),
        };

        match message {
            ChannelMsg::Data { data } => {
                pending.extend_from_slice(&data);
                consume_lines(&mut pending, handle, parser, registry, histograms);
            }
            ChannelMsg::Eof | ChannelMsg::Close | ChannelMsg::ExitStatus { .. } => {
                return Ok(());
            }
            _ => {}
        }
    }
}

async fn authenticate(
    session: &mut client::Handle<WarnOnlyHostKeys>,
    target: &SshTarget,
) -> anyhow::Result<bool> {
    if let Some(pkey_path) = &target.pkey {
        let key = russh_keys::load_secret_key(pkey_path, None)?;
        Ok(session
            .authenticate_publickey(&target.user, Arc::new(key))
            .await?)
    } else {
        let password = target.password.as_deref().unwrap_or("");
        Ok(session.authenticate_password(&target.user, password).await?)
    }
}

fn consume_lines(
    buffer: &mut Vec<u8>,
    handle: &WorkerHandle,
    parser: &LogParser,
    registry: &Registry,
    histograms: &HashMap<String, Buckets>,
) {
    while let Some(pos) = buffer.iter().position(|&byte| byte == b'\n') {
        let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]);
        registry
            .process_metrics()
            .add_in_bytes(&handle.environment, line_bytes.len() as u64);
        let entry = parser.parse_line(&line, &base_labels(&handle.environment));
        emit(registry, &handle.environment, entry, histograms);
    }
}
