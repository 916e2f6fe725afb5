//! Computes the desired tailing-target set from configuration and starts/stops workers to match.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use logscrape_metrics::{Buckets, ProcessMetrics, Registry, ScriptEventKind};
use tokio::{process::Command, task::JoinHandle, time::timeout};

use crate::{
    config::{Config, LocalTarget, SshTarget},
    parser::LogParser,
    tail::{local, ssh, WorkerHandle},
};

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);
/// Used when no `reload-interval` is configured ("sleep for a year" in the original scraper).
const NO_RELOAD_INTERVAL: Duration = Duration::from_secs(86_400 * 365);

struct RunningWorker {
    handle: Arc<WorkerHandle>,
    task: JoinHandle<()>,
}

/// Owns the running tailing workers and reconciles them against configuration, either the
/// initial load or a later reload from the declared script.
pub struct Supervisor {
    registry: Arc<Registry>,
    workers: HashMap<String, RunningWorker>,
    script: Option<String>,
    reload_interval: Duration,
}

impl Supervisor {
    /// Builds a supervisor and starts the initial target set from `config`.
    pub fn new(config: &Config, registry: Arc<Registry>) -> Self {
        let mut supervisor = Self {
            registry,
            workers: HashMap::new(),
            script: config.script.clone(),
            reload_interval: config.reload_interval.unwrap_or(NO_RELOAD_INTERVAL),
        };
        supervisor.apply(config);
        supervisor
    }

    /// Reconciles the running worker set against `config`'s desired targets: starts a worker for
    /// each new target id, stops and joins one for each target id no longer desired. Duplicate
    /// ids within the desired set are ignored (first one wins).
    pub fn apply(&mut self, config: &Config) {
        let parser = LogParser::new(Arc::clone(&config.readers));
        let mut desired = HashSet::new();

        for target in &config.local_targets {
            let id = local_target_id(target);
            if !desired.insert(id.clone()) {
                tracing::debug!(target = %id, "ignoring duplicate scrape target");
                continue;
            }
            self.ensure_local(&id, target, &parser, &config.histograms);
        }

        for target in &config.ssh_targets {
            let id = ssh_target_id(target);
            if !desired.insert(id.clone()) {
                tracing::debug!(target = %id, "ignoring duplicate scrape target");
                continue;
            }
            self.ensure_ssh(&id, target, &parser, &config.histograms);
        }

        let to_remove: Vec<String> = self
            .workers
            .keys()
            .filter(|id| !desired.contains(*id))
            .cloned()
            .collect();
        for id in to_remove {
            self.stop_worker(&id);
        }
    }

    fn ensure_local(
        &mut self,
        id: &str,
        target: &LocalTarget,
        parser: &LogParser,
        histograms: &Arc<HashMap<String, Buckets>>,
    ) {
        if self.workers.contains_key(id) {
            return;
        }
        let environment = target
            .environment
            .clone()
            .unwrap_or_else(|| "N/A".to_owned());
        let handle = WorkerHandle::new(target.path.clone(), environment);
        let task = tokio::spawn(local::run(
            Arc::clone(&handle),
            target.path.clone(),
            parser.clone(),
            Arc::clone(&self.registry),
            Arc::clone(histograms),
        ));
        self.workers
            .insert(id.to_owned(), RunningWorker { handle, task });
        tracing::info!(target = %id, "new scrape target added");
    }

    fn ensure_ssh(
        &mut self,
        id: &str,
        target: &SshTarget,
        parser: &LogParser,
        histograms: &Arc<HashMap<String, Buckets>>,
    ) {
        if self.workers.contains_key(id) {
            return;
        }
        let handle = WorkerHandle::new(target.host.clone(), target.environment.clone());
        let task = tokio::spawn(ssh::run(
            Arc::clone(&handle),
            target.clone(),
            parser.clone(),
            Arc::clone(&self.registry),
            Arc::clone(histograms),
        ));
        self.workers
            .insert(id.to_owned(), RunningWorker { handle, task });
        tracing::info!(target = %id, "new scrape target added");
    }

    fn stop_worker(&mut self, id: &str) {
        if let Some(worker) = self.workers.remove(id) {
            tracing::info!(target = %id, "scrape target will be removed");
            worker.handle.request_stop();
            tokio::spawn(async move {
                if let Err(err) = worker.task.await {
                    tracing::warn!(%err, "tailing worker task panicked");
                }
            });
        }
    }

    /// The currently running workers' handles, used by the GC/health reporter.
    pub fn workers(&self) -> impl Iterator<Item = &Arc<WorkerHandle>> {
        self.workers.values().map(|worker| &worker.handle)
    }

    /// The configured reload interval, or the "effectively infinite" default.
    pub fn reload_interval(&self) -> Duration {
        self.reload_interval
    }

    /// Re-reads configuration from the declared script, if any, and reconciles the worker set
    /// against it. Script failure (non-zero exit, timeout, or invalid YAML output) is logged and
    /// skips this cycle rather than touching the running worker set.
    pub async fn reload_from_script(&mut self, process_metrics: &ProcessMetrics) {
        let Some(script) = self.script.clone() else {
            return;
        };
        let start = Instant::now();

        let output = match timeout(SCRIPT_TIMEOUT, run_script(&script)).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                Self::record_script_failure(process_metrics, start, &script, &err.to_string());
                return;
            }
            Err(_) => {
                Self::record_script_failure(process_metrics, start, &script, "script timed out");
                return;
            }
        };

        let config = match Config::from_yaml(&output) {
            Ok(config) => config,
            Err(err) => {
                Self::record_script_failure(process_metrics, start, &script, &err.to_string());
                return;
            }
        };

        process_metrics.record_script_event(
            ScriptEventKind::Success,
            start.elapsed().as_secs_f64(),
        );
        self.script = config.script.clone();
        self.reload_interval = config.reload_interval.unwrap_or(NO_RELOAD_INTERVAL);
        self.apply(&config);
    }

    fn record_script_failure(
        process_metrics: &ProcessMetrics,
        start: Instant,
        script: &str,
        reason: &str,
    ) {
        process_metrics
            .record_script_event(ScriptEventKind::Error, start.elapsed().as_secs_f64());
        tracing::error!(script, reason, "failed to read configuration from script");
    }
}

async fn run_script(script: &str) -> anyhow::Result<String> {
    let output = Command::new("sh").arg("-c").arg(script).output().await?;
    if !output.status.success() {
        anyhow::bail!("script exited with {}", output.status);
    }
    Ok(String::from_utf8(output.stdout)?)
}

fn local_target_id(target: &LocalTarget) -> String {
    format!("local://{}", target.path)
}

fn ssh_target_id(target: &SshTarget) -> String {
    format!("ssh://{}/{}", target.host, target.file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_ids_match_the_scheme() {
        let local = LocalTarget {
            path: "/var/log/app.log".to_owned(),
            environment: None,
        };
        assert_eq!(local_target_id(&local), "local:///var/log/app.log");

        let ssh = SshTarget {
            host: "host-a".to_owned(),
            file: "/var/log/app.log".to_owned(),
            environment: "prod".to_owned(),
            user: "deploy".to_owned(),
            password: None,
            pkey: None,
            connect_timeout: None,
        };
        assert_eq!(ssh_target_id(&ssh), "ssh://host-a//var/log/app.log");
    }
}
