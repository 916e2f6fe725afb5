//! Periodic GC pass plus liveness gauges, run on a timer whose period is the configured TTL.

use std::{sync::Arc, time::Duration};

use logscrape_metrics::Registry;
use tokio::sync::Mutex;

use crate::supervisor::Supervisor;

/// Runs until the process exits: each tick evicts stale series via [`Registry::gc`], then
/// publishes `scrape_targets_count` and `target_disconnected` from the supervisor's current
/// worker set.
pub async fn run(registry: Arc<Registry>, supervisor: Arc<Mutex<Supervisor>>, ttl: Duration) {
    let mut interval = tokio::time::interval(ttl);
    interval.tick().await; // first tick fires immediately; the first GC pass waits a full period

    loop {
        interval.tick().await;
        tracing::debug!("running metrics garbage collection");
        let report = registry.gc();
        if report.evicted > 0 {
            tracing::info!(
                evicted = report.evicted,
                remaining = report.remaining,
                "GC pass evicted stale series"
            );
        }

        let supervisor = supervisor.lock().await;
        let mut connected = 0u64;
        let mut disconnected = 0u64;
        for worker in supervisor.workers() {
            if worker.is_connected() {
                connected += 1;
                registry
                    .process_metrics()
                    .clear_disconnected(&worker.host, &worker.environment);
            } else {
                disconnected += 1;
                registry
                    .process_metrics()
                    .mark_disconnected(&worker.host, &worker.environment);
            }
        }
        registry
            .process_metrics()
            .set_targets_count(connected, disconnected);
    }
}
