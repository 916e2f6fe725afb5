//! Tailing workers: one long-running task per target, each reading lines through the shared
//! parser and recording observations into the metric registry.

pub mod local;
pub mod ssh;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use logscrape_metrics::{Buckets, Registry};

use crate::parser::Metric;

/// Cooperative stop flag and liveness indicator for one tailing worker, shared between the
/// worker task, the supervisor (which sets `stop_me`), and the GC/health reporter (which reads
/// `connected`).
#[derive(Debug)]
pub struct WorkerHandle {
    stop_me: AtomicBool,
    connected: AtomicBool,
    /// Target host (SSH) or file path (local), used on `target_disconnected`.
    pub host: String,
    /// Environment this worker was configured with.
    pub environment: String,
}

impl WorkerHandle {
    pub fn new(host: String, environment: String) -> Arc<Self> {
        Arc::new(Self {
            stop_me: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            host,
            environment,
        })
    }

    /// Requests that the worker's run loop exit at its next opportunity.
    pub fn request_stop(&self) {
        self.stop_me.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.stop_me.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

fn base_labels(environment: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("environment".to_owned(), environment.to_owned());
    labels
}

/// Applies one parsed line (or a parse failure) to the registry, matching the emission loop
/// shared by every tailing worker: a parse failure increments `parser_errors`; a parsed line
/// increments `lines_parsed` plus one counter or histogram observation per numeric field.
fn emit(
    registry: &Registry,
    environment: &str,
    entry: Option<Metric>,
    histograms: &HashMap<String, Buckets>,
) {
    let Some(metric) = entry else {
        if let Err(err) = registry.inc_counter(
            "parser_errors",
            "Number of lines which could not be parsed",
            &base_labels(environment),
            1.0,
        ) {
            tracing::warn!(%err, "failed to record a parser error");
        }
        return;
    };

    if let Err(err) = registry.inc_counter(
        "lines_parsed",
        "Number of successfully parsed lines",
        &metric.labels,
        1.0,
    ) {
        tracing::warn!(%err, "failed to record a parsed line");
    }

    for (name, amount) in &metric.metrics {
        let result = if let Some(buckets) = histograms.get(name) {
            registry.observe(
                name,
                &format!("Distribution of \"{name}\""),
                &metric.labels,
                *amount,
                buckets,
            )
        } else {
            registry.inc_counter(
                name,
                &format!("Sum of \"{name}\""),
                &metric.labels,
                *amount,
            )
        };
        if let Err(err) = result {
            tracing::warn!(metric = name, %err, "failed to record an observation");
        }
    }
}
