//! Always-present, process-internal metrics describing the health of the scraper itself.
//!
//! These are distinct from the per-`environment` families created dynamically by
//! [`Registry`](crate::Registry): they live in their own `prometheus_client` registry and are
//! merged into the exposition alongside the per-environment ones (see the `logscrape-exporter`
//! crate).

use std::fmt;

use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{family::Family, histogram::Histogram},
    registry::{Registry as PromRegistry, Unit},
};

use crate::{buckets::Buckets, DynCounter, DynGauge};

/// `environment` label used on `in_bytes`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct EnvironmentLabels {
    /// Environment the consumed bytes were read on behalf of.
    pub environment: String,
}

/// Connection state reported by `scrape_targets_count{type=...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum TargetState {
    /// The worker's follower loop is currently attached to its source.
    Connected,
    /// The worker is between connection attempts (backoff, reconnect, or permanently stopped).
    Disconnected,
}

impl fmt::Display for TargetState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct TargetCountLabels {
    r#type: TargetState,
}

/// `host`/`environment` labels used on `target_disconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct DisconnectedLabels {
    /// Target host (or local path, for a local follower).
    pub host: String,
    /// Environment the target was configured with.
    pub environment: String,
}

/// Outcome reported by `script_load_events{type=...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum ScriptEventKind {
    /// The configuration script exited successfully and produced parseable YAML.
    Success,
    /// The configuration script failed, timed out, or produced unparseable output.
    Error,
}

impl fmt::Display for ScriptEventKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Success => "success",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct ScriptEventLabels {
    r#type: ScriptEventKind,
}

/// Handle to the process-internal self-observed metrics listed in the exposition contract:
/// `scraper_active_metrics`, `scraper_gc_duration_seconds`, `in_bytes`, `scrape_targets_count`,
/// `target_disconnected`, `script_load_events`, `script_execution_time`.
///
/// All fields are cheap to clone (each wraps an `Arc` internally, as with any
/// `prometheus-client` metric type), so a [`ProcessMetrics`] handle can be shared across the
/// tailing workers, the supervisor and the GC/health reporter.
#[derive(Debug, Clone)]
pub struct ProcessMetrics {
    active_metrics: DynGauge,
    gc_duration_seconds: Histogram,
    in_bytes: Family<EnvironmentLabels, DynCounter>,
    scrape_targets_count: Family<TargetCountLabels, DynGauge>,
    target_disconnected: Family<DisconnectedLabels, DynGauge>,
    script_load_events: Family<ScriptEventLabels, DynCounter>,
    script_execution_time: Histogram,
}

impl ProcessMetrics {
    /// Creates the process-internal metrics and registers them into a fresh
    /// `prometheus_client` registry, returned alongside the handle.
    pub fn new() -> (Self, PromRegistry) {
        let mut registry = PromRegistry::default();

        let active_metrics = DynGauge::default();
        registry.register(
            "scraper_active_metrics",
            "Number of distinct metric series currently held across all sub-registries",
            active_metrics.clone(),
        );

        // `prometheus-client` has no dedicated summary type; a histogram over the GC pass
        // duration is used in its place, matching how the rest of this crate represents timings.
        let gc_duration_seconds = Histogram::new(Buckets::default_buckets().iter());
        registry.register_with_unit(
            "scraper_gc_duration_seconds",
            "Wall-clock time spent in one TTL eviction pass",
            Unit::Seconds,
            gc_duration_seconds.clone(),
        );

        let in_bytes = Family::<EnvironmentLabels, DynCounter>::default();
        registry.register_with_unit(
            "in_bytes",
            "Bytes consumed from tailed log sources",
            Unit::Bytes,
            in_bytes.clone(),
        );

        let scrape_targets_count = Family::<TargetCountLabels, DynGauge>::default();
        registry.register(
            "scrape_targets_count",
            "Number of tailing workers, partitioned by connection state",
            scrape_targets_count.clone(),
        );

        let target_disconnected = Family::<DisconnectedLabels, DynGauge>::default();
        registry.register(
            "target_disconnected",
            "Set to 1 for each target whose worker is currently disconnected",
            target_disconnected.clone(),
        );

        let script_load_events = Family::<ScriptEventLabels, DynCounter>::default();
        registry.register(
            "script_load_events",
            "Outcomes of invoking the configuration-generating script",
            script_load_events.clone(),
        );

        let script_execution_time = Histogram::new(Buckets::default_buckets().iter());
        registry.register_with_unit(
            "script_execution_time",
            "Wall-clock time spent running the configuration-generating script",
            Unit::Seconds,
            script_execution_time.clone(),
        );

        (
            Self {
                active_metrics,
                gc_duration_seconds,
                in_bytes,
                scrape_targets_count,
                target_disconnected,
                script_load_events,
                script_execution_time,
            },
            registry,
        )
    }

    /// Adjusts the count of known series by `delta` (positive on series creation, negative on
    /// eviction).
    pub fn adjust_active_metrics(&self, delta: i64) {
        self.active_metrics.inc_by(delta as f64);
    }

    /// Records the duration, in seconds, of one GC pass.
    pub fn observe_gc_duration(&self, seconds: f64) {
        self.gc_duration_seconds.observe(seconds);
    }

    /// Increments `in_bytes{environment}` by `amount`.
    pub fn add_in_bytes(&self, environment: &str, amount: u64) {
        self.in_bytes
            .get_or_create(&EnvironmentLabels {
                environment: environment.to_owned(),
            })
            .inc_by(amount as f64);
    }

    /// Overwrites `scrape_targets_count{type="connected"|"disconnected"}`.
    pub fn set_targets_count(&self, connected: u64, disconnected: u64) {
        self.scrape_targets_count
            .get_or_create(&TargetCountLabels {
                r#type: TargetState::Connected,
            })
            .set(connected as f64);
        self.scrape_targets_count
            .get_or_create(&TargetCountLabels {
                r#type: TargetState::Disconnected,
            })
            .set(disconnected as f64);
    }

    /// Marks a target as disconnected (`target_disconnected{host,environment} = 1`).
    pub fn mark_disconnected(&self, host: &str, environment: &str) {
        self.target_disconnected
            .get_or_create(&DisconnectedLabels {
                host: host.to_owned(),
                environment: environment.to_owned(),
            })
            .set(1.0);
    }

    /// Clears a previously marked disconnection, e.g. because the target was removed on reload.
    pub fn clear_disconnected(&self, host: &str, environment: &str) {
        self.target_disconnected.remove(&DisconnectedLabels {
            host: host.to_owned(),
            environment: environment.to_owned(),
        });
    }

    /// Records the outcome of one configuration-script invocation.
    pub fn record_script_event(&self, kind: ScriptEventKind, duration_secs: f64) {
        self.script_load_events
            .get_or_create(&ScriptEventLabels { r#type: kind })
            .inc();
        self.script_execution_time.observe(duration_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_self_metrics() {
        let (metrics, _registry) = ProcessMetrics::new();
        metrics.adjust_active_metrics(3);
        metrics.adjust_active_metrics(-1);
        metrics.observe_gc_duration(0.05);
        metrics.add_in_bytes("prod", 128);
        metrics.set_targets_count(2, 1);
        metrics.mark_disconnected("host-a", "prod");
        metrics.clear_disconnected("host-a", "prod");
        metrics.record_script_event(ScriptEventKind::Success, 0.2);

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &_registry).unwrap();
        assert!(buffer.contains("scraper_active_metrics 2"));
        assert!(buffer.contains(r#"in_bytes_total{environment="prod"} 128"#));
    }
}
