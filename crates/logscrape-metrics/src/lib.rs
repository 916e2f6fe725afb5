//! Dynamic, TTL-evicting Prometheus metrics registry.
//!
//! Unlike a typical `prometheus-client`-based metrics library, the schema handled here (family
//! names, their label sets, and histogram bucket boundaries) is only known at runtime, loaded
//! from a user-supplied configuration document rather than declared as Rust types at compile
//! time. [`Registry`] therefore creates metric families lazily on first observation and evicts
//! individual idle series once they have been untouched for longer than a configured TTL.
//!
//! Metrics are partitioned into per-`environment` sub-registries (see [`Registry::inc_counter`],
//! [`Registry::set_gauge`], [`Registry::observe`]) plus one process-wide registry of
//! self-observed metrics ([`ProcessMetrics`]) describing the health of the scraper itself.

// Linter settings.
#![warn(missing_debug_implementations, missing_docs, bare_trait_objects)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::must_use_candidate, clippy::module_name_repetitions)]

use std::sync::atomic::AtomicU64;

use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

mod buckets;
mod error;
mod format;
mod process;
mod registry;
pub mod validation;

pub use crate::{
    buckets::{Buckets, BucketsError},
    error::RegistryError,
    format::Format,
    process::{
        DisconnectedLabels, EnvironmentLabels, ProcessMetrics, ScriptEventKind, TargetState,
    },
    registry::{GcReport, Registry},
};

/// Floating-point counter backed by a bit-cast `AtomicU64`, matching the storage used throughout
/// this crate for counters and gauges (Prometheus counters and gauges are not integer-typed at
/// the wire level).
pub(crate) type DynCounter = Counter<f64, AtomicU64>;
/// Floating-point gauge, see [`DynCounter`].
pub(crate) type DynGauge = Gauge<f64, AtomicU64>;
/// Dynamic label set: an ordered list of `(name, value)` pairs, sorted by name so it can be used
/// directly as a `Family` key with a deterministic `Eq`/`Hash`.
pub(crate) type LabelVec = Vec<(String, String)>;

pub(crate) fn sorted_labels(labels: &std::collections::HashMap<String, String>) -> LabelVec {
    let mut pairs: LabelVec = labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pairs.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    pairs
}
