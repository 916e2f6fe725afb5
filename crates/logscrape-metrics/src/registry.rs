//! The dynamic, TTL-evicting metric registry (component B).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use prometheus_client::{
    metrics::{family::Family, family::MetricConstructor, histogram::Histogram},
    registry::Registry as PromRegistry,
};
use tracing::{error, warn};

use crate::{
    buckets::Buckets,
    error::RegistryError,
    format::{self, Format, PrometheusWrapper},
    process::ProcessMetrics,
    sorted_labels,
    validation::{validate_prefix, ENVIRONMENT_LABEL},
    DynCounter, DynGauge, LabelVec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FamilyKind {
    Counter,
    Gauge,
    Histogram,
}

impl FamilyKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

#[derive(Clone)]
struct HistogramConstructor(Arc<Vec<f64>>);

impl MetricConstructor<Histogram> for HistogramConstructor {
    fn new_metric(&self) -> Histogram {
        Histogram::new(self.0.iter().copied())
    }
}

enum FamilyStorage {
    Counter(Family<LabelVec, DynCounter>),
    Gauge(Family<LabelVec, DynGauge>),
    Histogram(Family<LabelVec, Histogram, HistogramConstructor>),
}

struct FamilyEntry {
    kind: FamilyKind,
    label_names: Vec<String>,
    storage: FamilyStorage,
}

/// Key identifying one series within an environment's sub-registry: the full metric name plus
/// its canonicalized (sorted) label set.
type SeriesKey = (String, LabelVec);

struct EnvironmentState {
    prom_registry: PromRegistry,
    families: HashMap<String, FamilyEntry>,
    last_touched: HashMap<SeriesKey, Instant>,
}

impl EnvironmentState {
    fn new() -> Self {
        Self {
            prom_registry: PromRegistry::default(),
            families: HashMap::new(),
            last_touched: HashMap::new(),
        }
    }
}

struct EnvironmentRegistry {
    state: Mutex<EnvironmentState>,
}

/// Outcome of one [`Registry::gc`] pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcReport {
    /// Number of series removed across all environments.
    pub evicted: usize,
    /// Number of series remaining across all environments after eviction.
    pub remaining: usize,
    /// Wall-clock time spent performing the pass.
    pub duration: Duration,
}

/// Per-`environment` dynamic Prometheus metric registry.
///
/// Families (`<prefix>:<name>`) are created lazily on first observation, in whichever
/// sub-registry matches the call's `environment` label. Series within a family are evicted once
/// idle longer than `ttl`; families themselves are never removed, per the specification.
pub struct Registry {
    prefix: String,
    ttl: Duration,
    environments: RwLock<HashMap<String, Arc<EnvironmentRegistry>>>,
    process: ProcessMetrics,
    process_registry: PromRegistry,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Registry")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Creates an empty registry. `prefix` is validated once here and glued with `:` to every
    /// user-declared metric name thereafter.
    pub fn new(prefix: impl Into<String>, ttl: Duration) -> Result<Self, RegistryError> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        let (process, process_registry) = ProcessMetrics::new();
        Ok(Self {
            prefix,
            ttl,
            environments: RwLock::new(HashMap::new()),
            process,
            process_registry,
        })
    }

    /// Returns a handle to the process-internal self-observed metrics.
    pub fn process_metrics(&self) -> &ProcessMetrics {
        &self.process
    }

    fn full_name(&self, name: &str) -> String {
        format!("{}:{name}", self.prefix)
    }

    fn environment_of<'a>(&self, labels: &'a HashMap<String, String>) -> Option<&'a str> {
        labels.get(ENVIRONMENT_LABEL).map(String::as_str)
    }

    fn environment_registry(&self, environment: &str) -> Arc<EnvironmentRegistry> {
        if let Some(existing) = self.environments.read().unwrap().get(environment) {
            return Arc::clone(existing);
        }
        let mut environments = self.environments.write().unwrap();
        Arc::clone(
            environments
                .entry(environment.to_owned())
                .or_insert_with(|| {
                    Arc::new(EnvironmentRegistry {
                        state: Mutex::new(EnvironmentState::new()),
                    })
                }),
        )
    }

    /// Increments the counter `<prefix>:<name>{labels}` by `amount`, creating the family and/or
    /// series on first observation.
    pub fn inc_counter(
        &self,
        name: &str,
        help: &str,
        labels: &HashMap<String, String>,
        amount: f64,
    ) -> Result<(), RegistryError> {
        let full_name = self.full_name(name);
        let environment = self
            .environment_of(labels)
            .ok_or_else(|| RegistryError::MissingEnvironment(full_name.clone()))?
            .to_owned();
        let env_registry = self.environment_registry(&environment);
        let mut state = env_registry.state.lock().unwrap();
        let key = sorted_labels(labels);

        let entry = Self::get_or_create_entry(
            &mut state,
            &full_name,
            help,
            FamilyKind::Counter,
            &key,
        )?;
        let FamilyStorage::Counter(family) = &entry.storage else {
            return Err(RegistryError::KindMismatch {
                name: full_name,
                expected: entry.kind.as_str(),
                actual: FamilyKind::Counter.as_str(),
            });
        };
        family.get_or_create(&key).inc_by(amount);
        Self::touch(&mut state, &full_name, key, &self.process);
        Ok(())
    }

    /// Sets the gauge `<prefix>:<name>{labels}` to `value`, creating the family and/or series on
    /// first observation.
    pub fn set_gauge(
        &self,
        name: &str,
        help: &str,
        labels: &HashMap<String, String>,
        value: f64,
    ) -> Result<(), RegistryError> {
        let full_name = self.full_name(name);
        let environment = self
            .environment_of(labels)
            .ok_or_else(|| RegistryError::MissingEnvironment(full_name.clone()))?
            .to_owned();
        let env_registry = self.environment_registry(&environment);
        let mut state = env_registry.state.lock().unwrap();
        let key = sorted_labels(labels);

        let entry = Self::get_or_create_entry(
            &mut state,
            &full_name,
            help,
            FamilyKind::Gauge,
            &key,
        )?;
        let FamilyStorage::Gauge(family) = &entry.storage else {
            return Err(RegistryError::KindMismatch {
                name: full_name,
                expected: entry.kind.as_str(),
                actual: FamilyKind::Gauge.as_str(),
            });
        };
        family.get_or_create(&key).set(value);
        Self::touch(&mut state, &full_name, key, &self.process);
        Ok(())
    }

    /// Observes `value` into the histogram `<prefix>:<name>{labels}`, creating the family and/or
    /// series (with `buckets`) on first observation. `buckets` is only consulted on first
    /// observation; subsequent calls reuse the family's original buckets.
    pub fn observe(
        &self,
        name: &str,
        help: &str,
        labels: &HashMap<String, String>,
        value: f64,
        buckets: &Buckets,
    ) -> Result<(), RegistryError> {
        let full_name = self.full_name(name);
        let environment = self
            .environment_of(labels)
            .ok_or_else(|| RegistryError::MissingEnvironment(full_name.clone()))?
            .to_owned();
        let env_registry = self.environment_registry(&environment);
        let mut state = env_registry.state.lock().unwrap();
        let key = sorted_labels(labels);

        if !state.families.contains_key(&full_name) {
            let constructor = HistogramConstructor(Arc::new(buckets.iter().collect()));
            let family =
                Family::<LabelVec, Histogram, HistogramConstructor>::new_with_constructor(
                    constructor,
                );
            state.prom_registry.register(
                full_name.clone(),
                help.to_owned(),
                family.clone(),
            );
            state.families.insert(
                full_name.clone(),
                FamilyEntry {
                    kind: FamilyKind::Histogram,
                    label_names: label_names_of(&key),
                    storage: FamilyStorage::Histogram(family),
                },
            );
        }
        let entry = state.families.get(&full_name).unwrap();
        Self::check_label_set(&full_name, entry, &key)?;
        let FamilyStorage::Histogram(family) = &entry.storage else {
            return Err(RegistryError::KindMismatch {
                name: full_name,
                expected: entry.kind.as_str(),
                actual: FamilyKind::Histogram.as_str(),
            });
        };
        family.get_or_create(&key).observe(value);
        Self::touch(&mut state, &full_name, key, &self.process);
        Ok(())
    }

    fn get_or_create_entry<'s>(
        state: &'s mut EnvironmentState,
        full_name: &str,
        help: &str,
        kind: FamilyKind,
        key: &LabelVec,
    ) -> Result<&'s FamilyEntry, RegistryError> {
        if !state.families.contains_key(full_name) {
            let storage = match kind {
                FamilyKind::Counter => {
                    let family = Family::<LabelVec, DynCounter>::default();
                    state
                        .prom_registry
                        .register(full_name.to_owned(), help.to_owned(), family.clone());
                    FamilyStorage::Counter(family)
                }
                FamilyKind::Gauge => {
                    let family = Family::<LabelVec, DynGauge>::default();
                    state
                        .prom_registry
                        .register(full_name.to_owned(), help.to_owned(), family.clone());
                    FamilyStorage::Gauge(family)
                }
                FamilyKind::Histogram => unreachable!("histograms are created by Registry::observe"),
            };
            state.families.insert(
                full_name.to_owned(),
                FamilyEntry {
                    kind,
                    label_names: label_names_of(key),
                    storage,
                },
            );
        }
        let entry = state.families.get(full_name).unwrap();
        Self::check_label_set(full_name, entry, key)?;
        Ok(entry)
    }

    fn check_label_set(
        full_name: &str,
        entry: &FamilyEntry,
        key: &LabelVec,
    ) -> Result<(), RegistryError> {
        let actual = label_names_of(key);
        if actual != entry.label_names {
            error!(
                metric = full_name,
                expected = ?entry.label_names,
                actual = ?actual,
                "label set changed after first observation"
            );
            return Err(RegistryError::LabelSetMismatch {
                name: full_name.to_owned(),
                expected: entry.label_names.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Stamps the series `(full_name, key)` as touched `now`, reporting a new series to
    /// `scraper_active_metrics` if this is the first observation of it.
    fn touch(state: &mut EnvironmentState, full_name: &str, key: LabelVec, process: &ProcessMetrics) {
        let series_key = (full_name.to_owned(), key);
        let is_new = !state.last_touched.contains_key(&series_key);
        state.last_touched.insert(series_key, Instant::now());
        if is_new {
            process.adjust_active_metrics(1);
        }
    }

    /// Scans every environment's series table and evicts entries idle longer than `ttl`,
    /// publishing the eviction count and duration to the process metrics.
    pub fn gc(&self) -> GcReport {
        let start = Instant::now();
        let now = Instant::now();
        let mut evicted = 0usize;
        let mut remaining = 0usize;

        let environments: Vec<_> = self.environments.read().unwrap().values().cloned().collect();
        for env_registry in environments {
            let mut state = env_registry.state.lock().unwrap();
            let stale: Vec<SeriesKey> = state
                .last_touched
                .iter()
                .filter(|(_, &touched)| now.duration_since(touched) > self.ttl)
                .map(|(key, _)| key.clone())
                .collect();

            for (full_name, label_key) in &stale {
                if let Some(entry) = state.families.get(full_name) {
                    match &entry.storage {
                        FamilyStorage::Counter(family) => {
                            family.remove(label_key);
                        }
                        FamilyStorage::Gauge(family) => {
                            family.remove(label_key);
                        }
                        FamilyStorage::Histogram(family) => {
                            family.remove(label_key);
                        }
                    }
                }
                state
                    .last_touched
                    .remove(&(full_name.clone(), label_key.clone()));
            }
            evicted += stale.len();
            remaining += state.last_touched.len();
        }

        let duration = start.elapsed();
        if evicted > 0 {
            tracing::info!(evicted, remaining, "GC pass evicted stale series");
        }
        self.process.adjust_active_metrics(-(evicted as i64));
        self.process.observe_gc_duration(duration.as_secs_f64());

        GcReport {
            evicted,
            remaining,
            duration,
        }
    }

    /// Encodes a full snapshot (all environment sub-registries plus the process-internal
    /// registry) in the requested exposition `format`, optionally restricted to the families
    /// named in `only`.
    pub fn snapshot(&self, format: Format, only: &[String]) -> String {
        let mut fragments = Vec::new();

        {
            let mut buffer = String::new();
            if prometheus_client::encoding::text::encode(&mut buffer, &self.process_registry)
                .is_err()
            {
                warn!("failed encoding process-internal registry");
            }
            fragments.push(buffer);
        }

        let environments: Vec<_> = self.environments.read().unwrap().values().cloned().collect();
        for env_registry in environments {
            let state = env_registry.state.lock().unwrap();
            let mut buffer = String::new();
            if prometheus_client::encoding::text::encode(&mut buffer, &state.prom_registry)
                .is_err()
            {
                warn!("failed encoding an environment sub-registry");
            }
            fragments.push(buffer);
        }

        let merged = format::merge_eof_terminators(&fragments);
        let merged = if !only.is_empty() {
            filter_by_name(&merged, only)
        } else {
            merged
        };

        match format {
            Format::OpenMetrics => merged,
            Format::Prometheus | Format::OpenMetricsForPrometheus => {
                let remove_eof = matches!(format, Format::Prometheus);
                let mut out = String::with_capacity(merged.len());
                let wrapper = PrometheusWrapper::new(&mut out, remove_eof);
                render_through(wrapper, &merged);
                out
            }
        }
    }
}

fn render_through(mut wrapper: PrometheusWrapper<'_, String>, input: &str) {
    use std::fmt::Write as _;
    write!(wrapper, "{input}").expect("writing to a string never fails");
    wrapper.flush().expect("writing to a string never fails");
}

/// Restricts an encoded OpenMetrics document to the metric families named in `names`
/// (`name[]` query parameter filtering for the exposition endpoint).
fn filter_by_name(encoded: &str, names: &[String]) -> String {
    let mut out = String::with_capacity(encoded.len());
    let mut keep_block = true;
    for line in encoded.lines() {
        if let Some(rest) = line.strip_prefix("# HELP ").or_else(|| line.strip_prefix("# TYPE ")) {
            let family_name = rest.split_whitespace().next().unwrap_or_default();
            keep_block = names.iter().any(|name| name == family_name);
        } else if !line.starts_with('#') {
            let sample_name = line
                .find(|ch: char| ch == '{' || ch.is_ascii_whitespace())
                .map_or(line, |pos| &line[..pos]);
            let base_name = sample_name
                .strip_suffix("_total")
                .or_else(|| sample_name.strip_suffix("_sum"))
                .or_else(|| sample_name.strip_suffix("_count"))
                .or_else(|| sample_name.strip_suffix("_bucket"))
                .unwrap_or(sample_name);
            keep_block = names.iter().any(|name| name == base_name);
        }
        if keep_block || line == "# EOF" {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn label_names_of(key: &LabelVec) -> Vec<String> {
    let mut names: Vec<String> = key.iter().map(|(k, _)| k.clone()).collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn counter_auto_creation_and_increment() {
        let registry = Registry::new("test", Duration::from_secs(60)).unwrap();
        let ls = labels(&[("environment", "prod"), ("status", "200")]);
        registry
            .inc_counter("lines_parsed", "lines parsed", &ls, 1.0)
            .unwrap();
        registry
            .inc_counter("lines_parsed", "lines parsed", &ls, 2.0)
            .unwrap();

        let snapshot = registry.snapshot(Format::OpenMetrics, &[]);
        assert!(snapshot.contains("test:lines_parsed_total"));
        assert!(snapshot.contains(r#"environment="prod""#));
        assert!(snapshot.contains(r#"status="200""#));
        assert!(snapshot.trim_end().ends_with("# EOF"));
    }

    #[test]
    fn label_set_mismatch_is_reported() {
        let registry = Registry::new("test", Duration::from_secs(60)).unwrap();
        let first = labels(&[("environment", "prod"), ("status", "200")]);
        registry
            .inc_counter("lines_parsed", "lines parsed", &first, 1.0)
            .unwrap();

        let second = labels(&[("environment", "prod"), ("method", "GET")]);
        let err = registry
            .inc_counter("lines_parsed", "lines parsed", &second, 1.0)
            .unwrap_err();
        assert_matches!(err, RegistryError::LabelSetMismatch { .. });
    }

    #[test]
    fn missing_environment_label_is_rejected() {
        let registry = Registry::new("test", Duration::from_secs(60)).unwrap();
        let ls = labels(&[("status", "200")]);
        let err = registry
            .inc_counter("lines_parsed", "lines parsed", &ls, 1.0)
            .unwrap_err();
        assert_matches!(err, RegistryError::MissingEnvironment(_));
    }

    #[test]
    fn two_environments_have_independent_series() {
        let registry = Registry::new("test", Duration::from_secs(60)).unwrap();
        registry
            .inc_counter("x", "x", &labels(&[("environment", "prod")]), 1.0)
            .unwrap();
        registry
            .inc_counter("x", "x", &labels(&[("environment", "stage")]), 5.0)
            .unwrap();

        assert_eq!(registry.environments.read().unwrap().len(), 2);
    }

    #[test]
    fn gc_evicts_stale_series_only() {
        let registry = Registry::new("test", Duration::from_millis(1)).unwrap();
        registry
            .inc_counter("x", "x", &labels(&[("environment", "prod")]), 1.0)
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let report = registry.gc();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.remaining, 0);

        let snapshot = registry.snapshot(Format::OpenMetrics, &[]);
        assert!(!snapshot.contains("test:x"));
    }

    #[test]
    fn histogram_buckets_and_observations() {
        let registry = Registry::new("test", Duration::from_secs(60)).unwrap();
        let buckets = Buckets::new(vec![0.1, 1.0]).unwrap();
        let ls = labels(&[("environment", "prod")]);
        for value in [0.05, 0.5, 2.0] {
            registry
                .observe("duration", "duration", &ls, value, &buckets)
                .unwrap();
        }
        let snapshot = registry.snapshot(Format::OpenMetrics, &[]);
        assert!(snapshot.contains(r#"test:duration_bucket{environment="prod",le="0.1"} 1"#));
        assert!(snapshot.contains(r#"test:duration_bucket{environment="prod",le="1"} 2"#));
        assert!(snapshot.contains(r#"test:duration_bucket{environment="prod",le="+Inf"} 3"#));
    }

    #[test]
    fn name_filtering_restricts_snapshot() {
        let registry = Registry::new("test", Duration::from_secs(60)).unwrap();
        registry
            .inc_counter("a", "a", &labels(&[("environment", "prod")]), 1.0)
            .unwrap();
        registry
            .inc_counter("b", "b", &labels(&[("environment", "prod")]), 1.0)
            .unwrap();

        let snapshot = registry.snapshot(Format::OpenMetrics, &["test:a".to_owned()]);
        assert!(snapshot.contains("test:a"));
        assert!(!snapshot.contains("test:b"));
    }
}
