//! Loads and validates the YAML configuration document: the column schema, histogram bucket
//! sets, and the declared local/SSH targets.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use logscrape_metrics::{validation, Buckets, BucketsError};
use serde::Deserialize;
use thiserror::Error;

use crate::parser::Reader;

/// Error returned while loading or validating a configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    /// The document was not valid YAML, or did not match the expected shape.
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// `global.prefix` is not a valid metric-name prefix.
    #[error("invalid metric prefix: {0}")]
    InvalidPrefix(#[source] validation::ValidationError),
    /// `global.ttl` was zero or negative.
    #[error("`global.ttl` must be greater than zero")]
    InvalidTtl,
    /// The same histogram bucket-set name was declared twice.
    #[error("duplicate histogram bucket-set name `{0}`")]
    DuplicateHistogram(String),
    /// A histogram bucket-set's values were invalid (non-finite, non-increasing, or empty).
    #[error("invalid bucket list for `{0}`: {1}")]
    InvalidBuckets(String, #[source] BucketsError),
    /// A `global.format` entry declared zero or more than one column name.
    #[error("format entry #{0} must declare exactly one column name")]
    MalformedColumnEntry(usize),
    /// A `global.format` entry declared a reader kind that is not in the catalog.
    #[error("column `{0}` has an unknown reader kind `{1}`")]
    UnknownColumnKind(String, String),
    /// A column name was declared more than once in `global.format`.
    #[error("column name `{0}` is declared more than once")]
    DuplicateColumnName(String),
    /// A label or metric column used a reserved or malformed name.
    #[error("column `{0}`: {1}")]
    InvalidColumn(String, #[source] validation::ValidationError),
    /// A `number+<bucket-set>` column referenced a bucket set that was never declared.
    #[error("column `{0}` references undefined histogram bucket set `{1}`")]
    UndefinedHistogram(String, String),
    /// An `ssh.environments.*` entry has no `file`, and `ssh.file` was not set either.
    #[error("ssh environment `{0}` has no `file` (no default set either)")]
    MissingSshFile(String),
    /// An `ssh.environments.*` entry has no `user`, and `ssh.user` was not set either.
    #[error("ssh environment `{0}` has no `user` (no default set either)")]
    MissingSshUser(String),
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    global: RawGlobal,
    script: Option<String>,
    #[serde(default)]
    local: Vec<RawLocalTarget>,
    ssh: Option<RawSshConfig>,
}

#[derive(Debug, Deserialize)]
struct RawGlobal {
    prefix: String,
    ttl: f64,
    #[serde(rename = "reload-interval")]
    reload_interval: Option<f64>,
    #[serde(default)]
    histograms: HashMap<String, Option<Vec<f64>>>,
    format: Vec<Option<RawColumn>>,
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct RawColumn(HashMap<String, Option<String>>);

#[derive(Debug, Deserialize)]
struct RawLocalTarget {
    path: String,
    environment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSshConfig {
    file: Option<String>,
    user: Option<String>,
    password: Option<String>,
    pkey: Option<String>,
    #[serde(rename = "connect-timeout")]
    connect_timeout: Option<f64>,
    environments: HashMap<String, RawSshEnvironment>,
}

#[derive(Debug, Deserialize)]
struct RawSshEnvironment {
    hosts: RawHosts,
    file: Option<String>,
    user: Option<String>,
    password: Option<String>,
    pkey: Option<String>,
    #[serde(rename = "connect-timeout")]
    connect_timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawHosts {
    One(String),
    Many(Vec<String>),
}

impl RawHosts {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(host) => vec![host],
            Self::Many(hosts) => hosts,
        }
    }
}

/// One configured local log target.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    pub path: String,
    pub environment: Option<String>,
}

/// One configured SSH log target, with all per-environment defaults already resolved.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub file: String,
    pub environment: String,
    pub user: String,
    pub password: Option<String>,
    pub pkey: Option<String>,
    pub connect_timeout: Option<Duration>,
}

/// A fully validated, ready-to-use configuration document.
#[derive(Debug, Clone)]
pub struct Config {
    pub prefix: String,
    pub ttl: Duration,
    pub reload_interval: Option<Duration>,
    pub readers: Arc<Vec<Option<Reader>>>,
    pub histograms: Arc<HashMap<String, Buckets>>,
    pub local_targets: Vec<LocalTarget>,
    pub ssh_targets: Vec<SshTarget>,
    pub script: Option<String>,
}

impl Config {
    /// Parses and validates a configuration document from its YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(yaml)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        validation::validate_prefix(&raw.global.prefix).map_err(ConfigError::InvalidPrefix)?;
        if raw.global.ttl <= 0.0 {
            return Err(ConfigError::InvalidTtl);
        }
        let ttl = Duration::from_secs_f64(raw.global.ttl);
        let reload_interval = raw.global.reload_interval.map(Duration::from_secs_f64);

        let histogram_types = Self::build_histogram_types(raw.global.histograms)?;
        let (readers, histograms) =
            Self::build_readers(raw.global.format, &histogram_types)?;

        let local_targets = raw
            .local
            .into_iter()
            .map(|entry| LocalTarget {
                path: entry.path,
                environment: entry.environment,
            })
            .collect();

        let ssh_targets = match raw.ssh {
            Some(ssh) => Self::build_ssh_targets(ssh)?,
            None => Vec::new(),
        };

        Ok(Self {
            prefix: raw.global.prefix,
            ttl,
            reload_interval,
            readers: Arc::new(readers),
            histograms: Arc::new(histograms),
            local_targets,
            ssh_targets,
            script: raw.script,
        })
    }

    fn build_histogram_types(
        raw: HashMap<String, Option<Vec<f64>>>,
    ) -> Result<HashMap<String, Buckets>, ConfigError> {
        let mut histogram_types = HashMap::with_capacity(raw.len());
        for (name, values) in raw {
            if histogram_types.contains_key(&name) {
                return Err(ConfigError::DuplicateHistogram(name));
            }
            let buckets = match values {
                None => Buckets::default_buckets(),
                Some(values) if values.is_empty() => Buckets::default_buckets(),
                Some(values) => Buckets::new(values)
                    .map_err(|err| ConfigError::InvalidBuckets(name.clone(), err))?,
            };
            histogram_types.insert(name, buckets);
        }
        Ok(histogram_types)
    }

    fn build_readers(
        format: Vec<Option<RawColumn>>,
        histogram_types: &HashMap<String, Buckets>,
    ) -> Result<(Vec<Option<Reader>>, HashMap<String, Buckets>), ConfigError> {
        let mut readers = Vec::with_capacity(format.len());
        let mut histograms = HashMap::new();
        let mut seen_names = HashSet::new();

        for (index, entry) in format.into_iter().enumerate() {
            let Some(column) = entry else {
                readers.push(None);
                continue;
            };
            let mut fields = column.0.into_iter();
            let Some((name, kind)) = fields.next() else {
                return Err(ConfigError::MalformedColumnEntry(index));
            };
            if fields.next().is_some() {
                return Err(ConfigError::MalformedColumnEntry(index));
            }
            let Some(kind) = kind else {
                readers.push(None);
                continue;
            };

            if !seen_names.insert(name.clone()) {
                return Err(ConfigError::DuplicateColumnName(name));
            }

            let (base_kind, histogram_name) = match kind.split_once('+') {
                Some((base, hist)) => (base.trim().to_owned(), Some(hist.trim().to_owned())),
                None => (kind, None),
            };

            let reader = match base_kind.as_str() {
                "label" => {
                    validation::validate_label_name(&name)
                        .map_err(|err| ConfigError::InvalidColumn(name.clone(), err))?;
                    Reader::Label(name.clone())
                }
                "number" => {
                    validation::validate_metric_name(&name)
                        .map_err(|err| ConfigError::InvalidColumn(name.clone(), err))?;
                    Reader::Number(name.clone())
                }
                "clf_number" => {
                    validation::validate_metric_name(&name)
                        .map_err(|err| ConfigError::InvalidColumn(name.clone(), err))?;
                    Reader::ClfNumber(name.clone())
                }
                "request_header" => Reader::RequestHeader,
                other => {
                    return Err(ConfigError::UnknownColumnKind(name, other.to_owned()));
                }
            };

            if let Some(histogram_name) = histogram_name {
                let buckets = histogram_types.get(&histogram_name).ok_or_else(|| {
                    ConfigError::UndefinedHistogram(name.clone(), histogram_name.clone())
                })?;
                histograms.insert(name.clone(), buckets.clone());
            }

            readers.push(Some(reader));
        }

        Ok((readers, histograms))
    }

    fn build_ssh_targets(ssh: RawSshConfig) -> Result<Vec<SshTarget>, ConfigError> {
        let mut targets = Vec::new();
        for (env_name, env) in ssh.environments {
            let file = env.file.clone().or_else(|| ssh.file.clone());
            let user = env.user.clone().or_else(|| ssh.user.clone());
            let password = env.password.clone().or_else(|| ssh.password.clone());
            let pkey = env.pkey.clone().or_else(|| ssh.pkey.clone());
            let connect_timeout = env.connect_timeout.or(ssh.connect_timeout);

            let Some(file) = file else {
                return Err(ConfigError::MissingSshFile(env_name));
            };
            let Some(user) = user else {
                return Err(ConfigError::MissingSshUser(env_name));
            };

            for host in env.hosts.into_vec() {
                targets.push(SshTarget {
                    host,
                    file: file.clone(),
                    environment: env_name.clone(),
                    user: user.clone(),
                    password: password.clone(),
                    pkey: pkey.clone(),
                    connect_timeout: connect_timeout.map(Duration::from_secs_f64),
                });
            }
        }
        Ok(targets)
    }
}

/// Loads the configuration from the path named by `SCRAPECONFIG` (default `scrapeconfig.yml`).
pub async fn load_from_env() -> Result<Config, ConfigError> {
    let path =
        std::env::var("SCRAPECONFIG").unwrap_or_else(|_| "scrapeconfig.yml".to_owned());
    let contents = tokio::fs::read_to_string(&path).await?;
    Config::from_yaml(&contents)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const MINIMAL: &str = r#"
global:
  prefix: test
  ttl: 60
  format:
    - remote_addr: label
    - status: label
    - bytes: clf_number
    - request: request_header
local:
  - path: /var/log/app.log
    environment: prod
"#;

    #[test]
    fn loading_a_minimal_config() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.prefix, "test");
        assert_eq!(config.ttl, Duration::from_secs(60));
        assert_eq!(config.readers.len(), 4);
        assert_eq!(config.local_targets.len(), 1);
        assert_eq!(config.local_targets[0].path, "/var/log/app.log");
    }

    #[test]
    fn rejecting_reserved_environment_label() {
        let yaml = r#"
global:
  prefix: test
  ttl: 60
  format:
    - environment: label
"#;
        assert_matches!(Config::from_yaml(yaml), Err(ConfigError::InvalidColumn(_, _)));
    }

    #[test]
    fn rejecting_undefined_histogram_reference() {
        let yaml = r#"
global:
  prefix: test
  ttl: 60
  format:
    - duration: number+missing
"#;
        assert_matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::UndefinedHistogram(_, _))
        );
    }

    #[test]
    fn histogram_with_explicit_buckets() {
        let yaml = r#"
global:
  prefix: test
  ttl: 60
  histograms:
    default: [0.1, 1]
  format:
    - duration: number+default
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let buckets = &config.histograms["duration"];
        assert_eq!(buckets.as_slice(), [0.1, 1.0]);
    }

    #[test]
    fn ssh_targets_resolve_defaults() {
        let yaml = r#"
global:
  prefix: test
  ttl: 60
  format: []
ssh:
  file: /var/log/app.log
  user: deploy
  environments:
    prod:
      hosts: [host-a, host-b]
    stage:
      hosts: host-c
      user: other
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.ssh_targets.len(), 3);
        assert!(config
            .ssh_targets
            .iter()
            .any(|t| t.host == "host-a" && t.user == "deploy"));
        assert!(config
            .ssh_targets
            .iter()
            .any(|t| t.host == "host-c" && t.user == "other"));
    }

    #[test]
    fn invalid_ttl_is_rejected() {
        let yaml = r#"
global:
  prefix: test
  ttl: 0
  format: []
"#;
        assert_matches!(Config::from_yaml(yaml), Err(ConfigError::InvalidTtl));
    }
}
