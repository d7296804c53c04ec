//! Configuration loading using Figment.
//!
//! Configuration is layered from:
//! 1. built-in defaults ([`ContendConfig::default`])
//! 2. a TOML file (`config/contend.toml` unless another path is given)
//! 3. environment variables prefixed with `CONTEND_`, `__` separating levels
//!    (e.g. `CONTEND_BENCHMARK__DURATION_MS=2000`)
//!
//! # Example
//! ```no_run
//! use contend_core::config::ContendConfig;
//!
//! let config = ContendConfig::load()?;
//! let backend = config.backend(&config.benchmark.backend)?;
//! println!("benchmarking against {}", backend.label);
//! # Ok::<(), contend_core::ContendError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ContendError, Result};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/contend.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContendConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Backend catalog, looked up by label.
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendConfig>,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Peer benchmark settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Length of one run.
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Label of the backend in [`ContendConfig::backends`].
    #[serde(default = "default_backend_label")]
    pub backend: String,
    /// Number of peers the CLI starts.
    #[serde(default = "default_peers")]
    pub peers: usize,
    /// Wipe persisted state before the first peer opens.
    #[serde(default)]
    pub clear: bool,
}

/// Connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of connections (jobs).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Funnel every job through one global mutex.
    #[serde(default)]
    pub use_mutex: bool,
    /// Open connections one at a time instead of concurrently.
    #[serde(default)]
    pub serialize_open: bool,
    /// Queries issued by the pool benchmark.
    #[serde(default = "default_queries")]
    pub queries: usize,
}

/// Storage backend variants.
///
/// A closed set: configuration picks one of these, nothing is looked up
/// dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Rollback journal, `journal_mode=DELETE`.
    Rollback,
    /// Write-ahead log, `journal_mode=WAL`.
    Wal,
    /// Rollback journal truncated instead of deleted.
    Truncate,
}

impl BackendKind {
    pub fn journal_mode(&self) -> &'static str {
        match self {
            BackendKind::Rollback => "DELETE",
            BackendKind::Wal => "WAL",
            BackendKind::Truncate => "TRUNCATE",
        }
    }
}

/// One backend entry of the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub label: String,
    pub kind: BackendKind,
    /// Database file, relative to the working directory.
    pub db_name: PathBuf,
    /// Extra `name=value` pragmas, applied after open. Opaque to the core.
    #[serde(default)]
    pub args: Vec<String>,
    /// Run queries on the blocking thread pool rather than inline.
    #[serde(default = "default_true")]
    pub is_async: bool,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl BackendConfig {
    pub fn new(label: impl Into<String>, kind: BackendKind, db_name: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            kind,
            db_name: db_name.into(),
            args: Vec::new(),
            is_async: true,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_name() -> String {
    "contend".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_duration_ms() -> u64 {
    10_000
}

fn default_backend_label() -> String {
    "wal".to_string()
}

fn default_peers() -> usize {
    2
}

fn default_concurrency() -> usize {
    4
}

fn default_queries() -> usize {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// The built-in backend catalog.
pub fn default_backends() -> Vec<BackendConfig> {
    vec![
        BackendConfig::new("rollback", BackendKind::Rollback, "demo-rollback.sqlite"),
        BackendConfig::new("wal", BackendKind::Wal, "demo-wal.sqlite"),
        BackendConfig::new("truncate", BackendKind::Truncate, "demo-truncate.sqlite"),
    ]
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_duration_ms(),
            backend: default_backend_label(),
            peers: default_peers(),
            clear: false,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            use_mutex: false,
            serialize_open: false,
            queries: default_queries(),
        }
    }
}

impl Default for ContendConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            benchmark: BenchmarkConfig::default(),
            pool: PoolConfig::default(),
            backends: default_backends(),
        }
    }
}

impl BenchmarkConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl ContendConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file (missing files are skipped) and the
    /// environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: ContendConfig = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider stack, exposed for tests and embedding.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ContendConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("CONTEND_").split("__"))
    }

    /// Semantic checks that parsing cannot express.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ContendError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ContendError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.pool.concurrency == 0 {
            return Err(ContendError::Configuration(
                "pool.concurrency must be at least 1".into(),
            ));
        }

        if self.benchmark.peers == 0 {
            return Err(ContendError::Configuration(
                "benchmark.peers must be at least 1".into(),
            ));
        }

        for (i, backend) in self.backends.iter().enumerate() {
            if self.backends[..i].iter().any(|b| b.label == backend.label) {
                return Err(ContendError::Configuration(format!(
                    "Duplicate backend label '{}'",
                    backend.label
                )));
            }
            for arg in &backend.args {
                if !arg.contains('=') {
                    return Err(ContendError::Configuration(format!(
                        "Backend '{}' argument '{}' is not of the form name=value",
                        backend.label, arg
                    )));
                }
            }
        }

        self.backend(&self.benchmark.backend)?;
        Ok(())
    }

    /// Look up a backend by label.
    pub fn backend(&self, label: &str) -> Result<&BackendConfig> {
        self.backends
            .iter()
            .find(|b| b.label == label)
            .ok_or_else(|| {
                let known: Vec<&str> = self.backends.iter().map(|b| b.label.as_str()).collect();
                ContendError::Configuration(format!(
                    "Bad backend: {} (known: {})",
                    label,
                    known.join(", ")
                ))
            })
    }
}
