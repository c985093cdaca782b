//! tally.toml configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! environment overrides (`PROMETHEUS_STORAGE`, `PROMETHEUS_PREFIX`, ...).
//! Command-line flags are applied last by the daemon.
//!
//! Overrides that cannot be applied as given are returned as
//! [`EnvWarning`]s; the daemon logs them once tracing is up.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::DEFAULT_BUCKETS;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub server: ServerConfig,
    pub service: ServiceConfig,
    pub metrics: MetricsConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Identity reported by `app_info` and the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "tally".to_string(),
            version: "1.0.0".to_string(),
            environment: "production".to_string(),
        }
    }
}

/// Which storage backend holds metric samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Process-local, lost on exit.
    #[default]
    Memory,
    /// Single-file embedded database under `metrics.data_dir`.
    #[serde(alias = "pdo", alias = "redb")]
    File,
    /// Redis, shared by every process pointing at the same server.
    Redis,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Memory => "memory",
            StorageKind::File => "file",
            StorageKind::Redis => "redis",
        }
    }
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "" => Ok(StorageKind::Memory),
            "file" | "pdo" | "redb" => Ok(StorageKind::File),
            "redis" => Ok(StorageKind::Redis),
            other => Err(format!("unknown storage backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub storage: StorageKind,
    /// Prepended to every metric name with no separator.
    pub prefix: String,
    /// Directory holding the embedded metrics database.
    pub data_dir: PathBuf,
    pub default_buckets: Vec<f64>,
    /// Help text per metric name (without prefix).
    pub help: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        let help = [
            ("http_requests_total", "Total number of HTTP requests"),
            ("http_request_duration_seconds", "HTTP request duration in seconds"),
            ("http_requests_in_progress", "Number of HTTP requests currently in progress"),
            ("app_info", "Application information"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            storage: StorageKind::Memory,
            prefix: String::new(),
            data_dir: PathBuf::from("storage/metrics"),
            default_buckets: DEFAULT_BUCKETS.to_vec(),
            help,
        }
    }
}

impl MetricsConfig {
    /// Help text for a metric, falling back to `"Metric <name>"`.
    pub fn help_for(&self, name: &str) -> String {
        self.help
            .get(name)
            .cloned()
            .unwrap_or_else(|| format!("Metric {name}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u32,
    /// Every key the backend writes starts with this prefix; reset deletes them all.
    pub key_prefix: String,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    /// Connections kept per process; each carries one round trip at a time.
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
            key_prefix: "tally:".to_string(),
            connect_timeout_ms: 500,
            io_timeout_ms: 500,
            pool_size: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: Option<String>,
}

/// Printed in place of secrets.
pub const REDACTED: &str = "********";

/// An environment override that was ignored or replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvWarning {
    pub var: &'static str,
    pub value: String,
    /// What was done instead.
    pub action: &'static str,
}

impl EnvWarning {
    fn new(var: &'static str, value: impl Into<String>, action: &'static str) -> Self {
        Self {
            var,
            value: value.into(),
            action,
        }
    }
}

impl fmt::Display for EnvWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}: {}", self.var, self.value, self.action)
    }
}

impl TallyConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TallyConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Copy that is safe to print: the Redis password is masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.redis.password.is_some() {
            config.redis.password = Some(REDACTED.to_string());
        }
        config
    }

    /// Apply overrides from the process environment.
    #[must_use]
    pub fn apply_env(&mut self) -> Vec<EnvWarning> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (tests pass a map).
    #[must_use]
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<EnvWarning> {
        let mut warnings = Vec::new();
        if let Some(storage) = lookup("PROMETHEUS_STORAGE") {
            self.metrics.storage = storage.parse().unwrap_or_else(|_: String| {
                warnings.push(EnvWarning::new(
                    "PROMETHEUS_STORAGE",
                    storage.as_str(),
                    "falling back to memory storage",
                ));
                StorageKind::Memory
            });
        }
        if let Some(prefix) = lookup("PROMETHEUS_PREFIX") {
            self.metrics.prefix = prefix;
        }
        if let Some(dir) = lookup("PROMETHEUS_DATA_DIR") {
            self.metrics.data_dir = PathBuf::from(dir);
        }
        if let Some(host) = lookup("REDIS_HOST") {
            self.redis.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT") {
            match port.parse() {
                Ok(port) => self.redis.port = port,
                Err(_) => warnings.push(EnvWarning::new("REDIS_PORT", port, "ignored, not a port")),
            }
        }
        if let Some(password) = lookup("REDIS_PASSWORD") {
            self.redis.password = (!password.is_empty()).then_some(password);
        }
        if let Some(db) = lookup("REDIS_DB") {
            match db.parse() {
                Ok(db) => self.redis.database = db,
                Err(_) => warnings.push(EnvWarning::new("REDIS_DB", db, "ignored, not a database index")),
            }
        }
        if let Some(env) = lookup("APP_ENV") {
            self.service.environment = env;
        }
        if let Some(name) = lookup("OTEL_SERVICE_NAME") {
            self.service.name = name;
        }
        if let Some(version) = lookup("OTEL_SERVICE_VERSION") {
            self.service.version = version;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            match format.to_ascii_lowercase().as_str() {
                "json" => self.logging.format = LogFormat::Json,
                "text" => self.logging.format = LogFormat::Text,
                _ => warnings.push(EnvWarning::new("LOG_FORMAT", format, "ignored, expected text or json")),
            }
        }
        warnings
    }
}
