//! Bridge configuration, loaded from TOML.
//!
//! ```toml
//! [workers.device]
//! command = "/opt/workers/device-worker"
//! args = ["--stdio"]
//! pool_size = 1
//!
//! [cache.ttl_secs]
//! device = 120
//!
//! [domains.device]
//! list_action = "list"
//! id_field = "id"
//! items_field = "devices"
//! ```

use crate::worker::{UnknownWorkerType, WorkerType};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Generic entity TTL
pub const DEFAULT_TTL_SECS: u64 = 300;
/// TTL for volatile per-device state
pub const VOLATILE_TTL_SECS: u64 = 120;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    UnknownWorker(#[from] UnknownWorkerType),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Worker launch commands, keyed by worker type name
    pub workers: BTreeMap<String, WorkerCommand>,
    pub timeouts: TimeoutConfig,
    pub health: HealthConfig,
    pub cache: CacheConfig,
    /// Listing contract per domain, keyed by worker type name
    pub domains: BTreeMap<String, DomainConfig>,
    pub logging: LoggingConfig,
}

/// How to launch one worker type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Maximum calls in flight on the process; 1 serializes dispatch
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    1
}

impl WorkerCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            pool_size: default_pool_size(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default per-call timeout
    pub call_ms: u64,
    /// Timeout for a single liveness probe
    pub health_probe_ms: u64,
    /// How long a stopping worker gets before it is killed
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_ms: 30_000,
            health_probe_ms: 5_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn call(&self) -> Duration {
        Duration::from_millis(self.call_ms)
    }

    pub fn health_probe(&self) -> Duration {
        Duration::from_millis(self.health_probe_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Consecutive failed probes before a restart
    pub failure_threshold: u32,
    /// Consecutive call timeouts before a restart
    pub timeout_threshold: u32,
    /// Consecutive failed spawns before a worker type is given up on
    pub max_restarts: u32,
    /// Resends of a request that never reached the worker
    pub transport_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            failure_threshold: 2,
            timeout_threshold: 3,
            max_restarts: 5,
            transport_retries: 2,
            backoff_base_ms: 100,
            backoff_max_ms: 2_000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    /// Per-domain TTL overrides, keyed by worker type name
    pub ttl_secs: BTreeMap<String, u64>,
    /// Periodic sweep of expired entries; 0 disables it
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut ttl_secs = BTreeMap::new();
        ttl_secs.insert(WorkerType::Device.as_str().to_string(), VOLATILE_TTL_SECS);
        Self {
            default_ttl_secs: DEFAULT_TTL_SECS,
            ttl_secs,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, domain: WorkerType) -> Duration {
        let secs = self
            .ttl_secs
            .get(domain.as_str())
            .copied()
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// How a domain lists its entities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Action returning every entity of the domain
    pub list_action: String,
    /// Field of each listed entity holding its id
    pub id_field: String,
    /// Field of the response data holding the entity array. When unset the
    /// data must be an array, or an object with exactly one array field.
    pub items_field: Option<String>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            list_action: "list".to_string(),
            id_field: "id".to_string(),
            items_field: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl BridgeConfig {
    /// Load from the resolved config path, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        Self::load_from(&crate::env::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading bridge config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;

        tracing::trace!(workers = config.workers.len(), "Bridge config loaded");
        Ok(config)
    }

    pub fn with_worker(mut self, worker_type: WorkerType, command: WorkerCommand) -> Self {
        self.workers.insert(worker_type.as_str().to_string(), command);
        self
    }

    pub fn with_domain(mut self, worker_type: WorkerType, domain: DomainConfig) -> Self {
        self.domains.insert(worker_type.as_str().to_string(), domain);
        self
    }

    /// Worker commands with their keys resolved to worker types
    pub fn worker_commands(&self) -> Result<Vec<(WorkerType, WorkerCommand)>, ConfigError> {
        self.workers
            .iter()
            .map(|(name, cmd)| Ok((name.parse::<WorkerType>()?, cmd.clone())))
            .collect()
    }

    /// Listing contract for a domain, defaults when not configured
    pub fn domain(&self, worker_type: WorkerType) -> DomainConfig {
        self.domains
            .get(worker_type.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (worker_type, cmd) in self.worker_commands()? {
            if cmd.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "workers.{}.command is empty",
                    worker_type
                )));
            }
            if cmd.pool_size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "workers.{}.pool_size must be at least 1",
                    worker_type
                )));
            }
        }
        for name in self.domains.keys().chain(self.cache.ttl_secs.keys()) {
            name.parse::<WorkerType>()?;
        }
        if self.cache.default_ttl_secs == 0 || self.cache.ttl_secs.values().any(|t| *t == 0) {
            return Err(ConfigError::Invalid("cache TTLs must be positive".into()));
        }
        if self.health.failure_threshold == 0 || self.health.timeout_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health thresholds must be at least 1".into(),
            ));
        }
        if self.health.max_restarts == 0 {
            return Err(ConfigError::Invalid(
                "health.max_restarts must be at least 1".into(),
            ));
        }
        if self.health.enabled && self.health.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "health.interval_ms must be positive when health checks are enabled".into(),
            ));
        }
        if self.health.backoff_max_ms < self.health.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "health.backoff_max_ms must not be below health.backoff_base_ms".into(),
            ));
        }
        if self.timeouts.call_ms == 0 || self.timeouts.health_probe_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_ttls() {
        let config = BridgeConfig::default();
        assert_eq!(config.cache.ttl_for(WorkerType::Device), Duration::from_secs(120));
        assert_eq!(config.cache.ttl_for(WorkerType::Model), Duration::from_secs(300));
        assert_eq!(config.health.failure_threshold, 2);
        assert_eq!(config.health.timeout_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[workers.device]
command = "/opt/device-worker"
args = ["--stdio"]
env = {{ RUST_LOG = "debug" }}

[workers.memory]
command = "/opt/memory-worker"
pool_size = 4

[timeouts]
call_ms = 1500

[cache]
default_ttl_secs = 60

[cache.ttl_secs]
device = 10

[domains.device]
items_field = "devices"
"#
        )
        .unwrap();

        let config = BridgeConfig::load_from(file.path()).unwrap();
        let workers = config.worker_commands().unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].0, WorkerType::Device);
        assert_eq!(workers[0].1.args, vec!["--stdio"]);
        assert_eq!(workers[0].1.env.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert_eq!(workers[0].1.pool_size, 1);
        assert_eq!(workers[1].1.pool_size, 4);
        assert_eq!(config.timeouts.call(), Duration::from_millis(1500));
        assert_eq!(config.cache.ttl_for(WorkerType::Device), Duration::from_secs(10));
        assert_eq!(config.cache.ttl_for(WorkerType::Memory), Duration::from_secs(60));
        assert_eq!(
            config.domain(WorkerType::Device).items_field.as_deref(),
            Some("devices")
        );
        assert_eq!(config.domain(WorkerType::Model), DomainConfig::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert!(config.workers.is_empty());
    }

    #[test]
    fn rejects_unknown_worker_names() {
        let mut config =
            BridgeConfig::default().with_worker(WorkerType::Device, WorkerCommand::new("x"));
        config
            .workers
            .insert("tensor".into(), WorkerCommand::new("/bin/tensor"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownWorker(_))
        ));
    }

    #[test]
    fn rejects_zero_pool_size() {
        let config = BridgeConfig::default()
            .with_worker(WorkerType::Memory, WorkerCommand::new("/bin/mem").pool_size(0));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_health_interval_only_when_enabled() {
        let mut config = BridgeConfig::default();
        config.health.interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.health.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_backoff_cap_below_base() {
        let mut config = BridgeConfig::default();
        config.health.backoff_base_ms = 500;
        config.health.backoff_max_ms = 100;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_ttl() {
        let mut config = BridgeConfig::default();
        config.cache.ttl_secs.insert("model".into(), 0);
        assert!(config.validate().is_err());
    }
}
