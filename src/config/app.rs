//! Application configuration structures.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::Schedule;
use crate::strategy::StrategySettings;

use super::host::{HostConfig, HostsConfig};
use super::validation::{ConfigError, validate_cron};

// =============================================================================
// Constants
// =============================================================================

/// Default polling interval (2 minutes).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(120);

/// Default job timeout for one host cycle (5 minutes).
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 4;

/// Default number of cycles between detection retries for unmatched hosts.
pub const DEFAULT_DETECTION_CYCLE: u64 = 10;

/// Default connector directory.
pub const DEFAULT_CONNECTOR_PATH: &str = "connectors";

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_job_timeout() -> Duration {
    DEFAULT_JOB_TIMEOUT
}

fn default_discovery_cycle() -> u64 {
    1
}

fn default_detection_cycle() -> u64 {
    DEFAULT_DETECTION_CYCLE
}

fn default_connector_path() -> String {
    DEFAULT_CONNECTOR_PATH.to_string()
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Worker pool and polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of host cycles running at once (default: 4).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Process hosts one at a time.
    #[serde(default)]
    pub sequential: bool,

    /// Polling interval (default: 2m). Ignored when `cron` is set.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// 6-field cron expression, replaces `interval`.
    #[serde(default)]
    pub cron: Option<String>,

    /// Timeout of one host cycle (default: 5m).
    #[serde(default = "default_job_timeout", with = "humantime_serde")]
    pub job_timeout: Duration,

    /// Run discovery every N cycles (default: 1).
    #[serde(default = "default_discovery_cycle")]
    pub discovery_cycle: u64,

    /// Retry detection every N cycles for hosts without a connector (default: 10).
    #[serde(default = "default_detection_cycle")]
    pub detection_cycle: u64,

    /// Evict monitors missed by this many consecutive discoveries.
    #[serde(default)]
    pub stale_eviction_cycles: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            sequential: false,
            interval: DEFAULT_INTERVAL,
            cron: None,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            discovery_cycle: 1,
            detection_cycle: DEFAULT_DETECTION_CYCLE,
            stale_eviction_cycles: None,
        }
    }
}

impl EngineConfig {
    /// Effective worker pool size.
    pub fn worker_count(&self) -> usize {
        if self.sequential { 1 } else { self.workers }
    }

    /// Polling schedule for host jobs.
    pub fn schedule(&self) -> Schedule {
        match &self.cron {
            Some(expr) => Schedule::Cron(expr.clone()),
            None => Schedule::Interval(self.interval),
        }
    }

    pub fn strategy_settings(&self) -> StrategySettings {
        StrategySettings {
            discovery_cycle: self.discovery_cycle,
            detection_cycle: self.detection_cycle,
            stale_eviction_cycles: self.stale_eviction_cycles,
            job_timeout: self.job_timeout,
        }
    }

    /// Validate engine values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid(
                "engine workers must be positive".to_string(),
            ));
        }
        if self.job_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "engine job_timeout must be non-zero".to_string(),
            ));
        }
        if self.discovery_cycle == 0 || self.detection_cycle == 0 {
            return Err(ConfigError::Invalid(
                "engine discovery_cycle and detection_cycle must be positive".to_string(),
            ));
        }
        if self.stale_eviction_cycles == Some(0) {
            return Err(ConfigError::Invalid(
                "engine stale_eviction_cycles must be positive".to_string(),
            ));
        }
        match &self.cron {
            Some(expr) => validate_cron(expr)
                .map_err(|e| ConfigError::Invalid(format!("engine cron: {}", e)))?,
            None => self
                .schedule()
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("engine interval: {}", e)))?,
        }
        Ok(())
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Directory of connector definitions (default: "connectors").
    #[serde(default = "default_connector_path")]
    pub connector_path: String,

    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    /// Path to a directory with additional host config files.
    #[serde(default)]
    pub host_include: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            connector_path: default_connector_path(),
            hosts: Vec::new(),
            host_include: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;

        if self.connector_path.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "connector_path must not be empty".to_string(),
            ));
        }

        HostsConfig {
            hosts: self.hosts.clone(),
        }
        .validate()
    }

    /// Load configuration including the host_include directory.
    ///
    /// If `host_include` is specified, scans the directory for YAML files
    /// and appends their hosts.
    pub fn load_with_host_include(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;

        if let Some(ref include_dir) = config.host_include {
            let additional = HostsConfig::load_from_dir(include_dir)?;
            config.hosts.extend(additional.hosts);
        }

        config.validate()?;
        Ok(config)
    }
}
