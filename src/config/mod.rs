//! Configuration module for the argos engine.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Engine settings (worker pool, polling schedule, job timeout)
//! - Monitored hosts and their protocol credentials
//! - Connector directory and host include directory

mod app;
mod host;
mod validation;

pub use app::{AppConfig, EngineConfig};
pub use host::{HostConfig, HostsConfig, ProtocolConfig, Secret};
pub use validation::{ConfigError, expand_env_vars, parse_duration, validate_cron};

// Re-export constants
pub use app::{
    DEFAULT_CONNECTOR_PATH, DEFAULT_DETECTION_CYCLE, DEFAULT_INTERVAL, DEFAULT_JOB_TIMEOUT,
    DEFAULT_WORKERS,
};
pub use host::DEFAULT_PROTOCOL_TIMEOUT;
