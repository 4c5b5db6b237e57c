//! Monitored host configuration.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::connector::DeviceKind;
use crate::protocol::ProtocolKind;

use super::validation::{ConfigError, expand_env_vars};

/// Default protocol request timeout (30 seconds).
pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_secs(30);

fn default_protocol_timeout() -> Duration {
    DEFAULT_PROTOCOL_TIMEOUT
}

// =============================================================================
// Secret
// =============================================================================

/// Secret material such as a password or SNMP community.
///
/// Environment variables are expanded on load. Neither `Debug` nor
/// `Serialize` reveal the value.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The clear-text value, for protocol clients only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self(expand_env_vars(&raw)))
    }
}

// =============================================================================
// Protocol Configuration
// =============================================================================

/// Connection and credential parameters for one protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<Secret>,

    /// Port override; clients fall back to the protocol's well-known port.
    #[serde(default)]
    pub port: Option<u16>,

    /// Request timeout (default: 30s).
    #[serde(default = "default_protocol_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default)]
    pub https: bool,

    /// WBEM/WMI namespace used when a query does not name one.
    #[serde(default)]
    pub namespace: Option<String>,

    /// SNMP community.
    #[serde(default)]
    pub community: Option<Secret>,

    /// Protocol version, e.g. SNMP `v2c`.
    #[serde(default)]
    pub version: Option<String>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            port: None,
            timeout: DEFAULT_PROTOCOL_TIMEOUT,
            https: false,
            namespace: None,
            community: None,
            version: None,
        }
    }
}

impl ProtocolConfig {
    pub fn with_credentials(mut self, username: impl Into<String>, password: Secret) -> Self {
        self.username = Some(username.into());
        self.password = Some(password);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }
}

// =============================================================================
// Host Configuration
// =============================================================================

/// A monitored host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Unique host id, part of every monitor id.
    pub id: String,

    /// Name or address used to reach the host.
    pub hostname: String,

    #[serde(default)]
    pub host_type: DeviceKind,

    #[serde(default)]
    pub protocols: BTreeMap<ProtocolKind, ProtocolConfig>,

    /// When set, these connectors are used without running detection criteria.
    #[serde(default)]
    pub selected_connectors: Vec<String>,

    #[serde(default)]
    pub excluded_connectors: Vec<String>,

    /// Per-host override of the engine job timeout.
    #[serde(default, with = "humantime_serde")]
    pub job_timeout: Option<Duration>,
}

impl HostConfig {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            host_type: DeviceKind::default(),
            protocols: BTreeMap::new(),
            selected_connectors: Vec::new(),
            excluded_connectors: Vec::new(),
            job_timeout: None,
        }
    }

    pub fn with_host_type(mut self, host_type: DeviceKind) -> Self {
        self.host_type = host_type;
        self
    }

    pub fn with_protocol(mut self, kind: ProtocolKind, config: ProtocolConfig) -> Self {
        self.protocols.insert(kind, config);
        self
    }

    pub fn with_selected_connectors(mut self, ids: Vec<String>) -> Self {
        self.selected_connectors = ids;
        self
    }

    pub fn with_excluded_connectors(mut self, ids: Vec<String>) -> Self {
        self.excluded_connectors = ids;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn protocol(&self, kind: ProtocolKind) -> Option<&ProtocolConfig> {
        self.protocols.get(&kind)
    }

    pub fn is_localhost(&self) -> bool {
        matches!(
            self.hostname.to_ascii_lowercase().as_str(),
            "localhost" | "127.0.0.1" | "::1"
        )
    }

    /// True when the connector id is excluded for this host (case-insensitive).
    pub fn excludes(&self, connector_id: &str) -> bool {
        self.excluded_connectors
            .iter()
            .any(|id| id.eq_ignore_ascii_case(connector_id))
    }

    /// Validate host values.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "host id must not be empty".to_string(),
            ));
        }
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "host '{}': hostname must not be empty",
                self.id
            )));
        }
        for (kind, protocol) in &self.protocols {
            if protocol.timeout.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "host '{}': {} timeout must be non-zero",
                    self.id, kind
                )));
            }
        }
        if self.job_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Invalid(format!(
                "host '{}': job_timeout must be non-zero",
                self.id
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Host Lists
// =============================================================================

/// A list of hosts, as found in the main config or an include file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostsConfig {
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

impl HostsConfig {
    /// Validate every host and the uniqueness of host ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for host in &self.hosts {
            host.validate()?;
            if !seen.insert(host.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate host id '{}'",
                    host.id
                )));
            }
        }
        Ok(())
    }

    /// Merge another host list into this one.
    pub fn merge(mut self, other: Self) -> Self {
        self.hosts.extend(other.hosts);
        self
    }

    /// Load and merge every `*.yaml` / `*.yml` file of a directory.
    ///
    /// Files are read in name order so the merged list is deterministic.
    pub fn load_from_dir(dir_path: &str) -> Result<Self, ConfigError> {
        let dir = Path::new(dir_path);
        if !dir.exists() {
            return Err(ConfigError::Invalid(format!(
                "host_include '{}' does not exist",
                dir_path
            )));
        }
        if !dir.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "host_include '{}' is not a directory",
                dir_path
            )));
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if path.is_file() && (ext == "yaml" || ext == "yml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut merged = Self::default();
        for path in paths {
            tracing::debug!("Loading host config from: {}", path.display());
            let content = std::fs::read_to_string(&path)?;
            let file_config: Self = serde_yaml::from_str(&content).map_err(|e| {
                ConfigError::Invalid(format!("failed to parse '{}': {}", path.display(), e))
            })?;
            merged = merged.merge(file_config);
        }

        Ok(merged)
    }
}
