//! Protocol collaborators.
//!
//! The pipeline never speaks a wire protocol itself. Sources and criteria are
//! turned into a [`ProtocolRequest`] and handed to the [`ProtocolClient`]
//! registered for the request's [`ProtocolKind`]. [`ProtocolClients`] applies
//! the host's protocol timeout, bounded by the remaining cycle budget, and
//! cancels the call when it runs out.

mod command;
mod http;

pub use command::LocalCommandClient;
pub use http::HttpClient;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{DEFAULT_PROTOCOL_TIMEOUT, HostConfig, ProtocolConfig};
use crate::connector::{DeviceKind, HttpMethod, ResultContent};
use crate::table::{SourceTable, TABLE_SEP};

/// Protocol families a host can be configured for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProtocolKind {
    Snmp,
    Wbem,
    Wmi,
    Http,
    /// Remote OS commands.
    Ssh,
    Ipmi,
    /// Commands run on the engine's own machine.
    Local,
}

/// Errors returned by protocol clients.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol {0} is not configured for this host")]
    NotConfigured(ProtocolKind),

    #[error("no {0} client available")]
    Unsupported(ProtocolKind),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An HTTP request as declared by a source or criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Absolute URL or path relative to the host; may contain `%{...}` macros.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub authentication_token: Option<String>,
    pub result_content: ResultContent,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            authentication_token: None,
            result_content: ResultContent::Body,
        }
    }
}

/// A typed request for one protocol family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolRequest {
    SnmpGet {
        oid: String,
    },
    SnmpGetNext {
        oid: String,
    },
    SnmpTable {
        oid: String,
        columns: Vec<String>,
    },
    Wbem {
        namespace: Option<String>,
        query: String,
    },
    Wmi {
        namespace: Option<String>,
        query: String,
    },
    Http(HttpRequest),
    OsCommand {
        command_line: String,
        execute_locally: bool,
        timeout: Option<Duration>,
    },
    /// IPMI sensor and FRU inventory.
    Ipmi,
    /// Running processes as `pid;name;command line` rows.
    ProcessList,
}

impl ProtocolRequest {
    /// Protocol family serving this request on `host`.
    pub fn kind(&self, host: &HostConfig) -> ProtocolKind {
        match self {
            Self::SnmpGet { .. } | Self::SnmpGetNext { .. } | Self::SnmpTable { .. } => {
                ProtocolKind::Snmp
            }
            Self::Wbem { .. } => ProtocolKind::Wbem,
            Self::Wmi { .. } => ProtocolKind::Wmi,
            Self::Http(_) => ProtocolKind::Http,
            Self::Ipmi => ProtocolKind::Ipmi,
            Self::OsCommand {
                execute_locally, ..
            } => {
                if *execute_locally || host.is_localhost() {
                    ProtocolKind::Local
                } else {
                    ProtocolKind::Ssh
                }
            }
            Self::ProcessList => {
                if host.host_type == DeviceKind::Windows {
                    ProtocolKind::Wmi
                } else if host.is_localhost() {
                    ProtocolKind::Local
                } else {
                    ProtocolKind::Ssh
                }
            }
        }
    }

    /// Request-level timeout that replaces the protocol timeout.
    pub fn timeout_override(&self) -> Option<Duration> {
        match self {
            Self::OsCommand { timeout, .. } => *timeout,
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SnmpGet { oid } => write!(f, "snmpGet {}", oid),
            Self::SnmpGetNext { oid } => write!(f, "snmpGetNext {}", oid),
            Self::SnmpTable { oid, columns } => {
                write!(f, "snmpTable {} [{}]", oid, columns.join(","))
            }
            Self::Wbem { namespace, query } => {
                write!(f, "wbem {} {}", namespace.as_deref().unwrap_or("-"), query)
            }
            Self::Wmi { namespace, query } => {
                write!(f, "wmi {} {}", namespace.as_deref().unwrap_or("-"), query)
            }
            Self::Http(request) => write!(f, "http {} {}", request.method.as_str(), request.url),
            Self::OsCommand { command_line, .. } => write!(f, "osCommand {}", command_line),
            Self::Ipmi => f.write_str("ipmi"),
            Self::ProcessList => f.write_str("processList"),
        }
    }
}

/// A protocol result: free text or already tabular rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolResponse {
    Text(String),
    Rows(Vec<Vec<String>>),
}

impl ProtocolResponse {
    /// Text form, rows rendered as `;`-separated lines.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Rows(rows) => rows
                .iter()
                .map(|row| format!("{}{}", row.join(TABLE_SEP), TABLE_SEP))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Convert to a source table. Text keeps its raw form.
    pub fn into_table(self) -> SourceTable {
        match self {
            Self::Text(text) => SourceTable::from_raw(text).materialize(),
            Self::Rows(rows) => SourceTable::from_rows(rows),
        }
    }
}

/// One protocol family implementation.
#[async_trait::async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Execute `request` against `host`. `timeout` is the budget the caller
    /// will enforce; clients may use it for their own socket timeouts.
    async fn execute(
        &self,
        request: &ProtocolRequest,
        host: &HostConfig,
        timeout: Duration,
    ) -> Result<ProtocolResponse, ProtocolError>;
}

/// Registry of protocol clients keyed by protocol family.
#[derive(Clone, Default)]
pub struct ProtocolClients {
    clients: HashMap<ProtocolKind, Arc<dyn ProtocolClient>>,
}

impl fmt::Debug for ProtocolClients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.clients.keys().collect();
        kinds.sort();
        f.debug_struct("ProtocolClients")
            .field("kinds", &kinds)
            .finish()
    }
}

impl ProtocolClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in HTTP and local command clients.
    pub fn with_defaults() -> Result<Self, ProtocolError> {
        Ok(Self::new()
            .with_client(ProtocolKind::Http, Arc::new(HttpClient::new()?))
            .with_client(ProtocolKind::Local, Arc::new(LocalCommandClient::default())))
    }

    pub fn with_client(mut self, kind: ProtocolKind, client: Arc<dyn ProtocolClient>) -> Self {
        self.clients.insert(kind, client);
        self
    }

    pub fn contains(&self, kind: ProtocolKind) -> bool {
        self.clients.contains_key(&kind)
    }

    /// Dispatch a request.
    ///
    /// The host must configure the request's protocol, except for local
    /// commands. The call is cancelled when the protocol timeout, or the time
    /// left until `deadline`, elapses.
    pub async fn execute(
        &self,
        request: &ProtocolRequest,
        host: &HostConfig,
        deadline: Option<Instant>,
    ) -> Result<ProtocolResponse, ProtocolError> {
        let kind = request.kind(host);
        let protocol_timeout = match host.protocol(kind) {
            Some(config) => config.timeout,
            None if kind == ProtocolKind::Local => DEFAULT_PROTOCOL_TIMEOUT,
            None => return Err(ProtocolError::NotConfigured(kind)),
        };
        let client = self
            .clients
            .get(&kind)
            .ok_or(ProtocolError::Unsupported(kind))?;

        let mut budget = request.timeout_override().unwrap_or(protocol_timeout);
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProtocolError::Timeout(Duration::ZERO));
            }
            budget = budget.min(remaining);
        }

        tracing::trace!(host = %host.id, protocol = %kind, request = %request, "Dispatching request");
        match tokio::time::timeout(budget, client.execute(request, host, budget)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(budget)),
        }
    }
}

/// Replace `%{HOSTNAME}`, `%{USERNAME}`, `%{PASSWORD}` and
/// `%{AUTHENTICATIONTOKEN}` in request text.
pub fn replace_macros(
    text: &str,
    host: &HostConfig,
    config: Option<&ProtocolConfig>,
    authentication_token: Option<&str>,
) -> String {
    if !text.contains("%{") {
        return text.to_string();
    }
    let username = config.and_then(|c| c.username.as_deref()).unwrap_or("");
    let password = config
        .and_then(|c| c.password.as_ref())
        .map(|p| p.expose())
        .unwrap_or("");
    text.replace("%{HOSTNAME}", &host.hostname)
        .replace("%{USERNAME}", username)
        .replace("%{PASSWORD}", password)
        .replace("%{AUTHENTICATIONTOKEN}", authentication_token.unwrap_or(""))
}
