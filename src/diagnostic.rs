//! Per-cycle diagnostics.
//!
//! Failures inside a host cycle are isolated: a failed source, compute or
//! mapping never aborts the cycle. Each one is recorded as a [`Diagnostic`]
//! in the cycle report instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// A recorded problem or notable outcome of a host cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Diagnostic timestamp (UTC).
    pub ts: DateTime<Utc>,
    pub host_id: String,
    pub connector_id: Option<String>,
    pub kind: DiagnosticKind,
    pub severity: Severity,
    /// Short human-readable description.
    pub message: String,
}

impl Diagnostic {
    pub fn new(
        host_id: impl Into<String>,
        kind: DiagnosticKind,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            host_id: host_id.into(),
            connector_id: None,
            kind,
            severity,
            message: message.into(),
        }
    }

    pub fn with_connector(mut self, connector_id: impl Into<String>) -> Self {
        self.connector_id = Some(connector_id.into());
        self
    }
}

/// What part of the cycle produced the diagnostic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DiagnosticKind {
    /// A connector's criteria did not match.
    Detection,
    /// No connector applies to the host.
    NoConnector,
    /// A source failed and produced an empty table.
    Source,
    /// A compute step was skipped.
    Compute,
    /// A row could not be mapped to a monitor or metric.
    Mapping,
    /// The cycle ran out of time.
    Timeout,
    /// Handing metrics to the exporter failed.
    Export,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_kind_from_str() {
        assert_eq!(DiagnosticKind::from_str("source").unwrap(), DiagnosticKind::Source);
        assert_eq!(
            DiagnosticKind::from_str("NOCONNECTOR").unwrap(),
            DiagnosticKind::NoConnector
        );
        assert!(DiagnosticKind::from_str("fatal").is_err());
    }

    #[test]
    fn test_severity_order_and_names() {
        assert!(Severity::Error > Severity::Warn);
        assert!(Severity::Info > Severity::Debug);
        assert_eq!(Severity::Warn.as_ref(), "warn");
        assert_eq!(Severity::from_str("Error").unwrap(), Severity::Error);
    }

    #[test]
    fn test_diagnostic_builder() {
        let d = Diagnostic::new("h1", DiagnosticKind::Source, Severity::Warn, "timeout")
            .with_connector("Linux");
        assert_eq!(d.connector_id.as_deref(), Some("Linux"));
        assert_eq!(d.kind.to_string(), "source");
    }
}
