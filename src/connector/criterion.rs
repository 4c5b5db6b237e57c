//! Detection criteria.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;

use super::DeviceKind;
use super::source::{HttpMethod, ResultContent};

/// A test deciding whether a connector applies to a host.
///
/// `expected_result` values are PSL regular expressions matched
/// case-insensitively against the protocol result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsRefStr)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Criterion {
    SnmpGet {
        oid: String,
        #[serde(default)]
        expected_result: Option<String>,
        #[serde(default)]
        force_serialization: bool,
    },
    SnmpGetNext {
        oid: String,
        #[serde(default)]
        expected_result: Option<String>,
        #[serde(default)]
        force_serialization: bool,
    },
    Wbem {
        query: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        expected_result: Option<String>,
        #[serde(default)]
        force_serialization: bool,
    },
    Wmi {
        query: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        expected_result: Option<String>,
        #[serde(default)]
        force_serialization: bool,
    },
    Http {
        #[serde(default)]
        method: HttpMethod,
        url: String,
        #[serde(default)]
        header: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        authentication_token: Option<String>,
        #[serde(default)]
        result_content: ResultContent,
        #[serde(default)]
        expected_result: Option<String>,
        #[serde(default)]
        force_serialization: bool,
    },
    OsCommand {
        command_line: String,
        #[serde(default)]
        expected_result: Option<String>,
        #[serde(default)]
        execute_locally: bool,
        #[serde(default, with = "humantime_serde")]
        timeout: Option<Duration>,
        /// Message reported instead of the generic one on mismatch.
        #[serde(default)]
        error_message: Option<String>,
        #[serde(default)]
        force_serialization: bool,
    },
    /// Filter on the configured host type.
    #[serde(alias = "os")]
    DeviceType {
        #[serde(default)]
        keep_only: Vec<DeviceKind>,
        #[serde(default)]
        exclude: Vec<DeviceKind>,
    },
    Ipmi {
        #[serde(default)]
        force_serialization: bool,
    },
    /// A running process whose command line matches the regex.
    Process {
        command_line: String,
    },
    /// A Windows service that must be running.
    Service {
        name: String,
    },
}

impl Criterion {
    /// Whether evaluation must hold the host's serialization token.
    pub fn force_serialization(&self) -> bool {
        match self {
            Self::SnmpGet {
                force_serialization,
                ..
            }
            | Self::SnmpGetNext {
                force_serialization,
                ..
            }
            | Self::Wbem {
                force_serialization,
                ..
            }
            | Self::Wmi {
                force_serialization,
                ..
            }
            | Self::Http {
                force_serialization,
                ..
            }
            | Self::OsCommand {
                force_serialization,
                ..
            }
            | Self::Ipmi {
                force_serialization,
            } => *force_serialization,
            Self::DeviceType { .. } | Self::Process { .. } | Self::Service { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_criteria() {
        let criteria: Vec<Criterion> = serde_yaml::from_str(
            r#"
- type: os
  keepOnly: [linux]
- type: snmpGetNext
  oid: 1.3.6.1.4.1.674
  forceSerialization: true
- type: osCommand
  commandLine: /usr/sbin/lsdev
  expectedResult: "Available"
  timeout: 30s
"#,
        )
        .unwrap();

        assert!(matches!(&criteria[0], Criterion::DeviceType { keep_only, .. } if keep_only == &[DeviceKind::Linux]));
        assert!(criteria[1].force_serialization());
        assert!(!criteria[2].force_serialization());
        assert!(matches!(
            &criteria[2],
            Criterion::OsCommand { timeout: Some(t), .. } if *t == Duration::from_secs(30)
        ));
    }
}
