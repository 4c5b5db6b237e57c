//! Monitor jobs: discovery and collect definitions for one monitor type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::source::{Source, source_ref};

fn default_keys() -> Vec<String> {
    vec!["id".to_string()]
}

/// Turns one table row into monitor attributes and metric values.
///
/// Templates: `$N` selects column N; `$N` inside literal text is
/// interpolated; `fn($N)` applies a conversion function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// Key (or `${source::KEY}`) of the table the mapping reads.
    pub source: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default)]
    pub metrics: BTreeMap<String, String>,
}

impl Mapping {
    pub fn source_key(&self) -> &str {
        source_ref(&self.source)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    #[serde(default)]
    pub sources: Vec<Source>,
    pub mapping: Mapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectKind {
    /// One pass of the sources; rows are matched to monitors by key attributes.
    #[default]
    MultiInstance,
    /// Sources run once per monitor with `${attribute::NAME}` substituted.
    MonoInstance,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collect {
    #[serde(default, rename = "type")]
    pub kind: CollectKind,
    #[serde(default)]
    pub sources: Vec<Source>,
    pub mapping: Mapping,
}

/// Discovery and collect for one monitor type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorJob {
    #[serde(rename = "type")]
    pub monitor_type: String,

    /// Ordered attribute names forming the monitor identity.
    #[serde(default = "default_keys")]
    pub keys: Vec<String>,

    #[serde(default)]
    pub discovery: Option<Discovery>,

    #[serde(default)]
    pub collect: Option<Collect>,
}

impl MonitorJob {
    pub fn new(monitor_type: impl Into<String>) -> Self {
        Self {
            monitor_type: monitor_type.into(),
            keys: default_keys(),
            discovery: None,
            collect: None,
        }
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_discovery(mut self, discovery: Discovery) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_collect(mut self, collect: Collect) -> Self {
        self.collect = Some(collect);
        self
    }

    /// Discovery and collect mappings of the job.
    pub(crate) fn mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.discovery
            .iter()
            .map(|d| &d.mapping)
            .chain(self.collect.iter().map(|c| &c.mapping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_job_defaults() {
        let job: MonitorJob = serde_yaml::from_str(
            r#"
type: fan
collect:
  type: monoInstance
  mapping:
    source: ${source::fanSpeed}
    metrics:
      hw.fan.speed: $2
"#,
        )
        .unwrap();

        assert_eq!(job.keys, vec!["id"]);
        let collect = job.collect.as_ref().unwrap();
        assert_eq!(collect.kind, CollectKind::MonoInstance);
        assert_eq!(collect.mapping.source_key(), "fanSpeed");
        assert_eq!(job.mappings().count(), 1);
    }
}
