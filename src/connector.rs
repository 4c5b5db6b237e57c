//! Connector model.
//!
//! A [`Connector`] describes how one device or software family is detected,
//! discovered and collected. Connectors are plain data: they are loaded once
//! by the [`ConnectorStore`], flattened (`extends`), validated, and shared
//! read-only by every host they apply to.
//!
//! - [`Source`]: named data-acquisition step producing a [`crate::SourceTable`]
//! - [`Compute`]: transformation applied to a table
//! - [`Criterion`]: detection test
//! - [`MonitorJob`]: discovery and collect jobs for one monitor type

mod compute;
mod criterion;
mod monitor_job;
mod source;
mod store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

pub use compute::{Compute, Conversion};
pub use criterion::Criterion;
pub use monitor_job::{Collect, CollectKind, Discovery, Mapping, MonitorJob};
pub use source::{
    EntryConcatMethod, ExecuteForEachEntryOf, HttpMethod, ResultContent, Source, SourceKind,
    referenced_sources, source_ref,
};
pub(crate) use source::replace_source_refs;
pub use store::{ConnectorStore, RejectedConnector};

/// Translation table: lowercase input value to translated value.
pub type TranslationTable = BTreeMap<String, String>;

/// Key of the fallback entry of a translation table.
pub const DEFAULT_TRANSLATION_KEY: &str = "default";

/// Errors raised while loading or validating connectors.
///
/// Any of these excludes the connector from the store.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Failed to read a connector file or directory.
    #[error("failed to read connector file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a connector file.
    #[error("failed to parse connector '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Source references form a cycle.
    #[error("connector '{connector}': cyclic source references between [{}]", .keys.join(", "))]
    CyclicSources { connector: String, keys: Vec<String> },

    /// A source, mapping or iteration references an unknown source key.
    #[error("connector '{connector}': source '{source_key}' references unknown source '{reference}'")]
    MissingReference {
        connector: String,
        source_key: String,
        reference: String,
    },

    /// A source key is declared twice.
    #[error("connector '{connector}': duplicate source key '{key}'")]
    DuplicateSourceKey { connector: String, key: String },

    /// An `extends` entry names a connector that does not exist or was rejected.
    #[error("connector '{connector}': cannot resolve parent connector '{parent}'")]
    UnresolvedExtends { connector: String, parent: String },

    /// `extends` chain loops back on itself.
    #[error("connector '{connector}': extends chain is cyclic")]
    ExtendsCycle { connector: String },

    /// A compute references a translation table the connector does not define.
    #[error("connector '{connector}': unknown translation table '{table}'")]
    UnknownTranslationTable { connector: String, table: String },

    /// Any other structural problem.
    #[error("connector '{connector}': {reason}")]
    Invalid { connector: String, reason: String },
}

/// Host / device family a connector applies to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DeviceKind {
    #[default]
    Linux,
    Windows,
    Network,
    Storage,
    /// Out-of-band management cards (BMC, iLO, iDRAC).
    Oob,
    Solaris,
    Aix,
    Hpux,
    Vms,
    Other,
}

/// Detection section: which hosts a connector may apply to and how to prove it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// Host types the connector may be tried on (empty: any).
    #[serde(default)]
    pub applies_to: Vec<DeviceKind>,

    /// Criteria, all of which must match.
    #[serde(default)]
    pub criteria: Vec<Criterion>,

    /// Only evaluate when no other connector matched the host.
    #[serde(default)]
    pub on_last_resort: bool,

    /// Connectors removed from the matched set when this one matches.
    #[serde(default)]
    pub supersedes: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

/// Metric instrument kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase", ascii_case_insensitive)]
pub enum MetricKind {
    #[default]
    Gauge,
    Counter,
    #[serde(alias = "updowncounter")]
    UpDownCounter,
    StateSet,
}

/// Metric template declared by a connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    #[serde(default)]
    pub unit: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default, rename = "type")]
    pub kind: MetricKind,

    /// Allowed states of a `stateSet` metric.
    #[serde(default)]
    pub states: Vec<String>,
}

/// One device family's monitoring logic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    /// Connector id. Defaults to the file stem when loaded from a directory.
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub display_name: Option<String>,

    /// Parent connectors, merged in order beneath this one.
    #[serde(default)]
    pub extends: Vec<String>,

    #[serde(default)]
    pub detection: Detection,

    /// `${constant::NAME}` substitutions applied to every source at load time.
    #[serde(default, deserialize_with = "lenient::string_map")]
    pub constants: BTreeMap<String, String>,

    #[serde(default, deserialize_with = "lenient::translation_tables")]
    pub translations: BTreeMap<String, TranslationTable>,

    #[serde(default)]
    pub metrics: BTreeMap<String, MetricDefinition>,

    /// Sources shared by several monitor jobs.
    #[serde(default)]
    pub pre: Vec<Source>,

    #[serde(default)]
    pub monitors: Vec<MonitorJob>,
}

impl Connector {
    /// Create an empty connector with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Every source of the connector in declaration order: `pre` first, then
    /// each monitor job's discovery and collect sources.
    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.pre.iter().chain(self.monitors.iter().flat_map(|job| {
            job.discovery
                .iter()
                .flat_map(|d| d.sources.iter())
                .chain(job.collect.iter().flat_map(|c| c.sources.iter()))
        }))
    }

    pub fn source(&self, key: &str) -> Option<&Source> {
        self.sources().find(|s| s.key == key)
    }

    fn sources_mut(&mut self) -> impl Iterator<Item = &mut Source> {
        self.pre.iter_mut().chain(self.monitors.iter_mut().flat_map(|job| {
            job.discovery
                .iter_mut()
                .flat_map(|d| d.sources.iter_mut())
                .chain(job.collect.iter_mut().flat_map(|c| c.sources.iter_mut()))
        }))
    }

    pub fn translation(&self, name: &str) -> Option<&TranslationTable> {
        self.translations.get(name)
    }

    pub fn metric_definition(&self, name: &str) -> Option<&MetricDefinition> {
        self.metrics.get(name)
    }

    /// Whether the connector may be tried on a host of the given type.
    pub fn applies_to(&self, kind: DeviceKind) -> bool {
        self.detection.applies_to.is_empty() || self.detection.applies_to.contains(&kind)
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    /// Replace `${constant::NAME}` in every source and compute parameter.
    pub(crate) fn apply_constants(&mut self) {
        if self.constants.is_empty() {
            return;
        }
        let constants = self.constants.clone();
        let substitute = |text: &str| {
            constant_regex()
                .replace_all(text, |caps: &regex::Captures| {
                    constants
                        .get(&caps[1])
                        .cloned()
                        .unwrap_or_else(|| caps[0].to_string())
                })
                .into_owned()
        };
        for source in self.sources_mut() {
            source.substitute_in_place(&substitute);
        }
    }

    /// Lowercase translation-table keys so lookups can lowercase the input.
    pub(crate) fn normalize_translations(&mut self) {
        for table in self.translations.values_mut() {
            *table = std::mem::take(table)
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect();
        }
    }

    /// Merge `self` on top of `parent`: the child's values win, sources and
    /// monitor jobs with the same key/type replace the parent's.
    #[must_use]
    pub(crate) fn merged_over(self, parent: &Connector) -> Connector {
        let mut merged = parent.clone();
        merged.id = self.id;
        merged.extends = self.extends;
        if self.display_name.is_some() {
            merged.display_name = self.display_name;
        }

        let detection = self.detection;
        if !detection.applies_to.is_empty() {
            merged.detection.applies_to = detection.applies_to;
        }
        if !detection.criteria.is_empty() {
            merged.detection.criteria = detection.criteria;
        }
        merged.detection.on_last_resort = detection.on_last_resort;
        for superseded in detection.supersedes {
            if !merged.detection.supersedes.contains(&superseded) {
                merged.detection.supersedes.push(superseded);
            }
        }
        for tag in detection.tags {
            if !merged.detection.tags.contains(&tag) {
                merged.detection.tags.push(tag);
            }
        }

        merged.constants.extend(self.constants);
        merged.translations.extend(self.translations);
        merged.metrics.extend(self.metrics);

        for source in self.pre {
            match merged.pre.iter_mut().find(|s| s.key == source.key) {
                Some(existing) => *existing = source,
                None => merged.pre.push(source),
            }
        }
        for job in self.monitors {
            match merged
                .monitors
                .iter_mut()
                .find(|j| j.monitor_type == job.monitor_type)
            {
                Some(existing) => *existing = job,
                None => merged.monitors.push(job),
            }
        }
        merged
    }
}

fn constant_regex() -> &'static regex::Regex {
    static CONSTANT_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    CONSTANT_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{constant::([A-Za-z0-9_.\-]+)\}")
            .expect("failed to compile constant regex")
    })
}

/// Deserializers accepting YAML scalars of any type where a string is expected.
pub(crate) mod lenient {
    use std::collections::BTreeMap;
    use std::fmt;

    use serde::Deserializer;
    use serde::de::{self, Visitor};

    use super::TranslationTable;

    struct Scalar(String);

    impl<'de> serde::Deserialize<'de> for Scalar {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            struct ScalarVisitor;

            impl Visitor<'_> for ScalarVisitor {
                type Value = Scalar;

                fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str("a string, number or boolean")
                }

                fn visit_str<E: de::Error>(self, v: &str) -> Result<Scalar, E> {
                    Ok(Scalar(v.to_string()))
                }

                fn visit_string<E: de::Error>(self, v: String) -> Result<Scalar, E> {
                    Ok(Scalar(v))
                }

                fn visit_i64<E: de::Error>(self, v: i64) -> Result<Scalar, E> {
                    Ok(Scalar(v.to_string()))
                }

                fn visit_u64<E: de::Error>(self, v: u64) -> Result<Scalar, E> {
                    Ok(Scalar(v.to_string()))
                }

                fn visit_f64<E: de::Error>(self, v: f64) -> Result<Scalar, E> {
                    Ok(Scalar(v.to_string()))
                }

                fn visit_bool<E: de::Error>(self, v: bool) -> Result<Scalar, E> {
                    Ok(Scalar(v.to_string()))
                }

                fn visit_unit<E: de::Error>(self) -> Result<Scalar, E> {
                    Ok(Scalar(String::new()))
                }
            }

            deserializer.deserialize_any(ScalarVisitor)
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        <Scalar as serde::Deserialize>::deserialize(deserializer).map(|s| s.0)
    }

    pub fn string_map<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, String>, D::Error> {
        let map: BTreeMap<ScalarKey, Scalar> = serde::Deserialize::deserialize(deserializer)?;
        Ok(map.into_iter().map(|(k, v)| (k.0, v.0)).collect())
    }

    pub fn translation_tables<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, TranslationTable>, D::Error> {
        let tables: BTreeMap<String, BTreeMap<ScalarKey, Scalar>> =
            serde::Deserialize::deserialize(deserializer)?;
        Ok(tables
            .into_iter()
            .map(|(name, table)| (name, table.into_iter().map(|(k, v)| (k.0, v.0)).collect()))
            .collect())
    }

    /// Map key variant of [`Scalar`]; ordered so it can key a `BTreeMap`.
    #[derive(PartialEq, Eq, PartialOrd, Ord)]
    struct ScalarKey(String);

    impl<'de> serde::Deserialize<'de> for ScalarKey {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            <Scalar as serde::Deserialize>::deserialize(deserializer).map(|s| ScalarKey(s.0))
        }
    }
}
