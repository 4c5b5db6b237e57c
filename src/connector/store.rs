//! Connector store: the validated set of connectors an engine works with.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use super::{Connector, ConnectorError};
use crate::resolver::{ResolveError, SourceGraph};

/// A connector excluded from the store, with the reason.
#[derive(Debug)]
pub struct RejectedConnector {
    pub id: String,
    pub error: ConnectorError,
}

/// Connectors keyed by case-insensitive id.
///
/// Every connector in the store has its `extends` chain flattened, its
/// constants substituted and its source graph proven acyclic. Connectors
/// failing any of that are kept aside in [`ConnectorStore::rejected`].
#[derive(Debug, Default)]
pub struct ConnectorStore {
    connectors: BTreeMap<String, Arc<Connector>>,
    rejected: Vec<RejectedConnector>,
}

impl ConnectorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from already-parsed connectors.
    pub fn from_connectors(connectors: impl IntoIterator<Item = Connector>) -> Self {
        Self::build(connectors.into_iter().collect(), Vec::new())
    }

    /// Load every `*.yaml` / `*.yml` connector file of a directory.
    ///
    /// Unparseable files are rejected individually; only an unreadable
    /// directory fails the whole load.
    ///
    /// # Errors
    /// Returns `ConnectorError::Io` if the directory cannot be read.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self, ConnectorError> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && matches!(
                        path.extension().and_then(|e| e.to_str()),
                        Some("yaml" | "yml")
                    )
            })
            .collect();
        paths.sort();

        let mut connectors = Vec::with_capacity(paths.len());
        let mut rejected = Vec::new();
        for path in paths {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            tracing::debug!(path = %path.display(), "Loading connector");

            let parsed = std::fs::read_to_string(&path)
                .map_err(ConnectorError::from)
                .and_then(|content| {
                    serde_yaml::from_str::<Connector>(&content).map_err(|source| {
                        ConnectorError::Parse {
                            path: path.display().to_string(),
                            source,
                        }
                    })
                });

            match parsed {
                Ok(mut connector) => {
                    if connector.id.trim().is_empty() {
                        connector.id = stem;
                    }
                    connectors.push(connector);
                }
                Err(error) => rejected.push(RejectedConnector { id: stem, error }),
            }
        }

        let store = Self::build(connectors, rejected);
        tracing::info!(
            path = %dir.display(),
            loaded = store.len(),
            rejected = store.rejected.len(),
            "Connector store loaded"
        );
        Ok(store)
    }

    /// Look up a connector by id, ignoring case.
    pub fn get(&self, id: &str) -> Option<&Arc<Connector>> {
        self.connectors.get(&id.to_lowercase())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// All accepted connectors, ordered by lowercase id.
    pub fn connectors(&self) -> impl Iterator<Item = &Arc<Connector>> {
        self.connectors.values()
    }

    pub fn rejected(&self) -> &[RejectedConnector] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    // --- Private helpers ---

    fn build(connectors: Vec<Connector>, mut rejected: Vec<RejectedConnector>) -> Self {
        let mut raw: BTreeMap<String, Connector> = BTreeMap::new();
        for connector in connectors {
            if connector.id.trim().is_empty() {
                rejected.push(RejectedConnector {
                    id: String::new(),
                    error: ConnectorError::Invalid {
                        connector: String::new(),
                        reason: "connector id cannot be empty".to_string(),
                    },
                });
                continue;
            }
            let key = connector.id.to_lowercase();
            if raw.contains_key(&key) {
                rejected.push(RejectedConnector {
                    id: connector.id.clone(),
                    error: ConnectorError::Invalid {
                        connector: connector.id,
                        reason: "duplicate connector id".to_string(),
                    },
                });
                continue;
            }
            raw.insert(key, connector);
        }

        let mut flattened: HashMap<String, Option<Connector>> = HashMap::new();
        let mut store = Self::default();

        for key in raw.keys() {
            let result = flatten(key, &raw, &mut flattened, &mut Vec::new()).and_then(|mut c| {
                c.apply_constants();
                c.normalize_translations();
                validate(&c)?;
                Ok(c)
            });

            match result {
                Ok(connector) => {
                    store.connectors.insert(key.clone(), Arc::new(connector));
                }
                Err(error) => {
                    let id = raw[key].id.clone();
                    rejected.push(RejectedConnector { id, error });
                }
            }
        }

        for entry in &rejected {
            tracing::warn!(connector = %entry.id, error = %entry.error, "Connector rejected");
        }
        store.rejected = rejected;
        store
    }
}

/// Resolve `extends` for one connector, memoizing results in `done`
/// (`None` marks a connector whose own flattening failed).
fn flatten(
    key: &str,
    raw: &BTreeMap<String, Connector>,
    done: &mut HashMap<String, Option<Connector>>,
    visiting: &mut Vec<String>,
) -> Result<Connector, ConnectorError> {
    let connector = &raw[key];
    if let Some(entry) = done.get(key) {
        return entry.clone().ok_or_else(|| ConnectorError::UnresolvedExtends {
            connector: connector.id.clone(),
            parent: connector.extends.join(", "),
        });
    }
    if visiting.iter().any(|k| k == key) {
        return Err(ConnectorError::ExtendsCycle {
            connector: connector.id.clone(),
        });
    }

    visiting.push(key.to_string());
    let mut base: Option<Connector> = None;
    let mut failure = None;
    for parent in &connector.extends {
        let parent_key = parent.to_lowercase();
        if !raw.contains_key(&parent_key) {
            failure = Some(ConnectorError::UnresolvedExtends {
                connector: connector.id.clone(),
                parent: parent.clone(),
            });
            break;
        }
        match flatten(&parent_key, raw, done, visiting) {
            Ok(parent_effective) => {
                base = Some(match base {
                    Some(acc) => parent_effective.merged_over(&acc),
                    None => parent_effective,
                });
            }
            Err(ConnectorError::ExtendsCycle { .. }) => {
                failure = Some(ConnectorError::ExtendsCycle {
                    connector: connector.id.clone(),
                });
                break;
            }
            Err(_) => {
                failure = Some(ConnectorError::UnresolvedExtends {
                    connector: connector.id.clone(),
                    parent: parent.clone(),
                });
                break;
            }
        }
    }
    visiting.pop();

    if let Some(error) = failure {
        done.insert(key.to_string(), None);
        return Err(error);
    }

    let effective = match base {
        Some(base) => connector.clone().merged_over(&base),
        None => connector.clone(),
    };
    done.insert(key.to_string(), Some(effective.clone()));
    Ok(effective)
}

/// Structural checks on a flattened connector.
fn validate(connector: &Connector) -> Result<(), ConnectorError> {
    let id = &connector.id;
    let graph = SourceGraph::new(connector.sources()).map_err(|e| match e {
        ResolveError::DuplicateKey(key) => ConnectorError::DuplicateSourceKey {
            connector: id.clone(),
            key,
        },
        other => ConnectorError::Invalid {
            connector: id.clone(),
            reason: other.to_string(),
        },
    })?;

    if let Some((source_key, reference)) = graph.missing_references().into_iter().next() {
        return Err(ConnectorError::MissingReference {
            connector: id.clone(),
            source_key,
            reference,
        });
    }

    for job in &connector.monitors {
        for mapping in job.mappings() {
            if !graph.contains(mapping.source_key()) {
                return Err(ConnectorError::MissingReference {
                    connector: id.clone(),
                    source_key: format!("{} mapping", job.monitor_type),
                    reference: mapping.source_key().to_string(),
                });
            }
        }
    }

    for source in connector.sources() {
        for compute in &source.computes {
            if let Some(table) = compute.translation_table() {
                if connector.translation(table).is_none() {
                    return Err(ConnectorError::UnknownTranslationTable {
                        connector: id.clone(),
                        table: table.to_string(),
                    });
                }
            }
        }
    }

    graph.resolve().map_err(|e| match e {
        ResolveError::Cycle(keys) => ConnectorError::CyclicSources {
            connector: id.clone(),
            keys,
        },
        other => ConnectorError::Invalid {
            connector: id.clone(),
            reason: other.to_string(),
        },
    })?;

    Ok(())
}
