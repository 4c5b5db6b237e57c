//! Source resolver.
//!
//! Builds the dependency graph of a connector's sources and produces an
//! execution plan: a sequence of stages where every source runs after all the
//! sources it depends on. Sources of one stage are independent of each other
//! and may run concurrently. Within a stage, and across runs, ordering follows
//! declaration order, so the plan for a given connector is always the same.
//!
//! Dependency edges come from `executeForEachEntryOf`, from table references
//! (`TableJoin`, `TableUnion`, `Copy`) and from `${source::KEY}` references in
//! any source or compute parameter.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::connector::Source;

/// Errors raised while building or sorting a source graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("duplicate source key '{0}'")]
    DuplicateKey(String),

    #[error("source '{source_key}' references unknown source '{reference}'")]
    MissingReference {
        source_key: String,
        reference: String,
    },

    #[error("cyclic source references between [{}]", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Ordered stages of sources ready to execute.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan<'a> {
    stages: Vec<Vec<&'a Source>>,
}

impl<'a> ExecutionPlan<'a> {
    pub fn stages(&self) -> &[Vec<&'a Source>] {
        &self.stages
    }

    /// Total order: stages flattened.
    pub fn order(&self) -> Vec<&'a Source> {
        self.stages.iter().flatten().copied().collect()
    }

    pub fn keys(&self) -> Vec<&'a str> {
        self.stages
            .iter()
            .flatten()
            .map(|s| s.key.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Dependency graph over a set of sources.
///
/// References to keys outside the set are kept aside rather than rejected:
/// they name tables that are expected to be computed already (see
/// [`SourceGraph::missing_references`] for strict validation).
#[derive(Debug)]
pub struct SourceGraph<'a> {
    sources: Vec<&'a Source>,
    index: HashMap<&'a str, usize>,
    deps: Vec<Vec<usize>>,
    external: Vec<(usize, String)>,
}

impl<'a> SourceGraph<'a> {
    /// Build the graph. Fails only on duplicate keys.
    pub fn new(sources: impl IntoIterator<Item = &'a Source>) -> Result<Self, ResolveError> {
        let sources: Vec<&'a Source> = sources.into_iter().collect();
        let mut index = HashMap::with_capacity(sources.len());
        for (i, source) in sources.iter().enumerate() {
            if index.insert(source.key.as_str(), i).is_some() {
                return Err(ResolveError::DuplicateKey(source.key.clone()));
            }
        }

        let mut deps = Vec::with_capacity(sources.len());
        let mut external = Vec::new();
        for (i, source) in sources.iter().enumerate() {
            let mut node_deps = Vec::new();
            for key in source.dependencies() {
                match index.get(key.as_str()) {
                    Some(&dep) => node_deps.push(dep),
                    None => external.push((i, key)),
                }
            }
            node_deps.sort_unstable();
            node_deps.dedup();
            deps.push(node_deps);
        }

        Ok(Self {
            sources,
            index,
            deps,
            external,
        })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// `(source key, unknown reference)` pairs.
    pub fn missing_references(&self) -> Vec<(String, String)> {
        self.external
            .iter()
            .map(|(i, key)| (self.sources[*i].key.clone(), key.clone()))
            .collect()
    }

    /// Fail on the first reference to a key outside the graph.
    pub fn validate_references(&self) -> Result<(), ResolveError> {
        match self.external.first() {
            Some((i, key)) => Err(ResolveError::MissingReference {
                source_key: self.sources[*i].key.clone(),
                reference: key.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Plan every source of the graph.
    pub fn resolve(&self) -> Result<ExecutionPlan<'a>, ResolveError> {
        self.plan(&vec![true; self.sources.len()])
    }

    /// Plan `roots` and their transitive dependencies, leaving out any source
    /// for which `skip` returns true (and whatever only it depends on).
    pub fn plan_for<'k>(
        &self,
        roots: impl IntoIterator<Item = &'k str>,
        skip: impl Fn(&str) -> bool,
    ) -> Result<ExecutionPlan<'a>, ResolveError> {
        let mut selected = vec![false; self.sources.len()];
        let mut stack: Vec<usize> = roots
            .into_iter()
            .filter_map(|key| self.index.get(key).copied())
            .collect();

        while let Some(i) = stack.pop() {
            if selected[i] || skip(&self.sources[i].key) {
                continue;
            }
            selected[i] = true;
            stack.extend(self.deps[i].iter().copied());
        }

        self.plan(&selected)
    }

    fn plan(&self, selected: &[bool]) -> Result<ExecutionPlan<'a>, ResolveError> {
        let mut remaining: BTreeSet<usize> = (0..self.sources.len()).filter(|&i| selected[i]).collect();
        let mut done = vec![false; self.sources.len()];
        let mut stages = Vec::new();

        loop {
            let ready: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| self.deps[i].iter().all(|&d| !selected[d] || done[d]))
                .collect();
            if ready.is_empty() {
                break;
            }
            for &i in &ready {
                remaining.remove(&i);
                done[i] = true;
            }
            stages.push(ready.into_iter().map(|i| self.sources[i]).collect());
        }

        if remaining.is_empty() {
            Ok(ExecutionPlan { stages })
        } else {
            Err(ResolveError::Cycle(self.cycle_keys(remaining)))
        }
    }

    /// Reduce the unsortable remainder to the sources taking part in a cycle
    /// by pruning nodes nothing else in the remainder depends on.
    fn cycle_keys(&self, mut remaining: BTreeSet<usize>) -> Vec<String> {
        loop {
            let prunable: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| !remaining.iter().any(|&j| self.deps[j].contains(&i)))
                .collect();
            if prunable.is_empty() {
                break;
            }
            for i in prunable {
                remaining.remove(&i);
            }
        }
        remaining
            .into_iter()
            .map(|i| self.sources[i].key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{EntryConcatMethod, ExecuteForEachEntryOf, SourceKind};

    fn static_source(key: &str) -> Source {
        Source::new(key, SourceKind::Static { value: "a;b".into() })
    }

    fn copy_of(key: &str, from: &str) -> Source {
        Source::new(key, SourceKind::Copy { from: from.into() })
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    #[test]
    fn test_resolve_declaration_order_tie_break() {
        let sources = vec![
            copy_of("c", "a"),
            static_source("b"),
            static_source("a"),
            copy_of("d", "c"),
        ];
        let graph = SourceGraph::new(&sources).unwrap();
        let plan = graph.resolve().unwrap();

        assert_eq!(plan.keys(), vec!["b", "a", "c", "d"]);
        assert_eq!(plan.stages().len(), 3);
        assert_eq!(plan.stages()[0].len(), 2);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let sources = vec![
            static_source("s1"),
            copy_of("s2", "s1"),
            static_source("s3"),
            Source::new(
                "s4",
                SourceKind::TableUnion {
                    tables: vec!["${source::s3}".into(), "s2".into()],
                },
            ),
        ];
        let graph = SourceGraph::new(&sources).unwrap();
        let first = graph.resolve().unwrap().keys();
        for _ in 0..10 {
            assert_eq!(SourceGraph::new(&sources).unwrap().resolve().unwrap().keys(), first);
        }
        assert_eq!(first, vec!["s1", "s3", "s2", "s4"]);
    }

    #[test]
    fn test_for_each_dependency_orders_after_iterated_source() {
        let sources = vec![
            static_source("detail")
                .with_for_each(ExecuteForEachEntryOf::new("list", EntryConcatMethod::List)),
            static_source("list"),
        ];
        let plan = SourceGraph::new(&sources).unwrap().resolve().unwrap();
        assert_eq!(plan.keys(), vec!["list", "detail"]);
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn test_cycle_reports_offending_keys_only() {
        let sources = vec![
            static_source("ok"),
            copy_of("x", "y"),
            copy_of("y", "x"),
            copy_of("downstream", "x"),
        ];
        let graph = SourceGraph::new(&sources).unwrap();
        assert_eq!(
            graph.resolve().unwrap_err(),
            ResolveError::Cycle(vec!["x".into(), "y".into()])
        );
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let sources = vec![copy_of("loop", "${source::loop}")];
        let err = SourceGraph::new(&sources).unwrap().resolve().unwrap_err();
        assert_eq!(err.to_string(), "cyclic source references between [loop]");
    }

    #[test]
    fn test_duplicate_and_missing_references() {
        let dup = vec![static_source("a"), static_source("a")];
        assert_eq!(
            SourceGraph::new(&dup).unwrap_err(),
            ResolveError::DuplicateKey("a".into())
        );

        let missing = vec![copy_of("a", "ghost")];
        let graph = SourceGraph::new(&missing).unwrap();
        assert_eq!(
            graph.validate_references().unwrap_err(),
            ResolveError::MissingReference {
                source_key: "a".into(),
                reference: "ghost".into()
            }
        );
        assert_eq!(graph.resolve().unwrap().keys(), vec!["a"]);
    }

    // =========================================================================
    // Partial plans
    // =========================================================================

    #[test]
    fn test_plan_for_pulls_dependencies_and_skips_fresh() {
        let sources = vec![
            static_source("pre"),
            copy_of("discovery", "pre"),
            copy_of("collect", "pre"),
            static_source("unrelated"),
        ];
        let graph = SourceGraph::new(&sources).unwrap();

        let plan = graph.plan_for(["collect"], |_| false).unwrap();
        assert_eq!(plan.keys(), vec!["pre", "collect"]);

        let plan = graph.plan_for(["collect"], |key| key == "pre").unwrap();
        assert_eq!(plan.keys(), vec!["collect"]);
        assert!(graph.plan_for(["missing"], |_| false).unwrap().is_empty());
    }
}
