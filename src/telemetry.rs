//! Per-host telemetry state.
//!
//! One [`TelemetryState`] exists per monitored host. It holds a namespace of
//! source tables per connector and the monitors discovered on the host. It
//! is owned by the host's context and only touched by that host's cycle.

mod metric;
mod monitor;

pub use metric::{Metric, MetricValue};
pub use monitor::Monitor;

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::table::SourceTable;

/// Source tables computed for one connector on one host.
#[derive(Debug, Clone, Default)]
pub struct ConnectorNamespace {
    tables: HashMap<String, SourceTable>,
    fresh: HashSet<String>,
}

impl ConnectorNamespace {
    /// Store a table, marking it as computed during the current cycle.
    pub fn add_source_table(&mut self, key: impl Into<String>, table: SourceTable) {
        let key = key.into();
        self.fresh.insert(key.clone());
        self.tables.insert(key, table);
    }

    pub fn get_source_table(&self, key: &str) -> Option<&SourceTable> {
        self.tables.get(key)
    }

    /// True when the table was computed during the current cycle.
    pub fn is_fresh(&self, key: &str) -> bool {
        self.fresh.contains(key)
    }

    /// Keep the tables but forget which ones are current.
    pub fn begin_cycle(&mut self) {
        self.fresh.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Everything retained for one host across cycles.
#[derive(Debug, Clone)]
pub struct TelemetryState {
    host_id: String,
    namespaces: HashMap<String, ConnectorNamespace>,
    monitors: BTreeMap<String, Monitor>,
}

impl TelemetryState {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            namespaces: HashMap::new(),
            monitors: BTreeMap::new(),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn get_or_create_namespace(&mut self, connector_id: &str) -> &mut ConnectorNamespace {
        self.namespaces.entry(connector_id.to_string()).or_default()
    }

    pub fn namespace(&self, connector_id: &str) -> Option<&ConnectorNamespace> {
        self.namespaces.get(connector_id)
    }

    /// Known monitors, ordered by id.
    pub fn monitors(&self) -> impl Iterator<Item = &Monitor> {
        self.monitors.values()
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    pub fn monitor(&self, id: &str) -> Option<&Monitor> {
        self.monitors.get(id)
    }

    pub fn monitor_mut(&mut self, id: &str) -> Option<&mut Monitor> {
        self.monitors.get_mut(id)
    }

    /// Monitors of one type discovered by one connector.
    pub fn monitors_of<'a>(
        &'a self,
        connector_id: &'a str,
        monitor_type: &'a str,
    ) -> impl Iterator<Item = &'a Monitor> + 'a {
        self.monitors
            .values()
            .filter(move |m| m.connector_id == connector_id && m.monitor_type == monitor_type)
    }

    /// Insert a newly observed monitor, or refresh the attributes of the
    /// known one with the same id while keeping its metric history.
    pub fn upsert_monitor(&mut self, monitor: Monitor) -> &mut Monitor {
        match self.monitors.entry(monitor.id.clone()) {
            std::collections::btree_map::Entry::Occupied(entry) => {
                let known = entry.into_mut();
                known.attributes.extend(monitor.attributes);
                known.mark_seen(monitor.last_seen);
                known
            }
            std::collections::btree_map::Entry::Vacant(entry) => entry.insert(monitor),
        }
    }

    pub fn remove_monitor(&mut self, id: &str) -> Option<Monitor> {
        self.monitors.remove(id)
    }

    /// Start a new cycle: cached tables stay but are no longer current.
    pub fn begin_cycle(&mut self) {
        for namespace in self.namespaces.values_mut() {
            namespace.begin_cycle();
        }
    }

    /// End of cycle: current metric values become the previous ones.
    pub fn save_metrics(&mut self) {
        for monitor in self.monitors.values_mut() {
            monitor.save_metrics();
        }
    }

    /// Drop namespaces and monitors of connectors no longer matched.
    pub fn retain_connectors(&mut self, connector_ids: &[String]) {
        self.namespaces.retain(|id, _| connector_ids.contains(id));
        self.monitors
            .retain(|_, m| connector_ids.contains(&m.connector_id));
    }
}
