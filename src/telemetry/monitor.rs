use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Metric, MetricValue};

/// A discovered hardware component (disk, fan, controller, ...) of a host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Monitor {
    pub id: String,
    pub monitor_type: String,
    pub connector_id: String,
    pub attributes: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, Metric>,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Set when the last discovery no longer reported the monitor.
    pub stale: bool,
    pub missed_discoveries: u32,
}

impl Monitor {
    /// Stable identifier derived from the host, connector, monitor type and
    /// the values of the key attributes, in key order.
    ///
    /// Key values are joined with `_`; a `_` or `\` inside a value is
    /// escaped with `\`.
    pub fn build_id(
        host_id: &str,
        connector_id: &str,
        monitor_type: &str,
        key_values: &[&str],
    ) -> String {
        let keys: Vec<String> = key_values
            .iter()
            .map(|value| value.replace('\\', "\\\\").replace('_', "\\_"))
            .collect();
        format!(
            "{}@{}/{}/{}",
            host_id,
            connector_id,
            monitor_type,
            keys.join("_")
        )
    }

    pub fn new(
        id: impl Into<String>,
        monitor_type: impl Into<String>,
        connector_id: impl Into<String>,
        attributes: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            monitor_type: monitor_type.into(),
            connector_id: connector_id.into(),
            attributes,
            metrics: BTreeMap::new(),
            discovered_at: now,
            last_seen: now,
            stale: false,
            missed_discoveries: 0,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn metric(&self, key: &str) -> Option<&Metric> {
        self.metrics.get(key)
    }

    /// Set a metric under `key`, keeping the previous value of an existing
    /// one.
    pub fn set_metric(
        &mut self,
        key: &str,
        value: MetricValue,
        attributes: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> &mut Metric {
        let name = key.split('{').next().unwrap_or(key).to_string();
        self.metrics
            .entry(key.to_string())
            .and_modify(|metric| metric.update(value.clone(), attributes.clone(), now))
            .or_insert_with(|| Metric::new(name, value, attributes, now))
    }

    /// End of cycle: every metric's value becomes its previous value.
    pub fn save_metrics(&mut self) {
        for metric in self.metrics.values_mut() {
            metric.save();
        }
    }

    pub fn mark_seen(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
        self.stale = false;
        self.missed_discoveries = 0;
    }

    /// Record a discovery that did not report this monitor.
    pub fn mark_missed(&mut self) -> u32 {
        self.stale = true;
        self.missed_discoveries += 1;
        self.missed_discoveries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_id_is_deterministic() {
        let a = Monitor::build_id("h1", "Linux", "disk", &["sda", "0"]);
        let b = Monitor::build_id("h1", "Linux", "disk", &["sda", "0"]);
        assert_eq!(a, b);
        assert_eq!(a, "h1@Linux/disk/sda_0");
        assert_ne!(a, Monitor::build_id("h2", "Linux", "disk", &["sda", "0"]));
    }

    #[test]
    fn test_build_id_keys_do_not_collide() {
        let a = Monitor::build_id("h1", "Linux", "disk", &["a_b", "c"]);
        let b = Monitor::build_id("h1", "Linux", "disk", &["a", "b_c"]);
        assert_ne!(a, b);
        assert_eq!(a, "h1@Linux/disk/a\\_b_c");
        assert_eq!(b, "h1@Linux/disk/a_b\\_c");
        assert_ne!(
            Monitor::build_id("h1", "Linux", "disk", &["a\\", "b"]),
            Monitor::build_id("h1", "Linux", "disk", &["a\\_b"])
        );
    }

    #[test]
    fn test_set_metric_keeps_history() {
        let now = Utc::now();
        let mut monitor = Monitor::new("id", "fan", "c", BTreeMap::new(), now);
        monitor.set_metric("hw.fan.speed", MetricValue::Number(1000.0), BTreeMap::new(), now);
        monitor.save_metrics();
        let metric =
            monitor.set_metric("hw.fan.speed", MetricValue::Number(1200.0), BTreeMap::new(), now);
        assert_eq!(metric.previous_value, Some(MetricValue::Number(1000.0)));
        assert!(metric.updated);
    }

    #[test]
    fn test_metric_name_strips_attributes() {
        let now = Utc::now();
        let mut monitor = Monitor::new("id", "fan", "c", BTreeMap::new(), now);
        let attributes = BTreeMap::from([("state".to_string(), "ok".to_string())]);
        let metric = monitor.set_metric(
            "hw.status{state=\"ok\"}",
            MetricValue::Number(1.0),
            attributes,
            now,
        );
        assert_eq!(metric.name, "hw.status");
    }

    #[test]
    fn test_missed_and_seen() {
        let now = Utc::now();
        let mut monitor = Monitor::new("id", "fan", "c", BTreeMap::new(), now);
        assert_eq!(monitor.mark_missed(), 1);
        assert_eq!(monitor.mark_missed(), 2);
        assert!(monitor.stale);
        monitor.mark_seen(now);
        assert!(!monitor.stale);
        assert_eq!(monitor.missed_discoveries, 0);
    }
}
