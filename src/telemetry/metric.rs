use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A collected value: numeric for gauges and counters, a state name for
/// state sets.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    State(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::State(_) => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{}", n),
            MetricValue::State(s) => write!(f, "{}", s),
        }
    }
}

/// One metric of a monitor, with the value saved at the end of the
/// previous cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: String,
    pub value: MetricValue,
    pub attributes: BTreeMap<String, String>,
    pub collect_time: DateTime<Utc>,
    pub previous_value: Option<MetricValue>,
    pub previous_collect_time: Option<DateTime<Utc>>,
    /// Set when the value was refreshed during the current cycle.
    pub updated: bool,
    /// Intermediate values (rate inputs) are kept but never exported.
    pub internal: bool,
}

impl Metric {
    pub fn new(
        name: impl Into<String>,
        value: MetricValue,
        attributes: BTreeMap<String, String>,
        collect_time: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            attributes,
            collect_time,
            previous_value: None,
            previous_collect_time: None,
            updated: true,
            internal: false,
        }
    }

    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn update(
        &mut self,
        value: MetricValue,
        attributes: BTreeMap<String, String>,
        collect_time: DateTime<Utc>,
    ) {
        self.value = value;
        self.attributes = attributes;
        self.collect_time = collect_time;
        self.updated = true;
    }

    /// Remember the current value as the previous one.
    pub fn save(&mut self) {
        self.previous_value = Some(self.value.clone());
        self.previous_collect_time = Some(self.collect_time);
        self.updated = false;
    }

    /// Per-second increase since the previous save. `None` on the first
    /// sample, when time did not advance, or when the counter went back.
    pub fn rate(&self) -> Option<f64> {
        let current = self.value.as_f64()?;
        let previous = self.previous_value.as_ref()?.as_f64()?;
        let elapsed = (self.collect_time - self.previous_collect_time?).num_milliseconds();
        if elapsed <= 0 || current < previous {
            return None;
        }
        Some((current - previous) / (elapsed as f64 / 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_save_and_rate() {
        let t0 = Utc::now();
        let mut metric = Metric::new("hw.io", MetricValue::Number(100.0), BTreeMap::new(), t0);
        assert!(metric.updated);
        assert_eq!(metric.rate(), None);

        metric.save();
        assert!(!metric.updated);
        metric.update(MetricValue::Number(300.0), BTreeMap::new(), t0 + Duration::seconds(10));
        assert_eq!(metric.rate(), Some(20.0));
        assert_eq!(metric.previous_value, Some(MetricValue::Number(100.0)));
    }

    #[test]
    fn test_rate_ignores_reset_counter() {
        let t0 = Utc::now();
        let mut metric = Metric::new("hw.io", MetricValue::Number(100.0), BTreeMap::new(), t0);
        metric.save();
        metric.update(MetricValue::Number(5.0), BTreeMap::new(), t0 + Duration::seconds(10));
        assert_eq!(metric.rate(), None);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(MetricValue::Number(1.5).to_string(), "1.5");
        assert_eq!(MetricValue::State("ok".into()).to_string(), "ok");
        assert_eq!(MetricValue::State("ok".into()).as_f64(), None);
    }
}
