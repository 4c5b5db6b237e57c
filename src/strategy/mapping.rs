//! Row to monitor mapping.
//!
//! Attribute and metric templates read a table row: `$N` is column N, `$N`
//! inside text is interpolated, and `function($N)` converts the value.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use strum_macros::{AsRefStr, EnumString};
use thiserror::Error;

use crate::connector::{Connector, Mapping, MetricKind};
use crate::telemetry::{MetricValue, Monitor};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("column {column} is out of range for a row of width {width}")]
    ColumnOutOfRange { column: usize, width: usize },

    #[error("metric '{metric}': '{value}' is not a number")]
    NotNumeric { metric: String, value: String },

    #[error("metric '{metric}': '{value}' is not an allowed state")]
    UnknownState { metric: String, value: String },

    #[error("invalid metric name '{0}'")]
    InvalidMetricName(String),
}

/// Value conversions available in metric templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(ascii_case_insensitive)]
pub enum MappingFunction {
    #[strum(serialize = "percent2Ratio")]
    Percent2Ratio,
    #[strum(serialize = "megaHertz2Hertz")]
    MegaHertz2Hertz,
    #[strum(serialize = "mebiByte2Byte")]
    MebiByte2Byte,
    #[strum(serialize = "megaBit2Bit")]
    MegaBit2Bit,
    #[strum(serialize = "boolean")]
    Boolean,
    /// Per-second rate of a counter, from its previous sample.
    #[strum(serialize = "rate")]
    Rate,
    /// Counter built by integrating a rate over time.
    #[strum(serialize = "fakeCounter")]
    FakeCounter,
}

/// One metric value read from a row, before it is stored on a monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedMetric {
    /// Metric key as written in the mapping, attributes included.
    pub key: String,
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub value: MetricValue,
    pub function: Option<MappingFunction>,
}

fn column_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$(\d+)").expect("valid column regex"))
}

fn function_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z][A-Za-z0-9]*)\(\s*(.*?)\s*\)\s*$").expect("valid function regex")
    })
}

fn metric_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([^{}\s]+)\s*(?:\{(.*)\})?\s*$").expect("valid metric name regex"))
}

fn cell(row: &[String], column: usize) -> Result<&str, MappingError> {
    column
        .checked_sub(1)
        .and_then(|index| row.get(index))
        .map(String::as_str)
        .ok_or(MappingError::ColumnOutOfRange {
            column,
            width: row.len(),
        })
}

/// Evaluate a template against a row.
pub fn interpolate(template: &str, row: &[String]) -> Result<String, MappingError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in column_regex().captures_iter(template) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let column = caps[1].parse::<usize>().unwrap_or(0);
        out.push_str(&template[last..whole.start]);
        out.push_str(cell(row, column)?);
        last = whole.end;
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Split `fn(arg)` into the function and its argument template.
fn split_function(template: &str) -> Option<(MappingFunction, &str)> {
    let caps = function_regex().captures(template)?;
    let function = MappingFunction::from_str(caps.get(1)?.as_str()).ok()?;
    Some((function, caps.get(2)?.as_str()))
}

/// Split `name{k="v", ...}` into the metric name and its attributes.
pub fn parse_metric_key(key: &str) -> Result<(String, BTreeMap<String, String>), MappingError> {
    let caps = metric_name_regex()
        .captures(key)
        .ok_or_else(|| MappingError::InvalidMetricName(key.to_string()))?;
    let name = caps[1].to_string();

    let mut attributes = BTreeMap::new();
    if let Some(list) = caps.get(2) {
        for pair in list.as_str().split(',').filter(|p| !p.trim().is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| MappingError::InvalidMetricName(key.to_string()))?;
            attributes.insert(
                k.trim().to_string(),
                v.trim().trim_matches('"').to_string(),
            );
        }
    }
    Ok((name, attributes))
}

fn number(metric: &str, value: &str) -> Result<f64, MappingError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .ok_or_else(|| MappingError::NotNumeric {
            metric: metric.to_string(),
            value: value.to_string(),
        })
}

fn boolean(value: &str) -> f64 {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => 1.0,
        _ => 0.0,
    }
}

/// Evaluate every attribute template of `mapping` against `row`.
pub fn map_attributes(mapping: &Mapping, row: &[String]) -> Result<BTreeMap<String, String>, MappingError> {
    mapping
        .attributes
        .iter()
        .map(|(name, template)| Ok((name.clone(), interpolate(template, row)?.trim().to_string())))
        .collect()
}

/// Evaluate every metric template of `mapping` against `row`. Empty values
/// are skipped; invalid ones are returned as errors.
pub fn map_metrics(
    connector: &Connector,
    mapping: &Mapping,
    row: &[String],
) -> (Vec<MappedMetric>, Vec<MappingError>) {
    let mut metrics = Vec::new();
    let mut errors = Vec::new();

    for (key, template) in &mapping.metrics {
        match map_metric(connector, key, template, row) {
            Ok(Some(metric)) => metrics.push(metric),
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }
    (metrics, errors)
}

fn map_metric(
    connector: &Connector,
    key: &str,
    template: &str,
    row: &[String],
) -> Result<Option<MappedMetric>, MappingError> {
    let (name, attributes) = parse_metric_key(key)?;
    let (function, argument) = match split_function(template) {
        Some((function, argument)) => (Some(function), argument),
        None => (None, template),
    };
    let raw = interpolate(argument, row)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let definition = connector.metric_definition(&name);
    let value = match (definition.map(|d| d.kind), function) {
        (Some(MetricKind::StateSet), None) => {
            let states = definition.map(|d| d.states.as_slice()).unwrap_or_default();
            match states.iter().find(|s| s.eq_ignore_ascii_case(raw)) {
                Some(state) => MetricValue::State(state.clone()),
                None if states.is_empty() => MetricValue::State(raw.to_string()),
                None => {
                    return Err(MappingError::UnknownState {
                        metric: key.to_string(),
                        value: raw.to_string(),
                    });
                }
            }
        }
        (_, Some(MappingFunction::Boolean)) => MetricValue::Number(boolean(raw)),
        (_, function) => {
            let n = number(key, raw)?;
            MetricValue::Number(match function {
                Some(MappingFunction::Percent2Ratio) => n / 100.0,
                Some(MappingFunction::MegaHertz2Hertz) | Some(MappingFunction::MegaBit2Bit) => {
                    n * 1_000_000.0
                }
                Some(MappingFunction::MebiByte2Byte) => n * 1_048_576.0,
                _ => n,
            })
        }
    };

    Ok(Some(MappedMetric {
        key: key.to_string(),
        name,
        attributes,
        value,
        function,
    }))
}

fn rate_key(key: &str) -> String {
    format!("__rate:{}", key)
}

/// Store a mapped metric on `monitor`. Rates only appear from the second
/// sample on; fake counters start at zero.
pub fn store_metric(monitor: &mut Monitor, metric: MappedMetric, now: DateTime<Utc>) {
    match metric.function {
        Some(MappingFunction::Rate) => {
            let raw = monitor.set_metric(&rate_key(&metric.key), metric.value, metric.attributes.clone(), now);
            raw.internal = true;
            if let Some(rate) = raw.rate() {
                monitor.set_metric(&metric.key, MetricValue::Number(rate), metric.attributes, now);
            }
        }
        Some(MappingFunction::FakeCounter) => {
            let rate = metric.value.as_f64().unwrap_or(0.0);
            let counter = match monitor.metric(&metric.key) {
                Some(previous) => {
                    let elapsed = (now - previous.collect_time).num_milliseconds().max(0) as f64 / 1000.0;
                    previous.value.as_f64().unwrap_or(0.0) + rate * elapsed
                }
                None => 0.0,
            };
            monitor.set_metric(&metric.key, MetricValue::Number(counter), metric.attributes, now);
        }
        _ => {
            monitor.set_metric(&metric.key, metric.value, metric.attributes, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MetricDefinition;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn mapping(metrics: &[(&str, &str)]) -> Mapping {
        Mapping {
            source: "s".into(),
            attributes: BTreeMap::new(),
            metrics: metrics
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_interpolate() {
        let row = row(&["sda", "Samsung", "512"]);
        assert_eq!(interpolate("$1", &row).unwrap(), "sda");
        assert_eq!(interpolate("$2 disk ($3 GB)", &row).unwrap(), "Samsung disk (512 GB)");
        assert_eq!(interpolate("literal", &row).unwrap(), "literal");
        assert_eq!(
            interpolate("$4", &row),
            Err(MappingError::ColumnOutOfRange { column: 4, width: 3 })
        );
    }

    #[test]
    fn test_parse_metric_key() {
        let (name, attributes) = parse_metric_key(r#"hw.status{state="ok", hw.type = "fan"}"#).unwrap();
        assert_eq!(name, "hw.status");
        assert_eq!(attributes.get("state").map(String::as_str), Some("ok"));
        assert_eq!(attributes.get("hw.type").map(String::as_str), Some("fan"));

        let (name, attributes) = parse_metric_key("hw.fan.speed").unwrap();
        assert_eq!(name, "hw.fan.speed");
        assert!(attributes.is_empty());
        assert!(parse_metric_key("hw.status{state}").is_err());
    }

    #[test]
    fn test_conversion_functions() {
        let connector = Connector::new("c");
        let m = mapping(&[
            ("hw.load", "percent2Ratio($1)"),
            ("hw.cpu.speed", "megaHertz2Hertz($2)"),
            ("hw.memory.size", "mebiByte2Byte($3)"),
            ("hw.present", "boolean($4)"),
            ("hw.ignored", "$5"),
        ]);
        let (metrics, errors) = map_metrics(&connector, &m, &row(&["50", "2400", "2", "true", ""]));
        assert!(errors.is_empty(), "{:?}", errors);

        let value = |key: &str| metrics.iter().find(|m| m.key == key).unwrap().value.clone();
        assert_eq!(value("hw.load"), MetricValue::Number(0.5));
        assert_eq!(value("hw.cpu.speed"), MetricValue::Number(2_400_000_000.0));
        assert_eq!(value("hw.memory.size"), MetricValue::Number(2_097_152.0));
        assert_eq!(value("hw.present"), MetricValue::Number(1.0));
        assert!(!metrics.iter().any(|m| m.key == "hw.ignored"));
    }

    #[test]
    fn test_not_numeric_is_an_error() {
        let connector = Connector::new("c");
        let (metrics, errors) = map_metrics(&connector, &mapping(&[("hw.temp", "$1")]), &row(&["hot"]));
        assert!(metrics.is_empty());
        assert!(matches!(errors[0], MappingError::NotNumeric { .. }));
    }

    #[test]
    fn test_state_set_validation() {
        let mut connector = Connector::new("c");
        connector.metrics.insert(
            "hw.status".into(),
            MetricDefinition {
                kind: MetricKind::StateSet,
                states: vec!["ok".into(), "degraded".into(), "failed".into()],
                ..MetricDefinition::default()
            },
        );
        let m = mapping(&[("hw.status", "$1")]);

        let (metrics, _) = map_metrics(&connector, &m, &row(&["OK"]));
        assert_eq!(metrics[0].value, MetricValue::State("ok".into()));

        let (_, errors) = map_metrics(&connector, &m, &row(&["melted"]));
        assert!(matches!(errors[0], MappingError::UnknownState { .. }));
    }

    #[test]
    fn test_rate_needs_two_samples() {
        let connector = Connector::new("c");
        let m = mapping(&[("hw.io", "rate($1)")]);
        let t0 = Utc::now();
        let mut monitor = Monitor::new("id", "disk", "c", BTreeMap::new(), t0);

        let (metrics, _) = map_metrics(&connector, &m, &row(&["1000"]));
        store_metric(&mut monitor, metrics[0].clone(), t0);
        assert!(monitor.metric("hw.io").is_none());
        monitor.save_metrics();

        let (metrics, _) = map_metrics(&connector, &m, &row(&["1600"]));
        store_metric(&mut monitor, metrics[0].clone(), t0 + chrono::Duration::seconds(60));
        assert_eq!(monitor.metric("hw.io").unwrap().value, MetricValue::Number(10.0));
        assert!(monitor.metric(&rate_key("hw.io")).unwrap().internal);
    }

    #[test]
    fn test_fake_counter_integrates_rate() {
        let connector = Connector::new("c");
        let m = mapping(&[("hw.energy", "fakeCounter($1)")]);
        let t0 = Utc::now();
        let mut monitor = Monitor::new("id", "enclosure", "c", BTreeMap::new(), t0);

        let (metrics, _) = map_metrics(&connector, &m, &row(&["100"]));
        store_metric(&mut monitor, metrics[0].clone(), t0);
        assert_eq!(monitor.metric("hw.energy").unwrap().value, MetricValue::Number(0.0));

        let (metrics, _) = map_metrics(&connector, &m, &row(&["100"]));
        store_metric(&mut monitor, metrics[0].clone(), t0 + chrono::Duration::seconds(10));
        assert_eq!(monitor.metric("hw.energy").unwrap().value, MetricValue::Number(1000.0));
    }
}
