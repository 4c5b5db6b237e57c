//! Metric export.
//!
//! After each cycle the engine hands the metrics refreshed during that cycle
//! to a [`MetricExporter`]. Exporters are external collaborators; two simple
//! ones are provided: [`LogExporter`] and [`ChannelExporter`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::connector::{Connector, MetricKind};
use crate::telemetry::{MetricValue, Monitor};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export failed: {0}")]
    Failed(String),

    #[error("exporter is closed")]
    Closed,
}

/// One exported metric value with its monitor context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub host_id: String,
    pub connector_id: String,
    pub monitor_id: String,
    pub monitor_type: String,
    pub name: String,
    pub value: MetricValue,
    /// Monitor attributes overlaid with the metric's own attributes.
    pub attributes: BTreeMap<String, String>,
    pub unit: Option<String>,
    pub kind: MetricKind,
    pub collect_time: DateTime<Utc>,
}

impl MetricSnapshot {
    /// Snapshots of the metrics of `monitor` refreshed this cycle. Internal
    /// metrics are skipped.
    pub fn from_monitor(host_id: &str, monitor: &Monitor, connector: Option<&Connector>) -> Vec<Self> {
        monitor
            .metrics
            .values()
            .filter(|metric| metric.updated && !metric.internal)
            .map(|metric| {
                let definition = connector.and_then(|c| c.metric_definition(&metric.name));
                let mut attributes = monitor.attributes.clone();
                attributes.extend(metric.attributes.clone());
                Self {
                    host_id: host_id.to_string(),
                    connector_id: monitor.connector_id.clone(),
                    monitor_id: monitor.id.clone(),
                    monitor_type: monitor.monitor_type.clone(),
                    name: metric.name.clone(),
                    value: metric.value.clone(),
                    attributes,
                    unit: definition.and_then(|d| d.unit.clone()),
                    kind: definition.map(|d| d.kind).unwrap_or_default(),
                    collect_time: metric.collect_time,
                }
            })
            .collect()
    }
}

/// Receives the metrics of each completed host cycle.
#[async_trait::async_trait]
pub trait MetricExporter: Send + Sync {
    async fn export(&self, host_id: &str, snapshots: Vec<MetricSnapshot>) -> Result<(), ExportError>;
}

/// Writes metrics to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogExporter;

#[async_trait::async_trait]
impl MetricExporter for LogExporter {
    async fn export(&self, host_id: &str, snapshots: Vec<MetricSnapshot>) -> Result<(), ExportError> {
        for snapshot in &snapshots {
            tracing::debug!(
                host = %host_id,
                monitor = %snapshot.monitor_id,
                metric = %snapshot.name,
                value = %snapshot.value,
                "Metric"
            );
        }
        tracing::info!(host = %host_id, metrics = snapshots.len(), "Metrics exported");
        Ok(())
    }
}

/// Forwards each cycle's metrics over a channel.
#[derive(Debug, Clone)]
pub struct ChannelExporter {
    tx: mpsc::UnboundedSender<(String, Vec<MetricSnapshot>)>,
}

impl ChannelExporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Vec<MetricSnapshot>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl MetricExporter for ChannelExporter {
    async fn export(&self, host_id: &str, snapshots: Vec<MetricSnapshot>) -> Result<(), ExportError> {
        self.tx
            .send((host_id.to_string(), snapshots))
            .map_err(|_| ExportError::Closed)
    }
}
