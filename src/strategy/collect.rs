//! Metric collection for known monitors.

use std::collections::BTreeMap;

use crate::connector::{Collect, CollectKind, Connector, MonitorJob};
use crate::diagnostic::{DiagnosticKind, Severity};
use crate::telemetry::{Monitor, TelemetryState};

use super::mapping::{map_attributes, map_metrics, store_metric};
use super::{CycleReport, CycleScope, SourceStats};

/// Run the collect of every monitor job of `connector`.
pub(super) async fn collect(
    scope: &CycleScope<'_>,
    connector: &Connector,
    telemetry: &mut TelemetryState,
    report: &mut CycleReport,
) -> SourceStats {
    let mut stats = SourceStats::default();
    for job in &connector.monitors {
        let Some(collect) = &job.collect else {
            continue;
        };
        stats += match collect.kind {
            CollectKind::MultiInstance => {
                collect_multi(scope, connector, job, collect, telemetry, report).await
            }
            CollectKind::MonoInstance => {
                collect_mono(scope, connector, job, collect, telemetry, report).await
            }
        };
    }
    stats
}

fn collect_roots(collect: &Collect) -> Vec<&str> {
    let mut roots: Vec<&str> = collect.sources.iter().map(|s| s.key.as_str()).collect();
    roots.push(collect.mapping.source_key());
    roots
}

fn push_mapping_error(
    report: &mut CycleReport,
    connector: &Connector,
    job: &MonitorJob,
    error: impl std::fmt::Display,
) {
    report.push(
        Some(&connector.id),
        DiagnosticKind::Mapping,
        Severity::Warn,
        format!("{} collect: {}", job.monitor_type, error),
    );
}

/// One pass of the sources; each row is matched to a known monitor through
/// the job's key attributes.
async fn collect_multi(
    scope: &CycleScope<'_>,
    connector: &Connector,
    job: &MonitorJob,
    collect: &Collect,
    telemetry: &mut TelemetryState,
    report: &mut CycleReport,
) -> SourceStats {
    let roots = collect_roots(collect);
    let namespace = telemetry.get_or_create_namespace(&connector.id);
    let Some(plan) = scope.plan(connector, &roots, |key| namespace.is_fresh(key), report) else {
        return SourceStats::default();
    };
    let stats = scope
        .run_sources(connector, &plan, namespace, None, report)
        .await;
    let table = namespace
        .get_source_table(collect.mapping.source_key())
        .cloned()
        .unwrap_or_default();

    let mut updated = 0usize;
    for row in table.rows() {
        let attributes = match map_attributes(&collect.mapping, row) {
            Ok(attributes) => attributes,
            Err(e) => {
                push_mapping_error(report, connector, job, e);
                continue;
            }
        };
        let key_values: Vec<&str> = job
            .keys
            .iter()
            .map(|key| attributes.get(key).map(String::as_str).unwrap_or(""))
            .collect();
        let id = Monitor::build_id(&scope.host.id, &connector.id, &job.monitor_type, &key_values);

        let Some(monitor) = telemetry.monitor_mut(&id) else {
            tracing::debug!(host = %scope.host.id, monitor = %id, "Collected row matches no known monitor");
            continue;
        };
        monitor.attributes.extend(attributes);

        let (metrics, errors) = map_metrics(connector, &collect.mapping, row);
        for metric in metrics {
            store_metric(monitor, metric, scope.now);
        }
        for e in errors {
            push_mapping_error(report, connector, job, e);
        }
        updated += 1;
    }

    tracing::debug!(
        host = %scope.host.id,
        connector = %connector.id,
        monitor_type = %job.monitor_type,
        updated,
        "Collect complete"
    );
    stats
}

/// The sources run once per monitor, with the monitor's attributes
/// substituted; the first row of the mapping table belongs to that monitor.
async fn collect_mono(
    scope: &CycleScope<'_>,
    connector: &Connector,
    job: &MonitorJob,
    collect: &Collect,
    telemetry: &mut TelemetryState,
    report: &mut CycleReport,
) -> SourceStats {
    let targets: Vec<(String, BTreeMap<String, String>)> = telemetry
        .monitors_of(&connector.id, &job.monitor_type)
        .filter(|monitor| !monitor.stale)
        .map(|monitor| (monitor.id.clone(), monitor.attributes.clone()))
        .collect();

    let roots = collect_roots(collect);
    let per_monitor: Vec<&str> = collect.sources.iter().map(|s| s.key.as_str()).collect();
    let mut stats = SourceStats::default();

    for (id, attributes) in targets {
        let namespace = telemetry.get_or_create_namespace(&connector.id);
        let skip = |key: &str| !per_monitor.iter().any(|k| *k == key) && namespace.is_fresh(key);
        let Some(plan) = scope.plan(connector, &roots, skip, report) else {
            return stats;
        };
        stats += scope
            .run_sources(connector, &plan, namespace, Some(&attributes), report)
            .await;
        let row = namespace
            .get_source_table(collect.mapping.source_key())
            .and_then(|table| table.rows().first().cloned());

        let (Some(row), Some(monitor)) = (row, telemetry.monitor_mut(&id)) else {
            tracing::debug!(host = %scope.host.id, monitor = %id, "No collect data for monitor");
            continue;
        };
        let (metrics, errors) = map_metrics(connector, &collect.mapping, &row);
        for metric in metrics {
            store_metric(monitor, metric, scope.now);
        }
        for e in errors {
            push_mapping_error(report, connector, job, e);
        }
    }
    stats
}
