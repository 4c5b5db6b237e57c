//! Monitor discovery.

use std::collections::HashSet;

use crate::connector::{Connector, Discovery, MonitorJob};
use crate::diagnostic::{DiagnosticKind, Severity};
use crate::telemetry::{Monitor, TelemetryState};

use super::mapping::{map_attributes, map_metrics, store_metric};
use super::{CycleReport, CycleScope, SourceStats};

/// Run the discovery of every monitor job of `connector`.
pub(super) async fn discover(
    scope: &CycleScope<'_>,
    connector: &Connector,
    telemetry: &mut TelemetryState,
    report: &mut CycleReport,
) -> SourceStats {
    let mut stats = SourceStats::default();
    for job in &connector.monitors {
        if let Some(discovery) = &job.discovery {
            stats += discover_job(scope, connector, job, discovery, telemetry, report).await;
        }
    }
    stats
}

async fn discover_job(
    scope: &CycleScope<'_>,
    connector: &Connector,
    job: &MonitorJob,
    discovery: &Discovery,
    telemetry: &mut TelemetryState,
    report: &mut CycleReport,
) -> SourceStats {
    let mapping_key = discovery.mapping.source_key();
    let mut roots: Vec<&str> = discovery.sources.iter().map(|s| s.key.as_str()).collect();
    roots.push(mapping_key);

    let namespace = telemetry.get_or_create_namespace(&connector.id);
    let Some(plan) = scope.plan(connector, &roots, |key| namespace.is_fresh(key), report) else {
        return SourceStats::default();
    };
    let stats = scope
        .run_sources(connector, &plan, namespace, None, report)
        .await;
    let table = namespace
        .get_source_table(mapping_key)
        .cloned()
        .unwrap_or_default();

    let mut seen = HashSet::new();
    for row in table.rows() {
        let attributes = match map_attributes(&discovery.mapping, row) {
            Ok(attributes) => attributes,
            Err(e) => {
                report.push(
                    Some(&connector.id),
                    DiagnosticKind::Mapping,
                    Severity::Warn,
                    format!("{} discovery: {}", job.monitor_type, e),
                );
                continue;
            }
        };

        let key_values: Vec<&str> = job
            .keys
            .iter()
            .map(|key| attributes.get(key).map(String::as_str).unwrap_or(""))
            .collect();
        if key_values.iter().all(|value| value.is_empty()) {
            report.push(
                Some(&connector.id),
                DiagnosticKind::Mapping,
                Severity::Warn,
                format!(
                    "{} discovery: row has no value for key attributes {:?}",
                    job.monitor_type, job.keys
                ),
            );
            continue;
        }
        let id = Monitor::build_id(&scope.host.id, &connector.id, &job.monitor_type, &key_values);

        let (metrics, errors) = map_metrics(connector, &discovery.mapping, row);
        let monitor = telemetry.upsert_monitor(Monitor::new(
            id.clone(),
            job.monitor_type.clone(),
            connector.id.clone(),
            attributes,
            scope.now,
        ));
        for metric in metrics {
            store_metric(monitor, metric, scope.now);
        }
        for e in errors {
            report.push(
                Some(&connector.id),
                DiagnosticKind::Mapping,
                Severity::Warn,
                format!("{} discovery: {}", job.monitor_type, e),
            );
        }
        seen.insert(id);
    }

    // A failed discovery source says nothing about which monitors are gone.
    if stats.failed == 0 {
        mark_missing(scope, connector, job, &seen, telemetry);
    }

    tracing::debug!(
        host = %scope.host.id,
        connector = %connector.id,
        monitor_type = %job.monitor_type,
        discovered = seen.len(),
        "Discovery complete"
    );
    stats
}

/// Flag known monitors absent from this discovery as stale, evicting them
/// after the configured number of misses.
fn mark_missing(
    scope: &CycleScope<'_>,
    connector: &Connector,
    job: &MonitorJob,
    seen: &HashSet<String>,
    telemetry: &mut TelemetryState,
) {
    let eviction = scope.executor.settings.stale_eviction_cycles;
    let missing: Vec<String> = telemetry
        .monitors_of(&connector.id, &job.monitor_type)
        .filter(|monitor| !seen.contains(&monitor.id))
        .map(|monitor| monitor.id.clone())
        .collect();

    for id in missing {
        let Some(monitor) = telemetry.monitor_mut(&id) else {
            continue;
        };
        let missed = monitor.mark_missed();
        if eviction.is_some_and(|limit| missed >= limit) {
            telemetry.remove_monitor(&id);
            tracing::info!(host = %scope.host.id, monitor = %id, missed, "Stale monitor evicted");
        } else {
            tracing::debug!(host = %scope.host.id, monitor = %id, missed, "Monitor not rediscovered");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::{HostConfig, ProtocolConfig};
    use crate::connector::{ConnectorStore, Criterion, Mapping, Source, SourceKind};
    use crate::protocol::{ProtocolClients, ProtocolKind};
    use crate::strategy::{HostContext, StrategyExecutor, StrategySettings};
    use crate::testing::SequenceClient;

    use super::*;

    fn disk_connector() -> Connector {
        let mut connector = Connector::new("Disks");
        connector.detection.criteria = vec![Criterion::DeviceType {
            keep_only: vec![],
            exclude: vec![],
        }];
        connector.monitors.push(MonitorJob::new("disk").with_discovery(Discovery {
            sources: vec![Source::new(
                "disks",
                SourceKind::SnmpTable {
                    oid: "1.3.6.1.4.1.2021.13.15".to_string(),
                    select_columns: vec![],
                },
            )],
            mapping: Mapping {
                source: "${source::disks}".to_string(),
                attributes: [("id".to_string(), "$1".to_string())].into(),
                metrics: Default::default(),
            },
        }));
        connector
    }

    fn executor(client: SequenceClient, stale_eviction_cycles: Option<u32>) -> StrategyExecutor {
        let store = Arc::new(ConnectorStore::from_connectors([disk_connector()]));
        let clients = ProtocolClients::new().with_client(ProtocolKind::Snmp, Arc::new(client));
        StrategyExecutor::new(store, clients).with_settings(StrategySettings {
            stale_eviction_cycles,
            ..StrategySettings::default()
        })
    }

    fn host_context() -> HostContext {
        HostContext::new(
            HostConfig::new("h1", "server-01")
                .with_protocol(ProtocolKind::Snmp, ProtocolConfig::default()),
        )
    }

    fn disk<'c>(ctx: &'c HostContext, key: &str) -> Option<&'c Monitor> {
        ctx.telemetry()
            .monitor(&Monitor::build_id("h1", "Disks", "disk", &[key]))
    }

    // ==================== Stale monitors ====================

    #[tokio::test]
    async fn test_missing_monitor_marked_stale_and_kept() {
        let client = SequenceClient::new()
            .then_rows(&[&["sda"], &["sdb"]])
            .then_rows(&[&["sda"]])
            .then_rows(&[&["sda"], &["sdb"]]);
        let executor = executor(client, None);
        let mut ctx = host_context();

        executor.run_cycle(&mut ctx).await;
        assert!(!disk(&ctx, "sdb").unwrap().stale);

        executor.run_cycle(&mut ctx).await;
        let sdb = disk(&ctx, "sdb").unwrap();
        assert!(sdb.stale);
        assert_eq!(sdb.missed_discoveries, 1);
        assert!(!disk(&ctx, "sda").unwrap().stale);

        executor.run_cycle(&mut ctx).await;
        let sdb = disk(&ctx, "sdb").unwrap();
        assert!(!sdb.stale);
        assert_eq!(sdb.missed_discoveries, 0);
    }

    #[tokio::test]
    async fn test_stale_monitor_evicted_after_limit() {
        let client = SequenceClient::new()
            .then_rows(&[&["sda"], &["sdb"]])
            .then_rows(&[&["sda"]])
            .then_rows(&[&["sda"]]);
        let executor = executor(client, Some(2));
        let mut ctx = host_context();

        executor.run_cycle(&mut ctx).await;
        executor.run_cycle(&mut ctx).await;
        assert!(disk(&ctx, "sdb").unwrap().stale);

        executor.run_cycle(&mut ctx).await;
        assert!(disk(&ctx, "sdb").is_none());
        assert!(disk(&ctx, "sda").is_some());
    }

    #[tokio::test]
    async fn test_failed_discovery_marks_nothing_missing() {
        let client = SequenceClient::new()
            .then_rows(&[&["sda"], &["sdb"]])
            .then_fail("agent not responding");
        let executor = executor(client, Some(1));
        let mut ctx = host_context();

        executor.run_cycle(&mut ctx).await;
        let report = executor.run_cycle(&mut ctx).await;
        assert!(report.discovered);

        for key in ["sda", "sdb"] {
            let monitor = disk(&ctx, key).unwrap();
            assert!(!monitor.stale, "{} marked stale", key);
            assert_eq!(monitor.missed_discoveries, 0);
        }
    }
}
