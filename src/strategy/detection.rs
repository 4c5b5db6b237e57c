//! Connector detection.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;

use crate::connector::Connector;
use crate::diagnostic::{DiagnosticKind, Severity};

use super::{CycleReport, CycleScope};

/// Ids of the connectors applying to the host.
///
/// A host configured with `selected_connectors` skips criteria evaluation.
/// Otherwise every candidate (not excluded, matching the host type) is
/// evaluated, last-resort connectors only when nothing else matched, and
/// connectors superseded by another matched one are removed.
pub(super) async fn detect(scope: &CycleScope<'_>, report: &mut CycleReport) -> Vec<String> {
    let host = scope.host;
    let store = &scope.executor.store;

    if !host.selected_connectors.is_empty() {
        let mut ids = Vec::new();
        for id in &host.selected_connectors {
            if host.excludes(id) {
                continue;
            }
            match store.get(id) {
                Some(connector) => ids.push(connector.id.clone()),
                None => report.push(
                    Some(id),
                    DiagnosticKind::Detection,
                    Severity::Warn,
                    format!("selected connector '{}' is not loaded", id),
                ),
            }
        }
        return ids;
    }

    let (last_resort, regular): (Vec<&Arc<Connector>>, Vec<&Arc<Connector>>) = store
        .connectors()
        .filter(|c| !host.excludes(&c.id) && c.applies_to(host.host_type))
        .partition(|c| c.detection.on_last_resort);

    let mut matched = evaluate(scope, &regular, report).await;
    if matched.is_empty() && !last_resort.is_empty() {
        tracing::debug!(host = %host.id, "Trying last-resort connectors");
        matched = evaluate(scope, &last_resort, report).await;
    }
    apply_supersedes(matched)
}

/// Evaluate the criteria of every connector concurrently.
async fn evaluate<'c>(
    scope: &CycleScope<'_>,
    connectors: &[&'c Arc<Connector>],
    report: &mut CycleReport,
) -> Vec<&'c Connector> {
    let evaluator = scope.evaluator();
    let outcomes = join_all(
        connectors
            .iter()
            .map(|c| evaluator.evaluate_all(&c.detection.criteria)),
    )
    .await;

    let mut matched = Vec::new();
    for (&connector, outcome) in connectors.iter().zip(outcomes) {
        if outcome.matched {
            tracing::debug!(host = %scope.host.id, connector = %connector.id, "Connector matched");
            matched.push(Arc::as_ref(connector));
        } else {
            report.push(
                Some(&connector.id),
                DiagnosticKind::Detection,
                Severity::Debug,
                outcome
                    .failure_message()
                    .unwrap_or("connector has no criteria")
                    .to_string(),
            );
        }
    }
    matched
}

/// Drop matched connectors that another matched connector supersedes.
fn apply_supersedes(matched: Vec<&Connector>) -> Vec<String> {
    let superseded: HashSet<String> = matched
        .iter()
        .flat_map(|c| c.detection.supersedes.iter().map(|id| id.to_lowercase()))
        .collect();
    matched
        .into_iter()
        .filter(|c| !superseded.contains(&c.id.to_lowercase()))
        .map(|c| c.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostConfig, ProtocolConfig};
    use crate::connector::{ConnectorStore, Criterion, DeviceKind};
    use crate::protocol::{ProtocolClients, ProtocolKind};
    use crate::strategy::{HostContext, StrategyExecutor};
    use crate::testing::ScriptedClient;

    fn connector(id: &str, supersedes: &[&str]) -> Connector {
        let mut c = Connector::new(id);
        c.detection.supersedes = supersedes.iter().map(|s| s.to_string()).collect();
        c
    }

    fn device_connector(id: &str, keep_only: Vec<DeviceKind>) -> Connector {
        let mut c = Connector::new(id);
        c.detection.criteria = vec![Criterion::DeviceType {
            keep_only,
            exclude: vec![],
        }];
        c
    }

    fn snmp_connector(id: &str, oid: &str) -> Connector {
        let mut c = Connector::new(id);
        c.detection.criteria = vec![Criterion::SnmpGet {
            oid: oid.into(),
            expected_result: None,
            force_serialization: false,
        }];
        c
    }

    fn last_resort(mut c: Connector) -> Connector {
        c.detection.on_last_resort = true;
        c
    }

    fn host() -> HostConfig {
        HostConfig::new("h1", "server-01")
            .with_host_type(DeviceKind::Linux)
            .with_protocol(ProtocolKind::Snmp, ProtocolConfig::default())
    }

    async fn detect_once(
        connectors: Vec<Connector>,
        client: Arc<ScriptedClient>,
        host: HostConfig,
    ) -> CycleReport {
        let store = Arc::new(ConnectorStore::from_connectors(connectors));
        let executor = StrategyExecutor::new(
            store,
            ProtocolClients::new().with_client(ProtocolKind::Snmp, client),
        );
        let mut ctx = HostContext::new(host);
        executor.run_cycle(&mut ctx).await
    }

    // ==================== Last resort ====================

    #[tokio::test]
    async fn test_last_resort_skipped_when_regular_matches() {
        let client = Arc::new(ScriptedClient::new().respond("snmpGet 1.3.6.1.4.1", "agent"));
        let report = detect_once(
            vec![
                device_connector("Linux", vec![DeviceKind::Linux]),
                last_resort(snmp_connector("GenericSnmp", "1.3.6.1.4.1")),
            ],
            client.clone(),
            host(),
        )
        .await;

        assert_eq!(report.detection, Some(vec!["Linux".to_string()]));
        assert_eq!(client.call_count("snmpGet 1.3.6.1.4.1"), 0);
    }

    #[tokio::test]
    async fn test_last_resort_kept_when_nothing_else_matches() {
        let client = Arc::new(ScriptedClient::new().respond("snmpGet 1.3.6.1.4.1", "agent"));
        let report = detect_once(
            vec![
                device_connector("Windows", vec![DeviceKind::Windows]),
                last_resort(snmp_connector("GenericSnmp", "1.3.6.1.4.1")),
            ],
            client.clone(),
            host(),
        )
        .await;

        assert_eq!(report.detection, Some(vec!["GenericSnmp".to_string()]));
        assert_eq!(client.call_count("snmpGet 1.3.6.1.4.1"), 1);
    }

    #[tokio::test]
    async fn test_last_resort_never_supersedes_a_match() {
        let mut fallback = last_resort(device_connector("Fallback", vec![]));
        fallback.detection.supersedes = vec!["Linux".to_string()];
        let report = detect_once(
            vec![device_connector("Linux", vec![DeviceKind::Linux]), fallback],
            Arc::new(ScriptedClient::new()),
            host(),
        )
        .await;

        assert_eq!(report.detection, Some(vec!["Linux".to_string()]));
    }

    // ==================== Selected and excluded connectors ====================

    #[tokio::test]
    async fn test_selected_connectors_skip_criteria() {
        let client = Arc::new(ScriptedClient::new().fail("snmpGet 1.3.6.1.4.1", "unreachable"));
        let report = detect_once(
            vec![
                snmp_connector("GenericSnmp", "1.3.6.1.4.1"),
                device_connector("Linux", vec![DeviceKind::Linux]),
            ],
            client.clone(),
            host().with_selected_connectors(vec!["GenericSnmp".into(), "Missing".into()]),
        )
        .await;

        assert_eq!(report.detection, Some(vec!["GenericSnmp".to_string()]));
        assert_eq!(client.call_count("snmpGet 1.3.6.1.4.1"), 0);
        let warnings: Vec<_> = report.diagnostics_of(DiagnosticKind::Detection).collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].connector_id.as_deref(), Some("Missing"));
        assert_eq!(warnings[0].severity, Severity::Warn);
    }

    #[tokio::test]
    async fn test_excluded_connectors_are_dropped() {
        let client = Arc::new(ScriptedClient::new().respond("snmpGet 1.3.6.1.4.1", "agent"));
        let report = detect_once(
            vec![
                snmp_connector("GenericSnmp", "1.3.6.1.4.1"),
                device_connector("Linux", vec![DeviceKind::Linux]),
            ],
            client.clone(),
            host().with_excluded_connectors(vec!["genericsnmp".into()]),
        )
        .await;
        assert_eq!(report.detection, Some(vec!["Linux".to_string()]));
        assert_eq!(client.call_count("snmpGet 1.3.6.1.4.1"), 0);

        let report = detect_once(
            vec![device_connector("A", vec![]), device_connector("B", vec![])],
            Arc::new(ScriptedClient::new()),
            host()
                .with_selected_connectors(vec!["A".into(), "B".into()])
                .with_excluded_connectors(vec!["B".into()]),
        )
        .await;
        assert_eq!(report.detection, Some(vec!["A".to_string()]));
    }

    // ==================== Supersedes ====================

    #[test]
    fn test_supersedes_among_matched() {
        let generic = connector("GenericSnmp", &[]);
        let dell = connector("DellOpenManage", &["genericsnmp"]);
        let other = connector("Other", &["NotMatched"]);
        let ids = apply_supersedes(vec![&generic, &dell, &other]);
        assert_eq!(ids, vec!["DellOpenManage".to_string(), "Other".to_string()]);
    }
}
