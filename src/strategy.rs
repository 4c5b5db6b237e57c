//! Strategy executor.
//!
//! Drives one host through a cycle: Detection decides which connectors
//! apply, Discovery turns source rows into monitors, Collection refreshes
//! their metrics. Detection runs on the first cycle, when re-detection is
//! requested, and every `detection_cycle` cycles while nothing matched.
//!
//! A cycle always runs to completion. Failed sources, computes and mappings
//! are recorded as diagnostics in the [`CycleReport`]; once the job timeout
//! has elapsed, remaining protocol calls fail immediately and the cycle
//! finishes with the tables it already has.

mod collect;
mod detection;
mod discovery;
mod mapping;

pub use mapping::{MappingError, MappingFunction};

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use regex::Regex;
use strum_macros::{AsRefStr, Display};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::compute::{AwkExecutor, SystemAwk};
use crate::config::{DEFAULT_DETECTION_CYCLE, DEFAULT_JOB_TIMEOUT, HostConfig};
use crate::connector::{Connector, ConnectorStore, Source};
use crate::criterion::CriterionEvaluator;
use crate::diagnostic::{Diagnostic, DiagnosticKind, Severity};
use crate::export::MetricSnapshot;
use crate::processor::{SourceProcessor, SourceRun};
use crate::protocol::ProtocolClients;
use crate::resolver::{ExecutionPlan, SourceGraph};
use crate::telemetry::{ConnectorNamespace, MetricValue, Monitor, TelemetryState};

/// Monitor type of the per-connector status monitor.
pub const CONNECTOR_MONITOR_TYPE: &str = "connector";
/// State metric of the connector monitor.
pub const CONNECTOR_STATUS_METRIC: &str = "connector.status";

/// Where a host is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum HostPhase {
    #[default]
    Idle,
    Detecting,
    Discovering,
    Collecting,
    Exporting,
}

/// Cycle cadence and limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategySettings {
    /// Run Discovery every N cycles.
    pub discovery_cycle: u64,
    /// Retry Detection every N cycles while no connector matched.
    pub detection_cycle: u64,
    /// Evict a stale monitor after N missed discoveries.
    pub stale_eviction_cycles: Option<u32>,
    pub job_timeout: Duration,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            discovery_cycle: 1,
            detection_cycle: DEFAULT_DETECTION_CYCLE,
            stale_eviction_cycles: None,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }
}

/// Everything retained for one host between cycles.
#[derive(Debug)]
pub struct HostContext {
    host: HostConfig,
    telemetry: TelemetryState,
    matched: Vec<String>,
    phase: HostPhase,
    cycle: u64,
    detection_pending: bool,
    last_detection: Option<u64>,
    last_discovery: Option<u64>,
    /// Token serializing device access that must not interleave.
    serialization: Mutex<()>,
}

impl HostContext {
    pub fn new(host: HostConfig) -> Self {
        Self {
            telemetry: TelemetryState::new(host.id.clone()),
            host,
            matched: Vec::new(),
            phase: HostPhase::Idle,
            cycle: 0,
            detection_pending: true,
            last_detection: None,
            last_discovery: None,
            serialization: Mutex::new(()),
        }
    }

    pub fn host(&self) -> &HostConfig {
        &self.host
    }

    pub fn telemetry(&self) -> &TelemetryState {
        &self.telemetry
    }

    /// Ids of the connectors matched by the last detection.
    pub fn matched_connectors(&self) -> &[String] {
        &self.matched
    }

    pub fn phase(&self) -> HostPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: HostPhase) {
        self.phase = phase;
    }

    /// Number of cycles started so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Run Detection again on the next cycle.
    pub fn request_redetection(&mut self) {
        self.detection_pending = true;
    }

    fn detection_due(&self, settings: &StrategySettings) -> bool {
        self.detection_pending
            || (self.matched.is_empty()
                && self
                    .last_detection
                    .is_none_or(|last| self.cycle - last >= settings.detection_cycle))
    }

    fn discovery_due(&self, settings: &StrategySettings) -> bool {
        self.last_discovery
            .is_none_or(|last| self.cycle - last >= settings.discovery_cycle)
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub host_id: String,
    pub cycle: u64,
    /// Set when Detection ran: the connectors it matched.
    pub detection: Option<Vec<String>>,
    pub matched_connectors: Vec<String>,
    pub discovered: bool,
    pub collected: bool,
    /// Metrics refreshed during the cycle.
    pub snapshots: Vec<MetricSnapshot>,
    pub diagnostics: Vec<Diagnostic>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CycleReport {
    pub fn diagnostics_of(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.kind == kind)
    }

    pub(crate) fn push(&mut self, connector_id: Option<&str>, kind: DiagnosticKind, severity: Severity, message: String) {
        let mut diagnostic = Diagnostic::new(self.host_id.clone(), kind, severity, message);
        if let Some(id) = connector_id {
            diagnostic = diagnostic.with_connector(id);
        }
        self.diagnostics.push(diagnostic);
    }
}

/// Sources run and failed for one connector during a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SourceStats {
    ran: usize,
    failed: usize,
}

impl std::ops::AddAssign for SourceStats {
    fn add_assign(&mut self, other: Self) {
        self.ran += other.ran;
        self.failed += other.failed;
    }
}

/// Shared, read-only view of one cycle.
struct CycleScope<'a> {
    executor: &'a StrategyExecutor,
    host: &'a HostConfig,
    serialization: &'a Mutex<()>,
    deadline: Instant,
    now: DateTime<Utc>,
}

impl<'a> CycleScope<'a> {
    fn processor<'c>(&'c self, connector: &'c Connector) -> SourceProcessor<'c> {
        SourceProcessor {
            host: self.host,
            connector,
            clients: &self.executor.clients,
            awk: self.executor.awk.as_ref(),
            serialization: self.serialization,
            deadline: Some(self.deadline),
        }
    }

    fn evaluator(&self) -> CriterionEvaluator<'a> {
        CriterionEvaluator {
            host: self.host,
            clients: &self.executor.clients,
            serialization: self.serialization,
            deadline: Some(self.deadline),
        }
    }

    /// Plan `roots` and whatever they depend on, leaving out sources for
    /// which `skip` is true.
    fn plan<'c>(
        &self,
        connector: &'c Connector,
        roots: &[&str],
        skip: impl Fn(&str) -> bool,
        report: &mut CycleReport,
    ) -> Option<ExecutionPlan<'c>> {
        match SourceGraph::new(connector.sources()).and_then(|graph| graph.plan_for(roots.iter().copied(), skip)) {
            Ok(plan) => Some(plan),
            Err(e) => {
                report.push(
                    Some(&connector.id),
                    DiagnosticKind::Source,
                    Severity::Error,
                    format!("cannot order sources: {}", e),
                );
                None
            }
        }
    }

    /// Execute the plan stage by stage, storing every table (empty for failed
    /// sources) in `namespace`. Sources of a stage run concurrently.
    /// `attributes` fills `${attribute::NAME}` references.
    async fn run_sources(
        &self,
        connector: &Connector,
        plan: &ExecutionPlan<'_>,
        namespace: &mut ConnectorNamespace,
        attributes: Option<&BTreeMap<String, String>>,
        report: &mut CycleReport,
    ) -> SourceStats {
        let mut stats = SourceStats::default();
        let processor = self.processor(connector);

        for stage in plan.stages() {
            let prepared: Vec<Cow<'_, Source>> = stage
                .iter()
                .map(|source| match attributes {
                    Some(attributes) => {
                        Cow::Owned(source.substituted(&|text| replace_attribute_refs(text, attributes)))
                    }
                    None => Cow::Borrowed(*source),
                })
                .collect();

            let tables: &ConnectorNamespace = namespace;
            let runs = join_all(prepared.iter().map(|source| processor.run(source, tables))).await;

            for run in runs {
                stats.ran += 1;
                if record_run(report, &connector.id, &run) {
                    stats.failed += 1;
                }
                namespace.add_source_table(run.key, run.table);
            }
        }
        stats
    }
}

/// Record the diagnostics of a source run. Returns true when the source
/// failed.
fn record_run(report: &mut CycleReport, connector_id: &str, run: &SourceRun) -> bool {
    for failure in &run.compute_failures {
        report.push(
            Some(connector_id),
            DiagnosticKind::Compute,
            Severity::Warn,
            format!(
                "source '{}': compute #{} ({}) skipped: {}",
                run.key, failure.index, failure.compute, failure.error
            ),
        );
    }
    match &run.error {
        Some(error) => {
            let kind = if error.is_timeout() {
                DiagnosticKind::Timeout
            } else {
                DiagnosticKind::Source
            };
            report.push(
                Some(connector_id),
                kind,
                Severity::Warn,
                format!("source '{}': {}", run.key, error),
            );
            true
        }
        None => false,
    }
}

fn attribute_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{attribute::([^}]+)\}").expect("valid attribute regex"))
}

/// Replace `${attribute::NAME}` with the monitor's attribute values.
fn replace_attribute_refs(text: &str, attributes: &BTreeMap<String, String>) -> String {
    attribute_ref_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            attributes.get(caps[1].trim()).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Runs host cycles against a connector store.
pub struct StrategyExecutor {
    store: Arc<ConnectorStore>,
    clients: ProtocolClients,
    awk: Arc<dyn AwkExecutor>,
    settings: StrategySettings,
}

impl fmt::Debug for StrategyExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyExecutor")
            .field("connectors", &self.store.len())
            .field("clients", &self.clients)
            .field("settings", &self.settings)
            .finish()
    }
}

impl StrategyExecutor {
    pub fn new(store: Arc<ConnectorStore>, clients: ProtocolClients) -> Self {
        Self {
            store,
            clients,
            awk: Arc::new(SystemAwk::default()),
            settings: StrategySettings::default(),
        }
    }

    pub fn with_awk(mut self, awk: Arc<dyn AwkExecutor>) -> Self {
        self.awk = awk;
        self
    }

    pub fn with_settings(mut self, settings: StrategySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &ConnectorStore {
        &self.store
    }

    pub fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    /// Run one Detect → Discover → Collect cycle for the host.
    pub async fn run_cycle(&self, ctx: &mut HostContext) -> CycleReport {
        let started = std::time::Instant::now();
        ctx.cycle += 1;
        ctx.telemetry.begin_cycle();

        let detect = ctx.detection_due(&self.settings);
        let discovery_scheduled = ctx.discovery_due(&self.settings);
        let timeout = ctx.host.job_timeout.unwrap_or(self.settings.job_timeout);

        let HostContext {
            host,
            telemetry,
            matched,
            phase,
            cycle,
            detection_pending,
            last_detection,
            last_discovery,
            serialization,
        } = ctx;

        let mut report = CycleReport {
            host_id: host.id.clone(),
            cycle: *cycle,
            ..CycleReport::default()
        };
        let scope = CycleScope {
            executor: self,
            host,
            serialization,
            deadline: Instant::now() + timeout,
            now: Utc::now(),
        };

        if detect {
            *phase = HostPhase::Detecting;
            let ids = detection::detect(&scope, &mut report).await;
            *detection_pending = false;
            *last_detection = Some(*cycle);
            telemetry.retain_connectors(&ids);
            if ids.is_empty() {
                tracing::warn!(host = %scope.host.id, "No connector applies to host");
                report.push(
                    None,
                    DiagnosticKind::NoConnector,
                    Severity::Warn,
                    "no connector applicable".to_string(),
                );
            } else {
                tracing::info!(host = %scope.host.id, connectors = ?ids, "Connectors detected");
            }
            report.detection = Some(ids.clone());
            *matched = ids;
        }
        report.matched_connectors = matched.clone();

        let connectors: Vec<Arc<Connector>> = matched
            .iter()
            .filter_map(|id| self.store.get(id).cloned())
            .collect();

        if !connectors.is_empty() {
            let mut stats: HashMap<String, SourceStats> = HashMap::new();

            if detect || discovery_scheduled {
                *phase = HostPhase::Discovering;
                for connector in &connectors {
                    let s = discovery::discover(&scope, connector, telemetry, &mut report).await;
                    *stats.entry(connector.id.clone()).or_default() += s;
                }
                *last_discovery = Some(*cycle);
                report.discovered = true;
            }

            *phase = HostPhase::Collecting;
            for connector in &connectors {
                let s = collect::collect(&scope, connector, telemetry, &mut report).await;
                *stats.entry(connector.id.clone()).or_default() += s;
            }
            report.collected = true;

            for connector in &connectors {
                let s = stats.get(&connector.id).copied().unwrap_or_default();
                update_connector_monitor(&scope, connector, telemetry, s);
            }
        }

        for monitor in telemetry.monitors() {
            let connector = self.store.get(&monitor.connector_id).map(Arc::as_ref);
            report
                .snapshots
                .extend(MetricSnapshot::from_monitor(&scope.host.id, monitor, connector));
        }
        telemetry.save_metrics();

        if Instant::now() >= scope.deadline {
            report.timed_out = true;
            report.push(
                None,
                DiagnosticKind::Timeout,
                Severity::Error,
                format!("cycle exceeded the job timeout of {:?}", timeout),
            );
        }

        *phase = HostPhase::Idle;
        report.duration = started.elapsed();
        tracing::info!(
            host = %report.host_id,
            cycle = report.cycle,
            connectors = report.matched_connectors.len(),
            monitors = telemetry.monitor_count(),
            metrics = report.snapshots.len(),
            diagnostics = report.diagnostics.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Cycle complete"
        );
        report
    }
}

/// Refresh the connector's status monitor: `failed` when every source it
/// ran this cycle failed, `ok` otherwise.
fn update_connector_monitor(
    scope: &CycleScope<'_>,
    connector: &Connector,
    telemetry: &mut TelemetryState,
    stats: SourceStats,
) {
    let status = if stats.ran > 0 && stats.failed == stats.ran {
        "failed"
    } else {
        "ok"
    };
    let id = Monitor::build_id(
        &scope.host.id,
        &connector.id,
        CONNECTOR_MONITOR_TYPE,
        &[connector.id.as_str()],
    );
    let attributes = BTreeMap::from([
        ("id".to_string(), connector.id.clone()),
        ("name".to_string(), connector.display_name().to_string()),
    ]);
    let monitor = telemetry.upsert_monitor(Monitor::new(
        id,
        CONNECTOR_MONITOR_TYPE,
        connector.id.clone(),
        attributes,
        scope.now,
    ));
    monitor.set_metric(
        CONNECTOR_STATUS_METRIC,
        MetricValue::State(status.to_string()),
        BTreeMap::new(),
        scope.now,
    );
}
