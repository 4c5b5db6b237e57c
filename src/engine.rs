//! Host scheduling and the worker pool.
//!
//! Uses `tokio-cron-scheduler` for job scheduling, one job per host. A
//! semaphore bounds how many host cycles run at once. Each host's context
//! sits behind its own mutex, so two cycles of the same host never overlap:
//! a scheduled tick that finds the previous cycle still running is skipped.

mod schedule;

pub use schedule::{MIN_INTERVAL, Schedule};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, Semaphore};
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::config::{AppConfig, HostConfig};
use crate::connector::ConnectorStore;
use crate::diagnostic::{DiagnosticKind, Severity};
use crate::export::MetricExporter;
use crate::protocol::ProtocolClients;
use crate::strategy::{CycleReport, HostContext, HostPhase, StrategyExecutor};

/// Default timeout for graceful shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown host: {0}")]
    UnknownHost(String),
}

/// Scheduled job of a host.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: uuid::Uuid,
    /// Schedule description.
    pub schedule: String,
}

/// A registered host as reported by [`Engine::list_hosts`].
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub id: String,
    pub job: Option<JobInfo>,
}

/// Resizable bound on concurrent host cycles.
#[derive(Debug)]
struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: std::sync::Mutex<usize>,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size: std::sync::Mutex::new(size),
        }
    }

    fn size(&self) -> usize {
        self.size.lock().map(|s| *s).unwrap_or(0)
    }

    /// Grow immediately; shrink as running cycles release their permits.
    fn resize(&self, new_size: usize) -> usize {
        let new_size = new_size.max(1);
        let Ok(mut size) = self.size.lock() else {
            return 0;
        };
        let old = *size;
        if new_size > old {
            self.semaphore.add_permits(new_size - old);
        } else if new_size < old {
            let surplus = (old - new_size) as u32;
            let semaphore = Arc::clone(&self.semaphore);
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(surplus).await {
                    permits.forget();
                }
            });
        }
        *size = new_size;
        old
    }
}

/// Everything one host's cycles need, cheap to clone into a job.
#[derive(Clone)]
struct HostWorker {
    host_id: String,
    context: Arc<Mutex<HostContext>>,
    executor: Arc<StrategyExecutor>,
    exporter: Arc<dyn MetricExporter>,
    pool: Arc<WorkerPool>,
}

impl HostWorker {
    /// Scheduled tick: skipped while the previous cycle still runs.
    async fn tick(&self) {
        match Arc::clone(&self.context).try_lock_owned() {
            Ok(guard) => {
                self.run(guard).await;
            }
            Err(_) => {
                tracing::debug!(host = %self.host_id, "Previous cycle still running, tick skipped");
            }
        }
    }

    /// Run a cycle, waiting for a running one to finish first.
    async fn run_now(&self) -> Option<CycleReport> {
        let guard = Arc::clone(&self.context).lock_owned().await;
        self.run(guard).await
    }

    async fn run(&self, mut ctx: OwnedMutexGuard<HostContext>) -> Option<CycleReport> {
        let Ok(_permit) = Arc::clone(&self.pool.semaphore).acquire_owned().await else {
            tracing::warn!(host = %self.host_id, "Worker pool closed");
            return None;
        };
        tracing::debug!(host = %self.host_id, "Running cycle");

        let mut report = self.executor.run_cycle(&mut ctx).await;

        if !report.snapshots.is_empty() {
            ctx.set_phase(HostPhase::Exporting);
            let count = report.snapshots.len();
            if let Err(e) = self
                .exporter
                .export(&report.host_id, report.snapshots.clone())
                .await
            {
                tracing::error!(host = %self.host_id, error = %e, count, "Metric export failed");
                report.push(
                    None,
                    DiagnosticKind::Export,
                    Severity::Error,
                    format!("export of {} metrics failed: {}", count, e),
                );
            }
            ctx.set_phase(HostPhase::Idle);
        }
        Some(report)
    }
}

struct HostEntry {
    worker: HostWorker,
    job: Option<JobInfo>,
}

/// Runs host cycles on schedule through a bounded worker pool.
pub struct Engine {
    scheduler: JobScheduler,
    executor: Arc<StrategyExecutor>,
    exporter: Arc<dyn MetricExporter>,
    pool: Arc<WorkerPool>,
    hosts: Arc<RwLock<HashMap<String, HostEntry>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workers", &self.pool.size())
            .field(
                "host_count",
                &self.hosts.try_read().map(|h| h.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine with `workers` concurrent host cycles.
    pub async fn new(
        executor: StrategyExecutor,
        exporter: Arc<dyn MetricExporter>,
        workers: usize,
    ) -> Result<Self, EngineError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| EngineError::Scheduler(e.to_string()))?;

        Ok(Self {
            scheduler,
            executor: Arc::new(executor),
            exporter,
            pool: Arc::new(WorkerPool::new(workers)),
            hosts: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Build an engine from application configuration: every configured
    /// host is added and scheduled with the engine schedule.
    pub async fn from_config(
        config: &AppConfig,
        store: Arc<ConnectorStore>,
        clients: ProtocolClients,
        exporter: Arc<dyn MetricExporter>,
    ) -> Result<Self, EngineError> {
        let schedule = config.engine.schedule();
        schedule.validate().map_err(EngineError::Config)?;

        let executor =
            StrategyExecutor::new(store, clients).with_settings(config.engine.strategy_settings());
        let engine = Self::new(executor, exporter, config.engine.worker_count()).await?;
        for host in &config.hosts {
            let id = host.id.clone();
            engine.add_host(host.clone()).await?;
            engine.schedule_host(&id, &schedule).await?;
        }
        Ok(engine)
    }

    pub fn executor(&self) -> &StrategyExecutor {
        &self.executor
    }

    /// Register a host without scheduling it.
    pub async fn add_host(&self, host: HostConfig) -> Result<(), EngineError> {
        let mut hosts = self.hosts.write().await;
        if hosts.contains_key(&host.id) {
            return Err(EngineError::Config(format!("duplicate host id '{}'", host.id)));
        }
        let id = host.id.clone();
        let worker = HostWorker {
            host_id: id.clone(),
            context: Arc::new(Mutex::new(HostContext::new(host))),
            executor: Arc::clone(&self.executor),
            exporter: Arc::clone(&self.exporter),
            pool: Arc::clone(&self.pool),
        };
        hosts.insert(id.clone(), HostEntry { worker, job: None });
        tracing::info!(host = %id, "Host registered");
        Ok(())
    }

    /// Schedule the cycles of a registered host, replacing any previous job.
    pub async fn schedule_host(
        &self,
        host_id: &str,
        schedule: &Schedule,
    ) -> Result<uuid::Uuid, EngineError> {
        let (worker, previous) = {
            let hosts = self.hosts.read().await;
            let entry = hosts
                .get(host_id)
                .ok_or_else(|| EngineError::UnknownHost(host_id.to_string()))?;
            (entry.worker.clone(), entry.job.as_ref().map(|j| j.id))
        };
        if let Some(previous) = previous {
            self.remove_job(&previous).await?;
        }

        let job = create_job(worker, schedule)?;
        let job_id = self
            .scheduler
            .add(job)
            .await
            .map_err(|e| EngineError::Scheduler(e.to_string()))?;

        let mut hosts = self.hosts.write().await;
        if let Some(entry) = hosts.get_mut(host_id) {
            entry.job = Some(JobInfo {
                id: job_id,
                schedule: schedule.to_string(),
            });
        }
        tracing::info!(host = %host_id, job_id = %job_id, schedule = %schedule, "Host scheduled");
        Ok(job_id)
    }

    /// Start the scheduler.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.scheduler
            .start()
            .await
            .map_err(|e| EngineError::Scheduler(e.to_string()))?;
        tracing::info!("Engine scheduler started");
        Ok(())
    }

    /// Run one cycle of every host through the worker pool.
    pub async fn run_once(&self) -> Vec<CycleReport> {
        let workers: Vec<HostWorker> = {
            let hosts = self.hosts.read().await;
            let mut ids: Vec<&String> = hosts.keys().collect();
            ids.sort();
            ids.into_iter()
                .filter_map(|id| hosts.get(id).map(|e| e.worker.clone()))
                .collect()
        };
        join_all(workers.iter().map(HostWorker::run_now))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Run one cycle of a single host.
    pub async fn run_host_once(&self, host_id: &str) -> Result<CycleReport, EngineError> {
        let worker = self.worker(host_id).await?;
        worker
            .run_now()
            .await
            .ok_or_else(|| EngineError::Scheduler("worker pool closed".to_string()))
    }

    /// Force Detection on the host's next cycle.
    pub async fn request_redetection(&self, host_id: &str) -> Result<(), EngineError> {
        let worker = self.worker(host_id).await?;
        worker.context.lock().await.request_redetection();
        tracing::info!(host = %host_id, "Re-detection requested");
        Ok(())
    }

    /// Read a host's context once its running cycle, if any, is done.
    pub async fn inspect_host<R>(
        &self,
        host_id: &str,
        f: impl FnOnce(&HostContext) -> R,
    ) -> Result<R, EngineError> {
        let worker = self.worker(host_id).await?;
        let ctx = worker.context.lock().await;
        Ok(f(&ctx))
    }

    /// Unschedule and forget a host.
    pub async fn remove_host(&self, host_id: &str) -> Result<(), EngineError> {
        let job = self
            .hosts
            .read()
            .await
            .get(host_id)
            .ok_or_else(|| EngineError::UnknownHost(host_id.to_string()))?
            .job
            .as_ref()
            .map(|j| j.id);
        if let Some(job_id) = job {
            self.remove_job(&job_id).await?;
        }
        self.hosts.write().await.remove(host_id);
        tracing::info!(host = %host_id, "Host removed");
        Ok(())
    }

    /// Registered hosts, ordered by id.
    pub async fn list_hosts(&self) -> Vec<HostInfo> {
        let mut hosts: Vec<HostInfo> = self
            .hosts
            .read()
            .await
            .iter()
            .map(|(id, entry)| HostInfo {
                id: id.clone(),
                job: entry.job.clone(),
            })
            .collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        hosts
    }

    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    /// Change the number of concurrent host cycles. Shrinking takes effect
    /// as running cycles finish.
    pub fn resize_workers(&self, workers: usize) {
        let old = self.pool.resize(workers);
        tracing::info!(old, new = self.pool.size(), "Worker pool resized");
    }

    /// Gracefully shutdown the scheduler with default timeout.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown with custom timeout.
    pub async fn shutdown_with_timeout(mut self, timeout: Duration) -> Result<(), EngineError> {
        let host_count = self.hosts.read().await.len();
        let result = tokio::time::timeout(timeout, async {
            self.scheduler
                .shutdown()
                .await
                .map_err(|e| EngineError::Scheduler(e.to_string()))
        })
        .await;

        match result {
            Ok(Ok(())) => {
                tracing::info!(host_count, "Engine shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(host_count, error = %e, "Engine shutdown failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(host_count, "Engine shutdown timed out");
                Ok(())
            }
        }
    }

    // --- Private helpers ---

    async fn worker(&self, host_id: &str) -> Result<HostWorker, EngineError> {
        self.hosts
            .read()
            .await
            .get(host_id)
            .map(|e| e.worker.clone())
            .ok_or_else(|| EngineError::UnknownHost(host_id.to_string()))
    }

    async fn remove_job(&self, job_id: &uuid::Uuid) -> Result<(), EngineError> {
        self.scheduler
            .remove(job_id)
            .await
            .map_err(|e| EngineError::Scheduler(e.to_string()))
    }
}

fn create_job(worker: HostWorker, schedule: &Schedule) -> Result<Job, EngineError> {
    let make_callback = move || {
        let worker = worker.clone();
        move |_: uuid::Uuid, _: JobScheduler| {
            let worker = worker.clone();
            Box::pin(async move { worker.tick().await })
                as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        }
    };

    match schedule {
        Schedule::Interval(d) => Job::new_repeated_async(*d, make_callback()),
        Schedule::Cron(expr) => Job::new_cron_job_async(expr, make_callback()),
    }
    .map_err(|e| EngineError::Scheduler(e.to_string()))
}
