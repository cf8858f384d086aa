//! Tick-driven job drainage.
//!
//! The [`BackgroundScheduler`] has no worker loop of its own. A [`TriggerHost`]
//! calls it periodically; each [`process_jobs`](BackgroundScheduler::process_jobs)
//! tick takes the advisory lock, runs at most `max_concurrent_jobs` ready jobs one
//! after another through the [`HandlerRegistry`], and releases the lock. A tick
//! that finds the lock held returns a skipped report instead of an error.
//!
//! # Examples
//!
//! ```rust
//! use batchwork::clock::system_clock;
//! use batchwork::handler::{HandlerRegistry, handler_fn};
//! use batchwork::lock::InMemoryLockStore;
//! use batchwork::queue::{JobStore, memory::MemoryQueue};
//! use batchwork::scheduler::BackgroundScheduler;
//! use batchwork::{QueueOptions, SchedulerConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn JobStore> = Arc::new(MemoryQueue::new());
//! let registry = HandlerRegistry::new(store.clone(), system_clock())?;
//! registry.register_handler("report", handler_fn(|_ctx| async { Ok(()) }));
//!
//! let scheduler = BackgroundScheduler::new(
//!     store.clone(),
//!     Arc::new(InMemoryLockStore::new()),
//!     registry,
//!     SchedulerConfig::default(),
//! );
//!
//! store.queue_job("report", json!({}), QueueOptions::new()).await?;
//! let report = scheduler.process_jobs().await?;
//! assert_eq!(report.completed, 1);
//! # Ok(())
//! # }
//! ```

use crate::{
    Result,
    config::SchedulerConfig,
    handler::{HandlerRegistry, JobOutcome},
    job::JobId,
    lock::LockStore,
    queue::JobStore,
    stats::JobStatistics,
    task::{TaskId, TaskStateMachine},
};
use async_trait::async_trait;
use serde::Serialize;
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Trigger that drains ready jobs.
pub const PROCESS_JOBS_TRIGGER: &str = "batchwork.process_jobs";
/// Trigger that runs retention cleanup.
pub const CLEANUP_TRIGGER: &str = "batchwork.cleanup_completed";
/// Trigger that times out stuck generation tasks.
pub const TASK_TIMEOUT_TRIGGER: &str = "batchwork.check_task_timeouts";

pub type TriggerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TriggerCallback = Arc<dyn Fn() -> TriggerFuture + Send + Sync>;

/// Host facility that invokes named callbacks periodically.
#[async_trait]
pub trait TriggerHost: Send + Sync {
    /// Register `callback` under `name`, replacing an earlier registration.
    async fn register(&self, name: &str, interval: Duration, callback: TriggerCallback) -> Result<()>;

    /// Remove a trigger; returns whether it was registered.
    async fn clear(&self, name: &str) -> Result<bool>;

    /// Names of the registered triggers, sorted.
    async fn registered(&self) -> Vec<String>;
}

struct RunningTrigger {
    interval: Duration,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// [`TriggerHost`] backed by tokio interval tasks.
///
/// Each trigger runs in its own task and fires first one interval after it was
/// registered. Clearing a trigger signals its task through a watch channel; an
/// invocation already in flight is allowed to finish.
#[derive(Clone, Default)]
pub struct TokioTriggerHost {
    triggers: Arc<Mutex<HashMap<String, RunningTrigger>>>,
}

impl TokioTriggerHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval of a registered trigger.
    pub async fn interval_of(&self, name: &str) -> Option<Duration> {
        self.triggers.lock().await.get(name).map(|t| t.interval)
    }

    /// Stop every trigger and wait for their tasks to exit.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, RunningTrigger)> = self.triggers.lock().await.drain().collect();
        for (name, trigger) in drained {
            let _ = trigger.stop.send(true);
            if let Err(e) = trigger.handle.await {
                warn!(trigger = %name, error = %e, "Trigger task ended abnormally");
            }
        }
        info!("Trigger host shut down");
    }
}

#[async_trait]
impl TriggerHost for TokioTriggerHost {
    async fn register(&self, name: &str, interval: Duration, callback: TriggerCallback) -> Result<()> {
        let (stop, mut stop_rx) = watch::channel(false);
        let trigger_name = name.to_string();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        debug!(trigger = %trigger_name, "Trigger fired");
                        callback().await;
                    }
                }
            }
            debug!(trigger = %trigger_name, "Trigger stopped");
        });

        let previous = self.triggers.lock().await.insert(
            name.to_string(),
            RunningTrigger {
                interval,
                stop,
                handle,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.stop.send(true);
        }
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<bool> {
        match self.triggers.lock().await.remove(name) {
            Some(trigger) => {
                let _ = trigger.stop.send(true);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.triggers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    /// Another tick held the lock
    pub skipped: bool,
    /// Jobs handed to the registry
    pub processed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Jobs that had left their claimable state
    pub discarded: usize,
    /// Jobs whose outcome could not be stored
    pub errors: usize,
    pub job_ids: Vec<JobId>,
}

impl TickReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn record(&mut self, job_id: JobId, outcome: &Result<JobOutcome>) {
        self.processed += 1;
        self.job_ids.push(job_id);
        match outcome {
            Ok(JobOutcome::Completed) => self.completed += 1,
            Ok(JobOutcome::Retrying { .. }) => self.retried += 1,
            Ok(JobOutcome::Failed { .. }) => self.failed += 1,
            Ok(JobOutcome::Skipped) => self.discarded += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Tick entry point owning the registry, the lock, and the job store.
#[derive(Clone)]
pub struct BackgroundScheduler {
    store: Arc<dyn JobStore>,
    locks: Arc<dyn LockStore>,
    registry: HandlerRegistry,
    config: SchedulerConfig,
    tasks: Option<Arc<TaskStateMachine>>,
}

impl std::fmt::Debug for BackgroundScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundScheduler")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("tasks", &self.tasks.is_some())
            .finish()
    }
}

impl BackgroundScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<dyn LockStore>,
        registry: HandlerRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            locks,
            registry,
            config,
            tasks: None,
        }
    }

    /// Attach a task state machine so ticks also check task timeouts.
    pub fn with_task_machine(mut self, machine: Arc<TaskStateMachine>) -> Self {
        self.tasks = Some(machine);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register the periodic triggers with `host`.
    pub async fn init(&self, host: &dyn TriggerHost) -> Result<()> {
        let scheduler = self.clone();
        host.register(
            PROCESS_JOBS_TRIGGER,
            self.config.tick_interval,
            Arc::new(move || {
                let scheduler = scheduler.clone();
                Box::pin(async move {
                    if let Err(e) = scheduler.process_jobs().await {
                        error!(error = %e, "Job processing tick failed");
                    }
                })
            }),
        )
        .await?;

        let scheduler = self.clone();
        host.register(
            CLEANUP_TRIGGER,
            self.config.cleanup_interval,
            Arc::new(move || {
                let scheduler = scheduler.clone();
                Box::pin(async move {
                    if let Err(e) = scheduler.cleanup_completed_jobs().await {
                        error!(error = %e, "Job cleanup failed");
                    }
                })
            }),
        )
        .await?;

        if self.tasks.is_some() {
            let scheduler = self.clone();
            host.register(
                TASK_TIMEOUT_TRIGGER,
                self.config.tick_interval,
                Arc::new(move || {
                    let scheduler = scheduler.clone();
                    Box::pin(async move {
                        if let Err(e) = scheduler.check_task_timeouts().await {
                            error!(error = %e, "Task timeout check failed");
                        }
                    })
                }),
            )
            .await?;
        }

        info!(
            tick_interval = ?self.config.tick_interval,
            cleanup_interval = ?self.config.cleanup_interval,
            "Background scheduler initialized"
        );
        Ok(())
    }

    /// Remove the triggers registered by [`init`](Self::init).
    pub async fn shutdown(&self, host: &dyn TriggerHost) -> Result<()> {
        for name in [PROCESS_JOBS_TRIGGER, CLEANUP_TRIGGER, TASK_TIMEOUT_TRIGGER] {
            host.clear(name).await?;
        }
        info!("Background scheduler shut down");
        Ok(())
    }

    /// Run one tick.
    pub async fn process_jobs(&self) -> Result<TickReport> {
        let token = Uuid::new_v4().to_string();
        let key = &self.config.lock_key;

        if !self.locks.acquire(key, &token, self.config.lock_ttl).await? {
            debug!(lock_key = %key, "Another tick holds the lock, skipping");
            return Ok(TickReport::skipped());
        }

        let result = self.drain().await;

        match self.locks.release(key, &token).await {
            Ok(true) => {}
            Ok(false) => warn!(lock_key = %key, "Lock expired before the tick finished"),
            Err(e) => warn!(lock_key = %key, error = %e, "Failed to release scheduler lock"),
        }

        let report = result?;
        if report.processed > 0 {
            info!(
                processed = report.processed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                "Tick finished"
            );
        }
        Ok(report)
    }

    async fn drain(&self) -> Result<TickReport> {
        let jobs = self.store.get_ready_jobs(self.config.max_concurrent_jobs).await?;
        let mut report = TickReport::default();

        for job in jobs {
            let job_id = job.id;
            let outcome = self.registry.process_job(job).await;
            if let Err(e) = &outcome {
                error!(job_id = %job_id, error = %e, "Failed to store job outcome");
            }
            report.record(job_id, &outcome);
        }
        Ok(report)
    }

    /// Delete finished jobs older than the configured retention.
    pub async fn cleanup_completed_jobs(&self) -> Result<u64> {
        let removed = self
            .store
            .cleanup_completed_jobs(self.config.retention)
            .await?;
        if removed > 0 {
            info!(removed, "Removed finished jobs past retention");
        }
        if let Some(tasks) = &self.tasks {
            let purged = tasks.purge_expired().await?;
            if purged > 0 {
                info!(purged, "Removed expired generation tasks");
            }
        }
        Ok(removed)
    }

    /// Persist handler progress immediately.
    pub async fn update_progress(&self, job_id: JobId, percent: u8, message: Option<&str>) -> Result<bool> {
        self.store.update_progress(job_id, percent, message).await
    }

    /// Time out stuck tasks; a no-op without an attached state machine.
    pub async fn check_task_timeouts(&self) -> Result<Vec<TaskId>> {
        match &self.tasks {
            Some(tasks) => tasks.check_timeouts().await,
            None => Ok(Vec::new()),
        }
    }

    /// Job statistics over the configured window.
    pub async fn get_statistics(&self) -> Result<JobStatistics> {
        self.store
            .get_statistics(self.config.statistics_window)
            .await
    }
}
