//! Job handler registry and dispatch.
//!
//! The [`HandlerRegistry`] maps a job type to an async handler and owns everything
//! that happens around one attempt: claiming the row, bounding the handler with a
//! timeout, and turning the outcome into a guarded status write. Handler errors,
//! timeouts, panics, and missing handlers all take the same retry-or-fail branch and
//! never propagate; only storage failures reach the caller of
//! [`process_job`](HandlerRegistry::process_job).
//!
//! # Examples
//!
//! ```rust
//! use batchwork::clock::system_clock;
//! use batchwork::handler::{HandlerRegistry, JobOutcome, handler_fn};
//! use batchwork::queue::{JobStore, memory::MemoryQueue};
//! use batchwork::QueueOptions;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn JobStore> = Arc::new(MemoryQueue::new());
//! let registry = HandlerRegistry::new(store.clone(), system_clock())?;
//!
//! registry.register_handler(
//!     "email",
//!     handler_fn(|ctx| async move {
//!         ctx.update_progress(50, Some("rendering")).await?;
//!         Ok(())
//!     }),
//! );
//!
//! store.queue_job("email", json!({"to": "a@example.com"}), QueueOptions::new()).await?;
//! let job = store.get_ready_jobs(1).await?.remove(0);
//! assert_eq!(registry.process_job(job).await?, JobOutcome::Completed);
//! # Ok(())
//! # }
//! ```

use crate::{
    BatchworkError, Result,
    clock::{Clock, SharedClock},
    config::SchedulerConfig,
    job::{Job, JobId},
    logging::ErrorContext,
    metrics::PerformanceTimer,
    queue::JobStore,
    retry::RetryStrategy,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Job type of the built-in retention cleanup handler.
pub const CLEANUP_JOB_TYPE: &str = "maintenance.cleanup";
/// Job type of the built-in health probe handler.
pub const NOOP_JOB_TYPE: &str = "maintenance.noop";

/// Longest error message stored on a job row.
const MAX_ERROR_MESSAGE_LEN: usize = 1000;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Async job handler.
pub type JobHandler = Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> JobHandler
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Persists handler progress straight to the store.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    job_id: JobId,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>, job_id: JobId) -> Self {
        Self { store, job_id }
    }

    /// Returns `false` once the job has left `processing`, e.g. after a cancel.
    pub async fn report(&self, percent: u8, message: Option<&str>) -> Result<bool> {
        self.store
            .update_progress(self.job_id, percent, message)
            .await
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .finish()
    }
}

/// What a handler sees of the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    /// 1-based number of the attempt being made
    pub attempt: i32,
    pub progress: ProgressReporter,
}

impl JobContext {
    pub fn new(job: &Job, store: Arc<dyn JobStore>) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            attempt: job.attempts + 1,
            progress: ProgressReporter::new(store, job.id),
        }
    }

    pub async fn update_progress(&self, percent: u8, message: Option<&str>) -> Result<bool> {
        self.progress.report(percent, message).await
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Result of one [`HandlerRegistry::process_job`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    /// Failed attempt; the job becomes ready again at `retry_at`.
    Retrying {
        attempts: i32,
        retry_at: DateTime<Utc>,
    },
    /// Failed attempt with no attempts left.
    Failed { attempts: i32 },
    /// The job left its claimable state (usually cancelled) before or while it ran.
    Skipped,
}

/// Run a handler on the runtime and bound it with `timeout`.
///
/// On expiry the spawned task is aborted and the attempt fails with
/// [`BatchworkError::Timeout`]. A panicking handler is reported as
/// [`BatchworkError::Handler`].
pub async fn execute_with_timeout(
    handler: &JobHandler,
    context: JobContext,
    timeout: Duration,
) -> Result<()> {
    let job_id = context.job_id;
    let job_type = context.job_type.clone();
    let mut task = tokio::spawn(handler(context));

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) if join_error.is_panic() => Err(BatchworkError::Handler {
            job_type,
            message: "handler panicked".to_string(),
        }),
        Ok(Err(join_error)) => Err(BatchworkError::Handler {
            job_type,
            message: format!("handler task did not finish: {}", join_error),
        }),
        Err(_) => {
            task.abort();
            warn!(job_id = %job_id, ?timeout, "Job timed out, handler aborted");
            Err(BatchworkError::Timeout {
                job_id: job_id.to_string(),
                timeout,
            })
        }
    }
}

/// Type to handler mapping plus the per-attempt dispatch policy.
///
/// Constructed per scheduler; there is no process-wide registry.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, JobHandler>>>,
    store: Arc<dyn JobStore>,
    clock: SharedClock,
    retry_strategy: RetryStrategy,
    job_timeout: Duration,
    retention: Duration,
    timer: PerformanceTimer,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handler_types", &self.handler_types())
            .field("retry_strategy", &self.retry_strategy)
            .field("job_timeout", &self.job_timeout)
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry with default scheduler settings.
    pub fn new(store: Arc<dyn JobStore>, clock: SharedClock) -> Result<Self> {
        Self::with_config(store, clock, &SchedulerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn JobStore>,
        clock: SharedClock,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        Ok(Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            store,
            clock,
            retry_strategy: config.retry_strategy.clone(),
            job_timeout: config.job_timeout,
            retention: config.retention,
            timer: PerformanceTimer::new()?,
        })
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Share a timer with other components.
    pub fn with_timer(mut self, timer: PerformanceTimer) -> Self {
        self.timer = timer;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn timer(&self) -> &PerformanceTimer {
        &self.timer
    }

    pub fn retry_strategy(&self) -> &RetryStrategy {
        &self.retry_strategy
    }

    /// Register `handler` for `job_type`, replacing any earlier registration.
    pub fn register_handler(&self, job_type: impl Into<String>, handler: JobHandler) {
        let job_type = job_type.into();
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        if handlers.insert(job_type.clone(), handler).is_some() {
            debug!(job_type = %job_type, "Replaced job handler");
        } else {
            debug!(job_type = %job_type, "Registered job handler");
        }
    }

    pub fn unregister_handler(&self, job_type: &str) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.remove(job_type).is_some()
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn handler_types(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        let mut types: Vec<String> = handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Seed the built-in maintenance handlers.
    ///
    /// `maintenance.cleanup` runs retention cleanup on the store; its payload may
    /// override the window with `{"retention_secs": n}`. `maintenance.noop` does
    /// nothing and serves as a health probe for the dispatch path.
    pub fn register_default_handlers(&self) {
        let store = self.store.clone();
        let default_retention = self.retention;
        self.register_handler(
            CLEANUP_JOB_TYPE,
            handler_fn(move |ctx| {
                let store = store.clone();
                async move {
                    let retention = ctx
                        .payload
                        .get("retention_secs")
                        .and_then(|v| v.as_u64())
                        .map(Duration::from_secs)
                        .unwrap_or(default_retention);
                    let removed = store.cleanup_completed_jobs(retention).await?;
                    info!(removed, ?retention, "Cleanup job removed finished jobs");
                    Ok(())
                }
            }),
        );

        self.register_handler(NOOP_JOB_TYPE, handler_fn(|_ctx| async { Ok(()) }));
    }

    fn handler(&self, job_type: &str) -> Option<JobHandler> {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        handlers.get(job_type).cloned()
    }

    /// Run one attempt of `job` and persist the outcome.
    pub async fn process_job(&self, job: Job) -> Result<JobOutcome> {
        let span = self.timer.start(format!("job.{}", job.job_type));
        let outcome = self.run_attempt(&job).await;
        let elapsed = self.timer.stop(span);

        match &outcome {
            Ok(outcome) => debug!(job_id = %job.id, ?outcome, ?elapsed, "Processed job"),
            Err(e) => warn!(job_id = %job.id, error = %e, ?elapsed, "Storage error while processing job"),
        }
        outcome
    }

    async fn run_attempt(&self, job: &Job) -> Result<JobOutcome> {
        if job.has_exhausted_attempts() {
            let message = job
                .error_message
                .clone()
                .unwrap_or_else(|| "Maximum attempts exhausted".to_string());
            let written = self
                .store
                .mark_failed(job.id, job.max_attempts, &message)
                .await?;
            return Ok(if written {
                JobOutcome::Failed {
                    attempts: job.max_attempts,
                }
            } else {
                JobOutcome::Skipped
            });
        }

        let Some(handler) = self.handler(&job.job_type) else {
            let error = BatchworkError::HandlerNotFound {
                job_type: job.job_type.clone(),
            };
            return self.record_failure(job, error).await;
        };

        if !self.store.mark_processing(job.id).await? {
            debug!(job_id = %job.id, "Job no longer claimable, skipping");
            return Ok(JobOutcome::Skipped);
        }

        let context = JobContext::new(job, self.store.clone());
        match execute_with_timeout(&handler, context, self.job_timeout).await {
            Ok(()) => {
                if self.store.mark_completed(job.id).await? {
                    Ok(JobOutcome::Completed)
                } else {
                    debug!(job_id = %job.id, "Completion discarded, job left processing");
                    Ok(JobOutcome::Skipped)
                }
            }
            Err(error) => self.record_failure(job, error).await,
        }
    }

    async fn record_failure(&self, job: &Job, error: BatchworkError) -> Result<JobOutcome> {
        let attempts = (job.attempts + 1).min(job.max_attempts);
        let message = short_message(&error);
        let will_retry = attempts < job.max_attempts;

        ErrorContext::for_job(job, attempts, &error, will_retry).log();

        if will_retry {
            let retry_at = self.retry_at(attempts);
            let written = self
                .store
                .mark_retrying(job.id, attempts, retry_at, &message)
                .await?;
            Ok(if written {
                JobOutcome::Retrying { attempts, retry_at }
            } else {
                JobOutcome::Skipped
            })
        } else {
            let written = self.store.mark_failed(job.id, attempts, &message).await?;
            Ok(if written {
                JobOutcome::Failed { attempts }
            } else {
                JobOutcome::Skipped
            })
        }
    }

    fn retry_at(&self, attempts: i32) -> DateTime<Utc> {
        let delay = self.retry_strategy.calculate_delay(attempts.max(0) as u32);
        let now = self.clock.now();
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

fn short_message(error: &BatchworkError) -> String {
    let message = error.to_string();
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        return message;
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, MockClock},
        job::{JobStatus, QueueOptions},
        queue::memory::MemoryQueue,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (MockClock, Arc<dyn JobStore>, HandlerRegistry) {
        let clock = MockClock::new();
        let store: Arc<dyn JobStore> = Arc::new(MemoryQueue::with_clock(clock.clone()));
        let registry = HandlerRegistry::new(store.clone(), Arc::new(clock.clone()))
            .unwrap()
            .with_retry_strategy(RetryStrategy::fixed(Duration::from_secs(30)));
        (clock, store, registry)
    }

    async fn queue_and_fetch(store: &Arc<dyn JobStore>, job_type: &str, max_attempts: i32) -> Job {
        let id = store
            .queue_job(
                job_type,
                json!({"n": 1}),
                QueueOptions::new().with_max_attempts(max_attempts),
            )
            .await
            .unwrap();
        store.get_job(id).await.unwrap().unwrap()
    }

    #[test]
    fn test_last_registration_wins() {
        let (_, _, registry) = setup();
        registry.register_handler("a", handler_fn(|_| async { Ok(()) }));
        registry.register_handler(
            "a",
            handler_fn(|_| async { Err(BatchworkError::Processing("second".into())) }),
        );

        assert_eq!(registry.handler_types(), vec!["a"]);
        assert!(registry.unregister_handler("a"));
        assert!(!registry.has_handler("a"));
        assert!(!registry.unregister_handler("a"));
    }

    #[test]
    fn test_default_handlers_registered() {
        let (_, _, registry) = setup();
        registry.register_default_handlers();
        assert!(registry.has_handler(CLEANUP_JOB_TYPE));
        assert!(registry.has_handler(NOOP_JOB_TYPE));
    }

    #[tokio::test]
    async fn test_success_marks_completed_with_full_progress() {
        let (_, store, registry) = setup();
        registry.register_handler(
            "work",
            handler_fn(|ctx| async move {
                assert_eq!(ctx.attempt, 1);
                assert!(ctx.update_progress(40, Some("working")).await?);
                Ok(())
            }),
        );

        let job = queue_and_fetch(&store, "work", 3).await;
        let outcome = registry.process_job(job.clone()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert!(registry.timer().stats("job.work").is_some());
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_with_backoff() {
        let (clock, store, registry) = setup();
        registry.register_handler(
            "flaky",
            handler_fn(|_| async { Err(BatchworkError::Processing("upstream down".into())) }),
        );

        let job = queue_and_fetch(&store, "flaky", 3).await;
        let outcome = registry.process_job(job.clone()).await.unwrap();

        let expected_retry = clock.now() + chrono::Duration::seconds(30);
        assert_eq!(
            outcome,
            JobOutcome::Retrying {
                attempts: 1,
                retry_at: expected_retry
            }
        );

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.scheduled_at, expected_retry);
        assert!(
            stored
                .error_message
                .unwrap()
                .contains("upstream down")
        );
        assert!(store.get_ready_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_max() {
        let (clock, store, registry) = setup();
        registry.register_handler(
            "broken",
            handler_fn(|_| async { Err(BatchworkError::Processing("nope".into())) }),
        );

        let job = queue_and_fetch(&store, "broken", 2).await;
        let first = registry.process_job(job.clone()).await.unwrap();
        assert!(matches!(first, JobOutcome::Retrying { attempts: 1, .. }));

        clock.advance(chrono::Duration::seconds(31));
        let retry = store.get_ready_jobs(1).await.unwrap().remove(0);
        let second = registry.process_job(retry).await.unwrap();
        assert_eq!(second, JobOutcome::Failed { attempts: 2 });

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn test_missing_handler_follows_failure_branch() {
        let (_, store, registry) = setup();

        let job = queue_and_fetch(&store, "unknown", 1).await;
        let outcome = registry.process_job(job.clone()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Failed { attempts: 1 });

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("No handler registered for job type: unknown")
        );
    }

    #[tokio::test]
    async fn test_exhausted_job_goes_straight_to_failed() {
        let (_, store, registry) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register_handler(
            "work",
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let mut job = queue_and_fetch(&store, "work", 2).await;
        job.attempts = 2;

        let outcome = registry.process_job(job).await.unwrap();
        assert_eq!(outcome, JobOutcome::Failed { attempts: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let (_, store, registry) = setup();
        let registry = registry.with_job_timeout(Duration::from_millis(50));
        registry.register_handler(
            "slow",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }),
        );

        let job = queue_and_fetch(&store, "slow", 3).await;
        let outcome = registry.process_job(job.clone()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Retrying { attempts: 1, .. }));

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert!(stored.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_panicking_handler_counts_as_failure() {
        let (_, store, registry) = setup();
        registry.register_handler(
            "panics",
            handler_fn(|_| async { panic!("handler exploded") }),
        );

        let job = queue_and_fetch(&store, "panics", 1).await;
        let outcome = registry.process_job(job).await.unwrap();
        assert_eq!(outcome, JobOutcome::Failed { attempts: 1 });
    }

    #[tokio::test]
    async fn test_cancelled_job_is_skipped() {
        let (_, store, registry) = setup();
        registry.register_handler("work", handler_fn(|_| async { Ok(()) }));

        let job = queue_and_fetch(&store, "work", 3).await;
        store.cancel_job(job.id).await.unwrap();

        let outcome = registry.process_job(job.clone()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_during_run_is_not_resurrected() {
        let (_, store, registry) = setup();
        let inner_store = store.clone();
        registry.register_handler(
            "work",
            handler_fn(move |ctx| {
                let store = inner_store.clone();
                async move {
                    store.cancel_job(ctx.job_id).await?;
                    Ok(())
                }
            }),
        );

        let job = queue_and_fetch(&store, "work", 3).await;
        let outcome = registry.process_job(job.clone()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cleanup_handler_uses_payload_retention() {
        let (clock, store, registry) = setup();
        registry.register_default_handlers();

        let done = queue_and_fetch(&store, NOOP_JOB_TYPE, 3).await;
        assert_eq!(
            registry.process_job(done.clone()).await.unwrap(),
            JobOutcome::Completed
        );

        clock.advance(chrono::Duration::minutes(10));
        let id = store
            .queue_job(
                CLEANUP_JOB_TYPE,
                json!({"retention_secs": 60}),
                QueueOptions::new(),
            )
            .await
            .unwrap();
        let cleanup = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(
            registry.process_job(cleanup).await.unwrap(),
            JobOutcome::Completed
        );

        assert!(store.get_job(done.id).await.unwrap().is_none());
    }

    #[test]
    fn test_short_message_truncates_on_char_boundary() {
        let error = BatchworkError::Processing("é".repeat(800));
        let message = short_message(&error);
        assert!(message.len() <= MAX_ERROR_MESSAGE_LEN);
        assert!(message.starts_with("Processing error: "));
    }
}
