//! # Batchwork
//!
//! A tick-driven background job queue with a versioned, multi-batch generation task
//! state machine on top.
//!
//! ## Features
//!
//! - **Tick-driven drainage**: no long-lived worker loop; a periodic trigger drains a
//!   bounded number of ready jobs per tick under an advisory lock
//! - **Priority ordering**: ready jobs run by `(priority, scheduled_at)`, lower first
//! - **Retries with backoff**: fixed, linear, exponential, and Fibonacci strategies
//!   with optional jitter
//! - **Guarded writes**: a job cancelled while its handler runs stays cancelled
//! - **Generation tasks**: item lists split into batches, driven through a pure
//!   transition function and persisted by compare-and-swap on a version counter
//! - **Pluggable storage**: in-memory backends for every store, PostgreSQL behind the
//!   `postgres` feature
//! - **Monitoring**: Prometheus timing histograms (enabled by default)
//!
//! ## Quick Start
//!
//! ```rust
//! use batchwork::{
//!     BackgroundScheduler, HandlerRegistry, InMemoryLockStore, JobStore, MemoryQueue,
//!     QueueOptions, SchedulerConfig, clock::system_clock, handler_fn,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn JobStore> = Arc::new(MemoryQueue::new());
//!
//! let registry = HandlerRegistry::new(store.clone(), system_clock())?;
//! registry.register_handler(
//!     "send_email",
//!     handler_fn(|ctx| async move {
//!         ctx.update_progress(50, Some("rendering")).await?;
//!         Ok(())
//!     }),
//! );
//!
//! let scheduler = BackgroundScheduler::new(
//!     store.clone(),
//!     Arc::new(InMemoryLockStore::new()),
//!     registry,
//!     SchedulerConfig::default(),
//! );
//!
//! store
//!     .queue_job("send_email", json!({"to": "a@example.com"}), QueueOptions::new())
//!     .await?;
//!
//! let report = scheduler.process_jobs().await?;
//! assert_eq!(report.completed, 1);
//! # Ok(())
//! # }
//! ```
//!
//! In a long-running service, hand the scheduler a [`TokioTriggerHost`] with
//! [`BackgroundScheduler::init`] instead of calling `process_jobs` yourself.
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A job row carries a type, a JSON payload, a priority, and a status moving through
//! `queued -> processing -> completed | retrying | failed | cancelled`. Handlers are
//! registered per job type; a job whose type has no handler fails like any other
//! attempt.
//!
//! ### Generation tasks
//!
//! See [`task`] for the task lifecycle, batch dispatch, and bulk actions.
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL job, lock, and task stores
//! - `metrics` - Prometheus metrics collection (default)

pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod polling;
pub mod priority;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod task;

pub use config::{BatchworkConfig, DatabaseConfig, LoggingConfig, SchedulerConfig, TaskConfig};
pub use error::BatchworkError;
pub use handler::{HandlerRegistry, JobContext, JobHandler, JobOutcome, handler_fn};
pub use job::{Job, JobId, JobStatus, QueueOptions};
pub use lock::{InMemoryLockStore, LockStore};
pub use logging::init_logging;
pub use metrics::PerformanceTimer;
pub use polling::PollingQueueAdapter;
pub use priority::JobPriority;
pub use queue::{JobQueue, JobStore, memory::MemoryQueue};
pub use retry::{JitterType, RetryStrategy};
pub use scheduler::{BackgroundScheduler, TickReport, TokioTriggerHost, TriggerHost};
pub use stats::JobStatistics;
pub use task::{
    BulkAction, BulkActionReport, GenerationTask, InMemoryTaskStore, NewTask, TaskStateMachine,
    TaskStatus, TaskStore,
};

/// Convenient type alias for Results with [`BatchworkError`] as the error type.
pub type Result<T> = std::result::Result<T, BatchworkError>;
