//! Job storage with backend-specific implementations.
//!
//! The [`JobStore`] trait is the narrow storage contract the scheduler and handler
//! registry rely on: queue a row, select ready rows in priority order, and move a
//! row through its lifecycle with guarded writes. Two backends ship with the crate:
//!
//! - [`memory::MemoryQueue`], an in-memory store driven by an injected clock. It is
//!   always available and is what the test-suite runs against.
//! - `JobQueue<Postgres>` behind the `postgres` feature, which also implements the
//!   lock store and task store contracts on the same pool.

use crate::{
    Result,
    clock::SharedClock,
    job::{Job, JobId, QueueOptions},
    stats::JobStatistics,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool};
use std::{marker::PhantomData, sync::Arc, time::Duration};
use tokio::sync::OnceCell;

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Storage contract for job rows.
///
/// Lifecycle writes (`mark_*`, `update_progress`) are guarded: they return
/// `Ok(false)` instead of writing when the row is gone or its current status does
/// not accept the transition. This is what keeps a job cancelled while its handler
/// was running from being resurrected by the late completion.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create backing storage if it does not exist yet. Idempotent.
    async fn ensure_schema(&self) -> Result<()>;

    /// Insert a `queued` row with `scheduled_at = now + options.delay`.
    async fn queue_job(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: QueueOptions,
    ) -> Result<JobId>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Queued or retrying rows whose `scheduled_at` has passed, ordered by
    /// `(priority ASC, scheduled_at ASC)` and then insertion order.
    async fn get_ready_jobs(&self, limit: usize) -> Result<Vec<Job>>;

    /// `queued | retrying -> processing`, resetting progress to 0.
    async fn mark_processing(&self, job_id: JobId) -> Result<bool>;

    /// Persist handler progress. Only applies while the job is processing.
    async fn update_progress(
        &self,
        job_id: JobId,
        percent: u8,
        message: Option<&str>,
    ) -> Result<bool>;

    /// `processing -> completed` with progress 100.
    async fn mark_completed(&self, job_id: JobId) -> Result<bool>;

    /// Record a failed attempt that will be retried at `retry_at`.
    async fn mark_retrying(
        &self,
        job_id: JobId,
        attempts: i32,
        retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool>;

    /// Record the final failed attempt.
    async fn mark_failed(&self, job_id: JobId, attempts: i32, error_message: &str)
    -> Result<bool>;

    /// Cancel a job that has not finished. Idempotent: returns `true` when the job
    /// is cancelled after the call, `false` when it is absent or already completed
    /// or failed.
    async fn cancel_job(&self, job_id: JobId) -> Result<bool>;

    /// Delete completed, failed, and cancelled rows last touched before
    /// `now - retention`. Returns the number of rows removed.
    async fn cleanup_completed_jobs(&self, retention: Duration) -> Result<u64>;

    /// Per-status counts of jobs created within the trailing window.
    async fn get_statistics(&self, window: Duration) -> Result<JobStatistics>;
}

/// Database-backed job queue.
///
/// Generic over the sqlx database so backend implementations live in their own
/// modules; the shared state is the pool, the clock used for every timestamp bound
/// into queries, and a once-cell that makes schema creation lazy and idempotent.
pub struct JobQueue<DB: Database> {
    pub pool: Pool<DB>,
    pub(crate) clock: SharedClock,
    pub(crate) schema_ready: Arc<OnceCell<()>>,
    /// Expiry applied to task records on every write
    pub(crate) task_ttl: Duration,
    /// When `false`, `ensure_schema` assumes the tables already exist
    pub(crate) create_tables: bool,
    pub(crate) _phantom: PhantomData<DB>,
}

impl<DB: Database> Clone for JobQueue<DB> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            clock: self.clock.clone(),
            schema_ready: self.schema_ready.clone(),
            task_ttl: self.task_ttl,
            create_tables: self.create_tables,
            _phantom: PhantomData,
        }
    }
}

impl<DB: Database> JobQueue<DB> {
    /// Creates a queue over the given pool using the wall clock.
    pub fn new(pool: Pool<DB>) -> Self {
        Self::with_clock(pool, crate::clock::system_clock())
    }

    pub fn with_clock(pool: Pool<DB>, clock: SharedClock) -> Self {
        Self {
            pool,
            clock,
            schema_ready: Arc::new(OnceCell::new()),
            task_ttl: crate::config::TaskConfig::default().task_ttl,
            create_tables: true,
            _phantom: PhantomData,
        }
    }

    pub fn with_task_ttl(mut self, ttl: Duration) -> Self {
        self.task_ttl = ttl;
        self
    }

    /// Skip lazy table creation for deployments that manage the schema themselves.
    pub fn with_create_tables(mut self, create_tables: bool) -> Self {
        self.create_tables = create_tables;
        self
    }

    #[allow(dead_code)] // Used in database-specific implementations
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
