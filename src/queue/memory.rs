//! In-memory implementation of the job store.
//!
//! [`MemoryQueue`] keeps every row in a map behind a `tokio::sync::RwLock`, so each
//! trait call is atomic with respect to the others. Time comes from an injected
//! clock: pair it with a [`MockClock`](crate::clock::MockClock) to test delayed
//! jobs, retry backoff, and retention cleanup without waiting.
//!
//! # Examples
//!
//! ```rust
//! use batchwork::clock::MockClock;
//! use batchwork::queue::{JobStore, memory::MemoryQueue};
//! use batchwork::QueueOptions;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = MockClock::new();
//! let queue = MemoryQueue::with_clock(clock.clone());
//!
//! let options = QueueOptions::new().with_delay(Duration::from_secs(10));
//! let job_id = queue.queue_job("export", json!({"report": 7}), options).await?;
//!
//! assert!(queue.get_ready_jobs(3).await?.is_empty());
//!
//! clock.advance(chrono::Duration::seconds(10));
//! assert_eq!(queue.get_ready_jobs(3).await?[0].id, job_id);
//! # Ok(())
//! # }
//! ```

use crate::{
    Result,
    clock::{Clock, SharedClock},
    job::{Job, JobId, JobStatus, QueueOptions},
    queue::JobStore,
    stats::{JobStatistics, window_start},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug)]
struct StoredJob {
    /// Insertion sequence, the final FIFO tie-break
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct MemoryStorage {
    jobs: HashMap<JobId, StoredJob>,
    next_seq: u64,
}

/// In-memory job store.
#[derive(Clone, Debug)]
pub struct MemoryQueue {
    storage: Arc<RwLock<MemoryStorage>>,
    clock: SharedClock,
}

impl MemoryQueue {
    /// Create a store driven by the wall clock.
    pub fn new() -> Self {
        Self::with_shared_clock(crate::clock::system_clock())
    }

    /// Create a store driven by the given clock.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self::with_shared_clock(Arc::new(clock))
    }

    pub fn with_shared_clock(clock: SharedClock) -> Self {
        Self {
            storage: Arc::new(RwLock::new(MemoryStorage::default())),
            clock,
        }
    }

    /// Snapshot of every stored row, in insertion order.
    pub async fn all_jobs(&self) -> Vec<Job> {
        let storage = self.storage.read().await;
        let mut rows: Vec<&StoredJob> = storage.jobs.values().collect();
        rows.sort_by_key(|row| row.seq);
        rows.into_iter().map(|row| row.job.clone()).collect()
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.storage.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Apply `update` to the row if its status is one of `from`.
    async fn guarded_update<F>(&self, job_id: JobId, from: &[JobStatus], update: F) -> bool
    where
        F: FnOnce(&mut Job, DateTime<Utc>),
    {
        let now = self.clock.now();
        let mut storage = self.storage.write().await;
        match storage.jobs.get_mut(&job_id) {
            Some(row) if from.contains(&row.job.status) => {
                update(&mut row.job, now);
                row.job.updated_at = now;
                true
            }
            Some(row) => {
                debug!(
                    job_id = %job_id,
                    status = %row.job.status,
                    "Guarded write refused for job in current status"
                );
                false
            }
            None => false,
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

const ATTEMPTABLE: [JobStatus; 3] = [
    JobStatus::Queued,
    JobStatus::Processing,
    JobStatus::Retrying,
];

#[async_trait]
impl JobStore for MemoryQueue {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn queue_job(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: QueueOptions,
    ) -> Result<JobId> {
        self.ensure_schema().await?;

        let job = Job::new(job_type, payload, &options, self.clock.now());
        let job_id = job.id;

        let mut storage = self.storage.write().await;
        let seq = storage.next_seq;
        storage.next_seq += 1;
        storage.jobs.insert(job_id, StoredJob { seq, job });

        Ok(job_id)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let storage = self.storage.read().await;
        Ok(storage.jobs.get(&job_id).map(|row| row.job.clone()))
    }

    async fn get_ready_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let storage = self.storage.read().await;

        let mut ready: Vec<&StoredJob> = storage
            .jobs
            .values()
            .filter(|row| row.job.is_ready(now))
            .collect();
        ready.sort_by_key(|row| (row.job.priority, row.job.scheduled_at, row.seq));

        Ok(ready
            .into_iter()
            .take(limit)
            .map(|row| row.job.clone())
            .collect())
    }

    async fn mark_processing(&self, job_id: JobId) -> Result<bool> {
        Ok(self
            .guarded_update(
                job_id,
                &[JobStatus::Queued, JobStatus::Retrying],
                |job, now| {
                    job.status = JobStatus::Processing;
                    job.progress = 0;
                    job.progress_message = None;
                    job.started_at = Some(now);
                },
            )
            .await)
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        percent: u8,
        message: Option<&str>,
    ) -> Result<bool> {
        let message = message.map(str::to_string);
        Ok(self
            .guarded_update(job_id, &[JobStatus::Processing], |job, _| {
                job.progress = percent.min(100);
                if message.is_some() {
                    job.progress_message = message;
                }
            })
            .await)
    }

    async fn mark_completed(&self, job_id: JobId) -> Result<bool> {
        Ok(self
            .guarded_update(job_id, &[JobStatus::Processing], |job, now| {
                job.status = JobStatus::Completed;
                job.progress = 100;
                job.error_message = None;
                job.completed_at = Some(now);
            })
            .await)
    }

    async fn mark_retrying(
        &self,
        job_id: JobId,
        attempts: i32,
        retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool> {
        Ok(self
            .guarded_update(job_id, &ATTEMPTABLE, |job, _| {
                job.status = JobStatus::Retrying;
                job.attempts = attempts.min(job.max_attempts);
                job.scheduled_at = retry_at;
                job.error_message = Some(error_message.to_string());
            })
            .await)
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        attempts: i32,
        error_message: &str,
    ) -> Result<bool> {
        Ok(self
            .guarded_update(job_id, &ATTEMPTABLE, |job, now| {
                job.status = JobStatus::Failed;
                job.attempts = attempts.min(job.max_attempts);
                job.error_message = Some(error_message.to_string());
                job.completed_at = Some(now);
            })
            .await)
    }

    async fn cancel_job(&self, job_id: JobId) -> Result<bool> {
        let now = self.clock.now();
        let mut storage = self.storage.write().await;
        let Some(row) = storage.jobs.get_mut(&job_id) else {
            return Ok(false);
        };

        match row.job.status {
            JobStatus::Cancelled => Ok(true),
            JobStatus::Completed | JobStatus::Failed => Ok(false),
            JobStatus::Queued | JobStatus::Processing | JobStatus::Retrying => {
                row.job.status = JobStatus::Cancelled;
                row.job.updated_at = now;
                row.job.completed_at = Some(now);
                Ok(true)
            }
        }
    }

    async fn cleanup_completed_jobs(&self, retention: Duration) -> Result<u64> {
        let cutoff = window_start(self.clock.now(), retention);
        let mut storage = self.storage.write().await;
        let before = storage.jobs.len();
        storage
            .jobs
            .retain(|_, row| !(row.job.status.is_finished() && row.job.updated_at < cutoff));
        Ok((before - storage.jobs.len()) as u64)
    }

    async fn get_statistics(&self, window: Duration) -> Result<JobStatistics> {
        let now = self.clock.now();
        let storage = self.storage.read().await;
        Ok(JobStatistics::from_jobs(
            storage.jobs.values().map(|row| &row.job),
            window,
            now,
        ))
    }
}
