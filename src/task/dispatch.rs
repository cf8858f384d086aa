//! How batches get driven.
//!
//! The state machine asks a [`BatchDispatcher`] to trigger a batch whenever a batch
//! becomes runnable (start, resume, retry, run) and to revoke the trigger when the
//! batch should stop (cancel, pause, timeout, delete). [`JobQueueDispatcher`] queues
//! one `generation.batch` job per batch; [`ManualDispatcher`] leaves driving the
//! batches to the caller.

use super::model::{Batch, BatchId, GenerationTask, TaskId};
use crate::{
    Result,
    job::{DEFAULT_MAX_ATTEMPTS, JobId, QueueOptions},
    queue::JobStore,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Job type of batch trigger jobs.
pub const BATCH_JOB_TYPE: &str = "generation.batch";

/// Payload of a `generation.batch` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobPayload {
    pub task_id: TaskId,
    pub batch_id: BatchId,
    pub workflow_type: String,
    pub item_ids: Vec<String>,
}

impl BatchJobPayload {
    pub fn for_batch(task: &GenerationTask, batch: &Batch) -> Self {
        Self {
            task_id: task.id,
            batch_id: batch.batch_id,
            workflow_type: task.workflow_type.clone(),
            item_ids: batch.item_ids().map(str::to_string).collect(),
        }
    }
}

#[async_trait]
pub trait BatchDispatcher: Send + Sync {
    /// Trigger `batch`; returns the job id when the trigger is a queued job.
    async fn dispatch(&self, task: &GenerationTask, batch: &Batch) -> Result<Option<JobId>>;

    async fn revoke(&self, job_id: JobId) -> Result<()>;
}

/// Queues a `generation.batch` job per batch at the task's priority.
#[derive(Clone)]
pub struct JobQueueDispatcher {
    store: Arc<dyn JobStore>,
    max_attempts: i32,
}

impl JobQueueDispatcher {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

#[async_trait]
impl BatchDispatcher for JobQueueDispatcher {
    async fn dispatch(&self, task: &GenerationTask, batch: &Batch) -> Result<Option<JobId>> {
        let payload = serde_json::to_value(BatchJobPayload::for_batch(task, batch))?;
        let options = QueueOptions::new()
            .with_priority(task.priority)
            .with_max_attempts(self.max_attempts);

        let job_id = self.store.queue_job(BATCH_JOB_TYPE, payload, options).await?;
        debug!(task_id = %task.id, batch_id = %batch.batch_id, job_id = %job_id, "Queued batch job");
        Ok(Some(job_id))
    }

    async fn revoke(&self, job_id: JobId) -> Result<()> {
        self.store.cancel_job(job_id).await?;
        Ok(())
    }
}

/// Dispatcher for callers that drive batches themselves through
/// `begin_batch`/`record_item_result`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualDispatcher;

#[async_trait]
impl BatchDispatcher for ManualDispatcher {
    async fn dispatch(&self, _task: &GenerationTask, _batch: &Batch) -> Result<Option<JobId>> {
        Ok(None)
    }

    async fn revoke(&self, _job_id: JobId) -> Result<()> {
        Ok(())
    }
}
