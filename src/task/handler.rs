//! Runs `generation.batch` jobs against the task state machine.

use super::{
    dispatch::{BATCH_JOB_TYPE, BatchJobPayload},
    machine::TaskStateMachine,
    model::{GenerationTask, ItemStatus, TaskStatus},
    transition::ItemResult,
};
use crate::{
    Result,
    handler::{HandlerRegistry, JobContext, JobHandler},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Does the actual work for one item of a generation task.
///
/// An `Err` marks the item as failed; it does not fail the job.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process_item(&self, task: &GenerationTask, item_id: &str) -> Result<()>;
}

/// Adapts the state machine to `generation.batch` jobs.
///
/// For each job it begins the batch, runs the batch's pending items through the
/// [`ItemProcessor`] one at a time, and records each result. Items already
/// completed by an earlier attempt are skipped. Processing stops as soon as the
/// task leaves `processing`, e.g. after a pause or cancel.
#[derive(Clone)]
pub struct GenerationBatchHandler {
    machine: Arc<TaskStateMachine>,
    processor: Arc<dyn ItemProcessor>,
}

impl GenerationBatchHandler {
    pub fn new(machine: Arc<TaskStateMachine>, processor: Arc<dyn ItemProcessor>) -> Self {
        Self { machine, processor }
    }

    /// Register as the `generation.batch` handler.
    pub fn register(self, registry: &HandlerRegistry) {
        registry.register_handler(BATCH_JOB_TYPE, self.into_handler());
    }

    pub fn into_handler(self) -> JobHandler {
        let handler = Arc::new(self);
        Arc::new(move |ctx| {
            let handler = handler.clone();
            Box::pin(async move { handler.run(ctx).await })
        })
    }

    pub async fn run(&self, ctx: JobContext) -> Result<()> {
        let payload: BatchJobPayload = ctx.payload_as()?;

        let Some(task) = self.machine.get_task(payload.task_id).await? else {
            warn!(task_id = %payload.task_id, "Batch job for unknown task, nothing to do");
            return Ok(());
        };
        if !task.status.is_active() {
            debug!(task_id = %task.id, status = %task.status, "Task not running, batch job skipped");
            return Ok(());
        }

        let mut task = self.machine.begin_batch(task.id, payload.batch_id).await?;
        let Some(batch) = task.batch(payload.batch_id) else {
            return Ok(());
        };
        if batch.is_terminal() {
            return Ok(());
        }

        let pending = batch.pending_item_ids();
        let total = batch.items.len().max(1);
        let mut done = batch
            .items
            .iter()
            .filter(|item| item.status != ItemStatus::Pending)
            .count();

        for item_id in pending {
            if task.status != TaskStatus::Processing {
                info!(task_id = %task.id, status = %task.status, "Task left processing, stopping batch");
                break;
            }

            let result = match self.processor.process_item(&task, &item_id).await {
                Ok(()) => ItemResult::completed(&item_id),
                Err(e) => {
                    debug!(task_id = %task.id, item_id = %item_id, error = %e, "Item failed");
                    ItemResult::failed(&item_id, e.to_string())
                }
            };

            task = self
                .machine
                .record_item_result(task.id, payload.batch_id, result)
                .await?;

            done += 1;
            let percent = (done * 100 / total).min(100) as u8;
            ctx.update_progress(percent, Some(&format!("{}/{} items", done, total)))
                .await?;
        }

        Ok(())
    }
}
