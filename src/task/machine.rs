use super::{
    dispatch::{BatchDispatcher, ManualDispatcher},
    model::{BatchId, GenerationTask, NewTask, TaskId, TaskStatus},
    store::{CasOutcome, TaskFilter, TaskStore},
    transition::{Effect, ItemResult, TaskEvent, deletion_effects, transition},
};
use crate::{
    BatchworkError, Result,
    clock::{Clock, SharedClock},
    config::TaskConfig,
    job::JobId,
    polling::PollingQueueAdapter,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bulk operations offered to admin surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum BulkAction {
    Run,
    Cancel,
    Retry,
    Delete,
    Pause,
    Resume,
    Priority(i32),
}

impl BulkAction {
    /// Whether the action applies to a task in its current state.
    pub fn is_eligible(&self, task: &GenerationTask) -> bool {
        match self {
            Self::Run => match task.status {
                TaskStatus::Pending | TaskStatus::Cancelled => true,
                TaskStatus::Failed => task.can_retry(),
                _ => false,
            },
            Self::Cancel => matches!(task.status, TaskStatus::Pending | TaskStatus::Processing),
            Self::Retry => task.can_retry(),
            Self::Delete => !task.status.is_active(),
            Self::Pause => task.status == TaskStatus::Processing,
            Self::Resume => task.status == TaskStatus::Paused,
            Self::Priority(_) => !task.status.is_terminal(),
        }
    }
}

/// Per-task outcome of a [`TaskStateMachine::bulk_action`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkActionReport {
    pub applied: Vec<TaskId>,
    /// Tasks whose status did not allow the action
    pub skipped: Vec<(TaskId, TaskStatus)>,
    pub missing: Vec<TaskId>,
    /// Tasks where the action was attempted and returned an error
    pub failed: Vec<(TaskId, String)>,
}

impl BulkActionReport {
    pub fn total(&self) -> usize {
        self.applied.len() + self.skipped.len() + self.missing.len() + self.failed.len()
    }
}

/// Owns every task write.
///
/// Each operation loads the task, runs the pure [`transition`], and stores the
/// result with a compare-and-swap on `version`. A stale write reloads and reapplies
/// the event, up to `max_cas_retries` times, before failing with
/// [`BatchworkError::VersionConflict`]. Effects run only after the write landed.
#[derive(Clone)]
pub struct TaskStateMachine {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<dyn BatchDispatcher>,
    polling: PollingQueueAdapter,
    clock: SharedClock,
    config: TaskConfig,
}

impl std::fmt::Debug for TaskStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStateMachine")
            .field("config", &self.config)
            .finish()
    }
}

impl TaskStateMachine {
    /// Machine whose batches are driven by the caller.
    pub fn new(store: Arc<dyn TaskStore>, clock: SharedClock) -> Self {
        Self {
            store,
            dispatcher: Arc::new(ManualDispatcher),
            polling: PollingQueueAdapter::with_shared_clock(clock.clone()),
            clock,
            config: TaskConfig::default(),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn BatchDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_polling(mut self, polling: PollingQueueAdapter) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    pub fn polling(&self) -> &PollingQueueAdapter {
        &self.polling
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub async fn create_task(&self, new: NewTask) -> Result<GenerationTask> {
        let task = GenerationTask::new(
            new,
            self.config.default_batch_size,
            self.config.default_max_retries,
            self.clock.now(),
        );
        let stored = self.store.insert(&task).await?;
        info!(
            task_id = %stored.id,
            workflow_type = %stored.workflow_type,
            total_items = stored.total_items,
            batches = stored.batches.len(),
            "Created generation task"
        );
        Ok(stored)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<GenerationTask>> {
        self.store.load(task_id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<GenerationTask>> {
        self.store.list(filter).await
    }

    pub async fn start_task(&self, task_id: TaskId) -> Result<GenerationTask> {
        self.apply(task_id, TaskEvent::Start).await
    }

    /// Mark a batch as processing. A no-op once the task is no longer running.
    pub async fn begin_batch(&self, task_id: TaskId, batch_id: BatchId) -> Result<GenerationTask> {
        self.apply(task_id, TaskEvent::BeginBatch { batch_id }).await
    }

    pub async fn record_item_result(
        &self,
        task_id: TaskId,
        batch_id: BatchId,
        result: ItemResult,
    ) -> Result<GenerationTask> {
        self.update_batch(task_id, batch_id, vec![result]).await
    }

    /// Record several item results in one write.
    pub async fn update_batch(
        &self,
        task_id: TaskId,
        batch_id: BatchId,
        results: Vec<ItemResult>,
    ) -> Result<GenerationTask> {
        self.apply(task_id, TaskEvent::ItemResults { batch_id, results })
            .await
    }

    pub async fn fail_task(&self, task_id: TaskId, error: impl Into<String>) -> Result<GenerationTask> {
        self.apply(
            task_id,
            TaskEvent::Fail {
                error: error.into(),
            },
        )
        .await
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> Result<GenerationTask> {
        self.apply(task_id, TaskEvent::Cancel).await
    }

    pub async fn pause_task(&self, task_id: TaskId) -> Result<GenerationTask> {
        self.apply(task_id, TaskEvent::Pause).await
    }

    pub async fn resume_task(&self, task_id: TaskId) -> Result<GenerationTask> {
        self.apply(task_id, TaskEvent::Resume).await
    }

    pub async fn retry_task(&self, task_id: TaskId) -> Result<GenerationTask> {
        self.apply(task_id, TaskEvent::Retry).await
    }

    /// Start, retry, or restart a task depending on its status.
    pub async fn run_task(&self, task_id: TaskId) -> Result<GenerationTask> {
        self.apply(task_id, TaskEvent::Run).await
    }

    pub async fn set_priority(&self, task_id: TaskId, priority: i32) -> Result<GenerationTask> {
        self.apply(task_id, TaskEvent::SetPriority(priority)).await
    }

    /// Time out every processing task that has run longer than the configured
    /// threshold. Returns the ids of the tasks that timed out.
    pub async fn check_timeouts(&self) -> Result<Vec<TaskId>> {
        let processing = self
            .store
            .list(&TaskFilter::new().with_status(TaskStatus::Processing))
            .await?;
        let event = TaskEvent::CheckTimeout {
            threshold: self.config.timeout_threshold,
        };

        let mut timed_out = Vec::new();
        for task in processing {
            match self.apply(task.id, event.clone()).await {
                Ok(updated) if updated.status == TaskStatus::TimedOut => {
                    warn!(task_id = %task.id, "Task timed out");
                    timed_out.push(task.id);
                }
                Ok(_) => {}
                Err(e @ (BatchworkError::Database(_) | BatchworkError::Io(_))) => return Err(e),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Timeout check failed, continuing sweep");
                }
            }
        }
        Ok(timed_out)
    }

    /// Delete a task that is not running. Returns `false` if it does not exist.
    pub async fn delete_task(&self, task_id: TaskId) -> Result<bool> {
        let mut conflicts = 0;
        loop {
            let Some(task) = self.store.load(task_id).await? else {
                return Ok(false);
            };
            if task.status.is_active() {
                return Err(BatchworkError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: task.status.to_string(),
                    action: "delete".to_string(),
                });
            }

            if self.store.delete(task_id, task.version).await? {
                self.run_effects(&task, deletion_effects(&task)).await?;
                info!(task_id = %task_id, "Deleted generation task");
                return Ok(true);
            }

            conflicts += 1;
            if conflicts > self.config.max_cas_retries {
                return Err(BatchworkError::VersionConflict {
                    task_id: task_id.to_string(),
                    attempts: conflicts,
                });
            }
        }
    }

    /// Apply `action` to each task, skipping the ones it does not apply to.
    pub async fn bulk_action(&self, action: BulkAction, task_ids: &[TaskId]) -> Result<BulkActionReport> {
        let mut report = BulkActionReport::default();

        for &task_id in task_ids {
            let Some(task) = self.store.load(task_id).await? else {
                report.missing.push(task_id);
                continue;
            };
            if !action.is_eligible(&task) {
                debug!(task_id = %task_id, status = %task.status, ?action, "Bulk action skipped");
                report.skipped.push((task_id, task.status));
                continue;
            }

            let result = match action {
                BulkAction::Run => self.run_task(task_id).await.map(|_| ()),
                BulkAction::Cancel => self.cancel_task(task_id).await.map(|_| ()),
                BulkAction::Retry => self.retry_task(task_id).await.map(|_| ()),
                BulkAction::Pause => self.pause_task(task_id).await.map(|_| ()),
                BulkAction::Resume => self.resume_task(task_id).await.map(|_| ()),
                BulkAction::Priority(priority) => {
                    self.set_priority(task_id, priority).await.map(|_| ())
                }
                BulkAction::Delete => self.delete_task(task_id).await.map(|_| ()),
            };

            match result {
                Ok(()) => report.applied.push(task_id),
                Err(e @ (BatchworkError::Database(_) | BatchworkError::Io(_))) => return Err(e),
                Err(e) => {
                    warn!(task_id = %task_id, ?action, error = %e, "Bulk action failed");
                    report.failed.push((task_id, e.to_string()));
                }
            }
        }

        info!(
            ?action,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            missing = report.missing.len(),
            failed = report.failed.len(),
            "Bulk action finished"
        );
        Ok(report)
    }

    /// Drop expired task records from the store.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.store.purge_expired().await
    }

    async fn apply(&self, task_id: TaskId, event: TaskEvent) -> Result<GenerationTask> {
        let (task, effects) = self.write(task_id, &event).await?;
        if effects.is_empty() {
            return Ok(task);
        }
        match self.run_effects(&task, effects).await? {
            Some(updated) => Ok(updated),
            None => Ok(task),
        }
    }

    /// CAS loop: load, transition, compare-and-swap, reload on conflict.
    async fn write(&self, task_id: TaskId, event: &TaskEvent) -> Result<(GenerationTask, Vec<Effect>)> {
        let mut conflicts = 0;
        let mut current = self.load_required(task_id).await?;

        loop {
            let next = transition(&current, event, self.clock.now())?;
            if !next.changed {
                return Ok((current, Vec::new()));
            }

            match self.store.compare_and_swap(&next.task, current.version).await? {
                CasOutcome::Stored(stored) => {
                    debug!(
                        task_id = %task_id,
                        action = event.action(),
                        status = %stored.status,
                        version = stored.version,
                        "Task updated"
                    );
                    return Ok((stored, next.effects));
                }
                CasOutcome::Conflict(latest) => {
                    conflicts += 1;
                    if conflicts > self.config.max_cas_retries {
                        return Err(BatchworkError::VersionConflict {
                            task_id: task_id.to_string(),
                            attempts: conflicts,
                        });
                    }
                    debug!(task_id = %task_id, conflicts, "Stale task version, reapplying");
                    current = match latest {
                        Some(latest) => latest,
                        None => self.load_required(task_id).await?,
                    };
                }
            }
        }
    }

    async fn load_required(&self, task_id: TaskId) -> Result<GenerationTask> {
        self.store
            .load(task_id)
            .await?
            .ok_or_else(|| BatchworkError::TaskNotFound {
                id: task_id.to_string(),
            })
    }

    /// Run effects for a stored task. Returns the task again if recording the
    /// dispatched trigger jobs wrote a newer version.
    async fn run_effects(&self, task: &GenerationTask, effects: Vec<Effect>) -> Result<Option<GenerationTask>> {
        let mut updated = None;

        for effect in effects {
            match effect {
                Effect::DispatchBatches(batch_ids) => {
                    let mut assignments: Vec<(BatchId, JobId)> = Vec::new();
                    for batch_id in batch_ids {
                        let Some(batch) = task.batch(batch_id) else {
                            continue;
                        };
                        if let Some(job_id) = self.dispatcher.dispatch(task, batch).await? {
                            assignments.push((batch_id, job_id));
                        }
                    }
                    if !assignments.is_empty() {
                        let (stored, _) = self
                            .write(task.id, &TaskEvent::AssignTriggers(assignments))
                            .await?;
                        updated = Some(stored);
                    }
                }
                Effect::RevokeTriggers(job_ids) => {
                    for job_id in job_ids {
                        if let Err(e) = self.dispatcher.revoke(job_id).await {
                            warn!(task_id = %task.id, job_id = %job_id, error = %e, "Failed to revoke batch trigger");
                        }
                    }
                }
                Effect::RegisterPolling => {
                    self.polling
                        .add_to_queue(task.id, &task.workflow_type, &task.item_ids(), task.priority)
                        .await;
                }
                Effect::ReleasePolling => {
                    self.polling.mark_generation_complete(task.id).await;
                }
                Effect::UpdatePollingPriority => {
                    self.polling.set_priority(task.id, task.priority).await;
                }
            }
        }

        Ok(updated)
    }
}
