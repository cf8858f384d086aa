//! Pure task transitions.
//!
//! [`transition`] takes the current task, an event, and the current time and returns
//! the next task state plus the side effects to run once that state is persisted.
//! Nothing here touches storage, the job queue, or the clock, so every rule can be
//! tested on plain values.

use super::model::{BatchId, BatchStatus, GenerationTask, ItemStatus, TaskStatus};
use crate::{BatchworkError, Result, job::JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome reported for one batch item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub item_id: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemResult {
    pub fn completed(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            status: ItemStatus::Completed,
            error: None,
        }
    }

    pub fn failed(item_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            status: ItemStatus::Failed,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Start,
    /// Bulk "run": start, retry, or restart depending on the current status
    Run,
    BeginBatch { batch_id: BatchId },
    ItemResults { batch_id: BatchId, results: Vec<ItemResult> },
    Fail { error: String },
    Cancel,
    Pause,
    Resume,
    Retry,
    CheckTimeout { threshold: Duration },
    SetPriority(i32),
    /// Remember the trigger jobs queued for batches
    AssignTriggers(Vec<(BatchId, JobId)>),
}

impl TaskEvent {
    /// Verb used in transition errors.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Run => "run",
            Self::BeginBatch { .. } => "begin batch",
            Self::ItemResults { .. } => "record results",
            Self::Fail { .. } => "fail",
            Self::Cancel => "cancel",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Retry => "retry",
            Self::CheckTimeout { .. } => "time out",
            Self::SetPriority(_) => "change priority",
            Self::AssignTriggers(_) => "assign triggers",
        }
    }
}

/// Work to run after the new task state has been stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Queue a trigger job for each batch
    DispatchBatches(Vec<BatchId>),
    /// Cancel previously queued trigger jobs
    RevokeTriggers(Vec<JobId>),
    /// Register the task's items with the polling adapter
    RegisterPolling,
    /// Remove the task from the polling adapter
    ReleasePolling,
    /// Carry the task's priority over to its polling registration, if any
    UpdatePollingPriority,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub task: GenerationTask,
    pub effects: Vec<Effect>,
    /// `false` when the event was a no-op and nothing should be written
    pub changed: bool,
}

impl Transition {
    fn unchanged(task: &GenerationTask) -> Self {
        Self {
            task: task.clone(),
            effects: Vec::new(),
            changed: false,
        }
    }

    fn changed(mut task: GenerationTask, effects: Vec<Effect>, now: DateTime<Utc>) -> Self {
        task.recompute_progress();
        task.updated_at = now;
        Self {
            task,
            effects,
            changed: true,
        }
    }
}

fn invalid(task: &GenerationTask, event: &TaskEvent) -> BatchworkError {
    BatchworkError::InvalidTransition {
        task_id: task.id.to_string(),
        from: task.status.to_string(),
        action: event.action().to_string(),
    }
}

/// Compute the next state of `task` for `event` at `now`.
pub fn transition(task: &GenerationTask, event: &TaskEvent, now: DateTime<Utc>) -> Result<Transition> {
    match event {
        TaskEvent::Start => match task.status {
            TaskStatus::Pending => Ok(start(task.clone(), now)),
            _ => Err(invalid(task, event)),
        },

        TaskEvent::Run => match task.status {
            TaskStatus::Pending => Ok(start(task.clone(), now)),
            TaskStatus::Failed if task.can_retry() => Ok(retry(task.clone(), now)),
            TaskStatus::Cancelled => Ok(restart(task.clone(), now)),
            _ => Err(invalid(task, event)),
        },

        TaskEvent::BeginBatch { batch_id } => {
            if !task.status.is_active() {
                return Ok(Transition::unchanged(task));
            }
            let mut next = task.clone();
            activate(&mut next, now);
            let batch = next.batch_mut(*batch_id)?;
            if batch.status != BatchStatus::Pending {
                return Ok(Transition::unchanged(task));
            }
            batch.status = BatchStatus::Processing;
            batch.started_at = Some(now);
            Ok(Transition::changed(next, Vec::new(), now))
        }

        TaskEvent::ItemResults { batch_id, results } => {
            if !task.status.is_active() {
                return Ok(Transition::unchanged(task));
            }
            let mut next = task.clone();
            activate(&mut next, now);

            let batch = next.batch_mut(*batch_id)?;
            if batch.is_terminal() {
                return Ok(Transition::unchanged(task));
            }

            let mut applied = 0;
            for result in results {
                if result.status == ItemStatus::Pending {
                    continue;
                }
                if let Some(item) = batch
                    .items
                    .iter_mut()
                    .find(|item| item.item_id == result.item_id && item.status == ItemStatus::Pending)
                {
                    item.status = result.status;
                    item.error = result.error.clone();
                    applied += 1;
                }
            }
            if applied == 0 {
                return Ok(Transition::unchanged(task));
            }

            if batch.status == BatchStatus::Pending {
                batch.status = BatchStatus::Processing;
                batch.started_at = Some(now);
            }
            batch.recompute_stats();
            batch.settle(now);

            let effects = settle_task(&mut next, now);
            Ok(Transition::changed(next, effects, now))
        }

        TaskEvent::Fail { error } => match task.status {
            status if status.is_terminal() => Ok(Transition::unchanged(task)),
            TaskStatus::Processing | TaskStatus::Retrying | TaskStatus::Paused => {
                let mut next = task.clone();
                next.paused_at = None;
                next.paused_from_status = None;
                let effects = fail(&mut next, error.clone(), now);
                Ok(Transition::changed(next, effects, now))
            }
            _ => Err(invalid(task, event)),
        },

        TaskEvent::Cancel => match task.status {
            status if status.is_terminal() => Ok(Transition::unchanged(task)),
            TaskStatus::Pending | TaskStatus::Processing => {
                let mut next = task.clone();
                let revoked = live_triggers(&next);
                for batch in next.batches.iter_mut().filter(|b| !b.is_terminal()) {
                    batch.cancel(now);
                }
                next.status = TaskStatus::Cancelled;
                next.cancelled_at = Some(now);
                Ok(Transition::changed(
                    next,
                    vec![Effect::RevokeTriggers(revoked), Effect::ReleasePolling],
                    now,
                ))
            }
            _ => Err(invalid(task, event)),
        },

        TaskEvent::Pause => match task.status {
            TaskStatus::Processing => {
                let mut next = task.clone();
                let revoked = clear_triggers(&mut next);
                next.paused_from_status = Some(next.status);
                next.status = TaskStatus::Paused;
                next.paused_at = Some(now);
                Ok(Transition::changed(next, vec![Effect::RevokeTriggers(revoked)], now))
            }
            _ => Err(invalid(task, event)),
        },

        TaskEvent::Resume => match task.status {
            TaskStatus::Paused => {
                let mut next = task.clone();
                if let Some(paused_at) = next.paused_at {
                    next.paused_millis += (now - paused_at).num_milliseconds().max(0);
                }
                next.status = next.paused_from_status.take().unwrap_or(TaskStatus::Processing);
                next.paused_at = None;
                let dispatch = unfinished_batches(&next);
                Ok(Transition::changed(
                    next,
                    vec![Effect::DispatchBatches(dispatch), Effect::RegisterPolling],
                    now,
                ))
            }
            _ => Err(invalid(task, event)),
        },

        TaskEvent::Retry => {
            if task.can_retry() {
                Ok(retry(task.clone(), now))
            } else {
                Err(invalid(task, event))
            }
        }

        TaskEvent::CheckTimeout { threshold } => {
            let threshold = chrono::Duration::from_std(*threshold).unwrap_or(chrono::Duration::MAX);
            match (task.status, task.running_time(now)) {
                (TaskStatus::Processing, Some(running)) if running > threshold => {
                    let mut next = task.clone();
                    let revoked = clear_triggers(&mut next);
                    next.status = TaskStatus::TimedOut;
                    next.timed_out_at = Some(now);
                    next.error_message = Some(format!(
                        "Task exceeded timeout of {}s",
                        threshold.num_seconds()
                    ));
                    Ok(Transition::changed(
                        next,
                        vec![Effect::RevokeTriggers(revoked), Effect::ReleasePolling],
                        now,
                    ))
                }
                _ => Ok(Transition::unchanged(task)),
            }
        }

        TaskEvent::SetPriority(priority) => {
            if task.status.is_terminal() {
                return Err(invalid(task, event));
            }
            if task.priority == *priority {
                return Ok(Transition::unchanged(task));
            }
            let mut next = task.clone();
            next.priority = *priority;

            // Batches still waiting in the queue are re-queued at the new priority
            let mut effects = Vec::new();
            if next.status.is_active() {
                let (revoked, requeued) = take_queued_triggers(&mut next);
                if !revoked.is_empty() {
                    effects.push(Effect::RevokeTriggers(revoked));
                    effects.push(Effect::DispatchBatches(requeued));
                }
            }
            effects.push(Effect::UpdatePollingPriority);
            Ok(Transition::changed(next, effects, now))
        }

        TaskEvent::AssignTriggers(assignments) => {
            let mut next = task.clone();
            let mut applied = false;
            for (batch_id, job_id) in assignments {
                if let Some(batch) = next.batches.iter_mut().find(|b| b.batch_id == *batch_id) {
                    if !batch.is_terminal() && batch.job_id != Some(*job_id) {
                        batch.job_id = Some(*job_id);
                        applied = true;
                    }
                }
            }
            if applied {
                Ok(Transition::changed(next, Vec::new(), now))
            } else {
                Ok(Transition::unchanged(task))
            }
        }
    }
}

/// Effects of deleting `task`: revoke its queued triggers and stop polling it.
pub fn deletion_effects(task: &GenerationTask) -> Vec<Effect> {
    vec![Effect::RevokeTriggers(live_triggers(task)), Effect::ReleasePolling]
}

/// `pending -> processing`, dispatching every batch.
fn start(mut task: GenerationTask, now: DateTime<Utc>) -> Transition {
    task.status = TaskStatus::Processing;
    task.started_at = Some(now);
    task.paused_millis = 0;
    task.error_message = None;

    let mut effects = vec![
        Effect::DispatchBatches(unfinished_batches(&task)),
        Effect::RegisterPolling,
    ];
    effects.extend(settle_task(&mut task, now));
    Transition::changed(task, effects, now)
}

/// `failed -> retrying` with failed and cancelled work reset to pending.
fn retry(mut task: GenerationTask, now: DateTime<Utc>) -> Transition {
    task.retry_count += 1;
    task.status = TaskStatus::Retrying;
    task.error_message = None;
    for batch in &mut task.batches {
        batch.reset_unfinished();
    }
    let effects = vec![
        Effect::DispatchBatches(unfinished_batches(&task)),
        Effect::RegisterPolling,
    ];
    Transition::changed(task, effects, now)
}

/// `cancelled -> processing` with unfinished work reset.
fn restart(mut task: GenerationTask, now: DateTime<Utc>) -> Transition {
    for batch in &mut task.batches {
        batch.reset_unfinished();
    }
    task.status = TaskStatus::Processing;
    task.started_at = Some(now);
    task.paused_millis = 0;
    task.completed_at = None;
    task.cancelled_at = None;
    task.error_message = None;

    let mut effects = vec![
        Effect::DispatchBatches(unfinished_batches(&task)),
        Effect::RegisterPolling,
    ];
    effects.extend(settle_task(&mut task, now));
    Transition::changed(task, effects, now)
}

/// `retrying -> processing` when the first retried batch reports in.
fn activate(task: &mut GenerationTask, now: DateTime<Utc>) {
    if task.status == TaskStatus::Retrying {
        task.status = TaskStatus::Processing;
        task.started_at = Some(now);
        task.paused_millis = 0;
    }
}

/// Settle the task once every batch is terminal.
fn settle_task(task: &mut GenerationTask, now: DateTime<Utc>) -> Vec<Effect> {
    if !task.all_batches_terminal() {
        return Vec::new();
    }
    task.recompute_progress();

    let completed = task.processed_count();
    let failed = task.failed_count();
    if completed == task.total_items {
        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        vec![Effect::ReleasePolling]
    } else if completed > 0 {
        task.status = TaskStatus::CompletedWithErrors;
        task.completed_at = Some(now);
        task.error_message = Some(format!("{} of {} items failed", failed, task.total_items));
        vec![Effect::ReleasePolling]
    } else {
        fail(task, format!("All {} items failed", task.total_items), now)
    }
}

/// Failure branch: `failed` while retries remain, else `failed_permanent`.
fn fail(task: &mut GenerationTask, error: String, now: DateTime<Utc>) -> Vec<Effect> {
    let revoked = clear_triggers(task);
    task.failed_at = Some(now);
    task.error_message = Some(error);

    let mut effects = vec![Effect::RevokeTriggers(revoked)];
    if task.retry_count < task.max_retries {
        task.status = TaskStatus::Failed;
    } else {
        task.status = TaskStatus::FailedPermanent;
        effects.push(Effect::ReleasePolling);
    }
    effects
}

fn unfinished_batches(task: &GenerationTask) -> Vec<BatchId> {
    task.batches
        .iter()
        .filter(|b| !b.is_terminal())
        .map(|b| b.batch_id)
        .collect()
}

fn live_triggers(task: &GenerationTask) -> Vec<JobId> {
    task.batches
        .iter()
        .filter(|b| !b.is_terminal())
        .filter_map(|b| b.job_id)
        .collect()
}

/// Detach the trigger jobs of batches that have not begun. Returns the
/// revoked job ids and the batches to dispatch again.
fn take_queued_triggers(task: &mut GenerationTask) -> (Vec<JobId>, Vec<BatchId>) {
    let mut revoked = Vec::new();
    let mut requeued = Vec::new();
    for batch in task
        .batches
        .iter_mut()
        .filter(|b| b.status == BatchStatus::Pending)
    {
        if let Some(job_id) = batch.job_id.take() {
            revoked.push(job_id);
            requeued.push(batch.batch_id);
        }
    }
    (revoked, requeued)
}

fn clear_triggers(task: &mut GenerationTask) -> Vec<JobId> {
    let revoked = live_triggers(task);
    for batch in task.batches.iter_mut().filter(|b| !b.is_terminal()) {
        batch.job_id = None;
    }
    revoked
}
