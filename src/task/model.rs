use crate::{BatchworkError, Result, job::JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TaskId = Uuid;
pub type BatchId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
    Retrying,
    FailedPermanent,
    Cancelled,
    Paused,
    TimedOut,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 10] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::CompletedWithErrors,
        TaskStatus::Failed,
        TaskStatus::Retrying,
        TaskStatus::FailedPermanent,
        TaskStatus::Cancelled,
        TaskStatus::Paused,
        TaskStatus::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::FailedPermanent => "failed_permanent",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse_from_db(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BatchworkError::Processing(format!("Invalid task status: {}", s)))
    }

    /// No automatic transition leaves these statuses.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::FailedPermanent | Self::TimedOut
        )
    }

    /// Batches of the task accept results.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing | Self::Retrying)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    CompletedWithErrors,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::CompletedWithErrors => "completed_with_errors",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchItem {
    pub item_id: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItem {
    pub fn pending(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            status: ItemStatus::Pending,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub batch_id: BatchId,
    pub task_id: TaskId,
    /// Position of the batch inside its task
    pub index: usize,
    pub status: BatchStatus,
    pub items: Vec<BatchItem>,
    pub stats: BatchStats,
    /// Trigger job currently queued for this batch
    pub job_id: Option<JobId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(task_id: TaskId, index: usize, item_ids: Vec<String>) -> Self {
        let items: Vec<BatchItem> = item_ids.into_iter().map(BatchItem::pending).collect();
        let mut batch = Self {
            batch_id: Uuid::new_v4(),
            task_id,
            index,
            status: BatchStatus::Pending,
            items,
            stats: BatchStats::default(),
            job_id: None,
            started_at: None,
            completed_at: None,
        };
        batch.recompute_stats();
        batch
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn item_ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.item_id.as_str())
    }

    pub fn pending_item_ids(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Pending)
            .map(|item| item.item_id.clone())
            .collect()
    }

    pub(crate) fn recompute_stats(&mut self) {
        self.stats = BatchStats {
            total: self.items.len(),
            completed: self.count(ItemStatus::Completed),
            failed: self.count(ItemStatus::Failed),
        };
    }

    fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|item| item.status == status).count()
    }

    /// Move to a terminal status once no item is pending.
    pub(crate) fn settle(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() || self.items.iter().any(|i| i.status == ItemStatus::Pending) {
            return false;
        }
        self.status = match (self.stats.completed, self.stats.failed) {
            (completed, _) if completed == self.stats.total => BatchStatus::Completed,
            (0, _) => BatchStatus::Failed,
            _ => BatchStatus::CompletedWithErrors,
        };
        self.completed_at = Some(now);
        self.job_id = None;
        true
    }

    /// Reset failed and cancelled items so the batch can run again.
    pub(crate) fn reset_unfinished(&mut self) {
        if self.status == BatchStatus::Completed {
            return;
        }
        for item in &mut self.items {
            if matches!(item.status, ItemStatus::Failed | ItemStatus::Cancelled) {
                item.status = ItemStatus::Pending;
                item.error = None;
            }
        }
        self.status = BatchStatus::Pending;
        self.completed_at = None;
        self.job_id = None;
        self.recompute_stats();
    }

    pub(crate) fn cancel(&mut self, now: DateTime<Utc>) {
        for item in &mut self.items {
            if item.status == ItemStatus::Pending {
                item.status = ItemStatus::Cancelled;
            }
        }
        self.status = BatchStatus::Cancelled;
        self.completed_at = Some(now);
        self.job_id = None;
        self.recompute_stats();
    }
}

/// Input for [`TaskStateMachine::create_task`](super::TaskStateMachine::create_task).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub workflow_type: String,
    pub item_ids: Vec<String>,
    /// Items per batch; falls back to the configured default
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_priority() -> i32 {
    crate::priority::DEFAULT_PRIORITY
}

impl NewTask {
    pub fn new(workflow_type: impl Into<String>, item_ids: Vec<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            item_ids,
            batch_size: None,
            priority: default_priority(),
            max_retries: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A unit of generation work split into ordered batches.
///
/// `processed_count` and `progress` are derived from the batch items and are
/// recomputed on every mutation; they have getters but no setters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationTask {
    pub id: TaskId,
    pub workflow_type: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub total_items: usize,
    processed_count: usize,
    progress: f64,
    pub batches: Vec<Batch>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Bumped by the store on every successful write
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub timed_out_at: Option<DateTime<Utc>>,
    pub paused_from_status: Option<TaskStatus>,
    /// Time spent paused since `started_at`, excluded from the timeout
    #[serde(default)]
    pub paused_millis: i64,
    pub error_message: Option<String>,
}

impl GenerationTask {
    /// Partition `new.item_ids` into batches of `batch_size` items.
    pub fn new(new: NewTask, default_batch_size: usize, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4();
        let batch_size = new.batch_size.unwrap_or(default_batch_size).max(1);
        let total_items = new.item_ids.len();

        let batches = new
            .item_ids
            .chunks(batch_size)
            .enumerate()
            .map(|(index, chunk)| Batch::new(id, index, chunk.to_vec()))
            .collect();

        let mut task = Self {
            id,
            workflow_type: new.workflow_type,
            status: TaskStatus::Pending,
            priority: new.priority,
            total_items,
            processed_count: 0,
            progress: 0.0,
            batches,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            paused_at: None,
            timed_out_at: None,
            paused_from_status: None,
            paused_millis: 0,
            error_message: None,
        };
        task.recompute_progress();
        task
    }

    /// Completed items across all batches.
    pub fn processed_count(&self) -> usize {
        self.processed_count
    }

    /// `processed_count * 100 / total_items`, 0 for an empty task.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn failed_count(&self) -> usize {
        self.batches.iter().map(|b| b.stats.failed).sum()
    }

    pub fn batch(&self, batch_id: BatchId) -> Option<&Batch> {
        self.batches.iter().find(|b| b.batch_id == batch_id)
    }

    pub(crate) fn batch_mut(&mut self, batch_id: BatchId) -> Result<&mut Batch> {
        let task_id = self.id;
        self.batches
            .iter_mut()
            .find(|b| b.batch_id == batch_id)
            .ok_or_else(|| BatchworkError::BatchNotFound {
                task_id: task_id.to_string(),
                batch_id: batch_id.to_string(),
            })
    }

    /// Time since `started_at` minus time spent paused; `None` before the task starts.
    pub fn running_time(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let started_at = self.started_at?;
        let mut paused = chrono::Duration::milliseconds(self.paused_millis);
        if let Some(paused_at) = self.paused_at {
            paused = paused + (now - paused_at);
        }
        Some(now - started_at - paused)
    }

    /// Every item id of the task, in batch order.
    pub fn item_ids(&self) -> Vec<String> {
        self.batches
            .iter()
            .flat_map(|b| b.item_ids().map(str::to_string))
            .collect()
    }

    pub fn all_batches_terminal(&self) -> bool {
        self.batches.iter().all(Batch::is_terminal)
    }

    /// Re-derive `processed_count` and `progress` from batch items.
    pub(crate) fn recompute_progress(&mut self) {
        for batch in &mut self.batches {
            batch.recompute_stats();
        }
        self.processed_count = self.batches.iter().map(|b| b.stats.completed).sum();
        self.progress = if self.total_items == 0 {
            0.0
        } else {
            self.processed_count as f64 * 100.0 / self.total_items as f64
        };
    }

    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }
}
