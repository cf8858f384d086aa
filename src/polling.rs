//! Polling registry of in-flight generation items.
//!
//! External completion checks poll by item id rather than by job row. The adapter
//! keeps, per task, the flattened item ids of all its batches; the task state
//! machine registers a task when it starts, resumes, or retries and releases it when
//! the task finishes, fails permanently, times out, or is cancelled or deleted.

use crate::{
    clock::{Clock, SharedClock},
    task::TaskId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::debug;

/// One task registered for polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollingEntry {
    pub task_id: TaskId,
    pub workflow_type: String,
    pub item_ids: Vec<String>,
    pub priority: i32,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PollingQueueAdapter {
    entries: Arc<RwLock<HashMap<TaskId, PollingEntry>>>,
    clock: SharedClock,
}

impl Default for PollingQueueAdapter {
    fn default() -> Self {
        Self::with_shared_clock(crate::clock::system_clock())
    }
}

impl PollingQueueAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shared_clock(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Register a task's items, or merge them into an existing registration.
    ///
    /// Merging keeps the first-seen order and drops duplicates; the priority is
    /// updated, `added_at` is not.
    pub async fn add_to_queue(
        &self,
        task_id: TaskId,
        workflow_type: &str,
        item_ids: &[String],
        priority: i32,
    ) {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(task_id).or_insert_with(|| PollingEntry {
            task_id,
            workflow_type: workflow_type.to_string(),
            item_ids: Vec::new(),
            priority,
            added_at: now,
        });
        entry.priority = priority;

        for item_id in item_ids {
            if !entry.item_ids.contains(item_id) {
                entry.item_ids.push(item_id.clone());
            }
        }
        debug!(task_id = %task_id, items = entry.item_ids.len(), "Registered task for polling");
    }

    /// Change the priority of a registered task; returns whether it was registered.
    pub async fn set_priority(&self, task_id: TaskId, priority: i32) -> bool {
        match self.entries.write().await.get_mut(&task_id) {
            Some(entry) => {
                entry.priority = priority;
                true
            }
            None => false,
        }
    }

    /// Remove the task; returns whether it was registered.
    pub async fn mark_generation_complete(&self, task_id: TaskId) -> bool {
        self.entries.write().await.remove(&task_id).is_some()
    }

    pub async fn queued_items(&self, task_id: TaskId) -> Option<Vec<String>> {
        self.entries
            .read()
            .await
            .get(&task_id)
            .map(|entry| entry.item_ids.clone())
    }

    pub async fn is_queued(&self, task_id: TaskId) -> bool {
        self.entries.read().await.contains_key(&task_id)
    }

    /// Registered tasks ordered by `(priority, added_at)`.
    pub async fn pending_tasks(&self) -> Vec<PollingEntry> {
        let mut tasks: Vec<PollingEntry> = self.entries.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| (a.priority, a.added_at).cmp(&(b.priority, b.added_at)));
        tasks
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
