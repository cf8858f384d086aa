//! Versioned task storage.
//!
//! Every task write is a compare-and-swap on `version`: the write lands only if the
//! stored version still equals the version the writer read, and the stored copy
//! gets `version + 1`. Records carry an expiry (`task_ttl`) refreshed on each write;
//! expired records are invisible to readers and removed by
//! [`TaskStore::purge_expired`].

use super::model::{GenerationTask, TaskId, TaskStatus};
use crate::{
    BatchworkError, Result,
    clock::{Clock, SharedClock},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;

/// Result of a [`TaskStore::compare_and_swap`].
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// Written; carries the stored copy with its new version.
    Stored(GenerationTask),
    /// The stored version moved on (or the record is gone).
    Conflict(Option<GenerationTask>),
}

/// Query for [`TaskStore::list`]; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub workflow_type: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_workflow_type(mut self, workflow_type: impl Into<String>) -> Self {
        self.workflow_type = Some(workflow_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, task: &GenerationTask) -> bool {
        self.status.is_none_or(|status| task.status == status)
            && self
                .workflow_type
                .as_deref()
                .is_none_or(|workflow| task.workflow_type == workflow)
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Store a new task at version 1. Returns the stored copy.
    async fn insert(&self, task: &GenerationTask) -> Result<GenerationTask>;

    async fn load(&self, task_id: TaskId) -> Result<Option<GenerationTask>>;

    /// Replace the stored task if its version equals `expected_version`.
    async fn compare_and_swap(
        &self,
        task: &GenerationTask,
        expected_version: u64,
    ) -> Result<CasOutcome>;

    /// Delete the task if its version equals `expected_version`.
    async fn delete(&self, task_id: TaskId, expected_version: u64) -> Result<bool>;

    /// Matching tasks ordered by creation time.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<GenerationTask>>;

    /// Remove expired records; returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

#[derive(Debug, Clone)]
struct StoredTask {
    task: GenerationTask,
    expires_at: DateTime<Utc>,
}

/// In-memory task store.
#[derive(Debug, Clone)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<TaskId, StoredTask>>>,
    clock: SharedClock,
    ttl: Duration,
}

impl InMemoryTaskStore {
    /// Store with the wall clock and a seven day TTL.
    pub fn new() -> Self {
        Self::with_shared_clock(crate::clock::system_clock(), crate::config::TaskConfig::default().task_ttl)
    }

    pub fn with_clock<C: Clock + 'static>(clock: C, ttl: Duration) -> Self {
        Self::with_shared_clock(Arc::new(clock), ttl)
    }

    pub fn with_shared_clock(clock: SharedClock, ttl: Duration) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            clock,
            ttl,
        }
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &GenerationTask) -> Result<GenerationTask> {
        let now = self.clock.now();
        let mut stored = task.clone();
        stored.version = 1;

        let mut tasks = self.tasks.write().await;
        if tasks.get(&task.id).is_some_and(|existing| existing.expires_at > now) {
            return Err(BatchworkError::Processing(format!(
                "Task {} already exists",
                task.id
            )));
        }
        tasks.insert(
            task.id,
            StoredTask {
                task: stored.clone(),
                expires_at: self.expiry(now),
            },
        );
        Ok(stored)
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<GenerationTask>> {
        let now = self.clock.now();
        let tasks = self.tasks.read().await;
        Ok(tasks
            .get(&task_id)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| stored.task.clone()))
    }

    async fn compare_and_swap(
        &self,
        task: &GenerationTask,
        expected_version: u64,
    ) -> Result<CasOutcome> {
        let now = self.clock.now();
        let expires_at = self.expiry(now);
        let mut tasks = self.tasks.write().await;

        let Some(current) = tasks.get_mut(&task.id).filter(|s| s.expires_at > now) else {
            return Ok(CasOutcome::Conflict(None));
        };
        if current.task.version != expected_version {
            return Ok(CasOutcome::Conflict(Some(current.task.clone())));
        }

        let mut stored = task.clone();
        stored.version = expected_version + 1;
        current.task = stored.clone();
        current.expires_at = expires_at;
        Ok(CasOutcome::Stored(stored))
    }

    async fn delete(&self, task_id: TaskId, expected_version: u64) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get(&task_id) {
            Some(stored) if stored.task.version == expected_version => {
                tasks.remove(&task_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<GenerationTask>> {
        let now = self.clock.now();
        let tasks = self.tasks.read().await;
        let mut matching: Vec<GenerationTask> = tasks
            .values()
            .filter(|stored| stored.expires_at > now && filter.matches(&stored.task))
            .map(|stored| stored.task.clone())
            .collect();
        matching.sort_by_key(|task| (task.created_at, task.id));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, stored| stored.expires_at > now);
        Ok((before - tasks.len()) as u64)
    }
}
