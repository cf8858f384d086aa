use crate::{BatchworkError, Result, priority::DEFAULT_PRIORITY};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub type JobId = Uuid;

/// Attempts allowed before a job is marked terminally failed.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
        JobStatus::Cancelled,
    ];

    /// Convert to string for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from string from database
    pub fn parse_from_db(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(BatchworkError::Processing(format!(
                "Invalid job status: {}",
                s
            ))),
        }
    }

    /// Waiting to be picked up by a tick.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::Retrying)
    }

    /// Eligible for retention cleanup.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    /// Last reported progress, 0-100.
    pub progress: u8,
    pub progress_message: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Builds a fresh `queued` row stamped at `now`.
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: &QueueOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let scheduled_at = chrono::Duration::from_std(options.delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            payload,
            priority: options.priority,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            progress: 0,
            progress_message: None,
            error_message: None,
            created_at: now,
            scheduled_at,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Queued or retrying with `scheduled_at` in the past.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_pending() && self.scheduled_at <= now
    }

    pub fn has_exhausted_attempts(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Options accepted by [`JobStore::queue_job`](crate::queue::JobStore::queue_job).
///
/// # Examples
///
/// ```rust
/// use batchwork::{JobPriority, QueueOptions};
/// use std::time::Duration;
///
/// let options = QueueOptions::new()
///     .with_priority(JobPriority::High)
///     .with_delay(Duration::from_secs(10))
///     .with_max_attempts(5);
/// assert_eq!(options.priority, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub priority: i32,
    pub delay: Duration,
    pub max_attempts: i32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            delay: Duration::ZERO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}
