use crate::job::{Job, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

/// Job counts per status over a trailing time window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatistics {
    /// Jobs created inside the window
    pub total: u64,
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retrying: u64,
    pub cancelled: u64,
    /// failed / (completed + failed)
    pub error_rate: f64,
    /// Time window these statistics cover
    pub time_window: Duration,
    /// When these statistics were calculated
    pub calculated_at: DateTime<Utc>,
}

impl JobStatistics {
    pub fn empty(window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            total: 0,
            queued: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            retrying: 0,
            cancelled: 0,
            error_rate: 0.0,
            time_window: window,
            calculated_at: now,
        }
    }

    /// Builds statistics from per-status counts.
    pub fn from_counts(
        counts: &HashMap<JobStatus, u64>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stats = Self::empty(window, now);
        for (status, count) in counts {
            stats.add(*status, *count);
        }
        stats.finish();
        stats
    }

    /// Builds statistics from job rows created at or after `now - window`.
    pub fn from_jobs<'a>(
        jobs: impl IntoIterator<Item = &'a Job>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let cutoff = window_start(now, window);
        let mut stats = Self::empty(window, now);
        for job in jobs.into_iter().filter(|job| job.created_at >= cutoff) {
            stats.add(job.status, 1);
        }
        stats.finish();
        stats
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Retrying => self.retrying,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    fn add(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Retrying => &mut self.retrying,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
        self.total += count;
    }

    fn finish(&mut self) {
        let settled = self.completed + self.failed;
        self.error_rate = if settled > 0 {
            self.failed as f64 / settled as f64
        } else {
            0.0
        };
    }
}

/// Start of a trailing window, saturating on absurd windows.
pub(crate) fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::QueueOptions;
    use serde_json::json;

    fn job_with(status: JobStatus, created_at: DateTime<Utc>) -> Job {
        let mut job = Job::new("stats", json!({}), &QueueOptions::default(), created_at);
        job.status = status;
        job
    }

    #[test]
    fn test_statistics_from_jobs_respects_window() {
        let now = Utc::now();
        let jobs = vec![
            job_with(JobStatus::Completed, now),
            job_with(JobStatus::Completed, now - chrono::Duration::minutes(5)),
            job_with(JobStatus::Failed, now - chrono::Duration::minutes(10)),
            job_with(JobStatus::Queued, now - chrono::Duration::hours(3)),
        ];

        let stats = JobStatistics::from_jobs(&jobs, Duration::from_secs(3600), now);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queued, 0);
        assert!((stats.error_rate - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_statistics_from_counts() {
        let mut counts = HashMap::new();
        counts.insert(JobStatus::Queued, 4);
        counts.insert(JobStatus::Cancelled, 1);

        let stats = JobStatistics::from_counts(&counts, Duration::from_secs(60), Utc::now());

        assert_eq!(stats.total, 5);
        assert_eq!(stats.count(JobStatus::Queued), 4);
        assert_eq!(stats.count(JobStatus::Cancelled), 1);
        assert_eq!(stats.error_rate, 0.0);
    }

    #[test]
    fn test_window_start_saturates() {
        let now = Utc::now();
        assert_eq!(
            window_start(now, Duration::MAX),
            DateTime::<Utc>::MIN_UTC
        );
    }
}
