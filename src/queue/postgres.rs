//! PostgreSQL implementation of the job, lock, and task stores.
//!
//! All three contracts share the pool held by `JobQueue<Postgres>`. Tables are
//! created lazily on first use. Every timestamp bound into a query comes from the
//! queue's clock rather than `NOW()`, so a mock clock drives the database exactly
//! like it drives the in-memory stores.

use crate::{
    BatchworkError, Result,
    config::DatabaseConfig,
    job::{Job, JobId, JobStatus, QueueOptions},
    lock::LockStore,
    queue::{JobQueue, JobStore},
    stats::{JobStatistics, window_start},
    task::{CasOutcome, GenerationTask, TaskFilter, TaskId, TaskStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, Row, postgres::PgPoolOptions};
use std::{collections::HashMap, time::Duration};
use tracing::{debug, info};

const SCHEMA: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS batchwork_jobs (
        id UUID PRIMARY KEY,
        seq BIGSERIAL,
        job_type VARCHAR NOT NULL,
        payload JSONB NOT NULL,
        priority INTEGER NOT NULL,
        status VARCHAR NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        progress SMALLINT NOT NULL DEFAULT 0,
        progress_message TEXT,
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        scheduled_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_batchwork_jobs_ready
        ON batchwork_jobs (status, priority, scheduled_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_batchwork_jobs_created_at
        ON batchwork_jobs (created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS batchwork_locks (
        lock_key VARCHAR PRIMARY KEY,
        token VARCHAR NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS batchwork_tasks (
        id UUID PRIMARY KEY,
        workflow_type VARCHAR NOT NULL,
        status VARCHAR NOT NULL,
        data JSONB NOT NULL,
        version BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_batchwork_tasks_status
        ON batchwork_tasks (status, workflow_type, created_at)
    "#,
];

const JOB_COLUMNS: &str = "id, job_type, payload, priority, status, attempts, max_attempts, \
     progress, progress_message, error_message, created_at, scheduled_at, started_at, \
     completed_at, updated_at";

#[derive(FromRow, Clone)]
pub(crate) struct JobRow {
    pub id: uuid::Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub progress: i16,
    pub progress_message: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            status: JobStatus::parse_from_db(&self.status)?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            progress: self.progress.clamp(0, 100) as u8,
            progress_message: self.progress_message,
            error_message: self.error_message,
            created_at: self.created_at,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct TaskRow {
    pub data: serde_json::Value,
    pub version: i64,
}

impl TaskRow {
    pub fn into_task(self) -> Result<GenerationTask> {
        let mut task: GenerationTask = serde_json::from_value(self.data)?;
        task.version = self.version.max(0) as u64;
        Ok(task)
    }
}

fn pool_options(config: &DatabaseConfig) -> Result<PgPoolOptions> {
    if config.pool_size == 0 {
        return Err(BatchworkError::Config(
            "database.pool_size must be greater than 0".to_string(),
        ));
    }
    Ok(PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs)))
}

fn statuses(list: &[JobStatus]) -> Vec<String> {
    list.iter().map(|s| s.as_str().to_string()).collect()
}

fn attemptable() -> Vec<String> {
    statuses(&[JobStatus::Queued, JobStatus::Processing, JobStatus::Retrying])
}

impl JobQueue<Postgres> {
    /// Open a pool sized and timed out per `config` and build a queue on it.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = pool_options(config)?.connect(&config.url).await?;
        info!(pool_size = config.pool_size, "Connected to PostgreSQL");
        Ok(Self::new(pool).with_create_tables(config.create_tables))
    }

    /// Like [`JobQueue::connect`], but connections are only opened on first use.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self> {
        let pool = pool_options(config)?.connect_lazy(&config.url)?;
        Ok(Self::new(pool).with_create_tables(config.create_tables))
    }

    async fn create_schema(&self) -> Result<()> {
        if !self.create_tables {
            return Ok(());
        }
        self.schema_ready
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                info!("Batchwork tables ready");
                Ok::<(), BatchworkError>(())
            })
            .await?;
        Ok(())
    }

    fn task_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.task_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl JobStore for JobQueue<Postgres> {
    async fn ensure_schema(&self) -> Result<()> {
        self.create_schema().await
    }

    async fn queue_job(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: QueueOptions,
    ) -> Result<JobId> {
        self.create_schema().await?;
        let job = Job::new(job_type, payload, &options, self.now());

        sqlx::query(
            r#"
            INSERT INTO batchwork_jobs (
                id, job_type, payload, priority, status, attempts, max_attempts,
                progress, created_at, scheduled_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.progress as i16)
        .bind(job.created_at)
        .bind(job.scheduled_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, job_type = %job.job_type, "Queued job");
        Ok(job.id)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.create_schema().await?;
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM batchwork_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn get_ready_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.create_schema().await?;
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {} FROM batchwork_jobs
            WHERE status = ANY($1) AND scheduled_at <= $2
            ORDER BY priority ASC, scheduled_at ASC, seq ASC
            LIMIT $3
            "#,
            JOB_COLUMNS
        ))
        .bind(statuses(&[JobStatus::Queued, JobStatus::Retrying]))
        .bind(self.now())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn mark_processing(&self, job_id: JobId) -> Result<bool> {
        self.create_schema().await?;
        let now = self.now();
        let result = sqlx::query(
            r#"
            UPDATE batchwork_jobs
            SET status = $1, progress = 0, progress_message = NULL, started_at = $2, updated_at = $2
            WHERE id = $3 AND status = ANY($4)
            "#,
        )
        .bind(JobStatus::Processing.as_str())
        .bind(now)
        .bind(job_id)
        .bind(statuses(&[JobStatus::Queued, JobStatus::Retrying]))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        percent: u8,
        message: Option<&str>,
    ) -> Result<bool> {
        self.create_schema().await?;
        let result = sqlx::query(
            r#"
            UPDATE batchwork_jobs
            SET progress = $1, progress_message = COALESCE($2, progress_message), updated_at = $3
            WHERE id = $4 AND status = $5
            "#,
        )
        .bind(percent.min(100) as i16)
        .bind(message)
        .bind(self.now())
        .bind(job_id)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(&self, job_id: JobId) -> Result<bool> {
        self.create_schema().await?;
        let result = sqlx::query(
            r#"
            UPDATE batchwork_jobs
            SET status = $1, progress = 100, error_message = NULL, completed_at = $2, updated_at = $2
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(JobStatus::Completed.as_str())
        .bind(self.now())
        .bind(job_id)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_retrying(
        &self,
        job_id: JobId,
        attempts: i32,
        retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool> {
        self.create_schema().await?;
        let result = sqlx::query(
            r#"
            UPDATE batchwork_jobs
            SET status = $1, attempts = LEAST($2, max_attempts), scheduled_at = $3,
                error_message = $4, updated_at = $5
            WHERE id = $6 AND status = ANY($7)
            "#,
        )
        .bind(JobStatus::Retrying.as_str())
        .bind(attempts)
        .bind(retry_at)
        .bind(error_message)
        .bind(self.now())
        .bind(job_id)
        .bind(attemptable())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        attempts: i32,
        error_message: &str,
    ) -> Result<bool> {
        self.create_schema().await?;
        let result = sqlx::query(
            r#"
            UPDATE batchwork_jobs
            SET status = $1, attempts = LEAST($2, max_attempts), error_message = $3,
                completed_at = $4, updated_at = $4
            WHERE id = $5 AND status = ANY($6)
            "#,
        )
        .bind(JobStatus::Failed.as_str())
        .bind(attempts)
        .bind(error_message)
        .bind(self.now())
        .bind(job_id)
        .bind(attemptable())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_job(&self, job_id: JobId) -> Result<bool> {
        self.create_schema().await?;
        let result = sqlx::query(
            r#"
            UPDATE batchwork_jobs
            SET status = $1, completed_at = $2, updated_at = $2
            WHERE id = $3 AND status = ANY($4)
            "#,
        )
        .bind(JobStatus::Cancelled.as_str())
        .bind(self.now())
        .bind(job_id)
        .bind(attemptable())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM batchwork_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status.as_deref() == Some(JobStatus::Cancelled.as_str()))
    }

    async fn cleanup_completed_jobs(&self, retention: Duration) -> Result<u64> {
        self.create_schema().await?;
        let cutoff = window_start(self.now(), retention);
        let result =
            sqlx::query("DELETE FROM batchwork_jobs WHERE status = ANY($1) AND updated_at < $2")
                .bind(statuses(&[
                    JobStatus::Completed,
                    JobStatus::Failed,
                    JobStatus::Cancelled,
                ]))
                .bind(cutoff)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    async fn get_statistics(&self, window: Duration) -> Result<JobStatistics> {
        self.create_schema().await?;
        let now = self.now();
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM batchwork_jobs
            WHERE created_at >= $1
            GROUP BY status
            "#,
        )
        .bind(window_start(now, window))
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            counts.insert(JobStatus::parse_from_db(&status)?, count.max(0) as u64);
        }
        Ok(JobStatistics::from_counts(&counts, window, now))
    }
}

#[async_trait]
impl LockStore for JobQueue<Postgres> {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.create_schema().await?;
        let now = self.now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        // Insert, or take over a row whose lease has run out; a live lease
        // leaves the row untouched and affects zero rows.
        let result = sqlx::query(
            r#"
            INSERT INTO batchwork_locks (lock_key, token, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (lock_key) DO UPDATE
            SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
            WHERE batchwork_locks.expires_at <= $4
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        self.create_schema().await?;
        let result = sqlx::query("DELETE FROM batchwork_locks WHERE lock_key = $1 AND token = $2")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TaskStore for JobQueue<Postgres> {
    async fn insert(&self, task: &GenerationTask) -> Result<GenerationTask> {
        self.create_schema().await?;
        let now = self.now();
        let mut stored = task.clone();
        stored.version = 1;

        // Expired rows linger until purged; let a new insert replace them.
        let result = sqlx::query(
            r#"
            INSERT INTO batchwork_tasks (
                id, workflow_type, status, data, version, created_at, updated_at, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET workflow_type = EXCLUDED.workflow_type, status = EXCLUDED.status,
                data = EXCLUDED.data, version = EXCLUDED.version,
                created_at = EXCLUDED.created_at, updated_at = EXCLUDED.updated_at,
                expires_at = EXCLUDED.expires_at
            WHERE batchwork_tasks.expires_at <= $7
            "#,
        )
        .bind(stored.id)
        .bind(&stored.workflow_type)
        .bind(stored.status.as_str())
        .bind(serde_json::to_value(&stored)?)
        .bind(stored.version as i64)
        .bind(stored.created_at)
        .bind(now)
        .bind(self.task_expiry(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BatchworkError::Processing(format!(
                "Task {} already exists",
                task.id
            )));
        }
        Ok(stored)
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<GenerationTask>> {
        self.create_schema().await?;
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT data, version FROM batchwork_tasks WHERE id = $1 AND expires_at > $2",
        )
        .bind(task_id)
        .bind(self.now())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::into_task).transpose()
    }

    async fn compare_and_swap(
        &self,
        task: &GenerationTask,
        expected_version: u64,
    ) -> Result<CasOutcome> {
        self.create_schema().await?;
        let now = self.now();
        let mut stored = task.clone();
        stored.version = expected_version + 1;

        let result = sqlx::query(
            r#"
            UPDATE batchwork_tasks
            SET workflow_type = $1, status = $2, data = $3, version = $4,
                updated_at = $5, expires_at = $6
            WHERE id = $7 AND version = $8 AND expires_at > $5
            "#,
        )
        .bind(&stored.workflow_type)
        .bind(stored.status.as_str())
        .bind(serde_json::to_value(&stored)?)
        .bind(stored.version as i64)
        .bind(now)
        .bind(self.task_expiry(now))
        .bind(stored.id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(CasOutcome::Stored(stored));
        }
        Ok(CasOutcome::Conflict(self.load(task.id).await?))
    }

    async fn delete(&self, task_id: TaskId, expected_version: u64) -> Result<bool> {
        self.create_schema().await?;
        let result = sqlx::query("DELETE FROM batchwork_tasks WHERE id = $1 AND version = $2")
            .bind(task_id)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<GenerationTask>> {
        self.create_schema().await?;
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT data, version FROM batchwork_tasks
            WHERE expires_at > $1
              AND ($2::VARCHAR IS NULL OR status = $2)
              AND ($3::VARCHAR IS NULL OR workflow_type = $3)
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#,
        )
        .bind(self.now())
        .bind(filter.status.map(|status| status.as_str()))
        .bind(filter.workflow_type.as_deref())
        .bind(filter.limit.map(|limit| limit as i64))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.create_schema().await?;
        let result = sqlx::query("DELETE FROM batchwork_tasks WHERE expires_at <= $1")
            .bind(self.now())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
