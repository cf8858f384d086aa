use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchworkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("Batch {batch_id} not found in task {task_id}")]
    BatchNotFound { task_id: String, batch_id: String },

    #[error("Invalid transition for task {task_id}: cannot {action} from {from}")]
    InvalidTransition {
        task_id: String,
        from: String,
        action: String,
    },

    #[error("Version conflict on task {task_id} after {attempts} attempts")]
    VersionConflict { task_id: String, attempts: u32 },

    #[error("No handler registered for job type: {job_type}")]
    HandlerNotFound { job_type: String },

    #[error("Handler error ({job_type}): {message}")]
    Handler { job_type: String, message: String },

    #[error("Job {job_id} timed out after {timeout:?}")]
    Timeout { job_id: String, timeout: Duration },

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    #[error("Lock error: {message}")]
    Lock { message: String },

    #[error("Metrics error: {message}")]
    Metrics { message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for BatchworkError {
    fn from(err: toml::de::Error) -> Self {
        BatchworkError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for BatchworkError {
    fn from(err: toml::ser::Error) -> Self {
        BatchworkError::Config(format!("TOML serialization error: {}", err))
    }
}
