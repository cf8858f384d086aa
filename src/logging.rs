//! Subscriber setup and structured error context.

use crate::{BatchworkError, Result, config::LoggingConfig, job::Job};
use serde::Serialize;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Install a global `tracing-subscriber` fmt subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Installing a second
/// subscriber fails with [`BatchworkError::Config`].
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| BatchworkError::Config(format!("Invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let installed = if config.json_format {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| {
        BatchworkError::Config(format!("Failed to initialize tracing subscriber: {}", e))
    })?;

    tracing::info!(service = %config.service_name, level = %config.level, "Logging initialized");
    Ok(())
}

/// Structured context for a failed job attempt.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorContext {
    pub job_id: String,
    pub job_type: String,
    /// Attempt number that failed, 1-based
    pub attempt: i32,
    pub max_attempts: i32,
    pub error: String,
    /// Whether the job will be retried
    pub will_retry: bool,
}

impl ErrorContext {
    pub fn for_job(job: &Job, attempt: i32, error: &BatchworkError, will_retry: bool) -> Self {
        Self {
            job_id: job.id.to_string(),
            job_type: job.job_type.clone(),
            attempt,
            max_attempts: job.max_attempts,
            error: error.to_string(),
            will_retry,
        }
    }

    /// Emit as a single `error` event.
    pub fn log(&self) {
        error!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            attempt = self.attempt,
            max_attempts = self.max_attempts,
            will_retry = self.will_retry,
            error = %self.error,
            "Job attempt failed"
        );
    }
}
