//! Configuration management for batchwork.
//!
//! Configuration is loaded from TOML files or environment variables and covers the
//! storage backend, the tick scheduler, task state machine limits, and logging.
//! Durations are written in a human-readable form: `"250ms"`, `"30s"`, `"5m"`,
//! `"1h"`, `"7d"`, or a bare number of seconds.

use crate::retry::RetryStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

/// Module for serializing std::time::Duration as human-readable strings
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    pub(crate) fn format_duration(duration: Duration) -> String {
        let secs = duration.as_secs();
        if duration.subsec_millis() != 0 {
            format!("{}ms", duration.as_millis())
        } else if secs == 0 {
            "0s".to_string()
        } else if secs % 86400 == 0 {
            format!("{}d", secs / 86400)
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    /// Parse a duration string like "30s", "5m", "1h", "90", "250ms".
    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(num_str) = s.strip_suffix("ms") {
            let millis: u64 = num_str
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
            return Ok(Duration::from_millis(millis));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        match suffix {
            "s" => Ok(Duration::from_secs(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            "d" => Ok(Duration::from_secs(num * 86400)),
            _ => Err(format!(
                "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                suffix
            )),
        }
    }
}

/// Same as [`duration_secs`] for optional durations.
pub(crate) mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&super::duration_secs::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        Option::<String>::deserialize(deserializer)?
            .map(|s| super::duration_secs::parse_duration(&s).map_err(D::Error::custom))
            .transpose()
    }
}

/// Main configuration for batchwork.
///
/// # Examples
///
/// ```rust
/// use batchwork::config::BatchworkConfig;
/// use std::time::Duration;
///
/// let config = BatchworkConfig::new()
///     .with_max_concurrent_jobs(5)
///     .with_tick_interval(Duration::from_secs(30));
/// assert_eq!(config.scheduler.max_concurrent_jobs, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BatchworkConfig {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Tick scheduler and handler dispatch configuration
    pub scheduler: SchedulerConfig,

    /// Generation task state machine configuration
    pub tasks: TaskConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl BatchworkConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database.url = url.to_string();
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.scheduler.max_concurrent_jobs = max;
        self
    }

    pub fn with_tick_interval(mut self, interval: StdDuration) -> Self {
        self.scheduler.tick_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: StdDuration) -> Self {
        self.scheduler.job_timeout = timeout;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.scheduler.retry_strategy = strategy;
        self
    }

    pub fn with_task_timeout(mut self, timeout: StdDuration) -> Self {
        self.tasks.timeout_threshold = timeout;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Overlay `BATCHWORK_*` environment variables onto this configuration.
    pub fn apply_env_overrides(&mut self) -> crate::Result<()> {
        if let Ok(url) = std::env::var("BATCHWORK_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(pool_size) = std::env::var("BATCHWORK_DATABASE_POOL_SIZE") {
            self.database.pool_size = pool_size.parse().unwrap_or(self.database.pool_size);
        }
        if let Ok(max) = std::env::var("BATCHWORK_MAX_CONCURRENT_JOBS") {
            self.scheduler.max_concurrent_jobs =
                max.parse().unwrap_or(self.scheduler.max_concurrent_jobs);
        }
        if let Ok(interval) = std::env::var("BATCHWORK_TICK_INTERVAL") {
            self.scheduler.tick_interval = duration_secs::parse_duration(&interval)
                .map_err(crate::BatchworkError::Config)?;
        }
        if let Ok(timeout) = std::env::var("BATCHWORK_JOB_TIMEOUT_SECONDS") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                self.scheduler.job_timeout = StdDuration::from_secs(seconds);
            }
        }
        if let Ok(timeout) = std::env::var("BATCHWORK_TASK_TIMEOUT") {
            self.tasks.timeout_threshold = duration_secs::parse_duration(&timeout)
                .map_err(crate::BatchworkError::Config)?;
        }
        if let Ok(level) = std::env::var("BATCHWORK_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Create a configuration for development use
    pub fn development() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/batchwork_dev".to_string(),
                pool_size: 5,
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                tick_interval: StdDuration::from_secs(5),
                retry_strategy: RetryStrategy::fixed(StdDuration::from_secs(5)),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration for production use
    pub fn production() -> Self {
        Self {
            database: DatabaseConfig {
                pool_size: 20,
                connection_timeout_secs: 60,
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                job_timeout: StdDuration::from_secs(600),
                ..Default::default()
            },
            logging: LoggingConfig {
                json_format: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Connection pool size
    pub pool_size: u32,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Whether `JobQueue` creates its tables lazily on first use
    pub create_tables: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/batchwork".to_string(),
            pool_size: 10,
            connection_timeout_secs: 30,
            create_tables: true,
        }
    }
}

/// Tick scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the process-jobs trigger fires
    #[serde(with = "duration_secs")]
    pub tick_interval: StdDuration,

    /// How often finished jobs are purged
    #[serde(with = "duration_secs")]
    pub cleanup_interval: StdDuration,

    /// Age after which completed, failed, and cancelled jobs are purged
    #[serde(with = "duration_secs")]
    pub retention: StdDuration,

    /// Upper bound on jobs processed per tick
    pub max_concurrent_jobs: usize,

    /// Key of the tick exclusion lock
    pub lock_key: String,

    /// Lifetime of the tick exclusion lock
    #[serde(with = "duration_secs")]
    pub lock_ttl: StdDuration,

    /// Wall-clock bound on a single handler invocation
    #[serde(with = "duration_secs")]
    pub job_timeout: StdDuration,

    /// Window used by job statistics
    #[serde(with = "duration_secs")]
    pub statistics_window: StdDuration,

    /// Backoff applied between job attempts
    pub retry_strategy: RetryStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: StdDuration::from_secs(60),
            cleanup_interval: StdDuration::from_secs(86400),
            retention: StdDuration::from_secs(86400),
            max_concurrent_jobs: 3,
            lock_key: "batchwork_process_jobs_lock".to_string(),
            lock_ttl: StdDuration::from_secs(300),
            job_timeout: StdDuration::from_secs(300),
            statistics_window: StdDuration::from_secs(86400),
            retry_strategy: RetryStrategy::exponential(
                StdDuration::from_secs(60),
                2.0,
                Some(StdDuration::from_secs(3600)),
            ),
        }
    }
}

/// Generation task state machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Items per batch when the caller does not choose
    pub default_batch_size: usize,

    /// Retries allowed before a task fails permanently
    pub default_max_retries: u32,

    /// A processing task older than this is timed out
    #[serde(with = "duration_secs")]
    pub timeout_threshold: StdDuration,

    /// Lifetime of task records in the task store
    #[serde(with = "duration_secs")]
    pub task_ttl: StdDuration,

    /// Reload-and-reapply attempts on version conflicts
    pub max_cas_retries: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 10,
            default_max_retries: 3,
            timeout_threshold: StdDuration::from_secs(3600),
            task_ttl: StdDuration::from_secs(7 * 86400),
            max_cas_retries: 5,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to emit structured JSON lines
    pub json_format: bool,

    /// Whether to include file and line information
    pub include_location: bool,

    /// Service name attached to every event
    pub service_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
            service_name: "batchwork".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_creation() {
        let config = BatchworkConfig::new()
            .with_database_url("postgresql://localhost/test")
            .with_max_concurrent_jobs(8)
            .with_job_timeout(StdDuration::from_secs(600));

        assert_eq!(config.database.url, "postgresql://localhost/test");
        assert_eq!(config.scheduler.max_concurrent_jobs, 8);
        assert_eq!(config.scheduler.job_timeout, StdDuration::from_secs(600));
    }

    #[test]
    fn test_default_configs() {
        let config = BatchworkConfig::default();
        assert_eq!(config.scheduler.max_concurrent_jobs, 3);
        assert_eq!(config.scheduler.lock_ttl, StdDuration::from_secs(300));
        assert_eq!(config.scheduler.retention, StdDuration::from_secs(86400));
        assert_eq!(config.tasks.default_max_retries, 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_presets() {
        let dev = BatchworkConfig::development();
        assert_eq!(dev.logging.level, "debug");
        assert_eq!(dev.scheduler.tick_interval, StdDuration::from_secs(5));

        let prod = BatchworkConfig::production();
        assert!(prod.logging.json_format);
        assert_eq!(prod.database.pool_size, 20);
    }

    #[test]
    fn test_config_file_operations() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("batchwork.toml");

        let config = BatchworkConfig::new()
            .with_database_url("postgresql://localhost/roundtrip")
            .with_max_concurrent_jobs(6)
            .with_task_timeout(StdDuration::from_secs(7200));

        config.save_to_file(config_path.to_str().unwrap()).unwrap();
        let loaded = BatchworkConfig::from_file(config_path.to_str().unwrap()).unwrap();

        assert_eq!(loaded.database.url, "postgresql://localhost/roundtrip");
        assert_eq!(loaded.scheduler.max_concurrent_jobs, 6);
        assert_eq!(loaded.tasks.timeout_threshold, StdDuration::from_secs(7200));
        assert_eq!(loaded.scheduler.retry_strategy, config.scheduler.retry_strategy);
    }

    #[test]
    fn test_duration_serialization() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("duration_test.toml");

        let mut config = BatchworkConfig::new();
        config.scheduler.tick_interval = StdDuration::from_secs(30);
        config.scheduler.lock_ttl = StdDuration::from_secs(300);
        config.save_to_file(config_path.to_str().unwrap()).unwrap();

        let toml_content = std::fs::read_to_string(&config_path).unwrap();
        assert!(toml_content.contains("tick_interval = \"30s\""));
        assert!(toml_content.contains("lock_ttl = \"5m\""));
        assert!(toml_content.contains("retention = \"1d\""));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: BatchworkConfig = toml::from_str(
            r#"
            [scheduler]
            max_concurrent_jobs = 7
            tick_interval = "250ms"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_concurrent_jobs, 7);
        assert_eq!(config.scheduler.tick_interval, StdDuration::from_millis(250));
        assert_eq!(config.scheduler.lock_ttl, StdDuration::from_secs(300));
        assert_eq!(config.tasks.max_cas_retries, 5);
    }

    #[test]
    fn test_parse_duration_formats() {
        let cases = [
            ("30", StdDuration::from_secs(30)),
            ("30s", StdDuration::from_secs(30)),
            ("5m", StdDuration::from_secs(300)),
            ("2h", StdDuration::from_secs(7200)),
            ("1d", StdDuration::from_secs(86400)),
            ("250ms", StdDuration::from_millis(250)),
        ];
        for (input, expected) in cases {
            assert_eq!(duration_secs::parse_duration(input).unwrap(), expected);
        }
        assert!(duration_secs::parse_duration("5w").is_err());
        assert!(duration_secs::parse_duration("x").is_err());
    }

    #[test]
    fn test_env_config() {
        unsafe {
            std::env::set_var("BATCHWORK_DATABASE_URL", "postgresql://env/test");
            std::env::set_var("BATCHWORK_MAX_CONCURRENT_JOBS", "9");
            std::env::set_var("BATCHWORK_TASK_TIMEOUT", "2h");
        }

        let config = BatchworkConfig::from_env().unwrap();

        assert_eq!(config.database.url, "postgresql://env/test");
        assert_eq!(config.scheduler.max_concurrent_jobs, 9);
        assert_eq!(config.tasks.timeout_threshold, StdDuration::from_secs(7200));

        unsafe {
            std::env::remove_var("BATCHWORK_DATABASE_URL");
            std::env::remove_var("BATCHWORK_MAX_CONCURRENT_JOBS");
            std::env::remove_var("BATCHWORK_TASK_TIMEOUT");
        }
    }
}
