//! Named priority bands for jobs and generation tasks.
//!
//! Priorities are plain integers where a **lower value is more urgent**. Ready jobs
//! are drained in `(priority ASC, scheduled_at ASC)` order, so jobs sharing a band
//! run first-in first-out. [`JobPriority`] gives names to the conventional bands;
//! any integer is accepted wherever a priority is taken.
//!
//! - **Critical (1)**: operator-triggered repairs, emergency work
//! - **High (5)**: user-visible work someone is waiting on
//! - **Normal (10)**: the default band
//! - **Low (15)**: reports, analytics, housekeeping that can lag
//! - **Background (20)**: cleanup and maintenance

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Priority value used when the caller does not pick one.
pub const DEFAULT_PRIORITY: i32 = JobPriority::Normal as i32;

/// Conventional priority bands.
///
/// # Examples
///
/// ```rust
/// use batchwork::JobPriority;
/// use std::str::FromStr;
///
/// let priority = JobPriority::from_str("high").unwrap();
/// assert_eq!(priority.as_i32(), 5);
///
/// // Lower numbers drain first.
/// assert!(JobPriority::Critical.as_i32() < JobPriority::Background.as_i32());
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Critical = 1,
    High = 5,
    #[default]
    Normal = 10,
    Low = 15,
    Background = 20,
}

impl JobPriority {
    /// Numeric value stored on jobs and tasks.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Maps a stored value back to its band, if it is exactly a band value.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Critical),
            5 => Some(Self::High),
            10 => Some(Self::Normal),
            15 => Some(Self::Low),
            20 => Some(Self::Background),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        }
    }
}

impl From<JobPriority> for i32 {
    fn from(priority: JobPriority) -> Self {
        priority.as_i32()
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PriorityError {
    #[error("Invalid priority name: {0}")]
    InvalidName(String),
}

impl FromStr for JobPriority {
    type Err = PriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            "background" => Ok(Self::Background),
            other => Err(PriorityError::InvalidName(other.to_string())),
        }
    }
}
