//! Named performance timers.
//!
//! A [`PerformanceTimer`] keeps count/total/min/max/last aggregates per timer name
//! (the handler registry uses `job.<type>`). With the `metrics` feature enabled the
//! timer also records every span into a Prometheus histogram labelled by name.

use crate::Result;
#[cfg(feature = "metrics")]
use crate::BatchworkError;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

#[cfg(feature = "metrics")]
use prometheus::{Encoder, HistogramVec, Registry, TextEncoder};

/// Aggregate timings for one timer name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimerStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub last: Duration,
}

impl TimerStats {
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }

    fn record(&mut self, elapsed: Duration) {
        if self.count == 0 || elapsed < self.min {
            self.min = elapsed;
        }
        if elapsed > self.max {
            self.max = elapsed;
        }
        self.count += 1;
        self.total += elapsed;
        self.last = elapsed;
    }
}

/// An in-flight timing started by [`PerformanceTimer::start`].
#[derive(Debug)]
#[must_use = "a span records nothing until it is stopped"]
pub struct TimerSpan {
    name: String,
    started: Instant,
}

impl TimerSpan {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Start/stop timer keyed by name.
///
/// Cloning shares the aggregates.
///
/// ```rust
/// use batchwork::metrics::PerformanceTimer;
///
/// let timer = PerformanceTimer::new().unwrap();
/// let span = timer.start("job.export");
/// timer.stop(span);
/// assert_eq!(timer.stats("job.export").unwrap().count, 1);
/// ```
#[derive(Clone)]
pub struct PerformanceTimer {
    stats: Arc<Mutex<HashMap<String, TimerStats>>>,
    #[cfg(feature = "metrics")]
    registry: Registry,
    #[cfg(feature = "metrics")]
    durations: HistogramVec,
}

impl std::fmt::Debug for PerformanceTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceTimer")
            .field("names", &self.names())
            .finish()
    }
}

impl PerformanceTimer {
    /// Create a timer with its own Prometheus registry when `metrics` is enabled.
    pub fn new() -> Result<Self> {
        Ok(Self {
            stats: Arc::new(Mutex::new(HashMap::new())),
            #[cfg(feature = "metrics")]
            registry: Registry::new(),
            #[cfg(feature = "metrics")]
            durations: HistogramVec::new(
                prometheus::HistogramOpts::new(
                    "batchwork_timer_duration_seconds",
                    "Duration of named timer spans in seconds",
                )
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
                &["name"],
            )
            .map_err(|e| BatchworkError::Metrics {
                message: format!("Failed to create timer histogram: {}", e),
            })?,
        }
        .registered()?)
    }

    #[cfg(feature = "metrics")]
    fn registered(self) -> Result<Self> {
        self.registry
            .register(Box::new(self.durations.clone()))
            .map_err(|e| BatchworkError::Metrics {
                message: format!("Failed to register timer histogram: {}", e),
            })?;
        Ok(self)
    }

    #[cfg(not(feature = "metrics"))]
    fn registered(self) -> Result<Self> {
        Ok(self)
    }

    pub fn start(&self, name: impl Into<String>) -> TimerSpan {
        TimerSpan {
            name: name.into(),
            started: Instant::now(),
        }
    }

    /// Finish a span, fold it into the aggregates, and return its duration.
    pub fn stop(&self, span: TimerSpan) -> Duration {
        let elapsed = span.started.elapsed();
        self.record(&span.name, elapsed);
        elapsed
    }

    /// Record an externally measured duration.
    pub fn record(&self, name: &str, elapsed: Duration) {
        {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.entry(name.to_string()).or_default().record(elapsed);
        }

        #[cfg(feature = "metrics")]
        self.durations
            .with_label_values(&[name])
            .observe(elapsed.as_secs_f64());
    }

    pub fn stats(&self, name: &str) -> Option<TimerStats> {
        let stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        stats.get(name).cloned()
    }

    /// Timer names seen so far, sorted.
    pub fn names(&self) -> Vec<String> {
        let stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = stats.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn reset(&self) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        stats.clear();
    }

    /// Prometheus text exposition of the timer histogram.
    #[cfg(feature = "metrics")]
    pub fn get_metrics_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| BatchworkError::Metrics {
                message: format!("Failed to encode metrics: {}", e),
            })?;

        String::from_utf8(buffer).map_err(|e| BatchworkError::Metrics {
            message: format!("Failed to convert metrics to string: {}", e),
        })
    }

    #[cfg(not(feature = "metrics"))]
    pub fn get_metrics_text(&self) -> Result<String> {
        Ok(String::new())
    }
}
