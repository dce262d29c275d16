// Copyright 2025 Cowboy AI, LLC.

//! Counters and timings for history operations

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Measurements retained per operation
const WINDOW: usize = 1000;

/// Operation names recorded by the engine
pub mod names {
    /// Deltas created
    pub const CREATE: &str = "delta.create";
    /// Creates aborted by `amend`
    pub const ABORT: &str = "delta.abort";
    /// Deltas reverted
    pub const UNDO: &str = "delta.undo";
    /// Deltas re-applied
    pub const REDO: &str = "delta.redo";
    /// Deltas removed by branch truncation
    pub const TRUNCATED: &str = "delta.truncated";
    /// Recomputes scheduled
    pub const RECOMPUTE: &str = "recompute.scheduled";
    /// Time spent waiting for workflow locks
    pub const LOCK_WAIT: &str = "lock.wait";
    /// Time spent applying and committing a delta
    pub const APPLY: &str = "delta.apply";
}

/// Metrics collected by a [`DeltaEngine`](crate::DeltaEngine)
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    counters: Arc<RwLock<HashMap<String, u64>>>,
    durations: Arc<RwLock<HashMap<String, Vec<Duration>>>>,
    errors: Arc<RwLock<HashMap<String, u64>>>,
}

impl EngineMetrics {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter
    pub async fn increment(&self, name: &str) {
        self.add(name, 1).await;
    }

    /// Add to a counter
    pub async fn add(&self, name: &str, n: u64) {
        let mut counters = self.counters.write().await;
        *counters.entry(name.to_string()).or_insert(0) += n;
    }

    /// Count a failure, keyed by error kind
    pub async fn record_error(&self, kind: &str) {
        let mut errors = self.errors.write().await;
        *errors.entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Record how long an operation took
    pub async fn record_duration(&self, operation: &str, duration: Duration) {
        let mut durations = self.durations.write().await;
        let samples = durations.entry(operation.to_string()).or_default();
        samples.push(duration);
        if samples.len() > WINDOW {
            let excess = samples.len() - WINDOW;
            samples.drain(..excess);
        }
    }

    /// Current counter value
    pub async fn counter(&self, name: &str) -> u64 {
        self.counters.read().await.get(name).copied().unwrap_or(0)
    }

    /// Failures recorded for an error kind
    pub async fn error_count(&self, kind: &str) -> u64 {
        self.errors.read().await.get(kind).copied().unwrap_or(0)
    }

    /// Duration at `percentile` (0-100) among retained samples
    pub async fn percentile(&self, operation: &str, percentile: f64) -> Option<Duration> {
        let durations = self.durations.read().await;
        let mut sorted = durations.get(operation)?.clone();
        sorted.sort();
        pick(&sorted, percentile)
    }

    /// Snapshot of everything collected
    pub async fn summary(&self) -> MetricsSummary {
        let counters = self.counters.read().await.clone();
        let errors = self.errors.read().await.clone();
        let durations = self
            .durations
            .read()
            .await
            .iter()
            .filter_map(|(op, samples)| Some((op.clone(), DurationStats::from_samples(samples)?)))
            .collect();

        MetricsSummary {
            counters,
            errors,
            durations,
        }
    }

    /// Start timing an operation
    pub fn timer(&self, operation: &'static str) -> MetricsTimer<'_> {
        MetricsTimer {
            metrics: self,
            operation,
            start: Instant::now(),
        }
    }
}

fn pick(sorted: &[Duration], percentile: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let index = ((sorted.len() - 1) as f64 * percentile.clamp(0.0, 100.0) / 100.0) as usize;
    sorted.get(index).copied()
}

/// Snapshot of all metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    /// Counter values
    pub counters: HashMap<String, u64>,
    /// Failures by error kind
    pub errors: HashMap<String, u64>,
    /// Timing statistics by operation
    pub durations: HashMap<String, DurationStats>,
}

/// Timing statistics for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationStats {
    /// Number of samples
    pub count: usize,
    /// Mean
    pub avg: Duration,
    /// Median
    pub p50: Duration,
    /// 95th percentile
    pub p95: Duration,
    /// 99th percentile
    pub p99: Duration,
    /// Fastest sample
    pub min: Duration,
    /// Slowest sample
    pub max: Duration,
}

impl DurationStats {
    fn from_samples(samples: &[Duration]) -> Option<Self> {
        let mut sorted = samples.to_vec();
        sorted.sort();
        let min = *sorted.first()?;
        let max = *sorted.last()?;
        let total: Duration = sorted.iter().sum();
        Some(Self {
            count: sorted.len(),
            avg: total / u32::try_from(sorted.len()).unwrap_or(u32::MAX),
            p50: pick(&sorted, 50.0)?,
            p95: pick(&sorted, 95.0)?,
            p99: pick(&sorted, 99.0)?,
            min,
            max,
        })
    }
}

/// Measures one operation until [`record`](Self::record) is called
pub struct MetricsTimer<'a> {
    metrics: &'a EngineMetrics,
    operation: &'static str,
    start: Instant,
}

impl MetricsTimer<'_> {
    /// Record the elapsed time and return it
    pub async fn record(self) -> Duration {
        let elapsed = self.start.elapsed();
        self.metrics.record_duration(self.operation, elapsed).await;
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_and_errors() {
        let metrics = EngineMetrics::new();
        metrics.increment(names::CREATE).await;
        metrics.increment(names::CREATE).await;
        metrics.add(names::TRUNCATED, 3).await;
        metrics.record_error("busy").await;

        assert_eq!(metrics.counter(names::CREATE).await, 2);
        assert_eq!(metrics.counter(names::TRUNCATED).await, 3);
        assert_eq!(metrics.counter(names::UNDO).await, 0);
        assert_eq!(metrics.error_count("busy").await, 1);
    }

    #[tokio::test]
    async fn test_duration_stats() {
        let metrics = EngineMetrics::new();
        for ms in 1..=100 {
            metrics
                .record_duration(names::APPLY, Duration::from_millis(ms))
                .await;
        }

        let summary = metrics.summary().await;
        let stats = summary.durations[names::APPLY];
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, Duration::from_millis(1));
        assert_eq!(stats.max, Duration::from_millis(100));
        assert_eq!(stats.p50, Duration::from_millis(50));
        assert_eq!(
            metrics.percentile(names::APPLY, 99.0).await,
            Some(Duration::from_millis(99))
        );
        assert!(metrics.percentile(names::LOCK_WAIT, 50.0).await.is_none());
    }

    #[tokio::test]
    async fn test_window_keeps_latest_samples() {
        let metrics = EngineMetrics::new();
        for ms in 0..(WINDOW as u64 + 10) {
            metrics
                .record_duration(names::LOCK_WAIT, Duration::from_millis(ms))
                .await;
        }
        let stats = metrics.summary().await.durations[names::LOCK_WAIT];
        assert_eq!(stats.count, WINDOW);
        assert_eq!(stats.min, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_timer_records() {
        let metrics = EngineMetrics::new();
        metrics.timer(names::APPLY).record().await;
        assert_eq!(metrics.summary().await.durations[names::APPLY].count, 1);
    }
}
