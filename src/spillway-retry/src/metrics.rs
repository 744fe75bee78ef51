//! Metrics collection for retry executors.

#![allow(clippy::significant_drop_tightening)] // Guards must stay alive for their scope

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Metrics for one named retry executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    /// Work function invocations.
    pub attempts: u64,
    /// `RetryOom` signals absorbed.
    pub retries: u64,
    /// `SplitAndRetryOom` signals absorbed.
    pub split_retries: u64,
    /// Fragments produced by split policies.
    pub fragments: u64,
    /// Results emitted.
    pub results: u64,
    /// Fatal aborts.
    pub failures: u64,
    /// Time spent waiting for the coordinator between retries.
    pub block_time: Duration,
}

impl RetryMetrics {
    /// Create new metrics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            attempts: 0,
            retries: 0,
            split_retries: 0,
            fragments: 0,
            results: 0,
            failures: 0,
            block_time: Duration::new(0, 0),
        }
    }

    /// Add blocked time.
    pub fn add_block_time(&mut self, duration: Duration) {
        self.block_time += duration;
    }

    /// Attempts that did not produce a result.
    pub fn wasted_attempts(&self) -> u64 {
        self.attempts.saturating_sub(self.results)
    }
}

impl std::fmt::Display for RetryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "attempts={}, retries={}, split_retries={}, fragments={}, results={}, failures={}, blocked={:?}",
            self.attempts,
            self.retries,
            self.split_retries,
            self.fragments,
            self.results,
            self.failures,
            self.block_time
        )
    }
}

/// Sink for collecting retry metrics keyed by executor name.
#[derive(Debug, Clone, Default)]
pub struct MetricsSink {
    metrics: Arc<RwLock<HashMap<String, RetryMetrics>>>,
}

impl MetricsSink {
    /// Create a new metrics sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Update metrics for an executor using a closure.
    pub fn update<F>(&self, name: &str, f: F)
    where
        F: FnOnce(&mut RetryMetrics),
    {
        let mut guard = self.metrics.write().expect("metrics lock poisoned");
        let metrics = guard.entry(name.to_string()).or_default();
        f(metrics);
    }

    /// Get metrics for an executor.
    pub fn get(&self, name: &str) -> Option<RetryMetrics> {
        self.metrics
            .read()
            .expect("metrics lock poisoned")
            .get(name)
            .cloned()
    }

    /// Get all metrics.
    pub fn all(&self) -> HashMap<String, RetryMetrics> {
        self.metrics.read().expect("metrics lock poisoned").clone()
    }

    /// Clear all metrics.
    pub fn clear(&self) {
        self.metrics.write().expect("metrics lock poisoned").clear();
    }

    /// One line per executor, sorted by name.
    pub fn format_summary(&self) -> String {
        let metrics = self.metrics.read().expect("metrics lock poisoned");
        let mut names: Vec<_> = metrics.keys().collect();
        names.sort();

        let mut output = String::new();
        for name in names {
            let _ = writeln!(output, "{}: {}", name, metrics[name]);
        }

        if output.is_empty() {
            output.push_str("No metrics collected.\n");
        }

        output
    }
}

/// Timer for measuring blocked time.
#[derive(Debug)]
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    /// Start a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time without stopping.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop and return elapsed time.
    #[must_use]
    pub fn stop(self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for ExecutionTimer {
    fn default() -> Self {
        Self::start()
    }
}
