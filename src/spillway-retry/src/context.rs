//! Retry context shared by the executors.
//!
//! The context carries the external services a retry depends on: the
//! memory-pressure coordinator, the OOM injector, cancellation and metrics.
//! Nothing here is global, so tests hand in fakes.

use std::sync::Arc;

use common_config::RetryConfig;
use common_error::{SpillwayError, SpillwayResult};
use spillway_memory::{NoopCoordinator, OomCoordinator, OomInjector, SpillCatalog};
use tokio::sync::watch;

use crate::metrics::{MetricsSink, RetryMetrics};

/// Context passed to every retry executor.
///
/// Cloning is cheap; clones share the coordinator, injector, metrics sink
/// and cancellation channel.
#[derive(Clone)]
pub struct RetryContext {
    coordinator: Arc<dyn OomCoordinator>,
    injector: Option<Arc<OomInjector>>,
    cancel_rx: watch::Receiver<bool>,
    metrics: Option<MetricsSink>,
    config: RetryConfig,
}

impl std::fmt::Debug for RetryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryContext")
            .field("coordinator", &self.coordinator)
            .field("config", &self.config)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl RetryContext {
    /// Create a context with a no-op coordinator and default configuration.
    pub fn new() -> Self {
        let (_, cancel_rx) = watch::channel(false);
        Self {
            coordinator: Arc::new(NoopCoordinator::new()),
            injector: None,
            cancel_rx,
            metrics: Some(MetricsSink::new()),
            config: RetryConfig::default(),
        }
    }

    /// Use a catalog as coordinator and injection target.
    pub fn with_catalog(mut self, catalog: &Arc<SpillCatalog>) -> Self {
        self.coordinator = Arc::clone(catalog) as Arc<dyn OomCoordinator>;
        self.injector = Some(Arc::clone(catalog.injector()));
        self
    }

    /// Create with custom configuration.
    pub fn with_config(mut self, config: RetryConfig) -> Self {
        if !config.collect_metrics {
            self.metrics = None;
        } else if self.metrics.is_none() {
            self.metrics = Some(MetricsSink::new());
        }
        self.config = config;
        self
    }

    /// Create with a memory-pressure coordinator.
    pub fn with_coordinator(mut self, coordinator: Arc<dyn OomCoordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Create with an OOM injector.
    pub fn with_injector(mut self, injector: Arc<OomInjector>) -> Self {
        self.injector = Some(injector);
        self
    }

    /// Create with metrics sink.
    pub fn with_metrics(mut self, metrics: MetricsSink) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Disable metrics collection.
    pub fn without_metrics(mut self) -> Self {
        self.metrics = None;
        self
    }

    /// Create with cancellation receiver.
    pub fn with_cancellation(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = cancel_rx;
        self
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Get the metrics sink (if enabled).
    pub fn metrics(&self) -> Option<&MetricsSink> {
        self.metrics.as_ref()
    }

    /// Check if the owning task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Update executor metrics.
    pub fn update_metrics<F>(&self, name: &str, f: F)
    where
        F: FnOnce(&mut RetryMetrics),
    {
        if let Some(ref sink) = self.metrics {
            sink.update(name, f);
        }
    }

    /// Arm the configured OOM injection, if any.
    ///
    /// Called once when an executor starts.
    pub fn arm_injection(&self) {
        if let (Some(injector), Some(injection)) = (&self.injector, &self.config.inject_oom) {
            injector.arm(injection);
        }
    }

    /// Wait until a rolled-back attempt may run again.
    ///
    /// Cancellation escalates to a fatal error; otherwise the coordinator
    /// decides.
    pub fn block_until_ready(&self) -> SpillwayResult<()> {
        if self.is_cancelled() {
            return Err(SpillwayError::cancelled(
                "task cancelled while waiting to retry",
            ));
        }
        self.coordinator.block_until_ready()
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for cancelling the task that owns a retry context.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancel_tx: watch::Sender<bool>,
}

impl CancellationHandle {
    /// Create a new cancellation handle and receiver.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { cancel_tx: tx }, rx)
    }

    /// Cancel the task.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_config::OomInjectionConfig;
    use common_error::RetryKind;

    #[test]
    fn test_default_context() {
        let ctx = RetryContext::new();
        assert!(!ctx.is_cancelled());
        assert!(ctx.metrics().is_some());
        assert_eq!(ctx.config().max_retries, None);
        assert!(ctx.block_until_ready().is_ok());
    }

    #[test]
    fn test_context_without_metrics() {
        let ctx = RetryContext::new().with_config(RetryConfig::default().with_metrics(false));
        assert!(ctx.metrics().is_none());

        // Updating is a no-op
        ctx.update_metrics("noop", |m| m.retries += 1);
    }

    #[test]
    fn test_cancellation() {
        let (handle, rx) = CancellationHandle::new();
        let ctx = RetryContext::new().with_cancellation(rx);

        assert!(ctx.block_until_ready().is_ok());
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(ctx.is_cancelled());

        let err = ctx.block_until_ready().unwrap_err();
        assert!(matches!(err, SpillwayError::ExecutionError(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_arm_injection_through_catalog() {
        let catalog = Arc::new(SpillCatalog::unlimited());
        let config = RetryConfig::default().with_injection(OomInjectionConfig::retry(1));
        let ctx = RetryContext::new().with_catalog(&catalog).with_config(config);

        ctx.arm_injection();
        assert!(catalog.injector().is_armed());

        let err = catalog.reserve(8).unwrap_err();
        assert_eq!(err.retry_kind(), Some(RetryKind::Retry));
    }

    #[test]
    fn test_arm_injection_without_config_is_noop() {
        let catalog = Arc::new(SpillCatalog::unlimited());
        let ctx = RetryContext::new().with_catalog(&catalog);

        ctx.arm_injection();
        assert!(!catalog.injector().is_armed());
    }
}
