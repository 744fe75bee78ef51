//! Cross-task memory-pressure coordination.

use common_error::SpillwayResult;

/// Coordinates threads that were rolled back by the allocator.
///
/// The retry executors call [`OomCoordinator::block_until_ready`] after a
/// `RetryOom` and before running the same work again. Implementations may
/// block until memory is available, or escalate by returning an error: a
/// `SplitAndRetryOom` asks the executor to split instead, anything else
/// aborts the operation (e.g. because the owning task was cancelled).
pub trait OomCoordinator: Send + Sync + std::fmt::Debug {
    /// Block the calling thread until a retry may proceed.
    fn block_until_ready(&self) -> SpillwayResult<()>;
}

/// Coordinator that never waits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCoordinator;

impl NoopCoordinator {
    /// Create a new no-op coordinator.
    pub fn new() -> Self {
        Self
    }
}

impl OomCoordinator for NoopCoordinator {
    fn block_until_ready(&self) -> SpillwayResult<()> {
        Ok(())
    }
}
