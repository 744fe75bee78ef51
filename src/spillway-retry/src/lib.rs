//! Retry-on-OOM executors for Spillway.
//!
//! Work that allocates device memory can fail in two recoverable ways:
//!
//! - `RetryOom`: memory was freed (usually by spilling), so the same work on
//!   the same input may now succeed
//! - `SplitAndRetryOom`: nothing more can be freed, so the input must shrink
//!
//! The executors here absorb those signals. Work units are owned by the
//! executor once pulled and released by dropping them: after a successful
//! attempt, after being split, or on a fatal error.
//!
//! # Executors
//!
//! - [`with_retry`] / [`RetryIterator`]: lazy, one result per resolved unit,
//!   splitting with a [`SplitPolicy`]
//! - [`with_retry_no_split`] and friends: eager, never split
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use spillway_memory::SpillCatalog;
//! use spillway_retry::{RetryContext, split_spillable_in_half_by_rows, with_retry};
//!
//! let catalog = Arc::new(SpillCatalog::from_config(&config.memory));
//! let ctx = RetryContext::new()
//!     .with_catalog(&catalog)
//!     .with_config(config.retry.clone());
//!
//! let batches = inputs.into_iter().map(|b| catalog.add_batch(b)).collect::<Result<Vec<_>, _>>()?;
//! for result in with_retry(&ctx, batches, split_spillable_in_half_by_rows, |batch| {
//!     let _scratch = catalog.reserve(batch.size_in_bytes())?;
//!     Ok(batch.get_batch()?.num_rows())
//! }) {
//!     println!("{} rows", result?);
//! }
//! ```

mod context;
mod iterator;
mod metrics;
mod no_split;
mod resource;
mod restore;
mod split;

pub use context::{CancellationHandle, RetryContext};
pub use iterator::{DEFAULT_EXECUTOR_NAME, RetryIterator, with_retry, with_retry_single};
pub use metrics::{ExecutionTimer, MetricsSink, RetryMetrics};
pub use no_split::{with_retry_no_split, with_retry_no_split_all, with_retry_no_split_one};
pub use resource::{ReleaseGuard, with_resource, with_resources};
pub use restore::{Retryable, with_restore_all_on_retry, with_restore_on_retry};
pub use split::{SplitPolicy, TargetSize, split_spillable_in_half_by_rows, split_target_size_in_half};
