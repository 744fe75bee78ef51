//! Spillway - retry-on-OOM execution for device memory workloads
//!
//! Spillway runs work against a bounded device memory pool. When an
//! allocation cannot be satisfied the work is rolled back, memory is freed by
//! spilling batches to host memory, and the work is retried, either
//! unchanged or on a split, smaller input.

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

// Re-export member crates
pub use common_config as config;
pub use common_error as error;
pub use spillway_memory as memory;
pub use spillway_retry as retry;

pub use common_config::{MemoryConfig, OomInjectionConfig, RetryConfig, SpillwayConfig};
pub use common_error::{RetryKind, SpillwayError, SpillwayResult};
pub use spillway_memory::{SpillCatalog, SpillableBatch};
pub use spillway_retry::{
    RetryContext, RetryIterator, with_retry, with_retry_no_split, with_retry_no_split_all,
    with_retry_no_split_one, with_retry_single,
};

/// Spillway version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
