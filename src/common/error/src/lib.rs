//! Error types and result aliases for Spillway.
//!
//! Besides the usual fatal errors this crate defines the two out-of-memory
//! retry signals raised by the device allocator, see [`RetryKind`].

mod error;

pub use error::{RetryKind, SpillwayError, SpillwayResult};
