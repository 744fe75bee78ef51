//! Device memory model for Spillway.
//!
//! This crate provides the memory services the retry executors run against:
//!
//! - [`DeviceAllocator`]: device memory accounting, with the RAII
//!   [`DeviceReservation`] guard
//! - [`SpillCatalog`]: registry of [`SpillableBatch`] handles that moves
//!   batches between the device and host tiers, and turns allocation
//!   failures into `RetryOom` / `SplitAndRetryOom` signals
//! - [`OomInjector`]: forces those signals on upcoming allocations
//! - [`OomCoordinator`]: the hook a retry waits on before running again
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use spillway_memory::SpillCatalog;
//!
//! let catalog = Arc::new(SpillCatalog::from_config(&memory_config));
//! let batch = catalog.add_batch(record_batch)?;
//!
//! // Allocate scratch space while processing the batch
//! let scratch = catalog.reserve(batch.size_in_bytes())?;
//!
//! // Pinned to the device, and never spilled, until `data` is dropped
//! let data = batch.get_batch()?;
//! ```

mod allocator;
mod catalog;
pub mod codec;
mod coordinator;
mod injection;

pub use allocator::{DeviceAllocator, DeviceReservation, TrackingDeviceAllocator};
pub use catalog::{BatchId, CatalogStats, PinnedBatch, SpillCatalog, SpillableBatch, StorageTier};
pub use coordinator::{NoopCoordinator, OomCoordinator};
pub use injection::OomInjector;
