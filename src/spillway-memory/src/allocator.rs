//! Device memory accounting.
//!
//! The allocator is a byte counter with a ceiling. Deciding what to do when
//! the ceiling is hit (spill, retry, split) is left to the catalog.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common_error::{SpillwayError, SpillwayResult};

/// Byte accounting for one device.
///
/// [`SpillCatalog::reserve`] turns a failed `reserve` into a retry signal.
///
/// [`SpillCatalog::reserve`]: crate::SpillCatalog::reserve
pub trait DeviceAllocator: Send + Sync + std::fmt::Debug {
    /// Charge `bytes` to the device, or fail with `OutOfMemory`.
    fn reserve(&self, bytes: usize) -> SpillwayResult<()>;

    /// Return `bytes` charged earlier.
    fn release(&self, bytes: usize);

    /// Bytes currently charged.
    fn used(&self) -> usize;

    /// Device capacity in bytes; 0 means no limit.
    fn limit(&self) -> usize;

    /// Bytes that can still be charged.
    fn available(&self) -> usize {
        match self.limit() {
            0 => usize::MAX,
            limit => limit.saturating_sub(self.used()),
        }
    }
}

/// Atomic counter enforcing a fixed device capacity.
#[derive(Debug)]
pub struct TrackingDeviceAllocator {
    used: AtomicUsize,
    peak: AtomicUsize,
    limit: usize,
}

impl TrackingDeviceAllocator {
    /// Allocator for a device of `limit` bytes; 0 means no limit.
    pub fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit,
        }
    }

    /// Allocator that only counts.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Highest `used` value seen.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl DeviceAllocator for TrackingDeviceAllocator {
    fn reserve(&self, bytes: usize) -> SpillwayResult<()> {
        let limit = self.limit;
        let previous = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let charged = used.checked_add(bytes)?;
                (limit == 0 || charged <= limit).then_some(charged)
            })
            .map_err(|used| {
                SpillwayError::out_of_memory(format!(
                    "cannot charge {bytes} bytes: {used} of {limit} in use"
                ))
            })?;
        self.peak.fetch_max(previous + bytes, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, bytes: usize) {
        // Clamp at zero rather than wrap on a double release
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    fn limit(&self) -> usize {
        self.limit
    }
}

/// Bytes charged to an allocator, returned when dropped.
pub struct DeviceReservation {
    allocator: Arc<dyn DeviceAllocator>,
    bytes: usize,
}

impl std::fmt::Debug for DeviceReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceReservation")
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

impl DeviceReservation {
    /// Charge `bytes` to `allocator`.
    pub fn try_new(allocator: Arc<dyn DeviceAllocator>, bytes: usize) -> SpillwayResult<Self> {
        allocator.reserve(bytes)?;
        Ok(Self { allocator, bytes })
    }

    /// Bytes held.
    pub fn size(&self) -> usize {
        self.bytes
    }
}

impl Drop for DeviceReservation {
    fn drop(&mut self) {
        self.allocator.release(self.bytes);
    }
}
