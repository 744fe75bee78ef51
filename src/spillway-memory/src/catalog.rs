//! Spillable batch catalog.
//!
//! The catalog owns every registered batch and decides which tier it lives
//! in. Batches start on the device tier, charged against the
//! [`DeviceAllocator`]. Under memory pressure the oldest device batches are
//! encoded to Arrow IPC and moved to the host tier, and are brought back on
//! the next [`SpillableBatch::get_batch`].
//!
//! [`SpillCatalog::reserve`] is the allocation path work functions use. It is
//! where allocation failures become retry signals:
//!
//! | Situation | Signal |
//! |-----------|--------|
//! | injected OOM pending | injected kind |
//! | fits | `Ok(reservation)` |
//! | does not fit, spilling freed memory | `RetryOom` |
//! | does not fit, nothing left to spill | `SplitAndRetryOom` |
//! | larger than the whole device | `SplitAndRetryOom` |
//!
//! A batch handed out by [`SpillableBatch::get_batch`] stays pinned until the
//! returned [`PinnedBatch`] is dropped. Pinned batches are never spilled: the
//! caller still holds their buffers, so spilling them would free nothing.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arrow_array::RecordBatch;
use log::{debug, trace};

use common_config::MemoryConfig;
use common_error::{SpillwayError, SpillwayResult};

use crate::allocator::{DeviceAllocator, DeviceReservation, TrackingDeviceAllocator};
use crate::codec::{batch_size_bytes, decode_batch, encode_batch};
use crate::coordinator::OomCoordinator;
use crate::injection::OomInjector;

/// Catalog-unique batch identifier.
pub type BatchId = u64;

/// Where a batch's data currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTier {
    /// Resident in device memory.
    Device,
    /// Spilled to host memory.
    Host,
}

enum EntryData {
    Device {
        batch: RecordBatch,
        _reservation: DeviceReservation,
    },
    Host {
        bytes: Vec<u8>,
    },
}

struct CatalogEntry {
    data: EntryData,
    size: usize,
    pins: usize,
}

impl CatalogEntry {
    fn tier(&self) -> StorageTier {
        match self.data {
            EntryData::Device { .. } => StorageTier::Device,
            EntryData::Host { .. } => StorageTier::Host,
        }
    }
}

/// Point-in-time catalog statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogStats {
    /// Batches currently registered.
    pub live_batches: usize,
    /// Registered batches currently pinned for use.
    pub pinned_batches: usize,
    /// Bytes held on the device tier.
    pub device_bytes: usize,
    /// Encoded bytes held on the host tier.
    pub host_bytes: usize,
    /// Batches registered since creation.
    pub added: u64,
    /// Batches released since creation.
    pub released: u64,
    /// Device-to-host moves.
    pub spills: u64,
    /// Host-to-device moves.
    pub unspills: u64,
}

/// Registry of spillable batches sharing one device allocator.
pub struct SpillCatalog {
    allocator: Arc<dyn DeviceAllocator>,
    injector: Arc<OomInjector>,
    entries: Mutex<BTreeMap<BatchId, CatalogEntry>>,
    next_id: AtomicU64,
    spill_enabled: bool,
    added: AtomicU64,
    released: AtomicU64,
    spills: AtomicU64,
    unspills: AtomicU64,
}

impl std::fmt::Debug for SpillCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillCatalog")
            .field("allocator", &self.allocator)
            .field("spill_enabled", &self.spill_enabled)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SpillCatalog {
    /// Create a catalog on top of an allocator.
    pub fn new(allocator: Arc<dyn DeviceAllocator>) -> Self {
        Self {
            allocator,
            injector: Arc::new(OomInjector::new()),
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            spill_enabled: true,
            added: AtomicU64::new(0),
            released: AtomicU64::new(0),
            spills: AtomicU64::new(0),
            unspills: AtomicU64::new(0),
        }
    }

    /// Create a catalog with an unlimited tracking allocator.
    pub fn unlimited() -> Self {
        Self::new(Arc::new(TrackingDeviceAllocator::unlimited()))
    }

    /// Create a catalog from memory configuration.
    pub fn from_config(config: &MemoryConfig) -> Self {
        let allocator = TrackingDeviceAllocator::new(config.device_limit.unwrap_or(0));
        Self::new(Arc::new(allocator)).with_spill(config.spill_enabled)
    }

    /// Enable or disable spilling.
    pub fn with_spill(mut self, enabled: bool) -> Self {
        self.spill_enabled = enabled;
        self
    }

    /// The underlying device allocator.
    pub fn allocator(&self) -> &Arc<dyn DeviceAllocator> {
        &self.allocator
    }

    /// The OOM injector consulted by [`SpillCatalog::reserve`].
    pub fn injector(&self) -> &Arc<OomInjector> {
        &self.injector
    }

    /// Register a batch and hand back its owning handle.
    ///
    /// The batch goes to the device tier if it fits, spilling older batches
    /// if needed. When it still does not fit it is registered spilled; with
    /// spilling disabled that case fails with `SplitAndRetryOom`.
    pub fn add_batch(self: &Arc<Self>, batch: RecordBatch) -> SpillwayResult<SpillableBatch> {
        let size = batch_size_bytes(&batch);
        let num_rows = batch.num_rows();

        let data = match self.reserve_device(size) {
            Ok(reservation) => EntryData::Device {
                batch,
                _reservation: reservation,
            },
            Err(err) if self.spill_enabled => {
                debug!("no device room for {size} byte batch, registering it spilled: {err}");
                self.spills.fetch_add(1, Ordering::Relaxed);
                EntryData::Host {
                    bytes: encode_batch(&batch)?,
                }
            }
            Err(err) => {
                return Err(SpillwayError::split_and_retry_oom(format!(
                    "cannot register {size} byte batch: {err}"
                )));
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_entries().insert(
            id,
            CatalogEntry {
                data,
                size,
                pins: 0,
            },
        );
        self.added.fetch_add(1, Ordering::Relaxed);
        trace!("registered batch {id} ({num_rows} rows, {size} bytes)");

        Ok(SpillableBatch {
            id,
            num_rows,
            size,
            catalog: Arc::clone(self),
        })
    }

    /// Allocate device memory on behalf of a work function.
    ///
    /// Fails with `RetryOom` or `SplitAndRetryOom` as described in the module
    /// docs; never with a plain `OutOfMemory`.
    pub fn reserve(&self, bytes: usize) -> SpillwayResult<DeviceReservation> {
        self.injector.check()?;

        match DeviceReservation::try_new(Arc::clone(&self.allocator), bytes) {
            Ok(reservation) => Ok(reservation),
            Err(SpillwayError::OutOfMemory(msg)) => {
                let limit = self.allocator.limit();
                if limit > 0 && bytes > limit {
                    return Err(SpillwayError::split_and_retry_oom(format!(
                        "allocation of {bytes} bytes exceeds the {limit} byte device"
                    )));
                }

                let needed = bytes.saturating_sub(self.allocator.available());
                let freed = if self.spill_enabled {
                    self.spill(needed)?
                } else {
                    0
                };

                if freed > 0 {
                    Err(SpillwayError::retry_oom(format!(
                        "{msg}; spilled {freed} bytes"
                    )))
                } else {
                    Err(SpillwayError::split_and_retry_oom(format!(
                        "{msg}; nothing left to spill"
                    )))
                }
            }
            Err(other) => Err(other),
        }
    }

    /// Move unpinned device batches to the host tier, oldest first, until at
    /// least `target` bytes were freed or no candidate is left.
    ///
    /// Returns the number of device bytes freed.
    pub fn spill(&self, target: usize) -> SpillwayResult<usize> {
        if target == 0 || !self.spill_enabled {
            return Ok(0);
        }

        let mut entries = self.lock_entries();
        let mut freed = 0;
        for (id, entry) in entries.iter_mut() {
            if freed >= target {
                break;
            }
            if entry.pins > 0 {
                continue;
            }
            if let Some(size) = Self::spill_entry(entry)? {
                trace!("spilled batch {id} ({size} bytes)");
                self.spills.fetch_add(1, Ordering::Relaxed);
                freed += size;
            }
        }

        debug!("spilled {freed} of {target} requested device bytes");
        Ok(freed)
    }

    /// Current statistics.
    pub fn stats(&self) -> CatalogStats {
        let entries = self.lock_entries();
        let mut stats = CatalogStats {
            live_batches: entries.len(),
            added: self.added.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            spills: self.spills.load(Ordering::Relaxed),
            unspills: self.unspills.load(Ordering::Relaxed),
            ..CatalogStats::default()
        };
        for entry in entries.values() {
            if entry.pins > 0 {
                stats.pinned_batches += 1;
            }
            match &entry.data {
                EntryData::Device { .. } => stats.device_bytes += entry.size,
                EntryData::Host { bytes } => stats.host_bytes += bytes.len(),
            }
        }
        stats
    }

    /// Number of registered batches.
    pub fn live_batches(&self) -> usize {
        self.lock_entries().len()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<BatchId, CatalogEntry>> {
        self.entries.lock().expect("catalog lock poisoned")
    }

    /// Reserve device memory, spilling other batches to make room.
    fn reserve_device(&self, bytes: usize) -> SpillwayResult<DeviceReservation> {
        match DeviceReservation::try_new(Arc::clone(&self.allocator), bytes) {
            Ok(reservation) => Ok(reservation),
            Err(SpillwayError::OutOfMemory(_)) if self.spill_enabled => {
                let needed = bytes.saturating_sub(self.allocator.available());
                self.spill(needed)?;
                DeviceReservation::try_new(Arc::clone(&self.allocator), bytes)
            }
            Err(err) => Err(err),
        }
    }

    fn spill_entry(entry: &mut CatalogEntry) -> SpillwayResult<Option<usize>> {
        let bytes = match &entry.data {
            EntryData::Device { batch, .. } => encode_batch(batch)?,
            EntryData::Host { .. } => return Ok(None),
        };
        // Replacing the device data drops its reservation
        entry.data = EntryData::Host { bytes };
        Ok(Some(entry.size))
    }

    fn tier_of(&self, id: BatchId) -> SpillwayResult<StorageTier> {
        self.lock_entries()
            .get(&id)
            .map(CatalogEntry::tier)
            .ok_or_else(|| SpillwayError::internal(format!("batch {id} is not registered")))
    }

    fn pin(&self, id: BatchId) -> SpillwayResult<RecordBatch> {
        let size = {
            let mut entries = self.lock_entries();
            let entry = entries
                .get_mut(&id)
                .ok_or_else(|| SpillwayError::internal(format!("batch {id} is not registered")))?;
            match &entry.data {
                EntryData::Device { batch, .. } => {
                    let batch = batch.clone();
                    entry.pins += 1;
                    return Ok(batch);
                }
                EntryData::Host { .. } => entry.size,
            }
        };

        // Reserving may spill other entries, so the lock must not be held
        let reservation = self.reserve(size)?;

        let mut entries = self.lock_entries();
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| SpillwayError::internal(format!("batch {id} is not registered")))?;
        // Another thread may have restored it while the lock was released
        let restored = match &entry.data {
            EntryData::Device { .. } => None,
            EntryData::Host { bytes } => Some(decode_batch(bytes)?),
        };
        if let Some(batch) = restored {
            entry.data = EntryData::Device {
                batch,
                _reservation: reservation,
            };
            self.unspills.fetch_add(1, Ordering::Relaxed);
            trace!("restored batch {id} to device");
        }
        let EntryData::Device { batch, .. } = &entry.data else {
            return Err(SpillwayError::internal(format!(
                "batch {id} was not restored"
            )));
        };
        let batch = batch.clone();
        entry.pins += 1;
        Ok(batch)
    }

    fn unpin(&self, id: BatchId) {
        if let Some(entry) = self.lock_entries().get_mut(&id) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    fn spill_one(&self, id: BatchId) -> SpillwayResult<bool> {
        let mut entries = self.lock_entries();
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| SpillwayError::internal(format!("batch {id} is not registered")))?;
        if entry.pins > 0 {
            trace!("batch {id} is pinned, not spilling");
            return Ok(false);
        }
        let spilled = Self::spill_entry(entry)?.is_some();
        if spilled {
            self.spills.fetch_add(1, Ordering::Relaxed);
        }
        Ok(spilled)
    }

    fn remove(&self, id: BatchId) {
        if self.lock_entries().remove(&id).is_some() {
            self.released.fetch_add(1, Ordering::Relaxed);
            trace!("released batch {id}");
        }
    }
}

impl OomCoordinator for SpillCatalog {
    /// Spilling happens synchronously inside [`SpillCatalog::reserve`], so by
    /// the time a `RetryOom` reaches the executor the room has been made.
    fn block_until_ready(&self) -> SpillwayResult<()> {
        Ok(())
    }
}

/// Owning handle to a batch registered in a [`SpillCatalog`].
///
/// Exactly one handle exists per registered batch. Dropping it (or calling
/// [`SpillableBatch::close`]) removes the batch from the catalog and frees
/// its device or host memory.
pub struct SpillableBatch {
    id: BatchId,
    num_rows: usize,
    size: usize,
    catalog: Arc<SpillCatalog>,
}

impl std::fmt::Debug for SpillableBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillableBatch")
            .field("id", &self.id)
            .field("num_rows", &self.num_rows)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl SpillableBatch {
    /// Catalog identifier.
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Device bytes this batch is charged for while resident.
    pub fn size_in_bytes(&self) -> usize {
        self.size
    }

    /// The owning catalog.
    pub fn catalog(&self) -> &Arc<SpillCatalog> {
        &self.catalog
    }

    /// Current tier.
    pub fn tier(&self) -> SpillwayResult<StorageTier> {
        self.catalog.tier_of(self.id)
    }

    /// Acquire the data for use, restoring it to the device if spilled.
    ///
    /// The batch is pinned to the device until the returned guard is dropped.
    /// Restoring allocates device memory and may therefore fail with a retry
    /// signal.
    pub fn get_batch(&self) -> SpillwayResult<PinnedBatch<'_>> {
        let batch = self.catalog.pin(self.id)?;
        Ok(PinnedBatch {
            batch,
            handle: self,
        })
    }

    /// Move this batch to the host tier. Returns false if it already was, or
    /// if it is pinned.
    pub fn spill(&self) -> SpillwayResult<bool> {
        self.catalog.spill_one(self.id)
    }

    /// Release the batch.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for SpillableBatch {
    fn drop(&mut self) {
        self.catalog.remove(self.id);
    }
}

/// A batch acquired for use; keeps it on the device until dropped.
pub struct PinnedBatch<'a> {
    batch: RecordBatch,
    handle: &'a SpillableBatch,
}

impl std::fmt::Debug for PinnedBatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBatch")
            .field("id", &self.handle.id)
            .field("num_rows", &self.batch.num_rows())
            .finish()
    }
}

impl Deref for PinnedBatch<'_> {
    type Target = RecordBatch;

    fn deref(&self) -> &RecordBatch {
        &self.batch
    }
}

impl Drop for PinnedBatch<'_> {
    fn drop(&mut self) {
        self.handle.catalog.unpin(self.handle.id);
    }
}
