//! Split policies.
//!
//! A split policy takes ownership of a unit that failed with
//! `SplitAndRetryOom` and returns smaller replacement units, in the order
//! they should be processed. The policy is responsible for the unit it was
//! given: it is released when the policy returns, successful or not.

use common_error::{SpillwayError, SpillwayResult};
use log::debug;
use spillway_memory::SpillableBatch;

use crate::resource::with_resource;

/// Reduces one failing unit into smaller replacement units.
pub trait SplitPolicy<T> {
    /// Split `unit` into replacements.
    fn split(&mut self, unit: T) -> SpillwayResult<Vec<T>>;
}

impl<T, F> SplitPolicy<T> for F
where
    F: FnMut(T) -> SpillwayResult<Vec<T>>,
{
    fn split(&mut self, unit: T) -> SpillwayResult<Vec<T>> {
        self(unit)
    }
}

/// Split a batch into two halves by row count.
///
/// The halves are registered in the batch's own catalog. A batch with one
/// row or fewer cannot be split and fails with `SplitAndRetryOom`, which the
/// executor surfaces as out-of-memory.
pub fn split_spillable_in_half_by_rows(batch: SpillableBatch) -> SpillwayResult<Vec<SpillableBatch>> {
    with_resource(batch, |batch| {
        let num_rows = batch.num_rows();
        if num_rows <= 1 {
            return Err(SpillwayError::split_and_retry_oom(format!(
                "cannot split a batch with {num_rows} rows"
            )));
        }

        let data = batch.get_batch()?;
        let half = num_rows / 2;
        let catalog = batch.catalog();
        let first = catalog.add_batch(data.slice(0, half))?;
        let second = catalog.add_batch(data.slice(half, num_rows - half))?;
        debug!(
            "split batch {} ({num_rows} rows) into {} + {} rows",
            batch.id(),
            first.num_rows(),
            second.num_rows()
        );
        Ok(vec![first, second])
    })
}

/// Target size for operations that process their input in chunks.
///
/// Splitting a target size halves it; the chunked operation then produces
/// smaller chunks on the retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSize {
    /// Desired chunk size in bytes.
    pub target: usize,
    /// Smallest chunk size that still makes progress.
    pub min: usize,
}

impl TargetSize {
    /// Create a target size.
    pub fn new(target: usize, min: usize) -> Self {
        Self { target, min }
    }
}

/// Halve a target size, never going below its minimum.
///
/// Fails with `SplitAndRetryOom` once the target is already at the minimum.
pub fn split_target_size_in_half(size: TargetSize) -> SpillwayResult<Vec<TargetSize>> {
    if size.target <= size.min {
        return Err(SpillwayError::split_and_retry_oom(format!(
            "target size {} cannot be split below the minimum of {}",
            size.target, size.min
        )));
    }
    Ok(vec![TargetSize {
        target: (size.target / 2).max(size.min),
        min: size.min,
    }])
}
