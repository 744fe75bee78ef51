//! Checkpoint and restore for state mutated inside a retried block.
//!
//! Work that mutates external state (a builder, an accumulator) must undo
//! those mutations before it is retried, or the retry observes a half-done
//! attempt. State that knows how to do this implements [`Retryable`].

use common_error::SpillwayResult;
use log::trace;

/// State that can be checkpointed before an attempt and rolled back after
/// a failed one.
pub trait Retryable {
    /// Record the current state as the restore point.
    fn checkpoint(&mut self);

    /// Roll back to the last checkpoint.
    fn restore(&mut self);
}

impl<R: Retryable + ?Sized> Retryable for &mut R {
    fn checkpoint(&mut self) {
        (**self).checkpoint();
    }

    fn restore(&mut self) {
        (**self).restore();
    }
}

/// Checkpoint `state`, run `f`, and restore `state` if `f` fails with a
/// retry signal.
///
/// Fatal errors leave the state as the failed attempt left it.
pub fn with_restore_on_retry<S, K, F>(state: &mut S, f: F) -> SpillwayResult<K>
where
    S: Retryable + ?Sized,
    F: FnOnce(&mut S) -> SpillwayResult<K>,
{
    state.checkpoint();
    let result = f(state);
    if let Err(ref e) = result {
        if e.is_retryable() {
            trace!("restoring checkpoint after {e}");
            state.restore();
        }
    }
    result
}

/// Like [`with_restore_on_retry`] for several pieces of state at once.
pub fn with_restore_all_on_retry<S, K, F>(states: &mut [S], f: F) -> SpillwayResult<K>
where
    S: Retryable,
    F: FnOnce(&mut [S]) -> SpillwayResult<K>,
{
    states.iter_mut().for_each(Retryable::checkpoint);
    let result = f(states);
    if let Err(ref e) = result {
        if e.is_retryable() {
            trace!("restoring {} checkpoints after {e}", states.len());
            states.iter_mut().for_each(Retryable::restore);
        }
    }
    result
}
