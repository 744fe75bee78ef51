//! Scoped resource cleanup.
//!
//! Releasing a work unit is dropping it, so most cleanup falls out of
//! ownership. These helpers make the release point explicit where it
//! matters: a resource handed to [`with_resource`] is released exactly once
//! when the block exits, whether it returns `Ok`, returns `Err` or unwinds.

use std::fmt;
use std::ops::{Deref, DerefMut};

/// Run `f` with `resource`, then release it.
pub fn with_resource<T, R, F>(mut resource: T, f: F) -> R
where
    F: FnOnce(&mut T) -> R,
{
    let result = f(&mut resource);
    drop(resource);
    result
}

/// Run `f` with a collection of resources, then release all of them.
pub fn with_resources<T, R, F>(mut resources: Vec<T>, f: F) -> R
where
    F: FnOnce(&mut [T]) -> R,
{
    let result = f(&mut resources);
    drop(resources);
    result
}

/// Runs a release closure on a value when dropped, unless disarmed.
///
/// Useful for values whose release is not their own `Drop`, such as a
/// reservation that must be returned to a pool.
pub struct ReleaseGuard<T, F>
where
    F: FnOnce(T),
{
    inner: Option<T>,
    release: Option<F>,
}

impl<T, F> ReleaseGuard<T, F>
where
    F: FnOnce(T),
{
    /// Guard `inner`, releasing it with `release`.
    #[must_use]
    pub fn new(inner: T, release: F) -> Self {
        Self {
            inner: Some(inner),
            release: Some(release),
        }
    }

    /// Disarm the guard and take the value back without releasing it.
    pub fn into_inner(mut guard: Self) -> T {
        guard.release = None;
        guard
            .inner
            .take()
            .expect("ReleaseGuard value is present until drop")
    }
}

impl<T, F> Deref for ReleaseGuard<T, F>
where
    F: FnOnce(T),
{
    type Target = T;

    fn deref(&self) -> &T {
        self.inner
            .as_ref()
            .expect("ReleaseGuard value is present until drop")
    }
}

impl<T, F> DerefMut for ReleaseGuard<T, F>
where
    F: FnOnce(T),
{
    fn deref_mut(&mut self) -> &mut T {
        self.inner
            .as_mut()
            .expect("ReleaseGuard value is present until drop")
    }
}

impl<T, F> Drop for ReleaseGuard<T, F>
where
    F: FnOnce(T),
{
    fn drop(&mut self) {
        if let (Some(inner), Some(release)) = (self.inner.take(), self.release.take()) {
            release(inner);
        }
    }
}

impl<T, F> fmt::Debug for ReleaseGuard<T, F>
where
    T: fmt::Debug,
    F: FnOnce(T),
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReleaseGuard").field(&self.inner).finish()
    }
}
