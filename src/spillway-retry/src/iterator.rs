//! Lazy retry executor.
//!
//! [`RetryIterator`] pulls work units one at a time, runs the work function
//! on each and yields one result per resolved unit:
//!
//! ```text
//!            ┌──────────────┐  RetryOom: wait, run again
//!  pending ─▶│              │◀──────────┐
//!  ──or──    │  work(&mut u)│───────────┘
//!  input  ─▶ │              │── Ok ──────────▶ release u, yield result
//!            └──────────────┘
//!                   │ SplitAndRetryOom
//!                   ▼
//!            split policy(u) ── fragments pushed to the front of pending
//! ```
//!
//! Any other error releases the unit and every pending fragment, is yielded
//! once, and ends the iteration. Units still inside the input iterator are
//! never touched; the caller keeps them by passing `inputs.by_ref()` or gets
//! them back with [`RetryIterator::into_inner`].

use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::marker::PhantomData;

use common_error::{RetryKind, SpillwayError, SpillwayResult};
use log::{debug, trace, warn};

use crate::context::RetryContext;
use crate::metrics::ExecutionTimer;
use crate::split::SplitPolicy;

/// Name used for logs and metrics when none is given.
pub const DEFAULT_EXECUTOR_NAME: &str = "with_retry";

/// Lazy retry executor over an iterator of work units.
///
/// Yields `Ok(result)` for every unit that was processed, in depth-first
/// order: the fragments of a split unit come out before any later input. The
/// first fatal error is yielded as `Err` and nothing follows it. Retry
/// signals never reach the caller; one that cannot be acted on is turned
/// into [`SpillwayError::OutOfMemory`].
pub struct RetryIterator<'a, I, T, R, W>
where
    I: Iterator<Item = T>,
    W: FnMut(&mut T) -> SpillwayResult<R>,
{
    ctx: RetryContext,
    name: String,
    input: I,
    pending: VecDeque<T>,
    split_policy: Option<Box<dyn SplitPolicy<T> + 'a>>,
    work: W,
    started: bool,
    done: bool,
    _result: PhantomData<fn() -> R>,
}

impl<'a, I, T, R, W> RetryIterator<'a, I, T, R, W>
where
    I: Iterator<Item = T>,
    W: FnMut(&mut T) -> SpillwayResult<R>,
{
    /// Create an executor without a split policy.
    ///
    /// A `SplitAndRetryOom` then fails the operation with out-of-memory.
    pub fn new(ctx: &RetryContext, input: I, work: W) -> Self {
        Self {
            ctx: ctx.clone(),
            name: DEFAULT_EXECUTOR_NAME.to_string(),
            input,
            pending: VecDeque::new(),
            split_policy: None,
            work,
            started: false,
            done: false,
            _result: PhantomData,
        }
    }

    /// Split units that fail with `SplitAndRetryOom` using `policy`.
    pub fn with_split_policy<S>(mut self, policy: S) -> Self
    where
        S: SplitPolicy<T> + 'a,
    {
        self.split_policy = Some(Box::new(policy));
        self
    }

    /// Name this executor in logs and metrics.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The executor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether splitting is supported.
    pub fn can_split(&self) -> bool {
        self.split_policy.is_some()
    }

    /// Number of split fragments waiting to be processed.
    pub fn pending_fragments(&self) -> usize {
        self.pending.len()
    }

    /// Stop and hand back the input iterator with the units never pulled.
    ///
    /// Split fragments still waiting to be processed are dropped here, before
    /// the input is returned.
    pub fn into_inner(mut self) -> I {
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            debug!("{}: stopped early, released {dropped} pending fragments", self.name);
        }
        self.input
    }

    fn next_unit(&mut self) -> Option<T> {
        self.pending.pop_front().or_else(|| self.input.next())
    }

    /// Run the work function on `unit` until it stops asking for an
    /// identical retry.
    fn attempt(&mut self, unit: &mut T) -> SpillwayResult<R> {
        let mut retries = 0usize;
        loop {
            self.ctx.update_metrics(&self.name, |m| m.attempts += 1);
            let err = match (self.work)(&mut *unit) {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };
            if err.retry_kind() != Some(RetryKind::Retry) {
                return Err(err);
            }

            retries += 1;
            self.ctx.update_metrics(&self.name, |m| m.retries += 1);
            if let Some(max) = self.ctx.config().max_retries {
                if retries > max {
                    return Err(SpillwayError::out_of_memory(format!(
                        "{}: gave up after {max} retries: {err}",
                        self.name
                    )));
                }
            }
            debug!("{}: retrying after {err} (retry {retries})", self.name);

            let timer = ExecutionTimer::start();
            let ready = self.ctx.block_until_ready();
            let blocked = timer.stop();
            self.ctx.update_metrics(&self.name, |m| m.add_block_time(blocked));
            ready?;
        }
    }

    /// Replace `unit` by its fragments at the front of the pending queue.
    fn split(&mut self, unit: T, cause: &SpillwayError) -> SpillwayResult<()> {
        self.ctx.update_metrics(&self.name, |m| m.split_retries += 1);

        let Some(policy) = self.split_policy.as_mut() else {
            drop(unit);
            return Err(SpillwayError::out_of_memory(format!(
                "{}: split and retry requested but splitting is not supported: {cause}",
                self.name
            )));
        };

        let fragments = policy.split(unit)?;
        if fragments.is_empty() {
            return Err(SpillwayError::internal(format!(
                "{}: split policy produced no fragments",
                self.name
            )));
        }

        debug!(
            "{}: split after {cause} into {} fragments",
            self.name,
            fragments.len()
        );
        let count = fragments.len() as u64;
        self.ctx.update_metrics(&self.name, |m| m.fragments += count);
        for fragment in fragments.into_iter().rev() {
            self.pending.push_front(fragment);
        }
        Ok(())
    }

    /// Release everything the executor holds and end the iteration.
    fn abort(&mut self, err: SpillwayError) -> SpillwayError {
        self.done = true;
        let dropped = self.pending.len();
        self.pending.clear();
        self.ctx.update_metrics(&self.name, |m| m.failures += 1);
        warn!(
            "{}: aborting, released {dropped} pending fragments: {err}",
            self.name
        );
        if let Some(sink) = self.ctx.metrics() {
            debug!("retry metrics at abort:\n{}", sink.format_summary());
        }
        err.into_fatal()
    }
}

impl<I, T, R, W> Iterator for RetryIterator<'_, I, T, R, W>
where
    I: Iterator<Item = T>,
    W: FnMut(&mut T) -> SpillwayResult<R>,
{
    type Item = SpillwayResult<R>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            self.ctx.arm_injection();
        }

        loop {
            let Some(mut unit) = self.next_unit() else {
                self.done = true;
                trace!("{}: input exhausted", self.name);
                return None;
            };

            match self.attempt(&mut unit) {
                Ok(result) => {
                    drop(unit);
                    self.ctx.update_metrics(&self.name, |m| m.results += 1);
                    return Some(Ok(result));
                }
                Err(err) if err.retry_kind() == Some(RetryKind::SplitAndRetry) => {
                    if let Err(split_err) = self.split(unit, &err) {
                        return Some(Err(self.abort(split_err)));
                    }
                }
                Err(err) => {
                    drop(unit);
                    return Some(Err(self.abort(err)));
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            (0, Some(0))
        } else {
            (0, None)
        }
    }
}

impl<I, T, R, W> FusedIterator for RetryIterator<'_, I, T, R, W>
where
    I: Iterator<Item = T>,
    W: FnMut(&mut T) -> SpillwayResult<R>,
{
}

/// Lazily run `work` over `input`, splitting units with `split_policy`.
///
/// See [`RetryIterator`] for the retry and release rules.
pub fn with_retry<'a, I, T, R, S, W>(
    ctx: &RetryContext,
    input: I,
    split_policy: S,
    work: W,
) -> RetryIterator<'a, I::IntoIter, T, R, W>
where
    I: IntoIterator<Item = T>,
    S: SplitPolicy<T> + 'a,
    W: FnMut(&mut T) -> SpillwayResult<R>,
{
    RetryIterator::new(ctx, input.into_iter(), work).with_split_policy(split_policy)
}

/// Lazily run `work` over a single unit, splitting it with `split_policy`.
///
/// Yields one result per fragment the unit was finally resolved into.
pub fn with_retry_single<'a, T, R, S, W>(
    ctx: &RetryContext,
    unit: T,
    split_policy: S,
    work: W,
) -> RetryIterator<'a, std::iter::Once<T>, T, R, W>
where
    S: SplitPolicy<T> + 'a,
    W: FnMut(&mut T) -> SpillwayResult<R>,
{
    with_retry(ctx, std::iter::once(unit), split_policy, work)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use common_config::RetryConfig;

    /// Unit that records its release.
    struct Unit {
        name: String,
        released: Rc<RefCell<Vec<String>>>,
    }

    impl Drop for Unit {
        fn drop(&mut self) {
            self.released.borrow_mut().push(self.name.clone());
        }
    }

    fn units(names: &[&str], released: &Rc<RefCell<Vec<String>>>) -> Vec<Unit> {
        names
            .iter()
            .map(|name| Unit {
                name: (*name).to_string(),
                released: Rc::clone(released),
            })
            .collect()
    }

    #[test]
    fn test_all_succeed() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let ctx = RetryContext::new();

        let results: Vec<String> = RetryIterator::new(
            &ctx,
            units(&["a", "b", "c"], &released).into_iter(),
            |u: &mut Unit| Ok(u.name.to_uppercase()),
        )
        .collect::<SpillwayResult<_>>()
        .unwrap();

        assert_eq!(results, vec!["A", "B", "C"]);
        assert_eq!(*released.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_lazy_pull() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let pulled = Rc::new(RefCell::new(0));
        let ctx = RetryContext::new();

        let counter = Rc::clone(&pulled);
        let input = units(&["a", "b"], &released).into_iter().inspect(move |_| {
            *counter.borrow_mut() += 1;
        });
        let mut iter = RetryIterator::new(&ctx, input, |u: &mut Unit| Ok(u.name.clone()));

        assert_eq!(*pulled.borrow(), 0);
        assert_eq!(iter.next().unwrap().unwrap(), "a");
        assert_eq!(*pulled.borrow(), 1);
        assert_eq!(*released.borrow(), vec!["a"]);
    }

    #[test]
    fn test_retry_same_unit() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let ctx = RetryContext::new();
        let mut calls = 0;

        let results: Vec<String> = RetryIterator::new(
            &ctx,
            units(&["a"], &released).into_iter(),
            |u: &mut Unit| {
                calls += 1;
                if calls < 4 {
                    Err(SpillwayError::retry_oom("not yet"))
                } else {
                    Ok(u.name.clone())
                }
            },
        )
        .named("retry_same_unit")
        .collect::<SpillwayResult<_>>()
        .unwrap();

        assert_eq!(results, vec!["a"]);
        assert_eq!(*released.borrow(), vec!["a"]);

        let metrics = ctx.metrics().unwrap().get("retry_same_unit").unwrap();
        assert_eq!(metrics.attempts, 4);
        assert_eq!(metrics.retries, 3);
        assert_eq!(metrics.results, 1);
    }

    #[test]
    fn test_max_retries_gives_up() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let ctx = RetryContext::new().with_config(RetryConfig::default().with_max_retries(2));
        let mut calls = 0;

        let mut iter = RetryIterator::new(
            &ctx,
            units(&["a"], &released).into_iter(),
            |_: &mut Unit| -> SpillwayResult<()> {
                calls += 1;
                Err(SpillwayError::retry_oom("never"))
            },
        );

        let err = iter.next().unwrap().unwrap_err();
        assert!(matches!(err, SpillwayError::OutOfMemory(_)));
        assert!(iter.next().is_none());
        drop(iter);
        assert_eq!(calls, 3);
        assert_eq!(*released.borrow(), vec!["a"]);
    }

    #[test]
    fn test_split_without_policy_is_oom() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let ctx = RetryContext::new();

        let mut input = units(&["a", "b"], &released).into_iter();
        let mut iter = RetryIterator::new(&ctx, input.by_ref(), |_: &mut Unit| -> SpillwayResult<()> {
            Err(SpillwayError::split_and_retry_oom("too big"))
        });
        assert!(!iter.can_split());

        let err = iter.next().unwrap().unwrap_err();
        assert!(matches!(err, SpillwayError::OutOfMemory(_)));
        assert!(iter.next().is_none());
        drop(iter);

        assert_eq!(*released.borrow(), vec!["a"]);
        assert_eq!(input.len(), 1);
    }

    #[test]
    fn test_empty_split_is_fatal() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let ctx = RetryContext::new();

        let err = with_retry(
            &ctx,
            units(&["a"], &released),
            |_: Unit| -> SpillwayResult<Vec<Unit>> { Ok(Vec::new()) },
            |_: &mut Unit| -> SpillwayResult<()> {
                Err(SpillwayError::split_and_retry_oom("too big"))
            },
        )
        .next()
        .unwrap()
        .unwrap_err();

        assert!(matches!(err, SpillwayError::InternalError(_)));
        assert_eq!(*released.borrow(), vec!["a"]);
    }

    #[test]
    fn test_into_inner_returns_unpulled_units() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let ctx = RetryContext::new();

        let mut iter = RetryIterator::new(
            &ctx,
            units(&["a", "b", "c"], &released).into_iter(),
            |u: &mut Unit| Ok(u.name.clone()),
        );
        assert_eq!(iter.next().unwrap().unwrap(), "a");

        let rest = iter.into_inner();
        assert_eq!(rest.len(), 2);
        assert_eq!(*released.borrow(), vec!["a"]);
    }

    #[test]
    fn test_into_inner_releases_pending_fragments() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let ctx = RetryContext::new();

        let tracker = Rc::clone(&released);
        let halve = move |u: Unit| -> SpillwayResult<Vec<Unit>> {
            let halves = [format!("{}1", u.name), format!("{}2", u.name)];
            Ok(halves
                .into_iter()
                .map(|name| Unit {
                    name,
                    released: Rc::clone(&tracker),
                })
                .collect())
        };
        let mut iter = with_retry(&ctx, units(&["a", "b"], &released), halve, |u: &mut Unit| {
            if u.name == "a" {
                Err(SpillwayError::split_and_retry_oom("too big"))
            } else {
                Ok(u.name.clone())
            }
        });
        assert_eq!(iter.next().unwrap().unwrap(), "a1");
        assert_eq!(*released.borrow(), vec!["a", "a1"]);

        let rest: Vec<Unit> = iter.into_inner().collect();
        assert_eq!(*released.borrow(), vec!["a", "a1", "a2"]);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "b");
    }

    #[test]
    fn test_fused_after_exhaustion() {
        let ctx = RetryContext::new();
        let mut iter = RetryIterator::new(&ctx, 0..2, |n: &mut i32| Ok(*n * 10));

        assert_eq!(iter.next().unwrap().unwrap(), 0);
        assert_eq!(iter.next().unwrap().unwrap(), 10);
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
        assert_eq!(iter.size_hint(), (0, Some(0)));
    }
}
