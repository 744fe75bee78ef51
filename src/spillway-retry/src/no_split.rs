//! Eager retry executors that never split.
//!
//! All units are handed over at call time, so unlike the lazy executor these
//! own the whole collection: when one unit fails fatally every remaining
//! unit is released before the error is returned.

use common_error::{SpillwayError, SpillwayResult};

use crate::context::RetryContext;
use crate::iterator::RetryIterator;

/// Run `work` over every unit, retrying on `RetryOom`, and collect the
/// results in input order.
///
/// Each unit is released as soon as its work succeeds. On the first fatal
/// error (including a `SplitAndRetryOom`, reported as out-of-memory) the
/// failing unit and all units not yet processed are released.
pub fn with_retry_no_split<T, R, W>(
    ctx: &RetryContext,
    units: Vec<T>,
    work: W,
) -> SpillwayResult<Vec<R>>
where
    W: FnMut(&mut T) -> SpillwayResult<R>,
{
    let mut results = Vec::with_capacity(units.len());
    let executor = RetryIterator::new(ctx, units.into_iter(), work).named("with_retry_no_split");
    for result in executor {
        results.push(result?);
    }
    Ok(results)
}

/// Run `work` on a single unit, retrying on `RetryOom`.
pub fn with_retry_no_split_one<T, R, W>(ctx: &RetryContext, unit: T, work: W) -> SpillwayResult<R>
where
    W: FnMut(&mut T) -> SpillwayResult<R>,
{
    RetryIterator::new(ctx, std::iter::once(unit), work)
        .named("with_retry_no_split")
        .next()
        .unwrap_or_else(|| Err(SpillwayError::internal("retry produced no result")))
}

/// Run `work` once over the whole collection, retrying the whole call on
/// `RetryOom`.
///
/// All units are released when this returns, whatever the outcome.
pub fn with_retry_no_split_all<T, R, W>(
    ctx: &RetryContext,
    units: Vec<T>,
    mut work: W,
) -> SpillwayResult<R>
where
    W: FnMut(&mut [T]) -> SpillwayResult<R>,
{
    with_retry_no_split_one(ctx, units, |units: &mut Vec<T>| work(units.as_mut_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Unit {
        id: u32,
        released: Rc<RefCell<Vec<u32>>>,
    }

    impl Drop for Unit {
        fn drop(&mut self) {
            self.released.borrow_mut().push(self.id);
        }
    }

    fn units(n: u32, released: &Rc<RefCell<Vec<u32>>>) -> Vec<Unit> {
        (0..n)
            .map(|id| Unit {
                id,
                released: Rc::clone(released),
            })
            .collect()
    }

    #[test]
    fn test_results_in_input_order() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let ctx = RetryContext::new();

        let results = with_retry_no_split(&ctx, units(4, &released), |u: &mut Unit| Ok(u.id * 2)).unwrap();

        assert_eq!(results, vec![0, 2, 4, 6]);
        assert_eq!(*released.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_empty_input() {
        let ctx = RetryContext::new();
        let results = with_retry_no_split(&ctx, Vec::<u32>::new(), |n: &mut u32| Ok(*n)).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_fatal_releases_everything_once() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let ctx = RetryContext::new();

        let err = with_retry_no_split(&ctx, units(4, &released), |u: &mut Unit| {
            if u.id == 1 {
                Err(SpillwayError::execution("bad row"))
            } else {
                Ok(u.id)
            }
        })
        .unwrap_err();

        assert!(matches!(err, SpillwayError::ExecutionError(_)));
        let mut released = released.borrow().clone();
        released.sort_unstable();
        assert_eq!(released, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_split_request_is_oom() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let ctx = RetryContext::new();

        let err = with_retry_no_split(&ctx, units(2, &released), |_: &mut Unit| -> SpillwayResult<()> {
            Err(SpillwayError::split_and_retry_oom("too big"))
        })
        .unwrap_err();

        assert!(matches!(err, SpillwayError::OutOfMemory(_)));
        assert_eq!(released.borrow().len(), 2);
    }

    #[test]
    fn test_single_unit_retries() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let ctx = RetryContext::new();
        let mut failures = 2;

        let unit = units(1, &released).pop().unwrap();
        let result = with_retry_no_split_one(&ctx, unit, |u: &mut Unit| {
            if failures > 0 {
                failures -= 1;
                return Err(SpillwayError::retry_oom("later"));
            }
            Ok(u.id + 100)
        })
        .unwrap();

        assert_eq!(result, 100);
        assert_eq!(*released.borrow(), vec![0]);
    }

    #[test]
    fn test_whole_collection_retried_together() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let ctx = RetryContext::new();
        let mut calls = 0;

        let total = with_retry_no_split_all(&ctx, units(3, &released), |units: &mut [Unit]| {
            calls += 1;
            if calls == 1 {
                return Err(SpillwayError::retry_oom("first try"));
            }
            Ok(units.iter().map(|u| u.id).sum::<u32>())
        })
        .unwrap();

        assert_eq!(total, 3);
        assert_eq!(calls, 2);
        assert_eq!(released.borrow().len(), 3);
    }
}
