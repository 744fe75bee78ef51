//! Forced out-of-memory signals for exercising retry paths.

use std::sync::Mutex;

use common_config::{OomInjectionConfig, OomInjectionType};
use common_error::{SpillwayError, SpillwayResult};
use log::debug;

#[derive(Debug, Default)]
struct InjectionState {
    oom_type: OomInjectionType,
    remaining: usize,
    skip: usize,
    injected: u64,
}

/// Makes upcoming allocations fail with a chosen retry signal.
///
/// [`SpillCatalog::reserve`] calls [`OomInjector::check`] before touching the
/// allocator, so an armed injector behaves like a real allocation failure
/// raised from inside the work function.
///
/// [`SpillCatalog::reserve`]: crate::SpillCatalog::reserve
#[derive(Debug, Default)]
pub struct OomInjector {
    state: Mutex<InjectionState>,
}

impl OomInjector {
    /// Create a disarmed injector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the injector, replacing any pending injection.
    pub fn arm(&self, config: &OomInjectionConfig) {
        let mut state = self.state.lock().expect("injector lock poisoned");
        state.oom_type = config.oom_type;
        state.remaining = config.num_ooms;
        state.skip = config.skip_count;
        debug!("armed OOM injection: {config}");
    }

    /// Fail the next `num_ooms` allocations with `RetryOom`.
    pub fn force_retry_oom(&self, num_ooms: usize) {
        self.arm(&OomInjectionConfig::retry(num_ooms));
    }

    /// Fail the next `num_ooms` allocations with `SplitAndRetryOom`.
    pub fn force_split_and_retry_oom(&self, num_ooms: usize) {
        self.arm(&OomInjectionConfig::split_and_retry(num_ooms));
    }

    /// Drop any pending injection.
    pub fn disarm(&self) {
        let mut state = self.state.lock().expect("injector lock poisoned");
        state.remaining = 0;
        state.skip = 0;
    }

    /// Whether an injection is still pending.
    pub fn is_armed(&self) -> bool {
        self.state.lock().expect("injector lock poisoned").remaining > 0
    }

    /// Number of signals injected so far.
    pub fn injected_count(&self) -> u64 {
        self.state.lock().expect("injector lock poisoned").injected
    }

    /// Called on every allocation attempt.
    pub fn check(&self) -> SpillwayResult<()> {
        let mut state = self.state.lock().expect("injector lock poisoned");
        if state.remaining == 0 {
            return Ok(());
        }
        if state.skip > 0 {
            state.skip -= 1;
            return Ok(());
        }

        state.remaining -= 1;
        state.injected += 1;
        match state.oom_type {
            OomInjectionType::Retry => Err(SpillwayError::retry_oom("injected RetryOOM")),
            OomInjectionType::SplitAndRetry => Err(SpillwayError::split_and_retry_oom(
                "injected SplitAndRetryOOM",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_error::RetryKind;

    #[test]
    fn test_disarmed_injector_passes() {
        let injector = OomInjector::new();
        assert!(!injector.is_armed());
        for _ in 0..10 {
            assert!(injector.check().is_ok());
        }
        assert_eq!(injector.injected_count(), 0);
    }

    #[test]
    fn test_force_retry_oom() {
        let injector = OomInjector::new();
        injector.force_retry_oom(2);

        for _ in 0..2 {
            let err = injector.check().unwrap_err();
            assert_eq!(err.retry_kind(), Some(RetryKind::Retry));
        }
        assert!(injector.check().is_ok());
        assert_eq!(injector.injected_count(), 2);
        assert!(!injector.is_armed());
    }

    #[test]
    fn test_skip_then_split() {
        let injector = OomInjector::new();
        injector.arm(&OomInjectionConfig::split_and_retry(1).with_skip(2));

        assert!(injector.check().is_ok());
        assert!(injector.check().is_ok());
        let err = injector.check().unwrap_err();
        assert_eq!(err.retry_kind(), Some(RetryKind::SplitAndRetry));
        assert!(injector.check().is_ok());
    }

    #[test]
    fn test_disarm() {
        let injector = OomInjector::new();
        injector.force_split_and_retry_oom(5);
        injector.disarm();
        assert!(injector.check().is_ok());
    }
}
