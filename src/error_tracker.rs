//! Rate-limited failure logging for long-running fan-out loops.
//!
//! Applied uniformly across every loop in the core that can fail
//! repeatedly against a flaky server: scan deletes, directory-walk
//! resource uploads, and batch uploads under sustained 5xx responses.
//! Logs warn on the first failure in a run and every 100th after that;
//! emits info once on the first success following a run of failures.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Shared error tracker — cheap to clone, backed by atomics.
#[derive(Clone)]
pub struct ConsecutiveErrorTracker {
    inner: Arc<ErrorTrackerInner>,
}

struct ErrorTrackerInner {
    consecutive: AtomicU32,
    total_since_reset: AtomicU32,
    first_error_at: Mutex<Option<Instant>>,
}

impl ConsecutiveErrorTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ErrorTrackerInner {
                consecutive: AtomicU32::new(0),
                total_since_reset: AtomicU32::new(0),
                first_error_at: Mutex::new(None),
            }),
        }
    }

    /// Call on each error. Returns true if this error should be logged (warn).
    pub fn record_error(&self) -> bool {
        let n = self.inner.consecutive.fetch_add(1, Ordering::Relaxed);
        self.inner.total_since_reset.fetch_add(1, Ordering::Relaxed);

        if n == 0 {
            if let Ok(mut guard) = self.inner.first_error_at.lock() {
                *guard = Some(Instant::now());
            }
        }

        n == 0 || (n + 1) % 100 == 0
    }

    /// Call on success. Returns Some(count) if recovering from errors.
    pub fn record_success(&self) -> Option<u32> {
        let prev = self.inner.consecutive.swap(0, Ordering::Relaxed);
        if prev > 0 {
            let total = self.inner.total_since_reset.swap(0, Ordering::Relaxed);
            if let Ok(mut guard) = self.inner.first_error_at.lock() {
                *guard = None;
            }
            Some(total)
        } else {
            None
        }
    }

    pub fn consecutive_count(&self) -> u32 {
        self.inner.consecutive.load(Ordering::Relaxed)
    }
}

impl Default for ConsecutiveErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_and_every_hundredth_error_logs() {
        let tracker = ConsecutiveErrorTracker::new();
        assert!(tracker.record_error());
        for i in 1..99 {
            assert!(!tracker.record_error(), "error {} should be suppressed", i + 1);
        }
        assert!(tracker.record_error(), "100th error should log");
    }

    #[test]
    fn success_after_failures_reports_recovered_count() {
        let tracker = ConsecutiveErrorTracker::new();
        tracker.record_error();
        tracker.record_error();
        tracker.record_error();
        assert_eq!(tracker.record_success(), Some(3));
        assert_eq!(tracker.record_success(), None);
    }

    #[test]
    fn success_with_no_prior_errors_is_not_a_recovery() {
        let tracker = ConsecutiveErrorTracker::new();
        assert_eq!(tracker.record_success(), None);
    }
}
