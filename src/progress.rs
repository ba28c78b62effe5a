//! Progress-callback trait for request and attempt lifecycle events.
//!
//! Attach an [`Arc<dyn ConversionProgressCallback>`] with
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to observe
//! each request as the orchestrator walks its fallback chain.
//!
//! # Why callbacks instead of channels?
//!
//! A callback lets the host decide where events go (a channel, a job table,
//! a terminal bar) without the engine owning a receiver or a buffer. The
//! trait is `Send + Sync` because a batch drives several requests at once.
//!
//! # Example
//!
//! ```rust
//! use multiconvert::{ConversionAttempt, ConversionConfig, ConversionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct FailureCounter(AtomicUsize);
//!
//! impl ConversionProgressCallback for FailureCounter {
//!     fn on_attempt_complete(&self, _request_id: &str, attempt: &ConversionAttempt) {
//!         if !attempt.is_success() {
//!             self.0.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(Arc::new(FailureCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::ConversionAttempt;
use std::path::Path;
use std::sync::Arc;

/// Called by the orchestrator as it processes a request.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// Within one request, events arrive in order. Across a batch, events of
/// different requests interleave and may come from different threads.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once the request passed the security gate and was routed.
    ///
    /// # Arguments
    /// * `request_id`: identifier of the request
    /// * `source`    : input path
    /// * `candidates`: number of methods in the fallback chain
    fn on_request_start(&self, request_id: &str, source: &Path, candidates: usize) {
        let _ = (request_id, source, candidates);
    }

    /// Called just before a method runs.
    ///
    /// # Arguments
    /// * `index`: 1-based position in the fallback chain
    /// * `total`: length of the fallback chain
    fn on_attempt_start(&self, request_id: &str, method: &str, index: usize, total: usize) {
        let _ = (request_id, method, index, total);
    }

    /// Called when an attempt has been recorded, whatever its outcome.
    fn on_attempt_complete(&self, request_id: &str, attempt: &ConversionAttempt) {
        let _ = (request_id, attempt);
    }

    /// Called exactly once per request, including requests rejected before
    /// any attempt ran (`attempts == 0`).
    fn on_request_complete(&self, request_id: &str, success: bool, attempts: usize) {
        let _ = (request_id, success, attempts);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::AttemptOutcome;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        requests: AtomicUsize,
        starts: AtomicUsize,
        failures: AtomicUsize,
        completed: AtomicUsize,
    }

    impl ConversionProgressCallback for TrackingCallback {
        fn on_request_start(&self, _id: &str, _source: &Path, _candidates: usize) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }

        fn on_attempt_start(&self, _id: &str, _method: &str, _index: usize, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_attempt_complete(&self, _id: &str, attempt: &ConversionAttempt) {
            if !attempt.is_success() {
                self.failures.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_request_complete(&self, _id: &str, success: bool, _attempts: usize) {
            if success {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn attempt(outcome: AttemptOutcome) -> ConversionAttempt {
        let now = Utc::now();
        ConversionAttempt {
            method: "m".into(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            outcome,
            failure: None,
            diagnostics: None,
            issues: Vec::new(),
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_request_start("r", Path::new("a.pdf"), 2);
        cb.on_attempt_start("r", "libreoffice", 1, 2);
        cb.on_attempt_complete("r", &attempt(AttemptOutcome::Timeout));
        cb.on_request_complete("r", false, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_request_start("r", Path::new("a.pdf"), 2);
        tracker.on_attempt_start("r", "a", 1, 2);
        tracker.on_attempt_complete("r", &attempt(AttemptOutcome::Failure));
        tracker.on_attempt_start("r", "b", 2, 2);
        tracker.on_attempt_complete("r", &attempt(AttemptOutcome::Success));
        tracker.on_request_complete("r", true, 2);

        assert_eq!(tracker.requests.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.failures.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_request_complete("r", true, 1);
    }
}
