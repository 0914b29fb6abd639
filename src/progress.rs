//! Progress-callback trait for per-stage submission events.
//!
//! Inject an [`Arc<dyn SubmissionProgress>`] via
//! [`crate::config::EngraveConfigBuilder::progress_callback`] to receive
//! events as a submission moves through pre-processing, the remote steps,
//! finishing and publishing.
//!
//! # Example
//!
//! ```rust
//! use engrave_desk::{EngraveConfig, SubmissionProgress};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     stages: AtomicUsize,
//! }
//!
//! impl SubmissionProgress for CountingCallback {
//!     fn on_stage_complete(&self, stage: &str) {
//!         let done = self.stages.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{stage} done ({done} so far)");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { stages: AtomicUsize::new(0) });
//!
//! let config = EngraveConfig::builder()
//!     .progress_callback(counter as Arc<dyn SubmissionProgress>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the submission handler as it advances.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Stage names are `"preprocess"`, the remote step
/// names (`"upscale"`, `"restore"`, `"matte"`), `"finish"` and `"publish"`.
pub trait SubmissionProgress: Send + Sync {
    /// Called once after validation, before any image work.
    ///
    /// # Arguments
    /// * `remote_steps` — number of hosted model calls that will be made
    fn on_submission_start(&self, remote_steps: usize) {
        let _ = remote_steps;
    }

    /// Called when a stage begins.
    fn on_stage_start(&self, stage: &str) {
        let _ = stage;
    }

    /// Called when a stage finishes successfully.
    fn on_stage_complete(&self, stage: &str) {
        let _ = stage;
    }

    /// Called once per sink after it has been attempted.
    ///
    /// # Arguments
    /// * `sink`  — sink name (`"telegram"`, `"sheets"`)
    /// * `error` — `None` on success, otherwise the failure description
    fn on_sink_result(&self, sink: &str, error: Option<&str>) {
        let _ = (sink, error);
    }

    /// Called once when the submission ends, successfully or not.
    fn on_submission_complete(&self, success: bool) {
        let _ = success;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgress;

impl SubmissionProgress for NoopProgress {}

/// Convenience alias matching the type stored in [`crate::config::EngraveConfig`].
pub type ProgressCallback = Arc<dyn SubmissionProgress>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        sink_failures: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    impl SubmissionProgress for TrackingCallback {
        fn on_stage_start(&self, stage: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(stage.to_string());
        }

        fn on_stage_complete(&self, _stage: &str) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_sink_result(&self, _sink: &str, error: Option<&str>) {
            if error.is_some() {
                self.sink_failures.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgress;
        cb.on_submission_start(2);
        cb.on_stage_start("upscale");
        cb.on_stage_complete("upscale");
        cb.on_sink_result("telegram", Some("HTTP 400"));
        cb.on_submission_complete(true);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        for stage in ["preprocess", "matte", "finish"] {
            tracker.on_stage_start(stage);
            tracker.on_stage_complete(stage);
        }
        tracker.on_sink_result("telegram", None);
        tracker.on_sink_result("sheets", Some("auth failed"));

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.sink_failures.load(Ordering::SeqCst), 1);
        assert_eq!(
            *tracker.order.lock().unwrap(),
            vec!["preprocess", "matte", "finish"]
        );
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgress);
        cb.on_submission_start(3);
        cb.on_stage_start("matte");
    }
}
