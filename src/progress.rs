//! Progress-callback trait for run, stage and chapter events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`]. The CLI uses
//! it to drive its progress bars; a service could forward the same events to
//! a channel or a database.
//!
//! # Example
//!
//! ```rust
//! use scan2md::{ChapterId, PipelineConfig, PipelineProgressCallback, StageName};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_chapter_complete(&self, stage: StageName, chapter: &ChapterId) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{stage}: chapter {chapter} done ({n} so far)");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::model::{ChapterId, JobId, RunId, StageName};
use std::sync::Arc;

/// Called by the orchestrator and the local runner as a run progresses.
///
/// All methods have default no-op implementations. Chapter events may arrive
/// concurrently from different tasks, so implementations must synchronise
/// their own state.
///
/// Chapter events are only emitted by in-process runners; a stage running
/// in an isolated worker reports start and completion only.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once when a run starts.
    fn on_run_start(&self, run: RunId, job: &JobId, chapters: usize) {
        let _ = (run, job, chapters);
    }

    /// Called before a stage is invoked.
    fn on_stage_start(&self, stage: StageName, chapters: usize) {
        let _ = (stage, chapters);
    }

    /// Called when a chapter finished a stage successfully.
    fn on_chapter_complete(&self, stage: StageName, chapter: &ChapterId) {
        let _ = (stage, chapter);
    }

    /// Called before a chapter is retried after a transient failure.
    ///
    /// # Arguments
    /// * `attempt`: the attempt about to start (2 for the first retry)
    fn on_chapter_retry(&self, stage: StageName, chapter: &ChapterId, attempt: u32, error: &str) {
        let _ = (stage, chapter, attempt, error);
    }

    /// Called when a chapter failed a stage after all attempts.
    fn on_chapter_error(&self, stage: StageName, chapter: &ChapterId, error: &str) {
        let _ = (stage, chapter, error);
    }

    /// Called once a stage invocation returned.
    fn on_stage_complete(&self, stage: StageName, success: bool) {
        let _ = (stage, success);
    }

    /// Called once when the run reached a terminal state.
    fn on_run_complete(&self, run: RunId, success: bool) {
        let _ = (run, success);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl PipelineProgressCallback for Recorder {
        fn on_stage_start(&self, stage: StageName, chapters: usize) {
            self.events.lock().unwrap().push(format!("start {stage} {chapters}"));
        }

        fn on_chapter_error(&self, stage: StageName, chapter: &ChapterId, _error: &str) {
            self.events.lock().unwrap().push(format!("error {stage} {chapter}"));
        }

        fn on_stage_complete(&self, stage: StageName, success: bool) {
            self.events.lock().unwrap().push(format!("end {stage} {success}"));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        let ch = ChapterId::new("01").unwrap();
        cb.on_run_start(RunId::generate(), &JobId::new("j").unwrap(), 2);
        cb.on_stage_start(StageName::Ocr, 2);
        cb.on_chapter_complete(StageName::Ocr, &ch);
        cb.on_chapter_retry(StageName::Ocr, &ch, 2, "timeout");
        cb.on_chapter_error(StageName::Ocr, &ch, "unreadable");
        cb.on_stage_complete(StageName::Ocr, false);
        cb.on_run_complete(RunId::generate(), false);
    }

    #[test]
    fn overridden_methods_receive_events() {
        let rec = Arc::new(Recorder::default());
        let cb: ProgressCallback = rec.clone();
        let ch = ChapterId::new("02").unwrap();
        cb.on_stage_start(StageName::Markdown, 3);
        cb.on_chapter_complete(StageName::Markdown, &ch);
        cb.on_chapter_error(StageName::Markdown, &ch, "malformed");
        cb.on_stage_complete(StageName::Markdown, false);

        let events = rec.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["start markdown 3", "error markdown 02", "end markdown false"]
        );
    }
}
