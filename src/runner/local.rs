//! In-process stage runner.

use super::{StageFailure, StageOutcome, StageRequest, StageRunner};
use crate::config::{retry_delay, PipelineConfig};
use crate::error::StageError;
use crate::model::{ChapterId, JobId, StageName};
use crate::pipeline::{self, assemble, StageContext};
use crate::progress::ProgressCallback;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Runs stages on the caller's tokio runtime.
///
/// Per-chapter stages fan out across chapters (`chapter_concurrency` at a
/// time). Each chapter is retried on transient errors up to `retry_budget`
/// extra times with exponential backoff; a chapter that still fails is
/// marked `failed` in its record. When several chapters fail, the outcome
/// names the first one in chapter order.
#[derive(Clone)]
pub struct LocalStageRunner {
    ctx: Arc<StageContext>,
    retry_budget: u32,
    retry_backoff_ms: u64,
    chapter_concurrency: usize,
    progress: Option<ProgressCallback>,
}

impl LocalStageRunner {
    /// Runner with no retries and sequential chapters.
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self {
            ctx,
            retry_budget: 0,
            retry_backoff_ms: 0,
            chapter_concurrency: 1,
            progress: None,
        }
    }

    /// Runner honouring the retry, concurrency and progress settings of
    /// `config`.
    pub fn from_config(ctx: Arc<StageContext>, config: &PipelineConfig) -> Self {
        Self {
            ctx,
            retry_budget: config.retry_budget,
            retry_backoff_ms: config.retry_backoff_ms,
            chapter_concurrency: config.chapter_concurrency.max(1),
            progress: config.progress_callback.clone(),
        }
    }

    pub fn with_retry(mut self, budget: u32, backoff_ms: u64) -> Self {
        self.retry_budget = budget;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_chapter_concurrency(mut self, n: usize) -> Self {
        self.chapter_concurrency = n.max(1);
        self
    }

    pub fn context(&self) -> &Arc<StageContext> {
        &self.ctx
    }

    /// Run `op` until it succeeds, fails deterministically, or the retry
    /// budget is spent. Returns the result and the attempts used.
    async fn with_retry_loop<F, Fut>(
        &self,
        stage: StageName,
        chapter: Option<&ChapterId>,
        mut op: F,
    ) -> (Result<(), StageError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), StageError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return (Ok(()), attempt),
                Err(e) if e.is_transient() && attempt <= self.retry_budget => {
                    let delay = retry_delay(self.retry_backoff_ms, attempt);
                    attempt += 1;
                    warn!(
                        "{} stage: attempt {}/{} after {}ms: {}",
                        stage,
                        attempt,
                        self.retry_budget + 1,
                        delay.as_millis(),
                        e
                    );
                    if let (Some(cb), Some(ch)) = (&self.progress, chapter) {
                        cb.on_chapter_retry(stage, ch, attempt, &e.to_string());
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }

    async fn run_chapter(
        &self,
        stage: StageName,
        job: &JobId,
        chapter: &ChapterId,
    ) -> (Result<(), StageError>, u32) {
        let (result, attempts) = self
            .with_retry_loop(stage, Some(chapter), || {
                pipeline::run_chapter_stage(&self.ctx, stage, job, chapter)
            })
            .await;

        match &result {
            Ok(()) => {
                debug!("{} stage: chapter {} done", stage, chapter);
                if let Some(cb) = &self.progress {
                    cb.on_chapter_complete(stage, chapter);
                }
            }
            Err(e) => {
                warn!("{} stage: chapter {} failed: {}", stage, chapter, e);
                pipeline::mark_failed(self.ctx.store.as_ref(), job, chapter, stage).await;
                if let Some(cb) = &self.progress {
                    cb.on_chapter_error(stage, chapter, &e.to_string());
                }
            }
        }
        (result, attempts)
    }

    async fn run_per_chapter(&self, request: &StageRequest) -> (Option<StageError>, u32) {
        let mut chapters = request.chapters.clone();
        chapters.sort();
        chapters.dedup();

        let runs: Vec<_> = chapters
            .into_iter()
            .map(|chapter| {
                let runner = self.clone();
                let stage = request.stage;
                let job = request.job_id.clone();
                async move {
                    let (result, attempts) = runner.run_chapter(stage, &job, &chapter).await;
                    (chapter, result, attempts)
                }
            })
            .collect();
        let mut results: Vec<(ChapterId, Result<(), StageError>, u32)> = stream::iter(runs)
            .buffer_unordered(self.chapter_concurrency)
            .collect()
            .await;

        results.sort_by(|a, b| a.0.cmp(&b.0));
        let attempts = results.iter().map(|r| r.2).max().unwrap_or(1);
        let first_failure = results.into_iter().find_map(|(_, r, _)| r.err());
        (first_failure, attempts)
    }
}

#[async_trait]
impl StageRunner for LocalStageRunner {
    fn name(&self) -> &str {
        "local"
    }

    async fn invoke(&self, request: StageRequest) -> StageOutcome {
        let start = Instant::now();
        info!(
            "{} stage: job {} ({} chapters, in-process)",
            request.stage,
            request.job_id,
            request.chapters.len()
        );

        let (failure, attempts) = if request.stage.is_per_chapter() {
            self.run_per_chapter(&request).await
        } else {
            let (result, attempts) = self
                .with_retry_loop(request.stage, None, || async {
                    assemble::assemble(&self.ctx, &request.job_id, &request.chapters, request.run_id)
                        .await
                        .map(|_| ())
                })
                .await;
            (result.err(), attempts)
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match failure {
            None => StageOutcome::success(attempts, duration_ms),
            Some(e) => StageOutcome::failure(e.exit_code(), StageFailure::from(&e), attempts, duration_ms),
        }
    }
}
