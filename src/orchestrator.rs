//! Pipeline orchestrator: a linear state machine over the three stages.
//!
//! ```text
//! ExtractingOcr ──▶ ConvertingMarkdown ──▶ AssemblingFinal ──▶ Done
//!       │                   │                     │
//!       └───────────────────┴─────────────────────┴──────────▶ Failed
//! ```
//!
//! Each transition waits for the stage runner to return. A failed stage, a
//! stage that exceeds its wall-clock budget, or a cancellation moves the run
//! straight to `Failed`; downstream stages are never attempted. Retries
//! belong to the runner, never to the orchestrator.

use crate::error::{ErrorKind, PipelineError};
use crate::model::{ChapterId, JobId, RunId, StageName};
use crate::progress::ProgressCallback;
use crate::runner::{StageRequest, StageRunner};
use crate::store::{get_json, put_json, ArtifactKey, ArtifactStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// States of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    ExtractingOcr,
    ConvertingMarkdown,
    AssemblingFinal,
    Done,
    Failed,
}

impl PipelineState {
    pub const INITIAL: PipelineState = PipelineState::ExtractingOcr;

    /// The stage executed in this state; `None` for terminal states.
    pub fn stage(self) -> Option<StageName> {
        match self {
            PipelineState::ExtractingOcr => Some(StageName::Ocr),
            PipelineState::ConvertingMarkdown => Some(StageName::Markdown),
            PipelineState::AssemblingFinal => Some(StageName::Final),
            PipelineState::Done | PipelineState::Failed => None,
        }
    }

    /// Successor after the current stage succeeded. Terminal states map to
    /// themselves.
    pub fn advance(self) -> PipelineState {
        match self {
            PipelineState::ExtractingOcr => PipelineState::ConvertingMarkdown,
            PipelineState::ConvertingMarkdown => PipelineState::AssemblingFinal,
            PipelineState::AssemblingFinal => PipelineState::Done,
            terminal => terminal,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::ExtractingOcr => "ExtractingOcr",
            PipelineState::ConvertingMarkdown => "ConvertingMarkdown",
            PipelineState::AssemblingFinal => "AssemblingFinal",
            PipelineState::Done => "Done",
            PipelineState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub at: DateTime<Utc>,
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: StageName,
    pub chapter: Option<ChapterId>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Per-stage accounting kept on the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: StageName,
    pub success: bool,
    pub exit_code: i32,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Chapters one run works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunScope {
    /// Chapters the OCR and Markdown stages process.
    pub chapters: Vec<ChapterId>,
    /// Every staged chapter of the job. Final Assembly always covers all of
    /// them.
    pub job_chapters: Vec<ChapterId>,
}

impl RunScope {
    /// Process and assemble the same chapters.
    pub fn all(chapters: Vec<ChapterId>) -> Self {
        Self {
            job_chapters: chapters.clone(),
            chapters,
        }
    }

    /// Process `chapters` only; assemble all of `job_chapters`.
    pub fn subset(job_chapters: Vec<ChapterId>, chapters: Vec<ChapterId>) -> Self {
        Self {
            chapters,
            job_chapters,
        }
    }

    /// Chapters handed to `stage`.
    pub fn for_stage(&self, stage: StageName) -> &[ChapterId] {
        if stage.is_per_chapter() {
            &self.chapters
        } else {
            &self.job_chapters
        }
    }
}

/// Outcome of one run; persisted as the run record under
/// `jobs/<job>/runs/<run_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub job_id: JobId,
    /// Chapters processed by the OCR and Markdown stages.
    pub chapters: Vec<ChapterId>,
    /// Chapters the final document was assembled from.
    #[serde(default)]
    pub job_chapters: Vec<ChapterId>,
    pub state: PipelineState,
    pub transitions: Vec<Transition>,
    pub stages: Vec<StageSummary>,
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Stored form of a [`RunReport`].
pub type RunRecord = RunReport;

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Done
    }

    /// `Ok(self)` for a `Done` run, [`PipelineError::RunFailed`] otherwise.
    pub fn into_result(self) -> Result<Self, PipelineError> {
        match (&self.state, &self.failure) {
            (PipelineState::Done, _) => Ok(self),
            (_, Some(f)) => Err(PipelineError::RunFailed {
                stage: f.stage,
                chapter: f.chapter.clone(),
                kind: f.kind,
                message: f.message.clone(),
            }),
            (state, None) => Err(PipelineError::Internal(format!(
                "run {} ended in state {state} without a failure",
                self.run_id
            ))),
        }
    }
}

/// Run records of `job`, oldest first.
pub async fn list_runs(store: &dyn ArtifactStore, job: &JobId) -> Result<Vec<RunRecord>, StoreError> {
    let mut runs = Vec::new();
    for key in store.list(&ArtifactKey::runs_prefix(job)).await? {
        runs.push(get_json::<RunRecord>(store, &key).await?);
    }
    runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    Ok(runs)
}

/// Cancels a run. Cloneable; all clones share one flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|c| *c).await;
    }
}

/// Sequences the stages of one run.
#[derive(Clone)]
pub struct Orchestrator {
    runner: Arc<dyn StageRunner>,
    store: Arc<dyn ArtifactStore>,
    stage_timeout: Duration,
    environment: BTreeMap<String, String>,
    progress: Option<ProgressCallback>,
}

enum StageEnd {
    Finished(crate::runner::StageOutcome),
    TimedOut,
    Cancelled,
}

impl Orchestrator {
    pub fn new(
        runner: Arc<dyn StageRunner>,
        store: Arc<dyn ArtifactStore>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            store,
            stage_timeout,
            environment: BTreeMap::new(),
            progress: None,
        }
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Drive one run to a terminal state and persist its run record.
    pub async fn run(
        &self,
        run_id: RunId,
        job: &JobId,
        scope: RunScope,
        cancel: &CancelToken,
    ) -> RunReport {
        let started_at = Utc::now();
        let mut report = RunReport {
            run_id,
            job_id: job.clone(),
            chapters: scope.chapters.clone(),
            job_chapters: scope.job_chapters.clone(),
            state: PipelineState::INITIAL,
            transitions: Vec::new(),
            stages: Vec::new(),
            failure: None,
            started_at,
            finished_at: started_at,
        };
        info!(
            "Run {}: job {} with {} chapters",
            run_id,
            job,
            report.chapters.len()
        );
        if let Some(cb) = &self.progress {
            cb.on_run_start(run_id, job, report.chapters.len());
        }

        while let Some(stage) = report.state.stage() {
            let end = if cancel.is_cancelled() {
                StageEnd::Cancelled
            } else {
                self.execute(run_id, stage, job, scope.for_stage(stage), cancel)
                    .await
            };

            let next = match end {
                StageEnd::Finished(outcome) => {
                    report.stages.push(StageSummary {
                        stage,
                        success: outcome.is_success(),
                        exit_code: outcome.exit.code,
                        attempts: outcome.exit.attempts,
                        duration_ms: outcome.exit.duration_ms,
                    });
                    if outcome.is_success() {
                        report.state.advance()
                    } else {
                        let failure = outcome.exit.failure.unwrap_or_else(|| {
                            crate::runner::StageFailure::runner(format!(
                                "stage exited with code {}",
                                outcome.exit.code
                            ))
                        });
                        report.failure = Some(RunFailure {
                            stage,
                            chapter: failure.chapter,
                            kind: failure.kind,
                            message: failure.message,
                        });
                        PipelineState::Failed
                    }
                }
                StageEnd::TimedOut => {
                    report.failure = Some(RunFailure {
                        stage,
                        chapter: None,
                        kind: ErrorKind::StageTimeout,
                        message: format!(
                            "{stage} stage exceeded its {}s budget",
                            self.stage_timeout.as_secs()
                        ),
                    });
                    PipelineState::Failed
                }
                StageEnd::Cancelled => {
                    report.failure = Some(RunFailure {
                        stage,
                        chapter: None,
                        kind: ErrorKind::Cancelled,
                        message: format!("run cancelled during the {stage} stage"),
                    });
                    PipelineState::Failed
                }
            };

            report.transitions.push(Transition {
                from: report.state,
                to: next,
                at: Utc::now(),
            });
            info!("Run {}: {} → {}", run_id, report.state, next);
            report.state = next;
        }

        report.finished_at = Utc::now();
        if let Some(f) = &report.failure {
            error!(
                "Run {} failed in the {} stage{}: {}: {}",
                run_id,
                f.stage,
                f.chapter
                    .as_ref()
                    .map(|c| format!(" (chapter {c})"))
                    .unwrap_or_default(),
                f.kind,
                f.message
            );
        }

        let key = ArtifactKey::run_record(job, &run_id);
        if let Err(e) = put_json(self.store.as_ref(), &key, &report).await {
            warn!("Run {}: could not write run record: {}", run_id, e);
        }
        if let Some(cb) = &self.progress {
            cb.on_run_complete(run_id, report.is_success());
        }
        report
    }

    async fn execute(
        &self,
        run_id: RunId,
        stage: StageName,
        job: &JobId,
        chapters: &[ChapterId],
        cancel: &CancelToken,
    ) -> StageEnd {
        if let Some(cb) = &self.progress {
            cb.on_stage_start(stage, chapters.len());
        }
        let request = StageRequest {
            stage,
            job_id: job.clone(),
            chapters: chapters.to_vec(),
            run_id: Some(run_id),
            environment: self.environment.clone(),
        };

        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => StageEnd::Cancelled,
            result = tokio::time::timeout(self.stage_timeout, self.runner.invoke(request)) => {
                match result {
                    Ok(outcome) => StageEnd::Finished(outcome),
                    Err(_) => StageEnd::TimedOut,
                }
            }
        };

        if let Some(cb) = &self.progress {
            let ok = matches!(&end, StageEnd::Finished(o) if o.is_success());
            cb.on_stage_complete(stage, ok);
        }
        end
    }
}
