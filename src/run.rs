//! Public entry point: [`Pipeline`] ties a store, a stage runner and a
//! configuration together and starts runs for jobs.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{Chapter, ChapterId, FinalDocument, JobId, RunId};
use crate::orchestrator::{self, CancelToken, Orchestrator, RunRecord, RunReport, RunScope};
use crate::pipeline::detect::StructureDetector;
use crate::pipeline::ocr::OcrEngine;
use crate::pipeline::{self, assemble, intake, StageContext};
use crate::runner::{LocalStageRunner, StageRunner};
use crate::store::ArtifactStore;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub job_id: JobId,
    /// Source to stage before the run: a folder with one sub-folder or
    /// `.docx` file per chapter, a flat folder of page images, or a single
    /// `.docx`. Chapters whose source is unchanged keep their progress.
    /// `None` runs over the chapters already staged in the store.
    pub chapter_folder: Option<PathBuf>,
    /// Restrict the OCR and Markdown stages to these chapters. `None` means
    /// every staged chapter of the job. Final Assembly always covers the
    /// whole job, so every other chapter must already be converted.
    pub chapters: Option<Vec<ChapterId>>,
}

impl JobDescriptor {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            chapter_folder: None,
            chapters: None,
        }
    }

    pub fn from_folder(job_id: JobId, folder: impl Into<PathBuf>) -> Self {
        Self {
            chapter_folder: Some(folder.into()),
            ..Self::new(job_id)
        }
    }

    pub fn with_chapters(mut self, chapters: Vec<ChapterId>) -> Self {
        self.chapters = Some(chapters);
        self
    }
}

/// A run started with [`Pipeline::trigger`].
#[derive(Debug)]
pub struct RunHandle {
    id: RunId,
    cancel: CancelToken,
    task: JoinHandle<Result<RunReport, PipelineError>>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Ask the run to stop. The stage in flight is abandoned and the run
    /// ends in `Failed` with kind `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<RunReport, PipelineError> {
        self.task
            .await
            .map_err(|e| PipelineError::Internal(format!("run task {} failed: {e}", self.id)))?
    }
}

/// The document-digitisation pipeline.
///
/// # Example
///
/// ```rust,no_run
/// use scan2md::{FsStore, JobDescriptor, JobId, Pipeline, PipelineConfig};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = Arc::new(FsStore::new("./artifacts"));
///     let pipeline = Pipeline::from_config(store, PipelineConfig::default())?;
///     let job = JobDescriptor::from_folder(JobId::new("manual")?, "./scans");
///     let report = pipeline.run(job).await?.into_result()?;
///     let doc = pipeline.final_document(&report.job_id).await?;
///     println!("{}", doc.body);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn ArtifactStore>,
    runner: Arc<dyn StageRunner>,
    config: PipelineConfig,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("runner", &self.runner.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        runner: Arc<dyn StageRunner>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            runner,
            config,
        }
    }

    /// In-process pipeline over explicit capabilities.
    pub fn local(
        store: Arc<dyn ArtifactStore>,
        ocr: Arc<dyn OcrEngine>,
        detector: Arc<dyn StructureDetector>,
        config: PipelineConfig,
    ) -> Self {
        let ctx = StageContext::new(Arc::clone(&store), ocr, detector, config.stage.clone());
        let runner = LocalStageRunner::from_config(Arc::new(ctx), &config);
        Self::new(store, Arc::new(runner), config)
    }

    /// In-process pipeline whose capabilities are built from
    /// `config.stage` on the resolved LLM provider.
    pub fn from_config(store: Arc<dyn ArtifactStore>, config: PipelineConfig) -> Result<Self, PipelineError> {
        let ctx = StageContext::from_settings(
            Arc::clone(&store),
            config.stage.clone(),
            config.provider.as_ref(),
        )?;
        let runner = LocalStageRunner::from_config(Arc::new(ctx), &config);
        Ok(Self::new(store, Arc::new(runner), config))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Run a job to a terminal state.
    ///
    /// Returns `Err` only when the run could not start (intake failed, no
    /// chapters, unknown chapter, store unavailable). A run that ends in
    /// `Failed` is still `Ok`; use [`RunReport::into_result`] to turn it into
    /// an error.
    pub async fn run(&self, job: JobDescriptor) -> Result<RunReport, PipelineError> {
        self.run_with(RunId::generate(), job, &CancelToken::new()).await
    }

    /// Start a run in the background.
    pub fn trigger(&self, job: JobDescriptor) -> RunHandle {
        let id = RunId::generate();
        let cancel = CancelToken::new();
        let this = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { this.run_with(id, job, &token).await });
        RunHandle { id, cancel, task }
    }

    /// Blocking wrapper around [`Pipeline::run`].
    ///
    /// Creates a temporary tokio runtime internally.
    pub fn run_blocking(&self, job: JobDescriptor) -> Result<RunReport, PipelineError> {
        tokio::runtime::Runtime::new()
            .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
            .block_on(self.run(job))
    }

    async fn run_with(
        &self,
        run_id: RunId,
        job: JobDescriptor,
        cancel: &CancelToken,
    ) -> Result<RunReport, PipelineError> {
        if let Some(folder) = &job.chapter_folder {
            intake::stage_folder(self.store.as_ref(), &job.job_id, folder).await?;
        }
        let scope = self.resolve_scope(&job).await?;

        let orchestrator = Orchestrator::new(
            Arc::clone(&self.runner),
            Arc::clone(&self.store),
            self.config.stage_timeout(),
        )
        .with_environment(self.config.environment.clone())
        .with_progress(self.config.progress_callback.clone());

        let report = orchestrator.run(run_id, &job.job_id, scope, cancel).await;
        info!(
            "Job {}: run {} finished in state {}",
            job.job_id, run_id, report.state
        );
        Ok(report)
    }

    async fn resolve_scope(&self, job: &JobDescriptor) -> Result<RunScope, PipelineError> {
        let staged: BTreeSet<ChapterId> = pipeline::list_chapters(self.store.as_ref(), &job.job_id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        if staged.is_empty() {
            return Err(PipelineError::NoChapters {
                job: job.job_id.clone(),
            });
        }

        let Some(requested) = &job.chapters else {
            return Ok(RunScope::all(staged.into_iter().collect()));
        };
        let requested: BTreeSet<ChapterId> = requested.iter().cloned().collect();
        if let Some(missing) = requested.iter().find(|c| !staged.contains(*c)) {
            return Err(PipelineError::UnknownChapter {
                job: job.job_id.clone(),
                chapter: missing.clone(),
            });
        }
        if requested.is_empty() {
            return Err(PipelineError::NoChapters {
                job: job.job_id.clone(),
            });
        }
        Ok(RunScope::subset(
            staged.into_iter().collect(),
            requested.into_iter().collect(),
        ))
    }

    /// The published document of `job`. Absent before the first `Done` run;
    /// [`PipelineError::FinalDocumentStale`] if publication was interrupted.
    pub async fn final_document(&self, job: &JobId) -> Result<FinalDocument, PipelineError> {
        assemble::load_final(self.store.as_ref(), job).await
    }

    /// Chapter records of `job`, in chapter order.
    pub async fn chapters(&self, job: &JobId) -> Result<Vec<Chapter>, PipelineError> {
        Ok(pipeline::list_chapters(self.store.as_ref(), job).await?)
    }

    /// Run records of `job`, oldest first.
    pub async fn runs(&self, job: &JobId) -> Result<Vec<RunRecord>, PipelineError> {
        Ok(orchestrator::list_runs(self.store.as_ref(), job).await?)
    }

    /// Write the published document of `job` to `path`.
    ///
    /// Uses atomic write (temp file + rename) to prevent partial files.
    pub async fn export_final(&self, job: &JobId, path: impl AsRef<Path>) -> Result<FinalDocument, PipelineError> {
        let doc = self.final_document(job).await?;
        let path = path.as_ref();
        let write_err = |source| PipelineError::OutputWriteFailed {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let tmp_path = path.with_extension("md.tmp");
        tokio::fs::write(&tmp_path, doc.body.as_bytes())
            .await
            .map_err(write_err)?;
        tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
        Ok(doc)
    }
}
