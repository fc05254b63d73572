//! # scan2md
//!
//! Turn folders of scanned page images into one consolidated Markdown
//! document, chapter by chapter.
//!
//! ## Pipeline Overview
//!
//! ```text
//! chapter folders
//!  │
//!  ├─ 0. Intake    page images → PNG artifacts + `pending` chapter records
//!  ├─ 1. OCR       per chapter: pages → ordered text (OcrEngine)
//!  ├─ 2. Markdown  per chapter: text → fragment (StructureDetector)
//!  └─ 3. Final     all fragments → one document, in chapter order
//! ```
//!
//! Stages never talk to each other: every hand-off goes through an
//! [`ArtifactStore`] under deterministic keys, and a stage only starts for a
//! chapter once the previous stage marked it complete. The [`Orchestrator`]
//! runs the stages one after another through a [`StageRunner`] and fails
//! fast; chapters are processed in parallel inside a stage.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scan2md::{FsStore, JobDescriptor, JobId, Pipeline, PipelineConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let store = Arc::new(FsStore::new("./artifacts"));
//!     let pipeline = Pipeline::from_config(store, PipelineConfig::default())?;
//!
//!     let job = JobDescriptor::from_folder(JobId::new("ops-manual")?, "./scans");
//!     let report = pipeline.run(job).await?.into_result()?;
//!     pipeline.export_final(&report.job_id, "ops-manual.md").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `scan2md` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! scan2md = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod run;
pub mod runner;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    DetectorKind, LlmSettings, LowConfidencePolicy, OcrEngineKind, PipelineConfig,
    PipelineConfigBuilder, Separator, StageSettings,
};
pub use error::{ErrorKind, PipelineError, StageError};
pub use model::{
    Chapter, ChapterId, ChapterStatus, FinalDocument, FinalManifest, FragmentMeta, JobId,
    MarkdownFragment, OcrResult, PageImage, PageText, RunId, StageName,
};
pub use orchestrator::{
    CancelToken, Orchestrator, PipelineState, RunFailure, RunRecord, RunReport, RunScope,
    StageSummary, Transition,
};
pub use pipeline::detect::{HeuristicDetector, LlmDetector, StructureDetector};
pub use pipeline::ocr::{OcrEngine, OcrError, OcrLine, RecognizedPage, VisionOcrEngine};
pub use pipeline::StageContext;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use run::{JobDescriptor, Pipeline, RunHandle};
pub use runner::{
    CommandStageRunner, ExitInfo, LocalStageRunner, StageFailure, StageOutcome, StageRequest,
    StageRunner, StageStatus, WorkerEnv,
};
pub use store::{ArtifactKey, ArtifactStore, FsStore, MemoryStore, StoreError};
