//! Error types for the scan2md library.
//!
//! Three layers, mirroring where a failure is decided:
//!
//! * [`StageError`]: a single chapter failed inside one stage (unreadable
//!   page, malformed OCR output, missing fragment). Serialisable, because it
//!   crosses process boundaries when a stage runs as an isolated worker.
//!
//! * [`ErrorKind`]: the user-visible taxonomy every failure collapses to.
//!   Run reports and worker exit codes carry only the kind plus a message.
//!
//! * [`PipelineError`]: fatal for the caller: invalid configuration, a
//!   source folder that cannot be staged, store I/O outside a stage, or a run
//!   that ended in `Failed` when the caller asked for a `Result`.

use crate::model::{ChapterId, JobId, StageName};
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure taxonomy exposed on run reports and run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A page image was unreadable or OCR confidence was too low.
    Extraction,
    /// OCR output for a chapter was missing or malformed.
    Conversion,
    /// A chapter fragment was missing or unusable at assembly time.
    IncompleteInput,
    /// A stage invocation exceeded its wall-clock budget.
    StageTimeout,
    /// The runner could not launch or complete a stage (infrastructure).
    StageRunner,
    /// The run was cancelled by the caller.
    Cancelled,
}

impl ErrorKind {
    /// Process exit code used by isolated stage workers.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Extraction => 10,
            ErrorKind::Conversion => 11,
            ErrorKind::IncompleteInput => 12,
            ErrorKind::StageRunner => 14,
            ErrorKind::StageTimeout => 15,
            ErrorKind::Cancelled => 16,
        }
    }

    /// Inverse of [`ErrorKind::exit_code`]. Exit code 13 (store) maps to
    /// `StageRunner`; unknown non-zero codes do too.
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            10 => Some(ErrorKind::Extraction),
            11 => Some(ErrorKind::Conversion),
            12 => Some(ErrorKind::IncompleteInput),
            15 => Some(ErrorKind::StageTimeout),
            16 => Some(ErrorKind::Cancelled),
            _ => Some(ErrorKind::StageRunner),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Extraction => "ExtractionError",
            ErrorKind::Conversion => "ConversionError",
            ErrorKind::IncompleteInput => "IncompleteInputError",
            ErrorKind::StageTimeout => "StageTimeoutError",
            ErrorKind::StageRunner => "StageRunnerError",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit code a worker uses when the artifact store itself failed.
pub const STORE_EXIT_CODE: i32 = 13;

/// A chapter-level failure raised inside a stage.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum StageError {
    // ── Extraction ───────────────────────────────────────────────────────
    #[error("chapter '{chapter}' has not been staged (no chapter record)")]
    ChapterNotStaged { chapter: ChapterId },

    #[error("chapter '{chapter}' has no page images")]
    NoPages { chapter: ChapterId },

    #[error("chapter '{chapter}' page {page}: image unreadable: {detail}")]
    UnreadablePage {
        chapter: ChapterId,
        page: usize,
        detail: String,
    },

    #[error(
        "chapter '{chapter}' page {page}: OCR confidence {confidence:.2} is below the threshold {threshold:.2}"
    )]
    LowConfidence {
        chapter: ChapterId,
        page: usize,
        confidence: f32,
        threshold: f32,
    },

    #[error("chapter '{chapter}' page {page}: OCR engine failed: {detail}")]
    OcrFailed {
        chapter: ChapterId,
        page: usize,
        detail: String,
        transient: bool,
    },

    // ── Conversion ───────────────────────────────────────────────────────
    #[error("chapter '{chapter}': OCR result is missing")]
    MissingOcrResult { chapter: ChapterId },

    #[error("chapter '{chapter}': OCR result is malformed: {detail}")]
    MalformedOcrResult { chapter: ChapterId, detail: String },

    #[error("chapter '{chapter}' page {page}: structure detection failed: {detail}")]
    StructureFailed {
        chapter: ChapterId,
        page: usize,
        detail: String,
        transient: bool,
    },

    // ── Assembly ─────────────────────────────────────────────────────────
    #[error("chapter '{chapter}': Markdown fragment is missing")]
    MissingFragment { chapter: ChapterId },

    #[error("chapter '{chapter}': Markdown fragment is unusable: {detail}")]
    InconsistentFragment { chapter: ChapterId, detail: String },

    #[error("job has no chapters to assemble")]
    EmptyChapterSet,

    // ── Gating ───────────────────────────────────────────────────────────
    #[error("chapter '{chapter}' is not ready for the {stage} stage: {detail}")]
    NotReady {
        chapter: ChapterId,
        stage: StageName,
        detail: String,
    },

    #[error("chapter '{chapter}': chapter record is corrupt: {detail}")]
    CorruptRecord {
        chapter: ChapterId,
        stage: StageName,
        detail: String,
    },

    // ── Infrastructure ───────────────────────────────────────────────────
    #[error("artifact store failed{}: {detail}", chapter_suffix(.chapter))]
    Store {
        chapter: Option<ChapterId>,
        detail: String,
    },

    #[error("internal error: {detail}")]
    Internal { detail: String },
}

fn chapter_suffix(chapter: &Option<ChapterId>) -> String {
    chapter
        .as_ref()
        .map(|c| format!(" for chapter '{c}'"))
        .unwrap_or_default()
}

impl StageError {
    /// The taxonomy bucket this failure belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::ChapterNotStaged { .. }
            | StageError::NoPages { .. }
            | StageError::UnreadablePage { .. }
            | StageError::LowConfidence { .. }
            | StageError::OcrFailed { .. } => ErrorKind::Extraction,
            StageError::MissingOcrResult { .. }
            | StageError::MalformedOcrResult { .. }
            | StageError::StructureFailed { .. } => ErrorKind::Conversion,
            StageError::MissingFragment { .. }
            | StageError::InconsistentFragment { .. }
            | StageError::EmptyChapterSet => ErrorKind::IncompleteInput,
            StageError::NotReady { stage, .. } | StageError::CorruptRecord { stage, .. } => match stage {
                StageName::Ocr => ErrorKind::Extraction,
                StageName::Markdown => ErrorKind::Conversion,
                StageName::Final => ErrorKind::IncompleteInput,
            },
            StageError::Store { .. } | StageError::Internal { .. } => ErrorKind::StageRunner,
        }
    }

    /// The chapter the failure is attributed to, if any.
    pub fn chapter(&self) -> Option<&ChapterId> {
        match self {
            StageError::ChapterNotStaged { chapter }
            | StageError::NoPages { chapter }
            | StageError::UnreadablePage { chapter, .. }
            | StageError::LowConfidence { chapter, .. }
            | StageError::OcrFailed { chapter, .. }
            | StageError::MissingOcrResult { chapter }
            | StageError::MalformedOcrResult { chapter, .. }
            | StageError::StructureFailed { chapter, .. }
            | StageError::MissingFragment { chapter }
            | StageError::InconsistentFragment { chapter, .. }
            | StageError::NotReady { chapter, .. }
            | StageError::CorruptRecord { chapter, .. } => Some(chapter),
            StageError::Store { chapter, .. } => chapter.as_ref(),
            StageError::EmptyChapterSet | StageError::Internal { .. } => None,
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Only infrastructure hiccups and backend errors the capability itself
    /// marked transient qualify. Missing inputs, low confidence and malformed
    /// data fail identically on every attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            StageError::Store { .. } => true,
            StageError::OcrFailed { transient, .. }
            | StageError::StructureFailed { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Process exit code for an isolated worker reporting this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StageError::Store { .. } => STORE_EXIT_CODE,
            other => other.kind().exit_code(),
        }
    }

    pub(crate) fn store(chapter: Option<&ChapterId>, err: StoreError) -> Self {
        StageError::Store {
            chapter: chapter.cloned(),
            detail: err.to_string(),
        }
    }
}

/// All fatal errors returned by the scan2md library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Configuration ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A job or chapter identifier does not satisfy the naming rules.
    #[error("Invalid {what} '{value}': {reason}")]
    InvalidIdentifier {
        what: &'static str,
        value: String,
        reason: String,
    },

    // ── Intake ────────────────────────────────────────────────────────────
    /// The chapter folder (or `.docx` file) does not exist.
    #[error("Chapter source not found: '{path}'")]
    SourceNotFound { path: PathBuf },

    /// The chapter folder could not be read.
    #[error("Failed to read '{path}': {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A source image could not be decoded during intake.
    #[error("Source image '{path}' is not a readable image: {detail}")]
    UnreadableImage { path: PathBuf, detail: String },

    /// A `.docx` chapter is not a readable zip package.
    #[error("Word document '{path}' could not be opened: {detail}")]
    UnreadableDocument { path: PathBuf, detail: String },

    /// Neither the folder nor the store yielded any chapter.
    #[error("Job '{job}' has no chapters to process")]
    NoChapters { job: JobId },

    /// A chapter was requested that the job does not contain.
    #[error("Job '{job}' has no chapter '{chapter}'")]
    UnknownChapter { job: JobId, chapter: ChapterId },

    // ── Runs ──────────────────────────────────────────────────────────────
    /// The run ended in `Failed`.
    #[error("Run failed in the {stage} stage{}: {kind}: {message}", chapter_suffix(.chapter))]
    RunFailed {
        stage: StageName,
        chapter: Option<ChapterId>,
        kind: ErrorKind,
        message: String,
    },

    /// A stage invoked directly (outside a run) failed.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// No final document has been published for the job.
    #[error("No final document for job '{job}'\nRun the pipeline to completion first.")]
    FinalDocumentNotFound { job: JobId },

    /// The final body does not match its manifest, or the run that wrote it
    /// did not finish.
    #[error("Final document for job '{job}' is stale: it does not match its manifest or was not published by a finished run")]
    FinalDocumentStale { job: JobId },

    // ── Backends ──────────────────────────────────────────────────────────
    /// The configured LLM provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Artifact store failure outside a stage.
    #[error(transparent)]
    Store(#[from] StoreError),

    // ── I/O ───────────────────────────────────────────────────────────────
    /// Could not write the exported Markdown file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(id: &str) -> ChapterId {
        ChapterId::new(id).unwrap()
    }

    #[test]
    fn kinds_follow_taxonomy() {
        let low = StageError::LowConfidence {
            chapter: ch("01"),
            page: 2,
            confidence: 0.31,
            threshold: 0.6,
        };
        assert_eq!(low.kind(), ErrorKind::Extraction);
        assert!(!low.is_transient());

        let missing = StageError::MissingFragment { chapter: ch("02") };
        assert_eq!(missing.kind(), ErrorKind::IncompleteInput);

        let gated = StageError::NotReady {
            chapter: ch("03"),
            stage: StageName::Markdown,
            detail: "status is pending".into(),
        };
        assert_eq!(gated.kind(), ErrorKind::Conversion);
    }

    #[test]
    fn low_confidence_display() {
        let e = StageError::LowConfidence {
            chapter: ch("01"),
            page: 4,
            confidence: 0.314,
            threshold: 0.6,
        };
        let msg = e.to_string();
        assert!(msg.contains("'01'"), "got: {msg}");
        assert!(msg.contains("0.31"), "got: {msg}");
        assert!(msg.contains("0.60"), "got: {msg}");
    }

    #[test]
    fn store_errors_are_transient_and_use_store_exit_code() {
        let e = StageError::Store {
            chapter: Some(ch("07")),
            detail: "disk full".into(),
        };
        assert!(e.is_transient());
        assert_eq!(e.exit_code(), STORE_EXIT_CODE);
        assert_eq!(e.kind(), ErrorKind::StageRunner);
        assert!(e.to_string().contains("chapter '07'"));
    }

    #[test]
    fn corrupt_records_fail_in_the_stage_kind_without_retry() {
        let e = StageError::CorruptRecord {
            chapter: ch("04"),
            stage: StageName::Markdown,
            detail: "expected value at line 1".into(),
        };
        assert!(!e.is_transient());
        assert_eq!(e.kind(), ErrorKind::Conversion);
        assert_eq!(e.exit_code(), ErrorKind::Conversion.exit_code());
    }

    #[test]
    fn exit_codes_round_trip_to_kinds() {
        for kind in [
            ErrorKind::Extraction,
            ErrorKind::Conversion,
            ErrorKind::IncompleteInput,
            ErrorKind::StageRunner,
            ErrorKind::StageTimeout,
            ErrorKind::Cancelled,
        ] {
            assert_eq!(ErrorKind::from_exit_code(kind.exit_code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_exit_code(0), None);
        assert_eq!(
            ErrorKind::from_exit_code(STORE_EXIT_CODE),
            Some(ErrorKind::StageRunner)
        );
        assert_eq!(ErrorKind::from_exit_code(101), Some(ErrorKind::StageRunner));
    }

    #[test]
    fn stage_error_serialises_with_tag() {
        let e = StageError::MissingOcrResult { chapter: ch("02") };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"error\":\"missing_ocr_result\""), "got: {json}");
        let back: StageError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chapter().map(|c| c.as_str()), Some("02"));
    }

    #[test]
    fn run_failed_display_names_stage_chapter_and_kind() {
        let e = PipelineError::RunFailed {
            stage: StageName::Ocr,
            chapter: Some(ch("02")),
            kind: ErrorKind::Extraction,
            message: "page 1 unreadable".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("ocr"), "got: {msg}");
        assert!(msg.contains("'02'"), "got: {msg}");
        assert!(msg.contains("ExtractionError"), "got: {msg}");
    }
}
