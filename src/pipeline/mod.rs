//! The processing stages and the capabilities they call.
//!
//! ## Data Flow
//!
//! ```text
//! intake ──▶ ocr ──▶ markdown ──▶ assemble
//! (folder)   (OcrEngine)  (StructureDetector)  (final document)
//! ```
//!
//! Every arrow is the artifact store: a stage reads only what the previous
//! stage wrote under the deterministic keys of [`crate::store`].
//!
//! 1. [`intake`]: chapter folders → staged PNG pages + `pending` records
//! 2. [`ocr`]: page images → one `OcrResult` per chapter
//! 3. [`markdown`]: `OcrResult` → one `MarkdownFragment` per chapter
//! 4. [`assemble`]: all fragments → the final document + manifest
//!
//! Supporting modules: [`encode`] (image normalisation and base64),
//! [`llm`] (provider resolution, retried calls), [`detect`] (structure
//! detectors), [`postprocess`] (deterministic Markdown clean-up).

pub mod assemble;
pub mod detect;
pub mod encode;
pub mod intake;
pub mod llm;
pub mod markdown;
pub mod ocr;
pub mod postprocess;

use crate::config::{DetectorKind, OcrEngineKind, StageSettings};
use crate::error::{PipelineError, StageError};
use crate::model::{Chapter, ChapterId, ChapterStatus, JobId, StageName};
use crate::store::{get_json, put_json, ArtifactKey, ArtifactStore, StoreError};
use detect::{HeuristicDetector, LlmDetector, StructureDetector};
use edgequake_llm::LLMProvider;
use ocr::{OcrEngine, VisionOcrEngine};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Everything a stage needs: the store, the two capabilities and the
/// stage settings. Shared read-only by all chapters of an invocation.
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<dyn ArtifactStore>,
    pub ocr: Arc<dyn OcrEngine>,
    pub detector: Arc<dyn StructureDetector>,
    pub settings: StageSettings,
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("ocr", &self.ocr.name())
            .field("detector", &self.detector.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl StageContext {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        ocr: Arc<dyn OcrEngine>,
        detector: Arc<dyn StructureDetector>,
        settings: StageSettings,
    ) -> Self {
        Self {
            store,
            ocr,
            detector,
            settings,
        }
    }

    /// Build the capabilities named in `settings` on top of the resolved
    /// LLM provider (pre-built, named, or auto-detected).
    pub fn from_settings(
        store: Arc<dyn ArtifactStore>,
        settings: StageSettings,
        provider: Option<&Arc<dyn LLMProvider>>,
    ) -> Result<Self, PipelineError> {
        let provider = llm::resolve_provider(provider, &settings.llm)?;
        let ocr: Arc<dyn OcrEngine> = match settings.ocr_engine {
            OcrEngineKind::Vision => Arc::new(VisionOcrEngine::new(
                Arc::clone(&provider),
                settings.llm.clone(),
            )),
        };
        let detector: Arc<dyn StructureDetector> = match settings.detector {
            DetectorKind::Heuristic => Arc::new(HeuristicDetector),
            DetectorKind::Llm => Arc::new(LlmDetector::new(provider, settings.llm.clone())),
        };
        Ok(Self::new(store, ocr, detector, settings))
    }
}

/// Run a per-chapter stage for one chapter.
pub async fn run_chapter_stage(
    ctx: &StageContext,
    stage: StageName,
    job: &JobId,
    chapter: &ChapterId,
) -> Result<(), StageError> {
    match stage {
        StageName::Ocr => ocr::extract_chapter(ctx, job, chapter).await.map(|_| ()),
        StageName::Markdown => markdown::convert_chapter(ctx, job, chapter).await.map(|_| ()),
        StageName::Final => Err(StageError::Internal {
            detail: "the final stage runs once per job, not per chapter".into(),
        }),
    }
}

/// Read a chapter record for `stage`; `None` if the chapter was never
/// staged. An undecodable record fails in the stage's own kind.
pub(crate) async fn load_chapter(
    store: &dyn ArtifactStore,
    job: &JobId,
    chapter: &ChapterId,
    stage: StageName,
) -> Result<Option<Chapter>, StageError> {
    match get_json(store, &ArtifactKey::chapter_record(job, chapter)).await {
        Ok(record) => Ok(Some(record)),
        Err(StoreError::NotFound { .. }) => Ok(None),
        Err(StoreError::Corrupt { detail, .. }) => Err(StageError::CorruptRecord {
            chapter: chapter.clone(),
            stage,
            detail,
        }),
        Err(e) => Err(StageError::store(Some(chapter), e)),
    }
}

pub(crate) async fn save_chapter(
    store: &dyn ArtifactStore,
    job: &JobId,
    chapter: &Chapter,
) -> Result<(), StageError> {
    put_json(store, &ArtifactKey::chapter_record(job, &chapter.id), chapter)
        .await
        .map_err(|e| StageError::store(Some(&chapter.id), e))
}

/// Record that `chapter` failed `stage`. Best effort: a store failure here
/// is logged, since the stage failure itself is what gets reported.
pub async fn mark_failed(store: &dyn ArtifactStore, job: &JobId, chapter: &ChapterId, stage: StageName) {
    let result = async {
        if let Some(mut record) = load_chapter(store, job, chapter, stage).await? {
            record.mark(ChapterStatus::Failed, stage);
            save_chapter(store, job, &record).await?;
        }
        Ok::<(), StageError>(())
    }
    .await;
    if let Err(e) = result {
        warn!("could not mark chapter {} as failed: {}", chapter, e);
    }
}

/// Identifiers of every chapter staged for a job, in chapter order. Reads
/// key names only, so a corrupt record does not hide its chapter.
pub(crate) async fn staged_chapter_ids(
    store: &dyn ArtifactStore,
    job: &JobId,
) -> Result<Vec<ChapterId>, StoreError> {
    let prefix = ArtifactKey::chapters_prefix(job);
    let mut ids: Vec<ChapterId> = store
        .list(&prefix)
        .await?
        .iter()
        .filter_map(|key| {
            let name = key.as_str().strip_prefix(&prefix)?.strip_suffix(".json")?;
            ChapterId::new(name).ok()
        })
        .collect();
    ids.sort();
    Ok(ids)
}

/// All chapter records of a job, in chapter order.
pub async fn list_chapters(store: &dyn ArtifactStore, job: &JobId) -> Result<Vec<Chapter>, StoreError> {
    let mut chapters = Vec::new();
    for key in store.list(&ArtifactKey::chapters_prefix(job)).await? {
        if key.as_str().ends_with(".json") {
            chapters.push(get_json::<Chapter>(store, &key).await?);
        }
    }
    chapters.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(chapters)
}
