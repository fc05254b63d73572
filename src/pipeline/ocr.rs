//! OCR extraction stage.
//!
//! For one chapter: read the chapter record, fetch every page image in
//! page-index order, recognise each page, order its lines top to bottom and
//! write one [`OcrResult`]. Pages are recognised concurrently
//! (`page_concurrency`) but `buffered` keeps results in page order.

use crate::config::{LlmSettings, LowConfidencePolicy};
use crate::error::StageError;
use crate::model::{ChapterId, ChapterStatus, JobId, OcrResult, PageImage, PageText, StageName};
use crate::pipeline::{encode, llm, load_chapter, postprocess, save_chapter, StageContext};
use crate::prompts::OCR_SYSTEM_PROMPT;
use crate::store::{put_json, ArtifactKey, ArtifactStore};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, LLMProvider};
use futures::stream::{self, StreamExt, TryStreamExt};
use image::DynamicImage;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One recognised line and its vertical position on the page.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrLine {
    pub text: String,
    /// Distance of the line's bounding box from the top of the page, in any
    /// unit consistent within a page.
    pub top: f32,
    /// Engine confidence in `0.0..=1.0`, if reported.
    pub confidence: Option<f32>,
}

impl OcrLine {
    pub fn new(text: impl Into<String>, top: f32) -> Self {
        Self {
            text: text.into(),
            top,
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Lines of one page in reading order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognizedPage {
    lines: Vec<OcrLine>,
}

impl RecognizedPage {
    /// Sort lines by `top` (stable, so lines on the same baseline keep the
    /// engine's order).
    pub fn from_lines(mut lines: Vec<OcrLine>) -> Self {
        lines.sort_by(|a, b| a.top.total_cmp(&b.top));
        Self { lines }
    }

    pub fn lines(&self) -> &[OcrLine] {
        &self.lines
    }

    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Mean of the reported line confidences; `None` if no line reported one.
    pub fn confidence(&self) -> Option<f32> {
        let reported: Vec<f32> = self.lines.iter().filter_map(|l| l.confidence).collect();
        if reported.is_empty() {
            None
        } else {
            Some(reported.iter().sum::<f32>() / reported.len() as f32)
        }
    }
}

/// Failure reported by an [`OcrEngine`].
#[derive(Debug, Clone, Error)]
pub enum OcrError {
    /// Backend unavailable, throttled or timed out. Worth retrying.
    #[error("{0}")]
    Transient(String),
    /// The engine refused or could not read the page.
    #[error("{0}")]
    Rejected(String),
}

/// The OCR capability: decoded page image in, positioned lines out.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn recognize(
        &self,
        page: &PageImage,
        image: &DynamicImage,
    ) -> Result<RecognizedPage, OcrError>;
}

/// Run the OCR stage for one chapter.
pub async fn extract_chapter(
    ctx: &StageContext,
    job: &JobId,
    chapter_id: &ChapterId,
) -> Result<OcrResult, StageError> {
    let store = ctx.store.as_ref();
    let mut chapter = load_chapter(store, job, chapter_id, StageName::Ocr)
        .await?
        .ok_or_else(|| StageError::ChapterNotStaged {
            chapter: chapter_id.clone(),
        })?;

    let mut pages = chapter.pages.clone();
    if pages.is_empty() {
        return Err(StageError::NoPages {
            chapter: chapter_id.clone(),
        });
    }
    pages.sort_by_key(|p| p.page_index);
    info!(
        "OCR: chapter {} ({} pages, engine {})",
        chapter_id,
        pages.len(),
        ctx.ocr.name()
    );

    let recognitions: Vec<_> = pages
        .into_iter()
        .map(|page| recognize_page(Arc::clone(&ctx.store), Arc::clone(&ctx.ocr), page))
        .collect();
    let texts: Vec<PageText> = stream::iter(recognitions)
        .buffered(ctx.settings.page_concurrency.max(1))
        .try_collect()
        .await?;

    let flagged_pages = apply_confidence_policy(ctx, chapter_id, &texts)?;
    let confidence = texts
        .iter()
        .filter_map(|t| t.confidence)
        .reduce(f32::min);

    let result = OcrResult {
        chapter: chapter_id.clone(),
        pages: texts,
        confidence,
        flagged_pages,
    };

    put_json(store, &ArtifactKey::ocr_result(job, chapter_id), &result)
        .await
        .map_err(|e| StageError::store(Some(chapter_id), e))?;

    chapter.mark(ChapterStatus::OcrDone, StageName::Ocr);
    save_chapter(store, job, &chapter).await?;
    Ok(result)
}

async fn recognize_page(
    store: Arc<dyn ArtifactStore>,
    ocr: Arc<dyn OcrEngine>,
    page: PageImage,
) -> Result<PageText, StageError> {
    let unreadable = |detail: String| StageError::UnreadablePage {
        chapter: page.chapter.clone(),
        page: page.page_index,
        detail,
    };

    let bytes = match store.get(&page.image).await {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => {
            return Err(unreadable(format!("image '{}' is missing", page.image)))
        }
        Err(e) => return Err(StageError::store(Some(&page.chapter), e)),
    };

    let image = tokio::task::spawn_blocking(move || encode::decode(&bytes))
        .await
        .map_err(|e| StageError::Internal {
            detail: format!("decode task failed: {e}"),
        })?
        .map_err(|e| unreadable(e.to_string()))?;

    let recognized = ocr
        .recognize(&page, &image)
        .await
        .map_err(|e| StageError::OcrFailed {
            chapter: page.chapter.clone(),
            page: page.page_index,
            transient: matches!(e, OcrError::Transient(_)),
            detail: e.to_string(),
        })?;

    debug!(
        "OCR: chapter {} page {}: {} lines",
        page.chapter,
        page.page_index,
        recognized.lines().len()
    );

    Ok(PageText {
        page_index: page.page_index,
        text: recognized.text(),
        confidence: recognized.confidence(),
    })
}

/// Returns the flagged page indices, or the first low-confidence page as an
/// error under the fail-chapter policy.
fn apply_confidence_policy(
    ctx: &StageContext,
    chapter: &ChapterId,
    texts: &[PageText],
) -> Result<Vec<usize>, StageError> {
    let threshold = ctx.settings.min_confidence;
    let mut flagged = Vec::new();

    for text in texts {
        let Some(confidence) = text.confidence else {
            continue;
        };
        if confidence >= threshold {
            continue;
        }
        match ctx.settings.low_confidence {
            LowConfidencePolicy::FailChapter => {
                return Err(StageError::LowConfidence {
                    chapter: chapter.clone(),
                    page: text.page_index,
                    confidence,
                    threshold,
                });
            }
            LowConfidencePolicy::FlagAndContinue => {
                warn!(
                    "OCR: chapter {} page {}: confidence {:.2} below {:.2}, kept and flagged",
                    chapter, text.page_index, confidence, threshold
                );
                flagged.push(text.page_index);
            }
        }
    }
    Ok(flagged)
}

// ── Vision LLM engine ────────────────────────────────────────────────────

/// OCR through a vision-capable LLM.
///
/// The model transcribes the page line by line; line order in its answer is
/// taken as reading order. It reports no confidence, so pages it reads are
/// never subject to the confidence threshold.
pub struct VisionOcrEngine {
    provider: Arc<dyn LLMProvider>,
    settings: LlmSettings,
}

impl VisionOcrEngine {
    pub fn new(provider: Arc<dyn LLMProvider>, settings: LlmSettings) -> Self {
        Self { provider, settings }
    }
}

#[async_trait]
impl OcrEngine for VisionOcrEngine {
    fn name(&self) -> &str {
        "vision-llm"
    }

    async fn recognize(
        &self,
        page: &PageImage,
        image: &DynamicImage,
    ) -> Result<RecognizedPage, OcrError> {
        let image_data =
            encode::encode_page(image).map_err(|e| OcrError::Rejected(e.to_string()))?;
        let prompt = self
            .settings
            .ocr_prompt
            .as_deref()
            .unwrap_or(OCR_SYSTEM_PROMPT);
        let messages = vec![
            ChatMessage::system(prompt),
            ChatMessage::user_with_images("", vec![image_data]),
        ];

        let label = format!("{} p{}", page.chapter, page.page_index);
        let text = llm::complete(&self.provider, &messages, &self.settings, &label)
            .await
            .map_err(|f| {
                OcrError::Transient(format!("{} (after {} attempts)", f.detail, f.attempts))
            })?;

        let text = postprocess::strip_markdown_fences(&text);
        let lines = text
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, l)| OcrLine::new(l, i as f32))
            .collect();
        Ok(RecognizedPage::from_lines(lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_sorted_top_to_bottom() {
        let page = RecognizedPage::from_lines(vec![
            OcrLine::new("third", 30.0),
            OcrLine::new("first", 10.0),
            OcrLine::new("second-a", 20.0),
            OcrLine::new("second-b", 20.0),
        ]);
        assert_eq!(page.text(), "first\nsecond-a\nsecond-b\nthird");
    }

    #[test]
    fn confidence_is_mean_of_reported_lines() {
        let page = RecognizedPage::from_lines(vec![
            OcrLine::new("a", 0.0).with_confidence(0.9),
            OcrLine::new("b", 1.0).with_confidence(0.5),
            OcrLine::new("c", 2.0),
        ]);
        let c = page.confidence().unwrap();
        assert!((c - 0.7).abs() < 1e-6, "got {c}");

        let silent = RecognizedPage::from_lines(vec![OcrLine::new("a", 0.0)]);
        assert_eq!(silent.confidence(), None);
    }

    #[test]
    fn empty_page_has_empty_text() {
        let page = RecognizedPage::default();
        assert_eq!(page.text(), "");
        assert_eq!(page.confidence(), None);
    }
}
