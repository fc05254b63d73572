//! Markdown conversion stage.
//!
//! For one chapter: require OCR to be complete, read the [`OcrResult`],
//! run the structure detector over each page in page order and write one
//! [`MarkdownFragment`]:
//!
//! ```text
//! # <Chapter Title>
//!
//! <page 0 markdown>
//! <page separator>
//! <page 1 markdown>
//! ...
//! ```

use crate::error::StageError;
use crate::model::{
    Chapter, ChapterId, ChapterStatus, JobId, MarkdownFragment, OcrResult, StageName,
};
use crate::pipeline::detect::{DetectError, PageInput};
use crate::pipeline::{load_chapter, postprocess, save_chapter, StageContext};
use crate::store::{get_json, put_json, ArtifactKey, StoreError};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, info};

/// Run the Markdown stage for one chapter.
pub async fn convert_chapter(
    ctx: &StageContext,
    job: &JobId,
    chapter_id: &ChapterId,
) -> Result<MarkdownFragment, StageError> {
    let store = ctx.store.as_ref();
    let mut chapter = load_chapter(store, job, chapter_id, StageName::Markdown)
        .await?
        .ok_or_else(|| StageError::NotReady {
            chapter: chapter_id.clone(),
            stage: StageName::Markdown,
            detail: "chapter has not been staged".into(),
        })?;
    ensure_ocr_complete(&chapter)?;

    let ocr: OcrResult = match get_json(store, &ArtifactKey::ocr_result(job, chapter_id)).await {
        Ok(result) => result,
        Err(StoreError::NotFound { .. }) => {
            return Err(StageError::MissingOcrResult {
                chapter: chapter_id.clone(),
            })
        }
        Err(StoreError::Corrupt { detail, .. }) => {
            return Err(StageError::MalformedOcrResult {
                chapter: chapter_id.clone(),
                detail,
            })
        }
        Err(e) => return Err(StageError::store(Some(chapter_id), e)),
    };
    validate_ocr(&chapter, &ocr)?;

    info!(
        "Markdown: chapter {} ({} pages, detector {})",
        chapter_id,
        ocr.pages.len(),
        ctx.detector.name()
    );

    let structured: Vec<_> = ocr
        .pages
        .iter()
        .cloned()
        .map(|page| {
            let detector = Arc::clone(&ctx.detector);
            let chapter = chapter_id.clone();
            async move {
                detector
                    .structure(PageInput {
                        chapter: &chapter,
                        page_index: page.page_index,
                        text: &page.text,
                    })
                    .await
                    .map_err(|e| StageError::StructureFailed {
                        chapter: chapter.clone(),
                        page: page.page_index,
                        transient: matches!(e, DetectError::Transient(_)),
                        detail: e.to_string(),
                    })
            }
        })
        .collect();
    let pages: Vec<String> = stream::iter(structured)
        .buffered(ctx.settings.page_concurrency.max(1))
        .try_collect()
        .await?;

    let body = assemble_body(ctx, chapter_id, &pages);
    let fragment = MarkdownFragment::new(chapter_id.clone(), body);
    debug!(
        "Markdown: chapter {}: {} bytes, heading levels {:?}, {} tables",
        chapter_id,
        fragment.body.len(),
        fragment.meta.heading_levels,
        fragment.meta.table_count
    );

    put_json(store, &ArtifactKey::markdown_fragment(job, chapter_id), &fragment)
        .await
        .map_err(|e| StageError::store(Some(chapter_id), e))?;

    chapter.mark(ChapterStatus::MarkdownDone, StageName::Markdown);
    save_chapter(store, job, &chapter).await?;
    Ok(fragment)
}

/// OCR is complete when the chapter reached `ocr_done`, went further, or
/// failed in this very stage on an earlier attempt.
fn ensure_ocr_complete(chapter: &Chapter) -> Result<(), StageError> {
    let ready = match chapter.status {
        ChapterStatus::OcrDone | ChapterStatus::MarkdownDone => true,
        ChapterStatus::Failed => chapter.updated_by == Some(StageName::Markdown),
        ChapterStatus::Pending => false,
    };
    if ready {
        Ok(())
    } else {
        Err(StageError::NotReady {
            chapter: chapter.id.clone(),
            stage: StageName::Markdown,
            detail: format!("chapter status is {}, OCR has not completed", chapter.status),
        })
    }
}

fn validate_ocr(chapter: &Chapter, ocr: &OcrResult) -> Result<(), StageError> {
    let malformed = |detail: String| StageError::MalformedOcrResult {
        chapter: chapter.id.clone(),
        detail,
    };

    if ocr.chapter != chapter.id {
        return Err(malformed(format!(
            "result belongs to chapter '{}'",
            ocr.chapter
        )));
    }
    if ocr.pages.is_empty() {
        return Err(malformed("result has no pages".into()));
    }
    if let Some(pair) = ocr
        .pages
        .windows(2)
        .find(|w| w[0].page_index >= w[1].page_index)
    {
        return Err(malformed(format!(
            "page {} follows page {}; pages must be strictly increasing",
            pair[1].page_index, pair[0].page_index
        )));
    }

    let mut expected: Vec<usize> = chapter.pages.iter().map(|p| p.page_index).collect();
    expected.sort_unstable();
    let actual: Vec<usize> = ocr.pages.iter().map(|p| p.page_index).collect();
    if expected != actual {
        return Err(malformed(format!(
            "result covers pages {actual:?} but the chapter has pages {expected:?}"
        )));
    }
    Ok(())
}

fn assemble_body(ctx: &StageContext, chapter: &ChapterId, pages: &[String]) -> String {
    let mut body = format!("# {}\n\n", chapter.title());
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            body.push_str(&ctx.settings.page_separator.render("page", i + 1));
        }
        body.push_str(page.trim());
    }
    postprocess::clean_markdown(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PageImage, PageText};

    fn chapter(id: &str, pages: usize) -> Chapter {
        let chapter = ChapterId::new(id).unwrap();
        let job = JobId::new("j").unwrap();
        let pages = (0..pages)
            .map(|i| PageImage {
                chapter: chapter.clone(),
                page_index: i,
                image: ArtifactKey::page_image(&job, &chapter, i),
            })
            .collect();
        Chapter::new(chapter, pages)
    }

    fn ocr(id: &str, indices: &[usize]) -> OcrResult {
        OcrResult {
            chapter: ChapterId::new(id).unwrap(),
            pages: indices
                .iter()
                .map(|&i| PageText {
                    page_index: i,
                    text: format!("page {i}"),
                    confidence: None,
                })
                .collect(),
            confidence: None,
            flagged_pages: Vec::new(),
        }
    }

    #[test]
    fn pending_chapters_are_not_ready() {
        let mut ch = chapter("01", 1);
        assert!(ensure_ocr_complete(&ch).is_err());
        ch.mark(ChapterStatus::OcrDone, StageName::Ocr);
        assert!(ensure_ocr_complete(&ch).is_ok());
        ch.mark(ChapterStatus::Failed, StageName::Ocr);
        assert!(ensure_ocr_complete(&ch).is_err());
        ch.mark(ChapterStatus::Failed, StageName::Markdown);
        assert!(ensure_ocr_complete(&ch).is_ok());
    }

    #[test]
    fn ocr_result_must_match_chapter() {
        let ch = chapter("01", 2);
        assert!(validate_ocr(&ch, &ocr("01", &[0, 1])).is_ok());

        let wrong = validate_ocr(&ch, &ocr("02", &[0, 1])).unwrap_err();
        assert!(wrong.to_string().contains("'02'"), "got: {wrong}");

        let unordered = validate_ocr(&ch, &ocr("01", &[1, 0])).unwrap_err();
        assert!(matches!(unordered, StageError::MalformedOcrResult { .. }));

        let duplicated = validate_ocr(&ch, &ocr("01", &[0, 0])).unwrap_err();
        assert!(duplicated.to_string().contains("strictly increasing"));

        let short = validate_ocr(&ch, &ocr("01", &[0])).unwrap_err();
        assert!(short.to_string().contains("[0, 1]"), "got: {short}");

        assert!(validate_ocr(&ch, &ocr("01", &[])).is_err());
    }
}
