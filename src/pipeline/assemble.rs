//! Final assembly stage.
//!
//! Reads the fragment of every chapter staged for the job, checks that each
//! one is complete and unaltered, then concatenates them in
//! chapter-identifier order. Nothing is written unless every chapter passes,
//! and the body is built in memory and stored with a single `put`, followed
//! by its manifest.
//!
//! A document is only published once the run named in its manifest has a
//! `Done` run record; [`load_final`] treats anything else as stale.

use crate::error::{PipelineError, StageError};
use crate::model::{
    ChapterId, ChapterStatus, FinalDocument, FinalManifest, FragmentMeta, JobId,
    MarkdownFragment, RunId, StageName,
};
use crate::orchestrator::{PipelineState, RunRecord};
use crate::pipeline::{load_chapter, staged_chapter_ids, StageContext};
use crate::store::{get_json, put_json, ArtifactKey, ArtifactStore, StoreError};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Hex SHA-256 of `bytes`.
pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Run the Final stage for a job.
///
/// The document always covers every staged chapter of the job: chapters
/// missing from `chapters` are added, and any chapter that has not finished
/// Markdown conversion fails the stage with an incomplete-input error.
pub async fn assemble(
    ctx: &StageContext,
    job: &JobId,
    chapters: &[ChapterId],
    run_id: Option<RunId>,
) -> Result<FinalDocument, StageError> {
    let store = ctx.store.as_ref();
    let staged = staged_chapter_ids(store, job)
        .await
        .map_err(|e| StageError::store(None, e))?;
    let ordered: Vec<ChapterId> = chapters
        .iter()
        .cloned()
        .chain(staged)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if ordered.len() > chapters.len() {
        debug!(
            "Final: job {} covers {} staged chapters, {} requested",
            job,
            ordered.len(),
            chapters.len()
        );
    }
    if ordered.is_empty() {
        return Err(StageError::EmptyChapterSet);
    }

    let mut fragments = Vec::with_capacity(ordered.len());
    for chapter in &ordered {
        fragments.push(load_fragment(store, job, chapter).await?);
    }

    let body = render_document(ctx, &fragments);
    let digest = sha256_hex(body.as_bytes());
    let generated_at = Utc::now();
    let manifest = FinalManifest {
        job_id: job.clone(),
        chapters: ordered.clone(),
        generated_at,
        digest: digest.clone(),
        fragment_digests: fragments
            .iter()
            .map(|f| (f.chapter.clone(), sha256_hex(f.body.as_bytes())))
            .collect(),
        run_id,
    };

    store
        .put(&ArtifactKey::final_document(job), body.clone().into_bytes())
        .await
        .map_err(|e| StageError::store(None, e))?;
    put_json(store, &ArtifactKey::final_manifest(job), &manifest)
        .await
        .map_err(|e| StageError::store(None, e))?;

    info!(
        "Final: job {} assembled from {} chapters ({} bytes)",
        job,
        ordered.len(),
        body.len()
    );

    Ok(FinalDocument {
        job_id: job.clone(),
        chapters: ordered,
        body,
        generated_at,
        digest,
    })
}

async fn load_fragment(
    store: &dyn ArtifactStore,
    job: &JobId,
    chapter_id: &ChapterId,
) -> Result<MarkdownFragment, StageError> {
    let not_ready = |detail: String| StageError::NotReady {
        chapter: chapter_id.clone(),
        stage: StageName::Final,
        detail,
    };
    let inconsistent = |detail: String| StageError::InconsistentFragment {
        chapter: chapter_id.clone(),
        detail,
    };

    let chapter = load_chapter(store, job, chapter_id, StageName::Final)
        .await?
        .ok_or_else(|| not_ready("chapter has not been staged".into()))?;
    if chapter.status != ChapterStatus::MarkdownDone {
        return Err(not_ready(format!(
            "chapter status is {}, Markdown conversion has not completed",
            chapter.status
        )));
    }

    let fragment: MarkdownFragment =
        match get_json(store, &ArtifactKey::markdown_fragment(job, chapter_id)).await {
            Ok(fragment) => fragment,
            Err(StoreError::NotFound { .. }) => {
                return Err(StageError::MissingFragment {
                    chapter: chapter_id.clone(),
                })
            }
            Err(StoreError::Corrupt { detail, .. }) => return Err(inconsistent(detail)),
            Err(e) => return Err(StageError::store(Some(chapter_id), e)),
        };

    if &fragment.chapter != chapter_id {
        return Err(inconsistent(format!(
            "fragment belongs to chapter '{}'",
            fragment.chapter
        )));
    }
    if fragment.body.trim().is_empty() {
        return Err(inconsistent("fragment body is empty".into()));
    }
    let rescanned = FragmentMeta::scan(&fragment.body);
    if rescanned != fragment.meta {
        return Err(inconsistent(format!(
            "metadata does not match body (recorded {:?}, found {:?})",
            fragment.meta, rescanned
        )));
    }
    Ok(fragment)
}

// ── Rendering ────────────────────────────────────────────────────────────

static RE_TITLE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#\s+(.+)$").unwrap());

/// Title line of a fragment and the rest of its body.
fn split_title(body: &str) -> (Option<&str>, &str) {
    let body = body.trim();
    let (first, rest) = body.split_once('\n').unwrap_or((body, ""));
    match RE_TITLE_LINE.captures(first) {
        Some(caps) => {
            let title = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            (Some(title), rest.trim_start_matches('\n'))
        }
        None => (None, body),
    }
}

fn render_document(ctx: &StageContext, fragments: &[MarkdownFragment]) -> String {
    let settings = &ctx.settings;
    let mut sections = Vec::with_capacity(fragments.len());
    let mut toc = Vec::with_capacity(fragments.len());
    let mut slugs = Slugger::default();

    for (i, fragment) in fragments.iter().enumerate() {
        let (title, rest) = split_title(&fragment.body);
        let title = title
            .map(str::to_string)
            .unwrap_or_else(|| fragment.chapter.title());
        let heading = if settings.number_chapters {
            format!("{}. {}", i + 1, title)
        } else {
            title
        };

        toc.push(format!("- [{}](#{})", heading, slugs.slug(&heading)));
        if rest.is_empty() {
            sections.push(format!("# {heading}"));
        } else {
            sections.push(format!("# {heading}\n\n{rest}"));
        }
    }

    let mut body = String::new();
    if settings.table_of_contents {
        body.push_str("## Contents\n\n");
        body.push_str(&toc.join("\n"));
        body.push_str("\n\n");
    }
    for (i, section) in sections.iter().enumerate() {
        if i > 0 {
            body.push_str(&settings.chapter_separator.render("chapter", i + 1));
        }
        body.push_str(section.trim_end());
    }
    body.push('\n');
    body
}

/// GitHub-style heading anchors, with `-1`, `-2` suffixes for repeats.
#[derive(Default)]
struct Slugger {
    seen: HashMap<String, usize>,
}

impl Slugger {
    fn slug(&mut self, heading: &str) -> String {
        let base: String = heading
            .trim()
            .to_lowercase()
            .chars()
            .filter_map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    Some(c)
                } else if c == ' ' {
                    Some('-')
                } else {
                    None
                }
            })
            .collect();
        let count = self.seen.entry(base.clone()).or_insert(0);
        let slug = if *count == 0 {
            base
        } else {
            format!("{base}-{count}")
        };
        *count += 1;
        slug
    }
}

// ── Reading the published document ───────────────────────────────────────

/// Read the published document of `job`, verifying the body against the
/// manifest written after it and the manifest against its run record.
pub async fn load_final(store: &dyn ArtifactStore, job: &JobId) -> Result<FinalDocument, PipelineError> {
    let manifest: FinalManifest = match get_json(store, &ArtifactKey::final_manifest(job)).await {
        Ok(m) => m,
        Err(StoreError::NotFound { .. }) => {
            return Err(PipelineError::FinalDocumentNotFound { job: job.clone() })
        }
        Err(e) => return Err(e.into()),
    };
    let bytes = match store.get(&ArtifactKey::final_document(job)).await {
        Ok(b) => b,
        Err(StoreError::NotFound { .. }) => {
            return Err(PipelineError::FinalDocumentStale { job: job.clone() })
        }
        Err(e) => return Err(e.into()),
    };
    if sha256_hex(&bytes) != manifest.digest {
        return Err(PipelineError::FinalDocumentStale { job: job.clone() });
    }
    let body = String::from_utf8(bytes)
        .map_err(|_| PipelineError::FinalDocumentStale { job: job.clone() })?;

    if let Some(run_id) = manifest.run_id {
        let record: RunRecord = match get_json(store, &ArtifactKey::run_record(job, &run_id)).await {
            Ok(record) => record,
            Err(StoreError::NotFound { .. }) => {
                return Err(PipelineError::FinalDocumentStale { job: job.clone() })
            }
            Err(e) => return Err(e.into()),
        };
        if record.state != PipelineState::Done {
            return Err(PipelineError::FinalDocumentStale { job: job.clone() });
        }
    }

    Ok(FinalDocument {
        job_id: manifest.job_id,
        chapters: manifest.chapters,
        body,
        generated_at: manifest.generated_at,
        digest: manifest.digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_follow_github_rules() {
        let mut s = Slugger::default();
        assert_eq!(s.slug("1. Vm Provisioning"), "1-vm-provisioning");
        assert_eq!(s.slug("SQL Server (2019)"), "sql-server-2019");
        assert_eq!(s.slug("Intro"), "intro");
        assert_eq!(s.slug("Intro"), "intro-1");
    }

    #[test]
    fn title_is_split_from_body() {
        assert_eq!(split_title("# Setup\n\nRun it.\n"), (Some("Setup"), "Run it."));
        assert_eq!(split_title("# Only\n"), (Some("Only"), ""));
        assert_eq!(split_title("No title\nhere"), (None, "No title\nhere"));
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
