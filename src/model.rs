//! Domain types shared by every stage.
//!
//! Everything here is plain data that round-trips through the artifact store
//! as JSON. Stages never hand these to each other in memory; a downstream
//! stage always re-reads what the upstream stage wrote.

use crate::error::PipelineError;
use crate::store::ArtifactKey;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ── Identifiers ──────────────────────────────────────────────────────────

fn validate_identifier(what: &'static str, value: &str) -> Result<(), PipelineError> {
    let reason = if value.is_empty() {
        Some("must not be empty".to_string())
    } else if value.starts_with('.') {
        Some("must not start with '.'".to_string())
    } else if value.len() > 128 {
        Some("must be at most 128 characters".to_string())
    } else {
        value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .map(|c| format!("character {c:?} is not allowed (use A-Z, a-z, 0-9, '-', '_', '.')"))
    };

    match reason {
        Some(reason) => Err(PipelineError::InvalidIdentifier {
            what,
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

fn sanitize_identifier(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('.')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(128)
        .collect()
}

static RE_FIRST_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Sort key used for chapter identifiers and source file names: the first
/// run of digits compared numerically, names without digits last, ties
/// broken by the full string.
pub(crate) fn natural_key(s: &str) -> (u64, &str) {
    let number = RE_FIRST_NUMBER
        .find(s)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(u64::MAX);
    (number, s)
}

/// Identifier of a chapter, unique within a job.
///
/// Ordering is the chapter order of the final document: `"2" < "10"`,
/// `"01" < "02"`, `"chapter-9" < "chapter-10"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChapterId(String);

impl ChapterId {
    pub fn new(id: impl Into<String>) -> Result<Self, PipelineError> {
        let id = id.into();
        validate_identifier("chapter id", &id)?;
        Ok(Self(id))
    }

    /// Like [`JobId::sanitized`]; used for chapter folder and document names.
    pub fn sanitized(raw: &str) -> Result<Self, PipelineError> {
        Self::new(sanitize_identifier(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Human title derived from the identifier: separators become spaces and
    /// each word is capitalised (`"vm-provisioning"` → `"Vm Provisioning"`).
    pub fn title(&self) -> String {
        self.0
            .split(['-', '_'])
            .filter(|w| !w.is_empty())
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                    }
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Ord for ChapterId {
    fn cmp(&self, other: &Self) -> Ordering {
        natural_key(&self.0).cmp(&natural_key(&other.0))
    }
}

impl PartialOrd for ChapterId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChapterId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ChapterId {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChapterId> for String {
    fn from(id: ChapterId) -> Self {
        id.0
    }
}

/// Identifier of a job: one source document and all its artifacts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Result<Self, PipelineError> {
        let id = id.into();
        validate_identifier("job id", &id)?;
        Ok(Self(id))
    }

    /// Build a job id from arbitrary text (usually a folder name), replacing
    /// every disallowed character with `-`.
    pub fn sanitized(raw: &str) -> Result<Self, PipelineError> {
        Self::new(sanitize_identifier(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

/// Identifier of one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ── Stages ───────────────────────────────────────────────────────────────

/// The three processing stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Ocr,
    Markdown,
    Final,
}

impl StageName {
    pub const ALL: [StageName; 3] = [StageName::Ocr, StageName::Markdown, StageName::Final];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Ocr => "ocr",
            StageName::Markdown => "markdown",
            StageName::Final => "final",
        }
    }

    /// Whether the stage runs once per chapter (as opposed to once per job).
    pub fn is_per_chapter(self) -> bool {
        !matches!(self, StageName::Final)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ocr" => Ok(StageName::Ocr),
            "markdown" | "md" => Ok(StageName::Markdown),
            "final" | "assemble" => Ok(StageName::Final),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown stage '{other}' (expected ocr, markdown or final)"
            ))),
        }
    }
}

// ── Chapters and pages ───────────────────────────────────────────────────

/// Processing status of a chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Pending,
    OcrDone,
    MarkdownDone,
    Failed,
}

impl ChapterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChapterStatus::Pending => "pending",
            ChapterStatus::OcrDone => "ocr_done",
            ChapterStatus::MarkdownDone => "markdown_done",
            ChapterStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ChapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scanned page. Immutable once staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    pub chapter: ChapterId,
    /// 0-based; defines reading order inside the chapter.
    pub page_index: usize,
    /// Where the PNG lives in the artifact store.
    pub image: ArtifactKey,
}

/// Chapter record as persisted in the store.
///
/// Created at intake with status `pending`, updated by each stage, never
/// deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    /// Sorted by `page_index`.
    pub pages: Vec<PageImage>,
    pub status: ChapterStatus,
    /// Stage that last changed `status`; `None` right after intake.
    pub updated_by: Option<StageName>,
    pub updated_at: DateTime<Utc>,
    /// Hex SHA-256 of the source the pages were staged from. Re-intake of
    /// a source with the same digest leaves the record untouched.
    #[serde(default)]
    pub source_digest: Option<String>,
}

impl Chapter {
    pub fn new(id: ChapterId, pages: Vec<PageImage>) -> Self {
        Self {
            id,
            pages,
            status: ChapterStatus::Pending,
            updated_by: None,
            updated_at: Utc::now(),
            source_digest: None,
        }
    }

    pub fn with_source_digest(mut self, digest: impl Into<String>) -> Self {
        self.source_digest = Some(digest.into());
        self
    }

    pub(crate) fn mark(&mut self, status: ChapterStatus, stage: StageName) {
        self.status = status;
        self.updated_by = Some(stage);
        self.updated_at = Utc::now();
    }
}

// ── Stage outputs ────────────────────────────────────────────────────────

/// Recognised text of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageText {
    pub page_index: usize,
    /// Lines in top-to-bottom order, joined with `\n`.
    pub text: String,
    /// Mean line confidence in `0.0..=1.0`, if the engine reports one.
    pub confidence: Option<f32>,
}

/// Consolidated OCR output of one chapter. Written by the OCR stage only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub chapter: ChapterId,
    /// In page order.
    pub pages: Vec<PageText>,
    /// Lowest page confidence, if any page reported one.
    pub confidence: Option<f32>,
    /// Pages kept despite low confidence (flag-and-continue policy).
    #[serde(default)]
    pub flagged_pages: Vec<usize>,
}

/// Structural facts about a Markdown body, recomputed at assembly time to
/// detect fragments that were altered or truncated after conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentMeta {
    /// Distinct ATX heading levels present, ascending.
    pub heading_levels: Vec<u8>,
    /// Number of GFM tables (header separator rows).
    pub table_count: usize,
}

static RE_ATX_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+\S").unwrap());
static RE_TABLE_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\|(\s*:?-{3,}:?\s*\|)+\s*$").unwrap());

impl FragmentMeta {
    /// Scan a Markdown body, ignoring fenced code blocks.
    pub fn scan(body: &str) -> Self {
        let mut levels = Vec::new();
        let mut table_count = 0;
        let mut in_fence = false;

        for line in body.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }
            if let Some(caps) = RE_ATX_HEADING.captures(line) {
                let level = caps[1].len() as u8;
                if !levels.contains(&level) {
                    levels.push(level);
                }
            } else if RE_TABLE_SEPARATOR.is_match(line.trim()) {
                table_count += 1;
            }
        }

        levels.sort_unstable();
        Self {
            heading_levels: levels,
            table_count,
        }
    }
}

/// Markdown produced for one chapter. Written by the Markdown stage only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkdownFragment {
    pub chapter: ChapterId,
    pub body: String,
    pub meta: FragmentMeta,
}

impl MarkdownFragment {
    pub fn new(chapter: ChapterId, body: String) -> Self {
        let meta = FragmentMeta::scan(&body);
        Self {
            chapter,
            body,
            meta,
        }
    }
}

/// The published document of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalDocument {
    pub job_id: JobId,
    /// In document order.
    pub chapters: Vec<ChapterId>,
    pub body: String,
    pub generated_at: DateTime<Utc>,
    /// Hex SHA-256 of `body`.
    pub digest: String,
}

/// Everything about a [`FinalDocument`] except its body; stored next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalManifest {
    pub job_id: JobId,
    pub chapters: Vec<ChapterId>,
    pub generated_at: DateTime<Utc>,
    pub digest: String,
    /// Hex SHA-256 of each fragment body that went into the document.
    pub fragment_digests: Vec<(ChapterId, String)>,
    /// Run that published the document. The document only counts as
    /// published once that run's record says `Done`. `None` when the Final
    /// stage was invoked outside a run.
    #[serde(default)]
    pub run_id: Option<RunId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<ChapterId> {
        raw.iter().map(|s| ChapterId::new(*s).unwrap()).collect()
    }

    #[test]
    fn chapter_ids_sort_numerically() {
        let mut chapters = ids(&["10", "2", "01", "intro", "chapter-10", "chapter-9"]);
        chapters.sort();
        let order: Vec<&str> = chapters.iter().map(|c| c.as_str()).collect();
        assert_eq!(order, vec!["01", "2", "chapter-9", "10", "chapter-10", "intro"]);
    }

    #[test]
    fn equal_numbers_tie_break_on_text() {
        let mut chapters = ids(&["02", "2", "2b"]);
        chapters.sort();
        let order: Vec<&str> = chapters.iter().map(|c| c.as_str()).collect();
        assert_eq!(order, vec!["02", "2", "2b"]);
        assert_ne!(
            ChapterId::new("02").unwrap().cmp(&ChapterId::new("2").unwrap()),
            Ordering::Equal
        );
    }

    #[test]
    fn invalid_identifiers_are_rejected() {
        assert!(ChapterId::new("").is_err());
        assert!(ChapterId::new(".hidden").is_err());
        assert!(ChapterId::new("a/b").is_err());
        assert!(ChapterId::new("with space").is_err());
        assert!(JobId::new("job:1").is_err());
        assert!(ChapterId::new("ch_01.v2").is_ok());
    }

    #[test]
    fn job_id_sanitizes_folder_names() {
        let id = JobId::sanitized("Teamcenter Install Guide (v2)").unwrap();
        assert_eq!(id.as_str(), "Teamcenter-Install-Guide--v2-");
        assert!(JobId::sanitized("   ").is_err());
    }

    #[test]
    fn chapter_title_from_id() {
        assert_eq!(ChapterId::new("vm-provisioning").unwrap().title(), "Vm Provisioning");
        assert_eq!(ChapterId::new("SQL_server").unwrap().title(), "Sql Server");
        assert_eq!(ChapterId::new("01").unwrap().title(), "01");
    }

    #[test]
    fn chapter_id_deserialization_validates() {
        let ok: ChapterId = serde_json::from_str("\"03\"").unwrap();
        assert_eq!(ok.as_str(), "03");
        assert!(serde_json::from_str::<ChapterId>("\"../etc\"").is_err());
    }

    #[test]
    fn stage_names_parse() {
        assert_eq!("OCR".parse::<StageName>().unwrap(), StageName::Ocr);
        assert_eq!("markdown".parse::<StageName>().unwrap(), StageName::Markdown);
        assert_eq!("final".parse::<StageName>().unwrap(), StageName::Final);
        assert!("render".parse::<StageName>().is_err());
        assert!(StageName::Ocr.is_per_chapter());
        assert!(!StageName::Final.is_per_chapter());
    }

    #[test]
    fn fragment_meta_counts_headings_and_tables() {
        let body = "# Title\n\n## Section\n\n| A | B |\n| --- | --- |\n| 1 | 2 |\n\n\
                    ## Again\n\n```\n# not a heading\n| --- |\n```\n\n| X |\n|:---:|\n| y |\n";
        let meta = FragmentMeta::scan(body);
        assert_eq!(meta.heading_levels, vec![1, 2]);
        assert_eq!(meta.table_count, 2);
    }

    #[test]
    fn run_id_round_trips_through_display() {
        let id = RunId::generate();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
