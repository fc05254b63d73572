//! Structure detection: OCR text of one page → Markdown blocks.
//!
//! The Markdown stage calls a [`StructureDetector`] per page. Two are
//! provided: the offline [`HeuristicDetector`] and the [`LlmDetector`],
//! which hands the page to a language model acting as a technical writer.
//!
//! Detectors emit section headings at level 2 and below; the chapter title
//! is the only level-1 heading and is added by the stage.

use crate::config::LlmSettings;
use crate::model::ChapterId;
use crate::pipeline::{llm, postprocess};
use crate::prompts::STRUCTURE_SYSTEM_PROMPT;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, LLMProvider};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;

/// One page handed to a detector.
#[derive(Debug, Clone, Copy)]
pub struct PageInput<'a> {
    pub chapter: &'a ChapterId,
    pub page_index: usize,
    pub text: &'a str,
}

/// Failure reported by a [`StructureDetector`].
#[derive(Debug, Clone, Error)]
pub enum DetectError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Rejected(String),
}

/// Pluggable structure detection.
#[async_trait]
pub trait StructureDetector: Send + Sync {
    fn name(&self) -> &str;

    /// Markdown for one page. May be empty for a blank page.
    async fn structure(&self, page: PageInput<'_>) -> Result<String, DetectError>;
}

// ── Heuristic detector ───────────────────────────────────────────────────

static RE_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+){0,4})\s+([A-Za-z].{0,100})$").unwrap());
static RE_ORDERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,3})[.)]\s+(\S.*)$").unwrap());
static RE_BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[-*+•▪◦·]|o)\s+(\S.*)$").unwrap());
static RE_COLUMN_GAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\t+|\s{2,}").unwrap());

/// Rule-based detector.
///
/// | OCR line | Markdown |
/// |----------|----------|
/// | `2.1 Prerequisites` | `### 2.1 Prerequisites` (level = 2 + depth − 1) |
/// | `INSTALLATION STEPS` (short, all caps) | `## INSTALLATION STEPS` |
/// | `• item`, `- item`, `o item` | `- item` |
/// | `3) item`, `3. item` | `3. item` |
/// | two or more consecutive lines with the same number (≥ 2) of columns separated by tabs or 2+ spaces | pipe table, first row as header |
/// | anything else | paragraph text |
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicDetector;

#[derive(Debug, PartialEq)]
enum Block {
    Heading(usize, String),
    List(Vec<String>),
    Table(Vec<Vec<String>>),
    Paragraph(Vec<String>),
}

impl HeuristicDetector {
    /// Synchronous core of the detector.
    pub fn convert(&self, text: &str) -> String {
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        let mut blocks: Vec<Block> = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];
            if line.is_empty() {
                blocks.push(Block::Paragraph(Vec::new()));
                i += 1;
                continue;
            }

            let rows = table_run(&lines[i..]);
            if rows.len() >= 2 {
                i += rows.len();
                blocks.push(Block::Table(rows));
                continue;
            }

            if let Some(heading) = heading_of(line) {
                blocks.push(heading);
            } else if let Some(item) = list_item_of(line) {
                match blocks.last_mut() {
                    Some(Block::List(items)) => items.push(item),
                    _ => blocks.push(Block::List(vec![item])),
                }
            } else {
                match blocks.last_mut() {
                    Some(Block::Paragraph(ls)) if !ls.is_empty() => ls.push(line.to_string()),
                    _ => blocks.push(Block::Paragraph(vec![line.to_string()])),
                }
            }
            i += 1;
        }

        blocks
            .into_iter()
            .filter_map(render_block)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn heading_of(line: &str) -> Option<Block> {
    if let Some(caps) = RE_SECTION.captures(line) {
        let title = caps[2].trim_end();
        if !title.ends_with(['.', ',', ';', ':']) {
            let depth = caps[1].split('.').count();
            let level = (depth + 1).min(6);
            return Some(Block::Heading(level, format!("{} {}", &caps[1], title)));
        }
    }
    if is_caps_heading(line) {
        return Some(Block::Heading(2, line.to_string()));
    }
    None
}

fn is_caps_heading(line: &str) -> bool {
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    line.len() <= 60
        && letters.len() >= 3
        && letters.iter().all(|c| c.is_uppercase())
        && !line.ends_with(['.', ',', ';', ':'])
        && !RE_COLUMN_GAP.is_match(line)
}

fn list_item_of(line: &str) -> Option<String> {
    if let Some(caps) = RE_BULLET.captures(line) {
        return Some(format!("- {}", &caps[1]));
    }
    if let Some(caps) = RE_ORDERED.captures(line) {
        return Some(format!("{}. {}", &caps[1], &caps[2]));
    }
    None
}

/// Leading lines that split into the same number (≥ 2) of columns.
fn table_run(lines: &[&str]) -> Vec<Vec<String>> {
    let split = |l: &str| -> Vec<String> {
        RE_COLUMN_GAP
            .split(l.trim())
            .map(|c| c.replace('|', "\\|"))
            .collect()
    };
    let Some(first) = lines.first().filter(|l| !l.is_empty()) else {
        return Vec::new();
    };
    let header = split(*first);
    if header.len() < 2 {
        return Vec::new();
    }
    let mut rows = vec![header];
    for line in &lines[1..] {
        if line.is_empty() {
            break;
        }
        let cells = split(*line);
        if cells.len() != rows[0].len() {
            break;
        }
        rows.push(cells);
    }
    rows
}

fn render_block(block: Block) -> Option<String> {
    match block {
        Block::Heading(level, text) => Some(format!("{} {}", "#".repeat(level), text)),
        Block::List(items) => Some(items.join("\n")),
        Block::Paragraph(lines) if lines.is_empty() => None,
        Block::Paragraph(lines) => Some(lines.join("\n")),
        Block::Table(rows) => {
            let cols = rows[0].len();
            let mut out = Vec::with_capacity(rows.len() + 1);
            for (i, row) in rows.iter().enumerate() {
                out.push(format!("| {} |", row.join(" | ")));
                if i == 0 {
                    out.push(format!("|{}", " --- |".repeat(cols)));
                }
            }
            Some(out.join("\n"))
        }
    }
}

#[async_trait]
impl StructureDetector for HeuristicDetector {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn structure(&self, page: PageInput<'_>) -> Result<String, DetectError> {
        Ok(self.convert(page.text))
    }
}

// ── LLM detector ─────────────────────────────────────────────────────────

/// Structure detection by a language model.
pub struct LlmDetector {
    provider: Arc<dyn LLMProvider>,
    settings: LlmSettings,
}

impl LlmDetector {
    pub fn new(provider: Arc<dyn LLMProvider>, settings: LlmSettings) -> Self {
        Self { provider, settings }
    }
}

#[async_trait]
impl StructureDetector for LlmDetector {
    fn name(&self) -> &str {
        "llm"
    }

    async fn structure(&self, page: PageInput<'_>) -> Result<String, DetectError> {
        if page.text.trim().is_empty() {
            return Ok(String::new());
        }
        let prompt = self
            .settings
            .structure_prompt
            .as_deref()
            .unwrap_or(STRUCTURE_SYSTEM_PROMPT);
        let messages = vec![
            ChatMessage::system(prompt),
            ChatMessage::user_with_images(page.text, Vec::new()),
        ];
        let label = format!("{} p{} structure", page.chapter, page.page_index);

        let markdown = llm::complete(&self.provider, &messages, &self.settings, &label)
            .await
            .map_err(|f| {
                DetectError::Transient(format!("{} (after {} attempts)", f.detail, f.attempts))
            })?;
        Ok(postprocess::strip_markdown_fences(&markdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(text: &str) -> String {
        HeuristicDetector.convert(text)
    }

    #[test]
    fn numbered_sections_become_headings_by_depth() {
        let out = convert("1 Overview\nSome text.\n2.1 Prerequisites\n2.1.3 Disk Layout");
        assert_eq!(
            out,
            "## 1 Overview\n\nSome text.\n\n### 2.1 Prerequisites\n\n#### 2.1.3 Disk Layout"
        );
    }

    #[test]
    fn sentences_starting_with_numbers_stay_text() {
        assert_eq!(convert("3 servers are required."), "3 servers are required.");
    }

    #[test]
    fn caps_lines_become_headings() {
        assert_eq!(
            convert("INSTALLATION STEPS\nRun the installer"),
            "## INSTALLATION STEPS\n\nRun the installer"
        );
        assert_eq!(convert("OK"), "OK");
    }

    #[test]
    fn lists_are_normalised() {
        let out = convert("Before you start:\n• Backup\no Stop services\n1) Open console\n2. Log in");
        assert_eq!(
            out,
            "Before you start:\n\n- Backup\n- Stop services\n1. Open console\n2. Log in"
        );
    }

    #[test]
    fn aligned_columns_become_a_table() {
        let out = convert("Setting    Value\nPort    8080\nHost\tdb01\n\nDone");
        assert_eq!(
            out,
            "| Setting | Value |\n| --- | --- |\n| Port | 8080 |\n| Host | db01 |\n\nDone"
        );
    }

    #[test]
    fn paragraph_lines_are_kept_together() {
        assert_eq!(convert("line one\nline two\n\nnext"), "line one\nline two\n\nnext");
    }

    #[tokio::test]
    async fn trait_object_delegates_to_convert() {
        let detector: Arc<dyn StructureDetector> = Arc::new(HeuristicDetector);
        let chapter = ChapterId::new("01").unwrap();
        let out = detector
            .structure(PageInput {
                chapter: &chapter,
                page_index: 0,
                text: "NOTES\nkeep this",
            })
            .await
            .unwrap();
        assert_eq!(out, "## NOTES\n\nkeep this");
    }
}
