//! Deterministic clean-up of chapter Markdown.
//!
//! Applied to every chapter body before it is written, whichever detector
//! produced it. Every rule is a pure `&str → String` pass, so the same OCR
//! result always yields byte-identical Markdown.
//!
//! Rule order matters: fences are stripped before anything looks at lines,
//! line endings are normalised before trimming, and table repair runs after
//! blank-line handling so table blocks are contiguous.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all clean-up rules in order:
///
/// 1. Strip an outer ```` ```markdown ```` fence
/// 2. CRLF / CR → LF
/// 3. Trim trailing whitespace per line
/// 4. Collapse runs of blank lines to one
/// 5. Blank line around every ATX heading (outside code fences)
/// 6. Insert a missing header separator row in pipe tables
/// 7. Drop separator rows in table bodies
/// 8. Strip invisible Unicode (zero-width, BOM, soft hyphen)
/// 9. Exactly one trailing newline
pub fn clean_markdown(input: &str) -> String {
    let s = strip_markdown_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = space_headings(&s);
    let s = insert_missing_separators(&s);
    let s = drop_body_separators(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: outer fences ─────────────────────────────────────────────────

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?[ \t]*\r?\n(.*?)\r?\n```\s*$").unwrap());

/// Remove a fence wrapping the whole text; models add one despite being
/// told not to.
pub(crate) fn strip_markdown_fences(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rules 2-4: whitespace ────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_RUN.replace_all(input, "\n\n").into_owned()
}

// ── Rule 5: heading spacing ──────────────────────────────────────────────

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s+\S").unwrap());

fn space_headings(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut after_heading = false;

    for line in input.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        let is_heading = !in_fence && RE_HEADING.is_match(line);

        let needs_gap = (is_heading || after_heading) && !line.is_empty();
        if needs_gap && out.last().is_some_and(|prev| !prev.is_empty()) {
            out.push("");
        }
        out.push(line);
        after_heading = is_heading;
    }
    out.join("\n")
}

// ── Rules 6-7: pipe tables ───────────────────────────────────────────────

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|')
        && t.contains('-')
        && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn separator_for(header: &str) -> String {
    let cols = header.trim().matches('|').count().saturating_sub(1).max(1);
    let mut sep = String::from("|");
    for _ in 0..cols {
        sep.push_str(" --- |");
    }
    sep
}

fn insert_missing_separators(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 4);

    for (i, line) in lines.iter().enumerate() {
        out.push((*line).to_string());
        let starts_table = is_table_row(line)
            && !is_separator_row(line)
            && (i == 0 || !is_table_row(lines[i - 1]));
        if starts_table {
            if let Some(next) = lines.get(i + 1) {
                if is_table_row(next) && !is_separator_row(next) {
                    out.push(separator_for(line));
                }
            }
        }
    }
    out.join("\n")
}

fn drop_body_separators(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut row = 0usize;

    for line in input.lines() {
        if is_table_row(line) {
            row += 1;
            if is_separator_row(line) && row != 2 {
                continue;
            }
        } else {
            row = 0;
        }
        out.push(line);
    }
    out.join("\n")
}

// ── Rules 8-9 ────────────────────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{trimmed}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_outer_fence() {
        assert_eq!(strip_markdown_fences("```markdown\n# A\nb\n```"), "# A\nb");
        assert_eq!(strip_markdown_fences("```\n# A\n```\n"), "# A");
        assert_eq!(strip_markdown_fences("# A\nb"), "# A\nb");
    }

    #[test]
    fn inner_code_fences_survive() {
        let input = "Run:\n\n```\nsetup.exe /q\n```\n\nDone.";
        assert_eq!(strip_markdown_fences(input), input);
    }

    #[test]
    fn whitespace_rules() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
        assert_eq!(trim_trailing_whitespace("  a   \nb\t"), "  a\nb");
        assert_eq!(collapse_blank_lines("a\n\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn headings_get_blank_lines_around_them() {
        assert_eq!(
            space_headings("text\n## Install\nstep one"),
            "text\n\n## Install\n\nstep one"
        );
        assert_eq!(space_headings("# Title\n\nbody"), "# Title\n\nbody");
    }

    #[test]
    fn hash_lines_in_code_are_not_headings() {
        let input = "```\n# comment\nls\n```";
        assert_eq!(space_headings(input), input);
    }

    #[test]
    fn missing_separator_is_inserted_once() {
        let out = insert_missing_separators("| A | B |\n| 1 | 2 |\n| 3 | 4 |");
        assert_eq!(out, "| A | B |\n| --- | --- |\n| 1 | 2 |\n| 3 | 4 |");
        let ok = "| A | B |\n| --- | --- |\n| 1 | 2 |";
        assert_eq!(insert_missing_separators(ok), ok);
    }

    #[test]
    fn body_separators_are_dropped() {
        let out = drop_body_separators("| A |\n| --- |\n| 1 |\n| --- |\n| 2 |");
        assert_eq!(out, "| A |\n| --- |\n| 1 |\n| 2 |");
    }

    #[test]
    fn invisible_chars_and_final_newline() {
        assert_eq!(remove_invisible_chars("a\u{200B}b\u{FEFF}c\u{00AD}d"), "abcd");
        assert_eq!(ensure_final_newline("x\n\n\n"), "x\n");
        assert_eq!(ensure_final_newline(""), "\n");
    }

    #[test]
    fn full_pipeline_is_idempotent() {
        let input = "```markdown\n# Title\r\nSome text   \n\n\n\n## Section\n| A | B |\n| 1 | 2 |\n```";
        let once = clean_markdown(input);
        assert_eq!(
            once,
            "# Title\n\nSome text\n\n## Section\n\n| A | B |\n| --- | --- |\n| 1 | 2 |\n"
        );
        assert_eq!(clean_markdown(&once), once);
    }
}
