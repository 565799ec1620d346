//! Post-processing: deterministic cleanup of the model's persona report.
//!
//! The report is written to disk verbatim apart from these cosmetic passes,
//! which fix formatting quirks vision models show regardless of prompting
//! (an outer ```` ```markdown ```` fence, CRLF line endings, zero-width
//! characters copied off the rendered page). No pass touches the wording.
//!
//! Passes run in a fixed order: fences are stripped on the raw text, line
//! endings are normalised before any line-based pass, and the final-newline
//! pass runs last.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every cleanup pass to raw model output.
pub fn clean_markdown(input: &str) -> String {
    let s = strip_outer_fence(input);
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s = remove_invisible_chars(&s);
    let s = trim_line_ends(&s);
    let s = collapse_blank_runs(&s);
    ensure_final_newline(&s)
}

// ── Outer fence ──────────────────────────────────────────────────────────

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?[ \t]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Whitespace ───────────────────────────────────────────────────────────

fn trim_line_ends(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// At most one empty line between blocks.
fn collapse_blank_runs(input: &str) -> String {
    RE_BLANK_RUN.replace_all(input, "\n\n").into_owned()
}

fn ensure_final_newline(input: &str) -> String {
    let body = input.trim_matches('\n').trim_end();
    if body.is_empty() {
        String::from("\n")
    } else {
        format!("{body}\n")
    }
}

// ── Invisible characters ─────────────────────────────────────────────────

/// Zero-width space/joiners, BOM, soft hyphen and word joiner.
fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' | '\u{00AD}' | '\u{2060}'
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_fence() {
        let raw = "```markdown\n# Persona\n\nCurious engineers.\n```";
        assert_eq!(clean_markdown(raw), "# Persona\n\nCurious engineers.\n");
    }

    #[test]
    fn inner_code_blocks_survive() {
        let raw = "# Persona\n\n```\nnot an outer fence\n```\n\nMore text";
        assert!(clean_markdown(raw).contains("```\nnot an outer fence\n```"));
    }

    #[test]
    fn normalises_crlf_and_trailing_space() {
        assert_eq!(clean_markdown("a  \r\nb\t\r\n"), "a\nb\n");
    }

    #[test]
    fn collapses_blank_runs() {
        assert_eq!(clean_markdown("a\n\n\n\n\nb"), "a\n\nb\n");
    }

    #[test]
    fn removes_zero_width_chars() {
        assert_eq!(clean_markdown("\u{FEFF}Tech\u{200B} fans"), "Tech fans\n");
    }

    #[test]
    fn empty_input_is_single_newline() {
        assert_eq!(clean_markdown("  \n\n "), "\n");
    }

    #[test]
    fn idempotent() {
        let once = clean_markdown("```md\n## Audience  \n\n\n\n- a\n```\n");
        assert_eq!(clean_markdown(&once), once);
    }
}
