//! Post-processing: deterministic cleanup of engine-generated Markdown.
//!
//! Each unit's fragment passes through these rules before it is stored in a
//! [`UnitResult`](crate::output::UnitResult), so the merge step and table
//! extraction both see normalised text.
//!
//! ## Rule Order
//!
//! Normalise line endings before anything that splits on `\n`, strip fences
//! before trimming so the fence regex sees the raw fragment, and drop image
//! links before collapsing blank lines since removal can leave empty lines
//! behind.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to one unit's raw engine output.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip outer markdown fences
/// 3. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 4. Trim trailing whitespace per line
/// 5. Drop links to engine scratch images
/// 6. Collapse 3+ consecutive blank lines down to 1
/// 7. Ensure the fragment ends with exactly one newline
pub fn clean_fragment(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_markdown_fences(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = remove_local_images(&s);
    let s = collapse_blank_lines(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\n(.*)\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 3: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Remove links to engine-extracted images ─────────────────────────
//
// The engine writes figures next to its Markdown (`_page_0_Picture_1.jpeg`)
// and links them relatively. Those files live in a scratch directory that is
// deleted after the unit completes, so relative links would dangle. Remote
// links are left alone. A link that was the only thing on its line takes the
// line with it.

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

fn is_remote(url: &str) -> bool {
    let u = url.trim();
    u.starts_with("http://") || u.starts_with("https://") || u.starts_with("data:")
}

fn remove_local_images(input: &str) -> String {
    input
        .lines()
        .filter_map(|line| {
            if !RE_IMAGE.is_match(line) {
                return Some(line.to_string());
            }
            let replaced = RE_IMAGE
                .replace_all(line, |caps: &regex::Captures<'_>| {
                    if is_remote(&caps[2]) {
                        caps[0].to_string()
                    } else {
                        String::new()
                    }
                })
                .to_string();
            if replaced.trim().is_empty() {
                None
            } else {
                Some(replaced.trim_end().to_string())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 6: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 7: Ensure fragment ends with single newline ─────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
