use std::sync::LazyLock;

use regex::Regex;

use crate::types::Record;

const MAX_OUTLINE_LINES: usize = 12;
const MAX_OUTLINE_CHARS: usize = 600;
const MAX_LINE_CHARS: usize = 120;

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s{0,3}#{1,6}\s+(.+?)\s*#*\s*$").expect("valid regex"));
static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*+]|\d{1,3}[.)])\s+(.+)$").expect("valid regex"));
static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?](\s|$)").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Builds the short structural summary used for comparison instead of the raw
/// body: a `[category] title` line followed by headings, list items and the
/// first sentence of each paragraph.
pub fn structural_outline(record: &Record) -> String {
    let mut lines = vec![format!(
        "[{}] {}",
        record.category,
        squash(&record.title)
    )];

    let mut in_paragraph = false;
    let mut in_code = false;
    for raw in record.body.lines() {
        if raw.trim_start().starts_with("```") {
            in_code = !in_code;
            continue;
        }
        if in_code {
            continue;
        }
        let line = raw.trim();
        if line.is_empty() {
            in_paragraph = false;
            continue;
        }

        if let Some(caps) = HEADING.captures(raw) {
            lines.push(format!("# {}", squash(&caps[1])));
            in_paragraph = false;
        } else if let Some(caps) = LIST_ITEM.captures(raw) {
            lines.push(format!("- {}", first_sentence(&caps[1])));
            in_paragraph = false;
        } else if !in_paragraph {
            lines.push(first_sentence(line));
            in_paragraph = true;
        }

        if lines.len() >= MAX_OUTLINE_LINES {
            break;
        }
    }

    clip(&lines.join("\n"), MAX_OUTLINE_CHARS)
}

fn first_sentence(text: &str) -> String {
    let text = squash(text);
    let end = SENTENCE_END
        .find(&text)
        .map(|m| m.start() + 1)
        .unwrap_or(text.len());
    clip(&text[..end], MAX_LINE_CHARS)
}

fn squash(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}
