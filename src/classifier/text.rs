//! Text helpers shared by the classifier and the status poller.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

#[allow(clippy::expect_used)]
fn ansi_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    // CSI sequences (colours, cursor moves) and OSC sequences (titles, links)
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("ANSI pattern is valid")
    })
}

#[allow(clippy::expect_used)]
fn php_frame_regex() -> &'static Regex {
    static FRAME: OnceLock<Regex> = OnceLock::new();
    FRAME.get_or_init(|| {
        Regex::new(r"(?m)^#\d+ (?:/|\{main\})").expect("stack frame pattern is valid")
    })
}

/// Remove terminal control sequences
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

/// Normalise a warnings/output field into ordered, trimmed, non-empty lines
///
/// The backend sends these either as a single string (possibly multi-line) or as a
/// list of strings. Nested lists are flattened in order; non-string scalars are
/// rendered with their JSON text.
pub fn normalize_lines(value: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    collect_lines(value, &mut lines);
    lines
}

fn collect_lines(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::String(s) => push_text(s, out),
        Value::Array(items) => {
            for item in items {
                collect_lines(item, out);
            }
        }
        Value::Bool(_) | Value::Number(_) => push_text(&value.to_string(), out),
        Value::Object(_) => push_text(&value.to_string(), out),
    }
}

fn push_text(text: &str, out: &mut Vec<String>) {
    let cleaned = strip_ansi(text);
    out.extend(
        cleaned
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string),
    );
}

/// Find the first line that reveals an internal backend failure
///
/// `patterns` must be lowercase. Returns the offending line, trimmed.
pub fn find_leakage<S: AsRef<str>>(text: &str, patterns: &[S]) -> Option<String> {
    let cleaned = strip_ansi(text);
    for line in cleaned.lines() {
        let lower = line.to_lowercase();
        if patterns.iter().any(|p| {
            let p: &str = p.as_ref();
            lower.contains(p)
        }) {
            return Some(line.trim().to_string());
        }
    }
    php_frame_regex()
        .find(&cleaned)
        .map(|m| cleaned[m.start()..].lines().next().unwrap_or("").trim().to_string())
}

/// Find the first keyword contained in `text` (case-insensitive)
pub(crate) fn find_keyword<'a, S: AsRef<str>>(text: &str, keywords: &'a [S]) -> Option<&'a str> {
    let lower = text.to_lowercase();
    keywords
        .iter()
        .map(|k| -> &'a str { k.as_ref() })
        .find(|k| lower.contains(*k))
}

/// Truncate a line for use inside a reason string
pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push('…');
    }
    out
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::markers::LEAKAGE_PATTERNS;
    use serde_json::json;

    #[test]
    fn strip_ansi_removes_colour_and_cursor_codes() {
        let raw = "\x1b[31mERROR\x1b[0m: build \x1b[1;33mfailed\x1b[K";
        assert_eq!(strip_ansi(raw), "ERROR: build failed");
    }

    #[test]
    fn strip_ansi_removes_osc_title_sequences() {
        assert_eq!(strip_ansi("\x1b]0;title\x07done"), "done");
    }

    #[test]
    fn normalize_lines_splits_single_string() {
        let lines = normalize_lines(&json!("  first\n\n second  \r\nthird"));
        assert_eq!(lines, ["first", "second", "third"]);
    }

    #[test]
    fn normalize_lines_flattens_lists_in_order() {
        let lines = normalize_lines(&json!(["a", "", ["b\nc"], "  d "]));
        assert_eq!(lines, ["a", "b", "c", "d"]);
    }

    #[test]
    fn normalize_lines_handles_null_and_empty_list() {
        assert!(normalize_lines(&json!(null)).is_empty());
        assert!(normalize_lines(&json!([])).is_empty());
    }

    #[test]
    fn normalize_lines_strips_ansi_before_trimming() {
        let lines = normalize_lines(&json!(["\x1b[33m  warn: font missing \x1b[0m"]));
        assert_eq!(lines, ["warn: font missing"]);
    }

    #[test]
    fn find_leakage_detects_php_include_warning() {
        let found = find_leakage(
            "Warning: include(application/errors/error.php): failed to open stream",
            LEAKAGE_PATTERNS,
        );
        assert!(found.unwrap().starts_with("Warning: include("));
    }

    #[test]
    fn find_leakage_detects_php_stack_frames() {
        let text = "something broke\n#0 /var/www/app/index.php(12): run()\n#1 {main}";
        let found = find_leakage(text, LEAKAGE_PATTERNS).unwrap();
        assert!(found.starts_with("#0 /var/www"));
    }

    #[test]
    fn find_leakage_ignores_ordinary_build_output() {
        let text = "compiling chapter 1\nwriting book.pdf\n3 pages";
        assert!(find_leakage(text, LEAKAGE_PATTERNS).is_none());
    }

    #[test]
    fn excerpt_truncates_on_char_boundaries() {
        assert_eq!(excerpt("ファイルの作成", 3), "ファイ…");
        assert_eq!(excerpt("short", 10), "short");
    }
}
