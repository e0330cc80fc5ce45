//! Result URL and source filename extraction from notification bodies.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use url::Url;

use crate::config::UrlSelectionPolicy;
use crate::types::{EmailNotification, UrlKind};

/// Filename reported when no pattern finds one
pub const FALLBACK_FILENAME: &str = "unknown";

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '。', '、'];

#[allow(clippy::expect_used)]
fn url_regex() -> &'static Regex {
    static URL: OnceLock<Regex> = OnceLock::new();
    URL.get_or_init(|| {
        Regex::new(r#"https?://[^\s<>"'()\[\]「」]+"#).expect("URL pattern is valid")
    })
}

/// Filename patterns, most specific first
#[allow(clippy::expect_used)]
fn filename_regexes() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // "File: A001.zip", "ファイル名：A001.zip"
            r#"(?im)^[ \t]*(?:file[ \t]*name|source[ \t]*file|file|ファイル名|ファイル|元ファイル)[ \t]*[:：][ \t]*([^\s"'<>]+)"#,
            // 「A001.zip」, "A001.zip"
            r#"(?i)["「『]([^\s"」』]+\.(?:zip|pdf|epub|re|md|txt|docx?))["」』]"#,
            // any bare archive name
            r"(?i)([\w\-.]+\.zip)\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("filename pattern is valid"))
        .collect()
    })
}

fn clean_url(raw: &str) -> String {
    raw.trim_end_matches(TRAILING_PUNCTUATION)
        .replace("&amp;", "&")
}

/// Which kind of result a URL points at
///
/// Only the path and query are inspected, so a host named `zip.example.com` does
/// not make every link a bundle.
pub fn classify_url(url: &str) -> Option<UrlKind> {
    let parsed = Url::parse(url).ok()?;
    let target = format!("{}?{}", parsed.path(), parsed.query().unwrap_or("")).to_lowercase();

    if [".zip", "type=zip", "format=zip", "/zip"]
        .iter()
        .any(|m| target.contains(m))
    {
        Some(UrlKind::Zip)
    } else if [".pdf", "type=pdf", "format=pdf", "/pdf"]
        .iter()
        .any(|m| target.contains(m))
    {
        Some(UrlKind::Pdf)
    } else {
        None
    }
}

/// Collect result URLs by kind
///
/// When a body carries several URLs of the same kind, `policy` picks one.
pub fn extract_urls(body: &str, policy: UrlSelectionPolicy) -> BTreeMap<UrlKind, String> {
    let mut urls = BTreeMap::new();
    for found in url_regex().find_iter(body) {
        let url = clean_url(found.as_str());
        let Some(kind) = classify_url(&url) else {
            continue;
        };
        match policy {
            UrlSelectionPolicy::First => {
                urls.entry(kind).or_insert(url);
            }
            UrlSelectionPolicy::Last => {
                urls.insert(kind, url);
            }
        }
    }
    urls
}

/// Best-effort source filename
pub fn extract_filename(body: &str) -> Option<String> {
    let without_urls = url_regex().replace_all(body, " ");
    filename_regexes().iter().find_map(|pattern| {
        pattern
            .captures(&without_urls)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim_end_matches(TRAILING_PUNCTUATION).to_string())
            .filter(|name| !name.is_empty())
    })
}

/// Fill the extracted fields of a fetched notification
pub(crate) fn populate(notification: &mut EmailNotification, policy: UrlSelectionPolicy) {
    notification.extracted_urls = extract_urls(&notification.raw_body, policy);
    notification.extracted_filename = extract_filename(&notification.raw_body);
}
