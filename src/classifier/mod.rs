//! Result classification for conversion responses
//!
//! The conversion service routinely answers `200 OK` with something that is not a
//! deliverable: an HTML error page, PHP warnings wrapped around a JSON document, or a
//! ZIP archive whose only entry is an error report. [`Classifier::classify`] looks at
//! status, headers and bytes and decides what actually came back.
//!
//! Rules, in priority order:
//! 1. `401` is an authentication error
//! 2. an empty body is reported as such (callers decide whether it is transient)
//! 3. magic numbers: `%PDF`, `PK` (archive is opened and enumerated), `<html`/`<!doctype`
//! 4. JSON documents and free text are scanned for backend leakage
//! 5. anything else is unknown content
//!
//! Classification never fails; every problem is expressed in the returned
//! [`VerificationResult`].

mod archive;
mod markers;
mod text;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use text::{find_leakage, normalize_lines, strip_ansi};

use crate::config::ClassifierConfig;
use crate::types::{ContentKind, FailureKind, VerificationResult};
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde_json::Value;
use tracing::debug;

use archive::inspect_archive;
use text::{excerpt, find_keyword};

/// Reason attached to every leaked backend failure
pub const SERVER_CONFIGURATION_REASON: &str = "server-side configuration error";

/// Outcome of the lightweight pre-check applied to JSON API responses
#[derive(Debug, Clone, PartialEq)]
pub enum JsonPrecheck {
    /// Nothing in the body
    Empty,
    /// The body carried leaked backend output outside the JSON document
    Leaked(String),
    /// A JSON document, plus leakage found in its `output` field, if any
    Json {
        /// Parsed document
        value: Value,
        /// Offending `output` line
        output_leak: Option<String>,
    },
    /// No JSON document could be found
    NotJson(String),
}

/// Classifies responses and downloads
#[derive(Debug, Clone)]
pub struct Classifier {
    expected_extension: String,
    failure_keywords: Vec<String>,
    leakage_patterns: Vec<String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

impl Classifier {
    /// Build a classifier from configuration, merging extra keywords into the built-in lists
    pub fn new(config: &ClassifierConfig) -> Self {
        let expected_extension = config
            .expected_extension
            .trim_start_matches('.')
            .to_lowercase();
        let failure_keywords = markers::FAILURE_KEYWORDS
            .iter()
            .map(|k| k.to_string())
            .chain(config.extra_failure_keywords.iter().map(|k| k.to_lowercase()))
            .collect();
        let leakage_patterns = markers::LEAKAGE_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(config.extra_leakage_patterns.iter().map(|p| p.to_lowercase()))
            .collect();
        Self {
            expected_extension,
            failure_keywords,
            leakage_patterns,
        }
    }

    /// Classify a response body
    pub fn classify(
        &self,
        status_code: u16,
        headers: &HeaderMap,
        body: &[u8],
        final_url: &str,
    ) -> VerificationResult {
        let verdict = self.classify_inner(status_code, headers, body);
        debug!(
            status_code,
            url = final_url,
            bytes = body.len(),
            kind = ?verdict.kind,
            valid = verdict.valid,
            reason = %verdict.reason,
            "classified response"
        );
        verdict
    }

    fn classify_inner(&self, status_code: u16, headers: &HeaderMap, body: &[u8]) -> VerificationResult {
        if status_code == 401 {
            return VerificationResult::invalid(ContentKind::Unknown, "authentication error")
                .with_failure(FailureKind::Authentication);
        }

        if body.is_empty() {
            return VerificationResult::invalid(ContentKind::Unknown, "empty response");
        }

        if body.starts_with(b"%PDF") {
            return self.classify_pdf(body);
        }
        if body.starts_with(b"PK") {
            return self.classify_zip(body);
        }

        let text = String::from_utf8_lossy(body);
        let trimmed = text.trim_start_matches('\u{feff}').trim_start();
        let head = trimmed.chars().take(16).collect::<String>().to_lowercase();
        if head.starts_with("<html") || head.starts_with("<!doctype") {
            return self.classify_html(trimmed);
        }

        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && let Ok(value) = serde_json::from_str::<Value>(trimmed)
        {
            return self.classify_json(&value);
        }

        if let Some(line) = find_leakage(&text, &self.leakage_patterns) {
            return server_configuration(ContentKind::Unknown, &line);
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none");
        VerificationResult::invalid(
            ContentKind::Unknown,
            format!("unrecognised content (content-type: {content_type}, status {status_code})"),
        )
    }

    fn classify_pdf(&self, body: &[u8]) -> VerificationResult {
        for marker in markers::PDF_ERROR_MARKERS {
            if contains_bytes(body, marker.as_bytes()) {
                return VerificationResult::invalid(
                    ContentKind::Pdf,
                    format!("PDF contains an in-band error marker ({marker})"),
                );
            }
        }
        VerificationResult::valid(ContentKind::Pdf, "PDF document")
    }

    fn classify_zip(&self, body: &[u8]) -> VerificationResult {
        let summary = match inspect_archive(body, &self.expected_extension, &self.failure_keywords) {
            Ok(summary) => summary,
            Err(e) => {
                return VerificationResult::invalid(ContentKind::Zip, format!("corrupt archive: {e}"));
            }
        };

        if !summary.deliverables.is_empty() {
            return VerificationResult::valid(
                ContentKind::Zip,
                format!(
                    "archive contains {} valid .{} file(s)",
                    summary.deliverables.len(),
                    self.expected_extension
                ),
            );
        }

        if let Some(entry) = summary.error_entries.first() {
            return VerificationResult::invalid(
                ContentKind::Zip,
                format!(
                    "archive contains an embedded error page ({}: \"{}\")",
                    entry.name, entry.keyword
                ),
            );
        }

        VerificationResult::invalid(
            ContentKind::Zip,
            format!(
                "archive missing expected deliverable (.{} not found in {} file(s))",
                self.expected_extension, summary.file_count
            ),
        )
    }

    fn classify_html(&self, page: &str) -> VerificationResult {
        if let Some(line) = find_leakage(page, &self.leakage_patterns) {
            return server_configuration(ContentKind::Html, &line);
        }
        match find_keyword(page, &self.failure_keywords) {
            Some(keyword) => VerificationResult::invalid(
                ContentKind::Html,
                format!("HTML error page returned (\"{keyword}\")"),
            ),
            None => VerificationResult::invalid(ContentKind::Html, "unexpected HTML response"),
        }
    }

    fn classify_json(&self, value: &Value) -> VerificationResult {
        if let Some(output) = value.get("output") {
            let joined = normalize_lines(output).join("\n");
            if let Some(line) = find_leakage(&joined, &self.leakage_patterns) {
                return server_configuration(ContentKind::Json, &line);
            }
        }
        let message = value
            .get("error")
            .or_else(|| value.get("message"))
            .map(|v| normalize_lines(v).join(" "))
            .filter(|m| !m.is_empty());
        match message {
            Some(message) => VerificationResult::invalid(
                ContentKind::Json,
                format!("JSON error response: {}", excerpt(&message, 200)),
            ),
            None => VerificationResult::invalid(ContentKind::Json, "unexpected JSON response"),
        }
    }

    /// Scan free text for backend leakage
    pub fn detect_leakage(&self, text: &str) -> Option<String> {
        find_leakage(text, &self.leakage_patterns)
    }

    /// Pre-check a JSON API response before any field in it is trusted
    ///
    /// The backend is known to print PHP warnings ahead of an otherwise valid JSON
    /// document, and to copy internal failures into the `output` field.
    pub fn precheck_json(&self, raw: &str) -> JsonPrecheck {
        let trimmed = raw.trim_start_matches('\u{feff}').trim();
        if trimmed.is_empty() {
            return JsonPrecheck::Empty;
        }

        let Some(start) = trimmed.find('{') else {
            return match self.detect_leakage(trimmed) {
                Some(line) => JsonPrecheck::Leaked(line),
                None => JsonPrecheck::NotJson(excerpt(trimmed, 200)),
            };
        };

        let mut stream = serde_json::Deserializer::from_str(&trimmed[start..]).into_iter::<Value>();
        let value = match stream.next() {
            Some(Ok(value)) => value,
            _ => {
                return match self.detect_leakage(trimmed) {
                    Some(line) => JsonPrecheck::Leaked(line),
                    None => JsonPrecheck::NotJson(excerpt(trimmed, 200)),
                };
            }
        };
        let end = start + stream.byte_offset();

        let surrounding = format!("{}\n{}", &trimmed[..start], &trimmed[end..]);
        if !surrounding.trim().is_empty() {
            let line = self
                .detect_leakage(&surrounding)
                .unwrap_or_else(|| excerpt(surrounding.trim(), 200));
            return JsonPrecheck::Leaked(line);
        }

        let output_leak = value
            .get("output")
            .map(|output| normalize_lines(output).join("\n"))
            .and_then(|joined| self.detect_leakage(&joined));
        JsonPrecheck::Json { value, output_leak }
    }
}

/// Classify with the default configuration
pub fn classify(
    status_code: u16,
    headers: &HeaderMap,
    body: &[u8],
    final_url: &str,
) -> VerificationResult {
    Classifier::default().classify(status_code, headers, body, final_url)
}

/// Scan free text for backend leakage with the built-in patterns
pub fn detect_backend_leakage(text: &str) -> Option<String> {
    find_leakage(text, markers::LEAKAGE_PATTERNS)
}

fn server_configuration(kind: ContentKind, line: &str) -> VerificationResult {
    VerificationResult::invalid(
        kind,
        format!("{SERVER_CONFIGURATION_REASON}: {}", excerpt(line, 120)),
    )
    .with_failure(FailureKind::ServerConfiguration)
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
