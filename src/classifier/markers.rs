//! Built-in marker lists used to spot disguised errors.
//!
//! All entries are lowercase; callers lowercase the text they match against.

/// Phrases that mark a page or archive entry as a failure report
pub(crate) const FAILURE_KEYWORDS: &[&str] = &[
    "file creation failed",
    "conversion failed",
    "ファイルの作成に失敗しました",
    "変換に失敗しました",
    "作成に失敗",
    "エラー",
    "error",
];

/// Substrings that only appear when the backend leaks an internal failure
///
/// PHP/framework warning prefixes, stack-trace headers and the failure lines of
/// the backend's own build stages.
pub(crate) const LEAKAGE_PATTERNS: &[&str] = &[
    "warning: include(",
    "warning: require(",
    "warning: include_once(",
    "warning: require_once(",
    "<b>warning</b>:",
    "<b>fatal error</b>:",
    "<b>parse error</b>:",
    "php warning:",
    "php fatal error:",
    "php notice:",
    "php parse error:",
    "fatal error: uncaught",
    "notice: undefined",
    "application/errors/",
    "stack trace:",
    "traceback (most recent call last)",
    "sqlstate[",
    "! latex error",
    "review-pdfmaker: error",
    "command not found",
];

/// In-band markers that disqualify a body that otherwise starts with `%PDF`
pub(crate) const PDF_ERROR_MARKERS: &[&str] = &[
    "ファイルの作成に失敗しました",
    "file creation failed",
    "<b>fatal error</b>",
    "<b>warning</b>:",
];

/// Archive entry extensions treated as text worth scanning for failure keywords
pub(crate) const TEXT_ENTRY_EXTENSIONS: &[&str] = &["html", "htm", "xhtml", "txt", "log"];
