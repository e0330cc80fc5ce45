//! In-memory inspection of ZIP deliverables.

use std::io::{Cursor, Read};
use std::path::Path;
use tracing::debug;

use super::markers::TEXT_ENTRY_EXTENSIONS;
use super::text::find_keyword;

/// Bytes read from a text entry when scanning for failure keywords
const TEXT_SCAN_LIMIT: u64 = 256 * 1024;

/// An entry that reads like a failure report
#[derive(Debug, Clone)]
pub(crate) struct ErrorEntry {
    pub(crate) name: String,
    pub(crate) keyword: String,
}

/// What the archive holds
#[derive(Debug, Default)]
pub(crate) struct ArchiveSummary {
    /// Entries with the expected deliverable extension
    pub(crate) deliverables: Vec<String>,
    /// Text/HTML entries containing a failure keyword
    pub(crate) error_entries: Vec<ErrorEntry>,
    /// Number of file entries
    pub(crate) file_count: usize,
}

fn entry_extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

fn looks_like_html(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    let lower = text.trim_start_matches('\u{feff}').trim_start().to_lowercase();
    lower.starts_with("<html") || lower.starts_with("<!doctype")
}

/// Enumerate the archive entries
///
/// `expected_extension` is lowercase without the dot; `keywords` are lowercase.
pub(crate) fn inspect_archive<S: AsRef<str>>(
    body: &[u8],
    expected_extension: &str,
    keywords: &[S],
) -> zip::result::ZipResult<ArchiveSummary> {
    let mut archive = zip::ZipArchive::new(Cursor::new(body))?;
    let mut summary = ArchiveSummary::default();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        summary.file_count += 1;
        let name = entry.name().to_string();
        let extension = entry_extension(&name);

        if extension.as_deref() == Some(expected_extension) {
            summary.deliverables.push(name);
            continue;
        }

        let mut content = Vec::new();
        (&mut entry).take(TEXT_SCAN_LIMIT).read_to_end(&mut content)?;

        let is_text = extension
            .as_deref()
            .is_some_and(|ext| TEXT_ENTRY_EXTENSIONS.contains(&ext))
            || looks_like_html(&content);
        if !is_text {
            debug!(entry = %name, "skipping binary archive entry");
            continue;
        }

        let text = String::from_utf8_lossy(&content);
        if let Some(keyword) = find_keyword(&text, keywords) {
            debug!(entry = %name, keyword, "archive entry reads like an error page");
            summary.error_entries.push(ErrorEntry {
                name,
                keyword: keyword.to_string(),
            });
        }
    }

    Ok(summary)
}
