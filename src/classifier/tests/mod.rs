use crate::classifier::*;
use crate::config::ClassifierConfig;
use crate::types::{ContentKind, FailureKind};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use std::io::{Cursor, Write};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a ZIP archive in memory from (name, content) pairs
fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ::zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        ::zip::write::FileOptions::default().compression_method(::zip::CompressionMethod::Stored);
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn pdf_bytes(body: &str) -> Vec<u8> {
    format!("%PDF-1.7\n1 0 obj\n<< /Type /Catalog >>\nendobj\n{body}\n%%EOF\n").into_bytes()
}

fn no_headers() -> HeaderMap {
    HeaderMap::new()
}

fn classify_body(body: &[u8]) -> crate::types::VerificationResult {
    classify(200, &no_headers(), body, "https://convert.example.com/dl/1")
}

// ---------------------------------------------------------------------------
// Rule 1 and 2
// ---------------------------------------------------------------------------

#[test]
fn status_401_is_an_authentication_error_even_with_a_pdf_body() {
    let verdict = classify(401, &no_headers(), &pdf_bytes(""), "https://x/y");

    assert!(!verdict.valid);
    assert_eq!(verdict.reason, "authentication error");
    assert_eq!(verdict.failure, Some(FailureKind::Authentication));
}

#[test]
fn empty_body_is_reported_as_empty_response() {
    let verdict = classify_body(b"");

    assert!(!verdict.valid);
    assert_eq!(verdict.reason, "empty response");
    assert_eq!(verdict.kind, ContentKind::Unknown);
}

// ---------------------------------------------------------------------------
// PDF
// ---------------------------------------------------------------------------

#[test]
fn valid_pdf_bytes_are_accepted() {
    for body in ["", "stream\nBT /F1 12 Tf (Hello) Tj ET\nendstream", "trailer << >>"] {
        let verdict = classify_body(&pdf_bytes(body));
        assert!(verdict.valid, "PDF with body {body:?} should be valid");
        assert_eq!(verdict.kind, ContentKind::Pdf);
        assert!(verdict.failure.is_none());
    }
}

#[test]
fn pdf_with_binary_payload_is_accepted() {
    let mut body = b"%PDF-1.4\n".to_vec();
    body.extend((0u8..=255).cycle().take(4096));
    let verdict = classify_body(&body);
    assert!(verdict.valid);
    assert_eq!(verdict.kind, ContentKind::Pdf);
}

#[test]
fn pdf_with_in_band_error_marker_is_rejected() {
    let verdict = classify_body(&pdf_bytes("ファイルの作成に失敗しました"));

    assert!(!verdict.valid);
    assert_eq!(verdict.kind, ContentKind::Pdf);
    assert!(verdict.reason.contains("in-band error marker"));
}

// ---------------------------------------------------------------------------
// ZIP
// ---------------------------------------------------------------------------

#[test]
fn zip_with_a_pdf_entry_is_valid_and_counts_entries() {
    let body = zip_bytes(&[
        ("book/chapter1.pdf", &pdf_bytes("")),
        ("book/chapter2.PDF", &pdf_bytes("")),
        ("book/log.txt", b"done"),
    ]);

    let verdict = classify_body(&body);

    assert!(verdict.valid);
    assert_eq!(verdict.kind, ContentKind::Zip);
    assert!(
        verdict.reason.contains("2 valid .pdf"),
        "reason should cite the count: {}",
        verdict.reason
    );
}

#[test]
fn zip_with_pdf_wins_over_an_error_page_next_to_it() {
    let body = zip_bytes(&[
        ("report.html", b"<html><body>error</body></html>"),
        ("book.pdf", &pdf_bytes("")),
    ]);

    assert!(classify_body(&body).valid);
}

#[test]
fn zip_with_only_a_failure_html_entry_is_invalid() {
    for keyword in ["File creation failed", "Fatal ERROR occurred", "エラーが発生しました"] {
        let page = format!("<html><body><p>{keyword}</p></body></html>");
        let body = zip_bytes(&[("index.html", page.as_bytes())]);

        let verdict = classify_body(&body);

        assert!(!verdict.valid, "{keyword} should invalidate the archive");
        assert_eq!(verdict.kind, ContentKind::Zip);
    }
}

#[test]
fn zip_with_japanese_error_report_and_no_pdf_mentions_embedded_error_page() {
    let page = "<html><body>ファイルの作成に失敗しました</body></html>";
    let body = zip_bytes(&[("report.html", page.as_bytes())]);

    let verdict = classify_body(&body);

    assert!(!verdict.valid);
    assert!(
        verdict.reason.contains("embedded error page"),
        "got: {}",
        verdict.reason
    );
    assert!(verdict.reason.contains("report.html"));
}

#[test]
fn html_entry_detected_by_content_when_extension_is_unusual() {
    let body = zip_bytes(&[("result.dat", b"<!DOCTYPE html><p>conversion failed</p>")]);

    let verdict = classify_body(&body);

    assert!(verdict.reason.contains("embedded error page"));
}

#[test]
fn zip_without_deliverable_or_error_is_missing_deliverable() {
    let body = zip_bytes(&[("book.epub", b"PK-not-really"), ("notes.txt", b"all good")]);

    let verdict = classify_body(&body);

    assert!(!verdict.valid);
    assert!(verdict.reason.contains("archive missing expected deliverable"));
}

#[test]
fn truncated_zip_is_reported_as_corrupt() {
    let mut body = zip_bytes(&[("book.pdf", &pdf_bytes(""))]);
    body.truncate(20);

    let verdict = classify_body(&body);

    assert!(!verdict.valid);
    assert_eq!(verdict.kind, ContentKind::Zip);
    assert!(verdict.reason.starts_with("corrupt archive"));
}

#[test]
fn expected_extension_is_configurable() {
    let classifier = Classifier::new(&ClassifierConfig {
        expected_extension: ".epub".into(),
        ..Default::default()
    });
    let body = zip_bytes(&[("book.epub", b"epub content")]);

    let verdict = classifier.classify(200, &no_headers(), &body, "u");

    assert!(verdict.valid);
    assert!(verdict.reason.contains(".epub"));
}

// ---------------------------------------------------------------------------
// HTML
// ---------------------------------------------------------------------------

#[test]
fn html_page_is_never_a_deliverable() {
    let verdict = classify_body(b"<html><body>Welcome</body></html>");

    assert!(!verdict.valid);
    assert_eq!(verdict.kind, ContentKind::Html);
    assert_eq!(verdict.reason, "unexpected HTML response");
}

#[test]
fn html_with_failure_keyword_gets_specific_reason() {
    let verdict = classify_body(b"\xef\xbb\xbf  <!DOCTYPE html><h1>File creation failed</h1>");

    assert_eq!(verdict.kind, ContentKind::Html);
    assert!(verdict.reason.contains("file creation failed"), "{}", verdict.reason);
}

#[test]
fn html_with_php_warning_is_server_configuration_error() {
    let page = b"<html><b>Warning</b>:  include(application/errors/error.php) on line 3</html>";

    let verdict = classify_body(page);

    assert_eq!(verdict.failure, Some(FailureKind::ServerConfiguration));
    assert!(verdict.reason.starts_with(SERVER_CONFIGURATION_REASON));
}

// ---------------------------------------------------------------------------
// JSON and default
// ---------------------------------------------------------------------------

#[test]
fn json_output_leakage_is_server_configuration_error() {
    let body = br#"{"status":"completed","result":"failure","output":"Warning: include(application/errors/error.php)"}"#;

    let verdict = classify_body(body);

    assert_eq!(verdict.kind, ContentKind::Json);
    assert_eq!(verdict.failure, Some(FailureKind::ServerConfiguration));
}

#[test]
fn json_error_message_is_surfaced() {
    let verdict = classify_body(br#"{"error": "job not found"}"#);

    assert_eq!(verdict.kind, ContentKind::Json);
    assert!(verdict.reason.contains("job not found"));
    assert_eq!(verdict.failure, Some(FailureKind::ContentMismatch));
}

#[test]
fn unknown_content_reports_content_type() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));

    let verdict = classify(200, &headers, b"\x00\x01binary", "https://x/y");

    assert_eq!(verdict.kind, ContentKind::Unknown);
    assert!(!verdict.valid);
    assert!(verdict.reason.contains("application/octet-stream"));
}

#[test]
fn plain_text_php_fatal_error_is_server_configuration_error() {
    let verdict = classify_body(b"PHP Fatal error:  Allowed memory size exhausted");
    assert_eq!(verdict.failure, Some(FailureKind::ServerConfiguration));
}

// ---------------------------------------------------------------------------
// JSON pre-check
// ---------------------------------------------------------------------------

#[test]
fn precheck_accepts_clean_json() {
    let classifier = Classifier::default();
    match classifier.precheck_json(r#"{"jobid": "123"}"#) {
        JsonPrecheck::Json { value, output_leak } => {
            assert_eq!(value["jobid"], "123");
            assert!(output_leak.is_none());
        }
        other => panic!("unexpected precheck result: {other:?}"),
    }
}

#[test]
fn precheck_flags_php_warning_before_json() {
    let raw = "<br />\n<b>Warning</b>:  Undefined index: files in /var/www/upload.php on line 9<br />\n{\"jobid\": \"123\"}";

    match Classifier::default().precheck_json(raw) {
        JsonPrecheck::Leaked(line) => assert!(line.contains("Warning")),
        other => panic!("expected leak, got {other:?}"),
    }
}

#[test]
fn precheck_flags_trailing_garbage_after_json() {
    let raw = "{\"jobid\": \"1\"}\nNotice: Undefined variable: user";
    assert!(matches!(
        Classifier::default().precheck_json(raw),
        JsonPrecheck::Leaked(_)
    ));
}

#[test]
fn precheck_reports_output_leak_inside_json() {
    let raw = r#"{"status":"completed","result":"failure","output":["ok","Warning: include(application/errors/error.php)"]}"#;

    match Classifier::default().precheck_json(raw) {
        JsonPrecheck::Json { output_leak, .. } => {
            assert!(output_leak.unwrap().contains("include("));
        }
        other => panic!("unexpected precheck result: {other:?}"),
    }
}

#[test]
fn precheck_distinguishes_empty_and_non_json() {
    let classifier = Classifier::default();
    assert_eq!(classifier.precheck_json("   \n"), JsonPrecheck::Empty);
    assert!(matches!(
        classifier.precheck_json("Service Unavailable"),
        JsonPrecheck::NotJson(_)
    ));
}

#[test]
fn extra_leakage_patterns_are_honoured() {
    let classifier = Classifier::new(&ClassifierConfig {
        extra_leakage_patterns: vec!["Font Cache Corrupt".into()],
        ..Default::default()
    });
    assert!(classifier.detect_leakage("fatal: font cache corrupt").is_some());
    assert!(Classifier::default()
        .detect_leakage("fatal: font cache corrupt")
        .is_none());
}

#[test]
fn detect_backend_leakage_returns_the_offending_line() {
    let text = "ok\n  Warning: include(application/errors/error.php): failed to open stream\ndone";
    let line = detect_backend_leakage(text).unwrap();
    assert!(line.starts_with("Warning: include("), "{line}");

    assert!(detect_backend_leakage("conversion finished\n3 pages").is_none());
}
