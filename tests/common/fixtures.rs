//! Deliverable, notification and mock-backend fixtures

use chrono::{DateTime, Utc};
use std::io::{Cursor, Write};
use std::path::Path;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Smallest document the classifier accepts as a PDF
pub const MINIMAL_PDF: &[u8] = b"%PDF-1.7\n1 0 obj\n<< /Type /Catalog >>\nendobj\n%%EOF\n";

/// Error page the backend packs into its archives when conversion fails
pub const JAPANESE_ERROR_PAGE: &str = "<html><head><title>エラー</title></head>\
<body><p>ファイルの作成に失敗しました</p></body></html>";

/// PHP warning the backend leaks when its error view is missing
pub const LEAKED_INCLUDE_WARNING: &str = "Warning: include(application/errors/error.php): \
failed to open stream: No such file or directory";

/// Build a ZIP archive in memory from (name, content) pairs
pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Write a source package to `dir` and return its path
pub fn write_artifact(dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, zip_bytes(&[("chapter1.re", b"= Chapter 1\n")])).unwrap();
    path
}

/// Raw completion notification for `file`, pointing at `url`
pub fn notification_mail(file: &str, url: &str) -> String {
    format!(
        "From: Converter <noreply@convert.example.com>\r\n\
         Subject: Conversion complete\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         Your conversion has finished.\r\n\
         File: {file}\r\n\
         Download: {url}\r\n"
    )
}

/// A receive time safely after any `since` taken by the code under test
pub fn just_now() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(1)
}

/// Accept uploads and answer with `jobid`
pub async fn mount_upload(server: &MockServer, jobid: &str) {
    Mock::given(method("POST"))
        .and(path("/api/upload"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "jobid": jobid })),
        )
        .mount(server)
        .await;
}

/// Serve `bytes` at `route`
pub async fn mount_download(server: &MockServer, route: &str, bytes: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
        .mount(server)
        .await;
}
