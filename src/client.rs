//! HTTP client for the conversion service
//!
//! Thin transport layer: it knows the endpoints, credentials and timeouts, and
//! hands raw responses back. Deciding what a response *means* is the job of the
//! classifier and the poller.

use reqwest::header::HeaderMap;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::types::{Artifact, JobId};

/// Multipart field name the upload endpoint expects
pub const UPLOAD_FIELD: &str = "files[]";

/// Upper bound on the buffer reserved up front from `Content-Length`
const MAX_PREALLOCATION: usize = 8 * 1024 * 1024;

/// Raw status code and body of an API call
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code
    pub status: u16,
    /// Body as text (lossy UTF-8)
    pub body: String,
}

/// Body of `POST /api/upload`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadResponse {
    /// Job handle; the backend sends either a string or a number
    #[serde(default)]
    pub jobid: Option<Value>,
}

impl UploadResponse {
    /// Job handle, if one was returned
    pub fn job_id(&self) -> Option<JobId> {
        match self.jobid.as_ref()? {
            Value::String(s) if !s.trim().is_empty() => Some(JobId::new(s.trim())),
            Value::Number(n) => Some(JobId::new(n.to_string())),
            _ => None,
        }
    }
}

/// Body of `GET /api/status/{jobid}`
///
/// `output`, `errors` and `warnings` arrive as a string or a list of strings and
/// are kept as raw JSON until normalised.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    /// `queued`, `processing`, `completed`, `failed`...
    #[serde(default)]
    pub status: Option<String>,
    /// `success`, `partial_success` or `failure` once completed
    #[serde(default)]
    pub result: Option<String>,
    /// Build log lines
    #[serde(default)]
    pub output: Value,
    /// Error lines
    #[serde(default)]
    pub errors: Value,
    /// Explicit warning lines
    #[serde(default)]
    pub warnings: Value,
    /// Deliverable location, absolute or relative to the base URL
    #[serde(default)]
    pub download_url: Option<String>,
}

/// A fully read deliverable
#[derive(Debug, Clone)]
pub struct DownloadedBody {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
    /// Body bytes
    pub bytes: Vec<u8>,
    /// URL after redirects
    pub final_url: String,
}

/// Client for the conversion service REST API
#[derive(Debug, Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
    upload_timeout: Duration,
    download_timeout: Duration,
    max_download_bytes: u64,
}

impl ServiceClient {
    /// Build a client from the service section of the configuration
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::config("service.base_url", format!("invalid URL: {e}")))?;
        // Url::join replaces the last segment unless the path ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
            upload_timeout: config.upload_timeout,
            download_timeout: config.download_timeout,
            max_download_bytes: config.max_download_bytes,
        })
    }

    /// Base URL, always ending in `/`
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve an absolute or base-relative URL
    pub fn resolve_url(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok(self.base_url.join(url.trim_start_matches('/'))?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.username, Some(&self.password))
        }
    }

    /// Upload one or more artifacts in a single multipart request
    pub async fn upload(&self, artifacts: &[Artifact]) -> Result<ApiResponse> {
        let mut form = Form::new();
        for artifact in artifacts {
            let bytes = artifact.read_bytes().await?;
            debug!(artifact = %artifact.name, bytes = bytes.len(), "adding artifact to upload");
            form = form.part(UPLOAD_FIELD, Part::bytes(bytes).file_name(artifact.name.clone()));
        }

        let url = self.base_url.join("api/upload")?;
        let response = self
            .authorize(self.http.post(url))
            .timeout(self.upload_timeout)
            .multipart(form)
            .send()
            .await?;

        read_api_response(response).await
    }

    /// Query the status endpoint for one job
    pub async fn status(&self, job_id: &JobId) -> Result<ApiResponse> {
        let url = self
            .base_url
            .join(&format!("api/status/{}", urlencoding::encode(job_id.as_str())))?;
        let response = self.authorize(self.http.get(url)).send().await?;
        read_api_response(response).await
    }

    /// Download a deliverable, streaming it into memory
    ///
    /// Server errors come back as [`Error::Transient`] so the caller can retry;
    /// every other status is handed to the classifier together with the body. A body
    /// larger than `max_download_bytes` is rejected as [`Error::ContentMismatch`],
    /// whether announced by `Content-Length` or only noticed while streaming.
    pub async fn download(&self, url: &str) -> Result<DownloadedBody> {
        let url = self.resolve_url(url)?;
        let mut response = self
            .authorize(self.http.get(url.clone()))
            .timeout(self.download_timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Transient(format!("download of {url} returned HTTP {status}")));
        }

        let headers = response.headers().clone();
        let final_url = response.url().to_string();

        let announced = response.content_length().unwrap_or(0);
        if announced > self.max_download_bytes {
            return Err(self.oversized(&final_url));
        }

        let capacity = usize::try_from(announced).unwrap_or(usize::MAX).min(MAX_PREALLOCATION);
        let mut bytes = Vec::with_capacity(capacity);
        while let Some(chunk) = response.chunk().await? {
            if (bytes.len() + chunk.len()) as u64 > self.max_download_bytes {
                return Err(self.oversized(&final_url));
            }
            bytes.extend_from_slice(&chunk);
        }
        debug!(url = %final_url, bytes = bytes.len(), status = status.as_u16(), "download finished");

        Ok(DownloadedBody {
            status: status.as_u16(),
            headers,
            bytes,
            final_url,
        })
    }

    fn oversized(&self, url: &str) -> Error {
        Error::ContentMismatch {
            artifact: url.to_string(),
            reason: format!(
                "deliverable exceeds the {} byte download limit",
                self.max_download_bytes
            ),
        }
    }
}

async fn read_api_response(response: reqwest::Response) -> Result<ApiResponse> {
    let status = response.status().as_u16();
    let bytes = response.bytes().await?;
    Ok(ApiResponse {
        status,
        body: String::from_utf8_lossy(&bytes).into_owned(),
    })
}
