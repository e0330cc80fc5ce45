//! Configuration types for conversion-tracker

use crate::error::{Error, Result};
use crate::types::{CompletionChannel, UrlKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Conversion service endpoint and credentials
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL; `/api/upload` and `/api/status/{jobid}` are resolved against it
    #[serde(default)]
    pub base_url: String,

    /// Basic-Auth user name
    #[serde(default)]
    pub username: String,

    /// Basic-Auth password
    #[serde(default)]
    pub password: String,

    /// Timeout for the upload request (default: 300 seconds)
    #[serde(default = "default_upload_timeout", with = "duration_serde")]
    pub upload_timeout: Duration,

    /// Timeout for status requests (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Timeout for a whole deliverable download, body included (default: 600 seconds)
    #[serde(default = "default_download_timeout", with = "duration_serde")]
    pub download_timeout: Duration,

    /// Largest deliverable accepted, in bytes (default: 512 MiB)
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            upload_timeout: default_upload_timeout(),
            request_timeout: default_request_timeout(),
            download_timeout: default_download_timeout(),
            max_download_bytes: default_max_download_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

/// Status polling schedule
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Delay between status checks (default: 5 seconds)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// Maximum number of status checks before the job times out (default: 120)
    #[serde(default = "default_max_polling_attempts")]
    pub max_polling_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_polling_attempts: default_max_polling_attempts(),
        }
    }
}

/// Mailbox backend selection
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MailBackendConfig {
    /// Direct IMAP polling
    Imap {
        /// Server host name
        host: String,
        /// Server port (default: 993)
        #[serde(default = "default_imap_port")]
        port: u16,
        /// Wrap the connection in TLS from the first byte (default: true)
        #[serde(default = "default_true")]
        tls: bool,
        /// Login user
        username: String,
        /// Login password
        password: String,
        /// Mailbox to select (default: INBOX)
        #[serde(default = "default_mailbox")]
        mailbox: String,
    },
    /// Provider search API with server-side time filtering
    SearchApi {
        /// API root, e.g. `https://gmail.googleapis.com`
        base_url: String,
        /// Bearer token
        access_token: String,
        /// Mailbox owner (default: "me")
        #[serde(default = "default_user_id")]
        user_id: String,
    },
}

/// Which URL wins when a notification contains several of the same kind
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlSelectionPolicy {
    /// The backend appends the most recent result last
    #[default]
    Last,
    /// Take the first occurrence
    First,
}

/// Completion-notification settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailConfig {
    /// Backend to poll (required for the email channel)
    #[serde(default)]
    pub backend: Option<MailBackendConfig>,

    /// Subject substring of completion notifications
    #[serde(default = "default_subject_pattern")]
    pub subject_pattern: String,

    /// Optional sender substring
    #[serde(default)]
    pub sender_pattern: Option<String>,

    /// Delay between mailbox scans (default: 10 seconds)
    #[serde(default = "default_check_interval", with = "duration_serde")]
    pub check_interval: Duration,

    /// How long a single wait may take (default: 900 seconds)
    #[serde(default = "default_wait_timeout", with = "duration_serde")]
    pub wait_timeout: Duration,

    /// Same-kind URL selection rule
    #[serde(default)]
    pub url_selection: UrlSelectionPolicy,

    /// Which result URL a notification is asked for (default: zip)
    #[serde(default = "default_result_kind")]
    pub result_kind: UrlKind,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            backend: None,
            subject_pattern: default_subject_pattern(),
            sender_pattern: None,
            check_interval: default_check_interval(),
            wait_timeout: default_wait_timeout(),
            url_selection: UrlSelectionPolicy::default(),
            result_kind: default_result_kind(),
        }
    }
}

/// Batch upload settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Artifacts per upload call (default: 5)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Time allowed for all notifications of one chunk (default: 1800 seconds)
    #[serde(default = "default_chunk_timeout", with = "duration_serde")]
    pub chunk_timeout: Duration,

    /// Pause between chunks (default: 3 seconds)
    #[serde(default = "default_inter_chunk_delay", with = "duration_serde")]
    pub inter_chunk_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            chunk_timeout: default_chunk_timeout(),
            inter_chunk_delay: default_inter_chunk_delay(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Result classifier tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Extension of the expected deliverable inside archives (default: "pdf")
    #[serde(default = "default_expected_extension")]
    pub expected_extension: String,

    /// Failure keywords checked in addition to the built-in list
    #[serde(default)]
    pub extra_failure_keywords: Vec<String>,

    /// Backend-leakage substrings checked in addition to the built-in list
    #[serde(default)]
    pub extra_leakage_patterns: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            expected_extension: default_expected_extension(),
            extra_failure_keywords: Vec::new(),
            extra_leakage_patterns: Vec::new(),
        }
    }
}

/// Main configuration for a conversion session
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Conversion service endpoint
    #[serde(default)]
    pub service: ServiceConfig,

    /// Completion channel used by `convert` and `await_result`
    #[serde(default)]
    pub channel: CompletionChannel,

    /// Status polling schedule
    #[serde(default)]
    pub polling: PollingConfig,

    /// Completion-notification settings
    #[serde(default)]
    pub mail: MailConfig,

    /// Batch upload settings
    #[serde(default)]
    pub batch: BatchConfig,

    /// Download retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Classifier tuning
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Check that the configuration can drive a session
    pub fn validate(&self) -> Result<()> {
        self.check(self.mail.backend.is_some())
    }

    /// Validation with the mailbox supplied by the caller instead of `mail.backend`
    pub(crate) fn check(&self, has_mailbox: bool) -> Result<()> {
        if self.service.base_url.trim().is_empty() {
            return Err(Error::config("service.base_url", "must not be empty"));
        }
        url::Url::parse(&self.service.base_url)
            .map_err(|e| Error::config("service.base_url", format!("not a valid URL: {e}")))?;
        if self.service.max_download_bytes == 0 {
            return Err(Error::config("service.max_download_bytes", "must be at least 1"));
        }
        if self.polling.max_polling_attempts == 0 {
            return Err(Error::config(
                "polling.max_polling_attempts",
                "must be at least 1",
            ));
        }
        if self.batch.batch_size == 0 {
            return Err(Error::config("batch.batch_size", "must be at least 1"));
        }
        if self.channel == CompletionChannel::EmailNotification && !has_mailbox {
            return Err(Error::config(
                "mail.backend",
                "the email notification channel needs a mailbox backend",
            ));
        }
        if self.mail.subject_pattern.trim().is_empty() {
            return Err(Error::config("mail.subject_pattern", "must not be empty"));
        }
        Ok(())
    }
}

fn default_result_kind() -> UrlKind {
    UrlKind::Zip
}

fn default_upload_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_max_download_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_user_agent() -> String {
    concat!("conversion-tracker/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_polling_attempts() -> u32 {
    120
}

fn default_imap_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_user_id() -> String {
    "me".to_string()
}

fn default_subject_pattern() -> String {
    "conversion complete".to_string()
}

fn default_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(900)
}

fn default_batch_size() -> usize {
    5
}

fn default_chunk_timeout() -> Duration {
    Duration::from_secs(1800)
}

fn default_inter_chunk_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_expected_extension() -> String {
    "pdf".to_string()
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
