//! Core types and events for conversion-tracker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Opaque job handle assigned by the conversion backend
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Create a new JobId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw handle
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the bytes of an artifact live
#[derive(Clone, Debug)]
pub enum ArtifactSource {
    /// File on disk, read at upload time
    Path(PathBuf),
    /// Bytes already in memory
    Bytes(Vec<u8>),
}

/// A packaged file submitted for conversion
#[derive(Clone, Debug)]
pub struct Artifact {
    /// File name sent to the backend and used for correlation
    pub name: String,
    /// Location of the content
    pub source: ArtifactSource,
}

impl Artifact {
    /// Reference a file on disk; the file name becomes the artifact name
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Other(format!("artifact path has no file name: {}", path.display())))?
            .to_string();
        Ok(Self {
            name,
            source: ArtifactSource::Path(path.to_path_buf()),
        })
    }

    /// Wrap in-memory bytes
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            source: ArtifactSource::Bytes(bytes.into()),
        }
    }

    /// Load the artifact content
    pub async fn read_bytes(&self) -> Result<Vec<u8>> {
        match &self.source {
            ArtifactSource::Path(path) => Ok(tokio::fs::read(path).await?),
            ArtifactSource::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    /// File name without its extension, lowercased, for correlation
    pub fn correlation_key(&self) -> String {
        correlation_key(&self.name)
    }
}

/// Normalise a filename for correlation: strip directories and extension, lowercase
pub fn correlation_key(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim();
    let stem = Path::new(base)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(base);
    stem.to_lowercase()
}

/// How the backend signals that a job has finished
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionChannel {
    /// Poll `GET /api/status/{jobid}`
    #[default]
    StatusPolling,
    /// Wait for a notification email
    EmailNotification,
}

impl CompletionChannel {
    /// The other channel, used in remediation hints
    pub fn alternate(self) -> Self {
        match self {
            CompletionChannel::StatusPolling => CompletionChannel::EmailNotification,
            CompletionChannel::EmailNotification => CompletionChannel::StatusPolling,
        }
    }

    /// Human-readable name
    pub fn label(self) -> &'static str {
        match self {
            CompletionChannel::StatusPolling => "HTTP status polling",
            CompletionChannel::EmailNotification => "email notification",
        }
    }
}

/// Lifecycle state of a conversion job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted by the backend
    Submitted,
    /// Status endpoint is being polled
    Polling,
    /// Waiting for a completion notification
    Waiting,
    /// Deliverable produced and verified
    Completed,
    /// Deliverable produced with warnings
    PartialSuccess,
    /// Conversion or verification failed
    Failed,
    /// Attempt or time budget exhausted
    TimedOut,
}

impl JobState {
    /// Whether the job can no longer change
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::PartialSuccess | JobState::Failed | JobState::TimedOut
        )
    }
}

/// A submitted job as returned to collaborators
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobHandle {
    /// Backend job handle
    pub id: JobId,
    /// Artifact name
    pub artifact: String,
    /// Channel the job completes through
    pub channel: CompletionChannel,
    /// When the upload was accepted
    pub submitted_at: DateTime<Utc>,
}

/// Tracked conversion job
///
/// Mutated only by the poller or watcher that owns it. Transitions are monotonic:
/// once terminal, every further transition is rejected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversionJob {
    /// Backend job handle
    pub id: JobId,
    /// Artifact name
    pub artifact: String,
    /// Completion channel
    pub channel: CompletionChannel,
    state: JobState,
    result_url: Option<String>,
    warnings: Vec<String>,
}

impl ConversionJob {
    /// Create a job in the `Submitted` state
    pub fn new(id: JobId, artifact: impl Into<String>, channel: CompletionChannel) -> Self {
        Self {
            id,
            artifact: artifact.into(),
            channel,
            state: JobState::Submitted,
            result_url: None,
            warnings: Vec::new(),
        }
    }

    /// Create a job from the handle returned by `submit`
    pub fn from_handle(handle: &JobHandle) -> Self {
        Self::new(handle.id.clone(), handle.artifact.clone(), handle.channel)
    }

    /// Current state
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Result URL, set on Completed/PartialSuccess
    pub fn result_url(&self) -> Option<&str> {
        self.result_url.as_deref()
    }

    /// Ordered warnings
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Move to a non-terminal waiting state (`Polling` or `Waiting`)
    pub fn begin(&mut self, next: JobState) -> Result<()> {
        if self.state != JobState::Submitted || next.is_terminal() || next == JobState::Submitted {
            return Err(self.rejected(next));
        }
        self.state = next;
        Ok(())
    }

    /// Move to a terminal state
    pub fn finish(
        &mut self,
        next: JobState,
        result_url: Option<String>,
        warnings: Vec<String>,
    ) -> Result<()> {
        if self.state.is_terminal() || !next.is_terminal() {
            return Err(self.rejected(next));
        }
        self.state = next;
        if matches!(next, JobState::Completed | JobState::PartialSuccess) {
            self.result_url = result_url;
        }
        self.warnings = warnings;
        Ok(())
    }

    fn rejected(&self, to: JobState) -> Error {
        Error::InvalidTransition {
            job_id: self.id.clone(),
            from: self.state,
            to,
        }
    }
}

/// Failure taxonomy carried by terminal outcomes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retried within the attempt budget
    TransientNetwork,
    /// Credentials rejected; never retried
    Authentication,
    /// Backend leaked an internal failure; surfaced with a hint
    ServerConfiguration,
    /// Downloaded artifact failed classification
    ContentMismatch,
    /// Attempt or time budget exhausted
    Timeout,
    /// No notification could be correlated
    NotificationNotFound,
    /// Upload rejected
    Submission,
    /// Caller cancelled
    Cancelled,
}

/// Content kind detected by the classifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// PDF document
    Pdf,
    /// ZIP archive
    Zip,
    /// HTML page
    Html,
    /// JSON document
    Json,
    /// Anything else
    Unknown,
}

/// Classifier verdict for one response or download attempt
#[must_use]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Detected content kind
    pub kind: ContentKind,
    /// Whether the content is an acceptable deliverable
    pub valid: bool,
    /// Human-readable explanation
    pub reason: String,
    /// Failure class, when the verdict is a recognised error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl VerificationResult {
    /// An acceptable deliverable
    pub fn valid(kind: ContentKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            valid: true,
            reason: reason.into(),
            failure: None,
        }
    }

    /// A rejected response; the failure class defaults to content mismatch
    pub fn invalid(kind: ContentKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            valid: false,
            reason: reason.into(),
            failure: Some(FailureKind::ContentMismatch),
        }
    }

    /// Override the failure class
    pub fn with_failure(mut self, failure: FailureKind) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Verdict for an artifact that never reached classification
    pub fn not_verified(reason: impl Into<String>, failure: FailureKind) -> Self {
        Self::invalid(ContentKind::Unknown, reason).with_failure(failure)
    }
}

/// Which URL a notification is asked for
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlKind {
    /// Bundle of all converted files
    Zip,
    /// Single-document verification copy
    Pdf,
}

impl std::fmt::Display for UrlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UrlKind::Zip => write!(f, "zip"),
            UrlKind::Pdf => write!(f, "pdf"),
        }
    }
}

/// A completion notification found in the mailbox
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmailNotification {
    /// Identifier unique within the mailbox
    pub message_id: String,
    /// Server-side receive time
    pub received_at: DateTime<Utc>,
    /// `From` header
    pub sender: String,
    /// `Subject` header
    pub subject: String,
    /// Plaintext body; empty until fetched
    pub raw_body: String,
    /// URLs found in the body, keyed by kind
    pub extracted_urls: BTreeMap<UrlKind, String>,
    /// Source filename mentioned in the body
    pub extracted_filename: Option<String>,
    consumed: bool,
}

impl EmailNotification {
    /// Create a header-only notification as returned by a mailbox search
    pub fn new(
        message_id: impl Into<String>,
        received_at: DateTime<Utc>,
        sender: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            received_at,
            sender: sender.into(),
            subject: subject.into(),
            raw_body: String::new(),
            extracted_urls: BTreeMap::new(),
            extracted_filename: None,
            consumed: false,
        }
    }

    /// Attach the fetched body
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.raw_body = body.into();
        self
    }

    /// Whether this notification has been handed out
    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Mark as handed out. Idempotent; there is no way back.
    pub fn mark_consumed(&mut self) {
        self.consumed = true;
    }
}

/// What a successful mail wait hands back
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionNotice {
    /// Result URL of the requested kind
    pub url: String,
    /// Source filename, or `unknown` when extraction failed
    pub filename: String,
    /// Notification message id
    pub message_id: String,
    /// Notification receive time
    pub received_at: DateTime<Utc>,
}

/// Terminal outcome for one artifact
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactOutcome {
    /// Artifact name
    pub artifact: String,
    /// Backend job handle, when the upload got that far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Terminal state
    pub state: JobState,
    /// Result URL, when one was obtained
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    /// Ordered warnings reported by the backend
    pub warnings: Vec<String>,
    /// Verdict on the final download (or why there was none)
    pub verification: VerificationResult,
    /// Remediation hint for actionable failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ArtifactOutcome {
    /// Failed or timed-out outcome without a verified download
    pub fn failed(
        artifact: impl Into<String>,
        job_id: Option<JobId>,
        state: JobState,
        reason: impl Into<String>,
        failure: FailureKind,
    ) -> Self {
        Self {
            artifact: artifact.into(),
            job_id,
            state,
            result_url: None,
            warnings: Vec::new(),
            verification: VerificationResult::not_verified(reason, failure),
            hint: None,
        }
    }

    /// Outcome for an error that terminated the job
    pub fn from_error(artifact: impl Into<String>, job_id: Option<JobId>, error: &Error) -> Self {
        let failure = error.failure_kind();
        let state = if failure == FailureKind::Timeout {
            JobState::TimedOut
        } else {
            JobState::Failed
        };
        let mut outcome = Self::failed(artifact, job_id, state, error.to_string(), failure);
        outcome.hint = error.remediation_hint().map(str::to_string);
        outcome
    }

    /// Human-readable reason
    pub fn reason(&self) -> &str {
        &self.verification.reason
    }

    /// Failure class, if any
    pub fn failure(&self) -> Option<FailureKind> {
        self.verification.failure
    }

    /// Completed or PartialSuccess with a valid deliverable
    pub fn is_success(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::PartialSuccess)
            && self.verification.valid
    }
}

/// Event emitted during the conversion lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Upload accepted
    JobSubmitted {
        /// Backend job handle
        job_id: JobId,
        /// Artifact name
        artifact: String,
    },

    /// One status check was made
    PollAttempt {
        /// Backend job handle
        job_id: JobId,
        /// 1-based attempt number
        attempt: u32,
        /// Reported status, if the response was readable
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },

    /// Job reached a terminal state
    JobFinished {
        /// Backend job handle
        job_id: JobId,
        /// Terminal state
        state: JobState,
    },

    /// A batch chunk was uploaded
    ChunkStarted {
        /// 0-based chunk index
        index: usize,
        /// Number of artifacts in the chunk
        size: usize,
    },

    /// A notification was correlated with an artifact
    NotificationMatched {
        /// Artifact name
        artifact: String,
        /// Result URL
        url: String,
    },

    /// A notification matched the query but not any pending artifact
    NotificationDiscarded {
        /// Filename found in the notification
        filename: String,
    },

    /// A download was classified
    ArtifactVerified {
        /// Artifact name
        artifact: String,
        /// Verdict
        valid: bool,
        /// Verdict reason
        reason: String,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ConversionJob {
        ConversionJob::new(JobId::new("42"), "A001.zip", CompletionChannel::StatusPolling)
    }

    #[test]
    fn job_moves_forward_through_polling_to_completed() {
        let mut job = job();
        job.begin(JobState::Polling).unwrap();
        job.finish(
            JobState::Completed,
            Some("https://example.com/out.pdf".into()),
            vec![],
        )
        .unwrap();

        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.result_url(), Some("https://example.com/out.pdf"));
    }

    #[test]
    fn terminal_job_rejects_every_transition() {
        let mut job = job();
        job.finish(JobState::Failed, None, vec!["boom".into()]).unwrap();

        assert!(job.begin(JobState::Polling).is_err());
        assert!(job.finish(JobState::Completed, None, vec![]).is_err());
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.warnings(), ["boom".to_string()]);
    }

    #[test]
    fn polling_cannot_be_reentered() {
        let mut job = job();
        job.begin(JobState::Polling).unwrap();
        let err = job.begin(JobState::Polling).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: JobState::Polling,
                to: JobState::Polling,
                ..
            }
        ));
    }

    #[test]
    fn failed_job_never_keeps_result_url() {
        let mut job = job();
        job.finish(JobState::Failed, Some("https://x/y.pdf".into()), vec![])
            .unwrap();
        assert!(job.result_url().is_none());
    }

    #[test]
    fn consumed_flag_is_monotonic() {
        let mut n = EmailNotification::new("1", Utc::now(), "a@b", "done");
        assert!(!n.is_consumed());
        n.mark_consumed();
        n.mark_consumed();
        assert!(n.is_consumed());
    }

    #[test]
    fn correlation_key_ignores_directory_extension_and_case() {
        assert_eq!(correlation_key("out/Book-01.PDF"), "book-01");
        assert_eq!(correlation_key("Book-01.zip"), "book-01");
        assert_eq!(correlation_key("C:\\work\\Book-01.zip"), "book-01");
        assert_eq!(correlation_key("noext"), "noext");
    }

    #[test]
    fn outcome_from_timeout_error_is_timed_out() {
        let outcome = ArtifactOutcome::from_error("A.zip", None, &Error::Timeout("t".into()));
        assert_eq!(outcome.state, JobState::TimedOut);
        assert_eq!(outcome.failure(), Some(FailureKind::Timeout));
        assert!(!outcome.is_success());
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::JobFinished {
            job_id: JobId::new("7"),
            state: JobState::PartialSuccess,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_finished");
        assert_eq!(json["state"], "partial_success");
        assert_eq!(json["job_id"], "7");
    }

    #[test]
    fn channel_alternate_flips() {
        assert_eq!(
            CompletionChannel::StatusPolling.alternate(),
            CompletionChannel::EmailNotification
        );
        assert_eq!(
            CompletionChannel::EmailNotification.alternate(),
            CompletionChannel::StatusPolling
        );
    }
}
