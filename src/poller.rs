//! Job submission and status polling
//!
//! [`JobStatusPoller`] uploads artifacts, polls `GET /api/status/{jobid}` on a
//! bounded schedule and turns the backend's answers into a terminal state. Every
//! status body is pre-checked for leaked backend output before any field in it is
//! trusted: the backend answers `200 OK` with PHP warnings prepended to otherwise
//! valid JSON, and copies internal failures into `output`.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classifier, JsonPrecheck, normalize_lines};
use crate::client::{ServiceClient, StatusResponse, UploadResponse};
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::retry::with_retry;
use crate::types::{
    Artifact, ArtifactOutcome, CompletionChannel, ConversionJob, Event, FailureKind, JobHandle,
    JobId, JobState, VerificationResult,
};

/// Terminal result of one polling run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Terminal state
    pub state: JobState,
    /// Absolute result URL (Completed/PartialSuccess only)
    pub result_url: Option<String>,
    /// Ordered warnings or error lines reported by the backend
    pub warnings: Vec<String>,
    /// Human-readable reason
    pub reason: String,
    /// Failure class for Failed/TimedOut
    pub failure: Option<FailureKind>,
    /// Remediation hint for actionable failures
    pub hint: Option<String>,
}

impl PollOutcome {
    fn finished(state: JobState, result_url: String, warnings: Vec<String>) -> Self {
        let reason = match state {
            JobState::PartialSuccess => format!("completed with {} warning(s)", warnings.len()),
            _ => "completed".to_string(),
        };
        Self {
            state,
            result_url: Some(result_url),
            warnings,
            reason,
            failure: None,
            hint: None,
        }
    }

    fn failed(reason: impl Into<String>, failure: FailureKind, warnings: Vec<String>) -> Self {
        Self {
            state: JobState::Failed,
            result_url: None,
            warnings,
            reason: reason.into(),
            failure: Some(failure),
            hint: None,
        }
    }

    fn from_error(error: &Error, warnings: Vec<String>) -> Self {
        let mut outcome = Self::failed(error.to_string(), error.failure_kind(), warnings);
        outcome.hint = error.remediation_hint().map(str::to_string);
        outcome
    }

    fn cancelled() -> Self {
        Self::failed("polling cancelled", FailureKind::Cancelled, Vec::new())
    }

    fn timed_out(attempts: u32) -> Self {
        Self {
            state: JobState::TimedOut,
            result_url: None,
            warnings: Vec::new(),
            reason: format!("job did not finish within {attempts} status checks"),
            failure: Some(FailureKind::Timeout),
            hint: None,
        }
    }

    /// Whether the backend produced a deliverable
    pub fn is_success(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::PartialSuccess)
    }
}

/// Result of a single status check
#[derive(Debug)]
enum StatusCheck {
    /// Job still running; the reported status
    Pending(String),
    /// Response could not be read; polling continues
    Unreadable(String),
    /// Job reached a terminal state
    Finished(PollOutcome),
}

/// Submits artifacts and polls the status endpoint
#[derive(Debug, Clone)]
pub struct JobStatusPoller {
    client: Arc<ServiceClient>,
    classifier: Classifier,
    retry: RetryConfig,
    channel: CompletionChannel,
    event_tx: broadcast::Sender<Event>,
}

impl JobStatusPoller {
    /// Create a poller
    ///
    /// `channel` is the completion channel in use; server-configuration hints point
    /// at the other one.
    pub fn new(
        client: Arc<ServiceClient>,
        classifier: Classifier,
        retry: RetryConfig,
        channel: CompletionChannel,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            client,
            classifier,
            retry,
            channel,
            event_tx,
        }
    }

    /// The classifier used for pre-checks and downloads
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Upload a single artifact and return its job handle
    ///
    /// Never retried: a second upload would start a second job.
    pub async fn submit(&self, artifact: &Artifact) -> Result<JobHandle> {
        let submitted_at = Utc::now();
        let id = self
            .upload(std::slice::from_ref(artifact))
            .await?
            .ok_or_else(|| {
                Error::Submission(format!("upload of {} returned no jobid", artifact.name))
            })?;

        info!(job_id = %id, artifact = %artifact.name, "conversion job submitted");
        self.event_tx
            .send(Event::JobSubmitted {
                job_id: id.clone(),
                artifact: artifact.name.clone(),
            })
            .ok();

        Ok(JobHandle {
            id,
            artifact: artifact.name.clone(),
            channel: self.channel,
            submitted_at,
        })
    }

    /// Upload artifacts in one multipart request and pre-check the answer
    ///
    /// Returns the job handle when the backend sent one. Leaked backend output in the
    /// response is a [`Error::ServerConfiguration`], a `401` an
    /// [`Error::Authentication`], and any other rejection an [`Error::Submission`].
    pub async fn upload(&self, artifacts: &[Artifact]) -> Result<Option<JobId>> {
        let response = self.client.upload(artifacts).await?;
        let accepted = (200..300).contains(&response.status);

        if response.status == 401 {
            return Err(Error::Authentication(
                "upload rejected with HTTP 401".to_string(),
            ));
        }

        match self.classifier.precheck_json(&response.body) {
            JsonPrecheck::Leaked(line) => {
                warn!(line = %line, "upload response contains leaked backend output");
                Err(Error::server_configuration(line, self.channel))
            }
            JsonPrecheck::Json {
                output_leak: Some(line),
                ..
            } => {
                warn!(line = %line, "upload response output contains leaked backend output");
                Err(Error::server_configuration(line, self.channel))
            }
            JsonPrecheck::Json { value, .. } if accepted => {
                let parsed: UploadResponse = serde_json::from_value(value)
                    .map_err(|e| Error::Submission(format!("unexpected upload response: {e}")))?;
                Ok(parsed.job_id())
            }
            JsonPrecheck::Json { value, .. } => Err(Error::Submission(format!(
                "upload rejected with HTTP {}: {}",
                response.status, value
            ))),
            JsonPrecheck::Empty => Err(Error::Submission(format!(
                "upload returned an empty body (HTTP {})",
                response.status
            ))),
            JsonPrecheck::NotJson(text) => Err(Error::Submission(format!(
                "upload returned HTTP {} with a non-JSON body: {text}",
                response.status
            ))),
        }
    }

    /// Poll a job until it reaches a terminal state
    ///
    /// Makes at most `max_attempts` status calls, sleeping `interval` between them
    /// (not after the last). Unreadable responses and transport errors consume an
    /// attempt. The job is moved through `Polling` to its terminal state; only a job
    /// that is not freshly submitted produces an `Err`.
    pub async fn poll(
        &self,
        job: &mut ConversionJob,
        max_attempts: u32,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome> {
        job.begin(JobState::Polling)?;
        debug!(job_id = %job.id, max_attempts, interval_ms = interval.as_millis(), "polling job status");

        let outcome = self.poll_loop(&job.id, max_attempts, interval, cancel).await;
        job.finish(
            outcome.state,
            outcome.result_url.clone(),
            outcome.warnings.clone(),
        )?;

        match outcome.state {
            JobState::Completed | JobState::PartialSuccess => {
                info!(job_id = %job.id, state = ?outcome.state, warnings = outcome.warnings.len(), "conversion job finished")
            }
            _ => {
                error!(job_id = %job.id, state = ?outcome.state, reason = %outcome.reason, "conversion job did not complete")
            }
        }
        self.event_tx
            .send(Event::JobFinished {
                job_id: job.id.clone(),
                state: outcome.state,
            })
            .ok();

        Ok(outcome)
    }

    async fn poll_loop(
        &self,
        job_id: &JobId,
        max_attempts: u32,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return PollOutcome::cancelled();
            }

            let (status, check) = self.check_status(job_id).await;
            self.event_tx
                .send(Event::PollAttempt {
                    job_id: job_id.clone(),
                    attempt,
                    status,
                })
                .ok();

            match check {
                StatusCheck::Finished(outcome) => return outcome,
                StatusCheck::Pending(status) => {
                    debug!(job_id = %job_id, attempt, status = %status, "job still running");
                }
                StatusCheck::Unreadable(reason) => {
                    warn!(job_id = %job_id, attempt, reason = %reason, "status check failed, continuing to poll");
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return PollOutcome::cancelled(),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }

        PollOutcome::timed_out(max_attempts)
    }

    async fn check_status(&self, job_id: &JobId) -> (Option<String>, StatusCheck) {
        let response = match self.client.status(job_id).await {
            Ok(response) => response,
            Err(e) => return (None, StatusCheck::Unreadable(e.to_string())),
        };

        if response.status == 401 {
            let error = Error::Authentication("status check rejected with HTTP 401".to_string());
            return (None, StatusCheck::Finished(PollOutcome::from_error(&error, Vec::new())));
        }

        match self.classifier.precheck_json(&response.body) {
            JsonPrecheck::Empty => (None, StatusCheck::Unreadable("empty status response".into())),
            JsonPrecheck::NotJson(text) => (
                None,
                StatusCheck::Unreadable(format!("status response is not JSON: {text}")),
            ),
            JsonPrecheck::Leaked(line) => {
                let error = Error::server_configuration(line, self.channel);
                (None, StatusCheck::Finished(PollOutcome::from_error(&error, Vec::new())))
            }
            JsonPrecheck::Json { .. } if !(200..300).contains(&response.status) => (
                None,
                StatusCheck::Unreadable(format!("status endpoint returned HTTP {}", response.status)),
            ),
            JsonPrecheck::Json { value, output_leak } => self.interpret(value, output_leak),
        }
    }

    fn interpret(&self, value: Value, output_leak: Option<String>) -> (Option<String>, StatusCheck) {
        let response: StatusResponse = match serde_json::from_value(value) {
            Ok(response) => response,
            Err(e) => {
                return (
                    None,
                    StatusCheck::Unreadable(format!("unexpected status document: {e}")),
                );
            }
        };

        let status = lowercase(response.status.as_deref());
        let result = lowercase(response.result.as_deref());
        let label = Some(status.clone()).filter(|s| !s.is_empty());

        if result == "failure" || status == "failed" || status == "error" {
            let mut lines = normalize_lines(&response.errors);
            if lines.is_empty() {
                lines = normalize_lines(&response.output);
            }
            let outcome = match output_leak {
                Some(line) => PollOutcome::from_error(&Error::server_configuration(line, self.channel), lines),
                None => {
                    let reason = lines
                        .first()
                        .map(|l| format!("conversion failed: {l}"))
                        .unwrap_or_else(|| "conversion failed".to_string());
                    PollOutcome::failed(reason, FailureKind::ContentMismatch, lines)
                }
            };
            return (label, StatusCheck::Finished(outcome));
        }

        if status != "completed" {
            let pending = label.clone().unwrap_or_else(|| "unknown".to_string());
            return (label, StatusCheck::Pending(pending));
        }

        if let Some(line) = &output_leak {
            warn!(line = %line, "successful job reported leaked backend output");
        }

        let mut warnings = normalize_lines(&response.warnings);
        if warnings.is_empty() {
            warnings = normalize_lines(&response.output);
        }

        let Some(raw_url) = response
            .download_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
        else {
            let outcome = PollOutcome::failed(
                "backend reported completion without a download_url",
                FailureKind::ContentMismatch,
                warnings,
            );
            return (label, StatusCheck::Finished(outcome));
        };

        let outcome = match self.client.resolve_url(raw_url) {
            Ok(url) => {
                let state = if result == "partial_success" || !warnings.is_empty() {
                    JobState::PartialSuccess
                } else {
                    JobState::Completed
                };
                PollOutcome::finished(state, url.to_string(), warnings)
            }
            Err(e) => PollOutcome::from_error(&e, warnings),
        };
        (label, StatusCheck::Finished(outcome))
    }

    /// Download a deliverable (with retry) and classify it
    pub async fn verify_download(&self, artifact: &str, url: &str) -> VerificationResult {
        let client = self.client.as_ref();
        let verdict = match with_retry(&self.retry, move || client.download(url)).await {
            Ok(body) => {
                debug!(artifact, url = %body.final_url, bytes = body.bytes.len(), "classifying deliverable");
                self.classifier
                    .classify(body.status, &body.headers, &body.bytes, &body.final_url)
            }
            Err(e) => {
                warn!(artifact, url, error = %e, "deliverable download failed");
                VerificationResult::not_verified(format!("download failed: {e}"), e.failure_kind())
            }
        };

        self.event_tx
            .send(Event::ArtifactVerified {
                artifact: artifact.to_string(),
                valid: verdict.valid,
                reason: verdict.reason.clone(),
            })
            .ok();
        verdict
    }

    /// Verify a produced deliverable and build the artifact's terminal outcome
    ///
    /// A deliverable that fails classification turns the outcome into `Failed`, even
    /// though the backend reported success.
    pub async fn verified_outcome(
        &self,
        artifact: &str,
        job_id: Option<JobId>,
        state: JobState,
        result_url: String,
        warnings: Vec<String>,
    ) -> ArtifactOutcome {
        let verification = self.verify_download(artifact, &result_url).await;
        let hint = match verification.failure {
            Some(FailureKind::ServerConfiguration) => {
                Error::server_configuration(verification.reason.clone(), self.channel)
                    .remediation_hint()
                    .map(str::to_string)
            }
            Some(FailureKind::Authentication) => Error::Authentication(String::new())
                .remediation_hint()
                .map(str::to_string),
            _ => None,
        };
        let state = if verification.valid {
            state
        } else {
            JobState::Failed
        };

        ArtifactOutcome {
            artifact: artifact.to_string(),
            job_id,
            state,
            result_url: Some(result_url),
            warnings,
            verification,
            hint,
        }
    }

    /// Convert a polling result into an artifact outcome, downloading on success
    pub async fn outcome_from_poll(
        &self,
        artifact: &str,
        job_id: JobId,
        poll: PollOutcome,
    ) -> ArtifactOutcome {
        match (poll.state, poll.result_url) {
            (JobState::Completed | JobState::PartialSuccess, Some(url)) => {
                self.verified_outcome(artifact, Some(job_id), poll.state, url, poll.warnings)
                    .await
            }
            (state, _) => {
                let failure = poll.failure.unwrap_or(FailureKind::ContentMismatch);
                let mut outcome =
                    ArtifactOutcome::failed(artifact, Some(job_id), state, poll.reason, failure);
                outcome.warnings = poll.warnings;
                outcome.hint = poll.hint;
                outcome
            }
        }
    }
}

fn lowercase(value: Option<&str>) -> String {
    value.map(|v| v.trim().to_lowercase()).unwrap_or_default()
}
