//! Session façade tying submission, polling, mail waits and batches together

use chrono::SubsecRound;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::batch::BatchCorrelationCoordinator;
use crate::classifier::Classifier;
use crate::client::ServiceClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::mail::{
    CompletionMailWatcher, FALLBACK_FILENAME, MailMatcher, MailboxBackend, WaitOutcome,
    WatchContext, backend_from_config,
};
use crate::poller::JobStatusPoller;
use crate::types::{
    Artifact, ArtifactOutcome, CompletionChannel, CompletionNotice, ConversionJob, Event,
    FailureKind, JobHandle, JobState, correlation_key,
};

/// Entry point for converting artifacts through the remote backend
///
/// One session drives one logical worker: calls may be issued from several tasks,
/// but mail waits are serialized on the single mailbox connection.
#[derive(Debug, Clone)]
pub struct ConversionSession {
    config: Arc<Config>,
    poller: Arc<JobStatusPoller>,
    watcher: Option<Arc<Mutex<CompletionMailWatcher>>>,
    batch: Option<BatchCorrelationCoordinator>,
    event_tx: broadcast::Sender<Event>,
    cancel_token: CancellationToken,
    active: Arc<std::sync::Mutex<HashSet<String>>>,
}

impl ConversionSession {
    /// Create a session from configuration
    ///
    /// Validates the configuration, builds the HTTP client and, when `mail.backend`
    /// is set, the mailbox backend.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let backend = config
            .mail
            .backend
            .as_ref()
            .map(backend_from_config)
            .transpose()?;
        Self::build(config, backend)
    }

    /// Create a session with a caller-supplied mailbox backend
    ///
    /// `mail.backend` is ignored.
    pub fn with_mailbox(config: Config, backend: Box<dyn MailboxBackend>) -> Result<Self> {
        config.check(true)?;
        Self::build(config, Some(backend))
    }

    fn build(config: Config, backend: Option<Box<dyn MailboxBackend>>) -> Result<Self> {
        let client = Arc::new(ServiceClient::new(&config.service)?);
        let (event_tx, _rx) = broadcast::channel(1000);

        let poller = Arc::new(JobStatusPoller::new(
            client,
            Classifier::new(&config.classifier),
            config.retry.clone(),
            config.channel,
            event_tx.clone(),
        ));

        let watcher = backend.map(|backend| {
            info!(backend = backend.name(), "mailbox backend ready");
            Arc::new(Mutex::new(CompletionMailWatcher::new(
                backend,
                config.mail.url_selection,
            )))
        });
        let batch = watcher.as_ref().map(|watcher| {
            BatchCorrelationCoordinator::new(
                Arc::clone(&poller),
                Arc::clone(watcher),
                config.mail.clone(),
                config.batch.clone(),
                event_tx.clone(),
            )
        });

        Ok(Self {
            config: Arc::new(config),
            poller,
            watcher,
            batch,
            event_tx,
            cancel_token: CancellationToken::new(),
            active: Arc::new(std::sync::Mutex::new(HashSet::new())),
        })
    }

    /// Subscribe to lifecycle events
    ///
    /// Each subscriber receives every event sent after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The session configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancel every in-flight and future wait of this session
    pub fn cancel(&self) {
        info!("cancelling conversion session");
        self.cancel_token.cancel();
    }

    /// Token that is cancelled by [`ConversionSession::cancel`]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Upload one artifact and return its job handle
    ///
    /// The artifact stays active until [`ConversionSession::await_result`] returns
    /// for the handle. Submitting it again before that fails with
    /// [`Error::JobAlreadyActive`] without uploading anything.
    pub async fn submit(&self, artifact: &Artifact) -> Result<JobHandle> {
        let claim = self.claim(std::slice::from_ref(artifact))?;
        let handle = self.poller.submit(artifact).await?;
        claim.keep();
        Ok(handle)
    }

    /// Wait for a submitted job to finish and verify its deliverable
    ///
    /// Follows the channel recorded in the handle. Failures are reported in the
    /// outcome, never as `Err`. The artifact is released for resubmission once
    /// this returns.
    pub async fn await_result(&self, handle: &JobHandle) -> ArtifactOutcome {
        let _release = ActiveClaim {
            active: Arc::clone(&self.active),
            keys: vec![correlation_key(&handle.artifact)],
        };
        match handle.channel {
            CompletionChannel::StatusPolling => self.await_polled(handle).await,
            CompletionChannel::EmailNotification => self.await_mailed(handle).await,
        }
    }

    async fn await_polled(&self, handle: &JobHandle) -> ArtifactOutcome {
        let mut job = ConversionJob::from_handle(handle);
        let polling = &self.config.polling;
        match self
            .poller
            .poll(
                &mut job,
                polling.max_polling_attempts,
                polling.poll_interval,
                &self.cancel_token,
            )
            .await
        {
            Ok(poll) => {
                self.poller
                    .outcome_from_poll(&handle.artifact, handle.id.clone(), poll)
                    .await
            }
            Err(e) => ArtifactOutcome::from_error(&handle.artifact, Some(handle.id.clone()), &e),
        }
    }

    async fn await_mailed(&self, handle: &JobHandle) -> ArtifactOutcome {
        let mut job = ConversionJob::from_handle(handle);
        if let Err(e) = job.begin(JobState::Waiting) {
            return ArtifactOutcome::from_error(&handle.artifact, Some(handle.id.clone()), &e);
        }

        let matcher = self.matcher().with_since(handle.submitted_at.trunc_subsecs(0));
        let key = correlation_key(&handle.artifact);
        let outcome = match self.wait_for(&matcher, Some(&key)).await {
            Ok(notice) => {
                self.poller
                    .verified_outcome(
                        &handle.artifact,
                        Some(handle.id.clone()),
                        JobState::Completed,
                        notice.url,
                        Vec::new(),
                    )
                    .await
            }
            Err(e) => self.wait_failure(&handle.artifact, handle, e),
        };

        if job
            .finish(
                outcome.state,
                outcome.result_url.clone(),
                outcome.warnings.clone(),
            )
            .is_ok()
        {
            self.event_tx
                .send(Event::JobFinished {
                    job_id: handle.id.clone(),
                    state: outcome.state,
                })
                .ok();
        }
        outcome
    }

    fn wait_failure(&self, artifact: &str, handle: &JobHandle, error: Error) -> ArtifactOutcome {
        match error {
            Error::NotificationNotFound { .. } => ArtifactOutcome::failed(
                artifact,
                Some(handle.id.clone()),
                JobState::TimedOut,
                format!(
                    "completion notification not received within {}s",
                    self.config.mail.wait_timeout.as_secs()
                ),
                FailureKind::NotificationNotFound,
            ),
            other => ArtifactOutcome::from_error(artifact, Some(handle.id.clone()), &other),
        }
    }

    /// Wait for any notification matching `matcher` and verify its deliverable
    ///
    /// The outcome is named after the filename found in the notification.
    pub async fn await_notification(&self, matcher: &MailMatcher) -> ArtifactOutcome {
        match self.wait_for(matcher, None).await {
            Ok(notice) => {
                self.poller
                    .verified_outcome(
                        &notice.filename,
                        None,
                        JobState::Completed,
                        notice.url,
                        Vec::new(),
                    )
                    .await
            }
            Err(Error::NotificationNotFound { filename }) => ArtifactOutcome::failed(
                filename,
                None,
                JobState::TimedOut,
                "completion notification not received",
                FailureKind::NotificationNotFound,
            ),
            Err(e) => ArtifactOutcome::from_error(FALLBACK_FILENAME, None, &e),
        }
    }

    /// Wait for a notice, optionally one whose filename correlates with `key`
    ///
    /// Notices naming another file are skipped; a notice without a recognisable
    /// filename is accepted, since it cannot belong to anything else.
    async fn wait_for(&self, matcher: &MailMatcher, key: Option<&str>) -> Result<CompletionNotice> {
        let watcher = self.watcher.as_ref().ok_or_else(|| {
            Error::config(
                "mail.backend",
                "the email notification channel needs a mailbox backend",
            )
        })?;
        let mail = &self.config.mail;
        let deadline = Instant::now() + mail.wait_timeout;
        let mut context = WatchContext::new();
        let mut watcher = watcher.lock().await;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = watcher
                .wait(
                    matcher,
                    &mut context,
                    remaining,
                    mail.check_interval,
                    &self.cancel_token,
                )
                .await;
            match outcome? {
                WaitOutcome::Matched(notice) => {
                    let Some(key) = key else {
                        return Ok(notice);
                    };
                    if notice.filename == FALLBACK_FILENAME || correlation_key(&notice.filename) == key {
                        return Ok(notice);
                    }
                    warn!(filename = %notice.filename, expected = key, "notification is for another file, discarding");
                    self.event_tx
                        .send(Event::NotificationDiscarded {
                            filename: notice.filename,
                        })
                        .ok();
                    if remaining.is_zero() {
                        return Err(not_found(key));
                    }
                }
                WaitOutcome::TimedOut => {
                    return Err(not_found(key.unwrap_or(FALLBACK_FILENAME)));
                }
                WaitOutcome::Cancelled => return Err(Error::Cancelled),
            }
        }
    }

    /// Submit one artifact and wait for its verified result
    ///
    /// An artifact that already has a job in flight on this session is rejected.
    pub async fn convert(&self, artifact: &Artifact) -> ArtifactOutcome {
        match self.submit(artifact).await {
            Ok(handle) => self.await_result(&handle).await,
            Err(e @ Error::JobAlreadyActive(_)) => {
                warn!(artifact = %artifact.name, "conversion already in progress");
                ArtifactOutcome::from_error(&artifact.name, None, &e)
            }
            Err(e) => {
                error!(artifact = %artifact.name, error = %e, "submission failed");
                ArtifactOutcome::from_error(&artifact.name, None, &e)
            }
        }
    }

    /// Convert many artifacts through batch uploads and mail correlation
    ///
    /// Returns one outcome per artifact in input order. Needs a mailbox backend.
    pub async fn run_batch(&self, artifacts: &[Artifact]) -> Result<Vec<ArtifactOutcome>> {
        let batch = self.batch.as_ref().ok_or_else(|| {
            Error::config("mail.backend", "batch conversion needs a mailbox backend")
        })?;
        let _claim = self.claim(artifacts)?;
        batch
            .run_batch(artifacts, self.config.batch.batch_size, &self.cancel_token)
            .await
    }

    fn matcher(&self) -> MailMatcher {
        let mail = &self.config.mail;
        let matcher = MailMatcher::new(&mail.subject_pattern, mail.result_kind);
        match &mail.sender_pattern {
            Some(sender) => matcher.with_sender(sender),
            None => matcher,
        }
    }

    /// Mark artifacts as having an active job until the returned claim is dropped
    fn claim(&self, artifacts: &[Artifact]) -> Result<ActiveClaim> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let keys: Vec<String> = artifacts.iter().map(Artifact::correlation_key).collect();

        {
            let mut seen = HashSet::new();
            for (artifact, key) in artifacts.iter().zip(&keys) {
                if active.contains(key) || !seen.insert(key.as_str()) {
                    return Err(Error::JobAlreadyActive(artifact.name.clone()));
                }
            }
        }
        active.extend(keys.iter().cloned());

        Ok(ActiveClaim {
            active: Arc::clone(&self.active),
            keys,
        })
    }
}

fn not_found(filename: &str) -> Error {
    Error::NotificationNotFound {
        filename: filename.to_string(),
    }
}

/// Releases active-artifact keys on drop
struct ActiveClaim {
    active: Arc<std::sync::Mutex<HashSet<String>>>,
    keys: Vec<String>,
}

impl ActiveClaim {
    /// Keep the keys active after the claim goes away
    fn keep(mut self) {
        self.keys.clear();
    }
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            active.remove(key);
        }
    }
}
