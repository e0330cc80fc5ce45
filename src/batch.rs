//! Batch upload with notification correlation
//!
//! Artifacts are uploaded in chunks, one multipart request per chunk. The backend
//! then sends one completion mail per file, in no particular order; each notice is
//! matched back to a still-pending artifact of the chunk by filename stem.

use chrono::{SubsecRound, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BatchConfig, MailConfig};
use crate::error::{Error, Result};
use crate::mail::{CompletionMailWatcher, MailMatcher, WaitOutcome, WatchContext};
use crate::poller::JobStatusPoller;
use crate::types::{
    Artifact, ArtifactOutcome, CompletionNotice, Event, FailureKind, JobId, JobState,
    correlation_key,
};

/// Reason recorded for artifacts whose notification never arrived
pub const NOTIFICATION_NOT_RECEIVED: &str = "completion notification not received";

/// Why correlation of a chunk stopped
#[derive(Debug)]
enum CorrelationEnd {
    /// Every artifact matched, or the chunk timeout elapsed
    Finished,
    /// The caller cancelled
    Cancelled,
    /// The mailbox failed in a way that retrying cannot fix
    Failed(Error),
}

/// Uploads artifacts in chunks and correlates completion mails with them
#[derive(Debug, Clone)]
pub struct BatchCorrelationCoordinator {
    poller: Arc<JobStatusPoller>,
    watcher: Arc<Mutex<CompletionMailWatcher>>,
    mail: MailConfig,
    batch: BatchConfig,
    event_tx: broadcast::Sender<Event>,
}

impl BatchCorrelationCoordinator {
    /// Create a coordinator
    pub fn new(
        poller: Arc<JobStatusPoller>,
        watcher: Arc<Mutex<CompletionMailWatcher>>,
        mail: MailConfig,
        batch: BatchConfig,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            poller,
            watcher,
            mail,
            batch,
            event_tx,
        }
    }

    /// Convert `artifacts` in chunks of `batch_size`
    ///
    /// Returns one outcome per artifact, in input order. Per-artifact failures are
    /// reported in the outcomes; only a zero `batch_size` is an `Err`.
    pub async fn run_batch(
        &self,
        artifacts: &[Artifact],
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ArtifactOutcome>> {
        if batch_size == 0 {
            return Err(Error::config("batch.batch_size", "must be at least 1"));
        }

        let chunk_count = artifacts.len().div_ceil(batch_size);
        info!(artifacts = artifacts.len(), batch_size, chunks = chunk_count, "starting batch conversion");

        let mut outcomes = Vec::with_capacity(artifacts.len());
        for (index, chunk) in artifacts.chunks(batch_size).enumerate() {
            if index > 0 && !self.batch.inter_chunk_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.batch.inter_chunk_delay) => {}
                }
            }

            if cancel.is_cancelled() {
                outcomes.extend(chunk.iter().map(|a| cancelled(&a.name, None)));
                continue;
            }

            outcomes.extend(self.run_chunk(index, chunk, cancel).await);
        }

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        info!(succeeded, failed = outcomes.len() - succeeded, "batch conversion finished");
        Ok(outcomes)
    }

    async fn run_chunk(
        &self,
        index: usize,
        chunk: &[Artifact],
        cancel: &CancellationToken,
    ) -> Vec<ArtifactOutcome> {
        // notification timestamps only have second precision
        let since = Utc::now().trunc_subsecs(0);
        self.event_tx
            .send(Event::ChunkStarted {
                index,
                size: chunk.len(),
            })
            .ok();

        let job_id = match self.poller.upload(chunk).await {
            Ok(job_id) => job_id,
            Err(e) => {
                error!(chunk = index, error = %e, "chunk upload failed");
                return chunk
                    .iter()
                    .map(|a| ArtifactOutcome::from_error(&a.name, None, &e))
                    .collect();
            }
        };
        debug!(chunk = index, job_id = ?job_id, files = chunk.len(), "chunk uploaded");

        let mut matcher = MailMatcher::new(&self.mail.subject_pattern, self.mail.result_kind)
            .with_since(since);
        if let Some(sender) = &self.mail.sender_pattern {
            matcher = matcher.with_sender(sender);
        }

        let (notices, end) = self.correlate(chunk, &matcher, cancel).await;

        let mut outcomes = Vec::with_capacity(chunk.len());
        for (artifact, notice) in chunk.iter().zip(notices) {
            let outcome = match notice {
                Some(notice) => {
                    self.poller
                        .verified_outcome(
                            &artifact.name,
                            job_id.clone(),
                            JobState::Completed,
                            notice.url,
                            Vec::new(),
                        )
                        .await
                }
                None => match &end {
                    CorrelationEnd::Cancelled => cancelled(&artifact.name, job_id.clone()),
                    CorrelationEnd::Failed(e) => {
                        ArtifactOutcome::from_error(&artifact.name, job_id.clone(), e)
                    }
                    CorrelationEnd::Finished => {
                        warn!(artifact = %artifact.name, "no completion notification before chunk timeout");
                        ArtifactOutcome::failed(
                            &artifact.name,
                            job_id.clone(),
                            JobState::Failed,
                            NOTIFICATION_NOT_RECEIVED,
                            FailureKind::NotificationNotFound,
                        )
                    }
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Wait for notices until every artifact is matched, the chunk times out, the
    /// caller cancels or the mailbox fails fatally
    async fn correlate(
        &self,
        chunk: &[Artifact],
        matcher: &MailMatcher,
        cancel: &CancellationToken,
    ) -> (Vec<Option<CompletionNotice>>, CorrelationEnd) {
        let keys: Vec<String> = chunk.iter().map(Artifact::correlation_key).collect();
        let mut notices: Vec<Option<CompletionNotice>> = vec![None; chunk.len()];
        let mut context = WatchContext::new();
        let deadline = Instant::now() + self.batch.chunk_timeout;
        let mut watcher = self.watcher.lock().await;

        while notices.iter().any(Option::is_none) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let notice = match watcher
                .wait(matcher, &mut context, remaining, self.mail.check_interval, cancel)
                .await
            {
                Ok(WaitOutcome::Matched(notice)) => notice,
                Ok(WaitOutcome::TimedOut) => break,
                Ok(WaitOutcome::Cancelled) => return (notices, CorrelationEnd::Cancelled),
                Err(e) => return (notices, CorrelationEnd::Failed(e)),
            };

            let key = correlation_key(&notice.filename);
            let slot = keys
                .iter()
                .zip(notices.iter())
                .position(|(k, n)| n.is_none() && *k == key);

            match slot {
                Some(i) => {
                    info!(artifact = %chunk[i].name, url = %notice.url, "notification correlated");
                    self.event_tx
                        .send(Event::NotificationMatched {
                            artifact: chunk[i].name.clone(),
                            url: notice.url.clone(),
                        })
                        .ok();
                    notices[i] = Some(notice);
                }
                None => {
                    warn!(
                        filename = %notice.filename,
                        message_id = %notice.message_id,
                        "notification matches no pending artifact, discarding"
                    );
                    self.event_tx
                        .send(Event::NotificationDiscarded {
                            filename: notice.filename,
                        })
                        .ok();
                }
            }
        }

        (notices, CorrelationEnd::Finished)
    }
}

fn cancelled(artifact: &str, job_id: Option<JobId>) -> ArtifactOutcome {
    ArtifactOutcome::failed(
        artifact,
        job_id,
        JobState::Failed,
        "batch cancelled",
        FailureKind::Cancelled,
    )
}
