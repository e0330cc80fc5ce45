//! Waiting for completion notifications

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::extract::{FALLBACK_FILENAME, populate};
use super::{MailMatcher, MailboxBackend, WatchContext};
use crate::config::UrlSelectionPolicy;
use crate::error::Result;
use crate::types::CompletionNotice;

/// How a wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A fresh notification with a result URL of the requested kind
    Matched(CompletionNotice),
    /// Nothing usable arrived before the deadline
    TimedOut,
    /// The cancellation token fired
    Cancelled,
}

/// Polls a mailbox for completion notifications
pub struct CompletionMailWatcher {
    backend: Box<dyn MailboxBackend>,
    url_selection: UrlSelectionPolicy,
}

impl std::fmt::Debug for CompletionMailWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionMailWatcher")
            .field("backend", &self.backend.name())
            .field("url_selection", &self.url_selection)
            .finish()
    }
}

impl CompletionMailWatcher {
    /// Create a watcher owning `backend`
    pub fn new(backend: Box<dyn MailboxBackend>, url_selection: UrlSelectionPolicy) -> Self {
        Self {
            backend,
            url_selection,
        }
    }

    /// Name of the mailbox backend
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Wait for the newest matching notification not yet consumed in `context`
    ///
    /// Scans immediately, then every `check_interval` until `timeout` elapses. The
    /// returned notification is recorded in `context` before this returns.
    ///
    /// Scan failures are logged and retried on the next pass, except fatal ones
    /// (see [`crate::Error::is_fatal`]) such as rejected mailbox credentials, which end the
    /// wait with `Err`.
    pub async fn wait(
        &mut self,
        matcher: &MailMatcher,
        context: &mut WatchContext,
        timeout: Duration,
        check_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        debug!(
            backend = self.backend.name(),
            subject = %matcher.subject_pattern,
            timeout_secs = timeout.as_secs(),
            "waiting for completion notification"
        );

        loop {
            if cancel.is_cancelled() {
                return Ok(WaitOutcome::Cancelled);
            }

            match self.scan(matcher, context).await {
                Ok(Some(notice)) => return Ok(WaitOutcome::Matched(notice)),
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    error!(backend = self.backend.name(), error = %e, "mailbox scan failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(backend = self.backend.name(), error = %e, "mailbox scan failed, will retry");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                info!(
                    subject = %matcher.subject_pattern,
                    timeout_secs = timeout.as_secs(),
                    "no completion notification before deadline"
                );
                return Ok(WaitOutcome::TimedOut);
            }

            let pause = check_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// One pass over the mailbox
    async fn scan(
        &mut self,
        matcher: &MailMatcher,
        context: &mut WatchContext,
    ) -> Result<Option<CompletionNotice>> {
        let exact = self.backend.capabilities().exact_time_filter;
        let mut candidates: Vec<_> = self
            .backend
            .search(matcher)
            .await?
            .into_iter()
            .filter(|n| matcher.matches_headers(n))
            .filter(|n| !context.is_consumed(&n.message_id))
            .filter(|n| exact || matcher.is_recent(n))
            .collect();
        // newest first; ties broken by id so the order is stable
        candidates.sort_by(|a, b| {
            b.received_at
                .cmp(&a.received_at)
                .then_with(|| b.message_id.cmp(&a.message_id))
        });

        for candidate in candidates {
            let mut notification = match self.backend.fetch_body(&candidate.message_id).await {
                Ok(notification) => notification,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    // one broken or vanished message must not hide older ones
                    warn!(message_id = %candidate.message_id, error = %e, "skipping unreadable notification");
                    continue;
                }
            };
            // search results carry the authoritative receive time
            notification.received_at = candidate.received_at;
            populate(&mut notification, self.url_selection);

            let Some(url) = notification.extracted_urls.get(&matcher.artifact_kind).cloned() else {
                debug!(
                    message_id = %notification.message_id,
                    kind = %matcher.artifact_kind,
                    "matching notification has no result URL of the requested kind"
                );
                continue;
            };

            context.consume(notification.message_id.clone());
            notification.mark_consumed();

            let filename = notification
                .extracted_filename
                .clone()
                .unwrap_or_else(|| FALLBACK_FILENAME.to_string());
            info!(
                message_id = %notification.message_id,
                filename = %filename,
                url = %url,
                "completion notification found"
            );
            return Ok(Some(CompletionNotice {
                url,
                filename,
                message_id: notification.message_id,
                received_at: notification.received_at,
            }));
        }

        Ok(None)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::InMemoryMailbox;
    use crate::types::UrlKind;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 9, minute, 0).unwrap()
    }

    fn message(file: &str, url: &str) -> String {
        format!(
            "From: noreply@convert.example.com\r\n\
             Subject: Conversion complete\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             File: {file}\r\n\
             {url}\r\n"
        )
    }

    fn matcher() -> MailMatcher {
        MailMatcher::new("conversion complete", UrlKind::Zip).with_since(at(0))
    }

    fn watcher(mailbox: &InMemoryMailbox) -> CompletionMailWatcher {
        CompletionMailWatcher::new(Box::new(mailbox.clone()), UrlSelectionPolicy::Last)
    }

    async fn wait_briefly(
        watcher: &mut CompletionMailWatcher,
        context: &mut WatchContext,
    ) -> WaitOutcome {
        watcher
            .wait(
                &matcher(),
                context,
                Duration::from_millis(50),
                Duration::from_millis(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn newest_notification_wins() {
        let mailbox = InMemoryMailbox::new();
        mailbox.deliver(message("A001.zip", "https://c.example.com/dl?id=1&type=zip"), at(5));
        mailbox.deliver(message("A001.zip", "https://c.example.com/dl?id=2&type=zip"), at(9));

        let mut watcher = watcher(&mailbox);
        let mut context = WatchContext::new();

        let WaitOutcome::Matched(notice) = wait_briefly(&mut watcher, &mut context).await else {
            panic!("expected a match");
        };
        assert_eq!(notice.url, "https://c.example.com/dl?id=2&type=zip");
        assert_eq!(notice.filename, "A001.zip");
        assert_eq!(notice.received_at, at(9));
    }

    #[tokio::test]
    async fn consumed_notification_is_never_returned_twice() {
        let mailbox = InMemoryMailbox::new();
        mailbox.deliver(message("A001.zip", "https://c.example.com/a.zip"), at(5));

        let mut watcher = watcher(&mailbox);
        let mut context = WatchContext::new();

        let first = wait_briefly(&mut watcher, &mut context).await;
        assert!(matches!(first, WaitOutcome::Matched(_)));
        assert_eq!(context.consumed_count(), 1);

        let second = wait_briefly(&mut watcher, &mut context).await;
        assert_eq!(second, WaitOutcome::TimedOut);

        // a fresh context sees the message again
        let third = wait_briefly(&mut watcher, &mut WatchContext::new()).await;
        assert!(matches!(third, WaitOutcome::Matched(_)));
    }

    #[tokio::test]
    async fn older_notifications_are_filtered_client_side() {
        let mailbox = InMemoryMailbox::new();
        mailbox.deliver(message("A001.zip", "https://c.example.com/a.zip"), at(1));

        let mut watcher = watcher(&mailbox);
        let matcher = MailMatcher::new("conversion complete", UrlKind::Zip).with_since(at(2));
        let outcome = watcher
            .wait(
                &matcher,
                &mut WatchContext::new(),
                Duration::ZERO,
                Duration::ZERO,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn notification_without_requested_kind_is_skipped() {
        let mailbox = InMemoryMailbox::new();
        mailbox.deliver(message("A001.zip", "https://c.example.com/files/A001.pdf"), at(5));

        let mut watcher = watcher(&mailbox);
        let mut context = WatchContext::new();

        assert_eq!(wait_briefly(&mut watcher, &mut context).await, WaitOutcome::TimedOut);
        assert_eq!(context.consumed_count(), 0);
    }

    #[tokio::test]
    async fn missing_filename_falls_back_to_unknown() {
        let mailbox = InMemoryMailbox::new();
        mailbox.deliver(
            "Subject: Conversion complete\r\n\r\nReady: https://c.example.com/dl?type=zip\r\n",
            at(5),
        );

        let mut watcher = watcher(&mailbox);
        let WaitOutcome::Matched(notice) =
            wait_briefly(&mut watcher, &mut WatchContext::new()).await
        else {
            panic!("expected a match");
        };
        assert_eq!(notice.filename, FALLBACK_FILENAME);
    }

    #[tokio::test]
    async fn notification_arriving_mid_wait_is_found() {
        let mailbox = InMemoryMailbox::new();
        let mut watcher = watcher(&mailbox);

        let sender = mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            sender.deliver(message("B002.zip", "https://c.example.com/b.zip"), at(7));
        });

        let outcome = watcher
            .wait(
                &matcher(),
                &mut WatchContext::new(),
                Duration::from_secs(5),
                Duration::from_millis(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let WaitOutcome::Matched(notice) = outcome else {
            panic!("expected a match, got {outcome:?}");
        };
        assert_eq!(notice.filename, "B002.zip");
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_sleep() {
        let mailbox = InMemoryMailbox::new();
        let mut watcher = watcher(&mailbox);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = watcher
            .wait(
                &matcher(),
                &mut WatchContext::new(),
                Duration::from_secs(60),
                Duration::from_secs(30),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn unreadable_newer_message_does_not_hide_an_older_notification() {
        let mailbox = InMemoryMailbox::new();
        mailbox.deliver(message("A001.zip", "https://c.example.com/a.zip"), at(5));
        mailbox.deliver(
            "From: noreply@convert.example.com\r\n\
             Subject: Conversion complete\r\n\
             Content-Type: text/plain\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             %%%% not base64 %%%%\r\n",
            at(9),
        );

        let mut watcher = watcher(&mailbox);
        let mut context = WatchContext::new();
        let outcome = watcher
            .wait(
                &matcher(),
                &mut context,
                Duration::from_millis(200),
                Duration::from_millis(20),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let WaitOutcome::Matched(notice) = outcome else {
            panic!("expected the older notification, got {outcome:?}");
        };
        assert_eq!(notice.filename, "A001.zip");
        assert_eq!(notice.message_id, "1");
        assert!(!context.is_consumed("2"));
    }

    #[tokio::test]
    async fn rejected_mailbox_credentials_end_the_wait() {
        use crate::mail::SearchApiBackend;
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let backend = SearchApiBackend::new(&server.uri(), "expired", "me").unwrap();
        let mut watcher = CompletionMailWatcher::new(Box::new(backend), UrlSelectionPolicy::Last);

        let err = watcher
            .wait(
                &matcher(),
                &mut WatchContext::new(),
                Duration::from_millis(500),
                Duration::from_millis(20),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, crate::Error::Authentication(_)), "{err}");
    }

    #[test]
    fn debug_names_the_backend() {
        let watcher = watcher(&InMemoryMailbox::new());
        assert!(format!("{watcher:?}").contains("memory"));
    }
}
