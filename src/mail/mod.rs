//! Completion-notification mail handling
//!
//! The conversion backend can announce finished jobs by email instead of (or in
//! addition to) the status endpoint. This module provides:
//!
//! - [`MailboxBackend`], the capability trait every mailbox implementation provides
//! - [`ImapBackend`] (direct protocol polling) and [`SearchApiBackend`] (provider
//!   search API), plus [`InMemoryMailbox`] for embedding and tests
//! - [`CompletionMailWatcher`], which waits for a matching, not-yet-consumed
//!   notification and extracts its result URL and source filename

mod extract;
mod imap;
mod memory;
mod message;
mod search_api;
mod watcher;

pub use extract::{FALLBACK_FILENAME, classify_url, extract_filename, extract_urls};
pub use imap::{ImapBackend, ImapConnector, TcpConnector, TlsConnector};
pub use memory::InMemoryMailbox;
pub use message::{MessageHeaders, parse_headers, plaintext_body};
pub use search_api::SearchApiBackend;
pub use watcher::{CompletionMailWatcher, WaitOutcome};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::warn;

use crate::config::MailBackendConfig;
use crate::error::Result;
use crate::types::{EmailNotification, UrlKind};

/// What a mailbox backend can do on the server side
#[derive(Debug, Clone, Copy)]
pub struct MailboxCapabilities {
    /// Whether `since` is applied with second precision by the server
    ///
    /// When `false` the watcher compares each candidate's timestamp itself.
    pub exact_time_filter: bool,
}

/// Trait for mailbox access
///
/// Implementations hold their own connection state, which is why the methods take
/// `&mut self`: a backend is owned by exactly one watcher.
#[async_trait]
pub trait MailboxBackend: Send {
    /// Find candidate notifications (headers only, `raw_body` empty)
    ///
    /// Implementations apply as much of `matcher` server-side as they can; the
    /// watcher re-checks sender, subject and (unless exact) time.
    async fn search(&mut self, matcher: &MailMatcher) -> Result<Vec<EmailNotification>>;

    /// Fetch one message in full, with the plaintext part as `raw_body`
    async fn fetch_body(&mut self, message_id: &str) -> Result<EmailNotification>;

    /// Query capabilities of this backend
    fn capabilities(&self) -> MailboxCapabilities;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Criteria for a completion notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMatcher {
    /// Case-insensitive subject substring
    pub subject_pattern: String,
    /// Optional case-insensitive sender substring
    pub sender_pattern: Option<String>,
    /// Ignore notifications received before this instant
    pub since: Option<DateTime<Utc>>,
    /// Which result URL to hand back
    pub artifact_kind: UrlKind,
}

impl MailMatcher {
    /// Matcher for a subject, asking for the given URL kind
    pub fn new(subject_pattern: impl Into<String>, artifact_kind: UrlKind) -> Self {
        Self {
            subject_pattern: subject_pattern.into(),
            sender_pattern: None,
            since: None,
            artifact_kind,
        }
    }

    /// Restrict to a sender
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender_pattern = Some(sender.into());
        self
    }

    /// Ignore older notifications
    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Whether subject and sender headers match
    pub fn matches_headers(&self, notification: &EmailNotification) -> bool {
        let subject_ok = notification
            .subject
            .to_lowercase()
            .contains(&self.subject_pattern.to_lowercase());
        let sender_ok = self.sender_pattern.as_ref().is_none_or(|pattern| {
            notification
                .sender
                .to_lowercase()
                .contains(&pattern.to_lowercase())
        });
        subject_ok && sender_ok
    }

    /// Whether a notification was received at or after `since`
    pub fn is_recent(&self, notification: &EmailNotification) -> bool {
        self.since.is_none_or(|since| notification.received_at >= since)
    }
}

/// Per-caller watch state
///
/// Carries the set of notification ids already handed out. Each batch chunk (or
/// each single-artifact wait) starts a fresh context; sharing one context between
/// waits is what prevents the same notification from being returned twice.
#[derive(Debug, Clone, Default)]
pub struct WatchContext {
    consumed: HashSet<String>,
}

impl WatchContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a notification id was already handed out
    pub fn is_consumed(&self, message_id: &str) -> bool {
        self.consumed.contains(message_id)
    }

    /// Record a notification id as handed out; returns `false` if it already was
    pub fn consume(&mut self, message_id: impl Into<String>) -> bool {
        self.consumed.insert(message_id.into())
    }

    /// Number of consumed notifications
    pub fn consumed_count(&self) -> usize {
        self.consumed.len()
    }
}

/// Build the backend described by configuration
pub fn backend_from_config(config: &MailBackendConfig) -> Result<Box<dyn MailboxBackend>> {
    match config {
        MailBackendConfig::Imap {
            host,
            port,
            tls: true,
            username,
            password,
            mailbox,
        } => Ok(Box::new(ImapBackend::new(
            TlsConnector::new()?,
            host.clone(),
            *port,
            username.clone(),
            password.clone(),
            mailbox.clone(),
        ))),
        MailBackendConfig::Imap {
            host,
            port,
            tls: false,
            username,
            password,
            mailbox,
        } => {
            warn!(host = %host, "IMAP without TLS sends the mailbox password in cleartext");
            Ok(Box::new(ImapBackend::new(
                TcpConnector,
                host.clone(),
                *port,
                username.clone(),
                password.clone(),
                mailbox.clone(),
            )))
        }
        MailBackendConfig::SearchApi {
            base_url,
            access_token,
            user_id,
        } => Ok(Box::new(SearchApiBackend::new(
            base_url,
            access_token.clone(),
            user_id.clone(),
        )?)),
    }
}
