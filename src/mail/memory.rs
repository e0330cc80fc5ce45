//! In-process mailbox
//!
//! Holds raw RFC 5322 messages in memory. Clones share the same store, so a caller
//! can keep one handle to deliver messages while a watcher owns another.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

use super::message::{notification_from_raw, parse_headers};
use super::{MailMatcher, MailboxBackend, MailboxCapabilities};
use crate::error::{Error, Result};
use crate::types::EmailNotification;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    received_at: DateTime<Utc>,
    raw: Vec<u8>,
}

/// Mailbox backed by a shared in-memory message list
#[derive(Debug, Clone, Default)]
pub struct InMemoryMailbox {
    messages: Arc<Mutex<Vec<StoredMessage>>>,
    exact_time_filter: bool,
}

impl InMemoryMailbox {
    /// Empty mailbox that leaves time filtering to the watcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `since` inside `search`, like a provider search API would
    pub fn with_exact_time_filter(mut self) -> Self {
        self.exact_time_filter = true;
        self
    }

    /// Deliver a raw message; returns its id
    pub fn deliver(&self, raw: impl Into<Vec<u8>>, received_at: DateTime<Utc>) -> String {
        let mut messages = self.lock();
        let id = (messages.len() + 1).to_string();
        messages.push(StoredMessage {
            id: id.clone(),
            received_at,
            raw: raw.into(),
        });
        id
    }

    /// Number of delivered messages
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing was delivered yet
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<StoredMessage>> {
        // a panicking test thread must not wedge every other handle
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MailboxBackend for InMemoryMailbox {
    async fn search(&mut self, matcher: &MailMatcher) -> Result<Vec<EmailNotification>> {
        let messages = self.lock().clone();
        let mut found = Vec::new();
        for message in messages {
            let headers = match parse_headers(&message.raw) {
                Ok(headers) => headers,
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "skipping message with unreadable headers");
                    continue;
                }
            };
            let notification = EmailNotification::new(
                message.id,
                message.received_at,
                headers.sender,
                headers.subject,
            );
            if !matcher.matches_headers(&notification) {
                continue;
            }
            if self.exact_time_filter && !matcher.is_recent(&notification) {
                continue;
            }
            found.push(notification);
        }
        Ok(found)
    }

    async fn fetch_body(&mut self, message_id: &str) -> Result<EmailNotification> {
        let message = self
            .lock()
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| Error::Mailbox(format!("no message with id {message_id}")))?;
        notification_from_raw(&message.id, Some(message.received_at), &message.raw)
    }

    fn capabilities(&self) -> MailboxCapabilities {
        MailboxCapabilities {
            exact_time_filter: self.exact_time_filter,
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
