//! Provider search API backend (Gmail-style REST)
//!
//! - `GET {base}/gmail/v1/users/{user}/messages?q=...` lists matching ids
//! - `GET .../messages/{id}?format=metadata` returns receive time and headers
//! - `GET .../messages/{id}?format=raw` returns the base64url-encoded message
//!
//! The `after:` operator takes a Unix timestamp, so time filtering happens on the
//! server with second precision.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::message::notification_from_raw;
use super::{MailMatcher, MailboxBackend, MailboxCapabilities};
use crate::error::{Error, Result};
use crate::types::EmailNotification;

/// Upper bound on ids requested per search
const MAX_RESULTS: u32 = 50;

#[derive(Debug, Default, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageMetadata {
    id: String,
    /// Milliseconds since the epoch, sent as a string
    #[serde(default)]
    internal_date: Option<Value>,
    #[serde(default)]
    payload: Option<Payload>,
}

#[derive(Debug, Default, Deserialize)]
struct Payload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    raw: String,
    #[serde(default)]
    internal_date: Option<Value>,
}

impl MessageMetadata {
    fn header(&self, name: &str) -> String {
        self.payload
            .as_ref()
            .and_then(|p| p.headers.iter().find(|h| h.name.eq_ignore_ascii_case(name)))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    }
}

fn parse_internal_date(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let millis = match value? {
        Value::String(s) => s.parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    DateTime::<Utc>::from_timestamp_millis(millis)
}

fn decode_raw(raw: &str) -> Result<Vec<u8>> {
    // the API uses the URL-safe alphabet, but padding is inconsistent
    let normalized: String = raw
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| Error::Mailbox(format!("raw message is not valid base64: {e}")))
}

/// Build the provider query string
fn search_query(matcher: &MailMatcher) -> String {
    let mut query = format!("subject:\"{}\"", matcher.subject_pattern.replace('"', ""));
    if let Some(sender) = &matcher.sender_pattern {
        query.push_str(&format!(" from:{sender}"));
    }
    if let Some(since) = matcher.since {
        query.push_str(&format!(" after:{}", since.timestamp()));
    }
    query
}

/// Mailbox backend using a provider's REST search API
#[derive(Debug, Clone)]
pub struct SearchApiBackend {
    http: reqwest::Client,
    messages_url: Url,
    access_token: String,
}

impl SearchApiBackend {
    /// Create a backend for `user_id`'s mailbox at `base_url`
    pub fn new(
        base_url: &str,
        access_token: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<Self> {
        let mut messages_url = Url::parse(base_url)
            .map_err(|e| Error::config("mail.backend.base_url", format!("invalid URL: {e}")))?;
        let user_id = user_id.into();
        messages_url
            .path_segments_mut()
            .map_err(|_| Error::config("mail.backend.base_url", "URL cannot be a base"))?
            .pop_if_empty()
            .extend(["gmail", "v1", "users", user_id.as_str(), "messages"]);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("conversion-tracker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            messages_url,
            access_token: access_token.into(),
        })
    }

    fn message_url(&self, id: &str) -> Result<Url> {
        let mut url = self.messages_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Mailbox("messages URL cannot be a base".into()))?
            .push(id);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::Authentication(format!(
                "mail search API rejected the access token (HTTP {status})"
            )));
        }
        if status.is_server_error() {
            return Err(Error::Transient(format!("mail search API returned HTTP {status}")));
        }
        if !status.is_success() {
            return Err(Error::Mailbox(format!("mail search API returned HTTP {status}")));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl MailboxBackend for SearchApiBackend {
    async fn search(&mut self, matcher: &MailMatcher) -> Result<Vec<EmailNotification>> {
        let query = search_query(matcher);
        let max_results = MAX_RESULTS.to_string();
        let list: MessageList = self
            .get_json(
                self.messages_url.clone(),
                &[("q", query.as_str()), ("maxResults", max_results.as_str())],
            )
            .await?;
        debug!(query = %query, hits = list.messages.len(), "mail search API query finished");

        let mut notifications = Vec::with_capacity(list.messages.len());
        for message in list.messages {
            let metadata: MessageMetadata = match self
                .get_json(
                    self.message_url(&message.id)?,
                    &[
                        ("format", "metadata"),
                        ("metadataHeaders", "Subject"),
                        ("metadataHeaders", "From"),
                    ],
                )
                .await
            {
                Ok(metadata) => metadata,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    // deleted between listing and lookup, or a malformed entry
                    warn!(message_id = %message.id, error = %e, "skipping unreadable message");
                    continue;
                }
            };
            let received_at = parse_internal_date(metadata.internal_date.as_ref())
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            notifications.push(EmailNotification::new(
                metadata.id.clone(),
                received_at,
                metadata.header("From"),
                metadata.header("Subject"),
            ));
        }
        Ok(notifications)
    }

    async fn fetch_body(&mut self, message_id: &str) -> Result<EmailNotification> {
        let message: RawMessage = self
            .get_json(self.message_url(message_id)?, &[("format", "raw")])
            .await?;
        let raw = decode_raw(&message.raw)?;
        notification_from_raw(
            message_id,
            parse_internal_date(message.internal_date.as_ref()),
            &raw,
        )
    }

    fn capabilities(&self) -> MailboxCapabilities {
        MailboxCapabilities {
            exact_time_filter: true,
        }
    }

    fn name(&self) -> &'static str {
        "search_api"
    }
}
