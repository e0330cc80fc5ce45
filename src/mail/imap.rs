//! Minimal IMAP4rev1 mailbox backend
//!
//! Speaks just enough of the protocol to find completion notifications: `LOGIN`,
//! `SELECT`, `UID SEARCH` and `UID FETCH` with `{n}` literals. The transport is
//! anything that implements `AsyncRead + AsyncWrite`, obtained through an
//! [`ImapConnector`]: [`TlsConnector`] for implicit TLS (port 993) and
//! [`TcpConnector`] for plaintext servers on a trusted network.
//!
//! `SEARCH SINCE` is date-granular on every server, so this backend reports
//! `exact_time_filter = false` and the watcher filters by timestamp itself.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_native_tls::{TlsStream, native_tls};
use tracing::{debug, info, warn};

use super::message::{notification_from_raw, parse_headers};
use super::{MailMatcher, MailboxBackend, MailboxCapabilities};
use crate::error::{Error, Result};
use crate::types::EmailNotification;

/// Time allowed for the TCP connection to be established
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens the byte stream an IMAP session runs over
#[async_trait]
pub trait ImapConnector: Send + Sync {
    /// Stream type produced by this connector
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    /// Open a connection to `host:port`
    async fn connect(&self, host: &str, port: u16) -> Result<Self::Stream>;
}

/// Plaintext TCP connector
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl ImapConnector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(Error::Transient(format!(
                "connection to {host}:{port} timed out"
            ))),
        }
    }
}

/// Implicit-TLS connector; the server certificate is checked against `host`
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_native_tls::TlsConnector,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector").finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Connector trusting the platform's root certificates
    pub fn new() -> Result<Self> {
        let connector = native_tls::TlsConnector::new()
            .map_err(|e| Error::Other(format!("Failed to create TLS connector: {e}")))?;
        Ok(Self::from_native(connector))
    }

    /// Connector with caller-chosen roots or verification settings
    pub fn from_native(connector: native_tls::TlsConnector) -> Self {
        Self {
            inner: tokio_native_tls::TlsConnector::from(connector),
        }
    }
}

#[async_trait]
impl ImapConnector for TlsConnector {
    type Stream = TlsStream<TcpStream>;

    async fn connect(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
        let tcp = TcpConnector.connect(host, port).await?;
        match tokio::time::timeout(CONNECT_TIMEOUT, self.inner.connect(host, tcp)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::Mailbox(format!(
                "TLS handshake with {host}:{port} failed: {e}"
            ))),
            Err(_) => Err(Error::Transient(format!(
                "TLS handshake with {host}:{port} timed out"
            ))),
        }
    }
}

/// One untagged server response, with any literals it carried
#[derive(Debug, Default)]
struct Untagged {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// A message returned by `UID FETCH`
#[derive(Debug)]
struct Fetched {
    uid: u32,
    internal_date: Option<DateTime<Utc>>,
    content: Vec<u8>,
}

struct ImapSession<S> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ImapSession<S> {
    async fn open(stream: S) -> Result<Self> {
        let mut session = Self {
            stream: BufReader::new(stream),
            next_tag: 0,
        };
        let greeting = session.read_line().await?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(Error::Mailbox(format!(
                "unexpected IMAP greeting: {}",
                greeting.trim_end()
            )));
        }
        Ok(session)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        if self.stream.read_until(b'\n', &mut buf).await? == 0 {
            return Err(Error::Transient("IMAP connection closed by server".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send a tagged command and collect untagged responses until its completion
    async fn command(&mut self, command: &str) -> Result<Vec<Untagged>> {
        self.next_tag += 1;
        let tag = format!("A{:04}", self.next_tag);
        let verb = command.split(' ').next().unwrap_or(command);

        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{tag} {command}\r\n").as_bytes())
            .await?;
        stream.flush().await?;

        let mut responses = Vec::new();
        loop {
            let line = self.read_line().await?;
            if let Some(status) = line
                .strip_prefix(tag.as_str())
                .and_then(|rest| rest.strip_prefix(' '))
            {
                let status = status.trim_end();
                if status
                    .get(..2)
                    .is_some_and(|s| s.eq_ignore_ascii_case("OK"))
                {
                    return Ok(responses);
                }
                return Err(Error::Mailbox(format!("{verb} failed: {status}")));
            }
            if line.starts_with('+') {
                // never sent: we do not issue literals
                continue;
            }

            let mut untagged = Untagged::default();
            let mut current = line;
            loop {
                let text = current.trim_end_matches(['\r', '\n']);
                match literal_length(text) {
                    Some(len) => {
                        untagged.text.push_str(text);
                        let mut literal = vec![0u8; len];
                        self.stream.read_exact(&mut literal).await?;
                        untagged.literals.push(literal);
                        current = self.read_line().await?;
                    }
                    None => {
                        untagged.text.push_str(text);
                        break;
                    }
                }
            }
            responses.push(untagged);
        }
    }

    async fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>> {
        let responses = self.command(&format!("UID SEARCH {criteria}")).await?;
        Ok(responses
            .iter()
            .filter_map(|r| r.text.strip_prefix("* SEARCH"))
            .flat_map(|ids| ids.split_whitespace())
            .filter_map(|id| id.parse().ok())
            .collect())
    }

    async fn uid_fetch(&mut self, uid_set: &str, items: &str) -> Result<Vec<Fetched>> {
        let responses = self.command(&format!("UID FETCH {uid_set} {items}")).await?;
        Ok(responses
            .into_iter()
            .filter(|r| r.text.contains(" FETCH "))
            .filter_map(|mut r| {
                let uid = uid_regex()
                    .captures(&r.text)
                    .and_then(|c| c[1].parse().ok())?;
                let internal_date = internal_date_regex()
                    .captures(&r.text)
                    .and_then(|c| parse_internal_date(&c[1]));
                let content = if r.literals.is_empty() {
                    Vec::new()
                } else {
                    r.literals.swap_remove(0)
                };
                Some(Fetched {
                    uid,
                    internal_date,
                    content,
                })
            })
            .collect())
    }
}

#[allow(clippy::expect_used)]
fn uid_regex() -> &'static Regex {
    static UID: OnceLock<Regex> = OnceLock::new();
    UID.get_or_init(|| Regex::new(r"\bUID (\d+)").expect("UID pattern is valid"))
}

#[allow(clippy::expect_used)]
fn internal_date_regex() -> &'static Regex {
    static DATE: OnceLock<Regex> = OnceLock::new();
    DATE.get_or_init(|| {
        Regex::new(r#"INTERNALDATE "([^"]+)""#).expect("INTERNALDATE pattern is valid")
    })
}

/// `{123}` at the end of a response line announces a literal of 123 bytes
fn literal_length(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].parse().ok()
}

fn parse_internal_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Build `UID SEARCH` criteria
///
/// `SINCE` is moved back one day because servers compare it against the date in
/// their own time zone. Non-ASCII subject or sender patterns would need a
/// `CHARSET` literal; they are left to the client-side filter instead.
fn search_criteria(matcher: &MailMatcher) -> String {
    let mut parts = Vec::new();
    if let Some(since) = matcher.since {
        let day = since - ChronoDuration::days(1);
        parts.push(format!("SINCE {}", day.format("%d-%b-%Y")));
    }
    if !matcher.subject_pattern.is_empty() && matcher.subject_pattern.is_ascii() {
        parts.push(format!("SUBJECT {}", quote(&matcher.subject_pattern)));
    }
    if let Some(sender) = &matcher.sender_pattern
        && sender.is_ascii()
    {
        parts.push(format!("FROM {}", quote(sender)));
    }
    if parts.is_empty() {
        "ALL".to_string()
    } else {
        parts.join(" ")
    }
}

/// Mailbox backend speaking IMAP directly
///
/// The session is opened lazily and dropped after any error, so the next scan
/// reconnects.
pub struct ImapBackend<C: ImapConnector = TcpConnector> {
    connector: C,
    host: String,
    port: u16,
    username: String,
    password: String,
    mailbox: String,
    session: Option<ImapSession<C::Stream>>,
}

impl<C: ImapConnector> ImapBackend<C> {
    /// Create a backend; no connection is made until the first scan
    pub fn new(
        connector: C,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        mailbox: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            mailbox: mailbox.into(),
            session: None,
        }
    }

    async fn session(&mut self) -> Result<&mut ImapSession<C::Stream>> {
        if self.session.is_none() {
            let stream = self.connector.connect(&self.host, self.port).await?;
            let mut session = ImapSession::open(stream).await?;
            session
                .command(&format!(
                    "LOGIN {} {}",
                    quote(&self.username),
                    quote(&self.password)
                ))
                .await
                .map_err(|e| match e {
                    Error::Mailbox(msg) => Error::Authentication(format!("IMAP {msg}")),
                    other => other,
                })?;
            session
                .command(&format!("SELECT {}", quote(&self.mailbox)))
                .await?;
            info!(host = %self.host, mailbox = %self.mailbox, "IMAP session established");
            self.session = Some(session);
        }
        self.session
            .as_mut()
            .ok_or_else(|| Error::Mailbox("IMAP session unavailable".into()))
    }

    async fn search_inner(&mut self, matcher: &MailMatcher) -> Result<Vec<EmailNotification>> {
        let criteria = search_criteria(matcher);
        let session = self.session().await?;
        let uids = session.uid_search(&criteria).await?;
        debug!(criteria = %criteria, hits = uids.len(), "IMAP search finished");
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let uid_set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let fetched = session
            .uid_fetch(&uid_set, "(UID INTERNALDATE BODY.PEEK[HEADER])")
            .await?;

        let mut notifications = Vec::with_capacity(fetched.len());
        for message in fetched {
            let headers = match parse_headers(&message.content) {
                Ok(headers) => headers,
                Err(e) => {
                    warn!(uid = message.uid, error = %e, "skipping message with unreadable headers");
                    continue;
                }
            };
            let received_at = message
                .internal_date
                .or(headers.date)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            notifications.push(EmailNotification::new(
                message.uid.to_string(),
                received_at,
                headers.sender,
                headers.subject,
            ));
        }
        Ok(notifications)
    }

    async fn fetch_inner(&mut self, message_id: &str) -> Result<EmailNotification> {
        let uid: u32 = message_id
            .parse()
            .map_err(|_| Error::Mailbox(format!("invalid IMAP UID: {message_id}")))?;
        let session = self.session().await?;
        let message = session
            .uid_fetch(&uid.to_string(), "(UID INTERNALDATE BODY.PEEK[])")
            .await?
            .into_iter()
            .find(|m| m.uid == uid)
            .ok_or_else(|| Error::Mailbox(format!("message UID {uid} no longer exists")))?;
        notification_from_raw(message_id, message.internal_date, &message.content)
    }
}

#[async_trait]
impl<C: ImapConnector> MailboxBackend for ImapBackend<C> {
    async fn search(&mut self, matcher: &MailMatcher) -> Result<Vec<EmailNotification>> {
        let result = self.search_inner(matcher).await;
        if result.is_err() {
            self.session = None;
        }
        result
    }

    async fn fetch_body(&mut self, message_id: &str) -> Result<EmailNotification> {
        let result = self.fetch_inner(message_id).await;
        if result.is_err() {
            self.session = None;
        }
        result
    }

    fn capabilities(&self) -> MailboxCapabilities {
        MailboxCapabilities {
            exact_time_filter: false,
        }
    }

    fn name(&self) -> &'static str {
        "imap"
    }
}
