//! RFC 5322 message parsing on top of `mailparse`.

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};

use crate::error::Result;
use crate::types::EmailNotification;

/// Headers the watcher cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// `Subject`, decoded
    pub subject: String,
    /// `From`, decoded
    pub sender: String,
    /// `Date`, if present and parseable
    pub date: Option<DateTime<Utc>>,
    /// `Message-ID`, if present
    pub message_id: Option<String>,
}

/// Parse the header block of a message (a full message is fine too)
pub fn parse_headers(raw: &[u8]) -> Result<MessageHeaders> {
    let (headers, _) = mailparse::parse_headers(raw)?;
    Ok(MessageHeaders {
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        sender: headers.get_first_value("From").unwrap_or_default(),
        date: headers
            .get_first_value("Date")
            .and_then(|d| mailparse::dateparse(&d).ok())
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
        message_id: headers
            .get_first_value("Message-ID")
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty()),
    })
}

/// Decoded plaintext body of a message
///
/// For multipart messages the first inline `text/plain` part wins; failing that
/// the first `text/html` part is returned as-is (URLs survive in its markup).
/// Single-part messages return their decoded body.
pub fn plaintext_body(raw: &[u8]) -> Result<String> {
    let parsed = mailparse::parse_mail(raw)?;
    if parsed.subparts.is_empty() {
        return Ok(parsed.get_body()?);
    }
    if let Some(part) = find_part(&parsed, "text/plain") {
        return Ok(part.get_body()?);
    }
    if let Some(part) = find_part(&parsed, "text/html") {
        return Ok(part.get_body()?);
    }
    Ok(String::new())
}

/// Build a fully fetched notification from a raw message
///
/// `received_at` is the server-side receive time when the backend knows it; the
/// `Date` header is used otherwise.
pub(crate) fn notification_from_raw(
    message_id: &str,
    received_at: Option<DateTime<Utc>>,
    raw: &[u8],
) -> Result<EmailNotification> {
    let headers = parse_headers(raw)?;
    let body = plaintext_body(raw)?;
    let received_at = received_at
        .or(headers.date)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    Ok(EmailNotification::new(message_id, received_at, headers.sender, headers.subject).with_body(body))
}

fn find_part<'a>(mail: &'a ParsedMail<'a>, mimetype: &str) -> Option<&'a ParsedMail<'a>> {
    if mail.subparts.is_empty() {
        let inline = mail.get_content_disposition().disposition != DispositionType::Attachment;
        return (inline && mail.ctype.mimetype.eq_ignore_ascii_case(mimetype)).then_some(mail);
    }
    mail.subparts.iter().find_map(|part| find_part(part, mimetype))
}
