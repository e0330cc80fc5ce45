//! Error types for conversion-tracker
//!
//! This module provides error handling for the library, including:
//! - The crate-wide [`Error`] enum and [`Result`] alias
//! - Mapping of every error onto the failure taxonomy ([`FailureKind`]) that
//!   terminal outcomes carry
//! - Remediation hints for the failure classes a user can act on

use crate::types::{CompletionChannel, FailureKind, JobId, JobState};
use thiserror::Error;

/// Result type alias for conversion-tracker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for conversion-tracker
///
/// Variants that terminate a single conversion job are normally folded into the
/// job's outcome by the session façade; only configuration problems and
/// unexpected transport failures escape as `Err`.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "service.base_url")
        key: Option<String>,
    },

    /// HTTP transport error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Transient failure that is not a reqwest error (5xx, dropped mailbox connection)
    #[error("transient network error: {0}")]
    Transient(String),

    /// The service rejected the configured credentials
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The backend leaked an internal failure (PHP warning, stack trace, pipeline error)
    #[error("server-side configuration error: {reason}")]
    ServerConfiguration {
        /// What was detected in the response
        reason: String,
        /// Short remediation hint for the user
        hint: String,
    },

    /// A downloaded artifact failed classification
    #[error("content mismatch for {artifact}: {reason}")]
    ContentMismatch {
        /// Artifact name
        artifact: String,
        /// Classifier verdict
        reason: String,
    },

    /// An attempt or time budget was exhausted
    #[error("timed out: {0}")]
    Timeout(String),

    /// No completion notification could be correlated with a file
    #[error("completion notification not received for {filename}")]
    NotificationNotFound {
        /// Filename that was never matched
        filename: String,
    },

    /// Upload was rejected or the response carried no job handle
    #[error("submission failed: {0}")]
    Submission(String),

    /// Mailbox protocol or provider API error
    #[error("mailbox error: {0}")]
    Mailbox(String),

    /// A job was asked to leave a terminal state
    #[error("job {job_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        /// Job whose transition was rejected
        job_id: JobId,
        /// Current state
        from: JobState,
        /// Requested state
        to: JobState,
    },

    /// An artifact already has a non-terminal job
    #[error("artifact {0} already has an active conversion job")]
    JobAlreadyActive(String),

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed URL
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Notification email could not be parsed
    #[error("mail parse error: {0}")]
    MailParse(#[from] mailparse::MailParseError),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Leaked backend failure, with a hint naming the channel that avoids it
    ///
    /// `channel` is the channel in use when the leak was seen.
    pub fn server_configuration(reason: impl Into<String>, channel: CompletionChannel) -> Self {
        Error::ServerConfiguration {
            reason: reason.into(),
            hint: format!(
                "the conversion backend is leaking internal errors; switch to the {} channel",
                channel.alternate().label()
            ),
        }
    }

    /// Map this error onto the failure taxonomy carried by terminal outcomes
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Network(e) if e.is_timeout() => FailureKind::TransientNetwork,
            Error::Network(e) if e.status().map(|s| s.as_u16()) == Some(401) => {
                FailureKind::Authentication
            }
            Error::Network(_) | Error::Transient(_) | Error::Io(_) | Error::Mailbox(_) => {
                FailureKind::TransientNetwork
            }
            Error::Authentication(_) => FailureKind::Authentication,
            Error::ServerConfiguration { .. } => FailureKind::ServerConfiguration,
            Error::ContentMismatch { .. } | Error::MailParse(_) | Error::Serialization(_) => {
                FailureKind::ContentMismatch
            }
            Error::Timeout(_) => FailureKind::Timeout,
            Error::NotificationNotFound { .. } => FailureKind::NotificationNotFound,
            Error::Cancelled => FailureKind::Cancelled,
            Error::Submission(_)
            | Error::Config { .. }
            | Error::InvalidUrl(_)
            | Error::InvalidTransition { .. }
            | Error::JobAlreadyActive(_)
            | Error::Other(_) => FailureKind::Submission,
        }
    }

    /// Whether a wait or scan loop must stop instead of trying again later
    ///
    /// Rejected credentials and bad configuration fail the same way on every
    /// attempt. Everything else a loop sees is logged and retried on the next pass.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config { .. })
            || matches!(
                self.failure_kind(),
                FailureKind::Authentication | FailureKind::ServerConfiguration
            )
    }

    /// Short remediation hint, if this error class has an actionable one
    pub fn remediation_hint(&self) -> Option<&str> {
        match self {
            Error::ServerConfiguration { hint, .. } => Some(hint),
            Error::Authentication(_) => Some("check the configured service and mailbox credentials"),
            _ => None,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn all_error_variants() -> Vec<(Error, FailureKind)> {
        vec![
            (
                Error::config("service.base_url", "must not be empty"),
                FailureKind::Submission,
            ),
            (
                Error::Transient("503 Service Unavailable".into()),
                FailureKind::TransientNetwork,
            ),
            (
                Error::Authentication("401".into()),
                FailureKind::Authentication,
            ),
            (
                Error::ServerConfiguration {
                    reason: "Warning: include(".into(),
                    hint: "switch channel".into(),
                },
                FailureKind::ServerConfiguration,
            ),
            (
                Error::ContentMismatch {
                    artifact: "A001.zip".into(),
                    reason: "unexpected HTML response".into(),
                },
                FailureKind::ContentMismatch,
            ),
            (
                Error::Timeout("3 attempts".into()),
                FailureKind::Timeout,
            ),
            (
                Error::NotificationNotFound {
                    filename: "A001.zip".into(),
                },
                FailureKind::NotificationNotFound,
            ),
            (
                Error::Submission("no jobid".into()),
                FailureKind::Submission,
            ),
            (
                Error::Mailbox("NO [AUTHENTICATIONFAILED]".into()),
                FailureKind::TransientNetwork,
            ),
            (Error::Cancelled, FailureKind::Cancelled),
            (
                Error::Io(std::io::Error::other("reset")),
                FailureKind::TransientNetwork,
            ),
            (
                Error::JobAlreadyActive("A001.zip".into()),
                FailureKind::Submission,
            ),
        ]
    }

    #[test]
    fn every_variant_maps_to_expected_failure_kind() {
        for (err, expected) in all_error_variants() {
            assert_eq!(
                err.failure_kind(),
                expected,
                "{err} should map to {expected:?}"
            );
        }
    }

    #[test]
    fn server_configuration_error_carries_its_hint() {
        let err = Error::ServerConfiguration {
            reason: "PHP warning in output".into(),
            hint: "switch to the email notification channel".into(),
        };

        assert_eq!(
            err.remediation_hint(),
            Some("switch to the email notification channel")
        );
        assert!(err.to_string().starts_with("server-side configuration error"));
    }

    #[test]
    fn server_configuration_hint_names_alternate_channel() {
        let err = Error::server_configuration("Warning: include(", CompletionChannel::StatusPolling);
        assert!(
            err.remediation_hint()
                .unwrap()
                .ends_with("switch to the email notification channel")
        );

        let err =
            Error::server_configuration("Warning: include(", CompletionChannel::EmailNotification);
        assert!(err.remediation_hint().unwrap().contains("HTTP status polling"));
    }

    #[test]
    fn authentication_error_has_credentials_hint() {
        let err = Error::Authentication("HTTP 401".into());
        assert!(err.remediation_hint().unwrap().contains("credentials"));
    }

    #[test]
    fn only_credential_and_configuration_errors_are_fatal_for_loops() {
        assert!(Error::Authentication("IMAP NO".into()).is_fatal());
        assert!(Error::config("mail.backend", "missing").is_fatal());
        assert!(Error::server_configuration("leak", CompletionChannel::StatusPolling).is_fatal());

        assert!(!Error::Mailbox("BAD command".into()).is_fatal());
        assert!(!Error::Transient("reset".into()).is_fatal());
        assert!(!Error::Other("message vanished".into()).is_fatal());
    }

    #[test]
    fn timeout_has_no_hint() {
        assert!(Error::Timeout("x".into()).remediation_hint().is_none());
    }

    #[test]
    fn config_helper_records_key() {
        match Error::config("batch.batch_size", "must be at least 1") {
            Error::Config { key, message } => {
                assert_eq!(key.as_deref(), Some("batch.batch_size"));
                assert_eq!(message, "must be at least 1");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
