//! # conversion-tracker
//!
//! Job tracking and result verification for remote document-conversion services
//! that report success unreliably.
//!
//! ## Design Philosophy
//!
//! conversion-tracker is designed to be:
//! - **Distrustful** - A job counts as done only after its deliverable was
//!   downloaded and classified; leaked backend errors inside "successful"
//!   responses are detected and surfaced
//! - **Bounded** - Every wait is limited by an attempt count or a deadline, and
//!   every wait honours a cancellation token
//! - **Channel-agnostic** - Completion is learned by polling the status endpoint
//!   or by watching a mailbox for notification emails
//! - **Event-driven** - Consumers subscribe to lifecycle events
//!
//! ## Quick Start
//!
//! ```no_run
//! use conversion_tracker::{Artifact, Config, ConversionSession, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         service: ServiceConfig {
//!             base_url: "https://convert.example.com".to_string(),
//!             username: "user".to_string(),
//!             password: "pass".to_string(),
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     };
//!
//!     let session = ConversionSession::new(config)?;
//!
//!     // Subscribe to events
//!     let mut events = session.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let outcome = session.convert(&Artifact::from_path("book.zip")?).await;
//!     println!("{:?}: {}", outcome.state, outcome.reason());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Batch upload with notification correlation
pub mod batch;
/// Response and download classification
pub mod classifier;
/// HTTP client for the conversion backend
pub mod client;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Completion-notification mail handling
pub mod mail;
/// Job submission and status polling
pub mod poller;
/// Retry logic with exponential backoff
pub mod retry;
/// Session façade
pub mod session;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use batch::BatchCorrelationCoordinator;
pub use classifier::{Classifier, classify, detect_backend_leakage};
pub use config::{
    BatchConfig, ClassifierConfig, Config, MailBackendConfig, MailConfig, PollingConfig,
    RetryConfig, ServiceConfig, UrlSelectionPolicy,
};
pub use error::{Error, Result};
pub use mail::{
    CompletionMailWatcher, ImapBackend, InMemoryMailbox, MailMatcher, MailboxBackend,
    MailboxCapabilities, SearchApiBackend, WaitOutcome, WatchContext,
};
pub use poller::{JobStatusPoller, PollOutcome};
pub use session::ConversionSession;
pub use types::{
    Artifact, ArtifactOutcome, CompletionChannel, CompletionNotice, ContentKind, ConversionJob,
    EmailNotification, Event, FailureKind, JobHandle, JobId, JobState, UrlKind,
    VerificationResult,
};
