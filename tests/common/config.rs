//! Session configurations pointed at a mock backend

use conversion_tracker::{
    BatchConfig, CompletionChannel, Config, MailConfig, PollingConfig, RetryConfig,
    ServiceConfig,
};
use std::time::Duration;
use wiremock::MockServer;

/// Fast-polling configuration for `server`
pub fn polling_config(server: &MockServer) -> Config {
    Config {
        service: ServiceConfig {
            base_url: server.uri(),
            username: "alice".to_string(),
            password: "s3cret".to_string(),
            ..Default::default()
        },
        channel: CompletionChannel::StatusPolling,
        polling: PollingConfig {
            poll_interval: Duration::ZERO,
            max_polling_attempts: 5,
        },
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        ..Default::default()
    }
}

/// Email-channel configuration for `server` with short mail deadlines
pub fn mail_config(server: &MockServer) -> Config {
    Config {
        channel: CompletionChannel::EmailNotification,
        mail: MailConfig {
            check_interval: Duration::from_millis(10),
            wait_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        batch: BatchConfig {
            batch_size: 5,
            chunk_timeout: Duration::from_millis(400),
            inter_chunk_delay: Duration::ZERO,
        },
        ..polling_config(server)
    }
}
