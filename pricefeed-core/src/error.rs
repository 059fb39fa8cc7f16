//! Error types for the price feed

use thiserror::Error;

/// Feed-wide error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// Transport-level open/send/close failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or unparsable inbound frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Subscribe/unsubscribe attempted while the transport was not open
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Reconnection gave up after the configured number of attempts
    #[error("Reconnection gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// A pending `connect` was superseded by `disconnect`
    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FeedError {
    pub fn connection(msg: impl Into<String>) -> Self {
        FeedError::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        FeedError::Protocol(msg.into())
    }

    pub fn subscription(msg: impl Into<String>) -> Self {
        FeedError::Subscription(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        FeedError::Config(msg.into())
    }

    /// Whether the error ends automatic recovery and needs a new `connect`
    pub fn is_terminal(&self) -> bool {
        matches!(self, FeedError::RetriesExhausted { .. } | FeedError::Cancelled)
    }
}

/// Result type alias for feed operations
pub type FeedResult<T> = Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            FeedError::protocol("missing ticker").to_string(),
            "Protocol error: missing ticker"
        );
        assert_eq!(
            FeedError::RetriesExhausted { attempts: 5 }.to_string(),
            "Reconnection gave up after 5 attempts"
        );
    }

    #[test]
    fn test_terminal_errors() {
        assert!(FeedError::RetriesExhausted { attempts: 5 }.is_terminal());
        assert!(FeedError::Cancelled.is_terminal());
        assert!(!FeedError::connection("refused").is_terminal());
        assert!(!FeedError::subscription("not connected").is_terminal());
    }
}
