//! Error taxonomy for broker, dispatch, and service operations.

use std::time::Duration;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Error type returned by application handlers.
///
/// Boxed so handler code can use `?` on any error type.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the broker, the dispatch engine, or a service.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Transport unreachable, not yet connected, or already closed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A request received no reply before its deadline.
    #[error("Request to '{subject}' timed out after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },

    /// The transport reports no subscriber for the request subject.
    #[error("No responders for '{0}'")]
    NoResponders(String),

    /// The peer answered with an error envelope.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Duplicate action names, registering against a disconnected broker,
    /// double unsubscribe, and other misuse.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Payload rejected by an action's validator.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The action's own logic failed.
    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl BrokerError {
    /// True when nobody answered within the deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True when a peer answered with an application-level failure.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub(crate) fn not_connected() -> Self {
        Self::Connection("NATS client is not connected.".to_string())
    }
}
