//! Global error types for the Reverb client.
//!
//! All error categories across the client are unified into a single
//! `ReverbError` enum with conversions from underlying library errors.

use thiserror::Error;

/// Convenience type alias for Results using ReverbError.
pub type ReverbResult<T> = Result<T, ReverbError>;

/// Unified error type covering all error categories in the client.
#[derive(Error, Debug)]
pub enum ReverbError {
    // -- Transport errors --
    /// The WebSocket could not be established or maintained, including
    /// permanent failure after reconnect attempts are exhausted.
    #[error("connection error: {0}")]
    Connection(String),

    /// A bounded wait (handshake, subscription acknowledgement) expired.
    #[error("timeout: {0}")]
    Timeout(String),

    // -- Protocol errors --
    /// Malformed frame, unexpected handshake or missing required field.
    #[error("protocol error: {0}")]
    Protocol(String),

    // -- Channel errors --
    /// Signature or identity problem detected while authenticating a channel.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The server rejected a subscription.
    #[error("subscription to {channel} failed: {message}")]
    Subscription {
        /// Channel the server refused.
        channel: String,
        /// Reason reported by the server.
        message: String,
    },

    /// A client event was triggered on a channel that is not subscribed.
    #[error("channel not subscribed: {0}")]
    NotSubscribed(String),

    /// An application handler returned an error.
    #[error("handler error: {0}")]
    Handler(String),

    // -- Configuration errors --
    /// Failed to load, parse or validate configuration.
    #[error("configuration error: {0}")]
    Config(String),

    // -- File/IO errors --
    /// File system operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Wrapping anyhow errors for interop.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReverbError {
    /// Whether this error ends the client's run loop.
    ///
    /// Only connection failures are terminal; they reach the application
    /// after reconnection was disabled or gave up.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<serde_json::Error> for ReverbError {
    fn from(e: serde_json::Error) -> Self {
        ReverbError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for ReverbError {
    fn from(e: toml::de::Error) -> Self {
        ReverbError::Config(e.to_string())
    }
}
