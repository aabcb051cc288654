//! Reverb Socket - Pusher protocol transport for Reverb broadcast servers.
//!
//! This crate provides the pieces that talk to the server directly:
//! - HMAC-SHA256 signing of private and presence channel subscriptions
//! - The JSON message codec and protocol event vocabulary
//! - The WebSocket connection manager with handshake, keepalive and
//!   automatic reconnection with exponential backoff and jitter

pub mod auth;
pub mod events;
pub mod manager;

// Re-export key types
pub use auth::{Authenticator, ChannelAuth};
pub use events::{
    protocol, ConnectionEstablished, ConnectionState, ErrorData, MemberData, Message,
};
pub use manager::{ConnectionManager, ConnectionObserver};
