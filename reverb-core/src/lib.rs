//! Reverb Core - Foundation types, error handling, configuration, and logging.
//!
//! This crate provides the shared foundation used by the other Reverb crates:
//! - Client configuration (credentials, endpoint, reconnect and keepalive policy)
//! - A unified error type covering every failure category
//! - Structured logging with tracing
//! - Protocol-independent constants

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;

// Re-export commonly used items at the crate root
pub use config::{KeepaliveConfig, ReconnectPolicy, ReverbConfig, Scheme, Secret};
pub use error::{ReverbError, ReverbResult};
pub use logging::init_logging;
