//! Client-wide constants.

use std::time::Duration;

/// Client name reported to the server in the connection URL.
pub const CLIENT_NAME: &str = "reverb-rs";

/// Client version reported to the server in the connection URL.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pusher protocol version spoken by this client.
pub const PROTOCOL_VERSION: u8 = 7;

/// Default WebSocket port.
pub const DEFAULT_PORT: u16 = 443;

/// How long to wait for `pusher:connection_established` after the socket opens.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed pause after a connection loss before the retry cycle starts.
pub const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Fraction of the backoff delay used as the upper bound of random jitter.
pub const RECONNECT_JITTER_FACTOR: f64 = 0.25;

/// Capacity of the lifecycle event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Environment variable prefix used by [`crate::config::ReverbConfig::apply_env_overrides`].
pub const ENV_PREFIX: &str = "REVERB_";
