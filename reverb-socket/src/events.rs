//! Pusher protocol vocabulary and the wire message codec.
//!
//! Every frame is a JSON text object `{"event", "channel"?, "data"}`. The
//! protocol double-encodes `data`: structured payloads travel as a JSON
//! string inside the envelope. [`Message::parse`] undoes that once and
//! [`Message::serialize`] reapplies it.

use std::fmt;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use reverb_core::error::{ReverbError, ReverbResult};

/// Protocol event names. Matching is exact and case-sensitive.
pub mod protocol {
    /// Handshake frame carrying the socket id.
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    /// Server-reported protocol error.
    pub const ERROR: &str = "pusher:error";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
    pub const MEMBER_ADDED: &str = "pusher_internal:member_added";
    pub const MEMBER_REMOVED: &str = "pusher_internal:member_removed";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    /// User authentication. Recognized but not initiated by this client.
    pub const SIGNIN: &str = "pusher:signin";

    /// Prefix the server requires on application-originated events.
    pub const CLIENT_EVENT_PREFIX: &str = "client-";

    /// Handler key that receives every event.
    pub const WILDCARD: &str = "*";

    /// All protocol event names.
    pub const ALL: &[&str] = &[
        CONNECTION_ESTABLISHED,
        ERROR,
        SUBSCRIBE,
        UNSUBSCRIBE,
        SUBSCRIPTION_SUCCEEDED,
        SUBSCRIPTION_ERROR,
        MEMBER_ADDED,
        MEMBER_REMOVED,
        PING,
        PONG,
        SIGNIN,
    ];

    /// Whether the receive loop handles this event inline instead of
    /// dispatching it to application handlers.
    pub fn is_control_event(event: &str) -> bool {
        matches!(event, PING | PONG | ERROR)
    }

    /// Prefix `event` with `client-` unless it already carries it.
    pub fn client_event_name(event: &str) -> String {
        if event.starts_with(CLIENT_EVENT_PREFIX) {
            event.to_string()
        } else {
            format!("{CLIENT_EVENT_PREFIX}{event}")
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub event: String,
    /// Logical payload, already decoded from its string form when possible.
    pub data: Value,
    pub channel: Option<String>,
}

/// Payload of `pusher:connection_established`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionEstablished {
    pub socket_id: String,
    /// Seconds of inactivity after which the server expects a ping.
    #[serde(default)]
    pub activity_timeout: Option<u64>,
}

/// Payload of `pusher:error` and `pusher:subscription_error`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl fmt::Display for ErrorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.message.as_deref()) {
            (Some(code), Some(message)) => write!(f, "{message} (code {code})"),
            (None, Some(message)) => f.write_str(message),
            (Some(code), None) => write!(f, "code {code}"),
            (None, None) => f.write_str("unspecified error"),
        }
    }
}

/// Payload of presence member events.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberData {
    /// Member id, normalized to a string (servers send strings or numbers).
    pub user_id: String,
    pub user_info: Value,
}

impl MemberData {
    /// Extract member data from a decoded payload. Returns `None` when
    /// `user_id` is missing or not a scalar.
    pub fn from_value(data: &Value) -> Option<Self> {
        let user_id = match data.get("user_id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let user_info = data.get("user_info").cloned().unwrap_or_else(|| json!({}));
        Some(Self { user_id, user_info })
    }
}

impl Message {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Decode a raw text frame.
    ///
    /// A string `data` that itself parses as JSON is decoded once more;
    /// otherwise the string is kept as-is. A missing `data` becomes `{}`.
    pub fn parse(raw: &str) -> ReverbResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ReverbError::Protocol(format!("frame is not valid JSON: {e}")))?;
        let Value::Object(mut object) = value else {
            return Err(ReverbError::Protocol("frame is not a JSON object".into()));
        };

        let event = match object.remove("event") {
            Some(Value::String(event)) => event,
            Some(_) => return Err(ReverbError::Protocol("frame event is not a string".into())),
            None => return Err(ReverbError::Protocol("frame has no event".into())),
        };

        let channel = match object.remove("channel") {
            Some(Value::String(channel)) => Some(channel),
            _ => None,
        };

        let data = match object.remove("data") {
            Some(Value::String(encoded)) => {
                serde_json::from_str(&encoded).unwrap_or(Value::String(encoded))
            }
            Some(other) => other,
            None => Value::Object(Map::new()),
        };

        Ok(Self {
            event,
            data,
            channel,
        })
    }

    /// Encode for the wire. Objects and arrays in `data` are re-encoded as
    /// a JSON string; scalars pass through unchanged.
    pub fn serialize(&self) -> ReverbResult<String> {
        let data = match &self.data {
            structured @ (Value::Object(_) | Value::Array(_)) => {
                Value::String(serde_json::to_string(structured)?)
            }
            other => other.clone(),
        };

        let mut frame = Map::new();
        frame.insert("event".into(), Value::String(self.event.clone()));
        if let Some(channel) = &self.channel {
            frame.insert("channel".into(), Value::String(channel.clone()));
        }
        frame.insert("data".into(), data);
        Ok(serde_json::to_string(&frame)?)
    }

    /// Whether this frame is handled by the receive loop itself.
    pub fn is_control(&self) -> bool {
        protocol::is_control_event(&self.event)
    }

    // -- Frame builders --

    /// `pusher:subscribe` with optional credentials.
    pub fn subscribe(channel: &str, auth: Option<&str>, channel_data: Option<&str>) -> Self {
        let mut data = Map::new();
        data.insert("channel".into(), Value::String(channel.to_string()));
        if let Some(auth) = auth {
            data.insert("auth".into(), Value::String(auth.to_string()));
        }
        if let Some(channel_data) = channel_data {
            data.insert("channel_data".into(), Value::String(channel_data.to_string()));
        }
        Self::new(protocol::SUBSCRIBE, Value::Object(data))
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self::new(protocol::UNSUBSCRIBE, json!({ "channel": channel }))
    }

    pub fn ping() -> Self {
        Self::new(protocol::PING, json!({}))
    }

    pub fn pong() -> Self {
        Self::new(protocol::PONG, json!({}))
    }

    /// A client event on `channel`; the `client-` prefix is applied once.
    pub fn client_event(channel: &str, event: &str, data: Value) -> Self {
        Self::new(protocol::client_event_name(event), data).with_channel(channel)
    }

    // -- Typed payload views --

    /// Interpret this frame as the connection handshake.
    pub fn connection_established(&self) -> ReverbResult<ConnectionEstablished> {
        if self.event != protocol::CONNECTION_ESTABLISHED {
            return Err(ReverbError::Protocol(format!(
                "expected {}, got {}",
                protocol::CONNECTION_ESTABLISHED,
                self.event
            )));
        }
        let established: ConnectionEstablished = serde_json::from_value(self.data.clone())
            .map_err(|_| {
                ReverbError::Protocol("no socket_id in connection_established".into())
            })?;
        if established.socket_id.is_empty() {
            return Err(ReverbError::Protocol(
                "empty socket_id in connection_established".into(),
            ));
        }
        Ok(established)
    }

    /// Interpret `data` as an error payload. Plain-string payloads become
    /// the message.
    pub fn error_data(&self) -> ErrorData {
        match &self.data {
            Value::String(message) => ErrorData {
                code: None,
                message: Some(message.clone()),
            },
            other => serde_json::from_value(other.clone()).unwrap_or_default(),
        }
    }
}

/// Connection state for the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to connect.
    Disconnected,
    /// Opening the socket and waiting for the handshake.
    Connecting,
    /// Handshake complete; frames are flowing.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Reconnection was disabled or exhausted; will not retry.
    Failed,
    /// Shut down on request.
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
