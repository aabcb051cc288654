//! Channel model: public, private and presence channels.
//!
//! A single [`Channel`] handle type covers all three kinds; the kind decides
//! how the subscribe frame is signed and whether a member roster is kept.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::{debug, info};

use reverb_core::error::{ReverbError, ReverbResult};
use reverb_socket::{protocol, Authenticator, ConnectionManager, MemberData, Message};

use crate::handler::{Handler, HandlerMap};

pub const PRIVATE_PREFIX: &str = "private-";
pub const PRESENCE_PREFIX: &str = "presence-";

/// Channel variant, derived from the name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    pub fn from_name(name: &str) -> Self {
        if name.starts_with(PRESENCE_PREFIX) {
            Self::Presence
        } else if name.starts_with(PRIVATE_PREFIX) {
            Self::Private
        } else {
            Self::Public
        }
    }

    /// Whether subscribing needs a signature.
    pub fn requires_auth(self) -> bool {
        !matches!(self, Self::Public)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Presence => "presence",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a channel registered with a client. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    kind: ChannelKind,
    subscribed: AtomicBool,
    handlers: HandlerMap,
    /// Presence identity `{user_id, user_info}`.
    identity: Option<Value>,
    /// Presence roster, user id to user info.
    members: RwLock<BTreeMap<String, Value>>,
    connection: ConnectionManager,
    authenticator: Authenticator,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("subscribed", &self.is_subscribed())
            .field("handlers", &self.inner.handlers.len())
            .finish()
    }
}

impl Channel {
    /// Build the channel variant matching `name`.
    ///
    /// Presence channels require `identity`; it is ignored for other kinds.
    pub(crate) fn create(
        name: &str,
        identity: Option<Value>,
        connection: ConnectionManager,
        authenticator: Authenticator,
    ) -> ReverbResult<Self> {
        let kind = ChannelKind::from_name(name);
        let identity = match kind {
            ChannelKind::Presence => Some(identity.ok_or_else(|| {
                ReverbError::Authentication(format!("presence channel {name} requires user data"))
            })?),
            _ => None,
        };

        Ok(Self {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                kind,
                subscribed: AtomicBool::new(false),
                handlers: HandlerMap::new(),
                identity,
                members: RwLock::new(BTreeMap::new()),
                connection,
                authenticator,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.inner.kind
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_subscribed(&self, subscribed: bool) {
        self.inner.subscribed.store(subscribed, Ordering::SeqCst);
    }

    /// Bind a handler for `event` (or `"*"` for every event on this channel).
    pub fn bind(&self, event: &str, handler: Handler) -> &Self {
        self.inner.handlers.bind(event, handler);
        debug!("bound handler for '{event}' on channel '{}'", self.inner.name);
        self
    }

    /// Remove `handler`, or every handler for `event` when `None`.
    pub fn unbind(&self, event: &str, handler: Option<&Handler>) -> &Self {
        self.inner.handlers.unbind(event, handler);
        self
    }

    /// Send a client event on this channel. The `client-` prefix is added
    /// when missing.
    pub async fn trigger(&self, event: &str, data: Value) -> ReverbResult<()> {
        if !self.is_subscribed() {
            return Err(ReverbError::NotSubscribed(self.inner.name.clone()));
        }

        let message = Message::client_event(&self.inner.name, event, data);
        self.inner.connection.send(&message).await?;
        debug!("triggered '{}' on channel '{}'", message.event, self.inner.name);
        Ok(())
    }

    // -- Presence --

    /// Snapshot of the presence roster. Empty for other kinds.
    pub fn members(&self) -> BTreeMap<String, Value> {
        self.inner
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn member_count(&self) -> usize {
        self.inner
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The identity this client presented on a presence channel.
    pub fn me(&self) -> Option<&Value> {
        self.inner.identity.as_ref()
    }

    // -- Subscription --

    /// Build the subscribe frame for the current socket.
    ///
    /// Private and presence channels sign with `socket_id`, which must be set.
    pub fn subscribe_frame(&self, socket_id: Option<&str>) -> ReverbResult<Message> {
        let name = self.inner.name.as_str();
        if !self.inner.kind.requires_auth() {
            return Ok(Message::subscribe(name, None, None));
        }

        let socket_id = socket_id
            .ok_or_else(|| ReverbError::Connection(format!("cannot subscribe to {name}: not connected")))?;
        let auth = self
            .inner
            .authenticator
            .authenticate(socket_id, name, self.inner.identity.as_ref())?;
        Ok(Message::subscribe(
            name,
            Some(&auth.auth),
            auth.channel_data.as_deref(),
        ))
    }

    /// Send the subscribe frame and mark the channel subscribed.
    pub(crate) async fn subscribe(&self) -> ReverbResult<()> {
        let socket_id = self.inner.connection.socket_id().await;
        let frame = self.subscribe_frame(socket_id.as_deref())?;

        // Marked first so a fast rejection is not overwritten.
        self.set_subscribed(true);
        if let Err(e) = self.inner.connection.send(&frame).await {
            self.set_subscribed(false);
            return Err(e);
        }
        info!("subscribed to {} channel: {}", self.inner.kind, self.inner.name);
        Ok(())
    }

    /// Send the unsubscribe frame. No-op when not subscribed.
    pub(crate) async fn unsubscribe(&self) -> ReverbResult<()> {
        if !self.is_subscribed() {
            return Ok(());
        }
        self.inner
            .connection
            .send(&Message::unsubscribe(&self.inner.name))
            .await?;
        self.set_subscribed(false);
        info!("unsubscribed from channel: {}", self.inner.name);
        Ok(())
    }

    // -- Dispatch --

    /// Deliver an event to this channel's handlers. Handler failures are
    /// returned, never propagated.
    pub(crate) async fn dispatch(&self, event: &str, data: &Value) -> Vec<ReverbError> {
        self.inner
            .handlers
            .dispatch(event, data, Some(&self.inner.name))
            .await
    }

    /// Apply a presence roster event. Ignored on other channel kinds.
    ///
    /// Must be called in frame arrival order, before the frame's handlers
    /// are dispatched.
    pub(crate) fn update_roster(&self, event: &str, data: &Value) {
        if self.inner.kind != ChannelKind::Presence {
            return;
        }
        let mut members = self
            .inner
            .members
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        match event {
            protocol::SUBSCRIPTION_SUCCEEDED => {
                if let Some(hash) = data.pointer("/presence/hash").and_then(Value::as_object) {
                    *members = hash.iter().map(|(id, info)| (id.clone(), info.clone())).collect();
                    debug!("presence channel initialized with {} members", members.len());
                }
            }
            protocol::MEMBER_ADDED => {
                if let Some(member) = MemberData::from_value(data) {
                    debug!("member added: {}", member.user_id);
                    members.insert(member.user_id, member.user_info);
                }
            }
            protocol::MEMBER_REMOVED => {
                if let Some(member) = MemberData::from_value(data) {
                    if members.remove(&member.user_id).is_some() {
                        debug!("member removed: {}", member.user_id);
                    }
                }
            }
            _ => {}
        }
    }
}
