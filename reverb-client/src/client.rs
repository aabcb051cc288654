//! Client orchestrator.
//!
//! [`ReverbClient`] owns the connection manager, the channel registry and
//! the global handlers. It routes every inbound frame, restores channel
//! subscriptions after a reconnect and publishes lifecycle events on a
//! broadcast channel.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use reverb_core::config::ReverbConfig;
use reverb_core::constants;
use reverb_core::error::{ReverbError, ReverbResult};
use reverb_socket::{
    protocol, Authenticator, ConnectionManager, ConnectionObserver, ConnectionState, Message,
};

use crate::channel::Channel;
use crate::handler::{Handler, HandlerMap};

/// Lifecycle notifications published by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Handshake completed (initially or after a reconnect).
    Connected { socket_id: String },
    /// The transport was lost. Channels stay registered.
    Disconnected,
    /// A reported error: handler failures, protocol errors, subscription
    /// rejections, or the fatal error that ended reconnection.
    Error { message: String },
    /// The server acknowledged a channel subscription.
    SubscriptionSucceeded { channel: String },
}

impl ClientEvent {
    /// Human-readable label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            ClientEvent::Connected { .. } => "Connected",
            ClientEvent::Disconnected => "Disconnected",
            ClientEvent::Error { .. } => "Error",
            ClientEvent::SubscriptionSucceeded { .. } => "SubscriptionSucceeded",
        }
    }
}

/// Acknowledgement state of one channel subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SubscriptionStatus {
    Pending,
    Succeeded,
    Failed(String),
}

/// Client for a Pusher-protocol broadcast server.
///
/// Cheap to clone; clones share the connection and channel registry.
#[derive(Clone)]
pub struct ReverbClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connection: ConnectionManager,
    authenticator: Authenticator,
    channels: RwLock<HashMap<String, Channel>>,
    pending: Mutex<HashMap<String, watch::Sender<SubscriptionStatus>>>,
    handlers: HandlerMap,
    events: broadcast::Sender<ClientEvent>,
}

impl ReverbClient {
    pub fn new(config: ReverbConfig) -> Self {
        let authenticator = Authenticator::from_config(&config);
        let (events, _) = broadcast::channel(constants::EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(ClientInner {
                connection: ConnectionManager::new(Arc::new(config)),
                authenticator,
                channels: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                handlers: HandlerMap::new(),
                events,
            }),
        }
    }

    pub fn config(&self) -> &ReverbConfig {
        self.inner.connection.config()
    }

    /// Connect to the server, retrying under the reconnect policy.
    ///
    /// Returns once the handshake completes; the connection is then kept
    /// alive in the background until `disconnect`.
    pub async fn connect(&self) -> ReverbResult<()> {
        info!("connecting to broadcast server");
        let inner: Arc<dyn ConnectionObserver> = self.inner.clone();
        let observer: Weak<dyn ConnectionObserver> = Arc::downgrade(&inner);
        self.inner.connection.connect(observer).await
    }

    /// Close the connection and forget every channel and pending subscription.
    pub async fn disconnect(&self) {
        info!("disconnecting from broadcast server");
        self.inner.connection.disconnect().await;
        self.inner.channels.write().await.clear();
        self.inner.pending.lock().await.clear();
    }

    /// Block until the client stops.
    ///
    /// Returns `Ok` after `disconnect`, or the fatal connection error once
    /// reconnection is exhausted or disabled.
    pub async fn listen(&self) -> ReverbResult<()> {
        info!("listening for events");
        let mut state_rx = self.inner.connection.state_receiver();
        let state = match state_rx
            .wait_for(|s| matches!(s, ConnectionState::Stopped | ConnectionState::Failed))
            .await
        {
            Ok(state) => *state,
            Err(_) => return Ok(()),
        };

        match state {
            ConnectionState::Failed => {
                let message = self
                    .inner
                    .connection
                    .fatal_error()
                    .await
                    .unwrap_or_else(|| "connection failed".to_string());
                Err(ReverbError::Connection(message))
            }
            _ => Ok(()),
        }
    }

    /// Subscribe to a channel; the kind is taken from the name prefix.
    ///
    /// `identity` (`{user_id, user_info}`) is required for presence channels.
    /// Subscribing to an already registered channel returns it unchanged.
    pub async fn subscribe(&self, name: &str, identity: Option<Value>) -> ReverbResult<Channel> {
        let channel = {
            let mut channels = self.inner.channels.write().await;
            if let Some(existing) = channels.get(name) {
                warn!("already subscribed to channel: {name}");
                return Ok(existing.clone());
            }

            let channel = Channel::create(
                name,
                identity,
                self.inner.connection.clone(),
                self.inner.authenticator.clone(),
            )?;

            // Registered before the frame goes out so the acknowledgement routes.
            self.inner.arm_tracker(name).await;
            channels.insert(name.to_string(), channel.clone());
            channel
        };

        if let Err(e) = channel.subscribe().await {
            self.inner.channels.write().await.remove(name);
            self.inner.pending.lock().await.remove(name);
            return Err(e);
        }

        Ok(channel)
    }

    /// Wait until the server acknowledges the subscription to `name`.
    ///
    /// Returns immediately when already acknowledged.
    pub async fn wait_for_subscription(&self, name: &str, timeout: Duration) -> ReverbResult<()> {
        let mut status_rx = self
            .inner
            .pending
            .lock()
            .await
            .get(name)
            .map(watch::Sender::subscribe)
            .ok_or_else(|| ReverbError::NotSubscribed(name.to_string()))?;

        let status = match tokio::time::timeout(
            timeout,
            status_rx.wait_for(|s| *s != SubscriptionStatus::Pending),
        )
        .await
        {
            Ok(Ok(status)) => status.clone(),
            Ok(Err(_)) => {
                return Err(ReverbError::Connection(format!(
                    "client disconnected while subscribing to {name}"
                )))
            }
            Err(_) => SubscriptionStatus::Pending,
        };

        match status {
            SubscriptionStatus::Succeeded => Ok(()),
            SubscriptionStatus::Failed(message) => Err(ReverbError::Subscription {
                channel: name.to_string(),
                message,
            }),
            SubscriptionStatus::Pending => Err(ReverbError::Timeout(format!(
                "subscription to {name} not acknowledged within {:.1}s",
                timeout.as_secs_f64()
            ))),
        }
    }

    /// Unsubscribe and drop the channel. Unknown names are ignored.
    pub async fn unsubscribe(&self, name: &str) -> ReverbResult<()> {
        let Some(channel) = self.inner.channels.read().await.get(name).cloned() else {
            warn!("not subscribed to channel: {name}");
            return Ok(());
        };

        channel.unsubscribe().await?;
        self.inner.channels.write().await.remove(name);
        self.inner.pending.lock().await.remove(name);
        Ok(())
    }

    /// Bind a handler that receives `event` from every channel, and
    /// channel-less frames. `"*"` matches every event.
    pub fn bind(&self, event: &str, handler: Handler) -> &Self {
        self.inner.handlers.bind(event, handler);
        debug!("bound global handler for '{event}'");
        self
    }

    /// Remove a global handler, or all handlers for `event` when `None`.
    pub fn unbind(&self, event: &str, handler: Option<&Handler>) -> &Self {
        self.inner.handlers.unbind(event, handler);
        self
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_receiver()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.connection.state().await
    }

    pub async fn socket_id(&self) -> Option<String> {
        self.inner.connection.socket_id().await
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.connection.is_connected().await
    }

    /// Snapshot of the channel registry.
    pub async fn channels(&self) -> HashMap<String, Channel> {
        self.inner.channels.read().await.clone()
    }

    pub async fn channel(&self, name: &str) -> Option<Channel> {
        self.inner.channels.read().await.get(name).cloned()
    }
}

impl ClientInner {
    /// Emit a lifecycle event to all subscribers.
    fn emit(&self, event: ClientEvent) {
        let label = event.label();
        match self.events.send(event) {
            Ok(count) => debug!("client: emitted {label} to {count} subscriber(s)"),
            Err(_) => debug!("client: no subscribers for {label}"),
        }
    }

    fn report(&self, err: &ReverbError) {
        self.emit(ClientEvent::Error {
            message: err.to_string(),
        });
    }

    /// Create or reset the acknowledgement tracker for `name`.
    async fn arm_tracker(&self, name: &str) {
        let mut pending = self.pending.lock().await;
        match pending.get(name) {
            Some(tracker) => {
                tracker.send_replace(SubscriptionStatus::Pending);
            }
            None => {
                let (tracker, _) = watch::channel(SubscriptionStatus::Pending);
                pending.insert(name.to_string(), tracker);
            }
        }
    }

    /// Resolve the tracker for a subscription acknowledgement or rejection.
    async fn resolve_pending(&self, message: &Message) -> ReverbResult<()> {
        let Some(name) = message.channel.as_deref() else {
            return Ok(());
        };

        match message.event.as_str() {
            protocol::SUBSCRIPTION_SUCCEEDED => {
                if let Some(tracker) = self.pending.lock().await.get(name) {
                    tracker.send_replace(SubscriptionStatus::Succeeded);
                }
                info!("subscription confirmed: {name}");
                self.emit(ClientEvent::SubscriptionSucceeded {
                    channel: name.to_string(),
                });
                Ok(())
            }
            protocol::SUBSCRIPTION_ERROR => {
                let reason = subscription_error_reason(message);
                if let Some(channel) = self.channels.read().await.get(name) {
                    channel.set_subscribed(false);
                }
                if let Some(tracker) = self.pending.lock().await.get(name) {
                    tracker.send_replace(SubscriptionStatus::Failed(reason.clone()));
                }
                Err(ReverbError::Subscription {
                    channel: name.to_string(),
                    message: reason,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Best description of a `pusher:subscription_error` payload.
fn subscription_error_reason(message: &Message) -> String {
    match message.data.get("error").and_then(Value::as_str) {
        Some(reason) => reason.to_string(),
        None => message.error_data().to_string(),
    }
}

#[async_trait]
impl ConnectionObserver for ClientInner {
    async fn on_connect(&self, socket_id: &str) {
        info!(%socket_id, "connected");
        self.emit(ClientEvent::Connected {
            socket_id: socket_id.to_string(),
        });

        let channels: Vec<Channel> = self.channels.read().await.values().cloned().collect();
        for channel in channels.into_iter().filter(|c| !c.is_subscribed()) {
            info!("re-subscribing to channel: {}", channel.name());
            self.arm_tracker(channel.name()).await;
            if let Err(e) = channel.subscribe().await {
                error!("failed to re-subscribe to {}: {e}", channel.name());
                self.report(&e);
            }
        }
    }

    /// Roster first, so a resolved waiter sees the seeded member list.
    async fn on_frame(&self, message: &Message) {
        if let Some(name) = message.channel.as_deref() {
            if let Some(channel) = self.channels.read().await.get(name) {
                channel.update_roster(&message.event, &message.data);
            }
        }
        if let Err(e) = self.resolve_pending(message).await {
            warn!("{e}");
            self.report(&e);
        }
    }

    async fn on_message(&self, message: Message) -> ReverbResult<()> {
        let channel_name = message.channel.as_deref();
        debug!(event = %message.event, channel = ?channel_name, "routing message");

        let mut errors = Vec::new();

        let channel = match channel_name {
            Some(name) => self.channels.read().await.get(name).cloned(),
            None => None,
        };
        if let Some(channel) = channel {
            errors.extend(channel.dispatch(&message.event, &message.data).await);
        }

        errors.extend(
            self.handlers
                .dispatch(&message.event, &message.data, channel_name)
                .await,
        );

        for e in &errors {
            warn!("{e}");
            self.report(e);
        }
        Ok(())
    }

    async fn on_disconnect(&self) {
        for channel in self.channels.read().await.values() {
            channel.set_subscribed(false);
        }
        warn!("disconnected from server");
        self.emit(ClientEvent::Disconnected);
    }

    async fn on_error(&self, error: ReverbError) {
        error!("connection error: {error}");
        self.report(&error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> ReverbClient {
        ReverbClient::new(ReverbConfig::new("app-key", "app-secret", "127.0.0.1"))
    }

    #[test]
    fn test_client_event_serializes_with_type_tag() {
        let event = ClientEvent::Connected {
            socket_id: "1.2".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "connected", "socket_id": "1.2"})
        );
        assert_eq!(
            serde_json::to_value(ClientEvent::Disconnected).unwrap(),
            json!({"type": "disconnected"})
        );
    }

    #[test]
    fn test_subscription_error_reason() {
        let message = Message::new(
            protocol::SUBSCRIPTION_ERROR,
            json!({"type": "AuthError", "error": "invalid signature", "status": 401}),
        )
        .with_channel("private-x");
        assert_eq!(subscription_error_reason(&message), "invalid signature");

        let message = Message::new(
            protocol::SUBSCRIPTION_ERROR,
            json!({"message": "nope", "code": 4009}),
        );
        assert_eq!(subscription_error_reason(&message), "nope (code 4009)");
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let client = client();
        let err = client.subscribe("news", None).await.unwrap_err();
        assert!(matches!(err, ReverbError::Connection(_)));
        assert!(client.channels().await.is_empty());
        assert!(client.channel("news").await.is_none());
    }

    #[tokio::test]
    async fn test_presence_without_identity_is_rejected() {
        let client = client();
        let err = client.subscribe("presence-room", None).await.unwrap_err();
        assert!(matches!(err, ReverbError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_wait_for_unknown_subscription() {
        let client = client();
        let err = client
            .wait_for_subscription("news", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ReverbError::NotSubscribed(_)));
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_channel_is_noop() {
        let client = client();
        client.unsubscribe("news").await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_returns_after_disconnect() {
        let client = client();
        let listener = {
            let client = client.clone();
            tokio::spawn(async move { client.listen().await })
        };

        client.disconnect().await;
        let result = tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(client.state().await, ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_routing_reaches_channel_and_global_handlers() {
        let client = client();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let channel = Channel::create(
            "news",
            None,
            client.inner.connection.clone(),
            client.inner.authenticator.clone(),
        )
        .unwrap();
        client
            .inner
            .channels
            .write()
            .await
            .insert("news".into(), channel.clone());

        let channel_tx = tx.clone();
        channel.bind(
            "update",
            Handler::from_fn(move |event: String, _: Value, channel: Option<String>| {
                let tx = channel_tx.clone();
                async move {
                    let _ = tx.send(format!("channel:{event}:{}", channel.unwrap_or_default()));
                    Ok(())
                }
            }),
        );
        client.bind(
            "*",
            Handler::from_fn(move |event: String, _: Value, _: Option<String>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(format!("global:{event}"));
                    anyhow::bail!("global handler failed")
                }
            }),
        );

        let mut events = client.events();
        let message = Message::new("update", json!({"id": 1})).with_channel("news");
        client.inner.on_message(message).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "channel:update:news");
        assert_eq!(rx.recv().await.unwrap(), "global:update");
        match events.recv().await.unwrap() {
            ClientEvent::Error { message } => assert!(message.contains("global handler failed")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_acknowledgement_resolves_tracker() {
        let client = client();
        client.inner.arm_tracker("news").await;
        let mut events = client.events();

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .wait_for_subscription("news", Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;

        let ack = Message::new(protocol::SUBSCRIPTION_SUCCEEDED, json!({})).with_channel("news");
        client.inner.on_frame(&ack).await;

        waiter.await.unwrap().unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::SubscriptionSucceeded {
                channel: "news".into()
            }
        );
        // Already acknowledged: resolves immediately.
        client
            .wait_for_subscription("news", Duration::from_millis(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscription_error_fails_waiter() {
        let client = client();
        client.inner.arm_tracker("private-x").await;

        let rejection = Message::new(
            protocol::SUBSCRIPTION_ERROR,
            json!({"error": "invalid signature"}),
        )
        .with_channel("private-x");
        client.inner.on_frame(&rejection).await;

        let err = client
            .wait_for_subscription("private-x", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "subscription to private-x failed: invalid signature"
        );
    }

    #[tokio::test]
    async fn test_wait_times_out_without_acknowledgement() {
        let client = client();
        client.inner.arm_tracker("news").await;
        let err = client
            .wait_for_subscription("news", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ReverbError::Timeout(_)));
    }
}
