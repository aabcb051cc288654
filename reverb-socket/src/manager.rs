//! WebSocket connection manager.
//!
//! Owns the single transport to the broadcast server: opens it, waits for
//! the handshake, runs the receive and keepalive loops, answers protocol
//! pings, and reconnects with exponential backoff and jitter after a loss.
//! Application frames are shown to a [`ConnectionObserver`] inline, in
//! arrival order, then handed to it again in separately spawned tasks so a
//! slow handler never stalls the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use reverb_core::config::ReverbConfig;
use reverb_core::constants;
use reverb_core::error::{ReverbError, ReverbResult};

use crate::events::{protocol, ConnectionState, Message};

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsConnection, WsMessage>;
type WsStream = SplitStream<WsConnection>;

/// Receives connection lifecycle notifications and application frames.
///
/// `on_message` runs in its own task; the other hooks are awaited inline by
/// the connection machinery and should return promptly.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// The handshake completed; `socket_id` is valid until the next disconnect.
    async fn on_connect(&self, socket_id: &str);

    /// A non-control frame arrived. Called from the receive loop in arrival
    /// order, before `on_message` is spawned for the same frame, so state
    /// that depends on frame order belongs here.
    async fn on_frame(&self, _message: &Message) {}

    /// A non-control frame arrived.
    async fn on_message(&self, message: Message) -> ReverbResult<()>;

    /// The connection was lost. Reconnection, if enabled, follows.
    async fn on_disconnect(&self);

    /// A non-fatal problem, or the fatal error that stopped reconnection.
    async fn on_error(&self, error: ReverbError);
}

/// Connection manager for a single broadcast server connection.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    /// Immutable client configuration.
    config: Arc<ReverbConfig>,
    /// Current connection state.
    state: Arc<Mutex<ConnectionState>>,
    /// Watch channel for state change notifications.
    state_tx: Arc<watch::Sender<ConnectionState>>,
    /// Write half of the socket; `None` while disconnected.
    sink: Arc<Mutex<Option<WsSink>>>,
    /// Socket id issued by the server at handshake.
    socket_id: Arc<Mutex<Option<String>>>,
    /// Number of consecutive failed connection attempts.
    reconnect_attempts: Arc<Mutex<u32>>,
    /// False once `disconnect` is called or reconnection gives up.
    running: Arc<AtomicBool>,
    /// Root cancellation token for the current `connect` call.
    shutdown: Arc<Mutex<CancellationToken>>,
    /// Handle to the task running the receive and keepalive loops.
    session_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// In-flight application dispatch tasks.
    dispatch_tasks: TaskTracker,
    /// Receiver of frames and lifecycle hooks.
    observer: Arc<Mutex<Option<Weak<dyn ConnectionObserver>>>>,
    /// Time of the most recent inbound frame of any kind.
    last_activity: Arc<Mutex<Instant>>,
    /// Signalled when a `pusher:pong` arrives.
    pong_received: Arc<Notify>,
    /// The error that ended reconnection, if any.
    fatal_error: Arc<Mutex<Option<String>>>,
}

impl ConnectionManager {
    /// Create a new ConnectionManager. Nothing happens until `connect`.
    pub fn new(config: Arc<ReverbConfig>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            state_tx: Arc::new(state_tx),
            sink: Arc::new(Mutex::new(None)),
            socket_id: Arc::new(Mutex::new(None)),
            reconnect_attempts: Arc::new(Mutex::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Mutex::new(CancellationToken::new())),
            session_task: Arc::new(Mutex::new(None)),
            dispatch_tasks: TaskTracker::new(),
            observer: Arc::new(Mutex::new(None)),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            pong_received: Arc::new(Notify::new()),
            fatal_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &ReverbConfig {
        &self.config
    }

    /// Subscribe to connection state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Get the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// The socket id of the live connection.
    pub async fn socket_id(&self) -> Option<String> {
        self.socket_id.lock().await.clone()
    }

    /// Whether the handshake completed and the transport is open.
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected && self.sink.lock().await.is_some()
    }

    /// The error that ended reconnection, once the state is `Failed`.
    pub async fn fatal_error(&self) -> Option<String> {
        self.fatal_error.lock().await.clone()
    }

    /// Number of application dispatch tasks still running.
    pub fn pending_dispatches(&self) -> usize {
        self.dispatch_tasks.len()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Update the connection state and notify watchers.
    ///
    /// `Stopped` is sticky until the next `connect`.
    async fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock().await;
        if *state == ConnectionState::Stopped && !self.is_running() {
            return;
        }
        if *state != new_state {
            info!("connection state: {} -> {}", *state, new_state);
            *state = new_state;
            let _ = self.state_tx.send(new_state);
        }
    }

    async fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.observer.lock().await.as_ref().and_then(Weak::upgrade)
    }

    async fn report_error(&self, err: ReverbError) {
        if let Some(observer) = self.observer().await {
            observer.on_error(err).await;
        }
    }

    async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    /// Calculate the reconnection delay for failed attempt number `attempt`.
    ///
    /// `min(min_delay * multiplier^(attempt-1), max_delay)` plus uniform
    /// jitter of up to 25% of that value.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let base = self.config.reconnect.base_delay(attempt);
        let jitter = rand::random::<f64>() * constants::RECONNECT_JITTER_FACTOR;
        base.mul_f64(1.0 + jitter)
    }

    /// Start the connection.
    ///
    /// Retries under the reconnect policy until the handshake succeeds, then
    /// returns while a background session task keeps the connection alive.
    /// Fails only when reconnection is disabled or exhausted, or when
    /// `disconnect` interrupts the attempt.
    pub async fn connect(&self, observer: Weak<dyn ConnectionObserver>) -> ReverbResult<()> {
        let current_state = self.state().await;
        if matches!(
            current_state,
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            debug!("already connected or connecting, skipping");
            return Ok(());
        }

        *self.observer.lock().await = Some(observer);
        *self.shutdown.lock().await = CancellationToken::new();
        *self.fatal_error.lock().await = None;
        *self.reconnect_attempts.lock().await = 0;
        self.dispatch_tasks.reopen();
        self.running.store(true, Ordering::SeqCst);

        info!(
            host = %self.config.host,
            port = self.config.port,
            scheme = %self.config.scheme,
            "connecting to broadcast server"
        );
        self.connect_with_retry().await
    }

    /// Disconnect and stop reconnection. Safe to call repeatedly.
    ///
    /// Cancels the session and every in-flight dispatch task at its next
    /// suspension point.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);

        let token = self.shutdown.lock().await.clone();
        let session = self.session_task.lock().await.take();

        self.close_transport().await;
        *self.reconnect_attempts.lock().await = 0;
        *self.observer.lock().await = None;
        self.set_state(ConnectionState::Stopped).await;

        // Cancellation last: this may be running inside a dispatch task.
        self.dispatch_tasks.close();
        token.cancel();
        if let Some(handle) = session {
            handle.abort();
        }

        info!("connection stopped");
    }

    /// Serialize and write a frame.
    pub async fn send(&self, message: &Message) -> ReverbResult<()> {
        let payload = message.serialize()?;

        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(ReverbError::Connection("not connected".into()));
        };

        sink.send(WsMessage::Text(payload)).await.map_err(|e| {
            error!("send error: {e}");
            ReverbError::Connection(format!("failed to send message: {e}"))
        })?;

        debug!(event = %message.event, channel = ?message.channel, "frame sent");
        Ok(())
    }

    /// Attempt the handshake until it succeeds or the policy gives up.
    async fn connect_with_retry(&self) -> ReverbResult<()> {
        let token = self.shutdown.lock().await.clone();

        loop {
            if !self.is_running() || token.is_cancelled() {
                return Err(stopped());
            }

            self.set_state(ConnectionState::Connecting).await;
            let err = match self.establish(&token).await {
                Ok(()) => {
                    *self.reconnect_attempts.lock().await = 0;
                    return Ok(());
                }
                Err(e) => e,
            };

            let attempt = {
                let mut attempts = self.reconnect_attempts.lock().await;
                *attempts += 1;
                *attempts
            };

            let policy = &self.config.reconnect;
            if !policy.enabled {
                error!("connection failed and reconnect is disabled: {err}");
                return Err(self.fail(format!("failed to connect: {err}")).await);
            }
            if policy.is_exhausted(attempt) {
                error!("max reconnection attempts ({attempt}) reached");
                return Err(self
                    .fail(format!("failed to connect after {attempt} attempts: {err}"))
                    .await);
            }

            let delay = self.reconnect_delay(attempt);
            warn!(
                "connection failed (attempt {attempt}), retrying in {:.1}s: {err}",
                delay.as_secs_f64()
            );
            self.set_state(ConnectionState::Reconnecting).await;

            // Wait for delay, but abort if disconnect is requested
            tokio::select! {
                _ = sleep(delay) => {},
                _ = token.cancelled() => {
                    info!("reconnection cancelled by disconnect request");
                    return Err(stopped());
                }
            }
        }
    }

    /// Record a terminal failure and stop.
    async fn fail(&self, message: String) -> ReverbError {
        *self.fatal_error.lock().await = Some(message.clone());
        self.set_state(ConnectionState::Failed).await;
        self.running.store(false, Ordering::SeqCst);
        ReverbError::Connection(message)
    }

    /// One connection attempt: open, handshake, start the session.
    ///
    /// Opening the socket and the handshake share one `handshake_timeout`.
    async fn establish(&self, shutdown: &CancellationToken) -> ReverbResult<()> {
        let url = self.config.build_url();
        let wait = self.config.handshake_timeout();
        let started = Instant::now();
        debug!(%url, "opening websocket");

        let (ws, _) = tokio::select! {
            result = timeout(wait, connect_async(url.as_str())) => result
                .map_err(|_| {
                    ReverbError::Timeout(format!(
                        "websocket connect timed out after {:.1}s",
                        wait.as_secs_f64()
                    ))
                })?
                .map_err(|e| ReverbError::Connection(format!("websocket connect failed: {e}")))?,
            _ = shutdown.cancelled() => return Err(stopped()),
        };
        let (mut sink, mut stream) = ws.split();

        let handshake = tokio::select! {
            result = self.await_handshake(&mut stream, wait.saturating_sub(started.elapsed())) => result,
            _ = shutdown.cancelled() => Err(stopped()),
        };
        let socket_id = match handshake {
            Ok(socket_id) => socket_id,
            Err(e) => {
                let _ = sink.close().await;
                return Err(e);
            }
        };

        // Checked under the sink lock: `disconnect` clears `running` before
        // it takes the sink, so a stored sink is always closed by it.
        {
            let mut slot = self.sink.lock().await;
            if !self.is_running() || shutdown.is_cancelled() {
                drop(slot);
                let _ = sink.close().await;
                return Err(stopped());
            }
            *slot = Some(sink);
            *self.socket_id.lock().await = Some(socket_id.clone());
        }
        self.touch().await;
        self.set_state(ConnectionState::Connected).await;
        info!(%socket_id, "connected");

        if let Some(observer) = self.observer().await {
            observer.on_connect(&socket_id).await;
        }

        let session = shutdown.child_token();
        let manager = self.clone();
        let root = shutdown.clone();
        let handle = tokio::spawn(async move { manager.run_session(stream, session, root).await });
        *self.session_task.lock().await = Some(handle);
        Ok(())
    }

    /// Wait up to `wait` for `pusher:connection_established` and return its socket id.
    async fn await_handshake(&self, stream: &mut WsStream, wait: Duration) -> ReverbResult<String> {
        let raw = timeout(wait, next_text_frame(stream))
            .await
            .map_err(|_| {
                ReverbError::Timeout(format!(
                    "no connection_established within {:.1}s",
                    self.config.handshake_timeout().as_secs_f64()
                ))
            })??;

        let message = Message::parse(&raw)?;
        Ok(message.connection_established()?.socket_id)
    }

    /// Run the receive and keepalive loops until one of them ends, then
    /// hand over to connection-loss handling.
    ///
    /// Boxed because reconnection spawns a fresh session from inside this one.
    fn run_session(
        self,
        stream: WsStream,
        session: CancellationToken,
        root: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let reason = tokio::select! {
                reason = self.receive_loop(stream, &root) => reason,
                reason = self.keepalive_loop() => reason,
                _ = session.cancelled() => return,
            };
            self.handle_connection_lost(reason).await;
        })
    }

    /// Consume frames one at a time until the transport closes.
    async fn receive_loop(&self, mut stream: WsStream, root: &CancellationToken) -> String {
        loop {
            let frame = match stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    error!("receive loop error: {e}");
                    self.report_error(ReverbError::Connection(format!("receive failed: {e}")))
                        .await;
                    return format!("receive error: {e}");
                }
                None => return "stream ended".to_string(),
            };
            self.touch().await;

            match frame {
                WsMessage::Text(text) => self.handle_frame(&text, root).await,
                WsMessage::Close(close) => {
                    warn!(?close, "connection closed by server");
                    return "closed by server".to_string();
                }
                WsMessage::Binary(_) => {
                    self.report_error(ReverbError::Protocol("unexpected binary frame".into()))
                        .await;
                }
                // Transport-level ping/pong is answered by tungstenite.
                _ => {}
            }
        }
    }

    /// Handle control frames inline; dispatch everything else.
    async fn handle_frame(&self, raw: &str, root: &CancellationToken) {
        let message = match Message::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping malformed frame: {e}");
                self.report_error(e).await;
                return;
            }
        };
        debug!(event = %message.event, channel = ?message.channel, "frame received");

        match message.event.as_str() {
            protocol::PING => {
                if let Err(e) = self.send(&Message::pong()).await {
                    warn!("failed to answer ping: {e}");
                }
            }
            protocol::PONG => self.pong_received.notify_one(),
            protocol::ERROR => {
                let details = message.error_data();
                error!("server error: {details}");
                self.report_error(ReverbError::Protocol(format!("server error: {details}")))
                    .await;
            }
            _ => self.spawn_dispatch(message, root).await,
        }
    }

    /// Show a frame to the observer inline, then hand it over in its own
    /// tracked task.
    async fn spawn_dispatch(&self, message: Message, root: &CancellationToken) {
        let Some(observer) = self.observer().await else {
            debug!(event = %message.event, "no observer, frame dropped");
            return;
        };
        observer.on_frame(&message).await;
        let token = root.clone();

        self.dispatch_tasks.spawn(async move {
            let event = message.event.clone();
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(%event, "dispatch cancelled");
                }
                result = observer.on_message(message) => {
                    if let Err(e) = result {
                        error!(%event, "error in message handler: {e}");
                        observer.on_error(e).await;
                    }
                }
            }
        });
    }

    /// Ping the peer when it has been silent for a full ping interval.
    ///
    /// Returns once no inbound frame arrives within the ping timeout after
    /// a ping, so a dead peer is noticed within interval plus timeout.
    async fn keepalive_loop(&self) -> String {
        let interval = self.config.keepalive.ping_interval();
        let ping_timeout = self.config.keepalive.ping_timeout();

        loop {
            let last = *self.last_activity.lock().await;
            let Some(deadline) = last.checked_add(interval) else {
                debug!("ping interval out of range, keepalive disabled");
                return std::future::pending().await;
            };
            sleep_until(deadline).await;

            if *self.last_activity.lock().await > last {
                debug!("keepalive check - connection active");
                continue;
            }

            debug!("connection idle for {:.1}s, sending ping", interval.as_secs_f64());
            if let Err(e) = self.send(&Message::ping()).await {
                return format!("keepalive ping failed: {e}");
            }

            tokio::select! {
                _ = self.pong_received.notified() => continue,
                _ = sleep(ping_timeout) => {}
            }
            if *self.last_activity.lock().await > last {
                continue;
            }

            warn!(
                "no activity within {:.1}s of ping, abandoning connection",
                ping_timeout.as_secs_f64()
            );
            return "keepalive timeout".to_string();
        }
    }

    /// Clean up after a lost connection and reconnect if allowed.
    async fn handle_connection_lost(&self, reason: String) {
        if !self.is_running() {
            return;
        }
        warn!("connection lost: {reason}");

        self.close_transport().await;
        self.set_state(ConnectionState::Disconnected).await;

        if let Some(observer) = self.observer().await {
            observer.on_disconnect().await;
        }

        if !self.is_running() {
            return;
        }
        if !self.config.reconnect.enabled {
            let err = self
                .fail(format!("connection lost and reconnect is disabled: {reason}"))
                .await;
            self.report_error(err).await;
            return;
        }

        // Brief pause to avoid rapid reconnection loops
        let token = self.shutdown.lock().await.clone();
        info!("attempting to reconnect");
        self.set_state(ConnectionState::Reconnecting).await;
        tokio::select! {
            _ = sleep(self.config.reconnect_pause()) => {},
            _ = token.cancelled() => return,
        }

        if let Err(e) = self.connect_with_retry().await {
            if self.state().await == ConnectionState::Failed {
                error!("reconnection failed: {e}");
                self.report_error(e).await;
            }
        }
    }

    /// Best-effort close of the write half; clears the socket id.
    async fn close_transport(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!("error closing websocket: {e}");
            }
        }
        *self.socket_id.lock().await = None;
    }
}

fn stopped() -> ReverbError {
    ReverbError::Connection("connection stopped".into())
}

/// Read frames until the first text frame, skipping transport pings.
async fn next_text_frame(stream: &mut WsStream) -> ReverbResult<String> {
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => return Ok(text),
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(ReverbError::Connection(
                    "connection closed during handshake".into(),
                ))
            }
            Some(Ok(WsMessage::Binary(_))) => {
                return Err(ReverbError::Protocol(
                    "unexpected binary frame during handshake".into(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(ReverbError::Connection(format!("handshake failed: {e}")))
            }
        }
    }
}
