//! Shared test utilities for integration tests.
//!
//! Provides an in-process broadcast server speaking enough of the Pusher
//! protocol to drive a real client: it performs the handshake, answers
//! subscriptions, records every frame it receives and can push frames or
//! drop connections on command.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::accept_async;

use reverb_client::ClientEvent;
use reverb_core::config::{ReconnectPolicy, ReverbConfig, Scheme};
use reverb_socket::{protocol, Message};

pub const APP_KEY: &str = "test-app-key";
pub const APP_SECRET: &str = "test-app-secret";

const WAIT: Duration = Duration::from_secs(5);

/// A frame the server received, tagged with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Received {
    /// 1-based connection number.
    pub connection: usize,
    pub message: Message,
}

#[derive(Debug, Clone)]
enum Command {
    Send(Message),
    DropConnections,
}

/// Server behaviour knobs.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Channels whose subscriptions are rejected with `pusher:subscription_error`.
    pub reject: HashSet<String>,
    /// Never acknowledge subscriptions.
    pub silent: bool,
}

pub struct MockServer {
    pub port: u16,
    commands: broadcast::Sender<Command>,
    frames: mpsc::UnboundedReceiver<Received>,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    /// Start a server that acknowledges every subscription.
    pub async fn start() -> Self {
        Self::start_with(ServerOptions::default()).await
    }

    pub async fn start_with(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock server");
        let port = listener.local_addr().expect("no local addr").port();

        let (commands, _) = broadcast::channel(1024);
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_commands = commands.clone();
        let accept_connections = connections.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let connection = accept_connections.fetch_add(1, Ordering::SeqCst) + 1;
                let commands = accept_commands.subscribe();
                let frames_tx = frames_tx.clone();
                let options = options.clone();
                tokio::spawn(serve_connection(tcp, connection, commands, frames_tx, options));
            }
        });

        Self {
            port,
            commands,
            frames,
            connections,
        }
    }

    /// Number of connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Push a frame to every live connection.
    pub fn broadcast(&self, message: Message) {
        let _ = self.commands.send(Command::Send(message));
    }

    /// Abruptly drop every live connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.commands.send(Command::DropConnections);
    }

    /// Next frame received from any client.
    pub async fn next_frame(&mut self) -> Received {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("mock server stopped")
    }

    /// Next frame with the given event name, skipping others.
    pub async fn next_event(&mut self, event: &str) -> Received {
        loop {
            let received = self.next_frame().await;
            if received.message.event == event {
                return received;
            }
        }
    }

    /// Assert that no frame with `event` arrives within `window`.
    pub async fn assert_no_event(&mut self, event: &str, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(received)) = tokio::time::timeout_at(deadline, self.frames.recv()).await {
            assert_ne!(received.message.event, event, "unexpected {event} frame");
        }
    }
}

/// Socket id the server hands out on `connection`.
pub fn socket_id_for(connection: usize) -> String {
    format!("{}.{}", 1000 + connection, connection)
}

async fn serve_connection(
    tcp: TcpStream,
    connection: usize,
    mut commands: broadcast::Receiver<Command>,
    frames_tx: mpsc::UnboundedSender<Received>,
    options: ServerOptions,
) {
    let Ok(ws) = accept_async(tcp).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();

    let established = Message::new(
        protocol::CONNECTION_ESTABLISHED,
        json!({"socket_id": socket_id_for(connection), "activity_timeout": 30}),
    );
    if sink.send(text(&established)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = stream.next() => {
                let raw = match frame {
                    Some(Ok(WsMessage::Text(raw))) => raw,
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let Ok(message) = Message::parse(&raw) else {
                    continue;
                };

                if message.event == protocol::SUBSCRIBE && !options.silent {
                    let reply = subscription_reply(&message, &options);
                    if sink.send(text(&reply)).await.is_err() {
                        break;
                    }
                }
                let _ = frames_tx.send(Received { connection, message });
            }
            command = commands.recv() => match command {
                Ok(Command::Send(message)) => {
                    if sink.send(text(&message)).await.is_err() {
                        break;
                    }
                }
                Ok(Command::DropConnections) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            },
        }
    }
}

fn subscription_reply(subscribe: &Message, options: &ServerOptions) -> Message {
    let channel = subscribe.data["channel"].as_str().unwrap_or_default().to_string();

    if options.reject.contains(&channel) {
        return Message::new(
            protocol::SUBSCRIPTION_ERROR,
            json!({"type": "AuthError", "error": "invalid signature", "status": 401}),
        )
        .with_channel(channel);
    }

    let data = match subscribe.data["channel_data"].as_str() {
        Some(channel_data) => {
            let member: Value = serde_json::from_str(channel_data).unwrap_or_default();
            let user_id = match &member["user_id"] {
                Value::String(id) => id.clone(),
                other => other.to_string(),
            };
            json!({"presence": {
                "ids": [user_id.clone()],
                "hash": {user_id: member["user_info"].clone()},
                "count": 1,
            }})
        }
        None => json!({}),
    };
    Message::new(protocol::SUBSCRIPTION_SUCCEEDED, data).with_channel(channel)
}

fn text(message: &Message) -> WsMessage {
    WsMessage::Text(message.serialize().expect("serializable frame"))
}

/// Client configuration pointing at the mock server with fast reconnects.
pub fn test_config(port: u16) -> ReverbConfig {
    let mut config = ReverbConfig::new(APP_KEY, APP_SECRET, "127.0.0.1")
        .with_port(port)
        .with_scheme(Scheme::Ws)
        .with_reconnect(ReconnectPolicy {
            enabled: true,
            min_delay_secs: 0.05,
            max_delay_secs: 0.2,
            multiplier: 2.0,
            max_attempts: None,
        });
    config.handshake_timeout_secs = 2.0;
    config.reconnect_pause_secs = 0.05;
    config
}

/// Wait for the first lifecycle event matching `predicate`.
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<ClientEvent>, predicate: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("client event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

/// Receive from an mpsc channel with the standard test timeout.
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for handler")
        .expect("handler channel closed")
}
