//! Pub/sub transport abstraction and the WebSocket implementation.
//!
//! The connection manager is written against [`PubSubTransport`] /
//! [`PubSubConnection`]; [`WsTransport`] is the production implementation
//! over `tokio-tungstenite`. The wire protocol is opaque named events with
//! JSON payloads: `{"event": "...", "channel": "...", "data": {...}}`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::config::RealtimeConfig;
use crate::error::{Error, Result};

/// Channel name for a chat.
#[must_use]
pub fn chat_channel(chat_id: &str) -> String {
    format!("chat.{chat_id}")
}

/// Channel name for a user's global notification stream.
#[must_use]
pub fn user_channel(user_id: &str) -> String {
    format!("user.{user_id}")
}

/// The global-online presence group.
pub const PRESENCE_GLOBAL: &str = "presence-online";

/// Presence group covering a user's match set.
#[must_use]
pub fn presence_matches_channel(user_id: &str) -> String {
    format!("presence-matches.{user_id}")
}

/// Presence group for one chat.
#[must_use]
pub fn presence_chat_channel(chat_id: &str) -> String {
    format!("presence-chat.{chat_id}")
}

/// Whether a channel requires a signed authorization to subscribe.
/// Chat and user channels are private; `presence-*` groups always are.
#[must_use]
pub fn requires_auth(channel: &str) -> bool {
    channel.starts_with("chat.")
        || channel.starts_with("user.")
        || channel.starts_with("presence-")
}

/// Signed authorization for a private/presence channel subscription,
/// obtained from the backend's auth endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAuth {
    /// Signature over (socket id, channel name).
    pub auth: String,
    /// Optional member data for presence channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

/// One inbound event from the pub/sub backend.
#[derive(Debug, Clone)]
pub struct WireEvent {
    /// Event name.
    pub event: String,
    /// Originating channel, when channel-scoped.
    pub channel: Option<String>,
    /// Payload.
    pub payload: Value,
}

/// Serialized wire frame (both directions).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFrame {
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Event name announcing a successful connection handshake.
const EVENT_ESTABLISHED: &str = "connection.established";
/// Low-level ping/pong event names.
const EVENT_PING: &str = "ping";
/// See [`EVENT_PING`].
const EVENT_PONG: &str = "pong";

/// Factory for pub/sub connections.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Establishes a connection and completes the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on connect failure and
    /// [`Error::Timeout`] when the handshake does not complete in time.
    async fn connect(&self, config: &RealtimeConfig) -> Result<Arc<dyn PubSubConnection>>;
}

/// One live pub/sub connection.
#[async_trait]
pub trait PubSubConnection: Send + Sync {
    /// Socket id assigned by the backend during the handshake; required
    /// for private/presence channel authorization.
    fn socket_id(&self) -> &str;

    /// Whether the underlying socket is still open.
    fn is_open(&self) -> bool;

    /// Subscribes to a channel, with a signed authorization when the
    /// channel requires one.
    async fn subscribe(&self, channel: &str, auth: Option<&ChannelAuth>) -> Result<()>;

    /// Unsubscribes from a channel.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Publishes a client event.
    async fn publish(&self, event: &str, channel: Option<&str>, payload: &Value) -> Result<()>;

    /// Sends a low-level ping carrying a correlation id.
    async fn ping(&self, id: u64) -> Result<()>;

    /// Next inbound event; `None` once the connection is closed.
    async fn next_event(&self) -> Option<WireEvent>;

    /// Closes the connection.
    async fn close(&self) -> Result<()>;
}

/// Production transport over `tokio-tungstenite`.
#[derive(Debug, Default)]
pub struct WsTransport;

impl WsTransport {
    /// Creates the transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PubSubTransport for WsTransport {
    async fn connect(&self, config: &RealtimeConfig) -> Result<Arc<dyn PubSubConnection>> {
        let url = config.endpoint();
        info!(url = %url, "Connecting to pub/sub backend");

        let connect_timeout = Duration::from_millis(config.connect_timeout);
        let (ws_stream, response) =
            match tokio::time::timeout(connect_timeout, connect_async(&url)).await {
                Ok(Ok(ok)) => ok,
                Ok(Err(e)) => {
                    error!(error = %e, "WebSocket connection failed");
                    return Err(Error::network(format!("WebSocket connection failed: {e}")));
                }
                Err(_) => {
                    error!(
                        timeout_ms = config.connect_timeout,
                        "WebSocket connection timeout"
                    );
                    return Err(Error::timeout("WebSocket connection timeout"));
                }
            };

        debug!(
            status = response.status().as_u16(),
            "WebSocket stream established, awaiting handshake"
        );

        let (mut write, mut read) = ws_stream.split();

        // The backend announces the socket id in the first frame; the
        // connection is not usable before it arrives
        let socket_id = {
            let handshake = tokio::time::timeout(connect_timeout, async {
                while let Some(frame) = read.next().await {
                    let Ok(Message::Text(text)) = frame else {
                        continue;
                    };
                    let Ok(parsed) = serde_json::from_str::<WireFrame>(&text) else {
                        continue;
                    };
                    if parsed.event == EVENT_ESTABLISHED {
                        return parsed
                            .data
                            .get("socket_id")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                }
                None
            })
            .await;

            match handshake {
                Ok(Some(socket_id)) => socket_id,
                Ok(None) => {
                    return Err(Error::transport(
                        "Connection closed before handshake completed",
                    ));
                }
                Err(_) => return Err(Error::timeout("Pub/sub handshake timeout")),
            }
        };

        info!(socket_id = %socket_id, "Pub/sub connection established");

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<WireEvent>();
        let open = Arc::new(AtomicBool::new(true));

        let write_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(msg) = write_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    error!(error = %e, "Failed to write pub/sub frame");
                    break;
                }
            }
            write_open.store(false, Ordering::Release);
            let _ = write.send(Message::Close(None)).await;
        });

        let read_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<WireFrame>(&text) {
                        Ok(parsed) => {
                            let _ = event_tx.send(WireEvent {
                                event: parsed.event,
                                channel: parsed.channel,
                                payload: parsed.data,
                            });
                        }
                        Err(e) => {
                            let preview: String = text.chars().take(200).collect();
                            warn!(error = %e, preview = %preview, "Unparseable pub/sub frame");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        info!(close_frame = ?frame, "Pub/sub connection closed by server");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Pub/sub read error");
                        break;
                    }
                    _ => {}
                }
            }
            read_open.store(false, Ordering::Release);
            // Dropping event_tx ends next_event() with None
        });

        Ok(Arc::new(WsConnection {
            socket_id,
            write_tx,
            event_rx: Mutex::new(event_rx),
            open,
        }))
    }
}

/// Live WebSocket pub/sub connection.
struct WsConnection {
    socket_id: String,
    write_tx: mpsc::UnboundedSender<Message>,
    event_rx: Mutex<mpsc::UnboundedReceiver<WireEvent>>,
    open: Arc<AtomicBool>,
}

impl WsConnection {
    fn send_frame(&self, frame: &WireFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.write_tx
            .send(Message::Text(text.into()))
            .map_err(|_| Error::transport("Pub/sub connection is closed"))
    }
}

#[async_trait]
impl PubSubConnection for WsConnection {
    fn socket_id(&self) -> &str {
        &self.socket_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn subscribe(&self, channel: &str, auth: Option<&ChannelAuth>) -> Result<()> {
        let mut data = json!({ "channel": channel });
        if let Some(auth) = auth {
            data["auth"] = Value::String(auth.auth.clone());
            if let Some(channel_data) = &auth.channel_data {
                data["channel_data"] = Value::String(channel_data.clone());
            }
        }
        self.send_frame(&WireFrame {
            event: "subscribe".to_string(),
            channel: None,
            data,
        })
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.send_frame(&WireFrame {
            event: "unsubscribe".to_string(),
            channel: None,
            data: json!({ "channel": channel }),
        })
    }

    async fn publish(&self, event: &str, channel: Option<&str>, payload: &Value) -> Result<()> {
        self.send_frame(&WireFrame {
            event: event.to_string(),
            channel: channel.map(str::to_string),
            data: payload.clone(),
        })
    }

    async fn ping(&self, id: u64) -> Result<()> {
        self.send_frame(&WireFrame {
            event: EVENT_PING.to_string(),
            channel: None,
            data: json!({ "id": id }),
        })
    }

    async fn next_event(&self) -> Option<WireEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        let _ = self.write_tx.send(Message::Close(None));
        Ok(())
    }
}

/// Extracts a pong correlation id from a wire event, if it is a pong.
#[must_use]
pub fn pong_id(event: &WireEvent) -> Option<u64> {
    if event.event == EVENT_PONG {
        event.payload.get("id").and_then(Value::as_u64)
    } else {
        None
    }
}
