//! # Bridge WebSocket Server
//!
//! Exposes the delivery bridge to real-time subscribers.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  client                              BridgeServer (Axum)                │
//! │    │  GET /stream (upgrade)             │                               │
//! │    ├───────────────────────────────────►│                               │
//! │    │  {"type":"Attach","payload":       │  within ATTACH_TIMEOUT        │
//! │    │    {"scope":"all"}}                │                               │
//! │    ├───────────────────────────────────►│  bridge.attach(scope)         │
//! │    │                                    │                               │
//! │    │  {"type":"Telemetry",...}          │  one text frame per           │
//! │    │◄───────────────────────────────────┤  BridgeEvent                  │
//! │    │  {"type":"Presence",...}           │                               │
//! │    │◄───────────────────────────────────┤                               │
//! │    │  close / drop                      │  subscription dropped,        │
//! │    ├───────────────────────────────────►│  detached                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Subscribers authenticate out-of-band before connecting.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::BridgeHandle;
use crate::config::BridgeSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{BridgeEvent, ClientFrame, SubscriptionScope};

// =============================================================================
// Constants
// =============================================================================

/// A new connection must attach within this time.
pub const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

/// Ping interval to keep connections alive.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum inbound frame size. Clients only ever send `Attach`.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

// =============================================================================
// Bridge Server
// =============================================================================

/// HTTP server carrying the `/stream` WebSocket endpoint.
pub struct BridgeServer {
    bind_address: String,
    bridge: BridgeHandle,
}

/// Handle for controlling the bridge server.
#[derive(Clone)]
pub struct BridgeServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl BridgeServerHandle {
    /// Address the server actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shuts down the server.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Bridge server shutdown channel closed".into()))
    }
}

impl BridgeServer {
    pub fn new(settings: &BridgeSettings, bridge: BridgeHandle) -> Self {
        BridgeServer {
            bind_address: settings.bind_address(),
            bridge,
        }
    }

    /// Builds the router.
    pub fn router(bridge: BridgeHandle) -> Router {
        Router::new()
            .route("/stream", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(bridge)
    }

    /// Binds and starts serving; returns a handle.
    pub async fn start(self) -> SyncResult<BridgeServerHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let app = Self::router(self.bridge);

        let listener = TcpListener::bind(&self.bind_address).await.map_err(|e| {
            SyncError::Io(format!("Failed to bind to {}: {}", self.bind_address, e))
        })?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Bridge server started");

        tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_rx.recv().await;
                info!("Bridge server shutting down");
            })
            .await;

            if let Err(e) = served {
                warn!(error = %e, "Bridge server exited with error");
            }
        });

        Ok(BridgeServerHandle {
            local_addr,
            shutdown_tx,
        })
    }
}

// =============================================================================
// WebSocket Handler
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(bridge): State<BridgeHandle>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    debug!(addr = %addr, "New subscriber connection");
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, bridge, addr))
}

/// Serves one subscriber connection until either side goes away.
async fn handle_socket(socket: WebSocket, bridge: BridgeHandle, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();

    let scope = match receive_attach(&mut receiver).await {
        Ok(scope) => scope,
        Err(e) => {
            warn!(addr = %addr, error = %e, "No valid Attach frame, closing connection");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let subscription = bridge.attach(scope);
    let id = subscription.id();
    info!(subscriber = id, addr = %addr, "Subscriber connected");

    let mut ping = interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => {
                    if let Err(e) = send_event(&mut sender, &event).await {
                        debug!(subscriber = id, error = %e, "Send failed");
                        break;
                    }
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },

            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    info!(subscriber = id, "Subscriber disconnected");
                    break;
                }
                Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => {
                    debug!(subscriber = id, "Ignoring frame after attach");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(subscriber = id, error = %e, "WebSocket error");
                    break;
                }
            },

            _ = ping.tick() => {
                if sender.send(Message::Ping(axum::body::Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Dropping the subscription detaches it
    drop(subscription);
}

/// Receives and parses the Attach frame.
async fn receive_attach(receiver: &mut SplitStream<WebSocket>) -> SyncResult<SubscriptionScope> {
    let first = tokio::time::timeout(ATTACH_TIMEOUT, receiver.next())
        .await
        .map_err(|_| SyncError::Timeout(ATTACH_TIMEOUT))?;

    let text = match first {
        Some(Ok(Message::Text(t))) => t.to_string(),
        Some(Ok(Message::Binary(b))) => String::from_utf8_lossy(&b).to_string(),
        Some(Ok(_)) => return Err(SyncError::malformed("/stream", "expected an Attach frame")),
        Some(Err(e)) => return Err(SyncError::ConnectionFailed(format!("WebSocket error: {}", e))),
        None => return Err(SyncError::ConnectionFailed("Connection closed".into())),
    };

    match serde_json::from_str::<ClientFrame>(&text) {
        Ok(ClientFrame::Attach { scope }) => Ok(scope),
        Err(e) => Err(SyncError::malformed("/stream", e)),
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &BridgeEvent,
) -> SyncResult<()> {
    let json = event.to_json()?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| SyncError::ConnectionFailed(format!("Send error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::DeliveryBridge;
    use crate::metrics::SyncMetrics;
    use crate::protocol::InboundMessage;
    use std::sync::Arc;
    use telesync_core::{TelemetryEvent, TelemetryValue};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn start_server() -> (mpsc::Sender<InboundMessage>, BridgeHandle, BridgeServerHandle) {
        let settings = BridgeSettings {
            bind_addr: "127.0.0.1".into(),
            port: 0,
            reorder_hold_ms: 0,
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel(16);
        let (bridge, handle) = DeliveryBridge::new(rx, &settings, Arc::new(SyncMetrics::new()));
        tokio::spawn(bridge.run());
        let server = BridgeServer::new(&settings, handle.clone()).start().await.unwrap();
        (tx, handle, server)
    }

    #[tokio::test]
    async fn test_stream_attach_and_receive() {
        let (tx, bridge, server) = start_server().await;
        let url = format!("ws://{}/stream", server.local_addr());
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let attach = ClientFrame::Attach {
            scope: SubscriptionScope::devices(["D1"]),
        };
        ws.send(WsMessage::text(serde_json::to_string(&attach).unwrap()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while bridge.subscriber_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let event = TelemetryEvent::new("D1", 1, TelemetryValue::Float(21.5));
        tx.send(InboundMessage::Telemetry(event.clone())).await.unwrap();

        let frame = loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => break text.to_string(),
                _ => continue,
            }
        };
        let received: BridgeEvent = serde_json::from_str(&frame).unwrap();
        assert_eq!(received, BridgeEvent::Telemetry(event));

        ws.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while bridge.subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_attach_closes_connection() {
        let (_tx, bridge, server) = start_server().await;
        let url = format!("ws://{}/stream", server.local_addr());
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        ws.send(WsMessage::text("{\"type\":\"Subscribe\"}")).await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert_eq!(bridge.subscriber_count(), 0);
    }
}
