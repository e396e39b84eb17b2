//! # Endpoint Transport
//!
//! The remote endpoint contract and its WebSocket implementation.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    WsEndpoint Round Trip                                │
//! │                                                                         │
//! │  ┌────────────┐   first call    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │ ── timeout ──► error    │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │ handshake ok                    │
//! │        │                              ▼                                 │
//! │        │                        ┌────────────┐                          │
//! │        │   any transport error  │ Connected  │ ◄─┐                      │
//! │        └─────────────────────── └─────┬──────┘   │ next call reuses    │
//! │                                       │          │ the socket           │
//! │                                 send request     │                      │
//! │                                 await reply ─────┘                      │
//! │                                 (Ping answered inline, Pong ignored)    │
//! │                                                                         │
//! │  Retry with backoff is the caller's policy (SyncAgent), not this one's. │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{OutboundBatch, SyncRequest, SyncResponse, WireMessage};

// =============================================================================
// Endpoint Contract
// =============================================================================

/// The remote authoritative log.
///
/// Implementations perform one round trip per call. A returned error means
/// nothing from that call may be applied.
#[async_trait]
pub trait SyncEndpoint: Send + Sync {
    /// Sends one page request and returns the server's reconciliation.
    async fn sync(&self, request: SyncRequest) -> SyncResult<SyncResponse>;

    /// Delivers queued invites, messages and vault operations.
    async fn post_outbound(&self, batch: OutboundBatch) -> SyncResult<()>;
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Configuration for the WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL to connect to.
    pub url: String,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Time allowed for one request/response round trip.
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            url: String::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    pub fn from_sync_config(config: &SyncConfig) -> SyncResult<Self> {
        let url = config
            .server_url()
            .ok_or_else(|| SyncError::InvalidConfig("server.url is not set".into()))?;
        Ok(TransportConfig {
            url: url.to_string(),
            connect_timeout: Duration::from_secs(config.server.connect_timeout_secs),
            request_timeout: config.request_timeout(),
        })
    }
}

// =============================================================================
// WebSocket Endpoint
// =============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`SyncEndpoint`] over a single lazily opened WebSocket.
///
/// ## Usage
/// ```rust,ignore
/// let endpoint = WsEndpoint::new(TransportConfig {
///     url: "wss://sync.example.com/v1".into(),
///     ..Default::default()
/// });
/// let response = endpoint.sync(request).await?;
/// ```
pub struct WsEndpoint {
    config: TransportConfig,
    stream: Mutex<Option<WsStream>>,
}

impl WsEndpoint {
    pub fn new(config: TransportConfig) -> Self {
        WsEndpoint {
            config,
            stream: Mutex::new(None),
        }
    }

    /// Returns true if a socket is currently open.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Closes the socket, if open.
    pub async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.send(WsMessage::Close(None)).await;
            info!("Endpoint connection closed");
        }
    }

    /// Connects with timeout.
    async fn connect_with_timeout(&self) -> SyncResult<WsStream> {
        match timeout(self.config.connect_timeout, connect_async(&self.config.url)).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                info!(url = %self.config.url, "Endpoint connected");
                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(self.config.connect_timeout.as_secs())),
        }
    }

    /// Sends `message` and waits for the next application message.
    ///
    /// The socket is dropped on any error so the next call reconnects.
    async fn round_trip(&self, message: WireMessage) -> SyncResult<WireMessage> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect_with_timeout().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(SyncError::Disconnected);
        };

        let result = match timeout(self.config.request_timeout, exchange(stream, &message)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.config.request_timeout.as_secs())),
        };
        if let Err(e) = &result {
            warn!(error = %e, msg_type = %message.type_name(), "Round trip failed, dropping connection");
            *guard = None;
        }
        result
    }
}

async fn exchange(stream: &mut WsStream, message: &WireMessage) -> SyncResult<WireMessage> {
    let json = message.to_json()?;
    debug!(msg_type = %message.type_name(), "Sending message");
    stream.send(WsMessage::Text(json.into())).await?;

    loop {
        let Some(frame) = stream.next().await else {
            return Err(SyncError::Disconnected);
        };
        match frame? {
            WsMessage::Text(text) => {
                let reply = WireMessage::from_json(&text)
                    .map_err(|e| SyncError::InvalidMessage(e.to_string()))?;
                debug!(msg_type = %reply.type_name(), "Received message");
                match reply {
                    WireMessage::Ping { timestamp } => {
                        let pong = WireMessage::pong(&timestamp).to_json()?;
                        stream.send(WsMessage::Text(pong.into())).await?;
                    }
                    WireMessage::Pong { .. } => {}
                    other => return Ok(other),
                }
            }
            WsMessage::Ping(data) => {
                stream.send(WsMessage::Pong(data)).await?;
            }
            WsMessage::Close(frame) => {
                info!(?frame, "Received close frame");
                return Err(SyncError::Disconnected);
            }
            WsMessage::Binary(_) => {
                warn!("Received unexpected binary message");
            }
            WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }
}

#[async_trait]
impl SyncEndpoint for WsEndpoint {
    async fn sync(&self, request: SyncRequest) -> SyncResult<SyncResponse> {
        match self.round_trip(WireMessage::SyncRequest(request)).await? {
            WireMessage::SyncResponse(response) => Ok(response),
            WireMessage::Error { code, message } => Err(SyncError::Server {
                status: code.parse().unwrap_or(500),
                message,
            }),
            other => Err(SyncError::InvalidMessage(format!(
                "expected SyncResponse, got {}",
                other.type_name()
            ))),
        }
    }

    async fn post_outbound(&self, batch: OutboundBatch) -> SyncResult<()> {
        let count = batch.len();
        match self.round_trip(WireMessage::PostOutbound(batch)).await? {
            WireMessage::OutboundAck { accepted } if accepted == count => Ok(()),
            WireMessage::OutboundAck { accepted } => Err(SyncError::Server {
                status: 409,
                message: format!("server accepted {} of {} outbound entries", accepted, count),
            }),
            WireMessage::Error { code, message } => Err(SyncError::Server {
                status: code.parse().unwrap_or(500),
                message,
            }),
            other => Err(SyncError::InvalidMessage(format!(
                "expected OutboundAck, got {}",
                other.type_name()
            ))),
        }
    }
}
