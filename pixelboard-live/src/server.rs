//! WebSocket board server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Board ──── PersistenceGateway
//!            ├── connection task ───┤     │ drain (every T)
//! Client B ──┘   (one per socket)   │     ▼
//!                                   └── BroadcastHub ──► subscribed connections
//! ```
//!
//! Each connection serves request/response traffic (settings, reads,
//! writes) and, once subscribed, forwards change batches from its
//! [`SubscriberHandle`]. A connection whose subscription overflows is
//! closed with a policy-violation close frame.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{HubConfig, RecvError, SubscriberHandle};
use crate::context::{CanvasConfig, CanvasContext, ConfigError};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::storage::StoreConfig;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub canvas: CanvasConfig,
    pub hub: HubConfig,
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            canvas: CanvasConfig::default(),
            hub: HubConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Volatile server on an ephemeral port with a fast broadcast cadence.
    pub fn for_testing(width: u32, height: u32) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            canvas: CanvasConfig::for_testing(width, height),
            hub: HubConfig {
                broadcast_interval_ms: 20,
                subscriber_capacity: 16,
            },
            store: StoreConfig::volatile(),
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let unreadable = |reason: String| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| unreadable(e.to_string()))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub pixels_written: u64,
    pub requests_rejected: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    pixels_written: AtomicU64,
    requests_rejected: AtomicU64,
}

/// Aborts the background cadences when the server stops serving.
struct CadenceGuard(Vec<JoinHandle<()>>);

impl Drop for CadenceGuard {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// The board server.
pub struct BoardServer {
    config: ServerConfig,
    ctx: Arc<CanvasContext>,
    stats: Arc<AtomicServerStats>,
}

impl BoardServer {
    /// Build the canvas context (storage, board, hub) from `config`.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        let ctx = CanvasContext::init(&config.canvas, &config.hub, &config.store)?;
        Ok(Self::with_context(config, Arc::new(ctx)))
    }

    pub fn with_context(config: ServerConfig, ctx: Arc<CanvasContext>) -> Self {
        Self {
            config,
            ctx,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn context(&self) -> &Arc<CanvasContext> {
        &self.ctx
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener until an accept error.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Serve connections until `shutdown` resolves.
    ///
    /// The broadcast and snapshot cadences live exactly as long as this call.
    /// Undelivered changes are dropped on shutdown.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), BoxError>
    where
        F: Future<Output = ()>,
    {
        let _cadences = CadenceGuard(self.ctx.spawn_cadences());
        log::info!(
            "Board server listening on {} ({}x{}, {} mode)",
            listener.local_addr()?,
            self.ctx.board.width(),
            self.ctx.board.height(),
            if self.ctx.is_volatile() { "volatile" } else { "persistent" }
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let ctx = self.ctx.clone();
                    let stats = self.stats.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, ctx, stats).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, stopping board server");
                    return Ok(());
                }
            }
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<CanvasContext>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut subscription: Option<SubscriberHandle> = None;
        let result = Self::connection_loop(ws_stream, addr, &ctx, &stats, &mut subscription).await;

        // Disconnect is the only teardown path for a subscription
        if let Some(handle) = subscription {
            ctx.hub.unsubscribe(&handle.id()).await;
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        result
    }

    async fn connection_loop(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        ctx: &CanvasContext,
        stats: &AtomicServerStats,
        subscription: &mut Option<SubscriberHandle>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming request
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                            match ClientMessage::decode(&data) {
                                Ok(request) => {
                                    let reply = Self::handle_request(request, ctx, stats, subscription).await;
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                                Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Outgoing change batch
                frame = async {
                    match subscription.as_mut() {
                        Some(handle) => handle.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(data) => {
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(RecvError::Overflow) => {
                            log::warn!("Closing {addr}: subscriber fell behind");
                            let close = CloseFrame {
                                code: CloseCode::Policy,
                                reason: "subscriber overflow".into(),
                            };
                            ws_sender.send(Message::Close(Some(close))).await?;
                            return Ok(());
                        }
                        Err(RecvError::Closed) => {
                            *subscription = None;
                        }
                    }
                }
            }
        }
    }

    async fn handle_request(
        request: ClientMessage,
        ctx: &CanvasContext,
        stats: &AtomicServerStats,
        subscription: &mut Option<SubscriberHandle>,
    ) -> ServerMessage {
        let board = &ctx.board;
        match request {
            ClientMessage::Settings => ServerMessage::Settings {
                width: board.width(),
                height: board.height(),
                palette: board.palette().as_ref().clone(),
            },

            ClientMessage::ReadRange { x0, y0, x1, y1 } => match board.read_pixels(x0, y0, x1, y1) {
                Ok(pixels) => ServerMessage::Pixels(pixels),
                Err(e) => {
                    stats.requests_rejected.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Rejected read: {e}");
                    ServerMessage::rejected(&e)
                }
            },

            ClientMessage::ColorPixel { x, y, color_index } => match board.mutate(x, y, color_index) {
                Ok(()) => {
                    stats.pixels_written.fetch_add(1, Ordering::Relaxed);
                    ServerMessage::Accepted
                }
                Err(e) => {
                    stats.requests_rejected.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Rejected write: {e}");
                    ServerMessage::rejected(&e)
                }
            },

            ClientMessage::Subscribe => {
                let subscriber_id = match subscription {
                    Some(handle) => handle.id(),
                    None => {
                        let handle = ctx.hub.subscribe().await;
                        let id = handle.id();
                        *subscription = Some(handle);
                        id
                    }
                };
                ServerMessage::Subscribed { subscriber_id }
            }

            ClientMessage::Unsubscribe => {
                if let Some(handle) = subscription.take() {
                    ctx.hub.unsubscribe(&handle.id()).await;
                }
                ServerMessage::Unsubscribed
            }

            ClientMessage::Ping => ServerMessage::Pong,
        }
    }

    pub fn stats(&self) -> ServerStats {
        let s = &self.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            pixels_written: s.pixels_written.load(Ordering::Relaxed),
            requests_rejected: s.requests_rejected.load(Ordering::Relaxed),
        }
    }
}
