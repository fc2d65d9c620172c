//! WebSocket client for the board server.
//!
//! Requests are answered in order on the same socket. Change batches that
//! arrive while a request is in flight are buffered and handed out by
//! [`BoardClient::next_changes`].

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::board::{Pixel, PixelChange};
use crate::palette::Palette;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Board geometry and palette as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSettings {
    pub width: u32,
    pub height: u32,
    pub palette: Palette,
}

pub struct BoardClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending_changes: VecDeque<Vec<PixelChange>>,
    subscriber_id: Option<Uuid>,
}

impl BoardClient {
    /// Connect to a server at `url` (e.g. `ws://127.0.0.1:8080`).
    pub async fn connect(url: &str) -> Result<Self, ProtocolError> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        log::debug!("Connected to board server at {url}");
        Ok(Self {
            ws,
            pending_changes: VecDeque::new(),
            subscriber_id: None,
        })
    }

    pub async fn settings(&mut self) -> Result<BoardSettings, ProtocolError> {
        match self.request(ClientMessage::Settings).await? {
            ServerMessage::Settings { width, height, palette } => Ok(BoardSettings { width, height, palette }),
            other => Err(unexpected(other)),
        }
    }

    /// Resolved pixels of `[x0, x1) × [y0, y1)`, row-major.
    pub async fn read_range(&mut self, x0: u32, y0: u32, x1: u32, y1: u32) -> Result<Vec<Pixel>, ProtocolError> {
        match self.request(ClientMessage::ReadRange { x0, y0, x1, y1 }).await? {
            ServerMessage::Pixels(pixels) => Ok(pixels),
            other => Err(unexpected(other)),
        }
    }

    pub async fn color_pixel(&mut self, x: u32, y: u32, color_index: u32) -> Result<(), ProtocolError> {
        match self.request(ClientMessage::ColorPixel { x, y, color_index }).await? {
            ServerMessage::Accepted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Start the change stream. Subscribing twice returns the same id.
    pub async fn subscribe(&mut self) -> Result<Uuid, ProtocolError> {
        match self.request(ClientMessage::Subscribe).await? {
            ServerMessage::Subscribed { subscriber_id } => {
                self.subscriber_id = Some(subscriber_id);
                Ok(subscriber_id)
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn unsubscribe(&mut self) -> Result<(), ProtocolError> {
        match self.request(ClientMessage::Unsubscribe).await? {
            ServerMessage::Unsubscribed => {
                self.subscriber_id = None;
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&mut self) -> Result<(), ProtocolError> {
        match self.request(ClientMessage::Ping).await? {
            ServerMessage::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn subscriber_id(&self) -> Option<Uuid> {
        self.subscriber_id
    }

    /// Next change batch, waiting at most `timeout`.
    pub async fn next_changes(&mut self, timeout: Duration) -> Result<Vec<PixelChange>, ProtocolError> {
        if let Some(batch) = self.pending_changes.pop_front() {
            return Ok(batch);
        }

        tokio::time::timeout(timeout, async {
            loop {
                match self.read_message().await? {
                    ServerMessage::Changes(batch) => return Ok(batch),
                    other => log::debug!("Ignoring unsolicited {other:?}"),
                }
            }
        })
        .await
        .map_err(|_| ProtocolError::Timeout)?
    }

    /// Close the connection politely.
    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.ws.close(None).await?;
        Ok(())
    }

    async fn request(&mut self, msg: ClientMessage) -> Result<ServerMessage, ProtocolError> {
        self.ws.send(Message::Binary(msg.encode()?.into())).await?;

        loop {
            match self.read_message().await? {
                ServerMessage::Changes(batch) => self.pending_changes.push_back(batch),
                ServerMessage::Rejected { reason, detail } => {
                    return Err(ProtocolError::Rejected { reason, detail })
                }
                reply => return Ok(reply),
            }
        }
    }

    async fn read_message(&mut self) -> Result<ServerMessage, ProtocolError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return ServerMessage::decode(&data),
                Some(Ok(Message::Close(Some(frame)))) => {
                    return Err(ProtocolError::ClosedByServer {
                        code: frame.code.into(),
                        reason: frame.reason.as_str().to_owned(),
                    })
                }
                Some(Ok(Message::Close(None))) | None => return Err(ProtocolError::ConnectionClosed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

fn unexpected(msg: ServerMessage) -> ProtocolError {
    ProtocolError::UnexpectedMessage(format!("{msg:?}"))
}
