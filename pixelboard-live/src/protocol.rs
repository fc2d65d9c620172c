//! Binary protocol spoken over the board WebSocket.
//!
//! Every frame is one bincode-encoded (`standard` config) message:
//!
//! ```text
//! client ──► server            server ──► client
//! ─────────────────            ─────────────────
//! Settings                     Settings { width, height, palette }
//! ReadRange { x0,y0,x1,y1 }    Pixels([Pixel])      | Rejected
//! ColorPixel { x,y,index }     Accepted             | Rejected
//! Subscribe                    Subscribed { id }, then Changes([PixelChange])…
//! Unsubscribe                  Unsubscribed
//! Ping                         Pong
//! ```
//!
//! A `Changes` frame is encoded once per broadcast tick and shared by every
//! subscriber.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::board::{BoardError, Pixel, PixelChange};
use crate::palette::Palette;

/// Requests sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Board dimensions and palette
    Settings,
    /// Resolved pixels of `[x0, x1) × [y0, y1)`
    ReadRange { x0: u32, y0: u32, x1: u32, y1: u32 },
    /// Paint one pixel
    ColorPixel { x: u32, y: u32, color_index: u32 },
    /// Start receiving change batches on this connection
    Subscribe,
    /// Stop receiving change batches
    Unsubscribe,
    Ping,
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    OutOfBounds,
    InvalidColor,
    InvalidRange,
}

impl From<&BoardError> for RejectReason {
    fn from(e: &BoardError) -> Self {
        match e {
            BoardError::OutOfBounds { .. } => RejectReason::OutOfBounds,
            BoardError::InvalidColor { .. } => RejectReason::InvalidColor,
            BoardError::InvalidRange { .. } => RejectReason::InvalidRange,
        }
    }
}

/// Responses and stream frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Settings {
        width: u32,
        height: u32,
        palette: Palette,
    },
    Pixels(Vec<Pixel>),
    Accepted,
    Rejected {
        reason: RejectReason,
        detail: String,
    },
    Subscribed {
        subscriber_id: Uuid,
    },
    Unsubscribed,
    /// Every change committed since the previous broadcast, in commit order
    Changes(Vec<PixelChange>),
    Pong,
}

impl ServerMessage {
    pub fn rejected(e: &BoardError) -> Self {
        ServerMessage::Rejected {
            reason: e.into(),
            detail: e.to_string(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("Request rejected ({reason:?}): {detail}")]
    Rejected { reason: RejectReason, detail: String },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Closed by server (code {code}): {reason}")]
    ClosedByServer { code: u16, reason: String },
    #[error("Connection timeout")]
    Timeout,
    #[error("WebSocket error: {0}")]
    Transport(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::Transport(e.to_string())
    }
}

/// Serialize any protocol message to its wire bytes.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

/// Deserialize a protocol message from wire bytes.
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}
