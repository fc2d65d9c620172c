//! # pixelboard-live: Live state and broadcast engine for a shared pixel board
//!
//! Many clients read and paint one fixed-size board of palette-indexed
//! pixels. Writes land in memory immediately, are written through to storage
//! when a store is available, and are fanned out to every subscriber as
//! batched change frames on a fixed cadence.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ BoardClient │ ◄─────────────────► │ BoardServer  │
//! │ (per user)  │     Binary Proto    │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                            ┌───────────────┼────────────────┐
//!                            ▼               ▼                ▼
//!                     ┌────────────┐  ┌─────────────┐  ┌──────────────┐
//!                     │ Board      │  │ BroadcastHub│  │ Persistence  │
//!                     │ cells+log  │─►│ (fan-out)   │  │ Gateway      │
//!                     └─────┬──────┘  └─────────────┘  └──────┬───────┘
//!                           │        write-through            │
//!                           └────────────────────────────────►│ RocksDB
//! ```
//!
//! ## Modules
//!
//! - [`palette`]: Colors and palettes
//! - [`board`]: Cell storage, range reads, change log
//! - [`broadcast`]: Subscriber registry and cadence-driven fan-out
//! - [`protocol`]: Binary wire protocol (bincode-encoded messages)
//! - [`storage`]: RocksDB pixel store, snapshots, volatile fallback
//! - [`context`]: Startup wiring shared by the server
//! - [`server`]: WebSocket board server
//! - [`client`]: WebSocket board client

pub mod palette;
pub mod board;
pub mod broadcast;
pub mod protocol;
pub mod storage;
pub mod context;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use palette::{Color, Palette, DEFAULT_COLORS};
pub use board::{Board, BoardError, Cell, Pixel, PixelChange};
pub use broadcast::{BroadcastHub, HubConfig, HubStats, RecvError, SubscriberHandle};
pub use protocol::{ClientMessage, ProtocolError, RejectReason, ServerMessage};
pub use storage::{
    PersistenceGateway, PixelStore, SnapshotInfo, SnapshotRecord, StoreConfig, StoreError,
    StoreGateway, VolatileGateway,
};
pub use context::{CanvasConfig, CanvasContext, ConfigError};
pub use server::{BoardServer, ServerConfig, ServerStats};
pub use client::{BoardClient, BoardSettings};
