//! Persistence for the pixel board.
//!
//! ```text
//! ┌─────────────┐  write_through   ┌──────────────────┐
//! │ Board       │ ───────────────► │ PersistenceGateway│
//! │ (in-memory) │                  └────────┬─────────┘
//! └──────┬──────┘                           │
//!        │ load_pixels (startup)     ┌──────┴───────┐
//!        ◄───────────────────────────┤ StoreGateway │──► PixelStore (RocksDB)
//!                                    │ Volatile     │──► (nothing)
//!                                    └──────────────┘
//! ```
//!
//! The in-memory board is the source of truth. Persistence is best-effort:
//! write-through and snapshot failures are logged, never surfaced to writers.

pub mod gateway;
pub mod rocks;

pub use gateway::{connect, spawn_snapshot_cadence, PersistenceGateway, StoreGateway, VolatileGateway};
pub use rocks::{PixelStore, SnapshotInfo, SnapshotRecord, StoreConfig, StoreError};
