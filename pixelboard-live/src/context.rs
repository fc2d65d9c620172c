//! Process-wide canvas state, built once at startup and shared by `Arc`.
//!
//! Startup order:
//! 1. open the persistence gateway (volatile on failure)
//! 2. pick the palette
//! 3. create the board and hydrate it from the gateway
//! 4. create the broadcast hub

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::board::Board;
use crate::broadcast::{BroadcastHub, HubConfig};
use crate::palette::{Palette, DEFAULT_COLORS};
use crate::storage::{self, PersistenceGateway, StoreConfig};

/// Board geometry and palettes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasConfig {
    pub width: u32,
    pub height: u32,
    /// Available palettes as `0xRRGGBB` lists; the palette id is the list index
    pub palettes: Vec<Vec<u32>>,
    /// Active palette, clamped into `palettes`
    pub palette_id: usize,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: 100,
            height: 100,
            palettes: vec![DEFAULT_COLORS.to_vec()],
            palette_id: 0,
        }
    }
}

impl CanvasConfig {
    /// Small board with a black/white palette.
    pub fn for_testing(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            palettes: vec![vec![0x000000, 0xFFFFFF]],
            palette_id: 0,
        }
    }

    /// Resolve the active palette, clamping an out-of-range id.
    pub fn palette(&self) -> Palette {
        if self.palettes.is_empty() {
            log::warn!("No palettes configured, using the default palette");
            return Palette::default();
        }

        let last = self.palettes.len() - 1;
        let id = if self.palette_id > last {
            log::warn!(
                "Palette id {} is higher than the number of palettes, clamped to {last}",
                self.palette_id
            );
            last
        } else {
            self.palette_id
        };

        Palette::new(id as u32, &self.palettes[id])
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Board dimensions must be non-zero, got {width}x{height}")]
    EmptyBoard { width: u32, height: u32 },
    #[error("Board of {width}x{height} cells is too large")]
    BoardTooLarge { width: u32, height: u32 },
    #[error("Failed to read config {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// Upper bound on cell count (256M cells, 1 GiB of cell storage).
const MAX_CELLS: u64 = 1 << 28;

/// Everything the connection handlers and cadences share.
pub struct CanvasContext {
    pub board: Arc<Board>,
    pub hub: Arc<BroadcastHub>,
    pub gateway: Arc<dyn PersistenceGateway>,
    hub_config: HubConfig,
    snapshot_interval: Duration,
}

impl CanvasContext {
    /// Build the context, opening storage from `store`.
    pub fn init(canvas: &CanvasConfig, hub: &HubConfig, store: &StoreConfig) -> Result<Self, ConfigError> {
        let gateway = storage::connect(store);
        let snapshot_interval = Duration::from_secs(store.snapshot_interval_secs);
        Self::with_gateway(canvas, hub, gateway, snapshot_interval)
    }

    /// Build the context around an already-selected gateway.
    ///
    /// A zero `snapshot_interval` disables the snapshot cadence.
    pub fn with_gateway(
        canvas: &CanvasConfig,
        hub: &HubConfig,
        gateway: Arc<dyn PersistenceGateway>,
        snapshot_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let (width, height) = (canvas.width, canvas.height);
        if width == 0 || height == 0 {
            return Err(ConfigError::EmptyBoard { width, height });
        }
        if width as u64 * height as u64 > MAX_CELLS {
            return Err(ConfigError::BoardTooLarge { width, height });
        }

        let palette = Arc::new(canvas.palette());
        let board = Arc::new(Board::new(width, height, palette, gateway.clone()));

        if !gateway.is_volatile() {
            match gateway.load_pixels() {
                Ok(pixels) => {
                    let applied = board.hydrate(&pixels);
                    log::info!("Synced board with store: {applied}/{} pixels", pixels.len());
                }
                Err(e) => log::error!("Failed to load persisted pixels, starting blank: {e}"),
            }
        }

        Ok(Self {
            board,
            hub: Arc::new(BroadcastHub::new(hub.subscriber_capacity)),
            gateway,
            hub_config: hub.clone(),
            snapshot_interval,
        })
    }

    pub fn is_volatile(&self) -> bool {
        self.gateway.is_volatile()
    }

    /// Start the broadcast cadence and, when persisting, the snapshot cadence.
    pub fn spawn_cadences(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self
            .hub
            .clone()
            .spawn_cadence(self.board.clone(), self.hub_config.broadcast_interval())];

        if let Some(task) = storage::spawn_snapshot_cadence(self.gateway.clone(), self.snapshot_interval) {
            tasks.push(task);
        }
        tasks
    }
}
