//! The live pixel grid and its pending-change log.
//!
//! Writers call [`Board::mutate`]; the broadcast cadence is the single
//! consumer of [`Board::drain_changes`]. Cells are individual atomics, so
//! reads never take a lock and never observe a torn cell. The change log is
//! guarded by a mutex that also covers the cell store and the write-through,
//! which keeps the log order and the persisted order identical to
//! last-writer-wins order on the grid.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::palette::{Color, Palette};
use crate::storage::PersistenceGateway;

/// A committed mutation, as logged and broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelChange {
    pub x: u32,
    pub y: u32,
    pub color_index: u32,
}

/// One grid position and its palette index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
    pub color_index: u32,
}

impl Cell {
    pub fn resolve(&self, palette: &Palette) -> Pixel {
        Pixel {
            x: self.x,
            y: self.y,
            color: palette.resolve(self.color_index),
        }
    }
}

/// A cell with its color resolved against the active palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pixel {
    pub x: u32,
    pub y: u32,
    pub color: Color,
}

/// Caller errors. None of them change board state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoardError {
    #[error("Pixel ({x}, {y}) is outside the {width}x{height} board")]
    OutOfBounds { x: u32, y: u32, width: u32, height: u32 },
    #[error("Color index {color_index} is not in the palette ({palette_len} colors)")]
    InvalidColor { color_index: u32, palette_len: usize },
    #[error("Invalid range ({x0}, {y0})..({x1}, {y1}) for a {width}x{height} board")]
    InvalidRange {
        x0: u32,
        y0: u32,
        x1: u32,
        y1: u32,
        width: u32,
        height: u32,
    },
}

/// Fixed-size grid of palette indices plus the log of uncommitted-to-subscribers changes.
pub struct Board {
    width: u32,
    height: u32,
    palette: Arc<Palette>,
    cells: Box<[AtomicU32]>,
    changes: Mutex<Vec<PixelChange>>,
    gateway: Arc<dyn PersistenceGateway>,
}

impl Board {
    /// Create a board with every cell at color index 0.
    pub fn new(
        width: u32,
        height: u32,
        palette: Arc<Palette>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        let size = width as usize * height as usize;
        let cells = (0..size).map(|_| AtomicU32::new(0)).collect();

        log::info!(
            "Board created: {width}x{height}, palette {} ({} colors)",
            palette.id(),
            palette.len()
        );

        Self {
            width,
            height,
            palette,
            cells,
            changes: Mutex::new(Vec::new()),
            gateway,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn palette(&self) -> &Arc<Palette> {
        &self.palette
    }

    pub fn resolve(&self, color_index: u32) -> Color {
        self.palette.resolve(color_index)
    }

    /// Set one cell, log the change and write it through to persistence.
    ///
    /// All three happen under the change-log lock, so the store sees writes
    /// in commit order. Write-through failures are logged only; the
    /// in-memory mutation stands.
    pub fn mutate(&self, x: u32, y: u32, color_index: u32) -> Result<(), BoardError> {
        self.check_bounds(x, y)?;
        if !self.palette.contains(color_index) {
            return Err(BoardError::InvalidColor {
                color_index,
                palette_len: self.palette.len(),
            });
        }

        let change = PixelChange { x, y, color_index };
        let mut changes = self.lock_changes();
        self.cells[self.offset(x, y)].store(color_index, Ordering::Release);
        changes.push(change);

        if let Err(e) = self.gateway.write_through(&change) {
            log::error!("Write-through failed for pixel ({x}, {y}): {e}");
        }

        Ok(())
    }

    /// Cells of the half-open rectangle `[x0, x1) × [y0, y1)` in row-major order.
    pub fn read_range(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> Result<Vec<Cell>, BoardError> {
        self.check_range(x0, y0, x1, y1)?;

        let mut cells = Vec::with_capacity((x1 - x0) as usize * (y1 - y0) as usize);
        for y in y0..y1 {
            for x in x0..x1 {
                cells.push(Cell {
                    x,
                    y,
                    color_index: self.cells[self.offset(x, y)].load(Ordering::Acquire),
                });
            }
        }
        Ok(cells)
    }

    /// [`read_range`](Self::read_range) with colors resolved.
    pub fn read_pixels(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> Result<Vec<Pixel>, BoardError> {
        Ok(self
            .read_range(x0, y0, x1, y1)?
            .iter()
            .map(|cell| cell.resolve(&self.palette))
            .collect())
    }

    /// Single cell lookup.
    pub fn cell(&self, x: u32, y: u32) -> Result<Cell, BoardError> {
        self.check_bounds(x, y)?;
        Ok(Cell {
            x,
            y,
            color_index: self.cells[self.offset(x, y)].load(Ordering::Acquire),
        })
    }

    /// Take every change logged since the previous drain, in commit order.
    ///
    /// Must only be called from one drain loop.
    pub fn drain_changes(&self) -> Vec<PixelChange> {
        std::mem::take(&mut *self.lock_changes())
    }

    /// Number of changes waiting for the next drain.
    pub fn pending_len(&self) -> usize {
        self.lock_changes().len()
    }

    /// Apply persisted pixels at startup.
    ///
    /// Bypasses the change log and the gateway. Out-of-bounds entries are
    /// skipped; unknown color indices fall back to 0.
    pub fn hydrate(&self, pixels: &[PixelChange]) -> usize {
        let mut applied = 0;
        for p in pixels {
            if self.check_bounds(p.x, p.y).is_err() {
                log::warn!("Skipping persisted pixel ({}, {}) outside the board", p.x, p.y);
                continue;
            }
            let color_index = if self.palette.contains(p.color_index) {
                p.color_index
            } else {
                0
            };
            self.cells[self.offset(p.x, p.y)].store(color_index, Ordering::Release);
            applied += 1;
        }
        applied
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    fn check_bounds(&self, x: u32, y: u32) -> Result<(), BoardError> {
        if x >= self.width || y >= self.height {
            return Err(BoardError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }

    fn check_range(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> Result<(), BoardError> {
        if x1 <= x0 || y1 <= y0 || x1 > self.width || y1 > self.height {
            return Err(BoardError::InvalidRange {
                x0,
                y0,
                x1,
                y1,
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }

    fn lock_changes(&self) -> MutexGuard<'_, Vec<PixelChange>> {
        self.changes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
