//! Color palettes.
//!
//! A palette is an ordered, immutable list of 24-bit RGB colors. Pixels on
//! the board never store a color directly, only an index into the active
//! palette, so resolution always goes through [`Palette::resolve`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single palette entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    /// 0xRRGGBB
    pub hex: u32,
    /// Position of this color inside its palette
    pub color_id: u32,
}

impl Color {
    pub fn new(hex: u32, color_id: u32) -> Self {
        Self {
            hex: hex & 0x00FF_FFFF,
            color_id,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Color(#{:06X}, id:{})", self.hex, self.color_id)
    }
}

/// Ordered, read-only list of colors with a stable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Palette {
    id: u32,
    colors: Vec<Color>,
}

impl Palette {
    /// Build a palette from raw `0xRRGGBB` values.
    ///
    /// An empty list is replaced by black and white so that index 0 is
    /// always resolvable.
    pub fn new(id: u32, hexes: &[u32]) -> Self {
        let hexes: &[u32] = if hexes.is_empty() {
            log::warn!("Palette {id} is empty, falling back to black and white");
            &[0x000000, 0xFFFFFF]
        } else {
            hexes
        };

        let colors = hexes
            .iter()
            .enumerate()
            .map(|(index, hex)| Color::new(*hex, index as u32))
            .collect();

        Self { id, colors }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn colors(&self) -> &[Color] {
        &self.colors
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    /// Whether `color_index` addresses an entry of this palette.
    pub fn contains(&self, color_index: u32) -> bool {
        (color_index as usize) < self.colors.len()
    }

    /// Resolve an index to its color. Out-of-range indices resolve to entry 0.
    pub fn resolve(&self, color_index: u32) -> Color {
        self.colors
            .get(color_index as usize)
            .or_else(|| self.colors.first())
            .copied()
            .unwrap_or(Color::new(0x000000, 0))
    }
}

impl Default for Palette {
    /// The classic 16-color board palette.
    fn default() -> Self {
        Self::new(0, &DEFAULT_COLORS)
    }
}

/// Colors used when no palette is configured.
pub const DEFAULT_COLORS: [u32; 16] = [
    0xFFFFFF, 0xE4E4E4, 0x888888, 0x222222,
    0xFFA7D1, 0xE50000, 0xE59500, 0xA06A42,
    0xE5D900, 0x94E044, 0x02BE01, 0x00D3DD,
    0x0083C7, 0x0000EA, 0xCF6EE4, 0x820080,
];
