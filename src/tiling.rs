//! Deterministic tile planning
//!
//! ## Overview
//! A proof is produced per tile, and every party must carve the image into
//! the *same* tiles or nothing lines up: the seller's circuits, the buyer's
//! decryption, and the verifier's offsets into each public-signal vector.
//! This module is the single source of that geometry. Given the source
//! dimensions, the channel count, and the per-tile signal budget, it derives
//! a [`TilePlan`] with no randomness and no dependence on pixel content.
//!
//! ## Shape rules
//! - The split axis is the longer image dimension; height wins ties.
//! - The tile extent along that axis is `budget / (other_dim · channels)`,
//!   integer division. A zero extent means the budget cannot fit even one
//!   pixel row/column and is an error.
//! - Full tiles of that extent are laid out first; a shorter remainder tile
//!   absorbs what is left, so tiles may have unequal extents but always
//!   cover the image exactly once.
//!
//! ## Invariants
//! - `byte_offset` is strictly increasing across tiles and equals the sum of
//!   `height · width · channels` over all earlier tiles.
//! - The tile extents along the split axis sum to the source extent.

#![forbid(unsafe_code)]

/// Identifies a tile by position in the plan.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileIdx(pub usize);

impl TileIdx {
    /// Underlying index.
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for TileIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which image dimension the planner splits along.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SplitAxis {
    /// Tiles are horizontal bands; the height is divided.
    Rows,
    /// Tiles are vertical bands; the width is divided.
    Cols,
}

impl SplitAxis {
    /// Pick the split axis for an image: the longer dimension, height on
    /// ties.
    #[inline]
    pub fn for_dims(height: usize, width: usize) -> Self {
        if height >= width {
            SplitAxis::Rows
        } else {
            SplitAxis::Cols
        }
    }

    /// Array-axis index (0 = rows, 1 = cols), the form stored on disk.
    #[inline]
    pub fn as_index(&self) -> usize {
        match self {
            SplitAxis::Rows => 0,
            SplitAxis::Cols => 1,
        }
    }
}

/// Geometry of one tile within the plan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TileDescriptor {
    /// Position of the tile in plan order.
    pub index: TileIdx,
    /// Tile height in pixels.
    pub height: usize,
    /// Tile width in pixels.
    pub width: usize,
    /// Offset of the tile's first byte in the flattened source image.
    pub byte_offset: usize,
}

impl TileDescriptor {
    /// Bytes the tile occupies in the flattened image.
    #[inline]
    pub fn byte_len(&self, channels: usize) -> usize {
        self.height * self.width * channels
    }
}

/// Planner errors.
#[derive(Debug, thiserror::Error)]
pub enum TilingError {
    /// Source image has a zero dimension.
    #[error("cannot tile an empty image ({height}x{width})")]
    EmptyImage {
        /// Source height.
        height: usize,
        /// Source width.
        width: usize,
    },
    /// The signal budget cannot fit a single pixel line along the split axis.
    #[error("signal budget {budget} is below the {required} signals one line needs")]
    BudgetTooSmall {
        /// Offered per-tile budget.
        budget: usize,
        /// Signals required for one line across the short dimension.
        required: usize,
    },
    /// A partition was requested with a zero tile extent.
    #[error("tile extent must be positive")]
    EmptyTileExtent,
}

/// Sizing helper: pick the split axis and how many lines of it fit one tile.
///
/// The axis is the longer dimension (height on ties); the extent is
/// `max_signals / (short_dim · channels)`, integer division. Errors when the
/// image is empty or the budget cannot fit one full line.
pub fn split_budget(
    height: usize,
    width: usize,
    channels: usize,
    max_signals: usize,
) -> Result<(SplitAxis, usize), TilingError> {
    if height == 0 || width == 0 || channels == 0 {
        return Err(TilingError::EmptyImage { height, width });
    }
    let axis = SplitAxis::for_dims(height, width);
    let cross_extent = match axis {
        SplitAxis::Rows => width,
        SplitAxis::Cols => height,
    };
    let line_signals = cross_extent * channels;
    let tile_extent = max_signals / line_signals;
    if tile_extent == 0 {
        return Err(TilingError::BudgetTooSmall { budget: max_signals, required: line_signals });
    }
    Ok((axis, tile_extent))
}

/// The full tiling of one image: split axis plus ordered tile descriptors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TilePlan {
    /// Axis the image is split along.
    pub axis: SplitAxis,
    /// Tiles in layout order.
    pub tiles: Vec<TileDescriptor>,
    /// Source image height.
    pub source_height: usize,
    /// Source image width.
    pub source_width: usize,
    /// Channels per pixel.
    pub channels: usize,
}

impl TilePlan {
    /// Partition an image into tiles of `tile_extent` lines along `axis`,
    /// the last tile absorbing any remainder.
    pub fn partition(
        height: usize,
        width: usize,
        channels: usize,
        tile_extent: usize,
        axis: SplitAxis,
    ) -> Result<Self, TilingError> {
        if height == 0 || width == 0 || channels == 0 {
            return Err(TilingError::EmptyImage { height, width });
        }
        if tile_extent == 0 {
            return Err(TilingError::EmptyTileExtent);
        }

        let split_extent = match axis {
            SplitAxis::Rows => height,
            SplitAxis::Cols => width,
        };
        let full = split_extent / tile_extent;
        let remainder = split_extent % tile_extent;

        let mut tiles = Vec::with_capacity(full + usize::from(remainder > 0));
        let mut byte_offset = 0usize;
        let mut push = |tiles: &mut Vec<TileDescriptor>, extent: usize| {
            let (tile_h, tile_w) = match axis {
                SplitAxis::Rows => (extent, width),
                SplitAxis::Cols => (height, extent),
            };
            let descriptor = TileDescriptor {
                index: TileIdx(tiles.len()),
                height: tile_h,
                width: tile_w,
                byte_offset,
            };
            byte_offset += descriptor.byte_len(channels);
            tiles.push(descriptor);
        };

        for _ in 0..full {
            push(&mut tiles, tile_extent);
        }
        if remainder > 0 {
            push(&mut tiles, remainder);
        }

        Ok(Self { axis, tiles, source_height: height, source_width: width, channels })
    }

    /// Derive the plan for a `height x width x channels` image under a
    /// per-tile signal budget: [`split_budget`] then [`TilePlan::partition`].
    pub fn compute(
        height: usize,
        width: usize,
        channels: usize,
        budget: usize,
    ) -> Result<Self, TilingError> {
        let (axis, tile_extent) = split_budget(height, width, channels, budget)?;
        Self::partition(height, width, channels, tile_extent, axis)
    }

    /// Number of tiles in the plan.
    #[inline]
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Total bytes across all tiles; always `height · width · channels`.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.source_height * self.source_width * self.channels
    }

    /// `(height, width)` pairs in plan order, the shape list recorded in the
    /// session manifest.
    pub fn tile_shapes(&self) -> Vec<(usize, usize)> {
        self.tiles.iter().map(|t| (t.height, t.width)).collect()
    }
}

/// Offsets into a tile's public-signal vector.
///
/// The prover's public vector for tile `i` is laid out as
///
/// ```text
/// [ leading commitments | tile ciphertext (h_i·w_i·c) | preview pixels ]
/// ```
///
/// Only the leading length is configuration; the ciphertext length follows
/// from the tile geometry, and the preview occupies the rest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SignalLayout {
    /// Signals before the ciphertext block: tags, hashes and key commitments
    /// emitted by the circuit ahead of any pixel data.
    pub leading: usize,
}

/// Leading public signals the reference circuit emits before pixel data.
pub const DEFAULT_LEADING_SIGNALS: usize = 12;

impl Default for SignalLayout {
    fn default() -> Self {
        Self { leading: DEFAULT_LEADING_SIGNALS }
    }
}

impl SignalLayout {
    /// Range of the tile-ciphertext block within the public vector.
    #[inline]
    pub fn ciphertext_range(&self, tile: &TileDescriptor, channels: usize) -> std::ops::Range<usize> {
        self.leading..self.leading + tile.byte_len(channels)
    }

    /// Index of the first preview signal for this tile.
    #[inline]
    pub fn preview_offset(&self, tile: &TileDescriptor, channels: usize) -> usize {
        self.leading + tile.byte_len(channels)
    }
}
