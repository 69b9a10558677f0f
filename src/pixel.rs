//! Pixel grids, edge-aligned resize, and tile slicing
//!
//! ## Overview
//! [`PixelGrid`] is the in-memory image: row-major interleaved bytes plus
//! explicit shape. On top of it sit the three pixel operations the protocol
//! needs. Preview generation resizes with edge-aligned sampling. Proving
//! slices the grid into the byte blocks each tile's circuit consumes.
//! Reconstruction concatenates decrypted blocks back into a grid.
//!
//! ## Resize contract
//! A target extent `t` is reachable from a source extent `s` only when
//! `(s - 1) % (t - 1) == 0`. Sample `i` then maps to source line
//! `i · (s-1)/(t-1)`, so the first and last source lines are always kept and
//! every sample lands exactly on a source pixel. The same grid resized to
//! the same target is byte-identical everywhere, which is what lets the
//! verifier compare a recomputed preview against circuit outputs. Requests
//! off the grid fail with the full set of reachable targets so callers can
//! pick a valid one.
//!
//! File I/O goes through [`ImageBackend`] so tests can swap the PNG codec
//! for an in-memory fake.

#![forbid(unsafe_code)]

use std::path::Path;

use crate::tiling::{SplitAxis, TilePlan};

/// Pixel-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum PixelError {
    /// The underlying image codec failed to read or write a file.
    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),
    /// Requested preview extent is not edge-aligned with the source.
    #[error("cannot resize extent {source_extent} to {target}; reachable targets are {valid:?}")]
    UnsupportedResizeRatio {
        /// Source extent in pixels.
        source_extent: usize,
        /// Requested target extent.
        target: usize,
        /// Every target extent reachable from `source`.
        valid: Vec<usize>,
    },
    /// A byte buffer disagrees with the shape claimed for it.
    #[error("buffer of {actual} bytes does not match {height}x{width}x{channels}")]
    GridSize {
        /// Claimed height.
        height: usize,
        /// Claimed width.
        width: usize,
        /// Claimed channels.
        channels: usize,
        /// Actual buffer length.
        actual: usize,
    },
    /// A tile block disagrees with the geometry recorded for it.
    #[error("tile {tile}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Index of the offending tile.
        tile: usize,
        /// Shape the geometry requires.
        expected: String,
        /// Shape actually observed.
        actual: String,
    },
    /// A tile plan was derived for a different image than the one supplied.
    #[error("plan covers a {plan_height}x{plan_width} image but the grid is {height}x{width}")]
    PlanMismatch {
        /// Height the plan was computed for.
        plan_height: usize,
        /// Width the plan was computed for.
        plan_width: usize,
        /// Height of the supplied grid.
        height: usize,
        /// Width of the supplied grid.
        width: usize,
    },
    /// Block list and geometry list have different lengths.
    #[error("{actual} tile blocks supplied where geometry records {expected}")]
    TileCount {
        /// Tiles the geometry records.
        expected: usize,
        /// Blocks supplied.
        actual: usize,
    },
}

/// Row-major interleaved pixel data with explicit shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelGrid {
    data: Vec<u8>,
    height: usize,
    width: usize,
    channels: usize,
}

impl PixelGrid {
    /// Wrap a byte buffer, checking it matches the claimed shape.
    pub fn new(
        height: usize,
        width: usize,
        channels: usize,
        data: Vec<u8>,
    ) -> Result<Self, PixelError> {
        if data.len() != height * width * channels {
            return Err(PixelError::GridSize { height, width, channels, actual: data.len() });
        }
        Ok(Self { data, height, width, channels })
    }

    /// Grid height in pixels.
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Grid width in pixels.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Channels per pixel.
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Flattened bytes, row-major, channels interleaved.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the grid, returning the flattened bytes.
    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// One channel sample.
    #[inline]
    pub fn sample(&self, row: usize, col: usize, channel: usize) -> u8 {
        self.data[(row * self.width + col) * self.channels + channel]
    }

    /// Edge-aligned downsample to `target_h x target_w`.
    ///
    /// Both extents must satisfy the resize contract; the error carries the
    /// reachable target set for the failing dimension.
    pub fn resize(&self, target_h: usize, target_w: usize) -> Result<PixelGrid, PixelError> {
        let step_h = resize_step(self.height, target_h)?;
        let step_w = resize_step(self.width, target_w)?;

        let mut data = Vec::with_capacity(target_h * target_w * self.channels);
        for r in 0..target_h {
            let src_row = r * step_h;
            for c in 0..target_w {
                let at = (src_row * self.width + c * step_w) * self.channels;
                data.extend_from_slice(&self.data[at..at + self.channels]);
            }
        }
        Ok(PixelGrid { data, height: target_h, width: target_w, channels: self.channels })
    }

    /// Carve the grid into per-tile byte blocks, in plan order.
    ///
    /// Row tiles are contiguous runs of the flattened buffer and start at
    /// their descriptor's `byte_offset`; column tiles gather one segment per
    /// source row.
    pub fn slice_tiles(&self, plan: &TilePlan) -> Result<Vec<Vec<u8>>, PixelError> {
        if plan.source_height != self.height
            || plan.source_width != self.width
            || plan.channels != self.channels
        {
            return Err(PixelError::PlanMismatch {
                plan_height: plan.source_height,
                plan_width: plan.source_width,
                height: self.height,
                width: self.width,
            });
        }

        match plan.axis {
            SplitAxis::Rows => Ok(plan
                .tiles
                .iter()
                .map(|t| self.data[t.byte_offset..t.byte_offset + t.byte_len(self.channels)].to_vec())
                .collect()),
            SplitAxis::Cols => {
                let mut blocks = Vec::with_capacity(plan.tile_count());
                let mut col_start = 0usize;
                for tile in &plan.tiles {
                    let mut block = Vec::with_capacity(tile.byte_len(self.channels));
                    for row in 0..self.height {
                        let at = (row * self.width + col_start) * self.channels;
                        block.extend_from_slice(&self.data[at..at + tile.width * self.channels]);
                    }
                    col_start += tile.width;
                    blocks.push(block);
                }
                Ok(blocks)
            }
        }
    }

    /// Reassemble tile blocks into a grid, concatenating along `axis` in
    /// index order. Each block must match its recorded `(height, width)`
    /// shape exactly.
    pub fn concat_tiles(
        blocks: &[Vec<u8>],
        shapes: &[(usize, usize)],
        axis: SplitAxis,
        channels: usize,
    ) -> Result<PixelGrid, PixelError> {
        if blocks.len() != shapes.len() {
            return Err(PixelError::TileCount { expected: shapes.len(), actual: blocks.len() });
        }
        if shapes.is_empty() {
            return Err(PixelError::TileCount { expected: 0, actual: 0 });
        }

        for (i, (block, &(h, w))) in blocks.iter().zip(shapes.iter()).enumerate() {
            let expected = h * w * channels;
            if block.len() != expected {
                return Err(PixelError::ShapeMismatch {
                    tile: i,
                    expected: format!("{h}x{w}x{channels} ({expected} bytes)"),
                    actual: format!("{} bytes", block.len()),
                });
            }
            // Cross extents must agree or the bands cannot line up.
            let (cross, first_cross) = match axis {
                SplitAxis::Rows => (w, shapes[0].1),
                SplitAxis::Cols => (h, shapes[0].0),
            };
            if cross != first_cross {
                return Err(PixelError::ShapeMismatch {
                    tile: i,
                    expected: format!("cross extent {first_cross}"),
                    actual: format!("cross extent {cross}"),
                });
            }
        }

        match axis {
            SplitAxis::Rows => {
                let width = shapes[0].1;
                let height: usize = shapes.iter().map(|&(h, _)| h).sum();
                let mut data = Vec::with_capacity(height * width * channels);
                for block in blocks {
                    data.extend_from_slice(block);
                }
                PixelGrid::new(height, width, channels, data)
            }
            SplitAxis::Cols => {
                let height = shapes[0].0;
                let width: usize = shapes.iter().map(|&(_, w)| w).sum();
                let mut data = Vec::with_capacity(height * width * channels);
                for row in 0..height {
                    for (block, &(_, w)) in blocks.iter().zip(shapes.iter()) {
                        let at = row * w * channels;
                        data.extend_from_slice(&block[at..at + w * channels]);
                    }
                }
                PixelGrid::new(height, width, channels, data)
            }
        }
    }
}

/// Every preview extent reachable from `source` under the resize contract.
pub fn valid_resize_targets(source: usize) -> Vec<usize> {
    (2..=source).filter(|t| (source - 1) % (t - 1) == 0).collect()
}

fn resize_step(source: usize, target: usize) -> Result<usize, PixelError> {
    if target < 2 || target > source || (source - 1) % (target - 1) != 0 {
        return Err(PixelError::UnsupportedResizeRatio {
            source_extent: source,
            target,
            valid: valid_resize_targets(source),
        });
    }
    Ok((source - 1) / (target - 1))
}

/// File I/O and resize as seen by the pipeline.
///
/// The production implementation is [`PngCodec`]; tests substitute in-memory
/// fakes to exercise the pipeline without touching real images.
pub trait ImageBackend: Send + Sync {
    /// Load an image file into a grid.
    fn decode(&self, path: &Path) -> Result<PixelGrid, PixelError>;

    /// Write a grid to an image file; the format follows the extension.
    fn encode(&self, path: &Path, grid: &PixelGrid) -> Result<(), PixelError>;

    /// Downsample a grid. The default forwards to [`PixelGrid::resize`].
    fn resize(
        &self,
        grid: &PixelGrid,
        target_h: usize,
        target_w: usize,
    ) -> Result<PixelGrid, PixelError> {
        grid.resize(target_h, target_w)
    }
}

/// PNG-backed [`ImageBackend`]. Decoding flattens any input to 8-bit RGB.
pub struct PngCodec;

impl ImageBackend for PngCodec {
    fn decode(&self, path: &Path) -> Result<PixelGrid, PixelError> {
        let rgb = image::open(path)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        PixelGrid::new(height as usize, width as usize, 3, rgb.into_raw())
    }

    fn encode(&self, path: &Path, grid: &PixelGrid) -> Result<(), PixelError> {
        let rgb = image::RgbImage::from_raw(
            grid.width() as u32,
            grid.height() as u32,
            grid.bytes().to_vec(),
        )
        .ok_or(PixelError::GridSize {
            height: grid.height(),
            width: grid.width(),
            channels: grid.channels(),
            actual: grid.bytes().len(),
        })?;
        rgb.save(path)?;
        Ok(())
    }
}
