//! Crate root: public surface, core aliases, and protocol-wide invariants
//!
//! This crate implements the seller side and the buyer side of a
//! proof-carrying image exchange. A seller publishes a low-resolution
//! preview together with one zero-knowledge proof per image tile; each
//! proof shows that the preview is the correct downsample of a hidden
//! original and that the attached ciphertext really encrypts that
//! original's pixels under committed keys. A buyer verifies the proofs and
//! the preview against each other before paying, then decrypts the tiles
//! and reassembles the original.
//!
//! ## Invariants
//!
//! - **Field & curve.** Pixel and key material is encoded in `ark_bn254::Fr`
//!   (`F` in this crate). The oblivious key transfer runs on the Baby
//!   Jubjub twisted Edwards curve embedded in that field; private scalars
//!   live in the prime subgroup order, which **exceeds** the base field and
//!   is therefore handled as a big integer, never as an `F`.
//!
//! - **Geometry.** A tile plan partitions the source image exactly: tile
//!   extents along the split axis sum to the source extent, byte offsets
//!   are cumulative and strictly increasing, and the final tile may be
//!   shorter than the rest. Every consumer (witness, circuits, verifier,
//!   reconstruction) derives per-tile offsets from the recorded shapes;
//!   nothing assumes a uniform extent.
//!
//! - **Public-signal contract.** Each tile's public vector is
//!   `[leading | tile ciphertext | full preview]` with
//!   [`tiling::DEFAULT_LEADING_SIGNALS`] leading entries. The preview block
//!   of **every** tile discloses the complete preview, so one reference
//!   image checks all tiles.
//!
//! - **Key schedule.** Per-tile keys derive from the shared curve point as
//!   `keccak256(x ∥ y ∥ index)` over fixed-width big-endian encodings;
//!   wrapping is XOR of those encodings and is its own inverse.
//!
//! Violating any of these surfaces as a **precise error** from the module
//! that caught it; nothing in this crate panics on malformed input.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Baby Jubjub arithmetic and uniform scalar sampling.
pub mod curve;
/// ECDH key agreement, key derivation, and master-key wrapping.
pub mod exchange;
/// Tile plans, split-axis selection, and the public-signal layout.
pub mod tiling;
/// Pixel grids, the preview resize contract, and the PNG codec seam.
pub mod pixel;
/// Witness assembly and circuit template instantiation.
pub mod witness;
/// Session manifests, parameter files, and on-disk path conventions.
pub mod manifest;
/// Resource measurement of external stages and the metrics CSV.
pub mod metrics;
/// Subprocess backends for the proving toolchain and the tile cipher.
pub mod backend;
/// The tile-parallel proving pipeline.
pub mod pipeline;
/// Session verification: proof validity and preview consistency.
pub mod verify;
/// Buyer-side tile decryption and image reconstruction.
pub mod codec;
/// IPFS publication and retrieval via Pinata.
pub mod store;

// ============================================================================
// Canonical aliases and protocol constants
// ============================================================================

/// Scalar field every encoded value lives in (BN254's Fr).
pub type F = ark_bn254::Fr;

/// Derived keys per session. The first two wrap the master keys; the rest
/// feed the in-circuit cipher schedule, so the count is part of the circuit
/// contract and cannot change independently of the templates.
pub const DEFAULT_KEY_COUNT: usize = 7;

/// Channels per pixel. The circuits are generated for RGB input.
pub const DEFAULT_CHANNELS: usize = 3;

/// Protocol constants shared by the prover, verifier, and reconstruction.
///
/// These mirror what the circuit templates were generated with; a mismatch
/// produces proofs that verify against the wrong byte ranges, so the whole
/// session carries one copy.
#[derive(Copy, Clone, Debug)]
pub struct ProtocolConfig {
    /// Number of derived keys, [`DEFAULT_KEY_COUNT`] unless the circuit
    /// family says otherwise.
    pub key_count: usize,
    /// Channels per pixel.
    pub channels: usize,
    /// Public-signal layout contract.
    pub signals: tiling::SignalLayout,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            key_count: DEFAULT_KEY_COUNT,
            channels: DEFAULT_CHANNELS,
            signals: tiling::SignalLayout::default(),
        }
    }
}

// ============================================================================
// Root-level re-exports
// ============================================================================

/// Re-export the orchestrators so downstream code has one canonical import
/// site for each role in the exchange.
pub use crate::codec::ImageReconstructor;
pub use crate::pipeline::{ProvePipeline, ProveRequest, TileSizing};
pub use crate::verify::{SessionReport, SessionVerifier};

/// Re-export the types nearly every caller touches.
pub use crate::curve::CurveParams;
pub use crate::exchange::{Key256, KeyPair};
pub use crate::manifest::{ImageInfo, SessionParams, StorageLayout};
pub use crate::tiling::{SignalLayout, SplitAxis, TileIdx, TilePlan};
