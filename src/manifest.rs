//! Session manifests, secret parameters, and artifact paths
//!
//! ## Overview
//! Three kinds of persisted state cross process boundaries in a proof
//! session, and this module owns all of them:
//!
//! - [`ImageInfo`] (`image_info.json`): the public manifest, written once at
//!   proof time and read-only afterwards. It pins the tile geometry the
//!   verifier and the decryptor must reproduce; it never drifts from the
//!   plan that produced it because it is derived from that plan directly.
//! - [`SessionParams`] (`parameters.json`): the seller's secrets for one
//!   session. Commitment keypair, commitment randomness, the two cipher
//!   master keys, and the pinning JWT. All field values are decimal strings,
//!   the only numeric form the circuit toolchain understands.
//! - [`StorageLayout`]: every filesystem path convention in one value, so
//!   path strings are built in exactly one place. Per-tile artifact
//!   directories are namespaced by tile index, which is what makes the
//!   tile-parallel pipeline collision-free.
//!
//! Writes go through [`write_atomic`]: content lands at a temporary sibling
//! path and is renamed into place, so a cancelled run never leaves a partial
//! file at a canonical path.

#![forbid(unsafe_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use num_bigint::BigUint;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::curve::{fe_from_decimal, fe_to_decimal, CurveParams, Point};
use crate::exchange::{ExchangeError, KeyPair};
use crate::tiling::{SplitAxis, TileDescriptor, TileIdx, TilePlan};
use crate::F;

/// JWT value written into a fresh `parameters.json`; uploading is refused
/// until it has been replaced.
pub const PLACEHOLDER_JWT: &str = "Insert the JWT here before uploading the proof to IPFS";

/// Manifest and parameter errors.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Filesystem failure while reading or writing.
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    /// Malformed JSON.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// `tiles` disagrees with the number of recorded shapes.
    #[error("manifest declares {declared} tiles but records {recorded} shapes")]
    CountMismatch {
        /// Value of the `tiles` field.
        declared: usize,
        /// Length of `tiles_size`.
        recorded: usize,
    },
    /// The recorded shapes do not cover the image exactly.
    #[error("tile extents sum to {covered} along the split axis, image needs {expected}")]
    CoverageMismatch {
        /// Sum of recorded extents along the split axis.
        covered: usize,
        /// Source extent along the split axis.
        expected: usize,
    },
    /// A tile's cross extent differs from the image's.
    #[error("tile {tile} has cross extent {actual}, image has {expected}")]
    RaggedCross {
        /// Offending tile index.
        tile: usize,
        /// Cross extent of the image.
        expected: usize,
        /// Cross extent recorded for the tile.
        actual: usize,
    },
    /// A dimension or tile count is zero.
    #[error("manifest geometry is empty")]
    EmptyGeometry,
    /// A stored value failed to parse as a decimal field element or scalar.
    #[error("parameter {field} holds {value:?}, not a valid decimal value")]
    BadDecimal {
        /// Name of the offending JSON field.
        field: &'static str,
        /// Stored text.
        value: String,
    },
    /// The stored commitment public key is not on the configured curve.
    #[error("stored commitment public key is not on the curve")]
    KeyOffCurve,
    /// Keypair generation failed while producing fresh parameters.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Write `bytes` to `path` via a temporary sibling file and an atomic
/// rename. Parent directories are created as needed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// ============================================================================
// Public manifest
// ============================================================================

/// The public per-session manifest, `image_info.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Session name; prefixes every uploaded artifact path.
    pub name: String,
    /// Number of tiles.
    pub tiles: usize,
    /// `(height, width)` of each tile, in index order.
    pub tiles_size: Vec<(usize, usize)>,
    /// Source image height.
    pub height: usize,
    /// Source image width.
    pub width: usize,
}

impl ImageInfo {
    /// Record the geometry of a computed plan.
    pub fn from_plan(name: impl Into<String>, plan: &TilePlan) -> Self {
        Self {
            name: name.into(),
            tiles: plan.tile_count(),
            tiles_size: plan.tile_shapes(),
            height: plan.source_height,
            width: plan.source_width,
        }
    }

    /// Split axis implied by the image dimensions.
    #[inline]
    pub fn axis(&self) -> SplitAxis {
        SplitAxis::for_dims(self.height, self.width)
    }

    /// Check internal consistency: declared count matches the shape list,
    /// extents cover the image exactly, cross extents agree.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.tiles != self.tiles_size.len() {
            return Err(ManifestError::CountMismatch {
                declared: self.tiles,
                recorded: self.tiles_size.len(),
            });
        }
        if self.height == 0 || self.width == 0 || self.tiles == 0 {
            return Err(ManifestError::EmptyGeometry);
        }

        let axis = self.axis();
        let (split_expected, cross_expected) = match axis {
            SplitAxis::Rows => (self.height, self.width),
            SplitAxis::Cols => (self.width, self.height),
        };

        let mut covered = 0usize;
        for (i, &(h, w)) in self.tiles_size.iter().enumerate() {
            let (split, cross) = match axis {
                SplitAxis::Rows => (h, w),
                SplitAxis::Cols => (w, h),
            };
            if split == 0 || cross == 0 {
                return Err(ManifestError::EmptyGeometry);
            }
            if cross != cross_expected {
                return Err(ManifestError::RaggedCross {
                    tile: i,
                    expected: cross_expected,
                    actual: cross,
                });
            }
            covered += split;
        }
        if covered != split_expected {
            return Err(ManifestError::CoverageMismatch { covered, expected: split_expected });
        }
        Ok(())
    }

    /// Rebuild the tile plan this manifest records, with byte offsets
    /// recomputed from the stored shapes.
    pub fn to_plan(&self, channels: usize) -> Result<TilePlan, ManifestError> {
        self.validate()?;
        let mut tiles = Vec::with_capacity(self.tiles_size.len());
        let mut byte_offset = 0usize;
        for (i, &(height, width)) in self.tiles_size.iter().enumerate() {
            let descriptor = TileDescriptor { index: TileIdx(i), height, width, byte_offset };
            byte_offset += descriptor.byte_len(channels);
            tiles.push(descriptor);
        }
        Ok(TilePlan {
            axis: self.axis(),
            tiles,
            source_height: self.height,
            source_width: self.width,
            channels,
        })
    }

    /// Read a manifest from disk.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Persist the manifest atomically.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

// ============================================================================
// Secret session parameters
// ============================================================================

/// The seller's per-session secrets, `parameters.json`. All values are
/// decimal strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Commitment public point `[x, y]`.
    pub commitment_public_key: [String; 2],
    /// Commitment private scalar.
    pub commitment_private_key: String,
    /// Commitment randomness fed to the circuit.
    pub commitment_randomness: String,
    /// The two cipher master keys.
    pub master_keys: [String; 2],
    /// Pinning-service JWT; starts as [`PLACEHOLDER_JWT`].
    pub pinata_jwt: String,
}

impl SessionParams {
    /// Sample a fresh parameter set: commitment keypair on `curve`,
    /// commitment randomness and both master keys uniform in the field.
    pub fn generate<R: RngCore + CryptoRng>(
        curve: &CurveParams,
        rng: &mut R,
    ) -> Result<Self, ManifestError> {
        use ark_ff::UniformRand;

        let pair = KeyPair::generate(curve, rng)?;
        Ok(Self {
            commitment_public_key: [
                fe_to_decimal(&pair.public.x),
                fe_to_decimal(&pair.public.y),
            ],
            commitment_private_key: pair.private.to_str_radix(10),
            commitment_randomness: fe_to_decimal(&F::rand(rng)),
            master_keys: [fe_to_decimal(&F::rand(rng)), fe_to_decimal(&F::rand(rng))],
            pinata_jwt: PLACEHOLDER_JWT.to_owned(),
        })
    }

    /// Parse the stored commitment keypair, checking the public point is on
    /// `curve`.
    pub fn commitment_keypair(&self, curve: &CurveParams) -> Result<KeyPair, ManifestError> {
        let x = parse_fe("commitment_public_key.x", &self.commitment_public_key[0])?;
        let y = parse_fe("commitment_public_key.y", &self.commitment_public_key[1])?;
        let public = Point::new(x, y);
        if !curve.is_on_curve(&public) {
            return Err(ManifestError::KeyOffCurve);
        }
        let private = BigUint::parse_bytes(self.commitment_private_key.as_bytes(), 10)
            .ok_or_else(|| ManifestError::BadDecimal {
                field: "commitment_private_key",
                value: self.commitment_private_key.clone(),
            })?;
        Ok(KeyPair { public, private })
    }

    /// Parse the stored commitment randomness.
    pub fn commitment_randomness_fe(&self) -> Result<F, ManifestError> {
        parse_fe("commitment_randomness", &self.commitment_randomness)
    }

    /// Parse the two stored master keys.
    pub fn master_keys_fe(&self) -> Result<[F; 2], ManifestError> {
        Ok([
            parse_fe("master_keys[0]", &self.master_keys[0])?,
            parse_fe("master_keys[1]", &self.master_keys[1])?,
        ])
    }

    /// The stored JWT, `None` while it is still the placeholder or empty.
    pub fn stored_jwt(&self) -> Option<&str> {
        let jwt = self.pinata_jwt.trim();
        if jwt.is_empty() || jwt == PLACEHOLDER_JWT {
            None
        } else {
            Some(jwt)
        }
    }

    /// JWT to use for uploads: the `PINATA_JWT` environment variable wins
    /// over the stored value.
    pub fn jwt(&self) -> Option<String> {
        if let Ok(env_jwt) = std::env::var("PINATA_JWT") {
            if !env_jwt.trim().is_empty() {
                return Some(env_jwt);
            }
        }
        self.stored_jwt().map(str::to_owned)
    }

    /// Read parameters from disk.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Persist the parameters atomically.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn parse_fe(field: &'static str, value: &str) -> Result<F, ManifestError> {
    fe_from_decimal(value)
        .ok_or_else(|| ManifestError::BadDecimal { field, value: value.to_owned() })
}

// ============================================================================
// Path conventions
// ============================================================================

/// Paths of one tile's proving-system outputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofArtifact {
    /// Tile the artifact belongs to.
    pub tile: TileIdx,
    /// `proof.json`.
    pub proof_path: PathBuf,
    /// `public.json`, the flat decimal public-signal vector.
    pub public_path: PathBuf,
    /// `verification_key.json`.
    pub vkey_path: PathBuf,
}

impl ProofArtifact {
    /// The three artifact paths under an explicit directory.
    pub fn in_dir(tile: TileIdx, dir: &Path) -> Self {
        Self {
            tile,
            proof_path: dir.join("proof.json"),
            public_path: dir.join("public.json"),
            vkey_path: dir.join("verification_key.json"),
        }
    }

    /// Directory holding the artifact files.
    pub fn dir(&self) -> &Path {
        self.proof_path.parent().unwrap_or_else(|| Path::new(""))
    }
}

/// Every filesystem convention of a proof session.
#[derive(Clone, Debug)]
pub struct StorageLayout {
    /// Directory holding circuit templates; generated circuits go under
    /// `tiles/` inside it.
    pub circuits_dir: PathBuf,
    /// Directory for the witness file.
    pub input_dir: PathBuf,
    /// Directory for proof artifacts, the manifest and the metrics log.
    pub out_dir: PathBuf,
    /// Directory holding the toolchain wrapper scripts.
    pub scripts_dir: PathBuf,
    /// Powers-of-tau file handed to the setup stage.
    pub pot_path: PathBuf,
    /// Base name for generated circuits and artifact directories.
    pub circuit_name: String,
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self {
            circuits_dir: PathBuf::from("circuits"),
            input_dir: PathBuf::from("input"),
            out_dir: PathBuf::from("output"),
            scripts_dir: PathBuf::from("scripts"),
            pot_path: PathBuf::from("powersoftau/25.pot"),
            circuit_name: "image".to_owned(),
        }
    }
}

impl StorageLayout {
    /// Path of the circuit template:
    /// `{circuits_dir}/base/{circuit_name}_TEMPLATE.circom`.
    pub fn template_path(&self) -> PathBuf {
        self.circuits_dir.join("base").join(format!("{}_TEMPLATE.circom", self.circuit_name))
    }

    /// Path of the generated circuit for one tile:
    /// `{circuits_dir}/tiles/{circuit_name}_{i}.circom`.
    pub fn tile_circuit_path(&self, tile: TileIdx) -> PathBuf {
        self.circuits_dir
            .join("tiles")
            .join(format!("{}_{}.circom", self.circuit_name, tile.as_usize()))
    }

    /// Name snarkjs knows one tile's circuit by: `{circuit_name}_{i}`.
    pub fn tile_circuit_id(&self, tile: TileIdx) -> String {
        format!("{}_{}", self.circuit_name, tile.as_usize())
    }

    /// Witness file path: `{input_dir}/input.json`.
    pub fn witness_path(&self) -> PathBuf {
        self.input_dir.join("input.json")
    }

    /// Artifact directory for one tile: `{out_dir}/{circuit_name}_{i}`.
    /// Holds either a complete, verified artifact set or nothing; stages
    /// write into [`tile_staging_dir`](Self::tile_staging_dir) first.
    pub fn tile_dir(&self, tile: TileIdx) -> PathBuf {
        self.out_dir.join(self.tile_circuit_id(tile))
    }

    /// Scratch directory a tile's stages write into:
    /// `{out_dir}/{circuit_name}_{i}.staging`. Renamed over
    /// [`tile_dir`](Self::tile_dir) once the tile's proof verifies and
    /// removed on failure or cancellation, so a killed stage never leaves
    /// a partial artifact at the canonical path.
    pub fn tile_staging_dir(&self, tile: TileIdx) -> PathBuf {
        self.out_dir.join(format!("{}.staging", self.tile_circuit_id(tile)))
    }

    /// The three artifact paths for one tile, at the canonical location.
    pub fn tile_artifact(&self, tile: TileIdx) -> ProofArtifact {
        ProofArtifact::in_dir(tile, &self.tile_dir(tile))
    }

    /// Metrics log path: `{out_dir}/{circuit_name}_stats.csv`.
    pub fn csv_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}_stats.csv", self.circuit_name))
    }

    /// Manifest path, co-located with the artifact directories.
    pub fn manifest_path(&self) -> PathBuf {
        self.out_dir.join("image_info.json")
    }
}
