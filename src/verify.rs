//! Session verification: proof validity and preview consistency
//!
//! ## Two independent checks
//! For every tile the verifier records two booleans with different security
//! meanings:
//!
//! - `proof_valid`: the external proving system accepts `proof.json` against
//!   `public.json` and the verification key. A failure here means a broken
//!   or forged proof.
//! - `preview_consistent`: the preview block of the tile's public-signal
//!   vector, decoded as bytes, equals the independently held reference
//!   preview. A failure here with a *valid* proof means a substitution
//!   attack: a genuine proof about different content.
//!
//! Every tile's circuit discloses the complete preview, so each tile is
//! compared against the full reference image; the block starts right after
//! the leading signals and the tile's own ciphertext (see
//! [`SignalLayout`]).
//!
//! All tiles are evaluated even after a failure, so a report names every
//! offending tile; acceptance is all-or-nothing.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::backend::BackendError;
use crate::manifest::{ImageInfo, ManifestError, ProofArtifact};
use crate::pixel::PixelGrid;
use crate::tiling::{SignalLayout, TileIdx};

/// Verification errors. `ProofInvalid` and `PreviewMismatch` are
/// deliberately distinct: callers react differently to a forged proof than
/// to a substituted preview.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Reading an artifact failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// An artifact was not valid JSON.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// The manifest is inconsistent.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// The external verifier could not be invoked.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// Artifact list and manifest disagree on the tile count.
    #[error("manifest records {expected} tiles but {actual} artifacts were supplied")]
    ArtifactCount {
        /// Tiles in the manifest.
        expected: usize,
        /// Artifacts supplied.
        actual: usize,
    },
    /// No artifact directory found for a tile.
    #[error("no artifact directory for tile {tile} under {dir:?}")]
    MissingArtifact {
        /// Tile without artifacts.
        tile: usize,
        /// Directory that was searched.
        dir: PathBuf,
    },
    /// A tile's proof was rejected by the proving system.
    #[error("tile {tile}: proof rejected")]
    ProofInvalid {
        /// Offending tile.
        tile: usize,
    },
    /// A tile's disclosed preview differs from the reference image.
    #[error("tile {tile}: disclosed preview does not match the reference")]
    PreviewMismatch {
        /// Offending tile.
        tile: usize,
    },
}

/// Per-tile verdict pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VerificationResult {
    /// Tile index.
    pub tile: usize,
    /// Whether the proving system accepted the proof.
    pub proof_valid: bool,
    /// Whether the disclosed preview matches the reference.
    pub preview_consistent: bool,
}

impl VerificationResult {
    /// A tile is accepted only when both checks pass.
    #[inline]
    pub fn accept(&self) -> bool {
        self.proof_valid && self.preview_consistent
    }
}

/// Verdicts for a whole session.
#[derive(Clone, Debug)]
pub struct SessionReport {
    /// Per-tile results, in tile order.
    pub results: Vec<VerificationResult>,
}

impl SessionReport {
    /// All-or-nothing acceptance.
    pub fn accepted(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(VerificationResult::accept)
    }

    /// Collapse to a `Result`, naming the first failing tile. An invalid
    /// proof is reported ahead of a preview mismatch on the same tile.
    pub fn into_result(self) -> Result<(), VerifyError> {
        for r in &self.results {
            if !r.proof_valid {
                return Err(VerifyError::ProofInvalid { tile: r.tile });
            }
            if !r.preview_consistent {
                return Err(VerifyError::PreviewMismatch { tile: r.tile });
            }
        }
        Ok(())
    }
}

/// External proof verification, injectable for tests.
pub trait ProofVerifier: Send + Sync {
    /// Check one tile's proof; `Ok(false)` is a rejected proof, `Err` an
    /// inability to run the check at all.
    fn verify(&self, artifact: &ProofArtifact) -> Result<bool, VerifyError>;
}

/// Production [`ProofVerifier`]: `snarkjs groth16 verify`.
///
/// The verdict requires both a zero exit and the `OK` marker on stdout;
/// some toolchain versions exit zero even for rejected proofs.
pub struct SnarkjsVerifier {
    /// snarkjs executable; plain `snarkjs` resolves via `PATH`.
    pub snarkjs_bin: PathBuf,
}

impl Default for SnarkjsVerifier {
    fn default() -> Self {
        Self { snarkjs_bin: PathBuf::from("snarkjs") }
    }
}

impl ProofVerifier for SnarkjsVerifier {
    fn verify(&self, artifact: &ProofArtifact) -> Result<bool, VerifyError> {
        let output = Command::new(&self.snarkjs_bin)
            .arg("groth16")
            .arg("verify")
            .arg(&artifact.vkey_path)
            .arg(&artifact.public_path)
            .arg(&artifact.proof_path)
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(output.status.success() && stdout.contains("OK"))
    }
}

/// The session verifier with its configuration.
pub struct SessionVerifier<'a> {
    /// Proof-check backend.
    pub verifier: &'a dyn ProofVerifier,
    /// Public-signal layout contract; must match the circuit version.
    pub signals: SignalLayout,
    /// Channels per pixel.
    pub channels: usize,
}

impl SessionVerifier<'_> {
    /// Evaluate every tile of a session.
    ///
    /// `preview` is the independently held reference image the seller
    /// published. The artifact list must be in tile order and complete.
    pub fn verify_session(
        &self,
        manifest: &ImageInfo,
        preview: &PixelGrid,
        artifacts: &[ProofArtifact],
    ) -> Result<SessionReport, VerifyError> {
        let plan = manifest.to_plan(self.channels)?;
        if artifacts.len() != manifest.tiles {
            return Err(VerifyError::ArtifactCount {
                expected: manifest.tiles,
                actual: artifacts.len(),
            });
        }

        let reference = preview.bytes();
        let mut results = Vec::with_capacity(artifacts.len());
        for (tile, artifact) in plan.tiles.iter().zip(artifacts) {
            let proof_valid = self.verifier.verify(artifact)?;

            let public: Vec<String> = serde_json::from_slice(&fs::read(&artifact.public_path)?)?;
            let offset = self.signals.preview_offset(tile, self.channels);
            let preview_consistent = preview_slice_matches(&public, offset, reference, tile.index);

            if !proof_valid {
                tracing::warn!(tile = tile.index.as_usize(), "proof rejected");
            }
            results.push(VerificationResult {
                tile: tile.index.as_usize(),
                proof_valid,
                preview_consistent,
            });
        }
        Ok(SessionReport { results })
    }
}

/// Compare the preview block of a public-signal vector against the
/// reference bytes. Anything unexpected (vector too short, non-numeric
/// signal, value outside a byte) counts as a mismatch rather than an error:
/// a malformed disclosure must not be accepted.
fn preview_slice_matches(
    public: &[String],
    offset: usize,
    reference: &[u8],
    tile: TileIdx,
) -> bool {
    let Some(block) = public.get(offset..offset + reference.len()) else {
        tracing::warn!(
            tile = tile.as_usize(),
            signals = public.len(),
            needed = offset + reference.len(),
            "public vector too short for the preview block"
        );
        return false;
    };
    for (signal, &expected) in block.iter().zip(reference) {
        match signal.parse::<u64>() {
            Ok(value) if value == u64::from(expected) => {}
            Ok(_) => return false,
            Err(_) => {
                tracing::warn!(tile = tile.as_usize(), signal = %signal, "non-byte preview signal");
                return false;
            }
        }
    }
    true
}

/// Locate the per-tile artifact directories of a session on disk.
///
/// Uploaded sessions use `tile_{i}` directories with `vkey.json`; local
/// sessions use `{circuit}_{i}` directories with `verification_key.json`.
/// Both layouts are accepted.
pub fn discover_artifacts(
    session_dir: &Path,
    tiles: usize,
) -> Result<Vec<ProofArtifact>, VerifyError> {
    let mut artifacts = Vec::with_capacity(tiles);
    for i in 0..tiles {
        let dir = find_tile_dir(session_dir, i)?.ok_or_else(|| VerifyError::MissingArtifact {
            tile: i,
            dir: session_dir.to_owned(),
        })?;
        let vkey_local = dir.join("verification_key.json");
        let vkey = if vkey_local.exists() { vkey_local } else { dir.join("vkey.json") };
        artifacts.push(ProofArtifact {
            tile: TileIdx(i),
            proof_path: dir.join("proof.json"),
            public_path: dir.join("public.json"),
            vkey_path: vkey,
        });
    }
    Ok(artifacts)
}

fn find_tile_dir(session_dir: &Path, tile: usize) -> Result<Option<PathBuf>, VerifyError> {
    let preferred = session_dir.join(format!("tile_{tile}"));
    if preferred.is_dir() {
        return Ok(Some(preferred));
    }
    let suffix = format!("_{tile}");
    for entry in fs::read_dir(session_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with(&suffix) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}
