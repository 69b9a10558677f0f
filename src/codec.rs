//! Buyer-side reconstruction: decrypt every tile and reassemble the image
//!
//! After a session is accepted the buyer holds the two master keys, the
//! manifest, and each tile's `public.json` (whose leading section carries
//! the tile ciphertext). Reconstruction decrypts one tile at a time through
//! a [`CipherBackend`] and then stitches the plaintext blocks back together
//! along the session's split axis, using the per-tile shapes recorded in
//! the manifest. The remainder tile is shorter than the rest; trusting the
//! recorded shapes instead of assuming a uniform extent is what keeps it
//! aligned.
//!
//! The cipher cannot tell right keys from wrong ones; wrong keys produce
//! noise of the correct length. Key authenticity is established by the
//! proofs, not here.

#![forbid(unsafe_code)]

use std::path::Path;

use crate::backend::{BackendError, CipherBackend};
use crate::exchange::Key256;
use crate::manifest::{ImageInfo, ManifestError, ProofArtifact};
use crate::pixel::{ImageBackend, PixelError, PixelGrid};

/// Reconstruction errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Writing the reassembled image failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// A tile failed to decrypt.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The manifest is inconsistent.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// The decrypted blocks do not assemble into the recorded geometry.
    #[error(transparent)]
    Pixel(#[from] PixelError),
    /// Artifact list and manifest disagree on the tile count.
    #[error("manifest records {expected} tiles but {actual} artifacts were supplied")]
    ArtifactCount {
        /// Tiles in the manifest.
        expected: usize,
        /// Artifacts supplied.
        actual: usize,
    },
}

/// Decrypts and reassembles a purchased session.
pub struct ImageReconstructor<'a> {
    /// Tile decryption backend.
    pub cipher: &'a dyn CipherBackend,
    /// Encoder for the reassembled image.
    pub image: &'a dyn ImageBackend,
    /// Channels per pixel.
    pub channels: usize,
}

impl ImageReconstructor<'_> {
    /// Decrypt every tile and stitch the original image back together.
    ///
    /// `artifacts` must be in tile order; only their `public_path` is read.
    pub fn reconstruct(
        &self,
        manifest: &ImageInfo,
        artifacts: &[ProofArtifact],
        keys: &[Key256; 2],
    ) -> Result<PixelGrid, CodecError> {
        let plan = manifest.to_plan(self.channels)?;
        if artifacts.len() != manifest.tiles {
            return Err(CodecError::ArtifactCount {
                expected: manifest.tiles,
                actual: artifacts.len(),
            });
        }

        let mut blocks = Vec::with_capacity(artifacts.len());
        for (tile, artifact) in plan.tiles.iter().zip(artifacts) {
            let plaintext_len = tile.byte_len(self.channels);
            tracing::debug!(
                tile = tile.index.as_usize(),
                bytes = plaintext_len,
                "decrypting tile"
            );
            blocks.push(self.cipher.decrypt(&artifact.public_path, plaintext_len, keys)?);
        }

        let grid =
            PixelGrid::concat_tiles(&blocks, &manifest.tiles_size, manifest.axis(), self.channels)?;
        tracing::info!(
            height = grid.height(),
            width = grid.width(),
            tiles = manifest.tiles,
            "image reconstructed"
        );
        Ok(grid)
    }

    /// [`reconstruct`](Self::reconstruct) and write the result to `out`.
    pub fn reconstruct_to(
        &self,
        manifest: &ImageInfo,
        artifacts: &[ProofArtifact],
        keys: &[Key256; 2],
        out: &Path,
    ) -> Result<PixelGrid, CodecError> {
        let grid = self.reconstruct(manifest, artifacts, keys)?;
        if let Some(parent) = out.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.image.encode(out, &grid)?;
        Ok(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    use crate::manifest::StorageLayout;
    use crate::pixel::PngCodec;
    use crate::tiling::TilePlan;

    /// XOR keystream cipher over a sidecar file holding the ciphertext as a
    /// JSON byte array. Wrong keys decrypt to noise, like the real tool.
    struct XorCipher {
        /// Drop this many trailing bytes for the named tile directory suffix.
        short_for_suffix: Mutex<Option<(String, usize)>>,
    }

    impl XorCipher {
        fn new() -> Self {
            Self { short_for_suffix: Mutex::new(None) }
        }

        fn keystream_byte(keys: &[Key256; 2], i: usize) -> u8 {
            keys[0].as_bytes()[i % 32] ^ keys[1].as_bytes()[(i / 32) % 32]
        }

        fn encrypt_to(path: &Path, plaintext: &[u8], keys: &[Key256; 2]) {
            let cipher: Vec<u8> = plaintext
                .iter()
                .enumerate()
                .map(|(i, &b)| b ^ Self::keystream_byte(keys, i))
                .collect();
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, serde_json::to_vec(&cipher).unwrap()).unwrap();
        }
    }

    impl CipherBackend for XorCipher {
        fn decrypt(
            &self,
            public_path: &Path,
            plaintext_len: usize,
            keys: &[Key256; 2],
        ) -> Result<Vec<u8>, BackendError> {
            let cipher: Vec<u8> =
                serde_json::from_slice(&fs::read(public_path).unwrap()).unwrap();
            let mut plain: Vec<u8> = cipher
                .iter()
                .take(plaintext_len)
                .enumerate()
                .map(|(i, &b)| b ^ Self::keystream_byte(keys, i))
                .collect();
            if let Some((suffix, short_by)) = self.short_for_suffix.lock().unwrap().clone() {
                let dir = public_path.parent().unwrap().file_name().unwrap().to_string_lossy();
                if dir.ends_with(&suffix) {
                    plain.truncate(plain.len() - short_by);
                }
            }
            Ok(plain)
        }
    }

    fn keys() -> [Key256; 2] {
        let mut k0 = [0u8; 32];
        let mut k1 = [0u8; 32];
        for i in 0..32 {
            k0[i] = (i as u8).wrapping_mul(17).wrapping_add(3);
            k1[i] = (i as u8).wrapping_mul(29).wrapping_add(11);
        }
        [Key256(k0), Key256(k1)]
    }

    fn gradient(height: usize, width: usize) -> PixelGrid {
        let data = (0..height * width * 3).map(|i| (i % 251) as u8).collect();
        PixelGrid::new(height, width, 3, data).unwrap()
    }

    /// Slice, encrypt per tile, and lay the session out like the prover.
    fn encrypted_session(
        dir: &Path,
        grid: &PixelGrid,
        plan: &TilePlan,
        keys: &[Key256; 2],
    ) -> (ImageInfo, Vec<ProofArtifact>) {
        let layout = StorageLayout { out_dir: dir.to_owned(), ..StorageLayout::default() };
        let blocks = grid.slice_tiles(plan).unwrap();
        let mut artifacts = Vec::new();
        for (tile, block) in plan.tiles.iter().zip(&blocks) {
            let artifact = layout.tile_artifact(tile.index);
            XorCipher::encrypt_to(&artifact.public_path, block, keys);
            artifacts.push(artifact);
        }
        (ImageInfo::from_plan("gradient", plan), artifacts)
    }

    #[test]
    fn row_split_round_trips_including_the_remainder_tile() {
        let dir = tempfile::tempdir().unwrap();
        let grid = gradient(31, 20);
        let plan = TilePlan::compute(31, 20, 3, 600).unwrap();
        assert_eq!(plan.tiles.last().unwrap().height, 1);

        let keys = keys();
        let (manifest, artifacts) = encrypted_session(dir.path(), &grid, &plan, &keys);

        let cipher = XorCipher::new();
        let codec = ImageReconstructor { cipher: &cipher, image: &PngCodec, channels: 3 };
        let restored = codec.reconstruct(&manifest, &artifacts, &keys).unwrap();
        assert_eq!(restored.bytes(), grid.bytes());
        assert_eq!((restored.height(), restored.width()), (31, 20));
    }

    #[test]
    fn column_split_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let grid = gradient(20, 31);
        let plan = TilePlan::compute(20, 31, 3, 600).unwrap();

        let keys = keys();
        let (manifest, artifacts) = encrypted_session(dir.path(), &grid, &plan, &keys);

        let cipher = XorCipher::new();
        let codec = ImageReconstructor { cipher: &cipher, image: &PngCodec, channels: 3 };
        let restored = codec.reconstruct(&manifest, &artifacts, &keys).unwrap();
        assert_eq!(restored.bytes(), grid.bytes());
    }

    #[test]
    fn wrong_keys_reconstruct_noise_of_the_right_shape() {
        let dir = tempfile::tempdir().unwrap();
        let grid = gradient(31, 20);
        let plan = TilePlan::compute(31, 20, 3, 600).unwrap();

        let keys = keys();
        let (manifest, artifacts) = encrypted_session(dir.path(), &grid, &plan, &keys);

        let mut wrong = keys;
        wrong[0].0[0] ^= 0xFF;
        let cipher = XorCipher::new();
        let codec = ImageReconstructor { cipher: &cipher, image: &PngCodec, channels: 3 };
        let restored = codec.reconstruct(&manifest, &artifacts, &wrong).unwrap();
        assert_eq!((restored.height(), restored.width()), (31, 20));
        assert_ne!(restored.bytes(), grid.bytes());
    }

    #[test]
    fn short_decryption_is_reported_with_the_tile_index() {
        let dir = tempfile::tempdir().unwrap();
        let grid = gradient(31, 20);
        let plan = TilePlan::compute(31, 20, 3, 600).unwrap();

        let keys = keys();
        let (manifest, artifacts) = encrypted_session(dir.path(), &grid, &plan, &keys);

        let cipher = XorCipher::new();
        *cipher.short_for_suffix.lock().unwrap() = Some(("_1".to_string(), 3));
        let codec = ImageReconstructor { cipher: &cipher, image: &PngCodec, channels: 3 };
        match codec.reconstruct(&manifest, &artifacts, &keys) {
            Err(CodecError::Pixel(PixelError::ShapeMismatch { tile: 1, .. })) => {}
            other => panic!("expected a shape mismatch on tile 1, got {other:?}"),
        }
    }

    #[test]
    fn artifact_count_must_match_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let grid = gradient(31, 20);
        let plan = TilePlan::compute(31, 20, 3, 600).unwrap();

        let keys = keys();
        let (manifest, mut artifacts) = encrypted_session(dir.path(), &grid, &plan, &keys);
        artifacts.truncate(2);

        let cipher = XorCipher::new();
        let codec = ImageReconstructor { cipher: &cipher, image: &PngCodec, channels: 3 };
        assert!(matches!(
            codec.reconstruct(&manifest, &artifacts, &keys),
            Err(CodecError::ArtifactCount { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn reconstruct_to_writes_a_decodable_png() {
        let dir = tempfile::tempdir().unwrap();
        let grid = gradient(31, 20);
        let plan = TilePlan::compute(31, 20, 3, 600).unwrap();

        let keys = keys();
        let (manifest, artifacts) = encrypted_session(dir.path(), &grid, &plan, &keys);

        let out = dir.path().join("restored.png");
        let cipher = XorCipher::new();
        let codec = ImageReconstructor { cipher: &cipher, image: &PngCodec, channels: 3 };
        codec.reconstruct_to(&manifest, &artifacts, &keys, &out).unwrap();

        let decoded = PngCodec.decode(&out).unwrap();
        assert_eq!(decoded.bytes(), grid.bytes());
    }
}
