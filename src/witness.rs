//! Circuit witness assembly and template instantiation
//!
//! ## Witness
//! One witness file serves the whole session: it carries the secrets the
//! circuit needs (master keys, nonce, IV, commitment randomness), the
//! commitment public key, the OTP-wrapped transport form of the master keys,
//! and the full and preview pixel arrays. Everything is rendered as decimal
//! strings, nested `height x width x channels` for the pixel arrays, which
//! is the only input shape the circuit toolchain accepts.
//!
//! The wrapping pad is derived from the commitment keypair's own shared
//! point, so the seller can always re-derive it from `parameters.json`; a
//! buyer handing over their public key gets a pad only the two of them can
//! compute.
//!
//! ## Templates
//! A circuit template carries `Th`/`Tw` placeholders for the full, tile and
//! preview dimensions plus `Tleaf`/`Tnum_leaves` for the tile id and count.
//! Instantiation is plain textual substitution; the output lands at
//! `{circuits_dir}/tiles/{name}_{index}.circom`, one file per tile, so
//! concurrent tile pipelines never collide.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::curve::{fe_to_decimal, CurveParams};
use crate::exchange::{derive_keys, shared_secret, wrap_keys, ExchangeError, KeyPair};
use crate::manifest::{write_atomic, StorageLayout};
use crate::pixel::PixelGrid;
use crate::tiling::TileDescriptor;
use crate::F;

/// Witness and template errors.
#[derive(Debug, thiserror::Error)]
pub enum WitnessError {
    /// Filesystem failure.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// Witness serialization failure.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// Key wrapping failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    /// Template file name yields no usable circuit name.
    #[error("cannot derive a circuit name from template {path:?}")]
    EmptyTemplateStem {
        /// Offending template path.
        path: PathBuf,
    },
}

/// The circuit input file, `input.json`. All values decimal strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    /// First cipher master key.
    pub master_key0: String,
    /// Second cipher master key.
    pub master_key1: String,
    /// Fresh cipher nonce.
    pub nonce: String,
    /// Fresh cipher initialization vector.
    #[serde(rename = "IV")]
    pub iv: String,
    /// Commitment public point `[x, y]`.
    pub public_key: [String; 2],
    /// Commitment randomness.
    pub randomness: String,
    /// Transport form of `master_key0` (XOR against pad entry 0).
    pub wrapped_key0: String,
    /// Transport form of `master_key1` (XOR against pad entry 1).
    pub wrapped_key1: String,
    /// Full-resolution pixels, `height x width x channels`.
    pub full_image: Vec<Vec<Vec<String>>>,
    /// Preview pixels, `height x width x channels`.
    pub low_image: Vec<Vec<Vec<String>>>,
}

impl Witness {
    /// Assemble the session witness.
    ///
    /// `nonce` and `IV` are sampled fresh on every call, so a rebuilt
    /// witness is a new encryption session even for identical pixels.
    #[allow(clippy::too_many_arguments)]
    pub fn build<R: RngCore + CryptoRng>(
        curve: &CurveParams,
        commitment: &KeyPair,
        randomness: &F,
        master_keys: &[F; 2],
        key_count: usize,
        full: &PixelGrid,
        low: &PixelGrid,
        rng: &mut R,
    ) -> Result<Self, WitnessError> {
        use ark_ff::UniformRand;

        let secret = shared_secret(curve, &commitment.private, &commitment.public)?;
        let pad = derive_keys(&secret, key_count);
        let wrapped = wrap_keys(master_keys.as_slice(), &pad)?;

        Ok(Self {
            master_key0: fe_to_decimal(&master_keys[0]),
            master_key1: fe_to_decimal(&master_keys[1]),
            nonce: fe_to_decimal(&F::rand(rng)),
            iv: fe_to_decimal(&F::rand(rng)),
            public_key: [
                fe_to_decimal(&commitment.public.x),
                fe_to_decimal(&commitment.public.y),
            ],
            randomness: fe_to_decimal(randomness),
            wrapped_key0: wrapped[0].to_decimal(),
            wrapped_key1: wrapped[1].to_decimal(),
            full_image: nested_decimal(full),
            low_image: nested_decimal(low),
        })
    }

    /// Write the witness atomically; the pixel arrays make this file large,
    /// so no pretty-printing.
    pub fn save(&self, path: &Path) -> Result<(), WitnessError> {
        write_atomic(path, &serde_json::to_vec(self)?)?;
        Ok(())
    }
}

fn nested_decimal(grid: &PixelGrid) -> Vec<Vec<Vec<String>>> {
    (0..grid.height())
        .map(|r| {
            (0..grid.width())
                .map(|c| {
                    (0..grid.channels()).map(|ch| grid.sample(r, c, ch).to_string()).collect()
                })
                .collect()
        })
        .collect()
}

/// Session-wide dimensions substituted into every tile's circuit.
#[derive(Copy, Clone, Debug)]
pub struct TemplateDims {
    /// Full image `(height, width)`.
    pub full: (usize, usize),
    /// Preview `(height, width)`; every tile discloses the whole preview.
    pub preview: (usize, usize),
    /// Total number of tiles in the session.
    pub tile_count: usize,
}

/// Instantiate the circuit template for one tile.
///
/// Substitutes `ThFull/TwFull` (source dims), `ThTile/TwTile` (this tile's
/// dims), `ThResize/TwResize` (preview dims), `Tleaf` (tile index) and
/// `Tnum_leaves` (tile count), then writes the result to
/// [`StorageLayout::tile_circuit_path`]. Returns the written path.
pub fn render_tile_circuit(
    template: &Path,
    layout: &StorageLayout,
    tile: &TileDescriptor,
    dims: &TemplateDims,
) -> Result<PathBuf, WitnessError> {
    let source = fs::read_to_string(template)?;
    let rendered = source
        .replace("ThFull", &dims.full.0.to_string())
        .replace("TwFull", &dims.full.1.to_string())
        .replace("ThTile", &tile.height.to_string())
        .replace("TwTile", &tile.width.to_string())
        .replace("ThResize", &dims.preview.0.to_string())
        .replace("TwResize", &dims.preview.1.to_string())
        .replace("Tnum_leaves", &dims.tile_count.to_string())
        .replace("Tleaf", &tile.index.to_string());

    let out = layout.tile_circuit_path(tile.index);
    write_atomic(&out, rendered.as_bytes())?;
    Ok(out)
}

/// Circuit name implied by a template file: the file stem up to its first
/// underscore (`image_transformation.circom` names circuits `image_*`).
pub fn template_stem(path: &Path) -> Result<String, WitnessError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.split('_').next())
        .unwrap_or("");
    if stem.is_empty() {
        return Err(WitnessError::EmptyTemplateStem { path: path.to_owned() });
    }
    Ok(stem.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::fe_from_decimal;
    use crate::exchange::{unwrap_keys, Key256};
    use crate::tiling::TilePlan;
    use num_bigint::BigUint;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_grid(height: usize, width: usize) -> PixelGrid {
        let data = (0..height * width * 3).map(|i| (i % 256) as u8).collect();
        PixelGrid::new(height, width, 3, data).unwrap()
    }

    fn session_keys(seed: u64) -> (CurveParams, KeyPair, F, [F; 2]) {
        let curve = CurveParams::baby_jubjub();
        let mut rng = StdRng::seed_from_u64(seed);
        let pair = KeyPair::generate(&curve, &mut rng).unwrap();
        (curve, pair, F::from(777u64), [F::from(1001u64), F::from(2002u64)])
    }

    #[test]
    fn witness_values_parse_back() {
        let (curve, pair, randomness, masters) = session_keys(21);
        let mut rng = StdRng::seed_from_u64(22);
        let witness = Witness::build(
            &curve,
            &pair,
            &randomness,
            &masters,
            7,
            &tiny_grid(5, 4),
            &tiny_grid(3, 2),
            &mut rng,
        )
        .unwrap();

        assert_eq!(fe_from_decimal(&witness.master_key0), Some(masters[0]));
        assert_eq!(fe_from_decimal(&witness.randomness), Some(randomness));
        fe_from_decimal(&witness.nonce).unwrap();
        fe_from_decimal(&witness.iv).unwrap();
        assert_eq!(fe_from_decimal(&witness.public_key[0]), Some(pair.public.x));

        assert_eq!(witness.full_image.len(), 5);
        assert_eq!(witness.full_image[0].len(), 4);
        assert_eq!(witness.full_image[0][0].len(), 3);
        assert_eq!(witness.low_image.len(), 3);
        // Pixel 0 of the gradient is byte 0.
        assert_eq!(witness.full_image[0][0][0], "0");
    }

    #[test]
    fn wrapped_keys_unwrap_with_the_rederived_pad() {
        let (curve, pair, randomness, masters) = session_keys(23);
        let mut rng = StdRng::seed_from_u64(24);
        let witness = Witness::build(
            &curve,
            &pair,
            &randomness,
            &masters,
            7,
            &tiny_grid(4, 4),
            &tiny_grid(2, 2),
            &mut rng,
        )
        .unwrap();

        // Same derivation the seller used: the commitment pair's self-DH.
        let secret = shared_secret(&curve, &pair.private, &pair.public).unwrap();
        let pad = derive_keys(&secret, 7);

        let wrapped: Vec<Key256> = [&witness.wrapped_key0, &witness.wrapped_key1]
            .iter()
            .map(|s| {
                let value = BigUint::parse_bytes(s.as_bytes(), 10).unwrap();
                let bytes = value.to_bytes_be();
                let mut key = [0u8; 32];
                key[32 - bytes.len()..].copy_from_slice(&bytes);
                Key256(key)
            })
            .collect();
        let recovered = unwrap_keys(&wrapped, &pad).unwrap();
        assert_eq!(recovered, masters.to_vec());
    }

    #[test]
    fn witness_json_uses_the_circuit_field_names() {
        let (curve, pair, randomness, masters) = session_keys(25);
        let mut rng = StdRng::seed_from_u64(26);
        let witness = Witness::build(
            &curve,
            &pair,
            &randomness,
            &masters,
            2,
            &tiny_grid(2, 2),
            &tiny_grid(2, 2),
            &mut rng,
        )
        .unwrap();

        let json = serde_json::to_value(&witness).unwrap();
        for key in [
            "master_key0",
            "master_key1",
            "nonce",
            "IV",
            "public_key",
            "randomness",
            "wrapped_key0",
            "wrapped_key1",
            "full_image",
            "low_image",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }

        let back: Witness = serde_json::from_value(json).unwrap();
        assert_eq!(back, witness);
    }

    #[test]
    fn witness_file_round_trips() {
        let (curve, pair, randomness, masters) = session_keys(27);
        let mut rng = StdRng::seed_from_u64(28);
        let witness = Witness::build(
            &curve,
            &pair,
            &randomness,
            &masters,
            3,
            &tiny_grid(3, 3),
            &tiny_grid(2, 2),
            &mut rng,
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.json");
        witness.save(&path).unwrap();
        let back: Witness = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(back, witness);
    }

    #[test]
    fn template_substitution_fills_every_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("image_transformation.circom");
        fs::write(
            &template,
            "component main = Transform(ThFull, TwFull, ThTile, TwTile, \
             ThResize, TwResize, Tleaf, Tnum_leaves);\n",
        )
        .unwrap();

        let layout = StorageLayout {
            circuits_dir: dir.path().join("circuits"),
            ..StorageLayout::default()
        };
        let plan = TilePlan::compute(301, 208, 3, 62_400).unwrap();
        let dims = TemplateDims { full: (301, 208), preview: (101, 70), tile_count: 4 };

        let out = render_tile_circuit(&template, &layout, &plan.tiles[3], &dims).unwrap();
        assert_eq!(out, layout.tile_circuit_path(plan.tiles[3].index));

        let rendered = fs::read_to_string(&out).unwrap();
        assert_eq!(
            rendered,
            "component main = Transform(301, 208, 1, 208, 101, 70, 3, 4);\n"
        );
        for placeholder in
            ["ThFull", "TwFull", "ThTile", "TwTile", "ThResize", "TwResize", "Tleaf", "Tnum_leaves"]
        {
            assert!(!rendered.contains(placeholder), "{placeholder} survived substitution");
        }
    }

    #[test]
    fn tiles_render_to_distinct_paths() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("image_transformation.circom");
        fs::write(&template, "Tleaf of Tnum_leaves\n").unwrap();

        let layout = StorageLayout {
            circuits_dir: dir.path().join("circuits"),
            ..StorageLayout::default()
        };
        let plan = TilePlan::compute(30, 20, 3, 600).unwrap();
        let dims = TemplateDims { full: (30, 20), preview: (2, 2), tile_count: plan.tile_count() };

        let mut written = std::collections::HashSet::new();
        for tile in &plan.tiles {
            let path = render_tile_circuit(&template, &layout, tile, &dims).unwrap();
            assert!(written.insert(path), "paths must be unique per tile");
        }
        assert_eq!(written.len(), plan.tile_count());
    }

    #[test]
    fn template_stems() {
        assert_eq!(template_stem(Path::new("circuits/image_transformation.circom")).unwrap(), "image");
        assert_eq!(template_stem(Path::new("resize_full.circom")).unwrap(), "resize");
        assert_eq!(template_stem(Path::new("plain.circom")).unwrap(), "plain");
        assert!(template_stem(Path::new("")).is_err());
    }
}
