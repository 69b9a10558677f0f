//! CLI decryptor: recover the original image from a purchased session
//!
//! Reads the master keys from the parameter file, decrypts every tile's
//! public ciphertext through the native cipher binary, and stitches the
//! plaintext tiles back into the full-resolution image. The tile shapes
//! come from the session manifest, so the shorter remainder tile lands in
//! the right place.

#![forbid(unsafe_code)]

use std::{env, path::PathBuf};

use zktile::backend::NativeCipher;
use zktile::pixel::PngCodec;
use zktile::verify::discover_artifacts;
use zktile::{ImageInfo, ImageReconstructor, Key256, ProtocolConfig, SessionParams};

/// Where the build of the cipher tool lands by default.
const DEFAULT_CIPHER_BIN: &str = "scripts/image_decrypt/bin/cipher_decrypt";

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "zktile=info".into()))
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = env::args().collect();

    let params_path = PathBuf::from(
        parse_flag(&args, "--params").ok_or_else(|| anyhow::anyhow!("--params is required"))?,
    );
    let session_dir = PathBuf::from(
        parse_flag(&args, "--session").ok_or_else(|| anyhow::anyhow!("--session is required"))?,
    );
    let out = PathBuf::from(
        parse_flag(&args, "--out").unwrap_or_else(|| "output/decrypted_image.png".into()),
    );
    let cipher_bin = PathBuf::from(
        parse_flag(&args, "--cipher-bin").unwrap_or_else(|| DEFAULT_CIPHER_BIN.into()),
    );

    let params = SessionParams::load(&params_path)
        .map_err(|e| anyhow::anyhow!("read parameters {}: {e}", params_path.display()))?;
    let master_fe = params.master_keys_fe()?;
    let keys = [Key256::from_field(&master_fe[0]), Key256::from_field(&master_fe[1])];

    let manifest = ImageInfo::load(&session_dir.join("image_info.json"))
        .map_err(|e| anyhow::anyhow!("read manifest in {}: {e}", session_dir.display()))?;
    let artifacts = discover_artifacts(&session_dir, manifest.tiles)?;

    let cipher = NativeCipher::new(cipher_bin);
    let reconstructor = ImageReconstructor {
        cipher: &cipher,
        image: &PngCodec,
        channels: ProtocolConfig::default().channels,
    };
    let grid = reconstructor.reconstruct_to(&manifest, &artifacts, &keys, &out)?;

    eprintln!(
        "✓ Decrypted `{}`: {}x{} image written to {}",
        manifest.name,
        grid.height(),
        grid.width(),
        out.display()
    );
    Ok(())
}
