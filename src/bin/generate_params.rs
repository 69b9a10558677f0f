//! CLI parameter generator: write a fresh session parameter file
//!
//! Samples a commitment keypair on Baby Jubjub, the commitment randomness,
//! and the two cipher master keys, then writes them as decimal strings.
//! The Pinata JWT field is filled with a placeholder; uploading refuses to
//! run until it is replaced (or `PINATA_JWT` is set).

#![forbid(unsafe_code)]

use std::{env, path::PathBuf};

use rand::rngs::OsRng;
use zktile::{CurveParams, SessionParams};

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
    let out = PathBuf::from(
        parse_flag(&args, "--out").unwrap_or_else(|| "input/parameters.json".into()),
    );
    if out.extension().and_then(|e| e.to_str()) != Some("json") {
        return Err(anyhow::anyhow!("parameter file must be a .json path, got {}", out.display()));
    }

    let curve = CurveParams::baby_jubjub();
    let mut rng = OsRng;
    let params = SessionParams::generate(&curve, &mut rng)?;
    params.save(&out)?;

    eprintln!("✓ Wrote fresh session parameters to {}", out.display());
    eprintln!();
    eprintln!("⚠️  Keep this file private: it holds the commitment private key");
    eprintln!("    and both master keys. Anyone with it can decrypt the image.");
    eprintln!("⚠️  Before uploading, replace the pinata_jwt placeholder or set PINATA_JWT.");
    Ok(())
}
