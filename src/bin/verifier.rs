//! CLI verifier: check a proof session locally or straight from IPFS
//!
//! For every tile this runs two independent checks and prints both:
//! the external proof verification, and the byte comparison between the
//! tile's disclosed preview block and the reference preview image. The
//! session is accepted only when every tile passes both; any rejection
//! exits non-zero.
//!
//! Sources:
//!   --session DIR [--preview PATH]   a local/downloaded session directory
//!   --cid CID [--gateway URL]        fetch the session from a gateway first

#![forbid(unsafe_code)]

use std::{env, path::PathBuf};

use zktile::pixel::{ImageBackend, PngCodec};
use zktile::store::{PinataStore, PINATA_API_BASE, PINATA_GATEWAY};
use zktile::verify::{discover_artifacts, SnarkjsVerifier};
use zktile::{ImageInfo, ProtocolConfig, SessionVerifier, SignalLayout};

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

    // ========================================================================
    // Locate the session: fetch by CID, or use a directory on disk
    // ========================================================================
    let (manifest, preview_path, artifacts) = if let Some(cid) = parse_flag(&args, "--cid") {
        let gateway =
            parse_flag(&args, "--gateway").unwrap_or_else(|| PINATA_GATEWAY.to_string());
        let store = PinataStore::new(PINATA_API_BASE, gateway);
        eprintln!("Fetching session {cid} ...");
        let fetched = store.fetch_session(&cid)?;
        eprintln!("✓ Session `{}` fetched to {}", fetched.manifest.name, fetched.root.display());
        (fetched.manifest, fetched.preview_path, fetched.artifacts)
    } else if let Some(dir) = parse_flag(&args, "--session") {
        let session_dir = PathBuf::from(dir);
        let manifest = ImageInfo::load(&session_dir.join("image_info.json")).map_err(|e| {
            anyhow::anyhow!("read manifest in {}: {e}", session_dir.display())
        })?;
        let preview_path = match parse_flag(&args, "--preview") {
            Some(p) => PathBuf::from(p),
            None => {
                let bundled = session_dir.join("low_img.png");
                if !bundled.exists() {
                    return Err(anyhow::anyhow!(
                        "no --preview given and {} does not exist",
                        bundled.display()
                    ));
                }
                bundled
            }
        };
        let artifacts = discover_artifacts(&session_dir, manifest.tiles)?;
        (manifest, preview_path, artifacts)
    } else {
        return Err(anyhow::anyhow!("one of --session DIR or --cid CID is required"));
    };

    let preview = PngCodec.decode(&preview_path)?;
    let protocol = ProtocolConfig::default();
    let signals = match parse_flag(&args, "--leading").and_then(|s| s.parse::<usize>().ok()) {
        Some(leading) => SignalLayout { leading },
        None => protocol.signals,
    };

    // ========================================================================
    // Verify every tile
    // ========================================================================
    let backend = SnarkjsVerifier::default();
    let verifier = SessionVerifier { verifier: &backend, signals, channels: protocol.channels };
    let report = verifier.verify_session(&manifest, &preview, &artifacts)?;

    for r in &report.results {
        let proof = if r.proof_valid { "✓" } else { "✗" };
        let preview_mark = if r.preview_consistent { "✓" } else { "✗" };
        eprintln!("[tile {}] proof {proof}  preview {preview_mark}", r.tile);
    }

    let tiles = report.results.len();
    // Name the first failing tile; the per-tile lines above have the rest.
    report.into_result()?;
    eprintln!(
        "✓ Session `{}` verified: {tiles} tile(s), preview matches everywhere",
        manifest.name
    );
    Ok(())
}
