//! CLI prover: tile an image, prove every tile, optionally publish
//!
//! One invocation runs a complete proving session:
//!   preview resize → tile plan → witness → per-tile
//!   compile/setup/prove/verify via the toolchain scripts → manifest,
//!   optional metrics CSV, optional Pinata upload.
//!
//! `--check-pixel S` answers the sizing question without proving: it reports
//! how many lines of the split axis fit an `S*S*3` signal budget and exits.

#![forbid(unsafe_code)]

use std::{env, path::PathBuf};

use zktile::backend::SnarkjsBackend;
use zktile::pixel::{ImageBackend, PngCodec};
use zktile::store::PinataStore;
use zktile::tiling::split_budget;
use zktile::{
    CurveParams, ProtocolConfig, ProvePipeline, ProveRequest, SessionParams, StorageLayout,
    TileSizing,
};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}
fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

/// Accepts `HxW` or the full operation string `resize_HxW`. Any other
/// operation name is rejected; only resize circuits exist.
fn parse_resize(op: &str) -> anyhow::Result<(usize, usize)> {
    let dims = match op.split_once('_') {
        Some(("resize", rest)) => rest,
        Some((other, _)) => {
            return Err(anyhow::anyhow!(
                "operation `{other}` is not implemented; only `resize` is"
            ));
        }
        None => op,
    };
    let (h, w) = dims
        .split_once('x')
        .ok_or_else(|| anyhow::anyhow!("malformed resize `{op}`; expected HxW, e.g. 22x22"))?;
    let h: usize =
        h.parse().map_err(|_| anyhow::anyhow!("resize height `{h}` is not a number"))?;
    let w: usize =
        w.parse().map_err(|_| anyhow::anyhow!("resize width `{w}` is not a number"))?;
    Ok((h, w))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "zktile=info".into()))
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = env::args().collect();

    let image = PathBuf::from(
        parse_flag(&args, "--image").ok_or_else(|| anyhow::anyhow!("--image is required"))?,
    );
    if !image.exists() || image.extension().and_then(|e| e.to_str()) != Some("png") {
        return Err(anyhow::anyhow!("image not found: {} (a .png is required)", image.display()));
    }

    let mut layout = StorageLayout::default();
    if let Some(dir) = parse_flag(&args, "--out") {
        layout.out_dir = PathBuf::from(dir);
    }
    if let Some(dir) = parse_flag(&args, "--circuits") {
        layout.circuits_dir = PathBuf::from(dir);
    }
    if let Some(pot) = parse_flag(&args, "--pot") {
        layout.pot_path = PathBuf::from(pot);
    }

    let protocol = ProtocolConfig::default();

    let tile_rows = parse_flag(&args, "--tile-rows").and_then(|s| s.parse::<usize>().ok());
    let check_pixel = parse_flag(&args, "--check-pixel").and_then(|s| s.parse::<usize>().ok());

    // ========================================================================
    // Sizing mode: report the extent for a pixel budget and exit
    // ========================================================================
    if let Some(side) = check_pixel {
        if tile_rows.is_some() {
            return Err(anyhow::anyhow!("--tile-rows and --check-pixel are mutually exclusive"));
        }
        let grid = PngCodec.decode(&image)?;
        let budget = side * side * protocol.channels;
        let (axis, extent) =
            split_budget(grid.height(), grid.width(), protocol.channels, budget)?;
        let dim = ["height", "width"][axis.as_index()];
        eprintln!(
            "Max lines per tile: {extent} (dividing the {dim}) to stay within \
             the {side}x{side}x{} signal budget.",
            protocol.channels
        );
        return Ok(());
    }
    let Some(tile_rows) = tile_rows else {
        return Err(anyhow::anyhow!("one of --tile-rows or --check-pixel is required"));
    };

    // ========================================================================
    // Session setup
    // ========================================================================
    let params_path = PathBuf::from(
        parse_flag(&args, "--params").ok_or_else(|| anyhow::anyhow!("--params is required"))?,
    );
    let params = SessionParams::load(&params_path)
        .map_err(|e| anyhow::anyhow!("read parameters {}: {e}", params_path.display()))?;

    // Upload credentials are checked before any proving work starts.
    let upload_jwt = if has_flag(&args, "--upload") {
        let jwt = params.jwt().ok_or_else(|| {
            anyhow::anyhow!(
                "no Pinata JWT: set PINATA_JWT or edit {} before uploading",
                params_path.display()
            )
        })?;
        Some(jwt)
    } else {
        None
    };

    let preview = parse_resize(&parse_flag(&args, "--resize").unwrap_or_else(|| "10x10".into()))?;
    let session_name = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("image path has no file name"))?;
    let preview_path = match parse_flag(&args, "--save-preview") {
        Some(p) => PathBuf::from(p),
        None => {
            let file_name = image
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            image
                .parent()
                .unwrap_or_else(|| std::path::Path::new("."))
                .join(format!("resize_{}x{}_{}", preview.0, preview.1, file_name))
        }
    };

    let request = ProveRequest {
        image_path: image,
        session_name,
        template_path: layout.template_path(),
        preview,
        preview_path: preview_path.clone(),
        sizing: TileSizing::Extent(tile_rows),
        workers: parse_flag(&args, "--workers").and_then(|s| s.parse().ok()).unwrap_or(0),
        record_csv: has_flag(&args, "--csv"),
        save_tiles_dir: parse_flag(&args, "--save-tiles").map(PathBuf::from),
    };

    // ========================================================================
    // Prove
    // ========================================================================
    let curve = CurveParams::baby_jubjub();
    let backend = SnarkjsBackend::new(layout.clone());
    let pipeline = ProvePipeline {
        curve: &curve,
        layout: layout.clone(),
        protocol,
        proof_backend: &backend,
        image_backend: &PngCodec,
    };
    let mut rng = rand::thread_rng();
    let outcome = pipeline.run(&request, &params, &mut rng)?;

    eprintln!(
        "✓ Proved {} tile(s); artifacts under {}",
        outcome.plan.tile_count(),
        layout.out_dir.display()
    );
    eprintln!("✓ Preview written to {}", preview_path.display());
    if let Some(csv) = &outcome.csv_path {
        eprintln!("✓ Metrics appended to {}", csv.display());
    }

    // ========================================================================
    // Optional upload
    // ========================================================================
    if let Some(jwt) = &upload_jwt {
        let store = PinataStore::default();
        let cid =
            store.upload_session(jwt, &outcome.manifest, &preview_path, &outcome.artifacts)?;
        eprintln!("✓ Session pinned: {}", store.session_url(&cid));
        eprintln!();
        eprintln!("Anyone can verify it with:");
        eprintln!("  cargo run --bin verifier -- --cid {cid}");
    }

    Ok(())
}
