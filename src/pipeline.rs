//! Tile-parallel proving pipeline
//!
//! ## Overview
//! One proving session turns an image into per-tile proof artifacts:
//!
//! 1. Decode the image, derive the preview, and export it.
//! 2. Compute the tile plan and persist the manifest.
//! 3. Assemble and write the session witness (once; every tile's circuit
//!    reads the same file and extracts its own slice by tile id).
//! 4. Per tile, run the `Parameterize -> Compile -> Setup -> Prove ->
//!    Verify -> Record` state machine against the injected backends.
//!
//! Tiles are independent, so stage 4 runs on a bounded rayon pool. The only
//! shared artifacts are per-tile namespaced paths and the metrics log, which
//! is appended after the pool joins, in tile order, so concurrent runs
//! produce a deterministic CSV.
//!
//! ## Failure policy
//! A stage failure is fatal for the session: the shared [`CancelFlag`] trips,
//! in-flight subprocesses are killed, and the first real (non-cancellation)
//! error in tile order is reported. A tile whose proof verifies as false at
//! prove time is reported as [`PipelineError::ProofRejected`]; there is no
//! retry at this layer.
//!
//! Stage outputs land in a per-tile staging directory that is renamed to the
//! tile's canonical artifact directory only after the prove-time verify
//! stage passes; on any failure the staging directory is removed. The
//! canonical path therefore holds either a complete, verified artifact set
//! or nothing, even when cancellation kills a stage mid-write.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use rand::{CryptoRng, RngCore};
use rayon::prelude::*;

use crate::backend::{BackendError, ProofBackend};
use crate::curve::CurveParams;
use crate::manifest::{ImageInfo, ManifestError, ProofArtifact, SessionParams, StorageLayout};
use crate::metrics::{CancelFlag, MetricsLog, TileMetricsRow};
use crate::pixel::{ImageBackend, PixelError, PixelGrid};
use crate::tiling::{SplitAxis, TileDescriptor, TilePlan, TilingError};
use crate::witness::{render_tile_circuit, TemplateDims, Witness, WitnessError};
use crate::ProtocolConfig;

/// Stages of the per-tile state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Circuit template instantiation.
    Parameterize,
    /// Circuit compilation.
    Compile,
    /// Trusted setup.
    Setup,
    /// Proof generation.
    Prove,
    /// Prove-time proof check.
    Verify,
    /// Metrics recording.
    Record,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Parameterize => "parameterize",
            Stage::Compile => "compile",
            Stage::Setup => "setup",
            Stage::Prove => "prove",
            Stage::Verify => "verify",
            Stage::Record => "record",
        };
        f.write_str(name)
    }
}

/// Pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Session-level file handling failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// Image decoding, resize, or export failed.
    #[error("image: {0}")]
    Pixel(#[from] PixelError),
    /// Tile planning failed.
    #[error("tiling: {0}")]
    Tiling(#[from] TilingError),
    /// Manifest or parameter handling failed.
    #[error("manifest: {0}")]
    Manifest(#[from] ManifestError),
    /// Witness assembly or templating failed.
    #[error("witness: {0}")]
    Witness(#[from] WitnessError),
    /// Worker pool construction failed.
    #[error("worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    /// An external stage failed for one tile.
    #[error("tile {tile}, {stage} stage: {source}")]
    Stage {
        /// Tile that failed.
        tile: usize,
        /// Stage that failed.
        stage: Stage,
        /// Underlying backend failure.
        source: BackendError,
    },
    /// The prover's own check rejected a freshly produced proof.
    #[error("tile {tile}: prover rejected its own proof")]
    ProofRejected {
        /// Tile whose proof was rejected.
        tile: usize,
    },
}

impl PipelineError {
    fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PipelineError::Stage { source: BackendError::Cancelled, .. }
        )
    }
}

/// How the tile extent is chosen.
#[derive(Copy, Clone, Debug)]
pub enum TileSizing {
    /// Derive the extent from a per-tile signal budget.
    Budget(usize),
    /// Use this extent directly.
    Extent(usize),
}

/// One proving request.
#[derive(Clone, Debug)]
pub struct ProveRequest {
    /// Source image file.
    pub image_path: PathBuf,
    /// Session name recorded in the manifest and used for uploads.
    pub session_name: String,
    /// Circuit template file.
    pub template_path: PathBuf,
    /// Preview `(height, width)`.
    pub preview: (usize, usize),
    /// Where the preview PNG is written.
    pub preview_path: PathBuf,
    /// Tile sizing rule.
    pub sizing: TileSizing,
    /// Worker count; `0` lets the pool pick.
    pub workers: usize,
    /// Whether to append per-tile rows to the metrics CSV.
    pub record_csv: bool,
    /// Optional directory for per-tile PNG exports.
    pub save_tiles_dir: Option<PathBuf>,
}

/// What a completed session hands back.
#[derive(Debug)]
pub struct ProveOutcome {
    /// The persisted manifest.
    pub manifest: ImageInfo,
    /// The plan the session used.
    pub plan: TilePlan,
    /// Artifact paths, in tile order.
    pub artifacts: Vec<ProofArtifact>,
    /// Metrics CSV path, when recording was requested.
    pub csv_path: Option<PathBuf>,
}

struct TileOutcome {
    artifact: ProofArtifact,
    metrics: TileMetricsRow,
}

/// The proving pipeline with its injected collaborators.
pub struct ProvePipeline<'a> {
    /// Curve the commitment keypair lives on.
    pub curve: &'a CurveParams,
    /// Path conventions for this session.
    pub layout: StorageLayout,
    /// Protocol constants (key count, channels, signal layout).
    pub protocol: ProtocolConfig,
    /// Proving-system backend.
    pub proof_backend: &'a dyn ProofBackend,
    /// Image codec backend.
    pub image_backend: &'a dyn ImageBackend,
}

impl ProvePipeline<'_> {
    /// Run a full session. Blocks until every tile has finished or the
    /// session has failed and in-flight work has been cancelled.
    pub fn run<R: RngCore + CryptoRng>(
        &self,
        request: &ProveRequest,
        params: &SessionParams,
        rng: &mut R,
    ) -> Result<ProveOutcome, PipelineError> {
        let channels = self.protocol.channels;

        let full = self.image_backend.decode(&request.image_path)?;
        let low = self.image_backend.resize(&full, request.preview.0, request.preview.1)?;
        if let Some(parent) = request.preview_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.image_backend.encode(&request.preview_path, &low)?;

        let plan = match request.sizing {
            TileSizing::Budget(budget) => {
                TilePlan::compute(full.height(), full.width(), channels, budget)?
            }
            TileSizing::Extent(extent) => TilePlan::partition(
                full.height(),
                full.width(),
                channels,
                extent,
                SplitAxis::for_dims(full.height(), full.width()),
            )?,
        };
        tracing::info!(
            tiles = plan.tile_count(),
            axis = plan.axis.as_index(),
            "tile plan computed"
        );

        if let Some(dir) = &request.save_tiles_dir {
            self.export_tiles(&full, &plan, dir)?;
        }

        let commitment = params.commitment_keypair(self.curve)?;
        let randomness = params.commitment_randomness_fe()?;
        let master_keys = params.master_keys_fe()?;
        let witness = Witness::build(
            self.curve,
            &commitment,
            &randomness,
            &master_keys,
            self.protocol.key_count,
            &full,
            &low,
            rng,
        )?;
        let witness_path = self.layout.witness_path();
        witness.save(&witness_path)?;

        let manifest = ImageInfo::from_plan(&request.session_name, &plan);
        manifest.save(&self.layout.manifest_path())?;

        let dims = TemplateDims {
            full: (full.height(), full.width()),
            preview: request.preview,
            tile_count: plan.tile_count(),
        };

        let cancel = CancelFlag::new();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(request.workers).build()?;
        let results: Vec<Result<TileOutcome, PipelineError>> = pool.install(|| {
            plan.tiles
                .par_iter()
                .map(|tile| {
                    self.run_tile(tile, request, &dims, &witness_path, &cancel).map_err(|err| {
                        cancel.cancel();
                        err
                    })
                })
                .collect()
        });

        let mut outcomes = Vec::with_capacity(results.len());
        let mut cancelled: Option<PipelineError> = None;
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) if err.is_cancellation() => {
                    cancelled.get_or_insert(err);
                }
                // First real failure in tile order wins.
                Err(err) => return Err(err),
            }
        }
        if let Some(err) = cancelled {
            return Err(err);
        }

        let csv_path = if request.record_csv {
            let log = MetricsLog::new(self.layout.csv_path());
            for outcome in &outcomes {
                log.append(&outcome.metrics).map_err(|io| PipelineError::Stage {
                    tile: outcome.metrics.frame,
                    stage: Stage::Record,
                    source: BackendError::Io(io),
                })?;
            }
            Some(log.path().to_owned())
        } else {
            None
        };

        Ok(ProveOutcome {
            manifest,
            artifacts: outcomes.into_iter().map(|o| o.artifact).collect(),
            plan,
            csv_path,
        })
    }

    fn export_tiles(
        &self,
        full: &PixelGrid,
        plan: &TilePlan,
        dir: &std::path::Path,
    ) -> Result<(), PipelineError> {
        std::fs::create_dir_all(dir)?;
        let blocks = full.slice_tiles(plan)?;
        for (tile, block) in plan.tiles.iter().zip(blocks) {
            let grid = PixelGrid::new(tile.height, tile.width, plan.channels, block)?;
            let path = dir.join(format!("tile_{}.png", tile.index));
            self.image_backend.encode(&path, &grid)?;
        }
        Ok(())
    }

    fn run_tile(
        &self,
        tile: &TileDescriptor,
        request: &ProveRequest,
        dims: &TemplateDims,
        witness_path: &std::path::Path,
        cancel: &CancelFlag,
    ) -> Result<TileOutcome, PipelineError> {
        let staging = self.layout.tile_staging_dir(tile.index);
        let outcome = self.run_tile_stages(tile, request, dims, witness_path, &staging, cancel);
        if outcome.is_err() {
            // Whatever a failed or killed stage managed to write stays out
            // of the canonical path.
            let _ = std::fs::remove_dir_all(&staging);
        }
        outcome
    }

    fn run_tile_stages(
        &self,
        tile: &TileDescriptor,
        request: &ProveRequest,
        dims: &TemplateDims,
        witness_path: &std::path::Path,
        staging: &std::path::Path,
        cancel: &CancelFlag,
    ) -> Result<TileOutcome, PipelineError> {
        let idx = tile.index.as_usize();
        let stage_err =
            |stage: Stage, source: BackendError| PipelineError::Stage { tile: idx, stage, source };

        if cancel.is_cancelled() {
            return Err(stage_err(Stage::Parameterize, BackendError::Cancelled));
        }

        let circuit = render_tile_circuit(&request.template_path, &self.layout, tile, dims)
            .map_err(|err| match err {
                WitnessError::Io(io) => stage_err(Stage::Parameterize, BackendError::Io(io)),
                other => PipelineError::Witness(other),
            })?;
        let circuit_id = self.layout.tile_circuit_id(tile.index);
        std::fs::create_dir_all(staging)?;

        tracing::debug!(tile = idx, "compiling circuit");
        let circuit_metrics = self
            .proof_backend
            .compile(&circuit, witness_path, cancel)
            .map_err(|e| stage_err(Stage::Compile, e))?;

        tracing::debug!(tile = idx, "trusted setup");
        let setup_metrics = self
            .proof_backend
            .setup(&circuit_id, staging, cancel)
            .map_err(|e| stage_err(Stage::Setup, e))?;

        tracing::debug!(tile = idx, "proving");
        let prover_metrics = self
            .proof_backend
            .prove(&circuit_id, staging, cancel)
            .map_err(|e| stage_err(Stage::Prove, e))?;

        let staged = ProofArtifact::in_dir(tile.index, staging);
        let (verdict, verifier_metrics) = self
            .proof_backend
            .verify(&staged, cancel)
            .map_err(|e| stage_err(Stage::Verify, e))?;
        if !verdict {
            return Err(PipelineError::ProofRejected { tile: idx });
        }

        // Promote: only a complete, verified artifact set reaches the
        // canonical directory.
        let canonical = self.layout.tile_dir(tile.index);
        if canonical.exists() {
            std::fs::remove_dir_all(&canonical)
                .map_err(|io| stage_err(Stage::Record, BackendError::Io(io)))?;
        }
        std::fs::rename(staging, &canonical)
            .map_err(|io| stage_err(Stage::Record, BackendError::Io(io)))?;
        tracing::info!(tile = idx, seconds = prover_metrics.seconds, "tile proven");

        Ok(TileOutcome {
            artifact: self.layout.tile_artifact(tile.index),
            metrics: TileMetricsRow {
                frame: idx,
                circuit: circuit_metrics,
                setup: setup_metrics,
                prover: prover_metrics,
                verifier: verifier_metrics,
            },
        })
    }
}
