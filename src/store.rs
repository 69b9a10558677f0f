//! IPFS publication and retrieval of proof sessions via Pinata
//!
//! A published session is one pinned directory:
//!
//! ```text
//! {name}/image_info.json
//! {name}/low_img.png
//! {name}/tile_{i}/proof.json
//! {name}/tile_{i}/public.json
//! {name}/tile_{i}/vkey.json
//! ```
//!
//! The local artifact `verification_key.json` travels under the shorter
//! name `vkey.json`. Pinata answers with the directory CID; anyone can then
//! verify the session from a public gateway without talking to the seller.
//!
//! Fetched sessions land in a per-CID directory under the system temp dir
//! so repeated verifications of the same CID reuse one location.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::manifest::{write_atomic, ImageInfo, ProofArtifact, PLACEHOLDER_JWT};
use crate::tiling::TileIdx;

/// Pinata pinning API.
pub const PINATA_API_BASE: &str = "https://api.pinata.cloud";
/// Default public gateway for reads.
pub const PINATA_GATEWAY: &str = "https://gateway.pinata.cloud";

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Upload and download errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Local file access failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// Transport-level HTTP failure.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    /// A fetched manifest was not valid JSON.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// No real JWT available: the parameter file still holds the
    /// placeholder and `PINATA_JWT` is unset.
    #[error("no Pinata JWT configured; set PINATA_JWT or edit the parameter file")]
    MissingJwt,
    /// Pinata refused the pin request.
    #[error("upload rejected ({status}): {body}")]
    UploadRejected {
        /// HTTP status.
        status: reqwest::StatusCode,
        /// Response body, for the operator.
        body: String,
    },
    /// A gateway read failed.
    #[error("fetching {url} failed ({status})")]
    FetchFailed {
        /// Requested URL.
        url: String,
        /// HTTP status.
        status: reqwest::StatusCode,
    },
    /// The pin response carried no CID.
    #[error("pin response carried no IpfsHash")]
    MalformedPinResponse,
}

#[derive(Deserialize)]
struct PinResponse {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: String,
}

/// A session pulled down from a gateway, laid out like a local one.
pub struct FetchedSession {
    /// Directory everything was written into.
    pub root: PathBuf,
    /// The session manifest.
    pub manifest: ImageInfo,
    /// The disclosed preview image.
    pub preview_path: PathBuf,
    /// Per-tile artifacts, in tile order.
    pub artifacts: Vec<ProofArtifact>,
}

/// Pinata-backed session store.
pub struct PinataStore {
    api_base: String,
    gateway: String,
    client: reqwest::blocking::Client,
}

impl Default for PinataStore {
    fn default() -> Self {
        Self::new(PINATA_API_BASE, PINATA_GATEWAY)
    }
}

impl PinataStore {
    /// Store against explicit endpoints; trailing slashes are tolerated.
    pub fn new(api_base: impl Into<String>, gateway: impl Into<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            gateway: gateway.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Gateway URL of a pinned session directory.
    pub fn session_url(&self, cid: &str) -> String {
        format!("{}/ipfs/{}", self.gateway, cid)
    }

    /// Pin a complete session and return its CID.
    ///
    /// Refuses to send anything when `jwt` is empty or still the generated
    /// placeholder, so a forgotten parameter file fails before any bytes
    /// leave the machine.
    pub fn upload_session(
        &self,
        jwt: &str,
        manifest: &ImageInfo,
        preview_path: &Path,
        artifacts: &[ProofArtifact],
    ) -> Result<String, StoreError> {
        if jwt.trim().is_empty() || jwt == PLACEHOLDER_JWT {
            return Err(StoreError::MissingJwt);
        }

        let mut form = reqwest::blocking::multipart::Form::new();
        let manifest_part = reqwest::blocking::multipart::Part::bytes(serde_json::to_vec(manifest)?)
            .file_name(manifest_part_name(&manifest.name))
            .mime_str("application/json")?;
        form = form.part("file", manifest_part);

        let preview_part = reqwest::blocking::multipart::Part::bytes(std::fs::read(preview_path)?)
            .file_name(preview_part_name(&manifest.name))
            .mime_str("image/png")?;
        form = form.part("file", preview_part);

        for artifact in artifacts {
            let [proof_name, public_name, vkey_name] =
                artifact_part_names(&manifest.name, artifact.tile);
            for (local, remote) in [
                (&artifact.proof_path, proof_name),
                (&artifact.public_path, public_name),
                (&artifact.vkey_path, vkey_name),
            ] {
                let part = reqwest::blocking::multipart::Part::bytes(std::fs::read(local)?)
                    .file_name(remote)
                    .mime_str("application/json")?;
                form = form.part("file", part);
            }
        }

        let response = self
            .client
            .post(format!("{}/pinning/pinFileToIPFS", self.api_base))
            .bearer_auth(jwt)
            .multipart(form)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(StoreError::UploadRejected { status, body });
        }
        let pin: PinResponse =
            response.json().map_err(|_| StoreError::MalformedPinResponse)?;
        if pin.ipfs_hash.is_empty() {
            return Err(StoreError::MalformedPinResponse);
        }
        tracing::info!(
            session = %manifest.name,
            tiles = artifacts.len(),
            url = %self.session_url(&pin.ipfs_hash),
            "session pinned"
        );
        Ok(pin.ipfs_hash)
    }

    /// Download a pinned session into [`session_cache_dir`].
    pub fn fetch_session(&self, cid: &str) -> Result<FetchedSession, StoreError> {
        let root = session_cache_dir(cid);
        let base = self.session_url(cid);

        let manifest_bytes = self.fetch_bytes(&format!("{base}/image_info.json"))?;
        let manifest: ImageInfo = serde_json::from_slice(&manifest_bytes)?;
        write_atomic(&root.join("image_info.json"), &manifest_bytes)?;

        let preview_path = root.join("low_img.png");
        write_atomic(&preview_path, &self.fetch_bytes(&format!("{base}/low_img.png"))?)?;

        let mut artifacts = Vec::with_capacity(manifest.tiles);
        for i in 0..manifest.tiles {
            let dir = root.join(format!("tile_{i}"));
            for file in ["proof.json", "public.json", "vkey.json"] {
                let bytes = self.fetch_bytes(&format!("{base}/tile_{i}/{file}"))?;
                write_atomic(&dir.join(file), &bytes)?;
            }
            artifacts.push(ProofArtifact {
                tile: TileIdx(i),
                proof_path: dir.join("proof.json"),
                public_path: dir.join("public.json"),
                vkey_path: dir.join("vkey.json"),
            });
        }
        tracing::info!(session = %manifest.name, tiles = manifest.tiles, dir = %root.display(), "session fetched");
        Ok(FetchedSession { root, manifest, preview_path, artifacts })
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, StoreError> {
        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::FetchFailed { url: url.to_string(), status });
        }
        Ok(response.bytes()?.to_vec())
    }
}

/// Where a fetched session is cached locally.
pub fn session_cache_dir(cid: &str) -> PathBuf {
    std::env::temp_dir().join(format!("zktile-{cid}"))
}

fn manifest_part_name(session: &str) -> String {
    format!("{session}/image_info.json")
}

fn preview_part_name(session: &str) -> String {
    format!("{session}/low_img.png")
}

fn artifact_part_names(session: &str, tile: TileIdx) -> [String; 3] {
    [
        format!("{session}/tile_{tile}/proof.json"),
        format!("{session}/tile_{tile}/public.json"),
        format!("{session}/tile_{tile}/vkey.json"),
    ]
}
