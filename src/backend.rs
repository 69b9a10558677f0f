//! External toolchain backends
//!
//! ## Overview
//! The circuit compiler, the proving system, and the authenticated cipher
//! are all external programs. The pipeline talks to them through the
//! [`ProofBackend`] and [`CipherBackend`] traits, so the orchestration,
//! offset, and aggregation logic runs against in-memory fakes in tests and
//! against subprocesses in production.
//!
//! [`SnarkjsBackend`] drives the wrapper scripts of the snarkjs/circom
//! toolchain, each stage under the time wrapper from [`crate::metrics`]:
//!
//! ```text
//! {scripts}/compile_circuit.sh             {circuit.circom} {input.json}
//! {scripts}/proving_system/setup_prover.sh {circuit_id} {pot} {artifact_dir}
//! {scripts}/proving_system/prover.sh       {circuit_id} {artifact_dir}
//! {scripts}/proving_system/verifier.sh     {circuit_id} {artifact_dir}
//! ```
//!
//! `artifact_dir` is where the stage reads and writes the tile's key and
//! proof files. The pipeline points it at a per-tile staging directory and
//! promotes the directory to its canonical path only after the verify
//! stage passes, so a stage killed mid-write (cancellation) never leaves a
//! truncated `proof.json` where a verifier would look for it.
//!
//! A non-zero exit from compile/setup/prove is a stage failure. The verify
//! stage is different: its exit status *is* the verdict, so it surfaces as
//! `(bool, StageMetrics)` instead of an error.
//!
//! [`NativeCipher`] shells out to the decryption binary, which prints the
//! recovered plaintext as a bracketed comma-separated decimal list on
//! stdout.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::exchange::Key256;
use crate::manifest::{ProofArtifact, StorageLayout};
use crate::metrics::{run_measured, CancelFlag, MetricsError, StageMetrics};

/// Backend invocation errors.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The session was cancelled while a stage ran.
    #[error("stage cancelled")]
    Cancelled,
    /// Subprocess plumbing failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// The tool exited non-zero (or its measurement line was missing).
    #[error("`{command}` failed: {stderr_tail}")]
    Tool {
        /// Command line that failed.
        command: String,
        /// Trailing stderr, for diagnosis.
        stderr_tail: String,
    },
    /// Tool output did not have the promised shape.
    #[error("`{command}` produced malformed output: {detail}")]
    MalformedOutput {
        /// Command line that produced the output.
        command: String,
        /// What was wrong.
        detail: String,
    },
}

/// Compile/setup/prove/verify as seen by the pipeline.
pub trait ProofBackend: Send + Sync {
    /// Compile a generated circuit against the session witness.
    fn compile(
        &self,
        circuit: &Path,
        witness: &Path,
        cancel: &CancelFlag,
    ) -> Result<StageMetrics, BackendError>;

    /// Run the trusted setup for one tile's circuit, writing the key
    /// material into `out_dir`.
    fn setup(
        &self,
        circuit_id: &str,
        out_dir: &Path,
        cancel: &CancelFlag,
    ) -> Result<StageMetrics, BackendError>;

    /// Produce `proof.json` and `public.json` for one tile in `out_dir`.
    fn prove(
        &self,
        circuit_id: &str,
        out_dir: &Path,
        cancel: &CancelFlag,
    ) -> Result<StageMetrics, BackendError>;

    /// Check one tile's proof; the boolean is the prover's own verdict.
    fn verify(
        &self,
        artifact: &ProofArtifact,
        cancel: &CancelFlag,
    ) -> Result<(bool, StageMetrics), BackendError>;
}

/// Tile decryption as seen by the reconstruction codec.
pub trait CipherBackend: Send + Sync {
    /// Recover `plaintext_len` bytes from a tile's `public.json` using the
    /// two master keys.
    fn decrypt(
        &self,
        public_path: &Path,
        plaintext_len: usize,
        keys: &[Key256; 2],
    ) -> Result<Vec<u8>, BackendError>;
}

fn display_command(program: &Path, args: &[String]) -> String {
    let mut line = program.to_string_lossy().into_owned();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

fn run_stage(
    program: &Path,
    args: &[String],
    cancel: &CancelFlag,
) -> Result<StageMetrics, BackendError> {
    let command = display_command(program, args);
    let run = run_measured(&program.to_string_lossy(), args, cancel).map_err(|e| match e {
        MetricsError::Cancelled => BackendError::Cancelled,
        MetricsError::Io(io) => BackendError::Io(io),
        MetricsError::MalformedTimeOutput { tail } => {
            BackendError::Tool { command: command.clone(), stderr_tail: tail }
        }
    })?;
    if !run.success {
        return Err(BackendError::Tool { command, stderr_tail: run.stderr_tail });
    }
    Ok(run.metrics)
}

/// Production [`ProofBackend`]: the snarkjs/circom wrapper scripts.
pub struct SnarkjsBackend {
    layout: StorageLayout,
}

impl SnarkjsBackend {
    /// Backend using the script and artifact paths of `layout`.
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    fn script(&self, name: &str) -> PathBuf {
        self.layout.scripts_dir.join(name)
    }
}

impl ProofBackend for SnarkjsBackend {
    fn compile(
        &self,
        circuit: &Path,
        witness: &Path,
        cancel: &CancelFlag,
    ) -> Result<StageMetrics, BackendError> {
        let args = vec![
            circuit.to_string_lossy().into_owned(),
            witness.to_string_lossy().into_owned(),
        ];
        run_stage(&self.script("compile_circuit.sh"), &args, cancel)
    }

    fn setup(
        &self,
        circuit_id: &str,
        out_dir: &Path,
        cancel: &CancelFlag,
    ) -> Result<StageMetrics, BackendError> {
        let args = vec![
            circuit_id.to_owned(),
            self.layout.pot_path.to_string_lossy().into_owned(),
            out_dir.to_string_lossy().into_owned(),
        ];
        run_stage(&self.script("proving_system/setup_prover.sh"), &args, cancel)
    }

    fn prove(
        &self,
        circuit_id: &str,
        out_dir: &Path,
        cancel: &CancelFlag,
    ) -> Result<StageMetrics, BackendError> {
        let args = vec![circuit_id.to_owned(), out_dir.to_string_lossy().into_owned()];
        run_stage(&self.script("proving_system/prover.sh"), &args, cancel)
    }

    fn verify(
        &self,
        artifact: &ProofArtifact,
        cancel: &CancelFlag,
    ) -> Result<(bool, StageMetrics), BackendError> {
        let program = self.script("proving_system/verifier.sh");
        let args = vec![
            self.layout.tile_circuit_id(artifact.tile),
            artifact.dir().to_string_lossy().into_owned(),
        ];
        let command = display_command(&program, &args);
        let run = run_measured(&program.to_string_lossy(), &args, cancel).map_err(|e| match e {
            MetricsError::Cancelled => BackendError::Cancelled,
            MetricsError::Io(io) => BackendError::Io(io),
            MetricsError::MalformedTimeOutput { tail } => {
                BackendError::Tool { command: command.clone(), stderr_tail: tail }
            }
        })?;
        // Exit status is the verdict here, not a failure.
        Ok((run.success, run.metrics))
    }
}

/// Run a program to completion, capturing stdout. Non-zero exit is an error.
pub(crate) fn run_captured(program: &Path, args: &[String]) -> Result<String, BackendError> {
    let command = display_command(program, args);
    let output = Command::new(program).args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail_start = stderr.len().saturating_sub(2048);
        return Err(BackendError::Tool {
            command,
            stderr_tail: stderr[tail_start..].to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Production [`CipherBackend`]: the native authenticated-decryption binary.
///
/// Invocation: `{binary} {public.json} {plaintext_len} {key0} {key1}` with
/// the keys as decimal integers.
pub struct NativeCipher {
    binary: PathBuf,
}

impl NativeCipher {
    /// Cipher backend invoking `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

impl CipherBackend for NativeCipher {
    fn decrypt(
        &self,
        public_path: &Path,
        plaintext_len: usize,
        keys: &[Key256; 2],
    ) -> Result<Vec<u8>, BackendError> {
        let args = vec![
            public_path.to_string_lossy().into_owned(),
            plaintext_len.to_string(),
            keys[0].to_decimal(),
            keys[1].to_decimal(),
        ];
        let command = display_command(&self.binary, &args);
        let stdout = run_captured(&self.binary, &args)?;
        let bytes = parse_decimal_list(&stdout).map_err(|detail| {
            BackendError::MalformedOutput { command: command.clone(), detail }
        })?;
        if bytes.len() != plaintext_len {
            return Err(BackendError::MalformedOutput {
                command,
                detail: format!("expected {plaintext_len} plaintext bytes, got {}", bytes.len()),
            });
        }
        Ok(bytes)
    }
}

/// Parse `[12, 240, 3, ...]` (brackets and quotes optional) into bytes.
fn parse_decimal_list(text: &str) -> Result<Vec<u8>, String> {
    let cleaned: String =
        text.chars().filter(|c| !matches!(c, '[' | ']' | '\'' | '"')).collect();
    cleaned
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u8>().map_err(|_| format!("{s:?} is not a byte value"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_list_parses_with_and_without_brackets() {
        assert_eq!(parse_decimal_list("[12, 240, 3]").unwrap(), vec![12, 240, 3]);
        assert_eq!(parse_decimal_list("0,1,255\n").unwrap(), vec![0, 1, 255]);
        assert_eq!(parse_decimal_list("['7', '8']").unwrap(), vec![7, 8]);
    }

    #[test]
    fn decimal_list_rejects_non_bytes() {
        assert!(parse_decimal_list("[300]").is_err());
        assert!(parse_decimal_list("[-1]").is_err());
        assert!(parse_decimal_list("[abc]").is_err());
    }

    #[test]
    fn captured_run_reports_non_zero_exit() {
        let err = run_captured(Path::new("sh"), &["-c".to_owned(), "exit 3".to_owned()])
            .unwrap_err();
        match err {
            BackendError::Tool { command, .. } => assert!(command.starts_with("sh -c")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn captured_run_returns_stdout() {
        let out = run_captured(Path::new("sh"), &["-c".to_owned(), "printf '[1, 2]'".to_owned()])
            .unwrap();
        assert_eq!(parse_decimal_list(&out).unwrap(), vec![1, 2]);
    }
}
