//! Stage measurement and the per-tile metrics log
//!
//! ## Measurement
//! Every external stage runs under `/usr/bin/time -f "%e %M"`: the tool's
//! stdout is discarded, and the wrapper leaves `elapsed_seconds peak_rss_kib`
//! as the last line of stderr. Stderr is spooled to a scratch file rather
//! than a pipe, because the child is polled (for cancellation) instead of
//! awaited, and a filling pipe would wedge a chatty tool. Parsing takes the
//! last two tokens of the last non-empty line, so tool noise ahead of the
//! stats line is harmless.
//!
//! A failing tool still produces a stats line; [`run_measured`] reports the
//! exit verdict alongside the metrics and leaves the failure policy to the
//! caller. The prove-time verify stage is the one consumer that treats a
//! non-zero exit as a verdict rather than an error.
//!
//! ## Cancellation
//! A [`CancelFlag`] is shared across the worker pool. Each in-flight stage
//! polls it between `try_wait` checks and kills its subprocess when the flag
//! trips, so one tile's failure stops the whole session promptly.
//!
//! ## Metrics log
//! One CSV row per tile, appended behind a mutex; the header is written only
//! when the file is empty, so re-runs accumulate rows instead of repeating
//! headers.

#![forbid(unsafe_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Measurement errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Spawning or reaping the subprocess failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// The session was cancelled while the stage ran.
    #[error("stage cancelled")]
    Cancelled,
    /// The time wrapper produced no parsable stats line.
    #[error("no stats line in time output: {tail:?}")]
    MalformedTimeOutput {
        /// Trailing stderr content, for diagnosis.
        tail: String,
    },
}

/// Cooperative cancellation shared by all workers of a session.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A fresh, untripped flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the flag; every polling stage kills its subprocess.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has tripped.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Elapsed wall time and peak RSS of one measured stage.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StageMetrics {
    /// Wall-clock seconds.
    pub seconds: f64,
    /// Peak resident set size in KiB.
    pub peak_kib: u64,
}

/// Outcome of a measured run: stats plus the tool's exit verdict.
#[derive(Clone, Debug)]
pub struct MeasuredRun {
    /// Parsed stats.
    pub metrics: StageMetrics,
    /// Whether the tool exited zero.
    pub success: bool,
    /// Trailing stderr, kept for error reporting.
    pub stderr_tail: String,
}

const TIME_BIN: &str = "/usr/bin/time";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_TAIL_LIMIT: usize = 2048;

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

fn scratch_stderr_path() -> PathBuf {
    let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("zktile-time-{}-{seq}.stderr", std::process::id()))
}

/// Run `program args..` under the time wrapper, discarding its stdout.
///
/// Blocks until the tool exits or `cancel` trips; on cancellation the
/// subprocess is killed and [`MetricsError::Cancelled`] is returned.
pub fn run_measured(
    program: &str,
    args: &[String],
    cancel: &CancelFlag,
) -> Result<MeasuredRun, MetricsError> {
    let stderr_path = scratch_stderr_path();
    let stderr_file = fs::File::create(&stderr_path)?;

    let mut child = Command::new(TIME_BIN)
        .arg("-f")
        .arg("%e %M")
        .arg(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(stderr_file))
        .spawn()?;

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            let _ = fs::remove_file(&stderr_path);
            return Err(MetricsError::Cancelled);
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();
    let _ = fs::remove_file(&stderr_path);
    let tail_start = stderr.len().saturating_sub(STDERR_TAIL_LIMIT);
    let stderr_tail = stderr[tail_start..].to_owned();

    let (seconds, peak_kib) = parse_time_output(&stderr)
        .ok_or(MetricsError::MalformedTimeOutput { tail: stderr_tail.clone() })?;

    Ok(MeasuredRun {
        metrics: StageMetrics { seconds, peak_kib },
        success: status.success(),
        stderr_tail,
    })
}

/// Last two whitespace tokens of the last non-empty line: seconds, then KiB.
fn parse_time_output(stderr: &str) -> Option<(f64, u64)> {
    let line = stderr.lines().rev().find(|l| !l.trim().is_empty())?;
    let mut tokens = line.split_whitespace().rev();
    let peak_kib = tokens.next()?.parse().ok()?;
    let seconds = tokens.next()?.parse().ok()?;
    Some((seconds, peak_kib))
}

/// One tile's worth of stage measurements.
#[derive(Clone, Debug)]
pub struct TileMetricsRow {
    /// Tile index ("frame" in the log).
    pub frame: usize,
    /// Compile stage.
    pub circuit: StageMetrics,
    /// Trusted-setup stage.
    pub setup: StageMetrics,
    /// Prove stage.
    pub prover: StageMetrics,
    /// Verify stage.
    pub verifier: StageMetrics,
}

const CSV_HEADER: &str = "frame,time_circuit,memory_circuit,time_setup,memory_setup,\
time_prover,memory_prover,time_verifier,memory_verifier";

impl TileMetricsRow {
    fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.frame,
            self.circuit.seconds,
            self.circuit.peak_kib,
            self.setup.seconds,
            self.setup.peak_kib,
            self.prover.seconds,
            self.prover.peak_kib,
            self.verifier.seconds,
            self.verifier.peak_kib,
        )
    }
}

/// Append-only CSV log, serialized behind a mutex.
pub struct MetricsLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MetricsLog {
    /// Log writing rows to `path`; the file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first iff the file is empty.
    pub fn append(&self, row: &TileMetricsRow) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{CSV_HEADER}")?;
        }
        writeln!(file, "{}", row.to_csv_line())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_line_parses_from_clean_output() {
        assert_eq!(parse_time_output("0.03 123456\n"), Some((0.03, 123_456)));
    }

    #[test]
    fn stats_line_parses_past_tool_noise() {
        let noisy = "template instances: 85\nnon-linear constraints: 12000\n\
                     Command exited with non-zero status 1\n1.25 987654\n";
        assert_eq!(parse_time_output(noisy), Some((1.25, 987_654)));
    }

    #[test]
    fn garbage_output_does_not_parse() {
        assert_eq!(parse_time_output(""), None);
        assert_eq!(parse_time_output("no numbers here\n"), None);
        assert_eq!(parse_time_output("1.5\n"), None);
    }

    #[test]
    fn cancel_flag_trips_once_for_all_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn cancellation_kills_the_child_and_reports_cancelled() {
        if !Path::new(TIME_BIN).exists() {
            return;
        }
        let cancel = CancelFlag::new();
        let trip = cancel.clone();
        let tripper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            trip.cancel();
        });

        let started = std::time::Instant::now();
        let err = run_measured("sh", &["-c".to_owned(), "sleep 60".to_owned()], &cancel)
            .unwrap_err();
        tripper.join().unwrap();

        assert!(matches!(err, MetricsError::Cancelled));
        // The sleep was killed, not awaited.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn log_writes_header_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = MetricsLog::new(dir.path().join("image_stats.csv"));

        let stage = |s: f64, m: u64| StageMetrics { seconds: s, peak_kib: m };
        let row = |frame: usize| TileMetricsRow {
            frame,
            circuit: stage(0.5, 1000),
            setup: stage(1.5, 2000),
            prover: stage(2.5, 3000),
            verifier: stage(0.1, 500),
        };

        log.append(&row(0)).unwrap();
        log.append(&row(1)).unwrap();

        let content = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].starts_with("0,0.5,1000,1.5,2000,2.5,3000,0.1,500"));
        assert!(lines[2].starts_with("1,"));
        assert_eq!(content.matches("frame").count(), 1);
    }

    #[test]
    fn reopened_log_does_not_repeat_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image_stats.csv");
        let stage = StageMetrics { seconds: 1.0, peak_kib: 1 };
        let row = TileMetricsRow { frame: 0, circuit: stage, setup: stage, prover: stage, verifier: stage };

        MetricsLog::new(&path).append(&row).unwrap();
        MetricsLog::new(&path).append(&row).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert_eq!(content.matches(CSV_HEADER).count(), 1);
    }
}
