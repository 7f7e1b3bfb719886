//! Spawn, wait, and measure an external command.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::memory::{PeakMemoryMonitor, DEFAULT_SAMPLE_INTERVAL, MIN_REPORTED_BYTES};

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Number of trailing output lines kept in failure messages.
const ERROR_TAIL_LINES: usize = 20;

// ---------------------------------------------------------------------------
// ProcessSpec
// ---------------------------------------------------------------------------

/// A command to run. Built with chained setters.
#[derive(Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Environment overlay. Values are never logged.
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Write stdout to this file instead of capturing it.
    pub stdout_path: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            timeout: None,
            stdout_path: None,
        }
    }

    /// `sh -c <command>`, for user-supplied hook strings.
    pub fn shell(command: &str) -> Self {
        Self::new("sh").arg("-c").arg(command)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_path = Some(path.into());
        self
    }
}

impl fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("ProcessSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .field("working_dir", &self.working_dir)
            .field("timeout", &self.timeout)
            .field("stdout_path", &self.stdout_path)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Output and metrics
// ---------------------------------------------------------------------------

/// Duration and peak memory of one executed stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageMetrics {
    pub duration_secs: f64,
    pub peak_memory_mb: f64,
}

impl StageMetrics {
    /// Fold several commands of one stage: durations add, peaks take the max.
    pub fn combine(self, other: StageMetrics) -> StageMetrics {
        StageMetrics {
            duration_secs: self.duration_secs + other.duration_secs,
            peak_memory_mb: self.peak_memory_mb.max(other.peak_memory_mb),
        }
    }
}

/// Result of a command that ran to completion.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Peak RSS of the process tree, if any sample landed.
    pub peak_memory_bytes: Option<u64>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stage metrics, with the 1 MiB floor applied to memory.
    pub fn metrics(&self) -> StageMetrics {
        let bytes = self
            .peak_memory_bytes
            .unwrap_or(MIN_REPORTED_BYTES)
            .max(MIN_REPORTED_BYTES);
        StageMetrics {
            duration_secs: self.duration.as_secs_f64(),
            peak_memory_mb: bytes as f64 / (1024.0 * 1024.0),
        }
    }

    /// Last lines of stderr (or stdout if stderr is empty), for error reports.
    pub fn error_tail(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.lines().collect();
        let start = lines.len().saturating_sub(ERROR_TAIL_LINES);
        lines[start..].join("\n")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that prevent a command from producing an exit code.
#[derive(Debug)]
pub enum ProcessError {
    /// The program could not be started (not found, not executable, ...).
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The command exceeded its timeout and was killed.
    Timeout { program: String, elapsed: Duration },
    /// I/O failure while setting up or waiting on the process.
    Io(std::io::Error),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { program, source } => write!(f, "Failed to start {program}: {source}"),
            Self::Timeout { program, elapsed } => {
                write!(f, "{program} timed out after {}s", elapsed.as_secs())
            }
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::Io(err) => Some(err),
            Self::Timeout { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

/// Runs commands and measures them.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    sample_interval: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL)
    }
}

impl ProcessRunner {
    pub fn new(sample_interval: Duration) -> Self {
        Self { sample_interval }
    }

    /// Run `spec` to completion.
    ///
    /// A non-zero exit is *not* an error here: it is reported through
    /// [`ProcessOutput::exit_code`] and the caller decides what it means.
    pub async fn run(&self, spec: &ProcessSpec) -> Result<ProcessOutput, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match &spec.stdout_path {
            Some(path) => {
                let file = std::fs::File::create(path).map_err(ProcessError::Io)?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(program = %spec.program, args = ?spec.args, "Spawning process");
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let monitor = child
            .id()
            .map(|pid| PeakMemoryMonitor::start(pid, self.sample_interval));

        // Read the pipes in their own tasks so `child.wait()` can borrow `child`.
        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();
        let stdout_task = tokio::spawn(async move { read_stream(stdout_handle).await });
        let stderr_task = tokio::spawn(async move { read_stream(stderr_handle).await });

        let wait_result = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await,
            None => Ok(child.wait().await),
        };

        let status = match wait_result {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                stop_monitor(monitor).await;
                return Err(ProcessError::Io(e));
            }
            Err(_elapsed) => {
                let elapsed = start.elapsed();
                let _ = child.kill().await;
                stop_monitor(monitor).await;
                stdout_task.abort();
                stderr_task.abort();
                tracing::warn!(
                    program = %spec.program,
                    elapsed_secs = elapsed.as_secs(),
                    "Process timed out and was killed"
                );
                return Err(ProcessError::Timeout {
                    program: spec.program.clone(),
                    elapsed,
                });
            }
        };

        let duration = start.elapsed();
        let peak_memory_bytes = stop_monitor(monitor).await;
        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();

        Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            duration,
            peak_memory_bytes,
        })
    }
}

async fn stop_monitor(monitor: Option<PeakMemoryMonitor>) -> Option<u64> {
    match monitor {
        Some(m) => m.stop().await,
        None => None,
    }
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let spec = ProcessSpec::shell("echo out; echo err >&2; exit 42");
        let output = runner().run(&spec).await.unwrap();
        assert_eq!(output.exit_code, 42);
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn env_overlay_reaches_child() {
        let spec = ProcessSpec::shell("printf %s \"$BORG_PASSPHRASE\"")
            .env("BORG_PASSPHRASE", "s3cret");
        let output = runner().run(&spec).await.unwrap();
        assert_eq!(output.stdout, "s3cret");
    }

    #[test]
    fn debug_hides_env_values() {
        let spec = ProcessSpec::new("borg").env("BORG_PASSPHRASE", "s3cret");
        let debug = format!("{spec:?}");
        assert!(debug.contains("BORG_PASSPHRASE"));
        assert!(!debug.contains("s3cret"));
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let spec = ProcessSpec::shell("sleep 60").timeout(Duration::from_millis(200));
        let start = Instant::now();
        let err = runner().run(&spec).await.unwrap_err();
        assert_matches!(err, ProcessError::Timeout { .. });
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let spec = ProcessSpec::new("/nonexistent/vaultkeep-tool");
        assert_matches!(
            runner().run(&spec).await,
            Err(ProcessError::Spawn { .. })
        );
    }

    #[tokio::test]
    async fn stdout_can_go_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.sql");
        let spec = ProcessSpec::shell("echo 'CREATE TABLE t;'").stdout_to(&path);
        let output = runner().run(&spec).await.unwrap();
        assert!(output.success());
        assert!(output.stdout.is_empty());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap().trim(),
            "CREATE TABLE t;"
        );
    }

    #[tokio::test]
    async fn metrics_never_report_below_floor() {
        let output = runner().run(&ProcessSpec::new("true")).await.unwrap();
        let metrics = output.metrics();
        assert!(metrics.peak_memory_mb >= 1.0);
        assert!(metrics.duration_secs >= 0.0);
    }

    #[test]
    fn metrics_floor_without_samples() {
        let output = ProcessOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(1500),
            peak_memory_bytes: None,
        };
        assert_eq!(
            output.metrics(),
            StageMetrics {
                duration_secs: 1.5,
                peak_memory_mb: 1.0
            }
        );
    }

    #[test]
    fn combine_adds_durations_and_keeps_max_peak() {
        let a = StageMetrics {
            duration_secs: 2.0,
            peak_memory_mb: 10.0,
        };
        let b = StageMetrics {
            duration_secs: 3.0,
            peak_memory_mb: 4.0,
        };
        assert_eq!(
            a.combine(b),
            StageMetrics {
                duration_secs: 5.0,
                peak_memory_mb: 10.0
            }
        );
    }

    #[test]
    fn error_tail_prefers_stderr() {
        let output = ProcessOutput {
            exit_code: 2,
            stdout: "progress".into(),
            stderr: (0..30).map(|i| format!("line {i}\n")).collect(),
            duration: Duration::ZERO,
            peak_memory_bytes: None,
        };
        let tail = output.error_tail();
        assert!(tail.starts_with("line 10"));
        assert!(tail.ends_with("line 29"));
    }

    #[test]
    fn process_error_display() {
        let err = ProcessError::Timeout {
            program: "pg_dump".into(),
            elapsed: Duration::from_secs(300),
        };
        assert_eq!(err.to_string(), "pg_dump timed out after 300s");
    }
}
