//! Off-site replication of a job's repository.
//!
//! [`RcloneSyncer`] configures an `s3` remote named `vaultkeep` entirely
//! through `RCLONE_CONFIG_VAULTKEEP_*` variables on the child process, so no
//! credentials are written to disk.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use vaultkeep_core::job::{SyncConfig, SyncProvider};
use vaultkeep_core::process::{ProcessError, ProcessRunner, ProcessSpec};
use vaultkeep_core::stage::SyncStats;

use crate::error::SyncError;

/// Name of the env-configured rclone remote.
const REMOTE_NAME: &str = "vaultkeep";

/// Env prefix rclone reads the remote's settings from.
const REMOTE_ENV_PREFIX: &str = "RCLONE_CONFIG_VAULTKEEP_";

const DEFAULT_AWS_REGION: &str = "us-east-1";
const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

/// Bound on a connection test.
pub const CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// `Transferred:   1.234 MiB / 1.234 MiB, 100%, ...`
static BYTES_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Transferred:\s+([0-9.]+)\s*([A-Za-z]+)\s*/\s*[0-9.]+\s*[A-Za-z]+")
        .expect("valid regex")
});

/// `Transferred:            3 / 3, 100%`
static FILES_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Transferred:\s+(\d+)\s*/\s*\d+\s*,").expect("valid regex"));

#[async_trait]
pub trait RepositorySyncer: Send + Sync {
    /// Replicate `repository` to the configured bucket.
    async fn sync_repository(
        &self,
        config: &SyncConfig,
        repository: &Path,
    ) -> Result<SyncStats, SyncError>;

    /// Check that the bucket is reachable with the configured keys.
    async fn test_connection(&self, config: &SyncConfig) -> (bool, String);
}

/// Syncs with `rclone sync`.
pub struct RcloneSyncer {
    runner: ProcessRunner,
    program: String,
}

impl RcloneSyncer {
    pub fn new(runner: ProcessRunner, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    /// A command with the remote's settings in its environment.
    fn command(&self, config: &SyncConfig) -> ProcessSpec {
        remote_env(config)
            .into_iter()
            .fold(ProcessSpec::new(&self.program), |spec, (key, value)| {
                spec.env(key, value)
            })
    }

    pub fn sync_spec(
        &self,
        config: &SyncConfig,
        repository: &Path,
    ) -> Result<ProcessSpec, SyncError> {
        let repo_name = repository
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::InvalidRepository(repository.to_path_buf()))?;
        let destination = remote_path(&config.bucket, repo_name)?;
        Ok(self
            .command(config)
            .arg("sync")
            .arg(repository.display().to_string())
            .arg(destination)
            .args([
                "--transfers",
                "4",
                "--checkers",
                "8",
                "--stats",
                "30s",
                "-v",
            ]))
    }
}

#[async_trait]
impl RepositorySyncer for RcloneSyncer {
    async fn sync_repository(
        &self,
        config: &SyncConfig,
        repository: &Path,
    ) -> Result<SyncStats, SyncError> {
        let spec = self.sync_spec(config, repository)?;
        tracing::info!(repository = %repository.display(), "Syncing repository off-site");

        let output = self.runner.run(&spec).await?;
        for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!(line, "rclone");
        }
        if !output.success() {
            return Err(SyncError::Failed {
                exit_code: output.exit_code,
                output: output.error_tail(),
            });
        }

        // rclone logs its stats to stderr; older builds used stdout.
        let stats = parse_stats(&output.stderr)
            .or_else(|| parse_stats(&output.stdout))
            .unwrap_or_default();
        let stats = SyncStats {
            elapsed: output.duration,
            ..stats
        };
        tracing::info!(
            bytes_transferred = stats.bytes_transferred,
            file_count = stats.file_count,
            elapsed_secs = stats.elapsed.as_secs(),
            "Off-site sync finished"
        );
        Ok(stats)
    }

    async fn test_connection(&self, config: &SyncConfig) -> (bool, String) {
        let target = match bucket_root(&config.bucket) {
            Ok(target) => target,
            Err(e) => return (false, e.to_string()),
        };
        let spec = self
            .command(config)
            .args(["lsd", "--max-depth", "1"])
            .arg(target)
            .timeout(CONNECTION_TEST_TIMEOUT);
        match self.runner.run(&spec).await {
            Ok(output) if output.success() => (true, "Object storage connection successful".into()),
            Ok(output) => (
                false,
                format!("Object storage connection failed: {}", output.error_tail()),
            ),
            Err(ProcessError::Timeout { .. }) => {
                (false, "Object storage connection test timed out".into())
            }
            Err(e) => (false, format!("Object storage connection test failed: {e}")),
        }
    }
}

/// Environment defining the `vaultkeep` remote.
pub fn remote_env(config: &SyncConfig) -> Vec<(String, String)> {
    let mut vars = vec![
        ("TYPE", "s3".to_string()),
        ("ENV_AUTH", "false".to_string()),
        ("ACCESS_KEY_ID", config.access_key_id.clone()),
        (
            "SECRET_ACCESS_KEY",
            config.secret_access_key.expose().to_string(),
        ),
    ];
    match config.provider {
        SyncProvider::Aws => {
            vars.push(("PROVIDER", "AWS".to_string()));
            vars.push((
                "REGION",
                config
                    .region
                    .clone()
                    .unwrap_or_else(|| DEFAULT_AWS_REGION.to_string()),
            ));
            vars.push((
                "STORAGE_CLASS",
                config
                    .storage_class
                    .clone()
                    .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
            ));
        }
        SyncProvider::Minio => {
            vars.push(("PROVIDER", "Minio".to_string()));
            if let Some(region) = &config.region {
                vars.push(("REGION", region.clone()));
            }
        }
    }
    if let Some(endpoint) = &config.endpoint {
        vars.push(("ENDPOINT", endpoint.clone()));
    }
    vars.into_iter()
        .map(|(key, value)| (format!("{REMOTE_ENV_PREFIX}{key}"), value))
        .collect()
}

/// Split a bucket setting (`name`, `name/path`, `s3://name/path`) into the
/// bucket and an optional prefix.
fn split_bucket(raw: &str) -> Result<(&str, Option<&str>), SyncError> {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix("s3://").unwrap_or(trimmed).trim_matches('/');
    let (bucket, prefix) = match stripped.split_once('/') {
        Some((bucket, prefix)) => (bucket, Some(prefix.trim_matches('/'))),
        None => (stripped, None),
    };
    if bucket.is_empty() {
        return Err(SyncError::InvalidBucket(raw.to_string()));
    }
    Ok((bucket, prefix.filter(|p| !p.is_empty())))
}

/// `vaultkeep:{bucket}[/{prefix}]/{repo_name}`.
pub fn remote_path(bucket: &str, repo_name: &str) -> Result<String, SyncError> {
    let (bucket, prefix) = split_bucket(bucket)?;
    Ok(match prefix {
        Some(prefix) => format!("{REMOTE_NAME}:{bucket}/{prefix}/{repo_name}"),
        None => format!("{REMOTE_NAME}:{bucket}/{repo_name}"),
    })
}

fn bucket_root(bucket: &str) -> Result<String, SyncError> {
    let (bucket, _) = split_bucket(bucket)?;
    Ok(format!("{REMOTE_NAME}:{bucket}"))
}

/// Final byte and file counts from rclone's stats block. The last block
/// wins. Returns `None` when no stats line is present.
pub fn parse_stats(output: &str) -> Option<SyncStats> {
    let bytes = BYTES_LINE
        .captures_iter(output)
        .last()
        .and_then(|c| to_bytes(&c[1], &c[2]));
    let files = FILES_LINE
        .captures_iter(output)
        .last()
        .and_then(|c| c[1].parse::<u64>().ok());
    if bytes.is_none() && files.is_none() {
        return None;
    }
    Some(SyncStats {
        bytes_transferred: bytes.unwrap_or(0),
        file_count: files.unwrap_or(0),
        elapsed: Duration::ZERO,
    })
}

/// Convert `1.5` + `MiB` (or `MBytes`, `k`, `B`, ...) into bytes.
fn to_bytes(value: &str, unit: &str) -> Option<u64> {
    let value: f64 = value.parse().ok()?;
    let exponent = match unit.chars().next()?.to_ascii_uppercase() {
        'B' => 0,
        'K' => 1,
        'M' => 2,
        'G' => 3,
        'T' => 4,
        'P' => 5,
        _ => return None,
    };
    Some((value * 1024f64.powi(exponent)).round() as u64)
}
