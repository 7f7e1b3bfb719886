//! Error types for the pipeline and its collaborators.

use std::path::PathBuf;
use std::time::Duration;

use vaultkeep_core::error::CoreError;
use vaultkeep_core::process::ProcessError;
use vaultkeep_core::stage::Stage;

/// Why a run failed. The `Display` text is what lands in the run record and
/// the failure notification, so it never carries secrets.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Pre-flight check failed; no run record was created.
    #[error("Invalid job configuration: {0}")]
    Validation(String),

    /// A fatal stage exited unsuccessfully or could not be started.
    #[error("{stage} failed: {message}")]
    Process { stage: Stage, message: String },

    #[error("{stage} timed out after {}s", .elapsed.as_secs())]
    Timeout { stage: Stage, elapsed: Duration },

    #[error("Database dump failed: {0}")]
    Dump(#[from] DumpError),

    #[error("Off-site sync failed: {0}")]
    Sync(#[from] SyncError),

    #[error("Run history unavailable: {0}")]
    Store(#[from] sqlx::Error),
}

impl PipelineError {
    /// Map a runner error for `stage`, keeping timeouts distinct.
    pub fn from_process(stage: Stage, err: ProcessError) -> Self {
        match err {
            ProcessError::Timeout { elapsed, .. } => Self::Timeout { stage, elapsed },
            other => Self::Process {
                stage,
                message: other.to_string(),
            },
        }
    }

    /// A non-zero exit of a fatal stage.
    pub fn exit(stage: Stage, exit_code: i32, output_tail: &str) -> Self {
        let message = if output_tail.trim().is_empty() {
            format!("exited with status {exit_code}")
        } else {
            format!("exited with status {exit_code}: {}", output_tail.trim())
        };
        Self::Process { stage, message }
    }
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::Validation(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}

/// Database dump failures. Partial output is removed before these surface.
#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("Dump directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{target} timed out after {}s", .limit.as_secs())]
    Timeout { target: String, limit: Duration },

    #[error("{target} exited with status {exit_code}: {output}")]
    Failed {
        target: String,
        exit_code: i32,
        output: String,
    },

    #[error("{target}: {source}")]
    Process {
        target: String,
        #[source]
        source: ProcessError,
    },
}

/// Off-site sync failures.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("rclone exited with status {exit_code}: {output}")]
    Failed { exit_code: i32, output: String },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Repository path has no directory name: {}", .0.display())]
    InvalidRepository(PathBuf),

    #[error("Invalid bucket '{0}'")]
    InvalidBucket(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_timeout_maps_to_timeout() {
        let err = PipelineError::from_process(
            Stage::Create,
            ProcessError::Timeout {
                program: "borg".into(),
                elapsed: Duration::from_secs(12),
            },
        );
        assert_eq!(err.to_string(), "create timed out after 12s");
    }

    #[test]
    fn exit_message_includes_tail() {
        let err = PipelineError::exit(Stage::Prune, 2, "Repository does not exist.\n");
        assert_eq!(
            err.to_string(),
            "prune failed: exited with status 2: Repository does not exist."
        );
        let err = PipelineError::exit(Stage::Compact, 2, "  ");
        assert_eq!(err.to_string(), "compact failed: exited with status 2");
    }

    #[test]
    fn validation_error_from_core() {
        let err: PipelineError = CoreError::Validation("Job name must not be empty".into()).into();
        assert_eq!(
            err.to_string(),
            "Invalid job configuration: Job name must not be empty"
        );
    }
}
