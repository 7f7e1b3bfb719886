//! The archiving-tool contract and its borg implementation.
//!
//! Every operation returns the raw [`ProcessOutput`] so the executor can
//! record metrics for a stage whether or not it succeeded, and decide
//! from the exit code what the stage outcome is.

use std::path::Path;

use async_trait::async_trait;
use vaultkeep_core::job::Compression;
use vaultkeep_core::process::{ProcessError, ProcessOutput, ProcessRunner, ProcessSpec};
use vaultkeep_core::retention::RetentionPolicy;
use vaultkeep_core::secret::Secret;

/// Borg reports warnings (e.g. a file changed while it was read) with exit 1.
const BORG_WARNING_EXIT: i32 = 1;

/// One `create` invocation.
#[derive(Debug, Clone)]
pub struct CreateArchive<'a> {
    pub repository: &'a Path,
    pub archive: &'a str,
    pub sources: Vec<String>,
    pub excludes: &'a [String],
    pub compression: Compression,
}

#[async_trait]
pub trait Archiver: Send + Sync {
    /// Whether an initialized repository lives at `repository`.
    async fn repository_exists(&self, repository: &Path) -> bool;

    async fn init(
        &self,
        repository: &Path,
        passphrase: &Secret,
    ) -> Result<ProcessOutput, ProcessError>;

    async fn create(
        &self,
        request: &CreateArchive<'_>,
        passphrase: &Secret,
    ) -> Result<ProcessOutput, ProcessError>;

    /// Prune archives matching `glob` down to `retention`.
    async fn prune(
        &self,
        repository: &Path,
        glob: &str,
        retention: &RetentionPolicy,
        passphrase: &Secret,
    ) -> Result<ProcessOutput, ProcessError>;

    async fn compact(
        &self,
        repository: &Path,
        passphrase: &Secret,
    ) -> Result<ProcessOutput, ProcessError>;

    /// Whether `exit_code` counts as success for this tool.
    fn accepts_exit(&self, exit_code: i32) -> bool {
        exit_code == 0
    }
}

/// Runs `borg` with the passphrase passed through `BORG_PASSPHRASE`.
pub struct BorgArchiver {
    runner: ProcessRunner,
    program: String,
}

impl BorgArchiver {
    pub fn new(runner: ProcessRunner, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    fn command(&self, passphrase: &Secret) -> ProcessSpec {
        ProcessSpec::new(&self.program)
            .env("BORG_PASSPHRASE", passphrase.expose())
            // Never prompt when the repository root was remounted elsewhere.
            .env("BORG_RELOCATED_REPO_ACCESS_IS_OK", "yes")
    }

    pub fn init_spec(&self, repository: &Path, passphrase: &Secret) -> ProcessSpec {
        self.command(passphrase)
            .args(["init", "--encryption=repokey"])
            .arg(repository.display().to_string())
    }

    pub fn create_spec(&self, request: &CreateArchive<'_>, passphrase: &Secret) -> ProcessSpec {
        let mut spec = self.command(passphrase).args([
            "create",
            "--stats",
            "--compression",
            request.compression.as_str(),
        ]);
        for pattern in request.excludes {
            let pattern = pattern.trim();
            if !pattern.is_empty() {
                spec = spec.arg("--exclude").arg(pattern);
            }
        }
        spec.arg(format!(
            "{}::{}",
            request.repository.display(),
            request.archive
        ))
        .args(request.sources.iter().cloned())
    }

    pub fn prune_spec(
        &self,
        repository: &Path,
        glob: &str,
        retention: &RetentionPolicy,
        passphrase: &Secret,
    ) -> ProcessSpec {
        self.command(passphrase)
            .args(["prune", "--list", "--glob-archives", glob])
            .arg(format!("--keep-daily={}", retention.keep_daily))
            .arg(format!("--keep-monthly={}", retention.keep_monthly))
            .arg(format!("--keep-yearly={}", retention.keep_yearly))
            .arg(repository.display().to_string())
    }

    pub fn compact_spec(&self, repository: &Path, passphrase: &Secret) -> ProcessSpec {
        self.command(passphrase)
            .arg("compact")
            .arg(repository.display().to_string())
    }
}

#[async_trait]
impl Archiver for BorgArchiver {
    async fn repository_exists(&self, repository: &Path) -> bool {
        tokio::fs::metadata(repository.join("config"))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn init(
        &self,
        repository: &Path,
        passphrase: &Secret,
    ) -> Result<ProcessOutput, ProcessError> {
        tokio::fs::create_dir_all(repository)
            .await
            .map_err(ProcessError::Io)?;
        tracing::info!(repository = %repository.display(), "Initializing repository");
        self.runner.run(&self.init_spec(repository, passphrase)).await
    }

    async fn create(
        &self,
        request: &CreateArchive<'_>,
        passphrase: &Secret,
    ) -> Result<ProcessOutput, ProcessError> {
        self.runner
            .run(&self.create_spec(request, passphrase))
            .await
    }

    async fn prune(
        &self,
        repository: &Path,
        glob: &str,
        retention: &RetentionPolicy,
        passphrase: &Secret,
    ) -> Result<ProcessOutput, ProcessError> {
        self.runner
            .run(&self.prune_spec(repository, glob, retention, passphrase))
            .await
    }

    async fn compact(
        &self,
        repository: &Path,
        passphrase: &Secret,
    ) -> Result<ProcessOutput, ProcessError> {
        self.runner
            .run(&self.compact_spec(repository, passphrase))
            .await
    }

    fn accepts_exit(&self, exit_code: i32) -> bool {
        (0..=BORG_WARNING_EXIT).contains(&exit_code)
    }
}
