//! Runtime settings shared by every pipeline run.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use vaultkeep_core::secret::Secret;

/// Default bound on pre/post commands.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(300);

/// What a failed off-site sync does to the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncFailurePolicy {
    /// The run is marked failed even though the local backup succeeded.
    #[default]
    Fatal,
    /// The failure is logged and the run completes.
    BestEffort,
}

impl SyncFailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::BestEffort => "best_effort",
        }
    }
}

impl FromStr for SyncFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatal" => Ok(Self::Fatal),
            "best_effort" | "best-effort" | "besteffort" => Ok(Self::BestEffort),
            other => Err(format!(
                "Unknown sync failure policy '{other}', expected 'fatal' or 'best_effort'"
            )),
        }
    }
}

/// Executables for the external tools. Defaults resolve through `PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub borg: String,
    pub rclone: String,
    pub pg_dump: String,
    pub psql: String,
    pub mysqldump: String,
    pub mysql: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            borg: "borg".into(),
            rclone: "rclone".into(),
            pg_dump: "pg_dump".into(),
            psql: "psql".into(),
            mysqldump: "mysqldump".into(),
            mysql: "mysql".into(),
        }
    }
}

/// Settings the executor applies to every job.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Each job's repository is `{repository_root}/{job name}`.
    pub repository_root: PathBuf,
    pub hook_timeout: Duration,
    /// Used when a job has no passphrase of its own.
    pub fallback_passphrase: Option<Secret>,
    pub sync_failure_policy: SyncFailurePolicy,
}

impl PipelineSettings {
    pub fn new(repository_root: impl Into<PathBuf>) -> Self {
        Self {
            repository_root: repository_root.into(),
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            fallback_passphrase: None,
            sync_failure_policy: SyncFailurePolicy::default(),
        }
    }

    pub fn repository_path(&self, job_name: &str) -> PathBuf {
        self.repository_root.join(job_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses_both_spellings() {
        assert_eq!("fatal".parse(), Ok(SyncFailurePolicy::Fatal));
        assert_eq!("Best-Effort".parse(), Ok(SyncFailurePolicy::BestEffort));
        assert_eq!("best_effort".parse(), Ok(SyncFailurePolicy::BestEffort));
        assert!("sometimes".parse::<SyncFailurePolicy>().is_err());
    }

    #[test]
    fn repository_path_is_namespaced_by_job() {
        let settings = PipelineSettings::new("/borgspace");
        assert_eq!(
            settings.repository_path("nightly"),
            PathBuf::from("/borgspace/nightly")
        );
        assert_eq!(settings.sync_failure_policy, SyncFailurePolicy::Fatal);
    }
}
