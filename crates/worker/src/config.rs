//! Worker configuration from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use vaultkeep_core::process::memory::DEFAULT_SAMPLE_INTERVAL;
use vaultkeep_core::schedule::{
    grace_covers_interval, DEFAULT_ERROR_BACKOFF_SECS, DEFAULT_GRACE_WINDOW_SECS,
    DEFAULT_POLL_INTERVAL_SECS,
};
use vaultkeep_core::secret::Secret;
use vaultkeep_pipeline::settings::DEFAULT_HOOK_TIMEOUT;
use vaultkeep_pipeline::{PipelineSettings, SyncFailurePolicy, ToolPaths};

use crate::scheduler::SchedulerSettings;

const DEFAULT_CONFIG_DIR: &str = "/config";
const DEFAULT_REPOSITORY_ROOT: &str = "/borgspace";
const DEFAULT_DUMP_DIR: &str = "/tmp/db_dumps";
const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 600;

/// File under the config dir holding the key-derivation salt.
const SALT_FILE: &str = "secret.salt";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Everything the worker binary reads at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub config_dir: PathBuf,
    pub repository_root: PathBuf,
    pub dump_dir: PathBuf,
    /// Master secret for job secrets at rest.
    pub secret_key: Secret,
    /// Repository passphrase for jobs without their own.
    pub fallback_passphrase: Option<Secret>,
    pub poll_interval: Duration,
    pub grace_window: Duration,
    pub error_backoff: Duration,
    pub max_concurrent_jobs: usize,
    pub shutdown_timeout: Duration,
    pub hook_timeout: Duration,
    pub memory_sample_interval: Duration,
    pub sync_failure_policy: SyncFailurePolicy,
    pub tools: ToolPaths,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Variable                    | Default                                 |
    /// |-----------------------------|-----------------------------------------|
    /// | `VAULTKEEP_SECRET_KEY`      | required                                |
    /// | `VAULTKEEP_CONFIG_DIR`      | `/config`                               |
    /// | `DATABASE_URL`              | `sqlite://{config dir}/vaultkeep.db`    |
    /// | `VAULTKEEP_REPOSITORY_ROOT` | `/borgspace`                            |
    /// | `VAULTKEEP_DUMP_DIR`        | `/tmp/db_dumps`                         |
    /// | `BORG_PASSPHRASE`           | unset                                   |
    /// | `POLL_INTERVAL_SECS`        | `30`                                    |
    /// | `GRACE_WINDOW_SECS`         | `61`                                    |
    /// | `ERROR_BACKOFF_SECS`        | `60`                                    |
    /// | `MAX_CONCURRENT_JOBS`       | `4`                                     |
    /// | `SHUTDOWN_TIMEOUT_SECS`     | `600`                                   |
    /// | `HOOK_TIMEOUT_SECS`         | `300`                                   |
    /// | `MEMORY_SAMPLE_INTERVAL_MS` | `1000`                                  |
    /// | `SYNC_FAILURE_POLICY`       | `fatal`                                 |
    /// | `*_BIN`                     | tool name on `PATH`                     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str, default: u64| {
            Duration::from_secs(get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default))
        };

        let secret_key = get("VAULTKEEP_SECRET_KEY")
            .map(Secret::from)
            .ok_or(ConfigError::Missing("VAULTKEEP_SECRET_KEY"))?;

        let config_dir = PathBuf::from(
            get("VAULTKEEP_CONFIG_DIR").unwrap_or_else(|| DEFAULT_CONFIG_DIR.to_string()),
        );
        let database_url = get("DATABASE_URL").unwrap_or_else(|| {
            format!("sqlite://{}", config_dir.join("vaultkeep.db").display())
        });

        let poll_interval = secs("POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS);
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "POLL_INTERVAL_SECS",
                message: "must be greater than zero".into(),
            });
        }
        let grace_window = secs("GRACE_WINDOW_SECS", DEFAULT_GRACE_WINDOW_SECS);
        if !grace_covers_interval(grace_window, poll_interval) {
            return Err(ConfigError::Invalid {
                var: "GRACE_WINDOW_SECS",
                message: format!(
                    "{}s is shorter than the {}s poll interval",
                    grace_window.as_secs(),
                    poll_interval.as_secs()
                ),
            });
        }

        let max_concurrent_jobs = get("MAX_CONCURRENT_JOBS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS);
        if max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_CONCURRENT_JOBS",
                message: "must be at least 1".into(),
            });
        }

        let sync_failure_policy = match get("SYNC_FAILURE_POLICY") {
            Some(value) => value
                .parse::<SyncFailurePolicy>()
                .map_err(|message| ConfigError::Invalid {
                    var: "SYNC_FAILURE_POLICY",
                    message,
                })?,
            None => SyncFailurePolicy::default(),
        };

        let memory_sample_interval = get("MEMORY_SAMPLE_INTERVAL_MS")
            .and_then(|v| v.trim().parse().ok())
            .filter(|ms: &u64| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SAMPLE_INTERVAL);

        let defaults = ToolPaths::default();
        let tools = ToolPaths {
            borg: get("BORG_BIN").unwrap_or(defaults.borg),
            rclone: get("RCLONE_BIN").unwrap_or(defaults.rclone),
            pg_dump: get("PG_DUMP_BIN").unwrap_or(defaults.pg_dump),
            psql: get("PSQL_BIN").unwrap_or(defaults.psql),
            mysqldump: get("MYSQLDUMP_BIN").unwrap_or(defaults.mysqldump),
            mysql: get("MYSQL_BIN").unwrap_or(defaults.mysql),
        };

        Ok(Self {
            database_url,
            repository_root: get("VAULTKEEP_REPOSITORY_ROOT")
                .unwrap_or_else(|| DEFAULT_REPOSITORY_ROOT.to_string())
                .into(),
            dump_dir: get("VAULTKEEP_DUMP_DIR")
                .unwrap_or_else(|| DEFAULT_DUMP_DIR.to_string())
                .into(),
            config_dir,
            secret_key,
            fallback_passphrase: get("BORG_PASSPHRASE").map(Secret::from),
            poll_interval,
            grace_window,
            error_backoff: secs("ERROR_BACKOFF_SECS", DEFAULT_ERROR_BACKOFF_SECS),
            max_concurrent_jobs,
            shutdown_timeout: secs("SHUTDOWN_TIMEOUT_SECS", DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            hook_timeout: secs("HOOK_TIMEOUT_SECS", DEFAULT_HOOK_TIMEOUT.as_secs()),
            memory_sample_interval,
            sync_failure_policy,
            tools,
        })
    }

    pub fn salt_path(&self) -> PathBuf {
        self.config_dir.join(SALT_FILE)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            repository_root: self.repository_root.clone(),
            hook_timeout: self.hook_timeout,
            fallback_passphrase: self.fallback_passphrase.clone(),
            sync_failure_policy: self.sync_failure_policy,
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: self.poll_interval,
            grace_window: self.grace_window,
            error_backoff: self.error_backoff,
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }
}
