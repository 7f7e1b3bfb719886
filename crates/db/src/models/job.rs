//! Backup job rows and DTOs.
//!
//! Sub-configs and the repository passphrase are stored sealed. A
//! [`JobRow`] never leaves this crate's callers in serialized form; use
//! [`JobRow::open`] to get a runnable [`BackupJob`].

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use vaultkeep_core::error::CoreError;
use vaultkeep_core::job::{
    retention_from_counts, validate_database_config, validate_job_name, validate_schedule,
    validate_source_paths, validate_sync_config, BackupJob, Compression, DatabaseDumpConfig,
    SyncConfig,
};
use vaultkeep_core::retention::{DEFAULT_KEEP_DAILY, DEFAULT_KEEP_MONTHLY, DEFAULT_KEEP_YEARLY};
use vaultkeep_core::secret::{Secret, SecretBox, SecretError};
use vaultkeep_core::types::{DbId, Timestamp};

/// Errors turning rows into jobs and DTOs into sealed columns.
#[derive(Debug, thiserror::Error)]
pub enum JobCodecError {
    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("Stored sub-config is malformed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] CoreError),
}

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: DbId,
    pub name: String,
    pub schedule: String,
    pub compression: String,
    pub source_paths: Json<Vec<String>>,
    pub exclude_patterns: Json<Vec<String>>,
    pub keep_daily: i64,
    pub keep_monthly: i64,
    pub keep_yearly: i64,
    pub pre_command: Option<String>,
    pub post_command: Option<String>,
    pub database_config: Option<Vec<u8>>,
    pub sync_config: Option<Vec<u8>>,
    pub passphrase: Option<Vec<u8>>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl JobRow {
    /// Unseal secrets and parse sub-configs.
    pub fn open(&self, secrets: &SecretBox) -> Result<BackupJob, JobCodecError> {
        let database = self
            .database_config
            .as_deref()
            .map(|sealed| -> Result<DatabaseDumpConfig, JobCodecError> {
                Ok(serde_json::from_slice(&secrets.open(sealed)?)?)
            })
            .transpose()?;
        let sync = self
            .sync_config
            .as_deref()
            .map(|sealed| -> Result<SyncConfig, JobCodecError> {
                Ok(serde_json::from_slice(&secrets.open(sealed)?)?)
            })
            .transpose()?;
        let passphrase = self
            .passphrase
            .as_deref()
            .map(|sealed| secrets.open_secret(sealed))
            .transpose()?;

        Ok(BackupJob {
            id: self.id,
            name: self.name.clone(),
            schedule: self.schedule.clone(),
            compression: Compression::from_str(&self.compression)?,
            source_paths: self.source_paths.0.clone(),
            exclude_patterns: self.exclude_patterns.0.clone(),
            retention: retention_from_counts(self.keep_daily, self.keep_monthly, self.keep_yearly)?,
            pre_command: self.pre_command.clone(),
            post_command: self.post_command.clone(),
            database,
            sync,
            passphrase,
        })
    }
}

/// The columns the scheduler needs for its due-check.
#[derive(Debug, Clone, FromRow)]
pub struct JobSchedule {
    pub id: DbId,
    pub name: String,
    pub schedule: String,
}

/// DTO for creating a job, and for replacing one on update.
///
/// On update a `None` passphrase keeps the stored one.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBackupJob {
    pub name: String,
    pub schedule: String,
    #[serde(default)]
    pub compression: Compression,
    pub source_paths: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_keep_daily")]
    pub keep_daily: i64,
    #[serde(default = "default_keep_monthly")]
    pub keep_monthly: i64,
    #[serde(default = "default_keep_yearly")]
    pub keep_yearly: i64,
    pub pre_command: Option<String>,
    pub post_command: Option<String>,
    pub database: Option<DatabaseDumpConfig>,
    pub sync: Option<SyncConfig>,
    pub passphrase: Option<Secret>,
}

fn default_keep_daily() -> i64 {
    DEFAULT_KEEP_DAILY.into()
}

fn default_keep_monthly() -> i64 {
    DEFAULT_KEEP_MONTHLY.into()
}

fn default_keep_yearly() -> i64 {
    DEFAULT_KEEP_YEARLY.into()
}

impl CreateBackupJob {
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_job_name(&self.name)?;
        validate_schedule(&self.schedule)?;
        validate_source_paths(&self.source_paths)?;
        retention_from_counts(self.keep_daily, self.keep_monthly, self.keep_yearly)?;
        if let Some(db) = &self.database {
            validate_database_config(db)?;
        }
        if let Some(sync) = &self.sync {
            validate_sync_config(sync)?;
        }
        Ok(())
    }

    /// Seal the secret-bearing fields for storage.
    pub fn seal(&self, secrets: &SecretBox) -> Result<SealedJobFields, JobCodecError> {
        let database_config = self
            .database
            .as_ref()
            .map(|db| -> Result<Vec<u8>, JobCodecError> {
                Ok(secrets.seal(&serde_json::to_vec(db)?)?)
            })
            .transpose()?;
        let sync_config = self
            .sync
            .as_ref()
            .map(|sync| -> Result<Vec<u8>, JobCodecError> {
                Ok(secrets.seal(&serde_json::to_vec(sync)?)?)
            })
            .transpose()?;
        let passphrase = self
            .passphrase
            .as_ref()
            .filter(|p| !p.is_blank())
            .map(|p| secrets.seal_secret(p))
            .transpose()?;

        Ok(SealedJobFields {
            database_config,
            sync_config,
            passphrase,
        })
    }
}

/// Sealed column values produced by [`CreateBackupJob::seal`].
#[derive(Debug, Clone, Default)]
pub struct SealedJobFields {
    pub database_config: Option<Vec<u8>>,
    pub sync_config: Option<Vec<u8>>,
    pub passphrase: Option<Vec<u8>>,
}

/// Job listing entry without any sealed material.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: DbId,
    pub name: String,
    pub schedule: String,
    pub compression: String,
    pub has_database: bool,
    pub has_sync: bool,
    pub has_passphrase: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl From<&JobRow> for JobSummary {
    fn from(row: &JobRow) -> Self {
        Self {
            id: row.id,
            name: row.name.clone(),
            schedule: row.schedule.clone(),
            compression: row.compression.clone(),
            has_database: row.database_config.is_some(),
            has_sync: row.sync_config.is_some(),
            has_passphrase: row.passphrase.is_some(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
