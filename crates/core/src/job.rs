//! Backup job definitions, enums, and validation.
//!
//! A [`BackupJob`] is the fully opened form of a job row: secrets have been
//! unsealed and the sub-configs parsed. Validation is split into free
//! functions so the store can reject bad input on write and the pipeline can
//! re-check before every run.

use serde::{Deserialize, Serialize};

use crate::cron::CronExpr;
use crate::error::CoreError;
use crate::retention::RetentionPolicy;
use crate::secret::{expose_for_sealing, Secret};
use crate::types::DbId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of a job name.
pub const MAX_JOB_NAME_LEN: usize = 128;

/// Default PostgreSQL port.
pub const DEFAULT_POSTGRES_PORT: u16 = 5432;

/// Default MariaDB/MySQL port.
pub const DEFAULT_MARIADB_PORT: u16 = 3306;

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// Compression mode handed to the archiving tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Zstd,
    Zlib,
    Lzma,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::Zlib => "zlib",
            Self::Lzma => "lzma",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            "zlib" => Ok(Self::Zlib),
            "lzma" => Ok(Self::Lzma),
            _ => Err(CoreError::Validation(format!(
                "Invalid compression: '{s}'. Must be one of: none, lz4, zstd, zlib, lzma"
            ))),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Database sub-config
// ---------------------------------------------------------------------------

/// Database server flavour for dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    Postgresql,
    Mariadb,
}

impl DatabaseEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgresql => "postgresql",
            Self::Mariadb => "mariadb",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgresql => DEFAULT_POSTGRES_PORT,
            Self::Mariadb => DEFAULT_MARIADB_PORT,
        }
    }
}

/// Connection details for the optional database dump stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDumpConfig {
    pub engine: DatabaseEngine,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(
        default,
        serialize_with = "serialize_optional_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<Secret>,
    pub database: String,
    /// Dump only these tables. Empty means the whole database.
    #[serde(default)]
    pub tables: Vec<String>,
}

impl DatabaseDumpConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.engine.default_port())
    }
}

// ---------------------------------------------------------------------------
// Sync sub-config
// ---------------------------------------------------------------------------

/// Object storage flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncProvider {
    #[default]
    Aws,
    Minio,
}

/// Off-site replication target for the optional sync stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub provider: SyncProvider,
    /// Bucket name, optionally with an `s3://` prefix and a path.
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint (required for MinIO).
    #[serde(default)]
    pub endpoint: Option<String>,
    pub access_key_id: String,
    #[serde(serialize_with = "expose_for_sealing")]
    pub secret_access_key: Secret,
    #[serde(default)]
    pub storage_class: Option<String>,
}

fn serialize_optional_secret<S: serde::Serializer>(
    secret: &Option<Secret>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(secret) => expose_for_sealing(secret, serializer),
        None => serializer.serialize_none(),
    }
}

// ---------------------------------------------------------------------------
// BackupJob
// ---------------------------------------------------------------------------

/// An opened job definition, ready to run.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub id: DbId,
    pub name: String,
    pub schedule: String,
    pub compression: Compression,
    pub source_paths: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub retention: RetentionPolicy,
    pub pre_command: Option<String>,
    pub post_command: Option<String>,
    pub database: Option<DatabaseDumpConfig>,
    pub sync: Option<SyncConfig>,
    pub passphrase: Option<Secret>,
}

impl BackupJob {
    /// Pre-flight checks run before any stage or run record.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_job_name(&self.name)?;
        validate_schedule(&self.schedule)?;
        validate_source_paths(&self.source_paths)?;
        if let Some(db) = &self.database {
            validate_database_config(db)?;
        }
        if let Some(sync) = &self.sync {
            validate_sync_config(sync)?;
        }
        Ok(())
    }

    /// The job's own passphrase, or `fallback` if the job has none.
    pub fn resolve_passphrase(&self, fallback: Option<&Secret>) -> Result<Secret, CoreError> {
        self.passphrase
            .as_ref()
            .filter(|p| !p.is_blank())
            .or(fallback.filter(|p| !p.is_blank()))
            .cloned()
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "No repository passphrase for job '{}' and no fallback configured",
                    self.name
                ))
            })
    }

    /// Source paths with blank entries dropped.
    pub fn effective_sources(&self) -> Vec<&str> {
        self.source_paths
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Job names become archive prefixes and directory names.
pub fn validate_job_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation("Job name must not be empty".into()));
    }
    if name.len() > MAX_JOB_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Job name exceeds {MAX_JOB_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CoreError::Validation(format!(
            "Job name '{name}' may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

pub fn validate_schedule(schedule: &str) -> Result<CronExpr, CoreError> {
    CronExpr::parse(schedule)
        .map_err(|e| CoreError::Validation(format!("Invalid schedule '{schedule}': {e}")))
}

pub fn validate_source_paths(paths: &[String]) -> Result<(), CoreError> {
    if paths.iter().all(|p| p.trim().is_empty()) {
        return Err(CoreError::Validation(
            "At least one source directory is required".into(),
        ));
    }
    Ok(())
}

/// Convert stored counts into a policy, rejecting negatives.
pub fn retention_from_counts(
    keep_daily: i64,
    keep_monthly: i64,
    keep_yearly: i64,
) -> Result<RetentionPolicy, CoreError> {
    let convert = |label: &str, value: i64| {
        u32::try_from(value).map_err(|_| {
            CoreError::Validation(format!("{label} must be a non-negative count, got {value}"))
        })
    };
    Ok(RetentionPolicy {
        keep_daily: convert("keep_daily", keep_daily)?,
        keep_monthly: convert("keep_monthly", keep_monthly)?,
        keep_yearly: convert("keep_yearly", keep_yearly)?,
    })
}

pub fn validate_database_config(config: &DatabaseDumpConfig) -> Result<(), CoreError> {
    for (label, value) in [
        ("host", &config.host),
        ("database", &config.database),
        ("username", &config.username),
    ] {
        if value.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "Database config is missing '{label}'"
            )));
        }
    }
    if config.tables.iter().any(|t| t.trim().is_empty()) {
        return Err(CoreError::Validation(
            "Database config lists an empty table name".into(),
        ));
    }
    Ok(())
}

pub fn validate_sync_config(config: &SyncConfig) -> Result<(), CoreError> {
    if config
        .bucket
        .trim()
        .trim_start_matches("s3://")
        .trim_matches('/')
        .is_empty()
    {
        return Err(CoreError::Validation("Sync config is missing 'bucket'".into()));
    }
    if config.access_key_id.trim().is_empty() || config.secret_access_key.is_blank() {
        return Err(CoreError::Validation(
            "Sync config requires both access keys".into(),
        ));
    }
    if config.provider == SyncProvider::Minio && config.endpoint.is_none() {
        return Err(CoreError::Validation(
            "MinIO sync requires an endpoint".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn job() -> BackupJob {
        BackupJob {
            id: 1,
            name: "nightly".into(),
            schedule: "0 2 * * *".into(),
            compression: Compression::Lz4,
            source_paths: vec!["/srv/data".into()],
            exclude_patterns: vec![],
            retention: RetentionPolicy::default(),
            pre_command: None,
            post_command: None,
            database: None,
            sync: None,
            passphrase: Some(Secret::new("pw")),
        }
    }

    // -- Compression ----------------------------------------------------------

    #[test]
    fn compression_round_trips_through_str() {
        for c in ["none", "lz4", "zstd", "zlib", "lzma"] {
            assert_eq!(Compression::from_str(c).unwrap().as_str(), c);
        }
        assert!(Compression::from_str("gzip").is_err());
    }

    // -- Names and paths ------------------------------------------------------

    #[test]
    fn job_name_rules() {
        assert!(validate_job_name("nightly-db_01").is_ok());
        assert!(validate_job_name("").is_err());
        assert!(validate_job_name("has space").is_err());
        assert!(validate_job_name("../escape").is_err());
        assert!(validate_job_name(&"a".repeat(MAX_JOB_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn blank_sources_rejected() {
        assert!(validate_source_paths(&[]).is_err());
        assert!(validate_source_paths(&["  ".into()]).is_err());
        assert!(validate_source_paths(&["".into(), "/etc".into()]).is_ok());
    }

    #[test]
    fn effective_sources_skip_blanks() {
        let mut j = job();
        j.source_paths = vec![" ".into(), "/a".into(), " /b ".into()];
        assert_eq!(j.effective_sources(), vec!["/a", "/b"]);
    }

    // -- Retention ------------------------------------------------------------

    #[test]
    fn negative_retention_rejected() {
        assert_matches!(
            retention_from_counts(7, -1, 1),
            Err(CoreError::Validation(msg)) if msg.contains("keep_monthly")
        );
        assert_eq!(
            retention_from_counts(0, 0, 0).unwrap(),
            RetentionPolicy {
                keep_daily: 0,
                keep_monthly: 0,
                keep_yearly: 0
            }
        );
    }

    // -- Passphrase -----------------------------------------------------------

    #[test]
    fn passphrase_prefers_job_value() {
        let fallback = Secret::new("env");
        assert_eq!(
            job().resolve_passphrase(Some(&fallback)).unwrap().expose(),
            "pw"
        );
    }

    #[test]
    fn passphrase_falls_back() {
        let mut j = job();
        j.passphrase = Some(Secret::new("   "));
        let fallback = Secret::new("env");
        assert_eq!(j.resolve_passphrase(Some(&fallback)).unwrap().expose(), "env");
    }

    #[test]
    fn missing_passphrase_is_validation_error() {
        let mut j = job();
        j.passphrase = None;
        assert_matches!(j.resolve_passphrase(None), Err(CoreError::Validation(_)));
    }

    // -- Sub-configs ----------------------------------------------------------

    #[test]
    fn database_config_requires_connection_fields() {
        let mut db = DatabaseDumpConfig {
            engine: DatabaseEngine::Postgresql,
            host: "db".into(),
            port: None,
            username: "backup".into(),
            password: None,
            database: "app".into(),
            tables: vec![],
        };
        assert!(validate_database_config(&db).is_ok());
        assert_eq!(db.port(), 5432);
        db.database = "".into();
        assert!(validate_database_config(&db).is_err());
    }

    #[test]
    fn minio_requires_endpoint() {
        let sync = SyncConfig {
            provider: SyncProvider::Minio,
            bucket: "s3://backups/host1".into(),
            region: None,
            endpoint: None,
            access_key_id: "AK".into(),
            secret_access_key: Secret::new("SK"),
            storage_class: None,
        };
        assert!(validate_sync_config(&sync).is_err());
    }

    #[test]
    fn sealed_payload_carries_secrets_but_debug_does_not() {
        let db = DatabaseDumpConfig {
            engine: DatabaseEngine::Mariadb,
            host: "db".into(),
            port: Some(3307),
            username: "root".into(),
            password: Some(Secret::new("s3cret")),
            database: "shop".into(),
            tables: vec!["orders".into()],
        };
        let json = serde_json::to_string(&db).unwrap();
        assert!(json.contains("s3cret"));
        let back: DatabaseDumpConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, db);
        assert!(!format!("{db:?}").contains("s3cret"));
    }

    #[test]
    fn validate_checks_schedule() {
        let mut j = job();
        j.schedule = "not a cron".into();
        assert_matches!(j.validate(), Err(CoreError::Validation(_)));
    }
}
