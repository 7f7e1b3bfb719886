//! Repository for the `jobs` table.

use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqlitePool;
use vaultkeep_core::types::DbId;

use crate::models::job::{CreateBackupJob, JobRow, JobSchedule, SealedJobFields};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, name, schedule, compression, source_paths, exclude_patterns, \
    keep_daily, keep_monthly, keep_yearly, pre_command, post_command, \
    database_config, sync_config, passphrase, created_at, updated_at";

/// Provides CRUD operations for backup job definitions.
///
/// Callers validate and seal input first; see [`CreateBackupJob::validate`]
/// and [`CreateBackupJob::seal`].
pub struct JobRepo;

impl JobRepo {
    /// Insert a new job. Fails with a unique violation if the name is taken.
    pub async fn create(
        pool: &SqlitePool,
        input: &CreateBackupJob,
        sealed: &SealedJobFields,
    ) -> Result<JobRow, sqlx::Error> {
        let now = Utc::now();
        let query = format!(
            "INSERT INTO jobs (name, schedule, compression, source_paths, exclude_patterns, \
                 keep_daily, keep_monthly, keep_yearly, pre_command, post_command, \
                 database_config, sync_config, passphrase, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(&input.name)
            .bind(&input.schedule)
            .bind(input.compression.as_str())
            .bind(Json(&input.source_paths))
            .bind(Json(&input.exclude_patterns))
            .bind(input.keep_daily)
            .bind(input.keep_monthly)
            .bind(input.keep_yearly)
            .bind(&input.pre_command)
            .bind(&input.post_command)
            .bind(&sealed.database_config)
            .bind(&sealed.sync_config)
            .bind(&sealed.passphrase)
            .bind(now)
            .bind(now)
            .fetch_one(pool)
            .await
    }

    /// Replace a job's definition. A `None` sealed passphrase keeps the
    /// stored one. Returns `None` if the job does not exist.
    pub async fn update(
        pool: &SqlitePool,
        id: DbId,
        input: &CreateBackupJob,
        sealed: &SealedJobFields,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs SET \
                 name = ?, schedule = ?, compression = ?, source_paths = ?, \
                 exclude_patterns = ?, keep_daily = ?, keep_monthly = ?, keep_yearly = ?, \
                 pre_command = ?, post_command = ?, database_config = ?, sync_config = ?, \
                 passphrase = COALESCE(?, passphrase), updated_at = ? \
             WHERE id = ? \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(&input.name)
            .bind(&input.schedule)
            .bind(input.compression.as_str())
            .bind(Json(&input.source_paths))
            .bind(Json(&input.exclude_patterns))
            .bind(input.keep_daily)
            .bind(input.keep_monthly)
            .bind(input.keep_yearly)
            .bind(&input.pre_command)
            .bind(&input.post_command)
            .bind(&sealed.database_config)
            .bind(&sealed.sync_config)
            .bind(&sealed.passphrase)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Delete a job. Its run history goes with it (`ON DELETE CASCADE`).
    pub async fn delete(pool: &SqlitePool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: DbId) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = ?");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_name(
        pool: &SqlitePool,
        name: &str,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE name = ?");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(name)
            .fetch_optional(pool)
            .await
    }

    /// All jobs ordered by name.
    pub async fn list(pool: &SqlitePool) -> Result<Vec<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs ORDER BY name");
        sqlx::query_as::<_, JobRow>(&query).fetch_all(pool).await
    }

    /// Id, name and schedule of every job, without the sealed columns.
    pub async fn list_schedules(pool: &SqlitePool) -> Result<Vec<JobSchedule>, sqlx::Error> {
        sqlx::query_as::<_, JobSchedule>("SELECT id, name, schedule FROM jobs ORDER BY id")
            .fetch_all(pool)
            .await
    }
}
