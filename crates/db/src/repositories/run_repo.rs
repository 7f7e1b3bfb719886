//! Repository for the `runs` table.
//!
//! A run is inserted as `running` when a pipeline starts and updated exactly
//! once to `completed` or `failed`. Terminal updates are guarded on the
//! current status so a second transition is a no-op.

use sqlx::SqlitePool;
use vaultkeep_core::stage::RunMetrics;
use vaultkeep_core::types::{DbId, Timestamp};

use crate::models::run::{MetricColumns, RunListQuery, RunRow, RunStatus};

/// Column list for `runs` queries.
const COLUMNS: &str = "\
    id, job_id, started_at, finished_at, status, \
    create_duration_secs, create_peak_memory_mb, \
    prune_duration_secs, prune_peak_memory_mb, \
    compact_duration_secs, compact_peak_memory_mb, \
    db_dump_duration_secs, db_dump_peak_memory_mb, \
    db_archive_duration_secs, db_archive_peak_memory_mb, \
    db_prune_duration_secs, db_prune_peak_memory_mb, \
    db_compact_duration_secs, db_compact_peak_memory_mb, \
    sync_bytes_transferred, sync_file_count, error_message";

/// Maximum page size for run listing.
const MAX_LIMIT: i64 = 200;

/// Default page size for run listing.
const DEFAULT_LIMIT: i64 = 50;

/// Error recorded on runs left `running` by a previous process.
pub const INTERRUPTED_MESSAGE: &str = "Interrupted by scheduler restart";

pub struct RunRepo;

impl RunRepo {
    /// Insert a `running` row for a job starting at `started_at`.
    pub async fn start(
        pool: &SqlitePool,
        job_id: DbId,
        started_at: Timestamp,
    ) -> Result<RunRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO runs (job_id, started_at, status) VALUES (?, ?, ?) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, RunRow>(&query)
            .bind(job_id)
            .bind(started_at)
            .bind(RunStatus::Running)
            .fetch_one(pool)
            .await
    }

    /// Mark a running row completed with its metrics.
    ///
    /// Returns `false` if the row was not `running`.
    pub async fn complete(
        pool: &SqlitePool,
        run_id: DbId,
        finished_at: Timestamp,
        metrics: &RunMetrics,
    ) -> Result<bool, sqlx::Error> {
        Self::finish(pool, run_id, RunStatus::Completed, finished_at, metrics, None).await
    }

    /// Mark a running row failed with the metrics gathered so far.
    ///
    /// Returns `false` if the row was not `running`.
    pub async fn fail(
        pool: &SqlitePool,
        run_id: DbId,
        finished_at: Timestamp,
        metrics: &RunMetrics,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        Self::finish(
            pool,
            run_id,
            RunStatus::Failed,
            finished_at,
            metrics,
            Some(error),
        )
        .await
    }

    async fn finish(
        pool: &SqlitePool,
        run_id: DbId,
        status: RunStatus,
        finished_at: Timestamp,
        metrics: &RunMetrics,
        error: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let columns = MetricColumns::from(metrics);
        let mut query = sqlx::query(
            "UPDATE runs SET \
                 status = ?, finished_at = ?, \
                 create_duration_secs = ?, create_peak_memory_mb = ?, \
                 prune_duration_secs = ?, prune_peak_memory_mb = ?, \
                 compact_duration_secs = ?, compact_peak_memory_mb = ?, \
                 db_dump_duration_secs = ?, db_dump_peak_memory_mb = ?, \
                 db_archive_duration_secs = ?, db_archive_peak_memory_mb = ?, \
                 db_prune_duration_secs = ?, db_prune_peak_memory_mb = ?, \
                 db_compact_duration_secs = ?, db_compact_peak_memory_mb = ?, \
                 sync_bytes_transferred = ?, sync_file_count = ?, error_message = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(status)
        .bind(finished_at);
        for value in columns.values {
            query = query.bind(value);
        }
        let result = query
            .bind(columns.sync_bytes)
            .bind(columns.sync_files)
            .bind(error)
            .bind(run_id)
            .bind(RunStatus::Running)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Whether any run of `job_id` started in the closed window `[from, to]`.
    ///
    /// Backed by `idx_runs_job_started`.
    pub async fn has_run_between(
        pool: &SqlitePool,
        job_id: DbId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS( \
                 SELECT 1 FROM runs WHERE job_id = ? AND started_at >= ? AND started_at <= ? \
             )",
        )
        .bind(job_id)
        .bind(from)
        .bind(to)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }

    pub async fn find_by_id(pool: &SqlitePool, run_id: DbId) -> Result<Option<RunRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM runs WHERE id = ?");
        sqlx::query_as::<_, RunRow>(&query)
            .bind(run_id)
            .fetch_optional(pool)
            .await
    }

    /// Runs of one job, newest first.
    pub async fn list_for_job(
        pool: &SqlitePool,
        job_id: DbId,
        params: &RunListQuery,
    ) -> Result<Vec<RunRow>, sqlx::Error> {
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = params.offset.unwrap_or(0).max(0);
        let query = format!(
            "SELECT {COLUMNS} FROM runs WHERE job_id = ? \
             ORDER BY started_at DESC, id DESC LIMIT ? OFFSET ?"
        );
        sqlx::query_as::<_, RunRow>(&query)
            .bind(job_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    /// Fail any `running` row of one job. Used when a pipeline task dies
    /// without recording its own outcome.
    pub async fn fail_running_for_job(
        pool: &SqlitePool,
        job_id: DbId,
        finished_at: Timestamp,
        error: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE runs SET status = ?, finished_at = ?, error_message = ? \
             WHERE job_id = ? AND status = ?",
        )
        .bind(RunStatus::Failed)
        .bind(finished_at)
        .bind(error)
        .bind(job_id)
        .bind(RunStatus::Running)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Fail every row still `running`. Called once at startup, before the
    /// scheduler dispatches anything, so any such row belongs to a dead
    /// process.
    pub async fn mark_interrupted(
        pool: &SqlitePool,
        finished_at: Timestamp,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE runs SET status = ?, finished_at = ?, error_message = ? WHERE status = ?",
        )
        .bind(RunStatus::Failed)
        .bind(finished_at)
        .bind(INTERRUPTED_MESSAGE)
        .bind(RunStatus::Running)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
