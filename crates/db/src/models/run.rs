//! Run history rows.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use vaultkeep_core::process::StageMetrics;
use vaultkeep_core::stage::{RunMetrics, Stage};
use vaultkeep_core::types::{DbId, Timestamp};

/// Terminal state of a run. A row is written `Running` and transitions
/// exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A row from the `runs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RunRow {
    pub id: DbId,
    pub job_id: DbId,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    pub status: RunStatus,
    pub create_duration_secs: Option<f64>,
    pub create_peak_memory_mb: Option<f64>,
    pub prune_duration_secs: Option<f64>,
    pub prune_peak_memory_mb: Option<f64>,
    pub compact_duration_secs: Option<f64>,
    pub compact_peak_memory_mb: Option<f64>,
    pub db_dump_duration_secs: Option<f64>,
    pub db_dump_peak_memory_mb: Option<f64>,
    pub db_archive_duration_secs: Option<f64>,
    pub db_archive_peak_memory_mb: Option<f64>,
    pub db_prune_duration_secs: Option<f64>,
    pub db_prune_peak_memory_mb: Option<f64>,
    pub db_compact_duration_secs: Option<f64>,
    pub db_compact_peak_memory_mb: Option<f64>,
    pub sync_bytes_transferred: Option<i64>,
    pub sync_file_count: Option<i64>,
    pub error_message: Option<String>,
}

impl RunRow {
    /// Stored metrics for one stage, if it executed.
    pub fn stage_metrics(&self, stage: Stage) -> Option<StageMetrics> {
        let (duration, peak) = match stage {
            Stage::Create => (self.create_duration_secs, self.create_peak_memory_mb),
            Stage::Prune => (self.prune_duration_secs, self.prune_peak_memory_mb),
            Stage::Compact => (self.compact_duration_secs, self.compact_peak_memory_mb),
            Stage::DbDump => (self.db_dump_duration_secs, self.db_dump_peak_memory_mb),
            Stage::DbArchive => (self.db_archive_duration_secs, self.db_archive_peak_memory_mb),
            Stage::DbPrune => (self.db_prune_duration_secs, self.db_prune_peak_memory_mb),
            Stage::DbCompact => (self.db_compact_duration_secs, self.db_compact_peak_memory_mb),
            _ => return None,
        };
        Some(StageMetrics {
            duration_secs: duration?,
            peak_memory_mb: peak?,
        })
    }
}

/// Column values for the metric fields of a terminal update.
pub(crate) struct MetricColumns {
    pub values: [Option<f64>; 14],
    pub sync_bytes: Option<i64>,
    pub sync_files: Option<i64>,
}

impl From<&RunMetrics> for MetricColumns {
    fn from(metrics: &RunMetrics) -> Self {
        let split = |m: Option<StageMetrics>| {
            (
                m.map(|m| m.duration_secs),
                m.map(|m| m.peak_memory_mb),
            )
        };
        let stages = [
            split(metrics.create),
            split(metrics.prune),
            split(metrics.compact),
            split(metrics.db_dump),
            split(metrics.db_archive),
            split(metrics.db_prune),
            split(metrics.db_compact),
        ];
        let mut values = [None; 14];
        for (i, (duration, peak)) in stages.into_iter().enumerate() {
            values[i * 2] = duration;
            values[i * 2 + 1] = peak;
        }
        Self {
            values,
            sync_bytes: metrics
                .sync
                .map(|s| i64::try_from(s.bytes_transferred).unwrap_or(i64::MAX)),
            sync_files: metrics
                .sync
                .map(|s| i64::try_from(s.file_count).unwrap_or(i64::MAX)),
        }
    }
}

/// Query parameters for run history.
#[derive(Debug, Clone, Deserialize)]
pub struct RunListQuery {
    /// Maximum number of results. Defaults to 50, capped at 200.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}
