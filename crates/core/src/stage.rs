//! Pipeline stage identities and the per-run metrics they produce.

use crate::process::StageMetrics;

/// Every stage of a backup run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    PreCommand,
    RepositoryEnsure,
    Create,
    Prune,
    Compact,
    DbDump,
    DbArchive,
    DbPrune,
    DbCompact,
    Sync,
    PostCommand,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreCommand => "pre_command",
            Self::RepositoryEnsure => "repository_ensure",
            Self::Create => "create",
            Self::Prune => "prune",
            Self::Compact => "compact",
            Self::DbDump => "db_dump",
            Self::DbArchive => "db_archive",
            Self::DbPrune => "db_prune",
            Self::DbCompact => "db_compact",
            Self::Sync => "sync",
            Self::PostCommand => "post_command",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stages whose metrics are persisted on the run record.
pub const RECORDED_STAGES: [Stage; 7] = [
    Stage::Create,
    Stage::Prune,
    Stage::Compact,
    Stage::DbDump,
    Stage::DbArchive,
    Stage::DbPrune,
    Stage::DbCompact,
];

/// Transfer statistics reported by the off-site sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub bytes_transferred: u64,
    pub file_count: u64,
    pub elapsed: std::time::Duration,
}

/// Metrics collected over one run. `None` means the stage did not execute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunMetrics {
    pub create: Option<StageMetrics>,
    pub prune: Option<StageMetrics>,
    pub compact: Option<StageMetrics>,
    pub db_dump: Option<StageMetrics>,
    pub db_archive: Option<StageMetrics>,
    pub db_prune: Option<StageMetrics>,
    pub db_compact: Option<StageMetrics>,
    pub sync: Option<SyncStats>,
}

impl RunMetrics {
    fn slot(&mut self, stage: Stage) -> Option<&mut Option<StageMetrics>> {
        match stage {
            Stage::Create => Some(&mut self.create),
            Stage::Prune => Some(&mut self.prune),
            Stage::Compact => Some(&mut self.compact),
            Stage::DbDump => Some(&mut self.db_dump),
            Stage::DbArchive => Some(&mut self.db_archive),
            Stage::DbPrune => Some(&mut self.db_prune),
            Stage::DbCompact => Some(&mut self.db_compact),
            _ => None,
        }
    }

    /// Record metrics for a stage. Unrecorded stages are ignored.
    pub fn record(&mut self, stage: Stage, metrics: StageMetrics) {
        if let Some(slot) = self.slot(stage) {
            *slot = Some(metrics);
        }
    }

    pub fn get(&self, stage: Stage) -> Option<StageMetrics> {
        match stage {
            Stage::Create => self.create,
            Stage::Prune => self.prune,
            Stage::Compact => self.compact,
            Stage::DbDump => self.db_dump,
            Stage::DbArchive => self.db_archive,
            Stage::DbPrune => self.db_prune,
            Stage::DbCompact => self.db_compact,
            _ => None,
        }
    }

    /// Stages that executed, in pipeline order.
    pub fn recorded(&self) -> impl Iterator<Item = (Stage, StageMetrics)> + '_ {
        RECORDED_STAGES
            .iter()
            .filter_map(move |stage| self.get(*stage).map(|m| (*stage, m)))
    }
}
