//! Runs one job's stages in order and records the outcome.
//!
//! Stage order: pre-command, repository ensure, create, prune, compact,
//! database (dump, archive, prune, compact), off-site sync, post-command.
//! Hooks are best-effort. Every other stage is fatal, except sync under
//! [`SyncFailurePolicy::BestEffort`]. Metrics are kept for every stage that
//! produced an exit code, including a failing one.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::Instrument;
use vaultkeep_core::archive::{archive_glob, archive_name, ArchiveNamespace};
use vaultkeep_core::job::{BackupJob, DatabaseDumpConfig, SyncConfig};
use vaultkeep_core::process::{ProcessError, ProcessOutput, ProcessRunner, ProcessSpec};
use vaultkeep_core::secret::Secret;
use vaultkeep_core::stage::{RunMetrics, Stage};
use vaultkeep_core::types::{DbId, Timestamp};
use vaultkeep_db::repositories::RunRepo;
use vaultkeep_db::DbPool;
use vaultkeep_events::Notifier;

use crate::archiver::{Archiver, CreateArchive};
use crate::dumper::{DatabaseDumper, DumpSet};
use crate::error::PipelineError;
use crate::report;
use crate::settings::{PipelineSettings, SyncFailurePolicy};
use crate::sync::RepositorySyncer;

/// The external services a run calls.
#[derive(Clone)]
pub struct Collaborators {
    pub archiver: Arc<dyn Archiver>,
    pub dumper: Arc<dyn DatabaseDumper>,
    pub syncer: Arc<dyn RepositorySyncer>,
    pub notifier: Arc<dyn Notifier>,
}

/// What a successful run recorded.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: DbId,
    pub metrics: RunMetrics,
    pub finished_at: Timestamp,
}

pub struct PipelineExecutor {
    pool: DbPool,
    collaborators: Collaborators,
    runner: ProcessRunner,
    settings: PipelineSettings,
}

impl PipelineExecutor {
    pub fn new(
        pool: DbPool,
        collaborators: Collaborators,
        runner: ProcessRunner,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            pool,
            collaborators,
            runner,
            settings,
        }
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.collaborators.notifier
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run `job` as the execution scheduled at `started_at`.
    ///
    /// A pre-flight failure creates no run record. Any later failure marks
    /// the record failed before the error is returned. Either way the
    /// outcome is reported through the notifier.
    pub async fn execute(
        &self,
        job: &BackupJob,
        started_at: Timestamp,
    ) -> Result<RunSummary, PipelineError> {
        let span = tracing::info_span!("backup_job", job_id = job.id, job_name = %job.name);
        self.execute_inner(job, started_at).instrument(span).await
    }

    async fn execute_inner(
        &self,
        job: &BackupJob,
        started_at: Timestamp,
    ) -> Result<RunSummary, PipelineError> {
        let passphrase = match self.preflight(job) {
            Ok(passphrase) => passphrase,
            Err(e) => {
                tracing::error!(error = %e, "Pre-flight validation failed");
                self.notify_failure(job, started_at, &e).await;
                return Err(e);
            }
        };

        let run = match RunRepo::start(&self.pool, job.id, started_at).await {
            Ok(run) => run,
            Err(e) => {
                let e = PipelineError::Store(e);
                tracing::error!(error = %e, "Failed to create run record");
                self.notify_failure(job, started_at, &e).await;
                return Err(e);
            }
        };
        tracing::info!(run_id = run.id, "Backup run started");

        let mut metrics = RunMetrics::default();
        let outcome = self
            .run_stages(job, &passphrase, started_at, &mut metrics)
            .await;
        let finished_at = Utc::now();

        match outcome {
            Ok(()) => {
                if let Err(e) = RunRepo::complete(&self.pool, run.id, finished_at, &metrics).await {
                    let e = PipelineError::Store(e);
                    tracing::error!(run_id = run.id, error = %e, "Failed to record completed run");
                    self.notify_failure(job, started_at, &e).await;
                    return Err(e);
                }
                tracing::info!(
                    run_id = run.id,
                    duration_secs = (finished_at - started_at).num_seconds(),
                    "Backup run completed"
                );
                self.collaborators
                    .notifier
                    .send(
                        &report::success_subject(&job.name),
                        &report::success_body(&job.name, started_at, finished_at, &metrics),
                        false,
                    )
                    .await;
                Ok(RunSummary {
                    run_id: run.id,
                    metrics,
                    finished_at,
                })
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(store_err) =
                    RunRepo::fail(&self.pool, run.id, finished_at, &metrics, &message).await
                {
                    tracing::error!(
                        run_id = run.id,
                        error = %store_err,
                        "Failed to record failed run"
                    );
                }
                tracing::error!(run_id = run.id, error = %e, "Backup run failed");
                self.notify_failure(job, started_at, &e).await;
                Err(e)
            }
        }
    }

    fn preflight(&self, job: &BackupJob) -> Result<Secret, PipelineError> {
        job.validate()?;
        Ok(job.resolve_passphrase(self.settings.fallback_passphrase.as_ref())?)
    }

    async fn notify_failure(&self, job: &BackupJob, started_at: Timestamp, error: &PipelineError) {
        self.collaborators
            .notifier
            .send(
                &report::failure_subject(&job.name),
                &report::failure_body(&job.name, started_at, &error.to_string()),
                true,
            )
            .await;
    }

    async fn run_stages(
        &self,
        job: &BackupJob,
        passphrase: &Secret,
        started_at: Timestamp,
        metrics: &mut RunMetrics,
    ) -> Result<(), PipelineError> {
        if let Some(command) = &job.pre_command {
            self.run_hook(Stage::PreCommand, command).await;
        }

        let repository = self.settings.repository_path(&job.name);
        self.ensure_repository(&repository, passphrase).await?;

        let archive = archive_name(&job.name, ArchiveNamespace::Files, started_at);
        let request = CreateArchive {
            repository: &repository,
            archive: &archive,
            sources: job
                .effective_sources()
                .into_iter()
                .map(String::from)
                .collect(),
            excludes: &job.exclude_patterns,
            compression: job.compression,
        };
        tracing::info!(archive = %archive, "Creating archive");
        let result = self.collaborators.archiver.create(&request, passphrase).await;
        self.finish_stage(Stage::Create, result, metrics)?;

        self.prune_and_compact(job, &repository, ArchiveNamespace::Files, passphrase, metrics)
            .await?;

        if let Some(database) = &job.database {
            self.backup_database(job, database, &repository, passphrase, started_at, metrics)
                .await?;
        }

        if let Some(sync) = &job.sync {
            self.sync_offsite(sync, &repository, metrics).await?;
        }

        if let Some(command) = &job.post_command {
            self.run_hook(Stage::PostCommand, command).await;
        }
        Ok(())
    }

    async fn ensure_repository(
        &self,
        repository: &Path,
        passphrase: &Secret,
    ) -> Result<(), PipelineError> {
        let archiver = &self.collaborators.archiver;
        if archiver.repository_exists(repository).await {
            return Ok(());
        }
        let output = archiver
            .init(repository, passphrase)
            .await
            .map_err(|e| PipelineError::from_process(Stage::RepositoryEnsure, e))?;
        if !archiver.accepts_exit(output.exit_code) {
            return Err(PipelineError::exit(
                Stage::RepositoryEnsure,
                output.exit_code,
                &output.error_tail(),
            ));
        }
        tracing::info!(repository = %repository.display(), "Repository initialized");
        Ok(())
    }

    /// Record a stage's metrics and turn a rejected exit code into an error.
    fn finish_stage(
        &self,
        stage: Stage,
        result: Result<ProcessOutput, ProcessError>,
        metrics: &mut RunMetrics,
    ) -> Result<ProcessOutput, PipelineError> {
        let output = result.map_err(|e| PipelineError::from_process(stage, e))?;
        let stage_metrics = output.metrics();
        metrics.record(stage, stage_metrics);

        if !self.collaborators.archiver.accepts_exit(output.exit_code) {
            return Err(PipelineError::exit(
                stage,
                output.exit_code,
                &output.error_tail(),
            ));
        }
        if output.exit_code != 0 {
            tracing::warn!(
                stage = %stage,
                exit_code = output.exit_code,
                output = %output.error_tail(),
                "Stage finished with warnings"
            );
        }
        tracing::info!(
            stage = %stage,
            duration_secs = stage_metrics.duration_secs,
            peak_memory_mb = stage_metrics.peak_memory_mb,
            "Stage finished"
        );
        Ok(output)
    }

    async fn prune_and_compact(
        &self,
        job: &BackupJob,
        repository: &Path,
        namespace: ArchiveNamespace,
        passphrase: &Secret,
        metrics: &mut RunMetrics,
    ) -> Result<(), PipelineError> {
        let (prune_stage, compact_stage) = match namespace {
            ArchiveNamespace::Files => (Stage::Prune, Stage::Compact),
            ArchiveNamespace::Database => (Stage::DbPrune, Stage::DbCompact),
        };
        let archiver = &self.collaborators.archiver;

        if job.retention.keeps_nothing() {
            // The archiving tool refuses a prune with no keep rule.
            tracing::warn!(stage = %prune_stage, "Retention keeps nothing, skipping prune");
        } else {
            let glob = archive_glob(&job.name, namespace);
            let result = archiver
                .prune(repository, &glob, &job.retention, passphrase)
                .await;
            self.finish_stage(prune_stage, result, metrics)?;
        }

        let result = archiver.compact(repository, passphrase).await;
        self.finish_stage(compact_stage, result, metrics)?;
        Ok(())
    }

    async fn backup_database(
        &self,
        job: &BackupJob,
        config: &DatabaseDumpConfig,
        repository: &Path,
        passphrase: &Secret,
        started_at: Timestamp,
        metrics: &mut RunMetrics,
    ) -> Result<(), PipelineError> {
        let mut dumps = self.collaborators.dumper.create_dumps(config).await?;
        if let Some(dump_metrics) = dumps.metrics() {
            metrics.record(Stage::DbDump, dump_metrics);
        }

        let result = self
            .archive_dumps(job, &dumps, repository, passphrase, started_at, metrics)
            .await;

        if let Err(e) = dumps.cleanup() {
            tracing::warn!(error = %e, "Failed to remove dump directory");
        }
        result
    }

    async fn archive_dumps(
        &self,
        job: &BackupJob,
        dumps: &DumpSet,
        repository: &Path,
        passphrase: &Secret,
        started_at: Timestamp,
        metrics: &mut RunMetrics,
    ) -> Result<(), PipelineError> {
        if dumps.is_empty() {
            tracing::warn!("Database dump produced no files, skipping database archive");
            return Ok(());
        }

        let archive = archive_name(&job.name, ArchiveNamespace::Database, started_at);
        let request = CreateArchive {
            repository,
            archive: &archive,
            sources: dumps
                .files()
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            excludes: &[],
            compression: job.compression,
        };
        tracing::info!(archive = %archive, files = dumps.files().len(), "Archiving database dumps");
        let result = self.collaborators.archiver.create(&request, passphrase).await;
        self.finish_stage(Stage::DbArchive, result, metrics)?;

        self.prune_and_compact(job, repository, ArchiveNamespace::Database, passphrase, metrics)
            .await
    }

    async fn sync_offsite(
        &self,
        config: &SyncConfig,
        repository: &Path,
        metrics: &mut RunMetrics,
    ) -> Result<(), PipelineError> {
        match self
            .collaborators
            .syncer
            .sync_repository(config, repository)
            .await
        {
            Ok(stats) => {
                metrics.sync = Some(stats);
                Ok(())
            }
            Err(e) => match self.settings.sync_failure_policy {
                SyncFailurePolicy::Fatal => Err(PipelineError::Sync(e)),
                SyncFailurePolicy::BestEffort => {
                    tracing::warn!(error = %e, "Off-site sync failed, local backup kept");
                    Ok(())
                }
            },
        }
    }

    /// Run a pre/post command. Failures and timeouts only warn.
    async fn run_hook(&self, stage: Stage, command: &str) {
        let command = command.trim();
        if command.is_empty() {
            return;
        }
        let spec = ProcessSpec::shell(command).timeout(self.settings.hook_timeout);
        match self.runner.run(&spec).await {
            Ok(output) if output.success() => {
                tracing::info!(
                    stage = %stage,
                    duration_secs = output.duration.as_secs_f64(),
                    "Hook finished"
                );
            }
            Ok(output) => {
                tracing::warn!(
                    stage = %stage,
                    exit_code = output.exit_code,
                    output = %output.error_tail(),
                    "Hook exited unsuccessfully, continuing"
                );
            }
            Err(e) => {
                tracing::warn!(stage = %stage, error = %e, "Hook failed, continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests;
