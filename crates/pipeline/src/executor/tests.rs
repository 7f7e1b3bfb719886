use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;
use vaultkeep_core::job::{DatabaseDumpConfig, DatabaseEngine, SyncConfig, SyncProvider};
use vaultkeep_core::secret::Secret;
use vaultkeep_core::stage::Stage;
use vaultkeep_core::types::Timestamp;
use vaultkeep_db::models::run::{RunListQuery, RunStatus};
use vaultkeep_db::repositories::RunRepo;

use super::*;
use crate::testing::{
    job_input, store_job, ArchiverCall, ArchiverOp, FakeDumper, FakeSyncer, Fakes,
};

fn nightly() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 1, 15, 2, 0, 0).unwrap()
}

struct Harness {
    root: TempDir,
    fakes: Fakes,
}

impl Harness {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let fakes = Fakes::new(root.path());
        Self { root, fakes }
    }

    fn settings(&self) -> PipelineSettings {
        PipelineSettings::new(self.root.path().join("repos"))
    }

    fn executor(&self, pool: &SqlitePool) -> PipelineExecutor {
        self.fakes.executor(pool.clone(), self.settings())
    }

    fn repository(&self, job: &str) -> std::path::PathBuf {
        self.settings().repository_path(job)
    }
}

fn postgres() -> DatabaseDumpConfig {
    DatabaseDumpConfig {
        engine: DatabaseEngine::Postgresql,
        host: "db.internal".into(),
        port: None,
        username: "backup".into(),
        password: Some(Secret::new("pw")),
        database: "app".into(),
        tables: Vec::new(),
    }
}

fn bucket() -> SyncConfig {
    SyncConfig {
        provider: SyncProvider::Aws,
        bucket: "offsite".into(),
        region: None,
        endpoint: None,
        access_key_id: "AKIA".into(),
        secret_access_key: Secret::new("secret"),
        storage_class: None,
    }
}

async fn only_run(pool: &SqlitePool, job_id: i64) -> vaultkeep_db::models::run::RunRow {
    let mut runs = RunRepo::list_for_job(
        pool,
        job_id,
        &RunListQuery {
            limit: None,
            offset: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(runs.len(), 1, "expected exactly one run record");
    runs.remove(0)
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../db/migrations")]
async fn nightly_run_records_local_stages(pool: SqlitePool) {
    let h = Harness::new();
    let job = store_job(&pool, &job_input("nightly")).await;

    let summary = h.executor(&pool).execute(&job, nightly()).await.unwrap();

    let run = only_run(&pool, job.id).await;
    assert_eq!(run.id, summary.run_id);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.started_at, nightly());
    assert!(run.finished_at.is_some());
    assert!(run.error_message.is_none());
    for stage in [Stage::Create, Stage::Prune, Stage::Compact] {
        let m = run.stage_metrics(stage).expect("local stage metrics");
        assert!(m.duration_secs >= 0.0);
        assert!(m.peak_memory_mb >= 1.0);
    }
    for stage in [Stage::DbDump, Stage::DbArchive, Stage::DbPrune, Stage::DbCompact] {
        assert!(run.stage_metrics(stage).is_none(), "{stage} should be null");
    }
    assert!(run.sync_bytes_transferred.is_none());

    let repo = h.repository("nightly");
    assert_eq!(
        h.fakes.archiver.calls(),
        vec![
            ArchiverCall::Init {
                repository: repo.clone()
            },
            ArchiverCall::Create {
                repository: repo.clone(),
                archive: "nightly_20240115020000Z".into(),
                sources: vec!["/srv/data".into()],
                passphrase: "test-passphrase".into(),
            },
            ArchiverCall::Prune {
                repository: repo.clone(),
                glob: "nightly_[0-9]*".into(),
                retention: job.retention,
            },
            ArchiverCall::Compact { repository: repo },
        ]
    );

    let sent = h.fakes.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Backup completed: nightly");
    assert!(!sent[0].is_error);
    assert!(sent[0].body.contains("create"));
}

#[sqlx::test(migrations = "../db/migrations")]
async fn existing_repository_is_not_reinitialized(pool: SqlitePool) {
    let h = Harness::new();
    let job = store_job(&pool, &job_input("nightly")).await;
    h.fakes.archiver.seed(&h.repository("nightly"), &[]);

    h.executor(&pool).execute(&job, nightly()).await.unwrap();

    assert!(!h
        .fakes
        .archiver
        .calls()
        .iter()
        .any(|c| matches!(c, ArchiverCall::Init { .. })));
}

#[sqlx::test(migrations = "../db/migrations")]
async fn warning_exit_counts_as_success(pool: SqlitePool) {
    let h = Harness::new();
    let job = store_job(&pool, &job_input("nightly")).await;
    h.fakes.archiver.fail(ArchiverOp::Create, 1);

    h.executor(&pool).execute(&job, nightly()).await.unwrap();

    assert_eq!(only_run(&pool, job.id).await.status, RunStatus::Completed);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../db/migrations")]
async fn failed_create_stops_before_prune(pool: SqlitePool) {
    let h = Harness::new();
    let job = store_job(&pool, &job_input("nightly")).await;
    h.fakes.archiver.fail(ArchiverOp::Create, 2);

    let err = h.executor(&pool).execute(&job, nightly()).await.unwrap_err();
    assert_matches!(err, PipelineError::Process { stage: Stage::Create, .. });

    let run = only_run(&pool, job.id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.finished_at.is_some());
    assert!(run.stage_metrics(Stage::Create).is_some());
    assert!(run.stage_metrics(Stage::Prune).is_none());
    assert!(run.stage_metrics(Stage::Compact).is_none());
    let message = run.error_message.unwrap();
    assert!(message.contains("create"), "{message}");
    assert!(message.contains("status 2"), "{message}");

    let sent = h.fakes.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Backup failed: nightly");
    assert!(sent[0].is_error);
    assert!(sent[0].body.contains("status 2"));
}

#[sqlx::test(migrations = "../db/migrations")]
async fn failed_init_is_a_repository_error(pool: SqlitePool) {
    let h = Harness::new();
    let job = store_job(&pool, &job_input("nightly")).await;
    h.fakes.archiver.fail(ArchiverOp::Init, 2);

    let err = h.executor(&pool).execute(&job, nightly()).await.unwrap_err();
    assert_matches!(
        err,
        PipelineError::Process {
            stage: Stage::RepositoryEnsure,
            ..
        }
    );
    let run = only_run(&pool, job.id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.stage_metrics(Stage::Create).is_none());
}

#[sqlx::test(migrations = "../db/migrations")]
async fn failed_compact_keeps_earlier_metrics(pool: SqlitePool) {
    let h = Harness::new();
    let job = store_job(&pool, &job_input("nightly")).await;
    h.fakes.archiver.fail(ArchiverOp::Compact, 2);

    let err = h.executor(&pool).execute(&job, nightly()).await.unwrap_err();
    assert_matches!(err, PipelineError::Process { stage: Stage::Compact, .. });

    let run = only_run(&pool, job.id).await;
    assert!(run.stage_metrics(Stage::Create).is_some());
    assert!(run.stage_metrics(Stage::Prune).is_some());
    assert!(run.stage_metrics(Stage::Compact).is_some());
}

#[sqlx::test(migrations = "../db/migrations")]
async fn invalid_job_creates_no_run(pool: SqlitePool) {
    let h = Harness::new();
    let mut job = store_job(&pool, &job_input("nightly")).await;
    job.schedule = "every night".into();

    let err = h.executor(&pool).execute(&job, nightly()).await.unwrap_err();
    assert_matches!(err, PipelineError::Validation(_));

    let runs = RunRepo::list_for_job(
        &pool,
        job.id,
        &RunListQuery {
            limit: None,
            offset: None,
        },
    )
    .await
    .unwrap();
    assert!(runs.is_empty());
    assert!(h.fakes.archiver.calls().is_empty());
    let sent = h.fakes.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is_error);
}

#[sqlx::test(migrations = "../db/migrations")]
async fn missing_passphrase_without_fallback_is_rejected(pool: SqlitePool) {
    let h = Harness::new();
    let mut input = job_input("nightly");
    input.passphrase = None;
    let job = store_job(&pool, &input).await;

    let err = h.executor(&pool).execute(&job, nightly()).await.unwrap_err();
    assert_matches!(err, PipelineError::Validation(msg) if msg.contains("passphrase"));
    assert!(h.fakes.archiver.calls().is_empty());
}

#[sqlx::test(migrations = "../db/migrations")]
async fn missing_passphrase_uses_fallback(pool: SqlitePool) {
    let h = Harness::new();
    let mut input = job_input("nightly");
    input.passphrase = None;
    let job = store_job(&pool, &input).await;
    let mut settings = h.settings();
    settings.fallback_passphrase = Some(Secret::new("fallback"));

    h.fakes
        .executor(pool.clone(), settings)
        .execute(&job, nightly())
        .await
        .unwrap();

    assert_matches!(
        h.fakes.archiver.calls().as_slice(),
        [_, ArchiverCall::Create { passphrase, .. }, ..] if passphrase == "fallback"
    );
}

#[sqlx::test(migrations = "../db/migrations")]
async fn two_runs_in_one_minute_both_complete(pool: SqlitePool) {
    let h = Harness::new();
    let job = store_job(&pool, &job_input("nightly")).await;
    let executor = h.executor(&pool);
    let manual = Utc.with_ymd_and_hms(2024, 1, 15, 2, 0, 50).unwrap();

    executor.execute(&job, nightly()).await.unwrap();
    executor.execute(&job, manual).await.unwrap();

    let created: Vec<String> = h
        .fakes
        .archiver
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            ArchiverCall::Create { archive, .. } => Some(archive),
            _ => None,
        })
        .collect();
    assert_eq!(
        created,
        vec!["nightly_20240115020000Z", "nightly_20240115020050Z"]
    );
}

#[sqlx::test(migrations = "../db/migrations")]
async fn reused_archive_name_fails_the_create_stage(pool: SqlitePool) {
    let h = Harness::new();
    let job = store_job(&pool, &job_input("nightly")).await;
    let executor = h.executor(&pool);

    executor.execute(&job, nightly()).await.unwrap();
    assert_matches!(
        executor.execute(&job, nightly()).await,
        Err(PipelineError::Process { stage: Stage::Create, .. })
    );
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../db/migrations")]
async fn prune_keeps_only_the_retained_archives(pool: SqlitePool) {
    let h = Harness::new();
    let job = store_job(&pool, &job_input("nightly")).await;
    let repo = h.repository("nightly");
    let mut seeded: Vec<String> = (1..=10)
        .map(|day| format!("nightly_202401{day:02}020000Z"))
        .collect();
    seeded.push("nightly_db_20240101020000Z".into());
    seeded.push("nightly-old_20240101020000Z".into());
    h.fakes.archiver.seed(&repo, &seeded);

    let started = Utc.with_ymd_and_hms(2024, 1, 11, 2, 0, 0).unwrap();
    h.executor(&pool).execute(&job, started).await.unwrap();

    // Seven days kept; January and 2024 are already claimed by the newest.
    let mut expected: Vec<String> = (5..=11)
        .map(|day| format!("nightly_202401{day:02}020000Z"))
        .collect();
    expected.push("nightly-old_20240101020000Z".into());
    expected.push("nightly_db_20240101020000Z".into());
    expected.sort();
    assert_eq!(h.fakes.archiver.archives(&repo), expected);
}

#[sqlx::test(migrations = "../db/migrations")]
async fn empty_retention_skips_prune_but_compacts(pool: SqlitePool) {
    let h = Harness::new();
    let mut input = job_input("nightly");
    input.keep_daily = 0;
    input.keep_monthly = 0;
    input.keep_yearly = 0;
    let job = store_job(&pool, &input).await;

    h.executor(&pool).execute(&job, nightly()).await.unwrap();

    let calls = h.fakes.archiver.calls();
    assert!(!calls.iter().any(|c| matches!(c, ArchiverCall::Prune { .. })));
    assert!(calls.iter().any(|c| matches!(c, ArchiverCall::Compact { .. })));
    let run = only_run(&pool, job.id).await;
    assert!(run.stage_metrics(Stage::Prune).is_none());
    assert!(run.stage_metrics(Stage::Compact).is_some());
}

// ---------------------------------------------------------------------------
// Database stage
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../db/migrations")]
async fn database_stage_archives_dumps_in_their_own_namespace(pool: SqlitePool) {
    let h = Harness::new();
    let mut input = job_input("nightly");
    input.database = Some(postgres());
    let job = store_job(&pool, &input).await;

    h.executor(&pool).execute(&job, nightly()).await.unwrap();

    let run = only_run(&pool, job.id).await;
    for stage in [Stage::DbDump, Stage::DbArchive, Stage::DbPrune, Stage::DbCompact] {
        assert!(run.stage_metrics(stage).is_some(), "{stage} should be recorded");
    }

    let calls = h.fakes.archiver.calls();
    assert!(calls.iter().any(|c| matches!(
        c,
        ArchiverCall::Create { archive, .. } if archive == "nightly_db_20240115020000Z"
    )));
    assert!(calls.iter().any(|c| matches!(
        c,
        ArchiverCall::Prune { glob, .. } if glob == "nightly_db_[0-9]*"
    )));

    let files = h.fakes.dumper.created_files();
    assert!(!files.is_empty());
    assert!(files.iter().all(|f| !f.exists()), "dump files must be removed");
}

#[sqlx::test(migrations = "../db/migrations")]
async fn dumps_are_removed_when_database_archive_fails(pool: SqlitePool) {
    let h = Harness::new();
    let mut input = job_input("nightly");
    input.database = Some(postgres());
    let job = store_job(&pool, &input).await;
    h.fakes.archiver.fail_archives_containing("_db_");

    let err = h.executor(&pool).execute(&job, nightly()).await.unwrap_err();
    assert_matches!(err, PipelineError::Process { stage: Stage::DbArchive, .. });

    let run = only_run(&pool, job.id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.stage_metrics(Stage::DbDump).is_some());
    assert!(run.stage_metrics(Stage::DbArchive).is_some());
    assert!(run.stage_metrics(Stage::DbPrune).is_none());

    let files = h.fakes.dumper.created_files();
    assert!(!files.is_empty());
    assert!(files.iter().all(|f| !f.exists()));
}

#[sqlx::test(migrations = "../db/migrations")]
async fn dump_failure_fails_the_run(pool: SqlitePool) {
    let root = tempfile::tempdir().unwrap();
    let dumper = FakeDumper::new(root.path());
    dumper.fail();
    let fakes = Fakes::new(root.path()).with_dumper(dumper);
    let mut input = job_input("nightly");
    input.database = Some(postgres());
    let job = store_job(&pool, &input).await;

    let err = fakes
        .executor(pool.clone(), PipelineSettings::new(root.path().join("repos")))
        .execute(&job, nightly())
        .await
        .unwrap_err();
    assert_matches!(err, PipelineError::Dump(_));

    let run = only_run(&pool, job.id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.stage_metrics(Stage::Compact).is_some());
    assert!(run.stage_metrics(Stage::DbDump).is_none());
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../db/migrations")]
async fn sync_statistics_are_recorded(pool: SqlitePool) {
    let h = Harness::new();
    let mut input = job_input("nightly");
    input.sync = Some(bucket());
    let job = store_job(&pool, &input).await;

    h.executor(&pool).execute(&job, nightly()).await.unwrap();

    let run = only_run(&pool, job.id).await;
    assert_eq!(run.sync_bytes_transferred, Some(1024));
    assert_eq!(run.sync_file_count, Some(3));
    assert_eq!(h.fakes.syncer.calls(), vec![h.repository("nightly")]);
}

#[sqlx::test(migrations = "../db/migrations")]
async fn sync_failure_is_fatal_by_default(pool: SqlitePool) {
    let root = tempfile::tempdir().unwrap();
    let fakes = Fakes::new(root.path()).with_syncer(FakeSyncer::failing());
    let mut input = job_input("nightly");
    input.sync = Some(bucket());
    let job = store_job(&pool, &input).await;

    let err = fakes
        .executor(pool.clone(), PipelineSettings::new(root.path().join("repos")))
        .execute(&job, nightly())
        .await
        .unwrap_err();
    assert_matches!(err, PipelineError::Sync(_));

    let run = only_run(&pool, job.id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.stage_metrics(Stage::Create).is_some());
    assert!(run.sync_bytes_transferred.is_none());
}

#[sqlx::test(migrations = "../db/migrations")]
async fn best_effort_sync_failure_completes(pool: SqlitePool) {
    let root = tempfile::tempdir().unwrap();
    let fakes = Fakes::new(root.path()).with_syncer(FakeSyncer::failing());
    let mut input = job_input("nightly");
    input.sync = Some(bucket());
    let job = store_job(&pool, &input).await;
    let mut settings = PipelineSettings::new(root.path().join("repos"));
    settings.sync_failure_policy = SyncFailurePolicy::BestEffort;

    let summary = fakes
        .executor(pool.clone(), settings)
        .execute(&job, nightly())
        .await
        .unwrap();

    assert!(summary.metrics.sync.is_none());
    let run = only_run(&pool, job.id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.sync_bytes_transferred.is_none());
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../db/migrations")]
async fn pre_command_runs_before_create(pool: SqlitePool) {
    let h = Harness::new();
    let marker = h.root.path().join("prepared");
    let mut input = job_input("nightly");
    input.source_paths = vec![marker.display().to_string()];
    input.pre_command = Some(format!("touch '{}'", marker.display()));
    let job = store_job(&pool, &input).await;

    h.executor(&pool).execute(&job, nightly()).await.unwrap();

    assert_eq!(h.fakes.archiver.sources_present_at_create(), vec![vec![true]]);
}

#[sqlx::test(migrations = "../db/migrations")]
async fn hook_failures_do_not_fail_the_run(pool: SqlitePool) {
    let h = Harness::new();
    let mut input = job_input("nightly");
    input.pre_command = Some("exit 3".into());
    input.post_command = Some("false".into());
    let job = store_job(&pool, &input).await;

    h.executor(&pool).execute(&job, nightly()).await.unwrap();

    assert_eq!(only_run(&pool, job.id).await.status, RunStatus::Completed);
}

#[sqlx::test(migrations = "../db/migrations")]
async fn post_command_is_skipped_after_a_failure(pool: SqlitePool) {
    let h = Harness::new();
    let marker = h.root.path().join("post-ran");
    let mut input = job_input("nightly");
    input.post_command = Some(format!("touch '{}'", marker.display()));
    let job = store_job(&pool, &input).await;
    h.fakes.archiver.fail(ArchiverOp::Create, 2);

    h.executor(&pool).execute(&job, nightly()).await.unwrap_err();

    assert!(!marker.exists());
}

#[sqlx::test(migrations = "../db/migrations")]
async fn post_command_runs_after_success(pool: SqlitePool) {
    let h = Harness::new();
    let marker = h.root.path().join("post-ran");
    let mut input = job_input("nightly");
    input.post_command = Some(format!("touch '{}'", marker.display()));
    let job = store_job(&pool, &input).await;

    h.executor(&pool).execute(&job, nightly()).await.unwrap();

    assert!(marker.exists());
}
