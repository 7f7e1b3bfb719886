//! In-memory collaborators and fixtures for exercising the executor and the
//! scheduler without borg, database clients or rclone installed.
//!
//! Enabled for this crate's tests and, through the `testing` feature, for
//! downstream crates' tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use vaultkeep_core::archive::ARCHIVE_STAMP_FORMAT;
use vaultkeep_core::job::{BackupJob, DatabaseDumpConfig, SyncConfig};
use vaultkeep_core::process::{ProcessError, ProcessOutput, ProcessRunner, StageMetrics};
use vaultkeep_core::retention::{select_kept, RetentionPolicy};
use vaultkeep_core::secret::{Secret, SecretBox};
use vaultkeep_core::stage::SyncStats;
use vaultkeep_db::models::job::CreateBackupJob;
use vaultkeep_db::repositories::JobRepo;
use vaultkeep_db::DbPool;
use vaultkeep_events::Notifier;

use crate::archiver::{Archiver, CreateArchive};
use crate::dumper::{DatabaseDumper, DumpSet};
use crate::error::{DumpError, SyncError};
use crate::executor::{Collaborators, PipelineExecutor};
use crate::settings::PipelineSettings;
use crate::sync::RepositorySyncer;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Key used to seal job secrets in tests.
pub fn secrets() -> SecretBox {
    SecretBox::from_key([7; 32])
}

/// A minimal valid job definition with its own passphrase.
pub fn job_input(name: &str) -> CreateBackupJob {
    CreateBackupJob {
        name: name.to_string(),
        schedule: "0 2 * * *".to_string(),
        compression: Default::default(),
        source_paths: vec!["/srv/data".to_string()],
        exclude_patterns: Vec::new(),
        keep_daily: 7,
        keep_monthly: 6,
        keep_yearly: 1,
        pre_command: None,
        post_command: None,
        database: None,
        sync: None,
        passphrase: Some(Secret::new("test-passphrase")),
    }
}

/// Insert `input` and return the opened job.
pub async fn store_job(pool: &DbPool, input: &CreateBackupJob) -> BackupJob {
    let secrets = secrets();
    let sealed = input.seal(&secrets).expect("seal job");
    let row = JobRepo::create(pool, input, &sealed)
        .await
        .expect("insert job");
    row.open(&secrets).expect("open job")
}

fn fake_output(exit_code: i32) -> ProcessOutput {
    ProcessOutput {
        exit_code,
        stdout: String::new(),
        stderr: if exit_code == 0 {
            String::new()
        } else {
            format!("fake failure (exit {exit_code})")
        },
        duration: Duration::from_millis(10),
        peak_memory_bytes: Some(32 * 1024 * 1024),
    }
}

// ---------------------------------------------------------------------------
// Archiver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiverOp {
    Init,
    Create,
    Prune,
    Compact,
}

/// One recorded archiver invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiverCall {
    Init {
        repository: PathBuf,
    },
    Create {
        repository: PathBuf,
        archive: String,
        sources: Vec<String>,
        passphrase: String,
    },
    Prune {
        repository: PathBuf,
        glob: String,
        retention: RetentionPolicy,
    },
    Compact {
        repository: PathBuf,
    },
}

#[derive(Default)]
struct ArchiverState {
    repositories: HashMap<PathBuf, Vec<String>>,
    calls: Vec<ArchiverCall>,
    failures: HashMap<ArchiverOp, i32>,
    fail_archives_containing: Option<String>,
    create_delay: Option<Duration>,
    panic_on_create: bool,
    sources_present_at_create: Vec<Vec<bool>>,
}

/// Keeps repositories as lists of archive names. Prune applies the real
/// retention selection to the stamps in the names.
#[derive(Default)]
pub struct FakeArchiver {
    state: Mutex<ArchiverState>,
}

impl FakeArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `op` exit with `exit_code`.
    pub fn fail(&self, op: ArchiverOp, exit_code: i32) {
        self.state.lock().unwrap().failures.insert(op, exit_code);
    }

    /// Make `create` exit 2 for archive names containing `pattern`.
    pub fn fail_archives_containing(&self, pattern: &str) {
        self.state.lock().unwrap().fail_archives_containing = Some(pattern.to_string());
    }

    /// Hold every `create` for `delay` before it returns.
    pub fn delay_create(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = Some(delay);
    }

    pub fn panic_on_create(&self) {
        self.state.lock().unwrap().panic_on_create = true;
    }

    /// Create an initialized repository holding `archives`.
    pub fn seed(&self, repository: &Path, archives: &[String]) {
        self.state
            .lock()
            .unwrap()
            .repositories
            .insert(repository.to_path_buf(), archives.to_vec());
    }

    /// Archive names in `repository`, sorted.
    pub fn archives(&self, repository: &Path) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names = state
            .repositories
            .get(repository)
            .cloned()
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn calls(&self) -> Vec<ArchiverCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// For each `create`, whether each source path existed at call time.
    pub fn sources_present_at_create(&self) -> Vec<Vec<bool>> {
        self.state.lock().unwrap().sources_present_at_create.clone()
    }

    fn failure(&self, op: ArchiverOp) -> Option<i32> {
        self.state.lock().unwrap().failures.get(&op).copied()
    }
}

#[async_trait]
impl Archiver for FakeArchiver {
    async fn repository_exists(&self, repository: &Path) -> bool {
        self.state
            .lock()
            .unwrap()
            .repositories
            .contains_key(repository)
    }

    async fn init(
        &self,
        repository: &Path,
        _passphrase: &Secret,
    ) -> Result<ProcessOutput, ProcessError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ArchiverCall::Init {
            repository: repository.to_path_buf(),
        });
        if let Some(code) = state.failures.get(&ArchiverOp::Init).copied() {
            return Ok(fake_output(code));
        }
        state
            .repositories
            .entry(repository.to_path_buf())
            .or_default();
        Ok(fake_output(0))
    }

    async fn create(
        &self,
        request: &CreateArchive<'_>,
        passphrase: &Secret,
    ) -> Result<ProcessOutput, ProcessError> {
        let (delay, panic) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(ArchiverCall::Create {
                repository: request.repository.to_path_buf(),
                archive: request.archive.to_string(),
                sources: request.sources.clone(),
                passphrase: passphrase.expose().to_string(),
            });
            state.sources_present_at_create.push(
                request
                    .sources
                    .iter()
                    .map(|s| Path::new(s).exists())
                    .collect(),
            );
            (state.create_delay, state.panic_on_create)
        };
        if panic {
            panic!("fake archiver panicked during create");
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(code) = self.failure(ArchiverOp::Create) {
            return Ok(fake_output(code));
        }
        let mut state = self.state.lock().unwrap();
        if let Some(pattern) = &state.fail_archives_containing {
            if request.archive.contains(pattern.as_str()) {
                return Ok(fake_output(2));
            }
        }
        match state.repositories.get_mut(request.repository) {
            // "Archive already exists"
            Some(archives) if archives.iter().any(|a| a == request.archive) => {
                Ok(fake_output(2))
            }
            Some(archives) => {
                archives.push(request.archive.to_string());
                Ok(fake_output(0))
            }
            None => Ok(fake_output(2)),
        }
    }

    async fn prune(
        &self,
        repository: &Path,
        glob: &str,
        retention: &RetentionPolicy,
        _passphrase: &Secret,
    ) -> Result<ProcessOutput, ProcessError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ArchiverCall::Prune {
            repository: repository.to_path_buf(),
            glob: glob.to_string(),
            retention: *retention,
        });
        if let Some(code) = state.failures.get(&ArchiverOp::Prune).copied() {
            return Ok(fake_output(code));
        }
        let Some(archives) = state.repositories.get_mut(repository) else {
            return Ok(fake_output(2));
        };

        let prefix = glob.strip_suffix("[0-9]*").unwrap_or(glob);
        let matching: Vec<(usize, chrono::DateTime<chrono::Utc>)> = archives
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                let stamp = name.strip_prefix(prefix)?;
                NaiveDateTime::parse_from_str(stamp, ARCHIVE_STAMP_FORMAT)
                    .ok()
                    .map(|dt| (i, dt.and_utc()))
            })
            .collect();
        let stamps: Vec<_> = matching.iter().map(|(_, ts)| *ts).collect();
        let kept = select_kept(&stamps, retention);
        let doomed: Vec<usize> = matching
            .iter()
            .enumerate()
            .filter(|(pos, _)| !kept.contains(pos))
            .map(|(_, (i, _))| *i)
            .collect();
        let mut index = 0;
        archives.retain(|_| {
            let keep = !doomed.contains(&index);
            index += 1;
            keep
        });
        Ok(fake_output(0))
    }

    async fn compact(
        &self,
        repository: &Path,
        _passphrase: &Secret,
    ) -> Result<ProcessOutput, ProcessError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ArchiverCall::Compact {
            repository: repository.to_path_buf(),
        });
        let code = state
            .failures
            .get(&ArchiverOp::Compact)
            .copied()
            .unwrap_or(0);
        Ok(fake_output(code))
    }

    fn accepts_exit(&self, exit_code: i32) -> bool {
        (0..=1).contains(&exit_code)
    }
}

// ---------------------------------------------------------------------------
// Dumper
// ---------------------------------------------------------------------------

/// Writes placeholder dump files under a temporary directory.
pub struct FakeDumper {
    dump_root: PathBuf,
    file_count: usize,
    fail: Mutex<bool>,
    created: Mutex<Vec<PathBuf>>,
}

impl FakeDumper {
    pub fn new(dump_root: impl Into<PathBuf>) -> Self {
        Self {
            dump_root: dump_root.into(),
            file_count: 1,
            fail: Mutex::new(false),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn with_file_count(mut self, count: usize) -> Self {
        self.file_count = count;
        self
    }

    pub fn fail(&self) {
        *self.fail.lock().unwrap() = true;
    }

    /// Every dump file handed out so far.
    pub fn created_files(&self) -> Vec<PathBuf> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatabaseDumper for FakeDumper {
    async fn create_dumps(&self, config: &DatabaseDumpConfig) -> Result<DumpSet, DumpError> {
        if *self.fail.lock().unwrap() {
            return Err(DumpError::Failed {
                target: config.database.clone(),
                exit_code: 1,
                output: "fake dump failure".to_string(),
            });
        }
        let dir = tempfile::Builder::new()
            .prefix("vaultkeep_dump_")
            .tempdir_in(&self.dump_root)?;
        let mut set = DumpSet::new(dir);
        for n in 0..self.file_count {
            let path = set
                .dir()
                .map(|d| d.join(format!("{}_{n}.sql", config.database)))
                .ok_or_else(|| std::io::Error::other("dump directory missing"))?;
            std::fs::write(&path, b"-- dump\n")?;
            self.created.lock().unwrap().push(path.clone());
            set.push(
                path,
                StageMetrics {
                    duration_secs: 0.5,
                    peak_memory_mb: 16.0,
                },
            );
        }
        Ok(set)
    }

    async fn test_connection(&self, _config: &DatabaseDumpConfig) -> (bool, String) {
        (true, "Connection successful".to_string())
    }
}

// ---------------------------------------------------------------------------
// Syncer
// ---------------------------------------------------------------------------

pub struct FakeSyncer {
    outcome: Option<SyncStats>,
    calls: Mutex<Vec<PathBuf>>,
}

impl FakeSyncer {
    pub fn succeeding(stats: SyncStats) -> Self {
        Self {
            outcome: Some(stats),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            outcome: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Repositories passed to `sync_repository`.
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RepositorySyncer for FakeSyncer {
    async fn sync_repository(
        &self,
        _config: &SyncConfig,
        repository: &Path,
    ) -> Result<SyncStats, SyncError> {
        self.calls.lock().unwrap().push(repository.to_path_buf());
        self.outcome.ok_or_else(|| SyncError::Failed {
            exit_code: 1,
            output: "fake sync failure".to_string(),
        })
    }

    async fn test_connection(&self, _config: &SyncConfig) -> (bool, String) {
        (self.outcome.is_some(), "fake".to_string())
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub subject: String,
    pub body: String,
    pub is_error: bool,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, subject: &str, body: &str, is_error: bool) {
        self.sent.lock().unwrap().push(SentNotification {
            subject: subject.to_string(),
            body: body.to_string(),
            is_error,
        });
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// One of each fake, shared so tests can inspect them after a run.
pub struct Fakes {
    pub archiver: Arc<FakeArchiver>,
    pub dumper: Arc<FakeDumper>,
    pub syncer: Arc<FakeSyncer>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Fakes {
    pub fn new(dump_root: impl Into<PathBuf>) -> Self {
        Self {
            archiver: Arc::new(FakeArchiver::new()),
            dumper: Arc::new(FakeDumper::new(dump_root)),
            syncer: Arc::new(FakeSyncer::succeeding(SyncStats {
                bytes_transferred: 1024,
                file_count: 3,
                elapsed: Duration::from_secs(2),
            })),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn with_dumper(mut self, dumper: FakeDumper) -> Self {
        self.dumper = Arc::new(dumper);
        self
    }

    pub fn with_syncer(mut self, syncer: FakeSyncer) -> Self {
        self.syncer = Arc::new(syncer);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            archiver: self.archiver.clone(),
            dumper: self.dumper.clone(),
            syncer: self.syncer.clone(),
            notifier: self.notifier.clone(),
        }
    }

    pub fn executor(&self, pool: DbPool, settings: PipelineSettings) -> PipelineExecutor {
        PipelineExecutor::new(
            pool,
            self.collaborators(),
            ProcessRunner::new(Duration::from_millis(50)),
            settings,
        )
    }
}
