//! Database dumps for the optional database stage.
//!
//! Dumps are written into a fresh temporary directory under the dump root.
//! The directory belongs to the returned [`DumpSet`] and is removed by
//! [`DumpSet::cleanup`] or, failing that, when the set is dropped. A dump
//! that fails part-way drops its set before the error is returned, so no
//! partial files outlive the call.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::{NamedTempFile, TempDir};
use vaultkeep_core::job::{DatabaseDumpConfig, DatabaseEngine};
use vaultkeep_core::process::{ProcessError, ProcessRunner, ProcessSpec, StageMetrics};

use crate::error::DumpError;
use crate::settings::ToolPaths;

/// Bound on a single-table dump.
pub const TABLE_DUMP_TIMEOUT: Duration = Duration::from_secs(300);

/// Bound on a whole-database dump.
pub const DATABASE_DUMP_TIMEOUT: Duration = Duration::from_secs(600);

/// Bound on a connection test.
pub const CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Leftovers older than this are removed at startup.
pub const STALE_DUMP_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const DUMP_STAMP_FORMAT: &str = "%Y%m%d_%H%M%SZ";

// ---------------------------------------------------------------------------
// DumpSet
// ---------------------------------------------------------------------------

/// Dump files from one run and the directory that holds them.
#[derive(Debug)]
pub struct DumpSet {
    dir: Option<TempDir>,
    files: Vec<PathBuf>,
    metrics: Option<StageMetrics>,
}

impl DumpSet {
    pub fn new(dir: TempDir) -> Self {
        Self {
            dir: Some(dir),
            files: Vec::new(),
            metrics: None,
        }
    }

    /// Directory the dumps are written to, until cleanup.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.path())
    }

    /// Add a finished dump and fold its metrics into the set's.
    pub fn push(&mut self, file: PathBuf, metrics: StageMetrics) {
        self.files.push(file);
        self.metrics = Some(match self.metrics {
            Some(existing) => existing.combine(metrics),
            None => metrics,
        });
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Summed duration and maximum peak over every dump.
    pub fn metrics(&self) -> Option<StageMetrics> {
        self.metrics
    }

    /// Remove the dump directory now. Safe to call more than once.
    pub fn cleanup(&mut self) -> std::io::Result<()> {
        self.files.clear();
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DatabaseDumper: Send + Sync {
    /// Dump the configured database, or each listed table, to files.
    async fn create_dumps(&self, config: &DatabaseDumpConfig) -> Result<DumpSet, DumpError>;

    /// Check that the server accepts the credentials. Never fails; the
    /// outcome is the returned flag and message.
    async fn test_connection(&self, config: &DatabaseDumpConfig) -> (bool, String);
}

// ---------------------------------------------------------------------------
// CliDatabaseDumper
// ---------------------------------------------------------------------------

/// Dumps through `pg_dump` and `mysqldump`.
pub struct CliDatabaseDumper {
    runner: ProcessRunner,
    dump_dir: PathBuf,
    pg_dump: String,
    psql: String,
    mysqldump: String,
    mysql: String,
}

impl CliDatabaseDumper {
    pub fn new(runner: ProcessRunner, dump_dir: impl Into<PathBuf>, tools: &ToolPaths) -> Self {
        Self {
            runner,
            dump_dir: dump_dir.into(),
            pg_dump: tools.pg_dump.clone(),
            psql: tools.psql.clone(),
            mysqldump: tools.mysqldump.clone(),
            mysql: tools.mysql.clone(),
        }
    }

    fn pg_dump_spec(
        &self,
        config: &DatabaseDumpConfig,
        table: Option<&str>,
        file: &Path,
    ) -> ProcessSpec {
        let mut spec = pg_connection(ProcessSpec::new(&self.pg_dump), config);
        if let Some(table) = table {
            spec = spec.args(["-t", table]);
        }
        spec.args(["--no-password", "--clean", "--if-exists", "-f"])
            .arg(file.display().to_string())
    }

    fn mysqldump_spec(
        &self,
        config: &DatabaseDumpConfig,
        table: Option<&str>,
        credentials: &Path,
        file: &Path,
    ) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.mysqldump)
            .arg(format!("--defaults-extra-file={}", credentials.display()))
            .args(["--single-transaction", "--routines", "--triggers"])
            .arg(config.database.as_str());
        if let Some(table) = table {
            spec = spec.arg(table);
        }
        spec.stdout_to(file)
    }

    /// Write a `[client]` option file readable only by us.
    fn mysql_credentials(&self, config: &DatabaseDumpConfig) -> std::io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix(".vaultkeep_client_")
            .suffix(".cnf")
            .tempfile_in(&self.dump_dir)?;
        file.write_all(mysql_option_file(config).as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    async fn run_dump(
        &self,
        spec: ProcessSpec,
        target: String,
        limit: Duration,
    ) -> Result<StageMetrics, DumpError> {
        let output = self
            .runner
            .run(&spec.timeout(limit))
            .await
            .map_err(|source| match source {
                ProcessError::Timeout { .. } => DumpError::Timeout {
                    target: target.clone(),
                    limit,
                },
                source => DumpError::Process {
                    target: target.clone(),
                    source,
                },
            })?;
        if !output.success() {
            return Err(DumpError::Failed {
                target,
                exit_code: output.exit_code,
                output: output.error_tail(),
            });
        }
        Ok(output.metrics())
    }
}

#[async_trait]
impl DatabaseDumper for CliDatabaseDumper {
    async fn create_dumps(&self, config: &DatabaseDumpConfig) -> Result<DumpSet, DumpError> {
        tokio::fs::create_dir_all(&self.dump_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix("vaultkeep_dump_")
            .tempdir_in(&self.dump_dir)?;
        let mut set = DumpSet::new(dir);
        let dir_path = set.dir().map(Path::to_path_buf).unwrap_or_default();

        let credentials = match config.engine {
            DatabaseEngine::Mariadb => Some(self.mysql_credentials(config)?),
            DatabaseEngine::Postgresql => None,
        };
        let stamp = Utc::now().format(DUMP_STAMP_FORMAT).to_string();
        let tables = dump_tables(config);
        let targets: Vec<Option<&str>> = if tables.is_empty() {
            vec![None]
        } else {
            tables.into_iter().map(Some).collect()
        };

        for table in targets {
            let file = dir_path.join(dump_file_name(config, table, &stamp));
            let spec = match &credentials {
                Some(cnf) => self.mysqldump_spec(config, table, cnf.path(), &file),
                None => {
                    let spec = self.pg_dump_spec(config, table, &file);
                    match &config.password {
                        Some(password) => spec.env("PGPASSWORD", password.expose()),
                        None => spec,
                    }
                }
            };
            let target = match table {
                Some(table) => format!("{} {}.{}", config.engine.as_str(), config.database, table),
                None => format!("{} {}", config.engine.as_str(), config.database),
            };

            tracing::info!(target = %target, "Dumping database");
            let metrics = self
                .run_dump(spec, target.clone(), dump_timeout(table))
                .await?;
            tracing::info!(
                target = %target,
                duration_secs = metrics.duration_secs,
                file = %file.display(),
                "Database dump written"
            );
            set.push(file, metrics);
        }

        Ok(set)
    }

    async fn test_connection(&self, config: &DatabaseDumpConfig) -> (bool, String) {
        let label = match config.engine {
            DatabaseEngine::Postgresql => "PostgreSQL",
            DatabaseEngine::Mariadb => "MariaDB",
        };

        // Held until the probe finishes.
        let mut _credentials = None;
        let spec = match config.engine {
            DatabaseEngine::Postgresql => {
                let spec = pg_connection(ProcessSpec::new(&self.psql), config)
                    .args(["-c", "SELECT 1", "--no-password", "-t"]);
                match &config.password {
                    Some(password) => spec.env("PGPASSWORD", password.expose()),
                    None => spec,
                }
            }
            DatabaseEngine::Mariadb => {
                if let Err(e) = tokio::fs::create_dir_all(&self.dump_dir).await {
                    return (false, format!("{label} connection test failed: {e}"));
                }
                let cnf = match self.mysql_credentials(config) {
                    Ok(cnf) => cnf,
                    Err(e) => return (false, format!("{label} connection test failed: {e}")),
                };
                let spec = ProcessSpec::new(&self.mysql)
                    .arg(format!("--defaults-extra-file={}", cnf.path().display()))
                    .args(["-e", "SELECT 1"])
                    .arg(config.database.as_str());
                _credentials = Some(cnf);
                spec
            }
        };

        match self.runner.run(&spec.timeout(CONNECTION_TEST_TIMEOUT)).await {
            Ok(output) if output.success() => (true, format!("{label} connection successful")),
            Ok(output) => (
                false,
                format!("{label} connection failed: {}", output.error_tail()),
            ),
            Err(ProcessError::Timeout { .. }) => {
                (false, format!("{label} connection test timed out"))
            }
            Err(e) => (false, format!("{label} connection test failed: {e}")),
        }
    }
}

fn pg_connection(spec: ProcessSpec, config: &DatabaseDumpConfig) -> ProcessSpec {
    spec.args([
        "-h",
        config.host.as_str(),
        "-U",
        config.username.as_str(),
        "-d",
        config.database.as_str(),
    ])
    .arg("-p")
    .arg(config.port().to_string())
}

fn dump_timeout(table: Option<&str>) -> Duration {
    match table {
        Some(_) => TABLE_DUMP_TIMEOUT,
        None => DATABASE_DUMP_TIMEOUT,
    }
}

/// Listed tables with blanks dropped. Empty means the whole database.
fn dump_tables(config: &DatabaseDumpConfig) -> Vec<&str> {
    config
        .tables
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect()
}

/// `{engine}_{database}[_{table}]_{stamp}.sql`, with path-unsafe characters
/// replaced.
pub fn dump_file_name(config: &DatabaseDumpConfig, table: Option<&str>, stamp: &str) -> String {
    let table = table
        .map(|t| format!("_{}", file_safe(t)))
        .unwrap_or_default();
    format!(
        "{}_{}{}_{}.sql",
        config.engine.as_str(),
        file_safe(&config.database),
        table,
        stamp
    )
}

fn file_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Contents of a MySQL/MariaDB option file for `config`.
pub fn mysql_option_file(config: &DatabaseDumpConfig) -> String {
    let mut contents = format!(
        "[client]\nhost={}\nport={}\nuser={}\n",
        config.host,
        config.port(),
        quote_option(&config.username)
    );
    if let Some(password) = &config.password {
        contents.push_str(&format!("password={}\n", quote_option(password.expose())));
    }
    contents
}

fn quote_option(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

// ---------------------------------------------------------------------------
// Startup sweep
// ---------------------------------------------------------------------------

/// Remove entries of `dir` last modified more than `max_age` ago.
///
/// A missing directory is not an error. Entries that cannot be removed are
/// logged and skipped. Returns the number removed.
pub fn sweep_stale_dumps(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let stale = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);
        if !stale {
            continue;
        }

        let path = entry.path();
        let result = if metadata.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Removed stale dump");
                removed += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale dump")
            }
        }
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
