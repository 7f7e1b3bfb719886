//! Backup pipeline: external tool collaborators and the executor that runs
//! a job's stages in order.
//!
//! - [`archiver`]: repository init/create/prune/compact ([`BorgArchiver`]).
//! - [`dumper`]: database dumps into a self-cleaning [`DumpSet`].
//! - [`sync`]: off-site replication ([`RcloneSyncer`]).
//! - [`executor`]: [`PipelineExecutor`], one run record per execution.

pub mod archiver;
pub mod dumper;
pub mod error;
pub mod executor;
pub mod report;
pub mod settings;
pub mod sync;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use archiver::{Archiver, BorgArchiver, CreateArchive};
pub use dumper::{sweep_stale_dumps, CliDatabaseDumper, DatabaseDumper, DumpSet};
pub use error::{DumpError, PipelineError, SyncError};
pub use executor::{Collaborators, PipelineExecutor, RunSummary};
pub use settings::{PipelineSettings, SyncFailurePolicy, ToolPaths};
pub use sync::{RcloneSyncer, RepositorySyncer};
