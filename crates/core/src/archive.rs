//! Archive naming inside a job's repository.
//!
//! Every archive name is `{job}_{stamp}` for source snapshots and
//! `{job}_db_{stamp}` for database dumps, where `stamp` is the UTC second
//! the run started (`%Y%m%d%H%M%SZ`). Prune globs are anchored on the first
//! digit of the stamp so the two namespaces never overlap.

use chrono::NaiveDateTime;

use crate::types::Timestamp;

/// strftime pattern for the archive timestamp suffix.
pub const ARCHIVE_STAMP_FORMAT: &str = "%Y%m%d%H%M%SZ";

/// Which set of archives within a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveNamespace {
    /// Snapshots of the job's source paths.
    Files,
    /// Snapshots of the job's database dumps.
    Database,
}

impl ArchiveNamespace {
    fn prefix(self, job_name: &str) -> String {
        match self {
            Self::Files => format!("{job_name}_"),
            Self::Database => format!("{job_name}_db_"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Database => "database",
        }
    }
}

/// Build the archive name for a run that started at `started_at`.
pub fn archive_name(job_name: &str, namespace: ArchiveNamespace, started_at: Timestamp) -> String {
    format!(
        "{}{}",
        namespace.prefix(job_name),
        started_at.format(ARCHIVE_STAMP_FORMAT)
    )
}

/// Glob passed to the archiving tool's prune so it only sees this namespace.
pub fn archive_glob(job_name: &str, namespace: ArchiveNamespace) -> String {
    format!("{}[0-9]*", namespace.prefix(job_name))
}

/// Recover the timestamp from an archive name in the given namespace.
///
/// Returns `None` for names that belong to another job or namespace.
pub fn parse_archive_stamp(
    job_name: &str,
    namespace: ArchiveNamespace,
    archive: &str,
) -> Option<Timestamp> {
    let stamp = archive.strip_prefix(&namespace.prefix(job_name))?;
    NaiveDateTime::parse_from_str(stamp, ARCHIVE_STAMP_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}
