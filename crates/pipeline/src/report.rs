//! Subjects and bodies for run notifications.

use vaultkeep_core::stage::{RunMetrics, SyncStats};
use vaultkeep_core::types::Timestamp;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

pub fn success_subject(job_name: &str) -> String {
    format!("Backup completed: {job_name}")
}

pub fn failure_subject(job_name: &str) -> String {
    format!("Backup failed: {job_name}")
}

/// Body listing every executed stage with its duration and peak memory.
pub fn success_body(
    job_name: &str,
    started_at: Timestamp,
    finished_at: Timestamp,
    metrics: &RunMetrics,
) -> String {
    let mut body = format!(
        "Backup job '{job_name}' completed successfully.\n\n\
         Started:  {}\n\
         Finished: {}\n\
         Duration: {}s\n\n\
         Stages:\n",
        started_at.format(TIME_FORMAT),
        finished_at.format(TIME_FORMAT),
        (finished_at - started_at).num_seconds().max(0),
    );
    for (stage, m) in metrics.recorded() {
        body.push_str(&format!(
            "  {:<11} {:>8.1}s  {:>8.1} MB\n",
            stage.as_str(),
            m.duration_secs,
            m.peak_memory_mb
        ));
    }
    if let Some(sync) = &metrics.sync {
        body.push_str(&format!("\nSync: {}\n", describe_sync(sync)));
    }
    body
}

pub fn failure_body(job_name: &str, started_at: Timestamp, error: &str) -> String {
    format!(
        "Backup job '{job_name}' failed.\n\n\
         Started: {}\n\
         Error: {error}\n",
        started_at.format(TIME_FORMAT),
    )
}

fn describe_sync(stats: &SyncStats) -> String {
    format!(
        "{} in {} file(s), {:.1}s",
        human_bytes(stats.bytes_transferred),
        stats.file_count,
        stats.elapsed.as_secs_f64()
    )
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
