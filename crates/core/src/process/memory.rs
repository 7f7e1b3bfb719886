//! Peak resident-memory sampling for a running process tree.
//!
//! The monitor samples the summed RSS of a process and all of its
//! descendants at a fixed interval and keeps the maximum. Sampling failures
//! are ignored: a missing measurement never affects the command itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Default interval between memory samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Value reported when a process exits before any sample lands (1 MiB).
pub const MIN_REPORTED_BYTES: u64 = 1024 * 1024;

/// Background sampler bound to one child process.
pub struct PeakMemoryMonitor {
    peak: Arc<AtomicU64>,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl PeakMemoryMonitor {
    /// Start sampling `pid`. The first sample is taken immediately.
    pub fn start(pid: u32, interval: Duration) -> Self {
        let peak = Arc::new(AtomicU64::new(0));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let peak_clone = Arc::clone(&peak);

        let handle = tokio::spawn(async move {
            loop {
                let sample = tokio::task::spawn_blocking(move || sample_tree_rss(pid))
                    .await
                    .ok()
                    .flatten();
                if let Some(bytes) = sample {
                    peak_clone.fetch_max(bytes, Ordering::Relaxed);
                }
                tokio::select! {
                    _ = &mut stop_rx => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        });

        Self {
            peak,
            stop_tx,
            handle,
        }
    }

    /// Stop sampling and return the peak seen, or `None` if nothing landed.
    pub async fn stop(self) -> Option<u64> {
        let _ = self.stop_tx.send(());
        let _ = self.handle.await;
        match self.peak.load(Ordering::Relaxed) {
            0 => None,
            bytes => Some(bytes),
        }
    }
}

/// Sum of resident memory for `root` and every descendant, in bytes.
///
/// Returns `None` if `root` is no longer visible in `/proc`.
#[cfg(target_os = "linux")]
pub fn sample_tree_rss(root: u32) -> Option<u64> {
    use std::collections::HashMap;

    let page_size = procfs::page_size();
    let all_procs = procfs::process::all_processes().ok()?;

    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    let mut rss: HashMap<i32, u64> = HashMap::new();
    for proc in all_procs.flatten() {
        let Ok(stat) = proc.stat() else {
            continue;
        };
        children.entry(stat.ppid).or_default().push(stat.pid);
        rss.insert(stat.pid, stat.rss * page_size);
    }

    let root = i32::try_from(root).ok()?;
    rss.get(&root)?;

    let mut total = 0u64;
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        total += rss.get(&pid).copied().unwrap_or(0);
        if let Some(kids) = children.get(&pid) {
            stack.extend(kids.iter().copied());
        }
    }
    Some(total)
}

#[cfg(not(target_os = "linux"))]
pub fn sample_tree_rss(_root: u32) -> Option<u64> {
    None
}
