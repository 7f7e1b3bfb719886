//! The in-process set of jobs with a pipeline in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vaultkeep_core::types::DbId;

/// Job ids currently dispatched. Shared by scheduled and manual dispatch.
#[derive(Debug, Clone, Default)]
pub struct RunningJobs {
    inner: Arc<Mutex<HashSet<DbId>>>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `job_id` running. Returns `None` if it already is.
    ///
    /// The id is released when the returned guard drops, on every exit
    /// path of the task holding it.
    pub fn try_claim(&self, job_id: DbId) -> Option<RunningGuard> {
        if self.lock().insert(job_id) {
            Some(RunningGuard {
                jobs: self.clone(),
                job_id,
            })
        } else {
            None
        }
    }

    pub fn contains(&self, job_id: DbId) -> bool {
        self.lock().contains(&job_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<DbId>> {
        // The set stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Membership of one job in [`RunningJobs`].
#[derive(Debug)]
pub struct RunningGuard {
    jobs: RunningJobs,
    job_id: DbId,
}

impl RunningGuard {
    pub fn job_id(&self) -> DbId {
        self.job_id
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.jobs.lock().remove(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_refused_until_release() {
        let jobs = RunningJobs::new();
        let guard = jobs.try_claim(1).unwrap();
        assert!(jobs.try_claim(1).is_none());
        assert!(jobs.contains(1));

        drop(guard);
        assert!(!jobs.contains(1));
        assert!(jobs.try_claim(1).is_some());
    }

    #[test]
    fn claims_are_per_job() {
        let jobs = RunningJobs::new();
        let _a = jobs.try_claim(1).unwrap();
        let _b = jobs.try_claim(2).unwrap();
        assert_eq!(jobs.len(), 2);
    }

    #[test]
    fn guard_releases_on_panic() {
        let jobs = RunningJobs::new();
        let shared = jobs.clone();
        let result = std::thread::spawn(move || {
            let _guard = shared.try_claim(7).unwrap();
            panic!("pipeline blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(jobs.is_empty());
    }
}
