//! Polling scheduler.
//!
//! Polls on a fixed cadence rather than sleeping until the next fire time.
//! Each poll runs the due-check for every job and spawns the due pipelines
//! as independent tasks, so a slow job never delays another job's
//! dispatch. A job id stays in [`RunningJobs`] from dispatch until its task
//! ends; manual triggers go through the same set.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{Timelike, Utc};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use vaultkeep_core::cron::CronExpr;
use vaultkeep_core::job::BackupJob;
use vaultkeep_core::schedule::due_tick;
use vaultkeep_core::secret::SecretBox;
use vaultkeep_core::types::{DbId, Timestamp};
use vaultkeep_db::models::job::{JobCodecError, JobSchedule};
use vaultkeep_db::repositories::{JobRepo, RunRepo};
use vaultkeep_db::DbPool;
use vaultkeep_pipeline::{report, PipelineExecutor};

use crate::running::{RunningGuard, RunningJobs};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Backup job {0} not found")]
    NotFound(DbId),

    #[error("Backup job '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Backup job '{0}' already started a run this second")]
    StartedThisSecond(String),

    #[error("Backup job {job_id} could not be loaded: {source}")]
    Job {
        job_id: DbId,
        #[source]
        source: JobCodecError,
    },

    #[error("Job store unavailable: {0}")]
    Store(#[from] sqlx::Error),
}

/// Result of a manual trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Dispatched { job_id: DbId, started_at: Timestamp },
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    /// How long after a fire time the tick still counts as due.
    pub grace_window: Duration,
    /// Sleep after a poll that could not read the job store.
    pub error_backoff: Duration,
    pub max_concurrent_jobs: usize,
}

pub struct Scheduler {
    pool: DbPool,
    secrets: SecretBox,
    executor: Arc<PipelineExecutor>,
    settings: SchedulerSettings,
    running: RunningJobs,
    /// Last tick dispatched per job. Covers outcomes that leave no run
    /// record, such as a pre-flight rejection.
    dispatched_ticks: Mutex<HashMap<DbId, Timestamp>>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(
        pool: DbPool,
        secrets: SecretBox,
        executor: Arc<PipelineExecutor>,
        settings: SchedulerSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            pool,
            secrets,
            executor,
            settings,
            running: RunningJobs::new(),
            dispatched_ticks: Mutex::new(HashMap::new()),
            permits,
            tracker: TaskTracker::new(),
        }
    }

    pub fn running(&self) -> &RunningJobs {
        &self.running
    }

    /// Run the polling loop until `cancel` fires.
    ///
    /// A failed poll is logged and followed by the error backoff. Nothing a
    /// single job does stops the loop.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            grace_window_secs = self.settings.grace_window.as_secs(),
            max_concurrent_jobs = self.settings.max_concurrent_jobs,
            "Scheduler started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.poll_once(Utc::now()).await {
                        Ok(dispatched) if !dispatched.is_empty() => {
                            tracing::debug!(count = dispatched.len(), "Poll dispatched jobs");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                backoff_secs = self.settings.error_backoff.as_secs(),
                                "Scheduler poll failed, backing off",
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    tracing::info!("Scheduler shutting down");
                                    break;
                                }
                                _ = tokio::time::sleep(self.settings.error_backoff) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    /// Evaluate every job at `now` and dispatch the due ones.
    ///
    /// Returns the ids of the dispatched jobs.
    pub async fn poll_once(&self, now: Timestamp) -> Result<Vec<DbId>, SchedulerError> {
        let schedules = JobRepo::list_schedules(&self.pool).await?;
        let mut dispatched = Vec::new();

        for schedule in schedules {
            let Some(tick) = self.due_tick(&schedule, now) else {
                continue;
            };
            if self.running.contains(schedule.id) || self.already_dispatched(schedule.id, tick) {
                continue;
            }
            if RunRepo::has_run_between(&self.pool, schedule.id, tick, now).await? {
                continue;
            }
            let Some(guard) = self.running.try_claim(schedule.id) else {
                continue;
            };

            let job = match self.load_job(schedule.id).await {
                Ok(job) => job,
                Err(SchedulerError::Store(e)) => return Err(SchedulerError::Store(e)),
                Err(e) => {
                    tracing::error!(
                        job_id = schedule.id,
                        job_name = %schedule.name,
                        error = %e,
                        "Skipping unreadable job",
                    );
                    self.mark_dispatched(schedule.id, tick);
                    self.executor
                        .notifier()
                        .send(
                            &report::failure_subject(&schedule.name),
                            &report::failure_body(&schedule.name, now, &e.to_string()),
                            true,
                        )
                        .await;
                    continue;
                }
            };

            tracing::info!(
                job_id = job.id,
                job_name = %job.name,
                tick = %tick,
                "Job due, dispatching",
            );
            self.mark_dispatched(job.id, tick);
            dispatched.push(job.id);
            self.dispatch(job, now, guard);
        }

        Ok(dispatched)
    }

    /// Start `job_id` now, outside its schedule.
    ///
    /// Refused while a run of the same job is in flight, whether it was
    /// scheduled or triggered.
    pub async fn trigger_job_now(&self, job_id: DbId) -> Result<TriggerOutcome, SchedulerError> {
        let row = JobRepo::find_by_id(&self.pool, job_id)
            .await?
            .ok_or(SchedulerError::NotFound(job_id))?;
        let guard = self
            .running
            .try_claim(job_id)
            .ok_or_else(|| SchedulerError::AlreadyRunning(row.name.clone()))?;
        let job = row
            .open(&self.secrets)
            .map_err(|source| SchedulerError::Job { job_id, source })?;

        // Archive names carry the start second; a second run in the same
        // second would collide with the first one's archive.
        let started_at = Utc::now();
        let second = started_at.with_nanosecond(0).unwrap_or(started_at);
        if RunRepo::has_run_between(&self.pool, job_id, second, started_at).await? {
            return Err(SchedulerError::StartedThisSecond(job.name));
        }
        tracing::info!(job_id, job_name = %job.name, "Manual trigger, dispatching");
        self.dispatch(job, started_at, guard);
        Ok(TriggerOutcome::Dispatched { job_id, started_at })
    }

    /// Wait until every dispatched task has finished.
    pub async fn wait_for_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting work and wait up to `timeout` for in-flight runs.
    ///
    /// Returns `false` if runs were still going when the timeout expired.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let in_flight = self.tracker.len();
        if in_flight > 0 {
            tracing::info!(
                in_flight,
                timeout_secs = timeout.as_secs(),
                "Waiting for running backups",
            );
        }
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    in_flight = self.tracker.len(),
                    "Shutdown timeout expired with backups still running",
                );
                false
            }
        }
    }

    fn due_tick(&self, schedule: &JobSchedule, now: Timestamp) -> Option<Timestamp> {
        match CronExpr::parse(&schedule.schedule) {
            Ok(expr) => due_tick(&expr, now, self.settings.grace_window),
            Err(e) => {
                tracing::warn!(
                    job_id = schedule.id,
                    job_name = %schedule.name,
                    schedule = %schedule.schedule,
                    error = %e,
                    "Skipping job with invalid schedule",
                );
                None
            }
        }
    }

    async fn load_job(&self, job_id: DbId) -> Result<BackupJob, SchedulerError> {
        let row = JobRepo::find_by_id(&self.pool, job_id)
            .await?
            .ok_or(SchedulerError::NotFound(job_id))?;
        row.open(&self.secrets)
            .map_err(|source| SchedulerError::Job { job_id, source })
    }

    fn already_dispatched(&self, job_id: DbId, tick: Timestamp) -> bool {
        self.dispatched_ticks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .is_some_and(|last| *last >= tick)
    }

    fn mark_dispatched(&self, job_id: DbId, tick: Timestamp) {
        self.dispatched_ticks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, tick);
    }

    fn dispatch(&self, job: BackupJob, started_at: Timestamp, guard: RunningGuard) {
        let executor = Arc::clone(&self.executor);
        let permits = Arc::clone(&self.permits);
        let pool = self.pool.clone();

        self.tracker.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            let outcome = AssertUnwindSafe(executor.execute(&job, started_at))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(summary)) => {
                    tracing::debug!(
                        job_id = job.id,
                        run_id = summary.run_id,
                        "Pipeline task finished",
                    );
                }
                Ok(Err(e)) => {
                    // Already recorded and notified by the executor.
                    tracing::warn!(
                        job_id = job.id,
                        job_name = %job.name,
                        error = %e,
                        "Pipeline task failed",
                    );
                }
                Err(panic) => {
                    let message = format!("Pipeline panicked: {}", panic_message(panic.as_ref()));
                    tracing::error!(
                        job_id = job.id,
                        job_name = %job.name,
                        error = %message,
                        "Pipeline task panicked",
                    );
                    if let Err(e) =
                        RunRepo::fail_running_for_job(&pool, job.id, Utc::now(), &message).await
                    {
                        tracing::error!(
                            job_id = job.id,
                            error = %e,
                            "Failed to record panicked run",
                        );
                    }
                    executor
                        .notifier()
                        .send(
                            &report::failure_subject(&job.name),
                            &report::failure_body(&job.name, started_at, &message),
                            true,
                        )
                        .await;
                }
            }
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
