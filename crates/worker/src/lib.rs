//! Backup scheduler: polls job schedules, dispatches due pipelines, and
//! guards every job against overlapping runs.

pub mod config;
pub mod running;
pub mod scheduler;

pub use config::{ConfigError, WorkerConfig};
pub use running::{RunningGuard, RunningJobs};
pub use scheduler::{Scheduler, SchedulerError, SchedulerSettings, TriggerOutcome};
