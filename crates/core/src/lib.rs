//! Domain logic shared by every vaultkeep crate.
//!
//! Nothing in here touches the database. The scheduler, the pipeline and
//! the store all build on these types and pure functions.

pub mod archive;
pub mod cron;
pub mod error;
pub mod job;
pub mod process;
pub mod retention;
pub mod schedule;
pub mod secret;
pub mod stage;
pub mod types;
