//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&SqlitePool` as the first argument.

pub mod job_repo;
pub mod run_repo;

pub use job_repo::JobRepo;
pub use run_repo::RunRepo;
