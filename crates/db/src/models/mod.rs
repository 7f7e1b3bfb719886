//! Row structs and DTOs.
//!
//! Each submodule contains a `FromRow` struct matching the table row and the
//! `Deserialize` DTOs used to write it.

pub mod job;
pub mod run;
