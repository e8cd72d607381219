//! Core data models for the file store.
//!
//! They map cleanly to database tables via `sqlx::FromRow` and serialize
//! naturally as JSON via `serde`.

pub mod file;
pub mod offload_job;
