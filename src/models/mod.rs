//! Core data models for the bucket backup synchronization engine.
//!
//! These entities represent buckets, their configured backup targets and the
//! per-bucket object namespace. They map cleanly to database tables via
//! `sqlx::FromRow` and serialize naturally as JSON via `serde`.

pub mod backup;
pub mod bucket;
pub mod object;
