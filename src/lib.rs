//! Bucket backup synchronization engine.
//!
//! Keeps a primary bucket and its configured backup targets eventually
//! consistent: candidate selection paged by primary-key cursor,
//! deterministic `id mod node_count` work partitioning across a worker
//! fleet, a single-shot/chunked transfer protocol with deletion
//! propagation, and a failure circuit breaker per bucket pass.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;
