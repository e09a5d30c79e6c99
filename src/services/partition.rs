//! Deterministic work partitioning.
//!
//! The fleet's sole mutual-exclusion mechanism: a pure function from object
//! id to worker number. Requires a stable `node_count` across all workers
//! for the duration of a pass; no coordination otherwise.

/// Map an object id to the 1-indexed worker that owns it.
///
/// `id mod node_count`, with remainder 0 remapped to `node_count` so every
/// non-negative id lands on exactly one of workers `1..=node_count`.
pub fn owner(id: i64, node_count: u32) -> u32 {
    debug_assert!(node_count > 0);
    let rem = (id.rem_euclid(node_count as i64)) as u32;
    if rem == 0 { node_count } else { rem }
}

/// The remainder value worker `node_num` filters candidate queries by.
///
/// The highest worker index claims remainder 0, mirroring [`owner`].
pub fn partition_rem(node_num: u32, node_count: u32) -> u32 {
    if node_num == node_count { 0 } else { node_num }
}
