//! Represents a bucket's configured backup targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// One of the two replication slots a bucket can fill simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupSlot {
    One,
    Two,
}

impl BackupSlot {
    /// Fixed enumeration order a sync pass walks through.
    pub const ALL: [BackupSlot; 2] = [BackupSlot::One, BackupSlot::Two];

    /// The slot number as stored in `backup_targets.backup_num`.
    pub fn number(self) -> i64 {
        match self {
            BackupSlot::One => 1,
            BackupSlot::Two => 2,
        }
    }

    /// Column of the `objects` table holding this slot's sync mark.
    pub fn mark_column(self) -> &'static str {
        match self {
            BackupSlot::One => "sync1",
            BackupSlot::Two => "sync2",
        }
    }
}

impl fmt::Display for BackupSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Lifecycle state of a backup target. Only `Start` participates in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Start,
    Stop,
    Deleted,
}

/// One configured replication destination for a bucket.
///
/// Created and edited by the bucket owner through the configuration API;
/// read-only to the engine except for `last_error`, which the coordinator
/// fills in when a target is misconfigured (revoked token, bad endpoint).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BackupTarget {
    pub id: i64,

    /// Bucket this target replicates.
    pub bucket_id: i64,

    /// Base URL of the remote backup endpoint.
    pub endpoint_url: String,

    /// Bucket name on the remote endpoint.
    pub bucket_name: String,

    /// Bucket-scoped read-write credential for the remote endpoint.
    pub bucket_token: String,

    /// Slot number, 1 or 2. At most one active target per slot.
    pub backup_num: i64,

    pub status: TargetStatus,

    pub remarks: String,

    /// Operator-visible description of the last configuration failure.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub modified_time: DateTime<Utc>,
}

impl BackupTarget {
    pub fn is_active(&self) -> bool {
        self.status == TargetStatus::Start
    }
}
