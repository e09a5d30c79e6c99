//! Represents an object (file or directory entry) in a bucket's namespace.

use crate::models::backup::BackupSlot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One entry of a bucket's object table.
///
/// The engine reads everything and writes only the per-slot sync marks,
/// and those only after the remote has acknowledged a transfer.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectRecord {
    /// Monotonic id assigned by the storage engine. Drives both cursor
    /// paging and partition assignment.
    pub id: i64,

    pub bucket_id: i64,

    /// Full path of the object within the bucket.
    pub key: String,

    /// Directories never synchronize.
    pub is_file: bool,

    /// Size in bytes as recorded at last write.
    pub size: i64,

    /// Cached hex MD5 of the content; absent for objects written through
    /// paths that do not compute it (e.g. ranged multipart writes).
    pub content_md5: Option<String>,

    /// Timestamp of the last content modification.
    pub updated_at: DateTime<Utc>,

    /// Last confirmed successful sync for slot 1, if any.
    pub sync1: Option<DateTime<Utc>>,

    /// Last confirmed successful sync for slot 2, if any.
    pub sync2: Option<DateTime<Utc>>,
}

impl ObjectRecord {
    /// The sync mark for one slot.
    pub fn sync_mark(&self, slot: BackupSlot) -> Option<DateTime<Utc>> {
        match slot {
            BackupSlot::One => self.sync1,
            BackupSlot::Two => self.sync2,
        }
    }

    /// Whether this object is stale relative to `slot`, ignoring the
    /// quiescence window (which only the candidate query applies).
    pub fn is_stale_for(&self, slot: BackupSlot) -> bool {
        if !self.is_file {
            return false;
        }
        match self.sync_mark(slot) {
            None => true,
            Some(mark) => self.updated_at > mark,
        }
    }
}
