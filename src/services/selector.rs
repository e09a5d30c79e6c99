//! Candidate selection — the read side of the sync engine.
//!
//! Both selectors are single range queries composed once from an explicit
//! predicate, paged by primary-key cursor. They never load unfiltered rows
//! into memory and never raise for "no results"; an empty page ends the
//! pass.

use crate::models::{
    backup::{BackupSlot, BackupTarget, TargetStatus},
    bucket::Bucket,
    object::ObjectRecord,
};
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;

/// Where a candidate page starts.
///
/// Id paging is the default; size paging serves the smallest-objects-first
/// mode. Both advance strictly past the last row seen, so a failing object
/// is never re-selected within a pass.
#[derive(Clone, Copy, Debug)]
pub enum PageCursor {
    /// Objects with `id > cursor`, ordered by id ascending.
    IdAfter(i64),
    /// Objects past `(size, id)` in size-then-id order, so small objects
    /// come first and equal sizes page by id.
    SizeIdAfter { size: i64, id: i64 },
}

impl PageCursor {
    /// The cursor a fresh bucket pass starts from.
    pub fn start(small_size_first: bool) -> Self {
        if small_size_first {
            PageCursor::SizeIdAfter { size: 0, id: 0 }
        } else {
            PageCursor::IdAfter(0)
        }
    }

    /// The same ordering, positioned just past `obj`.
    pub fn advance(self, obj: &ObjectRecord) -> Self {
        match self {
            PageCursor::IdAfter(_) => PageCursor::IdAfter(obj.id),
            PageCursor::SizeIdAfter { .. } => PageCursor::SizeIdAfter {
                size: obj.size,
                id: obj.id,
            },
        }
    }
}

/// Predicate for one candidate-object page, translated into a single range
/// query against the bucket's object table.
#[derive(Clone, Debug)]
pub struct CandidateQuery {
    pub bucket_id: i64,
    pub slot: BackupSlot,
    pub cursor: PageCursor,
    pub limit: i64,
    /// Fleet size for the `id % div = rem` partition filter.
    pub partition_div: u32,
    /// Remainder this worker claims; 0 stands for the highest worker index.
    pub partition_rem: u32,
    /// Objects modified after this instant are still quiescing and skipped.
    pub quiescence_cutoff: DateTime<Utc>,
}

impl CandidateQuery {
    /// The cutoff instant for a quiescence window of `minutes` before `now`.
    pub fn cutoff(now: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
        now - TimeDelta::minutes(minutes)
    }
}

/// Read-only selection queries plus the sync-mark write, shared by the
/// coordinator and the transfer protocol.
#[derive(Clone)]
pub struct CandidateSelector {
    db: Arc<SqlitePool>,
}

impl CandidateSelector {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Buckets owning at least one backup target with matching slot and
    /// `status = 'start'`, `id > cursor_id`, ordered by id ascending.
    ///
    /// `names` restricts the pass to specific buckets when non-empty.
    pub async fn list_buckets_with_active_target(
        &self,
        slot: BackupSlot,
        cursor_id: i64,
        limit: i64,
        names: &[String],
    ) -> sqlx::Result<Vec<Bucket>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT DISTINCT buckets.id, buckets.name, buckets.created_at \
             FROM buckets \
             INNER JOIN backup_targets ON backup_targets.bucket_id = buckets.id \
             WHERE backup_targets.backup_num = ",
        );
        builder.push_bind(slot.number());
        builder.push(" AND backup_targets.status = ");
        builder.push_bind(TargetStatus::Start);
        builder.push(" AND buckets.id > ");
        builder.push_bind(cursor_id);

        if !names.is_empty() {
            builder.push(" AND buckets.name IN (");
            let mut separated = builder.separated(", ");
            for name in names {
                separated.push_bind(name);
            }
            builder.push(")");
        }

        builder.push(" ORDER BY buckets.id ASC LIMIT ");
        builder.push_bind(limit);

        builder.build_query_as().fetch_all(&*self.db).await
    }

    /// The latest target row for a bucket's slot, if any. The coordinator
    /// re-reads this between pages so a target stopped mid-pass stops the
    /// bucket's pass.
    pub async fn fetch_target(
        &self,
        bucket_id: i64,
        slot: BackupSlot,
    ) -> sqlx::Result<Option<BackupTarget>> {
        sqlx::query_as::<_, BackupTarget>(
            "SELECT id, bucket_id, endpoint_url, bucket_name, bucket_token, backup_num, \
                    status, remarks, last_error, created_at, modified_time \
             FROM backup_targets \
             WHERE bucket_id = ? AND backup_num = ? \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(bucket_id)
        .bind(slot.number())
        .fetch_optional(&*self.db)
        .await
    }

    /// Up to `limit` sync candidates for one bucket and slot: file objects
    /// past the page cursor, stale relative to the slot's mark, quiesced,
    /// and belonging to the calling worker's partition. Ordered per the
    /// cursor variant.
    pub async fn list_candidates(
        &self,
        query: &CandidateQuery,
    ) -> sqlx::Result<Vec<ObjectRecord>> {
        let mark = query.slot.mark_column();

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, bucket_id, key, is_file, size, content_md5, updated_at, sync1, sync2 \
             FROM objects WHERE bucket_id = ",
        );
        builder.push_bind(query.bucket_id);
        builder.push(" AND is_file = 1");
        match query.cursor {
            PageCursor::IdAfter(id) => {
                builder.push(" AND id > ");
                builder.push_bind(id);
            }
            PageCursor::SizeIdAfter { size, id } => {
                builder.push(" AND (size > ");
                builder.push_bind(size);
                builder.push(" OR (size = ");
                builder.push_bind(size);
                builder.push(" AND id > ");
                builder.push_bind(id);
                builder.push("))");
            }
        }
        builder.push(" AND updated_at <= ");
        builder.push_bind(query.quiescence_cutoff);
        builder.push(format!(" AND ({mark} IS NULL OR updated_at > {mark})"));

        if query.partition_div > 1 {
            builder.push(" AND (id % ");
            builder.push_bind(query.partition_div as i64);
            builder.push(") = ");
            builder.push_bind(query.partition_rem as i64);
        }

        match query.cursor {
            PageCursor::IdAfter(_) => builder.push(" ORDER BY id ASC LIMIT "),
            PageCursor::SizeIdAfter { .. } => builder.push(" ORDER BY size ASC, id ASC LIMIT "),
        };
        builder.push_bind(query.limit);

        builder.build_query_as().fetch_all(&*self.db).await
    }

    /// Record a confirmed successful sync. The sole sync-mark write in the
    /// engine, called only after the remote has acknowledged receipt.
    pub async fn mark_synced(
        &self,
        object_id: i64,
        slot: BackupSlot,
        at: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        let sql = format!("UPDATE objects SET {} = ? WHERE id = ?", slot.mark_column());
        sqlx::query(&sql)
            .bind(at)
            .bind(object_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Surface an unrecoverable configuration problem on the target record
    /// for operators, instead of crashing the worker.
    pub async fn record_target_error(&self, target_id: i64, message: &str) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE backup_targets SET last_error = ?, modified_time = ? WHERE id = ?",
        )
        .bind(message)
        .bind(Utc::now())
        .bind(target_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}
