//! Sync coordinator — drives one full pass over all active buckets and
//! slots for this worker's partition.
//!
//! Cursors advance to the last id seen in a page regardless of per-object
//! outcome, so one failing object never blocks a pass; it stays a candidate
//! and is retried on the next pass. A circuit breaker abandons a bucket's
//! pass once failures become disproportionate, bounding the cost of a
//! systemically broken target (e.g. a revoked credential).

use crate::{
    config::SyncConfig,
    models::{backup::BackupSlot, backup::BackupTarget, bucket::Bucket, object::ObjectRecord},
    services::{
        data_path::DataPath,
        partition,
        selector::{CandidateQuery, CandidateSelector, PageCursor},
        transfer::TransferClient,
    },
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::{sync::Semaphore, task::JoinSet, time::Duration};
use tracing::{debug, error, warn};

const BUCKET_PAGE: i64 = 10;
const OBJECT_PAGE: i64 = 100;

/// Consecutive selection-query failures tolerated before a loop gives up.
const MAX_QUERY_ERRORS: u32 = 5;

/// Running success/failure counts for one bucket x slot pass.
///
/// Relaxed atomics: concurrent increments may be observed slightly late by
/// the breaker check, which is acceptable for a threshold policy. A strict
/// implementation can be substituted here without touching the policy.
#[derive(Debug, Default)]
pub struct PassCounters {
    ok: AtomicU64,
    failed: AtomicU64,
}

impl PassCounters {
    pub fn record_ok(&self) {
        self.ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// `(ok_count, failed_count)` as currently visible.
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.ok.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

/// Circuit-breaker policy: fewer than 10 failures never trips (avoids
/// reacting to blips), more than 1000 always trips, otherwise trips when
/// successes stop outnumbering failures by more than 3:1.
pub fn is_unusual_failure(ok_count: u64, failed_count: u64) -> bool {
    if failed_count < 10 {
        return false;
    }
    if failed_count > 1000 {
        return true;
    }
    (ok_count as f64) / (failed_count as f64) <= 3.0
}

/// One-run coordinator value; holds its configuration and counters as
/// fields so no mutable state survives between runs.
pub struct SyncCoordinator {
    selector: CandidateSelector,
    transfer: TransferClient,
    cfg: SyncConfig,
    shutdown: Arc<AtomicBool>,
}

impl SyncCoordinator {
    pub fn new(
        db: Arc<SqlitePool>,
        data_path: DataPath,
        cfg: SyncConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let selector = CandidateSelector::new(db);
        let transfer = TransferClient::new(reqwest::Client::new(), data_path, selector.clone());
        Self {
            selector,
            transfer,
            cfg,
            shutdown,
        }
    }

    /// Construct with a caller-supplied transfer client (tests use this to
    /// shrink the chunk size).
    pub fn with_transfer(
        db: Arc<SqlitePool>,
        transfer: TransferClient,
        cfg: SyncConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            selector: CandidateSelector::new(db),
            transfer,
            cfg,
            shutdown,
        }
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Drive one full pass: every slot, every bucket with an active target,
    /// every candidate object in this worker's partition.
    pub async fn run_pass(&self) {
        for slot in BackupSlot::ALL {
            if self.shutting_down() {
                break;
            }
            debug!(slot = %slot, "start backup slot loop");
            self.loop_buckets(slot).await;
        }
    }

    async fn loop_buckets(&self, slot: BackupSlot) {
        let mut cursor = 0i64;
        let mut query_errors = 0u32;
        loop {
            if self.shutting_down() {
                break;
            }

            let buckets = match self
                .selector
                .list_buckets_with_active_target(slot, cursor, BUCKET_PAGE, &self.cfg.buckets)
                .await
            {
                Ok(buckets) => {
                    query_errors = 0;
                    buckets
                }
                Err(err) => {
                    error!(slot = %slot, error = %err, "bucket selection failed");
                    query_errors += 1;
                    if query_errors > MAX_QUERY_ERRORS {
                        break;
                    }
                    continue;
                }
            };
            if buckets.is_empty() {
                break;
            }

            for bucket in buckets {
                if self.shutting_down() {
                    return;
                }
                self.sync_bucket(&bucket, slot).await;
                // Advance regardless of the bucket's outcome.
                cursor = bucket.id;
            }
        }
    }

    /// Page through one bucket's candidates and run the transfer protocol
    /// for each object this worker owns.
    async fn sync_bucket(&self, bucket: &Bucket, slot: BackupSlot) {
        debug!(bucket_id = bucket.id, bucket = %bucket.name, slot = %slot, "start bucket pass");

        let counters = Arc::new(PassCounters::default());
        let limiter = Arc::new(Semaphore::new(self.cfg.max_threads));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut cursor = PageCursor::start(self.cfg.small_size_first);
        let mut query_errors = 0u32;

        'pages: loop {
            if self.shutting_down() {
                break;
            }

            // Re-read the target each page: a target stopped or deleted
            // mid-pass stops this bucket's pass.
            let target = match self.selector.fetch_target(bucket.id, slot).await {
                Ok(Some(target)) if target.is_active() => Arc::new(target),
                Ok(_) => {
                    debug!(bucket = %bucket.name, slot = %slot, "target gone or inactive, stopping bucket pass");
                    break;
                }
                Err(err) => {
                    error!(bucket = %bucket.name, error = %err, "target lookup failed");
                    query_errors += 1;
                    if query_errors > MAX_QUERY_ERRORS {
                        break;
                    }
                    continue;
                }
            };

            let query = CandidateQuery {
                bucket_id: bucket.id,
                slot,
                cursor,
                limit: OBJECT_PAGE,
                partition_div: self.cfg.node_count,
                partition_rem: partition::partition_rem(self.cfg.node_num, self.cfg.node_count),
                quiescence_cutoff: CandidateQuery::cutoff(Utc::now(), self.cfg.quiescence_minutes),
            };
            let objects = match self.selector.list_candidates(&query).await {
                Ok(objects) => {
                    query_errors = 0;
                    objects
                }
                Err(err) => {
                    error!(bucket = %bucket.name, error = %err, "candidate selection failed");
                    query_errors += 1;
                    if query_errors > MAX_QUERY_ERRORS {
                        break;
                    }
                    continue;
                }
            };
            if objects.is_empty() {
                break;
            }

            let page_len = objects.len() as i64;
            for obj in objects {
                if self.shutting_down() {
                    break 'pages;
                }
                // Cursor advances past every object seen, synced or not.
                cursor = cursor.advance(&obj);

                if partition::owner(obj.id, self.cfg.node_count) != self.cfg.node_num {
                    continue;
                }

                if self.cfg.multi_thread {
                    // Backpressure: blocks while the pool is saturated.
                    let permit = limiter
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore is never closed");
                    let transfer = self.transfer.clone();
                    let selector = self.selector.clone();
                    let bucket = bucket.clone();
                    let target = Arc::clone(&target);
                    let counters = Arc::clone(&counters);
                    let test_mode = self.cfg.test;
                    tasks.spawn(async move {
                        sync_one(&transfer, &selector, &bucket, &obj, &target, &counters, test_mode)
                            .await;
                        drop(permit);
                    });
                } else {
                    sync_one(
                        &self.transfer,
                        &self.selector,
                        bucket,
                        &obj,
                        &target,
                        &counters,
                        self.cfg.test,
                    )
                    .await;
                }

                let (ok, failed) = counters.snapshot();
                if is_unusual_failure(ok, failed) {
                    warn!(
                        bucket = %bucket.name,
                        slot = %slot,
                        ok,
                        failed,
                        "abandoning bucket pass, failures out of proportion"
                    );
                    break 'pages;
                }
            }

            if page_len < OBJECT_PAGE {
                break;
            }
        }

        // Drain in-flight pool tasks before leaving the bucket.
        while tasks.join_next().await.is_some() {}

        let (ok, failed) = counters.snapshot();
        debug!(
            bucket_id = bucket.id,
            bucket = %bucket.name,
            slot = %slot,
            ok,
            failed,
            "exit bucket pass"
        );
    }
}

/// Synchronize one object, recording the outcome. Errors never escape: a
/// failed object is counted, logged and left for the next pass.
async fn sync_one(
    transfer: &TransferClient,
    selector: &CandidateSelector,
    bucket: &Bucket,
    obj: &ObjectRecord,
    target: &BackupTarget,
    counters: &PassCounters,
    test_mode: bool,
) {
    debug!(
        bucket = %bucket.name,
        key = %obj.key,
        object_id = obj.id,
        size = obj.size,
        slot = target.backup_num,
        "start object sync"
    );

    if test_mode {
        tokio::time::sleep(Duration::from_secs(1)).await;
        counters.record_ok();
        return;
    }

    let started = std::time::Instant::now();
    match transfer.sync_object(bucket, obj, target).await {
        Ok(()) => {
            counters.record_ok();
            debug!(
                key = %obj.key,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "object synced"
            );
        }
        Err(err) => {
            counters.record_failure();
            error!(bucket = %bucket.name, key = %obj.key, error = %err, "object sync failed");
            if err.is_config() {
                if let Err(db_err) = selector.record_target_error(target.id, &err.to_string()).await
                {
                    error!(target_id = target.id, error = %db_err, "failed to record target error");
                }
            }
        }
    }
}
