//! Shared test support: an in-process mock of the remote backup endpoint
//! and helpers for seeding the metadata database and data path.

// Each test binary compiles its own copy; not every binary uses every helper.
#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{post, put},
};
use bucket_sync_worker::{
    config::SyncConfig,
    models::object::ObjectRecord,
    services::data_path::DataPath,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::net::TcpListener;

/// In-memory remote backup endpoint implementing the wire contract the
/// transfer protocol speaks: single-shot PUT with `Content-MD5`, chunked
/// POST with offset/reset, metadata create/lookup, idempotent DELETE.
pub struct MockRemote {
    token: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    attempts: Mutex<HashMap<String, u32>>,
    fail_uploads: AtomicBool,
    fail_keys: Mutex<HashSet<String>>,
}

impl MockRemote {
    fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            objects: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            fail_uploads: AtomicBool::new(false),
            fail_keys: Mutex::new(HashSet::new()),
        }
    }

    fn full_key(bucket: &str, key: &str) -> String {
        format!("{}/{}", bucket, key.trim_matches('/'))
    }

    fn note_attempt(&self, bucket: &str, key: &str) {
        let mut attempts = self.attempts.lock().unwrap();
        *attempts.entry(Self::full_key(bucket, key)).or_insert(0) += 1;
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("BucketToken {}", self.token))
            .unwrap_or(false)
    }

    /// Make every upload request fail with a 500.
    pub fn set_failing(&self, failing: bool) {
        self.fail_uploads.store(failing, Ordering::Relaxed);
    }

    /// Make uploads of one object fail with a 500.
    pub fn set_fail_key(&self, bucket: &str, key: &str) {
        self.fail_keys
            .lock()
            .unwrap()
            .insert(Self::full_key(bucket, key));
    }

    fn should_fail(&self, bucket: &str, key: &str) -> bool {
        self.fail_uploads.load(Ordering::Relaxed)
            || self
                .fail_keys
                .lock()
                .unwrap()
                .contains(&Self::full_key(bucket, key))
    }

    pub fn object_md5(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(&Self::full_key(bucket, key))
            .map(|bytes| format!("{:x}", md5::compute(bytes)))
    }

    pub fn has_object(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&Self::full_key(bucket, key))
    }

    /// Number of distinct objects that saw at least one upload attempt.
    pub fn attempted_object_count(&self) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn attempts_for(&self, bucket: &str, key: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&Self::full_key(bucket, key))
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct ChunkQuery {
    offset: u64,
    reset: Option<bool>,
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, Json(json!({"code": "AccessDenied"}))).into_response()
}

fn md5_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("content-md5")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn put_object(
    State(remote): State<Arc<MockRemote>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if !remote.authorized(&headers) {
        return forbidden();
    }
    remote.note_attempt(&bucket, &key);
    if remote.should_fail(&bucket, &key) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let actual = format!("{:x}", md5::compute(&body));
    if md5_header(&headers).as_deref() != Some(actual.as_str()) {
        return (StatusCode::BAD_REQUEST, Json(json!({"code": "BadDigest"}))).into_response();
    }

    let full_key = MockRemote::full_key(&bucket, &key);
    let created = {
        let mut objects = remote.objects.lock().unwrap();
        objects.insert(full_key, body.to_vec()).is_none()
    };
    (StatusCode::OK, Json(json!({"created": created}))).into_response()
}

async fn post_chunk(
    State(remote): State<Arc<MockRemote>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<ChunkQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if !remote.authorized(&headers) {
        return forbidden();
    }
    remote.note_attempt(&bucket, &key);
    if remote.should_fail(&bucket, &key) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let actual = format!("{:x}", md5::compute(&body));
    if md5_header(&headers).as_deref() != Some(actual.as_str()) {
        return (StatusCode::BAD_REQUEST, Json(json!({"code": "BadDigest"}))).into_response();
    }

    let full_key = MockRemote::full_key(&bucket, &key);
    let mut objects = remote.objects.lock().unwrap();
    let entry = objects.entry(full_key).or_default();
    if query.reset.unwrap_or(false) {
        entry.clear();
    }
    let offset = query.offset as usize;
    if entry.len() < offset + body.len() {
        entry.resize(offset + body.len(), 0);
    }
    entry[offset..offset + body.len()].copy_from_slice(&body);
    (StatusCode::OK, Json(json!({}))).into_response()
}

async fn delete_object(
    State(remote): State<Arc<MockRemote>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !remote.authorized(&headers) {
        return forbidden();
    }
    let full_key = MockRemote::full_key(&bucket, &key);
    let removed = remote.objects.lock().unwrap().remove(&full_key).is_some();
    if removed {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn create_metadata(
    State(remote): State<Arc<MockRemote>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !remote.authorized(&headers) {
        return forbidden();
    }
    remote.note_attempt(&bucket, &key);
    if remote.should_fail(&bucket, &key) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let full_key = MockRemote::full_key(&bucket, &key);
    let created = {
        let mut objects = remote.objects.lock().unwrap();
        objects.entry(full_key).or_default();
        true
    };
    (StatusCode::OK, Json(json!({"created": created}))).into_response()
}

async fn get_metadata(
    State(remote): State<Arc<MockRemote>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !remote.authorized(&headers) {
        return forbidden();
    }
    let full_key = MockRemote::full_key(&bucket, &key);
    let objects = remote.objects.lock().unwrap();
    match objects.get(&full_key) {
        Some(bytes) => (
            StatusCode::OK,
            Json(json!({
                "size": bytes.len(),
                "md5": format!("{:x}", md5::compute(bytes)),
            })),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Start the mock remote on an ephemeral port. Returns its base URL and a
/// handle for assertions and failure injection.
pub async fn spawn_remote(token: &str) -> (String, Arc<MockRemote>) {
    let remote = Arc::new(MockRemote::new(token));
    let app = Router::new()
        .route(
            "/api/v2/obj/{bucket}/{*key}",
            put(put_object).post(post_chunk).delete(delete_object),
        )
        .route(
            "/api/v1/metadata/{bucket}/{*key}",
            post(create_metadata).get(get_metadata),
        )
        .layer(DefaultBodyLimit::disable())
        .with_state(Arc::clone(&remote));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), remote)
}

/// One-connection in-memory pool with the schema applied.
pub async fn setup_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    let sql = include_str!("../../migrations/0001_init.sql");
    for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(stmt).execute(&pool).await.unwrap();
    }
    Arc::new(pool)
}

pub async fn seed_bucket(pool: &SqlitePool, id: i64, name: &str) {
    sqlx::query("INSERT INTO buckets (id, name, created_at) VALUES (?, ?, ?)")
        .bind(id)
        .bind(name)
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
}

pub async fn seed_target(
    pool: &SqlitePool,
    bucket_id: i64,
    backup_num: i64,
    endpoint_url: &str,
    bucket_name: &str,
    token: &str,
    status: &str,
) -> i64 {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO backup_targets \
         (bucket_id, endpoint_url, bucket_name, bucket_token, backup_num, status, remarks, \
          created_at, modified_time) \
         VALUES (?, ?, ?, ?, ?, ?, '', ?, ?) RETURNING id",
    )
    .bind(bucket_id)
    .bind(endpoint_url)
    .bind(bucket_name)
    .bind(token)
    .bind(backup_num)
    .bind(status)
    .bind(Utc::now())
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .unwrap();
    row.0
}

/// Insert an object row and write its payload to the data path. The row's
/// `updated_at` is backdated so a zero-minute quiescence window passes.
pub async fn seed_object(
    pool: &SqlitePool,
    data_path: &DataPath,
    bucket_id: i64,
    key: &str,
    content: &[u8],
    content_md5: Option<&str>,
) -> i64 {
    let updated_at = Utc::now() - TimeDelta::seconds(5);
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO objects (bucket_id, key, is_file, size, content_md5, updated_at) \
         VALUES (?, ?, 1, ?, ?, ?) RETURNING id",
    )
    .bind(bucket_id)
    .bind(key)
    .bind(content.len() as i64)
    .bind(content_md5)
    .bind(updated_at)
    .fetch_one(pool)
    .await
    .unwrap();

    let id = row.0;
    if !content.is_empty() {
        data_path.open(bucket_id, id).write(0, content).await.unwrap();
    }
    id
}

/// Overwrite an object's payload and bump its metadata, as a new local
/// write would.
pub async fn rewrite_object(
    pool: &SqlitePool,
    data_path: &DataPath,
    bucket_id: i64,
    object_id: i64,
    content: &[u8],
) {
    let obj = data_path.open(bucket_id, object_id);
    obj.delete().await.unwrap();
    obj.write(0, content).await.unwrap();

    // Must land after any sync mark already on the row.
    let updated_at = Utc::now();
    sqlx::query("UPDATE objects SET size = ?, content_md5 = ?, updated_at = ? WHERE id = ?")
        .bind(content.len() as i64)
        .bind(format!("{:x}", md5::compute(content)))
        .bind(updated_at)
        .bind(object_id)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn fetch_object(pool: &SqlitePool, id: i64) -> ObjectRecord {
    sqlx::query_as::<_, ObjectRecord>(
        "SELECT id, bucket_id, key, is_file, size, content_md5, updated_at, sync1, sync2 \
         FROM objects WHERE id = ?",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .unwrap()
}

pub async fn target_last_error(pool: &SqlitePool, target_id: i64) -> Option<String> {
    let row: (Option<String>,) =
        sqlx::query_as("SELECT last_error FROM backup_targets WHERE id = ?")
            .bind(target_id)
            .fetch_one(pool)
            .await
            .unwrap();
    row.0
}

/// Single-worker configuration with the quiescence window disabled.
pub fn test_config(data_dir: &str) -> SyncConfig {
    SyncConfig {
        node_num: 1,
        node_count: 1,
        multi_thread: false,
        max_threads: 4,
        buckets: Vec::new(),
        small_size_first: false,
        test: false,
        database_url: "sqlite::memory:".into(),
        data_dir: data_dir.to_string(),
        lock_file: "/tmp/bucket-sync-worker-test.lock".into(),
        quiescence_minutes: 0,
    }
}

pub fn hex_md5(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

pub fn backdated(seconds: i64) -> DateTime<Utc> {
    Utc::now() - TimeDelta::seconds(seconds)
}
