//! Object transfer protocol against a remote backup endpoint.
//!
//! Per (object, slot) the protocol is `NeedSync -> Syncing -> {Synced |
//! Failed}`: a metadata-only create for empty objects, a single-shot
//! streamed PUT with `Content-MD5` when a cached digest exists, and a
//! chunked offset-addressed POST fallback otherwise. The slot's sync mark
//! is written only after the remote acknowledges — never optimistically.

use crate::{
    errors::{SyncError, SyncResult},
    models::{backup::BackupSlot, backup::BackupTarget, bucket::Bucket, object::ObjectRecord},
    services::{
        data_path::{DataObject, DataPath},
        selector::CandidateSelector,
    },
};
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Body, StatusCode, Url, header};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Hex MD5 of the empty byte string, sent when creating empty objects.
pub const EMPTY_HEX_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// Objects above this size skip the single-shot attempt entirely.
pub const SINGLE_SHOT_CEILING: i64 = 256 * 1024 * 1024;

/// Part size of the chunked fallback.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Bounded per-chunk attempts before the whole object fails.
const CHUNK_ATTEMPTS: u32 = 2;

const CONTENT_MD5: header::HeaderName = header::HeaderName::from_static("content-md5");

/// Executes one object's synchronization against a remote backup endpoint.
#[derive(Clone)]
pub struct TransferClient {
    http: reqwest::Client,
    data_path: DataPath,
    selector: CandidateSelector,
    chunk_size: usize,
}

impl TransferClient {
    pub fn new(http: reqwest::Client, data_path: DataPath, selector: CandidateSelector) -> Self {
        Self {
            http,
            data_path,
            selector,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the fallback part size. Intended for tests.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Synchronize one object to `target`, marking the slot on success.
    ///
    /// The mark records the instant the transfer *started*, so a concurrent
    /// local write during the transfer keeps the object a candidate for the
    /// next pass instead of being silently lost.
    pub async fn sync_object(
        &self,
        bucket: &Bucket,
        obj: &ObjectRecord,
        target: &BackupTarget,
    ) -> SyncResult<()> {
        let slot = slot_of(target)?;
        let started = Utc::now();

        if obj.size == 0 {
            self.create_empty(target, &obj.key).await?;
        } else {
            self.transfer_content(bucket, obj, target).await?;
        }

        self.selector.mark_synced(obj.id, slot, started).await?;
        Ok(())
    }

    /// Propagate a local deletion: DELETE on the remote object URL.
    /// 204 (deleted) and 404 (already absent) both succeed; the remote may
    /// have been cleaned by a previous, interrupted pass.
    pub async fn delete_remote_object(&self, target: &BackupTarget, key: &str) -> SyncResult<()> {
        let url = self.object_url(target, key)?;
        let resp = self
            .http
            .delete(url)
            .header(header::AUTHORIZATION, auth_value(target))
            .send()
            .await
            .map_err(|err| SyncError::transfer(key, err))?;

        match resp.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            StatusCode::FORBIDDEN => Err(forbidden(target)),
            status => Err(SyncError::transfer(
                key,
                format!("delete returned unexpected status {status}"),
            )),
        }
    }

    /// Fetch the remote metadata record for `key`; `None` when absent.
    pub async fn remote_metadata(
        &self,
        target: &BackupTarget,
        key: &str,
    ) -> SyncResult<Option<serde_json::Value>> {
        let url = self.metadata_url(target, key)?;
        let resp = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, auth_value(target))
            .send()
            .await
            .map_err(|err| SyncError::transfer(key, err))?;

        match resp.status() {
            StatusCode::OK => {
                let value = resp
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|err| SyncError::transfer(key, err))?;
                Ok(Some(value))
            }
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::FORBIDDEN => Err(forbidden(target)),
            status => Err(SyncError::transfer(
                key,
                format!("metadata lookup returned unexpected status {status}"),
            )),
        }
    }

    async fn transfer_content(
        &self,
        bucket: &Bucket,
        obj: &ObjectRecord,
        target: &BackupTarget,
    ) -> SyncResult<()> {
        let data = self.data_path.open(bucket.id, obj.id);

        // Size recheck: a mismatch means the object changed between
        // selection and now. Fail it; the newer write re-selects it.
        let live_size = data.size().await?;
        if live_size != obj.size {
            return Err(SyncError::IntegrityMismatch {
                key: obj.key.clone(),
                reason: format!("recorded size {} but data path has {}", obj.size, live_size),
            });
        }

        if obj.size <= SINGLE_SHOT_CEILING {
            if let Some(cached_md5) = obj.content_md5.as_deref() {
                match self.put_whole(target, obj, &data, cached_md5).await {
                    Ok(()) => return Ok(()),
                    Err(err @ SyncError::Config(_)) => return Err(err),
                    Err(err) => {
                        debug!(key = %obj.key, error = %err, "single-shot failed, falling back to chunked transfer");
                    }
                }
            }
        }

        self.post_by_chunks(target, obj, &data).await
    }

    /// Stream the full content in one PUT with a `Content-MD5` header.
    async fn put_whole(
        &self,
        target: &BackupTarget,
        obj: &ObjectRecord,
        data: &DataObject,
        hex_md5: &str,
    ) -> SyncResult<()> {
        let url = self.object_url(target, &obj.key)?;
        let file = data.reader().await?;
        let resp = self
            .http
            .put(url)
            .header(header::AUTHORIZATION, auth_value(target))
            .header(CONTENT_MD5, hex_md5)
            .header(header::CONTENT_LENGTH, obj.size)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|err| SyncError::transfer(&obj.key, err))?;

        match resp.status() {
            StatusCode::OK => {
                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    let created = body
                        .get("created")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    debug!(key = %obj.key, created, "single-shot transfer accepted");
                }
                Ok(())
            }
            StatusCode::BAD_REQUEST => {
                let code = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|body| {
                        body.get("code").and_then(|v| v.as_str()).map(String::from)
                    });
                match code.as_deref() {
                    Some("BadDigest") | Some("InvalidDigest") => {
                        Err(SyncError::IntegrityMismatch {
                            key: obj.key.clone(),
                            reason: format!("remote rejected digest {hex_md5}"),
                        })
                    }
                    _ => Err(SyncError::transfer(&obj.key, "remote rejected the request")),
                }
            }
            StatusCode::FORBIDDEN => Err(forbidden(target)),
            status => Err(SyncError::transfer(
                &obj.key,
                format!("put returned unexpected status {status}"),
            )),
        }
    }

    /// Chunked fallback: sequential fixed-size parts with explicit byte
    /// offsets, `reset=true` on the first part. The final part's 200
    /// completes the object.
    async fn post_by_chunks(
        &self,
        target: &BackupTarget,
        obj: &ObjectRecord,
        data: &DataObject,
    ) -> SyncResult<()> {
        let mut offset: u64 = 0;
        loop {
            let chunk = data.read(offset, self.chunk_size).await?;
            if chunk.is_empty() {
                if offset >= obj.size as u64 {
                    break;
                }
                // The payload shrank under us; leave the object a candidate.
                return Err(SyncError::IntegrityMismatch {
                    key: obj.key.clone(),
                    reason: format!(
                        "short read at offset {offset}, object changed during transfer"
                    ),
                });
            }

            let hex_md5 = format!("{:x}", md5::compute(&chunk));
            let url = self.chunk_url(target, &obj.key, offset, offset == 0)?;
            self.post_chunk(url, target, &obj.key, chunk.clone(), &hex_md5)
                .await?;
            offset += chunk.len() as u64;
        }
        Ok(())
    }

    /// One part, retried up to `CHUNK_ATTEMPTS` times. Configuration
    /// errors are not retried.
    async fn post_chunk(
        &self,
        url: Url,
        target: &BackupTarget,
        key: &str,
        chunk: Bytes,
        hex_md5: &str,
    ) -> SyncResult<()> {
        let mut last_err = None;
        for attempt in 1..=CHUNK_ATTEMPTS {
            match self
                .try_post_chunk(url.clone(), target, key, chunk.clone(), hex_md5)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err @ SyncError::Config(_)) => return Err(err),
                Err(err) => {
                    debug!(key, attempt, error = %err, "chunk post failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.expect("at least one chunk attempt was made"))
    }

    async fn try_post_chunk(
        &self,
        url: Url,
        target: &BackupTarget,
        key: &str,
        chunk: Bytes,
        hex_md5: &str,
    ) -> SyncResult<()> {
        let resp = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, auth_value(target))
            .header(CONTENT_MD5, hex_md5)
            .body(chunk)
            .send()
            .await
            .map_err(|err| SyncError::transfer(key, err))?;

        match resp.status() {
            StatusCode::OK => Ok(()),
            StatusCode::FORBIDDEN => Err(forbidden(target)),
            status => Err(SyncError::transfer(
                key,
                format!("chunk post returned unexpected status {status}"),
            )),
        }
    }

    /// Metadata-only creation of an empty object. A different remote
    /// operation from a zero-length PUT and must not be conflated with it.
    async fn create_empty(&self, target: &BackupTarget, key: &str) -> SyncResult<()> {
        let url = self.metadata_url(target, key)?;
        let resp = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, auth_value(target))
            .header(CONTENT_MD5, EMPTY_HEX_MD5)
            .send()
            .await
            .map_err(|err| SyncError::transfer(key, err))?;

        match resp.status() {
            StatusCode::OK => Ok(()),
            StatusCode::FORBIDDEN => Err(forbidden(target)),
            status => Err(SyncError::transfer(
                key,
                format!("empty-object create returned unexpected status {status}"),
            )),
        }
    }

    /// `{endpoint}/api/v2/obj/{bucket}/{key}`, key percent-encoded per
    /// path segment.
    fn object_url(&self, target: &BackupTarget, key: &str) -> SyncResult<Url> {
        let mut url = base_url(target)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SyncError::Config(format!(
                    "endpoint url `{}` cannot carry a path",
                    target.endpoint_url
                )))?;
            segments.pop_if_empty();
            segments.extend(["api", "v2", "obj"]);
            segments.push(&target.bucket_name);
            segments.extend(key.trim_start_matches('/').split('/'));
        }
        Ok(url)
    }

    /// `{endpoint}/api/v1/metadata/{bucket}/{key}/` (trailing slash).
    fn metadata_url(&self, target: &BackupTarget, key: &str) -> SyncResult<Url> {
        let mut url = base_url(target)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SyncError::Config(format!(
                    "endpoint url `{}` cannot carry a path",
                    target.endpoint_url
                )))?;
            segments.pop_if_empty();
            segments.extend(["api", "v1", "metadata"]);
            segments.push(&target.bucket_name);
            segments.extend(key.trim_start_matches('/').split('/'));
            segments.push("");
        }
        Ok(url)
    }

    fn chunk_url(
        &self,
        target: &BackupTarget,
        key: &str,
        offset: u64,
        reset: bool,
    ) -> SyncResult<Url> {
        let mut url = self.object_url(target, key)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("offset", &offset.to_string());
            if reset {
                pairs.append_pair("reset", "true");
            }
        }
        Ok(url)
    }
}

fn base_url(target: &BackupTarget) -> SyncResult<Url> {
    Url::parse(&target.endpoint_url).map_err(|err| {
        SyncError::Config(format!(
            "target {} has malformed endpoint url `{}`: {err}",
            target.id, target.endpoint_url
        ))
    })
}

fn slot_of(target: &BackupTarget) -> SyncResult<BackupSlot> {
    match target.backup_num {
        1 => Ok(BackupSlot::One),
        2 => Ok(BackupSlot::Two),
        other => Err(SyncError::Config(format!(
            "target {} has invalid backup_num {}",
            target.id, other
        ))),
    }
}

fn auth_value(target: &BackupTarget) -> String {
    format!("BucketToken {}", target.bucket_token)
}

fn forbidden(target: &BackupTarget) -> SyncError {
    SyncError::Config(format!(
        "token for `{}` rejected by {}; a read-write bucket token is required",
        target.bucket_name, target.endpoint_url
    ))
}
