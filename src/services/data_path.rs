//! Narrow read/write/delete contract against the storage data path.
//!
//! Stands in for the clustered storage engine's chunked primitives. Object
//! payloads live on local disk sharded beneath
//! `base_path/{shard}/{shard}/{bucket_id}_{object_id}` so no single
//! directory accumulates an unbounded file count.

use crate::errors::{SyncError, SyncResult};
use bytes::Bytes;
use std::{
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

/// Factory for per-object data handles.
#[derive(Clone, Debug)]
pub struct DataPath {
    base_path: PathBuf,
}

/// Read/write/delete access scoped to one object's payload.
#[derive(Clone, Debug)]
pub struct DataObject {
    data_key: String,
    path: PathBuf,
}

impl DataPath {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Two-level shard identifiers for a data key: the first two bytes of
    /// MD5(data_key) as lowercase hex.
    fn shards(data_key: &str) -> (String, String) {
        let digest = md5::compute(data_key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Open a handle for the payload of `(bucket_id, object_id)`. Does not
    /// touch the filesystem; the payload may not exist yet.
    pub fn open(&self, bucket_id: i64, object_id: i64) -> DataObject {
        let data_key = format!("{}_{}", bucket_id, object_id);
        let (shard_a, shard_b) = Self::shards(&data_key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(&data_key);
        DataObject { data_key, path }
    }
}

impl DataObject {
    pub fn data_key(&self) -> &str {
        &self.data_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn not_found(&self) -> SyncError {
        SyncError::DataNotFound(self.data_key.clone())
    }

    /// Current payload size in bytes.
    pub async fn size(&self) -> SyncResult<i64> {
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.len() as i64),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(self.not_found()),
            Err(err) => Err(SyncError::Io(err)),
        }
    }

    /// Open the payload for sequential streaming from the start.
    pub async fn reader(&self) -> SyncResult<File> {
        match File::open(&self.path).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(self.not_found()),
            Err(err) => Err(SyncError::Io(err)),
        }
    }

    /// Read up to `size` bytes starting at `offset`. Returns an empty
    /// buffer at or past EOF.
    pub async fn read(&self, offset: u64, size: usize) -> SyncResult<Bytes> {
        let mut file = self.reader().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; size];
        let mut filled = 0usize;
        while filled < size {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    /// Write `bytes` at `offset`, creating the payload and its shard
    /// directories as needed. Durable before returning.
    pub async fn write(&self, offset: u64, bytes: &[u8]) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Remove the payload. Missing payloads are not an error.
    pub async fn delete(&self) -> SyncResult<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SyncError::Io(err)),
        }
    }
}
