use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::cachekey::CacheKey;
use crate::config;

pub mod blob;
pub mod errlog;
pub mod sharedkv;
pub mod split;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRecord {
    pub content_type: String,
    pub body: Bytes,
    pub checksum: String,
    pub last_modified: i64,
}

impl CacheRecord {
    pub fn new(content_type: impl Into<String>, body: Bytes) -> Self {
        let checksum = checksum(&body);
        Self {
            content_type: content_type.into(),
            body,
            checksum,
            last_modified: unix_now(),
        }
    }

    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            content_type: self.content_type.clone(),
            checksum: self.checksum.clone(),
            last_modified: self.last_modified,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub content_type: String,
    pub checksum: String,
    pub last_modified: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    Untracked,
    Fresh,
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    Unchanged,
}

impl PutOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PutOutcome::Written => "written",
            PutOutcome::Unchanged => "unchanged",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Miss,
    Hit,
    Stale,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Miss => "MISS",
            CacheStatus::Hit => "HIT",
            CacheStatus::Stale => "STALE",
        }
    }
}

pub trait Store: Send + Sync {
    fn kind(&self) -> &'static str;
    fn head(&self, key: &CacheKey) -> Result<Option<(RecordMeta, Freshness)>>;
    fn get(&self, key: &CacheKey) -> Result<Option<CacheRecord>>;
    fn put(&self, key: &CacheKey, record: &CacheRecord) -> Result<PutOutcome>;
}

pub trait SharedKV: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &[u8], val: &[u8]) -> Result<()>;
    fn set_ex(&self, key: &[u8], val: &[u8], ttl: Duration) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    fn sweep_expired(&self, prefix: &[u8]) -> Result<usize>;
    fn flush(&self) -> Result<()>;
}

pub fn open(cfg: &config::Storage, kv: Arc<dyn SharedKV>) -> Result<Arc<dyn Store>> {
    fs::create_dir_all(&cfg.path)
        .with_context(|| format!("create cache dir {}", cfg.path.display()))?;
    let store: Arc<dyn Store> = match cfg.driver {
        config::Driver::Blob => Arc::new(blob::BlobStore::new(&cfg.path)),
        config::Driver::Split => Arc::new(split::SplitStore::new(&cfg.path, kv, cfg.freshness_ttl)),
    };
    Ok(store)
}

pub fn checksum(body: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
{
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    let tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        write(&mut writer).with_context(|| format!("encode {}", path.display()))?;
        writer.flush().with_context(|| format!("flush {}", path.display()))?;
    }
    tmp.persist(path)
        .map_err(|err| anyhow!("rename into {}: {}", path.display(), err.error))?;
    Ok(())
}
