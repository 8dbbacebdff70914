use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;

use crate::cachekey::CacheKey;
use crate::constants;
use crate::storage::{
    unix_now, write_atomic, CacheRecord, Freshness, PutOutcome, RecordMeta, SharedKV, Store,
};

/// Raw bodies on disk, content type and checksum in the shared index.
pub struct SplitStore {
    root: PathBuf,
    kv: Arc<dyn SharedKV>,
    freshness_ttl: Duration,
}

impl SplitStore {
    pub fn new(root: &Path, kv: Arc<dyn SharedKV>, freshness_ttl: Duration) -> Self {
        Self {
            root: root.to_path_buf(),
            kv,
            freshness_ttl,
        }
    }

    fn read_meta(&self, key: &CacheKey) -> Result<Option<RecordMeta>> {
        let Some(raw) = self.kv.get(&record_key(key.url()))? else {
            return Ok(None);
        };
        let meta = serde_json::from_slice(&raw)
            .map_err(|err| anyhow!("decode index entry for {}: {err}", key.url()))?;
        Ok(Some(meta))
    }

    fn is_fresh(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.kv.get(&updated_key(key.url()))?.is_some())
    }

    fn mark_fresh(&self, key: &CacheKey) -> Result<()> {
        let now = unix_now().to_string();
        self.kv
            .set_ex(&updated_key(key.url()), now.as_bytes(), self.freshness_ttl)
    }
}

impl Store for SplitStore {
    fn kind(&self) -> &'static str {
        "split"
    }

    fn head(&self, key: &CacheKey) -> Result<Option<(RecordMeta, Freshness)>> {
        let Some(meta) = self.read_meta(key)? else {
            return Ok(None);
        };
        if !key.path(&self.root).exists() {
            log::warn!("index entry without blob for {key}");
            return Ok(None);
        }
        let freshness = if self.is_fresh(key)? {
            Freshness::Fresh
        } else {
            Freshness::Stale
        };
        Ok(Some((meta, freshness)))
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheRecord>> {
        let Some(meta) = self.read_meta(key)? else {
            return Ok(None);
        };
        let path = key.path(&self.root);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::warn!("index entry without blob for {key}");
                return Ok(None);
            }
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        Ok(Some(CacheRecord {
            content_type: meta.content_type,
            body: Bytes::from(body),
            checksum: meta.checksum,
            last_modified: meta.last_modified,
        }))
    }

    fn put(&self, key: &CacheKey, record: &CacheRecord) -> Result<PutOutcome> {
        let previous = match self.read_meta(key) {
            Ok(meta) => meta,
            Err(err) => {
                log::warn!("ignoring unreadable index entry: {err}");
                None
            }
        };
        let blob_path = key.path(&self.root);
        if let Some(prev) = previous {
            if prev.checksum == record.checksum && blob_path.exists() {
                self.mark_fresh(key)?;
                return Ok(PutOutcome::Unchanged);
            }
        }

        write_atomic(&blob_path, |w| w.write_all(&record.body))?;
        let meta = serde_json::to_vec(&record.meta())?;
        self.kv.set(&record_key(key.url()), &meta)?;
        self.mark_fresh(key)?;
        Ok(PutOutcome::Written)
    }
}

fn record_key(url: &str) -> Vec<u8> {
    format!("{}{}", constants::KV_RECORD_PREFIX, url).into_bytes()
}

fn updated_key(url: &str) -> Vec<u8> {
    format!("{}{}", constants::KV_UPDATED_PREFIX, url).into_bytes()
}
