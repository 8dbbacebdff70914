use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sled::Db;

use crate::config;
use crate::storage::{unix_millis, SharedKV};

const ENVELOPE_SIZE: usize = 8;

/// Sled tree where every value is prefixed with its expiry in unix milliseconds
/// (zero meaning never).
pub struct SledSharedKV {
    db: Db,
}

impl SledSharedKV {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let db = sled::open(path).with_context(|| format!("open index {}", path.display()))?;
        Ok(Arc::new(Self { db }))
    }

    pub fn temporary() -> Result<Arc<Self>> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("open temporary index")?;
        Ok(Arc::new(Self { db }))
    }

    fn wrap(val: &[u8], expires_at: u64) -> Vec<u8> {
        let mut raw = Vec::with_capacity(ENVELOPE_SIZE + val.len());
        raw.extend_from_slice(&expires_at.to_be_bytes());
        raw.extend_from_slice(val);
        raw
    }

    fn unwrap(raw: &[u8], now: u64) -> Option<&[u8]> {
        if raw.len() < ENVELOPE_SIZE {
            return None;
        }
        let (head, payload) = raw.split_at(ENVELOPE_SIZE);
        let mut expiry = [0u8; ENVELOPE_SIZE];
        expiry.copy_from_slice(head);
        let expires_at = u64::from_be_bytes(expiry);
        if expires_at != 0 && expires_at <= now {
            return None;
        }
        Some(payload)
    }
}

impl SharedKV for SledSharedKV {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(raw) = self.db.get(key)? else {
            return Ok(None);
        };
        if let Some(payload) = Self::unwrap(&raw, unix_millis()) {
            return Ok(Some(payload.to_vec()));
        }
        // compare-and-swap so a concurrent rewrite is not lost
        let _ = self.db.compare_and_swap(key, Some(raw), None as Option<&[u8]>)?;
        Ok(None)
    }

    fn set(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.db.insert(key, Self::wrap(val, 0))?;
        Ok(())
    }

    fn set_ex(&self, key: &[u8], val: &[u8], ttl: Duration) -> Result<()> {
        let expires_at = unix_millis().saturating_add(ttl.as_millis() as u64).max(1);
        self.db.insert(key, Self::wrap(val, expires_at))?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    fn sweep_expired(&self, prefix: &[u8]) -> Result<usize> {
        let now = unix_millis();
        let mut removed = 0;
        for item in self.db.scan_prefix(prefix) {
            let (key, raw) = item?;
            if Self::unwrap(&raw, now).is_none() {
                let swapped = self.db.compare_and_swap(&key, Some(raw), None as Option<&[u8]>)?;
                if swapped.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

pub fn open(cfg: &config::Storage) -> Result<Arc<dyn SharedKV>> {
    let db_type = cfg.db_type.trim().to_ascii_lowercase();
    let kv: Arc<dyn SharedKV> = match db_type.as_str() {
        "memory" | "mem" => SledSharedKV::temporary()?,
        "" | "sled" => SledSharedKV::open(&cfg.db_path)?,
        other => {
            log::warn!("index type {other} not supported, fallback to sled");
            SledSharedKV::open(&cfg.db_path)?
        }
    };
    Ok(kv)
}
