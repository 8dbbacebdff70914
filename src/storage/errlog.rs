use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::constants;
use crate::storage::SharedKV;

pub struct ErrorLog {
    kv: Arc<dyn SharedKV>,
    ttl: Duration,
}

impl ErrorLog {
    pub fn new(kv: Arc<dyn SharedKV>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn record(&self, url: &str, reason: &str) {
        if let Err(err) = self.kv.set_ex(&error_key(url), reason.as_bytes(), self.ttl) {
            log::warn!("error log write failed for {url}: {err}");
        }
    }

    pub fn lookup(&self, url: &str) -> Option<String> {
        match self.kv.get(&error_key(url)) {
            Ok(val) => val.map(|raw| String::from_utf8_lossy(&raw).into_owned()),
            Err(err) => {
                log::warn!("error log read failed for {url}: {err}");
                None
            }
        }
    }

    pub fn clear(&self, url: &str) -> Result<()> {
        self.kv.delete(&error_key(url))
    }
}

fn error_key(url: &str) -> Vec<u8> {
    format!("{}{}", constants::KV_ERROR_PREFIX, url).into_bytes()
}
