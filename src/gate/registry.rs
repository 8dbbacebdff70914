use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::ProxyError;
use crate::gate::host::HostGuard;
use crate::gate::{decode_hex, parse_url, Admitted, GateRequest, Scheme, SecurityGate};
use crate::storage::errlog::ErrorLog;
use crate::storage::{unix_now, SharedKV};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlStatus {
    Allowed,
    Blocked,
}

impl UrlStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "allowed" | "allow" => Some(UrlStatus::Allowed),
            "blocked" | "block" => Some(UrlStatus::Blocked),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Entry {
    status: UrlStatus,
    updated_at: i64,
}

#[derive(Clone)]
pub struct Registry {
    kv: Arc<dyn SharedKV>,
}

impl Registry {
    pub fn new(kv: Arc<dyn SharedKV>) -> Self {
        Self { kv }
    }

    pub fn status(&self, url: &str) -> Result<Option<UrlStatus>> {
        let Some(raw) = self.kv.get(&registry_key(url))? else {
            return Ok(None);
        };
        let entry: Entry = serde_json::from_slice(&raw)
            .map_err(|err| anyhow!("decode registry entry for {url}: {err}"))?;
        Ok(Some(entry.status))
    }

    pub fn set_status(&self, url: &str, status: UrlStatus) -> Result<()> {
        let entry = Entry {
            status,
            updated_at: unix_now(),
        };
        self.kv.set(&registry_key(url), &serde_json::to_vec(&entry)?)
    }

    pub fn remove(&self, url: &str) -> Result<()> {
        self.kv.delete(&registry_key(url))
    }
}

fn registry_key(url: &str) -> Vec<u8> {
    format!("{}{}", constants::KV_REGISTRY_PREFIX, url).into_bytes()
}

pub struct RegistryGate {
    registry: Registry,
    errors: Arc<ErrorLog>,
    guard: HostGuard,
}

impl RegistryGate {
    pub fn new(registry: Registry, errors: Arc<ErrorLog>, guard: HostGuard) -> Self {
        Self {
            registry,
            errors,
            guard,
        }
    }
}

impl SecurityGate for RegistryGate {
    fn scheme(&self) -> Scheme {
        Scheme::Registry
    }

    fn admit(&self, req: &GateRequest) -> Result<Admitted, ProxyError> {
        let raw = decode_hex(&req.encoded_url)?;
        let url = parse_url(&raw)?;
        self.guard.check(&url)?;

        let key = url.as_str();
        match self.registry.status(key) {
            Ok(Some(UrlStatus::Allowed)) => {}
            Ok(Some(UrlStatus::Blocked)) => return Err(ProxyError::forbidden("blocked")),
            Ok(None) => return Err(ProxyError::forbidden("unregistered")),
            Err(err) => {
                log::error!("registry lookup failed for {key}: {err}");
                return Err(ProxyError::forbidden("registry unavailable"));
            }
        }
        if let Some(reason) = self.errors.lookup(key) {
            return Err(ProxyError::RecentFailure(reason));
        }
        Ok(Admitted { url })
    }
}
