use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::constants;
use crate::storage::blob;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub storage: Storage,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        match self.security.policy {
            Policy::Signed if self.security.secret.is_empty() => {
                return Err(anyhow!("security.secret is required by the signed policy"));
            }
            _ => {}
        }
        if self.storage.path.as_os_str().is_empty() {
            return Err(anyhow!("storage.path is required"));
        }
        if self.origin.max_size == 0 {
            return Err(anyhow!("origin.max_size must be positive"));
        }
        if self.origin.max_size > blob::MAX_BODY_LEN {
            return Err(anyhow!(
                "origin.max_size must not exceed {} bytes",
                blob::MAX_BODY_LEN
            ));
        }
        if self.storage.freshness_ttl.is_zero() || self.storage.error_ttl.is_zero() {
            return Err(anyhow!("storage ttls must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub nopid: bool,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_timeout_30s", with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(default = "default_timeout_30s", with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(default = "default_avatar")]
    pub default_avatar: String,
    #[serde(default)]
    pub admin_allow_ips: Vec<String>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            read_timeout: default_timeout_30s(),
            write_timeout: default_timeout_30s(),
            default_avatar: default_avatar(),
            admin_allow_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    Signed,
    Registry,
}

#[derive(Debug, Deserialize)]
pub struct Security {
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_deny_host_prefixes")]
    pub deny_host_prefixes: Vec<String>,
    #[serde(default)]
    pub resolve_hosts: bool,
}

impl Default for Security {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            secret: String::new(),
            deny_host_prefixes: default_deny_host_prefixes(),
            resolve_hosts: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Origin {
    #[serde(default = "default_origin_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    #[serde(default = "default_true")]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_true")]
    pub collapse_requests: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for Origin {
    fn default() -> Self {
        Self {
            timeout: default_origin_timeout(),
            max_size: default_max_size(),
            insecure_skip_verify: true,
            collapse_requests: true,
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    #[default]
    Blob,
    Split,
}

#[derive(Debug, Deserialize)]
pub struct Storage {
    #[serde(default)]
    pub driver: Driver,
    #[serde(default = "default_cache_dir")]
    pub path: PathBuf,
    #[serde(default)]
    pub db_type: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_freshness_ttl", with = "humantime_serde")]
    pub freshness_ttl: Duration,
    #[serde(default = "default_error_ttl", with = "humantime_serde")]
    pub error_ttl: Duration,
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            driver: Driver::default(),
            path: default_cache_dir(),
            db_type: String::new(),
            db_path: default_db_path(),
            freshness_ttl: default_freshness_ttl(),
            error_ttl: default_error_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_timeout_30s() -> Duration {
    Duration::from_secs(30)
}

fn default_avatar() -> String {
    "https://www.gravatar.com/avatar/0?d=mp".to_string()
}

fn default_deny_host_prefixes() -> Vec<String> {
    constants::DEFAULT_DENY_HOST_PREFIXES
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_origin_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_size() -> u64 {
    constants::DEFAULT_MAX_SIZE
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    constants::DEFAULT_USER_AGENT.to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("index")
}

fn default_freshness_ttl() -> Duration {
    constants::DEFAULT_FRESHNESS_TTL
}

fn default_error_ttl() -> Duration {
    constants::DEFAULT_ERROR_TTL
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse(&raw).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse(raw: &str) -> Result<(Bootstrap, Vec<String>)> {
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })?;
    Ok((cfg, ignored))
}
