use std::sync::Arc;

use url::Url;

use crate::config::{self, Policy};
use crate::error::ProxyError;
use crate::storage::errlog::ErrorLog;
use crate::storage::SharedKV;

pub mod host;
pub mod registry;
pub mod signed;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Signed,
    Registry,
}

#[derive(Clone, Debug)]
pub struct GateRequest {
    pub encoded_url: String,
    pub tag: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Admitted {
    pub url: Url,
}

pub trait SecurityGate: Send + Sync {
    fn scheme(&self) -> Scheme;
    fn admit(&self, req: &GateRequest) -> Result<Admitted, ProxyError>;
}

pub fn build(
    cfg: &config::Security,
    kv: Arc<dyn SharedKV>,
    errors: Arc<ErrorLog>,
) -> Arc<dyn SecurityGate> {
    let guard = host::HostGuard::new(&cfg.deny_host_prefixes);
    match cfg.policy {
        Policy::Signed => Arc::new(signed::SignedGate::new(cfg.secret.as_bytes(), guard)),
        Policy::Registry => Arc::new(registry::RegistryGate::new(
            registry::Registry::new(kv),
            errors,
            guard,
        )),
    }
}

pub fn decode_hex(encoded: &str) -> Result<Vec<u8>, ProxyError> {
    hex::decode(encoded)
        .map_err(|err| ProxyError::bad_request(format_args!("invalid url encoding: {err}")))
}

pub fn parse_url(raw: &[u8]) -> Result<Url, ProxyError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProxyError::bad_request("url is not utf-8"))?;
    let url = Url::parse(text)
        .map_err(|err| ProxyError::bad_request(format_args!("invalid url: {err}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(ProxyError::bad_request(format_args!("scheme {other} not allowed"))),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ProxyError::bad_request("url has no host"));
    }
    Ok(url)
}

pub fn decode_url(encoded: &str) -> Result<Url, ProxyError> {
    parse_url(&decode_hex(encoded)?)
}
