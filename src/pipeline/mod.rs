use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use url::Url;

use crate::cachekey::CacheKey;
use crate::config::Bootstrap;
use crate::error::ProxyError;
use crate::gate::{self, host, Admitted, GateRequest, Scheme, SecurityGate};
use crate::logging;
use crate::metrics;
use crate::origin::OriginFetcher;
use crate::storage::errlog::ErrorLog;
use crate::storage::{self, CacheRecord, CacheStatus, Freshness, RecordMeta, SharedKV, Store};

pub mod singleflight;

use singleflight::Group;

type FetchResult = Result<CacheRecord, ProxyError>;

#[derive(Clone, Debug, Default)]
pub struct ImageRequest {
    pub encoded_url: String,
    pub tag: Option<String>,
    pub if_modified_since: Option<i64>,
}

#[derive(Clone, Debug)]
pub enum Served {
    Image {
        record: CacheRecord,
        status: CacheStatus,
    },
    NotModified {
        last_modified: i64,
    },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    pub resolve_hosts: bool,
    pub collapse_requests: bool,
}

#[derive(Clone)]
pub struct Pipeline {
    gate: Arc<dyn SecurityGate>,
    store: Arc<dyn Store>,
    origin: OriginFetcher,
    errors: Arc<ErrorLog>,
    inflight: Option<Arc<Group<FetchResult>>>,
    resolve_hosts: bool,
}

impl Pipeline {
    pub fn new(
        gate: Arc<dyn SecurityGate>,
        store: Arc<dyn Store>,
        origin: OriginFetcher,
        errors: Arc<ErrorLog>,
        opts: Options,
    ) -> Self {
        Self {
            gate,
            store,
            origin,
            errors,
            inflight: opts.collapse_requests.then(|| Arc::new(Group::new())),
            resolve_hosts: opts.resolve_hosts,
        }
    }

    pub fn from_config(cfg: &Bootstrap, kv: Arc<dyn SharedKV>) -> Result<Self> {
        let errors = Arc::new(ErrorLog::new(Arc::clone(&kv), cfg.storage.error_ttl));
        let gate = gate::build(&cfg.security, Arc::clone(&kv), Arc::clone(&errors));
        let store = storage::open(&cfg.storage, kv)?;
        let origin = OriginFetcher::new(&cfg.origin)?;
        log::info!(
            "pipeline ready: policy={:?} store={} collapse={}",
            gate.scheme(),
            store.kind(),
            cfg.origin.collapse_requests
        );
        Ok(Self::new(
            gate,
            store,
            origin,
            errors,
            Options {
                resolve_hosts: cfg.security.resolve_hosts,
                collapse_requests: cfg.origin.collapse_requests,
            },
        ))
    }

    pub fn gate(&self) -> &Arc<dyn SecurityGate> {
        &self.gate
    }

    pub fn errors(&self) -> &Arc<ErrorLog> {
        &self.errors
    }

    pub async fn serve(&self, req: ImageRequest) -> Result<Served, ProxyError> {
        let gate_req = GateRequest {
            encoded_url: req.encoded_url,
            tag: req.tag,
        };
        let admitted = self.admit(gate_req).await.map_err(rejected)?;
        if self.resolve_hosts {
            host::ensure_public(&admitted.url).await.map_err(rejected)?;
        }
        let url = admitted.url;
        let key = CacheKey::new(url.as_str());

        if let Some(served) = self.lookup(&key, &url, req.if_modified_since).await {
            return Ok(served);
        }
        metrics::record_cache_status(CacheStatus::Miss.as_str());

        if let Some(reason) = self.recent_failure(&url).await {
            log::debug!("{key} failed recently: {reason}");
            return Err(ProxyError::RecentFailure(reason));
        }
        let record = self.fetch(key, url).await?;
        Ok(Served::Image {
            record,
            status: CacheStatus::Miss,
        })
    }

    async fn lookup(&self, key: &CacheKey, url: &Url, if_modified_since: Option<i64>) -> Option<Served> {
        let (meta, freshness) = match self.head(key).await {
            Ok(Some(found)) => found,
            Ok(None) => return None,
            Err(err) => {
                log::warn!("cache lookup failed for {key}: {err}");
                return None;
            }
        };

        let refreshing = freshness == Freshness::Stale;
        if refreshing {
            self.spawn_refresh(key.clone(), url.clone());
        }
        let status = if refreshing {
            CacheStatus::Stale
        } else {
            CacheStatus::Hit
        };

        if if_modified_since == Some(meta.last_modified) {
            metrics::record_cache_status(status.as_str());
            return Some(Served::NotModified {
                last_modified: meta.last_modified,
            });
        }

        let record = match self.read(key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::debug!("{key} vanished between head and read");
                return None;
            }
            Err(err) => {
                log::warn!("cache read failed for {key}: {err}");
                return None;
            }
        };
        metrics::record_cache_status(status.as_str());
        Some(Served::Image { record, status })
    }

    async fn head(&self, key: &CacheKey) -> Result<Option<(RecordMeta, Freshness)>> {
        let key = key.clone();
        self.blocking(move |store| store.head(&key)).await
    }

    async fn read(&self, key: &CacheKey) -> Result<Option<CacheRecord>> {
        let key = key.clone();
        self.blocking(move |store| store.get(&key)).await
    }

    async fn admit(&self, req: GateRequest) -> Result<Admitted, ProxyError> {
        match self.gate.scheme() {
            Scheme::Signed => self.gate.admit(&req),
            // registry lookups read the index
            Scheme::Registry => {
                let gate = Arc::clone(&self.gate);
                tokio::task::spawn_blocking(move || gate.admit(&req))
                    .await
                    .unwrap_or_else(|err| {
                        log::error!("gate task: {err}");
                        Err(ProxyError::forbidden("registry unavailable"))
                    })
            }
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Store) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|err| anyhow!("store task: {err}"))?
    }

    async fn recent_failure(&self, url: &Url) -> Option<String> {
        let errors = Arc::clone(&self.errors);
        let url = url.to_string();
        tokio::task::spawn_blocking(move || errors.lookup(&url))
            .await
            .unwrap_or_else(|err| {
                log::warn!("error log task: {err}");
                None
            })
    }

    async fn fetch(&self, key: CacheKey, url: Url) -> FetchResult {
        let this = self.clone();
        let flight_key = key.url().to_string();
        let work = move || async move { this.fetch_once(key, url).await };
        match &self.inflight {
            Some(group) => group
                .do_call(flight_key, work)
                .await
                .unwrap_or_else(|| Err(ProxyError::unavailable("fetch task aborted"))),
            None => work().await,
        }
    }

    async fn fetch_once(&self, key: CacheKey, url: Url) -> FetchResult {
        match self.origin.fetch(&url).await {
            Ok(record) => {
                metrics::record_origin_fetch("ok");
                self.persist(key, record.clone());
                Ok(record)
            }
            Err(err) => {
                metrics::record_origin_fetch(fetch_label(&err));
                log::warn!("origin fetch {url} failed: {err}");
                if err.is_origin_failure() {
                    self.record_failure(&url, &err).await;
                }
                Err(err)
            }
        }
    }

    async fn record_failure(&self, url: &Url, err: &ProxyError) {
        let errors = Arc::clone(&self.errors);
        let url = url.to_string();
        let reason = err.to_string();
        if let Err(err) = tokio::task::spawn_blocking(move || errors.record(&url, &reason)).await {
            log::warn!("error log task: {err}");
        }
    }

    fn persist(&self, key: CacheKey, record: CacheRecord) {
        let store = Arc::clone(&self.store);
        spawn_detached(async move {
            let backend = store.kind();
            let task_key = key.clone();
            let result = tokio::task::spawn_blocking(move || store.put(&task_key, &record)).await;
            match result {
                Ok(Ok(outcome)) => {
                    log::debug!("stored {key}: {}", outcome.as_str());
                    metrics::record_store_write(backend, outcome.as_str());
                }
                Ok(Err(err)) => {
                    log::warn!("store write for {key} failed: {err:#}");
                    metrics::record_store_write(backend, "error");
                }
                Err(err) => {
                    log::warn!("store task for {key} failed: {err}");
                    metrics::record_store_write(backend, "error");
                }
            }
        });
    }

    fn spawn_refresh(&self, key: CacheKey, url: Url) {
        let this = self.clone();
        spawn_detached(async move {
            if let Some(reason) = this.recent_failure(&url).await {
                log::debug!("skip refresh of {key}, failed recently: {reason}");
                return;
            }
            log::debug!("refreshing {key}");
            if let Err(err) = this.fetch(key.clone(), url).await {
                log::info!("refresh of {key} failed: {err}");
            }
        });
    }
}

fn spawn_detached<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match logging::current_request_id() {
        Some(id) => {
            tokio::spawn(logging::with_request_id(id, fut));
        }
        None => {
            tokio::spawn(fut);
        }
    }
}

fn rejected(err: ProxyError) -> ProxyError {
    metrics::record_gate_rejection(err.kind().as_str());
    err
}

fn fetch_label(err: &ProxyError) -> &'static str {
    match err {
        ProxyError::OriginRejected(_) => "rejected",
        ProxyError::OriginUnavailable(_) => "unavailable",
        _ => "error",
    }
}
