use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED, LOCATION};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::Bootstrap;
use crate::constants;
use crate::error::{ErrorKind, ProxyError};
use crate::gate::registry::{Registry, UrlStatus};
use crate::gate::{self, Scheme};
use crate::logging;
use crate::metrics;
use crate::pipeline::{ImageRequest, Pipeline, Served};
use crate::storage::{sharedkv, CacheRecord, CacheStatus, SharedKV};

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let listener = TcpListener::bind(&cfg.server.addr)
        .await
        .with_context(|| format!("bind {}", cfg.server.addr))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);
    serve(cfg, listener, shutdown_rx).await
}

pub async fn serve(
    cfg: Arc<Bootstrap>,
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let kv = sharedkv::open(&cfg.storage)?;
    let state = Arc::new(AppState::new(Arc::clone(&cfg), Arc::clone(&kv))?);
    spawn_sweeper(Arc::clone(&kv), cfg.storage.sweep_interval, shutdown.clone());

    log::info!("listening on {}", listener.local_addr().context("local addr")?);
    let result = run_tcp(listener, shutdown, state).await;
    if let Err(err) = kv.flush() {
        log::warn!("index flush failed: {err}");
    }
    log::info!("server stopped");
    result
}

struct AppState {
    cfg: Arc<Bootstrap>,
    pipeline: Pipeline,
    registry: Registry,
    admin_ips: Vec<IpAddr>,
}

impl AppState {
    fn new(cfg: Arc<Bootstrap>, kv: Arc<dyn SharedKV>) -> Result<Self> {
        let pipeline = Pipeline::from_config(&cfg, Arc::clone(&kv))?;
        let admin_ips = cfg
            .server
            .admin_allow_ips
            .iter()
            .filter_map(|raw| match raw.trim().parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(err) => {
                    log::warn!("ignoring admin allow ip {raw:?}: {err}");
                    None
                }
            })
            .collect();
        Ok(Self {
            cfg,
            pipeline,
            registry: Registry::new(kv),
            admin_ips,
        })
    }

    fn scheme(&self) -> Scheme {
        self.pipeline.gate().scheme()
    }

    fn admin_allowed(&self, peer: IpAddr) -> bool {
        let peer = match peer {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(peer),
            v4 => v4,
        };
        peer.is_loopback() || self.admin_ips.contains(&peer)
    }
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        tokio::select! {
            _ = async {
                match sigterm.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log::info!("received SIGTERM, shutting down"),
            _ = async {
                match sigint.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log::info!("received SIGINT, shutting down"),
        }
        let _ = shutdown.send(true);
    });
}

fn spawn_sweeper(kv: Arc<dyn SharedKV>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    for prefix in [constants::KV_UPDATED_PREFIX, constants::KV_ERROR_PREFIX] {
                        let kv = Arc::clone(&kv);
                        match tokio::task::spawn_blocking(move || kv.sweep_expired(prefix.as_bytes())).await {
                            Ok(Ok(0)) => {}
                            Ok(Ok(removed)) => log::debug!("swept {removed} expired keys under {prefix}"),
                            Ok(Err(err)) => log::warn!("sweep {prefix} failed: {err}"),
                            Err(err) => log::warn!("sweep task failed: {err}"),
                        }
                    }
                }
            }
        }
    });
}

async fn run_tcp(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<AppState>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let read_timeout = state.cfg.server.read_timeout;
                    let service = service_fn(move |req| handle(req, peer, Arc::clone(&state)));
                    let mut builder = ConnBuilder::new(TokioExecutor::new());
                    builder
                        .http1()
                        .timer(TokioTimer::new())
                        .header_read_timeout(read_timeout);
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("http connection error from {peer}: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    peer: SocketAddr,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let request_id = metrics::request_id_from_headers(req.headers());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let scope_id = request_id.clone();
    let mut resp = logging::with_request_id(scope_id, async {
        let resp = route(req, peer, &state).await;
        log::debug!(
            "{peer} {method} {path} {} {}ms",
            resp.status().as_u16(),
            started.elapsed().as_millis()
        );
        resp
    })
    .await;

    if let Ok(val) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(constants::PROTOCOL_REQUEST_ID_KEY, val);
    }
    metrics::record(resp.status());
    Ok(resp)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Entry {
    Image,
    Avatar,
}

async fn route(req: Request<Incoming>, peer: SocketAddr, state: &AppState) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    if let Some(rest) = path.strip_prefix("/_admin/") {
        return handle_admin(&req, rest, peer, state);
    }

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let (entry, rest) = match segments.as_slice() {
        ["status"] => return get_only(&req, || text_response(StatusCode::OK, "OK")),
        ["metrics"] => {
            return get_only(&req, || text_response(StatusCode::OK, &metrics::render()));
        }
        ["img", rest @ ..] => (Entry::Image, rest),
        ["avatars", rest @ ..] => (Entry::Avatar, rest),
        _ => return not_found(),
    };
    if req.method() != Method::GET {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let Some(image_req) = image_request(state.scheme(), rest, req.headers()) else {
        return match entry {
            Entry::Image => not_found(),
            Entry::Avatar => redirect(&state.cfg.server.default_avatar),
        };
    };

    let deadline = state.cfg.server.write_timeout;
    let served = match tokio::time::timeout(deadline, state.pipeline.serve(image_req)).await {
        Ok(served) => served,
        Err(_) => {
            log::warn!("{path} exceeded {deadline:?}");
            return match entry {
                Entry::Image => empty_response(StatusCode::GATEWAY_TIMEOUT),
                Entry::Avatar => redirect(&state.cfg.server.default_avatar),
            };
        }
    };
    match served {
        Ok(Served::Image { record, status }) => image_response(record, status),
        Ok(Served::NotModified { last_modified }) => not_modified(last_modified),
        Err(err) => {
            log::info!("{path}: {err}");
            match entry {
                Entry::Image => error_response(state.scheme(), &err),
                Entry::Avatar => redirect(&state.cfg.server.default_avatar),
            }
        }
    }
}

fn image_request(scheme: Scheme, rest: &[&str], headers: &HeaderMap) -> Option<ImageRequest> {
    let (tag, encoded) = match (scheme, rest) {
        (Scheme::Signed, [tag, encoded]) => (Some(tag.to_string()), encoded),
        (Scheme::Registry, [encoded]) => (None, encoded),
        _ => return None,
    };
    Some(ImageRequest {
        encoded_url: encoded.to_string(),
        tag,
        if_modified_since: if_modified_since(headers),
    })
}

fn if_modified_since(headers: &HeaderMap) -> Option<i64> {
    let raw = headers.get(IF_MODIFIED_SINCE)?.to_str().ok()?;
    let at = httpdate::parse_http_date(raw).ok()?;
    let secs = at.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}

fn error_response(scheme: Scheme, err: &ProxyError) -> Response<Full<Bytes>> {
    let status = match (err.kind(), scheme) {
        (ErrorKind::BadRequest, _) => StatusCode::BAD_REQUEST,
        // unknown and blocked urls are indistinguishable from missing ones
        (ErrorKind::Forbidden, Scheme::Registry) => StatusCode::NOT_FOUND,
        (ErrorKind::Forbidden, Scheme::Signed) => StatusCode::FORBIDDEN,
        (ErrorKind::NotFound, _) => StatusCode::NOT_FOUND,
    };
    text_response(status, status.canonical_reason().unwrap_or_default())
}

fn handle_admin(
    req: &Request<Incoming>,
    rest: &str,
    peer: SocketAddr,
    state: &AppState,
) -> Response<Full<Bytes>> {
    if !state.admin_allowed(peer.ip()) {
        log::warn!("admin request from {peer} refused");
        return text_response(StatusCode::FORBIDDEN, "forbidden");
    }
    let segments: Vec<&str> = rest.split('/').collect();
    let (resource, encoded) = match segments.as_slice() {
        [resource @ ("registry" | "errors"), encoded] => (*resource, *encoded),
        _ => return not_found(),
    };
    let url = match gate::decode_url(encoded) {
        Ok(url) => url,
        Err(err) => return text_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    let key = url.as_str();

    let result = match (req.method(), resource) {
        (&Method::PUT, "registry") => {
            let Some(status) = query_param(req, "status").and_then(|raw| UrlStatus::parse(&raw)) else {
                return text_response(StatusCode::BAD_REQUEST, "status must be allowed or blocked");
            };
            log::info!("registry: {key} -> {status:?}");
            state.registry.set_status(key, status)
        }
        (&Method::DELETE, "registry") => {
            log::info!("registry: remove {key}");
            state.registry.remove(key)
        }
        (&Method::DELETE, "errors") => {
            log::info!("error log: clear {key}");
            state.pipeline.errors().clear(key)
        }
        _ => return empty_response(StatusCode::METHOD_NOT_ALLOWED),
    };
    match result {
        Ok(()) => json_response(&serde_json::json!({ "url": key, "ok": true })),
        Err(err) => {
            log::error!("admin {resource} {key} failed: {err:#}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn query_param(req: &Request<Incoming>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn get_only<F>(req: &Request<Incoming>, ok: F) -> Response<Full<Bytes>>
where
    F: FnOnce() -> Response<Full<Bytes>>,
{
    if req.method() == Method::GET {
        ok()
    } else {
        empty_response(StatusCode::METHOD_NOT_ALLOWED)
    }
}

fn image_response(record: CacheRecord, status: CacheStatus) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(record.body));
    let headers = resp.headers_mut();
    if let Ok(val) = HeaderValue::from_str(&record.content_type) {
        headers.insert(CONTENT_TYPE, val);
    }
    insert_last_modified(headers, record.last_modified);
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(constants::CACHE_CONTROL_VALUE));
    headers.insert(
        constants::PROTOCOL_CACHE_STATUS_KEY,
        HeaderValue::from_static(status.as_str()),
    );
    resp
}

fn not_modified(last_modified: i64) -> Response<Full<Bytes>> {
    let mut resp = empty_response(StatusCode::NOT_MODIFIED);
    insert_last_modified(resp.headers_mut(), last_modified);
    resp
}

fn insert_last_modified(headers: &mut HeaderMap, secs: i64) {
    let at = UNIX_EPOCH + Duration::from_secs(u64::try_from(secs).unwrap_or(0));
    if let Ok(val) = HeaderValue::from_str(&httpdate::fmt_http_date(at)) {
        headers.insert(LAST_MODIFIED, val);
    }
}

fn redirect(location: &str) -> Response<Full<Bytes>> {
    let mut resp = empty_response(StatusCode::FOUND);
    if let Ok(val) = HeaderValue::from_str(location) {
        resp.headers_mut().insert(LOCATION, val);
    }
    resp
}

fn not_found() -> Response<Full<Bytes>> {
    text_response(StatusCode::NOT_FOUND, "Not Found")
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    resp
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn json_response<T: serde::Serialize>(payload: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(payload) {
        Ok(bytes) => {
            let mut resp = Response::new(Full::new(Bytes::from(bytes)));
            resp.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            );
            resp
        }
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode"),
    }
}

