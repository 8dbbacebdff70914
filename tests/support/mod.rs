#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use imgproxy::cachekey::CacheKey;
use imgproxy::config::{Bootstrap, Policy};
use imgproxy::gate::signed;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const SECRET: &str = "test-secret";

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cache_status(&self) -> Option<&str> {
        self.header("X-Cache")
    }
}

#[derive(Clone)]
pub struct TestClient {
    proxy_addr: SocketAddr,
}

impl TestClient {
    pub fn new(proxy_addr: SocketAddr) -> Self {
        Self { proxy_addr }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.send(Method::GET, path, HeaderMap::new()).await
    }

    pub async fn send(&self, method: Method, path: &str, headers: HeaderMap) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.proxy_addr)
            .await
            .expect("connect proxy");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, self.proxy_addr.to_string());
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(Full::new(Bytes::new())).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();

        TestResponse {
            status,
            headers,
            body,
        }
    }
}

type Handler = dyn Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync;

/// Origin stand-in that counts every request it answers.
pub struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        Self::start_with_delay(Duration::ZERO, handler).await
    }

    /// Like [`MockServer::start`] but holds every response back for `delay`.
    pub async fn start_with_delay<F>(delay: Duration, handler: F) -> Self
    where
        F: Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler: Arc<Handler> = Arc::new(handler);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let counter = Arc::clone(&counter);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                counter.fetch_add(1, Ordering::SeqCst);
                                let resp = handler(&req);
                                async move {
                                    if !delay.is_zero() {
                                        tokio::time::sleep(delay).await;
                                    }
                                    Ok::<_, hyper::Error>(resp)
                                }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// A proxy instance on an ephemeral port with its own cache directory and in-memory index.
pub struct Proxy {
    pub client: TestClient,
    pub cache_dir: PathBuf,
    shutdown: watch::Sender<bool>,
    _temp_dir: tempfile::TempDir,
}

impl Proxy {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with<F>(edit: F) -> Self
    where
        F: FnOnce(&mut Bootstrap),
    {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = test_config(&temp_dir);
        edit(&mut cfg);
        cfg.validate().expect("valid test config");
        let cache_dir = cfg.storage.path.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(err) = imgproxy::server::serve(Arc::new(cfg), listener, rx).await {
                panic!("proxy stopped: {err:#}");
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            client: TestClient::new(addr),
            cache_dir,
            shutdown,
            _temp_dir: temp_dir,
        }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.client.get(path).await
    }

    /// Where the self-contained backend puts the record for `url`.
    pub fn cache_path(&self, url: &str) -> PathBuf {
        CacheKey::new(url).path(&self.cache_dir)
    }

    /// Waits for the detached store write of `url` to land on disk.
    pub async fn wait_cached(&self, url: &str) {
        let path = self.cache_path(url);
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} was never written", path.display());
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn test_config(dir: &tempfile::TempDir) -> Bootstrap {
    let mut cfg = Bootstrap::default();
    cfg.security.policy = Policy::Signed;
    cfg.security.secret = SECRET.to_string();
    // mock origins listen on loopback
    cfg.security.deny_host_prefixes = Vec::new();
    cfg.storage.path = dir.path().join("cache");
    cfg.storage.db_type = "memory".to_string();
    cfg.storage.db_path = dir.path().join("index");
    cfg.origin.timeout = Duration::from_secs(5);
    cfg
}

pub fn encode(url: &str) -> String {
    hex::encode(url.as_bytes())
}

pub fn signed_path(prefix: &str, url: &str) -> String {
    let tag = signed::sign(SECRET.as_bytes(), url.as_bytes());
    format!("/{prefix}/{tag}/{}", encode(url))
}

/// A PNG signature followed by `size - 8` random bytes.
pub fn png_bytes(size: usize) -> Bytes {
    let mut buf = vec![0u8; size.max(PNG_SIGNATURE.len())];
    rand::thread_rng().fill_bytes(&mut buf);
    buf[..PNG_SIGNATURE.len()].copy_from_slice(&PNG_SIGNATURE);
    Bytes::from(buf)
}

pub fn resp_image(body: Bytes, content_type: &'static str) -> impl Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync {
    move |_req: &Request<Incoming>| {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", content_type.parse().unwrap());
        headers.insert("Content-Length", body.len().to_string().parse().unwrap());
        build_response(StatusCode::OK, headers, body.clone())
    }
}

pub fn resp_status(status: StatusCode) -> impl Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync {
    move |_req: &Request<Incoming>| {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "text/plain".parse().unwrap());
        build_response(status, headers, Bytes::from_static(b"origin error"))
    }
}

pub fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (k, v) in headers.iter() {
        builder = builder.header(k, v);
    }
    builder.body(Full::new(body)).unwrap()
}
