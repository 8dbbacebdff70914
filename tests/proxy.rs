mod support;

use std::time::Duration;

use http::header::{CACHE_CONTROL, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED, LOCATION};
use http::{HeaderMap, Method, StatusCode};
use imgproxy::config::{Driver, Policy};
use support::*;

const DEFAULT_AVATAR: &str = "https://example.com/default-avatar.png";

#[tokio::test]
async fn test_fresh_url_is_fetched_once() {
    let body = png_bytes(10 * 1024);
    let origin = MockServer::start(resp_image(body.clone(), "image/png")).await;
    let proxy = Proxy::start().await;
    let url = origin.url("logo.png");

    let resp = proxy.get(&signed_path("img", &url)).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body, body);
    assert_eq!(resp.cache_status(), Some("MISS"));
    assert_eq!(resp.header(CONTENT_TYPE.as_str()), Some("image/png"));
    assert_eq!(resp.header(CACHE_CONTROL.as_str()), Some("public, max-age=600"));
    assert!(resp.header(LAST_MODIFIED.as_str()).is_some());
    assert!(resp.header("X-Request-ID").is_some());

    proxy.wait_cached(&url).await;
    let resp = proxy.get(&signed_path("img", &url)).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body, body);
    assert_eq!(resp.cache_status(), Some("HIT"));
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_origin_failure_is_remembered() {
    let origin = MockServer::start(resp_status(StatusCode::INTERNAL_SERVER_ERROR)).await;
    let proxy = Proxy::start_with(|cfg| cfg.server.default_avatar = DEFAULT_AVATAR.to_string()).await;
    let url = origin.url("broken.png");

    let resp = proxy.get(&signed_path("img", &url)).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
    assert!(!String::from_utf8_lossy(&resp.body).contains("500"));
    assert_eq!(origin.hits(), 1);

    let resp = proxy.get(&signed_path("img", &url)).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    let resp = proxy.get(&signed_path("avatars", &url)).await;
    assert_eq!(resp.status, StatusCode::FOUND);
    assert_eq!(resp.header(LOCATION.as_str()), Some(DEFAULT_AVATAR));
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_clearing_error_record_allows_refetch() {
    let origin = MockServer::start(resp_status(StatusCode::BAD_GATEWAY)).await;
    let proxy = Proxy::start().await;
    let url = origin.url("flaky.png");

    assert_eq!(proxy.get(&signed_path("img", &url)).await.status, StatusCode::NOT_FOUND);
    assert_eq!(origin.hits(), 1);

    let resp = proxy
        .client
        .send(Method::DELETE, &format!("/_admin/errors/{}", encode(&url)), HeaderMap::new())
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    assert_eq!(proxy.get(&signed_path("img", &url)).await.status, StatusCode::NOT_FOUND);
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn test_malformed_encoding_is_rejected_early() {
    let origin = MockServer::start(resp_image(png_bytes(64), "image/png")).await;
    let proxy = Proxy::start().await;

    let tag = imgproxy::gate::signed::sign(SECRET.as_bytes(), b"whatever");
    let resp = proxy.get(&format!("/img/{tag}/zz-not-hex")).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(origin.hits(), 0);
    assert_eq!(std::fs::read_dir(&proxy.cache_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn test_bad_tag() {
    let origin = MockServer::start(resp_image(png_bytes(64), "image/png")).await;
    let proxy = Proxy::start_with(|cfg| cfg.server.default_avatar = DEFAULT_AVATAR.to_string()).await;
    let url = origin.url("a.png");
    let forged = format!("/{}/{}/{}", "img", "00".repeat(20), encode(&url));

    let resp = proxy.get(&forged).await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);

    let resp = proxy.get(&forged.replacen("/img/", "/avatars/", 1)).await;
    assert_eq!(resp.status, StatusCode::FOUND);
    assert_eq!(resp.header(LOCATION.as_str()), Some(DEFAULT_AVATAR));
    assert_eq!(origin.hits(), 0);
}

#[tokio::test]
async fn test_internal_hosts_are_refused() {
    let origin = MockServer::start(resp_image(png_bytes(64), "image/png")).await;
    // default deny list
    let proxy = Proxy::start_with(|cfg| {
        cfg.security.deny_host_prefixes = imgproxy::constants::DEFAULT_DENY_HOST_PREFIXES
            .iter()
            .map(|p| p.to_string())
            .collect();
    })
    .await;

    let resp = proxy.get(&signed_path("img", &origin.url("a.png"))).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(origin.hits(), 0);
}

#[tokio::test]
async fn test_avatar_success() {
    let body = png_bytes(2048);
    let origin = MockServer::start(resp_image(body.clone(), "image/png")).await;
    let proxy = Proxy::start().await;

    let resp = proxy.get(&signed_path("avatars", &origin.url("me.png"))).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body, body);
}

#[tokio::test]
async fn test_conditional_get() {
    let origin = MockServer::start(resp_image(png_bytes(1024), "image/png")).await;
    let proxy = Proxy::start().await;
    let url = origin.url("cond.png");
    let path = signed_path("img", &url);

    let first = proxy.get(&path).await;
    assert_eq!(first.status, StatusCode::OK);
    let last_modified = first.header(LAST_MODIFIED.as_str()).unwrap().to_string();
    proxy.wait_cached(&url).await;

    let mut headers = HeaderMap::new();
    headers.insert(IF_MODIFIED_SINCE, last_modified.parse().unwrap());
    let resp = proxy.client.send(Method::GET, &path, headers).await;
    assert_eq!(resp.status, StatusCode::NOT_MODIFIED);
    assert!(resp.body.is_empty());
    assert_eq!(resp.header(LAST_MODIFIED.as_str()), Some(last_modified.as_str()));

    let mut headers = HeaderMap::new();
    headers.insert(IF_MODIFIED_SINCE, "Thu, 01 Jan 2015 00:00:00 GMT".parse().unwrap());
    let resp = proxy.client.send(Method::GET, &path, headers).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body.len(), 1024);
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_status_metrics_and_routing() {
    let proxy = Proxy::start().await;

    let resp = proxy.get("/status").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body.as_ref(), b"OK");

    let resp = proxy.client.send(Method::POST, "/status", HeaderMap::new()).await;
    assert_eq!(resp.status, StatusCode::METHOD_NOT_ALLOWED);

    let resp = proxy.get("/metrics").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&resp.body).contains("imgproxy_requests_total"));

    assert_eq!(proxy.get("/nope").await.status, StatusCode::NOT_FOUND);

    // registry-shaped route under the signed policy
    let resp = proxy.get(&format!("/img/{}", encode("https://example.com/a.png"))).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    let path = signed_path("img", "https://example.com/a.png");
    let resp = proxy.client.send(Method::PUT, &path, HeaderMap::new()).await;
    assert_eq!(resp.status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let proxy = Proxy::start().await;
    let mut headers = HeaderMap::new();
    headers.insert("X-Request-ID", "req-1234".parse().unwrap());
    let resp = proxy.client.send(Method::GET, "/status", headers).await;
    assert_eq!(resp.header("X-Request-ID"), Some("req-1234"));
}

#[tokio::test]
async fn test_registry_policy() {
    let body = png_bytes(512);
    let origin = MockServer::start(resp_image(body.clone(), "image/png")).await;
    let proxy = Proxy::start_with(|cfg| {
        cfg.security.policy = Policy::Registry;
        cfg.security.secret.clear();
    })
    .await;
    let url = origin.url("registered.png");
    let path = format!("/img/{}", encode(&url));
    let admin = format!("/_admin/registry/{}", encode(&url));

    assert_eq!(proxy.get(&path).await.status, StatusCode::NOT_FOUND);
    assert_eq!(origin.hits(), 0);

    let resp = proxy
        .client
        .send(Method::PUT, &format!("{admin}?status=allowed"), HeaderMap::new())
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = proxy.get(&path).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body, body);
    assert_eq!(resp.cache_status(), Some("MISS"));

    let resp = proxy
        .client
        .send(Method::PUT, &format!("{admin}?status=blocked"), HeaderMap::new())
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(proxy.get(&path).await.status, StatusCode::NOT_FOUND);

    let resp = proxy.client.send(Method::DELETE, &admin, HeaderMap::new()).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(proxy.get(&path).await.status, StatusCode::NOT_FOUND);

    // signed-shaped route under the registry policy
    assert_eq!(proxy.get(&signed_path("img", &url)).await.status, StatusCode::NOT_FOUND);
    assert_eq!(origin.hits(), 1);

    let resp = proxy
        .client
        .send(Method::PUT, &format!("{admin}?status=maybe"), HeaderMap::new())
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_split_store_serves_stale_and_refreshes() {
    let body = png_bytes(2048);
    let origin = MockServer::start(resp_image(body.clone(), "image/png")).await;
    let proxy = Proxy::start_with(|cfg| {
        cfg.storage.driver = Driver::Split;
        cfg.storage.freshness_ttl = Duration::from_secs(1);
    })
    .await;
    let path = signed_path("img", &origin.url("split.png"));

    let resp = proxy.get(&path).await;
    assert_eq!(resp.cache_status(), Some("MISS"));
    tokio::time::sleep(Duration::from_millis(1300)).await;

    let resp = proxy.get(&path).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.cache_status(), Some("STALE"));
    assert_eq!(resp.body, body);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(origin.hits(), 2);

    let resp = proxy.get(&path).await;
    assert_eq!(resp.cache_status(), Some("HIT"));
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() {
    let body = png_bytes(4096);
    let origin = MockServer::start_with_delay(
        Duration::from_millis(300),
        resp_image(body.clone(), "image/png"),
    )
    .await;
    let proxy = Proxy::start().await;
    let path = signed_path("img", &origin.url("popular.png"));

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let client = proxy.client.clone();
        let path = path.clone();
        tasks.push(tokio::spawn(async move { client.get(&path).await }));
    }
    for task in tasks {
        let resp = task.await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, body);
    }
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_handler_deadline() {
    let origin = MockServer::start_with_delay(
        Duration::from_millis(800),
        resp_image(png_bytes(64), "image/png"),
    )
    .await;
    let proxy = Proxy::start_with(|cfg| cfg.server.write_timeout = Duration::from_millis(100)).await;

    let resp = proxy.get(&signed_path("img", &origin.url("slow.png"))).await;
    assert_eq!(resp.status, StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_avatar_deadline_redirects() {
    let origin = MockServer::start_with_delay(
        Duration::from_millis(800),
        resp_image(png_bytes(64), "image/png"),
    )
    .await;
    let proxy = Proxy::start_with(|cfg| {
        cfg.server.write_timeout = Duration::from_millis(100);
        cfg.server.default_avatar = DEFAULT_AVATAR.to_string();
    })
    .await;

    let resp = proxy.get(&signed_path("avatars", &origin.url("slow.png"))).await;
    assert_eq!(resp.status, StatusCode::FOUND);
    assert_eq!(resp.header(LOCATION.as_str()), Some(DEFAULT_AVATAR));
}
