use std::sync::OnceLock;

use http::{HeaderMap, StatusCode};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::constants;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric definition");
    registry()
        .register(Box::new(counter.clone()))
        .expect("metric registration");
    counter
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).expect("metric definition");
    registry()
        .register(Box::new(counter.clone()))
        .expect("metric registration");
    counter
}

fn requests_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| counter("imgproxy_requests_total", "Total requests"))
}

fn responses_code_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec("imgproxy_responses_code_total", "Responses by status code", &["code"])
    })
}

fn cache_status_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec("imgproxy_cache_status_total", "Image lookups by cache status", &["status"])
    })
}

fn origin_fetch_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec("imgproxy_origin_fetch_total", "Origin fetches by result", &["result"])
    })
}

fn store_write_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec(
            "imgproxy_store_write_total",
            "Store writes by backend and outcome",
            &["backend", "outcome"],
        )
    })
}

fn gate_rejections_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec("imgproxy_gate_rejections_total", "Requests refused by the security gate", &["kind"])
    })
}

pub fn record(status: StatusCode) {
    requests_total().inc();
    let code = status.as_u16().to_string();
    responses_code_total().with_label_values(&[code.as_str()]).inc();
}

pub fn record_cache_status(status: &str) {
    cache_status_total().with_label_values(&[status]).inc();
}

pub fn record_origin_fetch(result: &str) {
    origin_fetch_total().with_label_values(&[result]).inc();
}

pub fn record_store_write(backend: &str, outcome: &str) {
    store_write_total().with_label_values(&[backend, outcome]).inc();
}

pub fn record_gate_rejection(kind: &str) {
    gate_rejections_total().with_label_values(&[kind]).inc();
}

pub fn render() -> String {
    let _ = requests_total();
    let families = registry().gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&families, &mut buf).unwrap_or(());
    String::from_utf8(buf).unwrap_or_default()
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(constants::PROTOCOL_REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(|v| v.to_string())
        .unwrap_or_else(generate_request_id)
}

pub fn generate_request_id() -> String {
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
