use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use http::{HeaderValue, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use url::Url;

use crate::config;
use crate::error::{OriginRejection, ProxyError};
use crate::storage::CacheRecord;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound client for origin images. Redirects are not followed.
#[derive(Clone)]
pub struct OriginFetcher {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
    max_size: u64,
    user_agent: HeaderValue,
}

impl OriginFetcher {
    pub fn new(cfg: &config::Origin) -> Result<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        connector.enforce_http(false);
        let https = if cfg.insecure_skip_verify {
            HttpsConnectorBuilder::new()
                .with_tls_config(insecure_tls_config()?)
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(connector)
        } else {
            HttpsConnectorBuilder::new()
                .with_native_roots()
                .context("load native root certificates")?
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(connector)
        };
        let client = Client::builder(TokioExecutor::new()).build(https);
        let user_agent = HeaderValue::from_str(&cfg.user_agent)
            .with_context(|| format!("invalid user agent {:?}", cfg.user_agent))?;
        Ok(Self {
            client,
            timeout: cfg.timeout,
            max_size: cfg.max_size,
            user_agent,
        })
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub async fn fetch(&self, url: &Url) -> Result<CacheRecord, ProxyError> {
        match tokio::time::timeout(self.timeout, self.fetch_inner(url)).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::unavailable(format_args!(
                "timed out after {:?}",
                self.timeout
            ))),
        }
    }

    async fn fetch_inner(&self, url: &Url) -> Result<CacheRecord, ProxyError> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .header(USER_AGENT, self.user_agent.clone())
            .body(Full::new(Bytes::new()))
            .map_err(|err| ProxyError::bad_request(format_args!("build origin request: {err}")))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|err| ProxyError::unavailable(format_args!("{err}")))?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(OriginRejection::UnexpectedStatus(status.as_u16()).into());
        }

        if let Some(len) = content_length(resp.headers()) {
            if len > self.max_size {
                return Err(OriginRejection::ExceededMaxSize(len).into());
            }
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("image/") {
            return Err(OriginRejection::InvalidContentType(content_type).into());
        }

        let limit = usize::try_from(self.max_size).unwrap_or(usize::MAX);
        let body = match Limited::new(resp.into_body(), limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(OriginRejection::ExceededMaxSize(self.max_size).into());
            }
            Err(err) => return Err(ProxyError::unavailable(format_args!("read body: {err}"))),
        };

        log::debug!("fetched {url} ({} bytes, {content_type})", body.len());
        Ok(CacheRecord::new(content_type, body))
    }
}

fn content_length(headers: &http::HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn insecure_tls_config() -> Result<rustls::ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .context("tls protocol versions")?;
    Ok(builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth())
}

#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
