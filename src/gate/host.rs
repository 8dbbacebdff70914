use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::error::ProxyError;

const PAD_WIDTH: usize = 8;

/// Refuses origins that point into internal address space.
///
/// The prefix list is a textual comparison on the host string and misses IPv6, DNS names
/// resolving inward and redirects; [`ensure_public`] covers those when enabled.
#[derive(Clone, Debug)]
pub struct HostGuard {
    deny_prefixes: Vec<String>,
}

impl HostGuard {
    pub fn new(deny_prefixes: &[String]) -> Self {
        Self {
            deny_prefixes: deny_prefixes
                .iter()
                .filter(|p| !p.is_empty())
                .cloned()
                .collect(),
        }
    }

    pub fn check(&self, url: &Url) -> Result<(), ProxyError> {
        let host = url.host_str().unwrap_or_default();
        match self.denied_prefix(host) {
            Some(prefix) => Err(ProxyError::bad_request(format_args!(
                "host {host} matches denied prefix {prefix}"
            ))),
            None => Ok(()),
        }
    }

    fn denied_prefix(&self, host: &str) -> Option<&str> {
        let mut padded = host.to_string();
        while padded.len() < PAD_WIDTH {
            padded.push('X');
        }
        let padded = padded.as_bytes();
        self.deny_prefixes
            .iter()
            .find(|prefix| {
                let prefix = prefix.as_bytes();
                padded.len() >= prefix.len() && &padded[..prefix.len()] == prefix
            })
            .map(String::as_str)
    }
}

pub async fn ensure_public(url: &Url) -> Result<(), ProxyError> {
    let port = url.port_or_known_default().unwrap_or(80);
    let addrs: Vec<IpAddr> = match url.host() {
        Some(Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
        Some(Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
        Some(Host::Domain(name)) => tokio::net::lookup_host((name, port))
            .await
            .map_err(|err| ProxyError::bad_request(format_args!("resolve {name}: {err}")))?
            .map(|addr| addr.ip())
            .collect(),
        None => return Err(ProxyError::bad_request("url has no host")),
    };
    if addrs.is_empty() {
        return Err(ProxyError::bad_request("host resolved to no address"));
    }
    if let Some(ip) = addrs.iter().find(|ip| !is_public(ip)) {
        return Err(ProxyError::bad_request(format_args!("host resolves to internal address {ip}")));
    }
    Ok(())
}

pub fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_public_v4(ip),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => is_public_v4(&v4),
            None => is_public_v6(ip),
        },
    }
}

fn is_public_v4(ip: &Ipv4Addr) -> bool {
    !(ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast())
}

fn is_public_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local)
}
