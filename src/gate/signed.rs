use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::ProxyError;
use crate::gate::host::HostGuard;
use crate::gate::{decode_hex, parse_url, Admitted, GateRequest, Scheme, SecurityGate};

type HmacSha1 = Hmac<Sha1>;

pub struct SignedGate {
    secret: Vec<u8>,
    guard: HostGuard,
}

impl SignedGate {
    pub fn new(secret: &[u8], guard: HostGuard) -> Self {
        Self {
            secret: secret.to_vec(),
            guard,
        }
    }

    pub fn verify(&self, raw: &[u8], tag: &str) -> bool {
        let Ok(expected) = hex::decode(tag) else {
            return false;
        };
        let Ok(mut mac) = HmacSha1::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(raw);
        mac.verify_slice(&expected).is_ok()
    }
}

impl SecurityGate for SignedGate {
    fn scheme(&self) -> Scheme {
        Scheme::Signed
    }

    fn admit(&self, req: &GateRequest) -> Result<Admitted, ProxyError> {
        let raw = decode_hex(&req.encoded_url)?;
        let tag = req
            .tag
            .as_deref()
            .ok_or_else(|| ProxyError::forbidden("missing tag"))?;
        if !self.verify(&raw, tag) {
            return Err(ProxyError::forbidden("tag mismatch"));
        }
        let url = parse_url(&raw)?;
        self.guard.check(&url)?;
        Ok(Admitted { url })
    }
}

pub fn sign(secret: &[u8], raw: &[u8]) -> String {
    let mut mac = match HmacSha1::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(raw);
    hex::encode(mac.finalize().into_bytes())
}
