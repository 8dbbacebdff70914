use std::fmt;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

pub const KEY_HASH_SIZE: usize = 20;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    url: String,
    hash: [u8; KEY_HASH_SIZE],
}

impl CacheKey {
    pub fn new(url: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(url.as_bytes());
        let mut hash = [0u8; KEY_HASH_SIZE];
        hash.copy_from_slice(&hasher.finalize());
        Self {
            url: url.to_string(),
            hash,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn hash(&self) -> &[u8; KEY_HASH_SIZE] {
        &self.hash
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(hex::encode(&self.hash[0..1]))
            .join(hex::encode(&self.hash[1..2]))
            .join(hex::encode(&self.hash[2..3]))
            .join(hex::encode(&self.hash[3..]))
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(self.relative_path())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}:{}}}", self.hash_hex(), self.url)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
