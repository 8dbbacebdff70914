use std::time::Duration;

pub const PROTOCOL_CACHE_STATUS_KEY: &str = "X-Cache";
pub const PROTOCOL_REQUEST_ID_KEY: &str = "X-Request-ID";

pub const CACHE_CONTROL_VALUE: &str = "public, max-age=600";

pub const DEFAULT_MAX_SIZE: u64 = 5 * (1 << 20);

pub const DEFAULT_FRESHNESS_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_ERROR_TTL: Duration = Duration::from_secs(600);

pub const KV_RECORD_PREFIX: &str = "img/";
pub const KV_UPDATED_PREFIX: &str = "img/updated/";
pub const KV_ERROR_PREFIX: &str = "img/err/";
pub const KV_REGISTRY_PREFIX: &str = "reg/";

pub const DEFAULT_DENY_HOST_PREFIXES: [&str; 4] = ["10.", "127.", "169.254.", "192.168."];

pub const DEFAULT_USER_AGENT: &str = concat!("imgproxy/", env!("CARGO_PKG_VERSION"));
