pub mod cachekey;
pub mod config;
pub mod constants;
pub mod error;
pub mod gate;
pub mod logging;
pub mod metrics;
pub mod origin;
pub mod pipeline;
pub mod server;
pub mod storage;
