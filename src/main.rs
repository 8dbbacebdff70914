use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;

use imgproxy::config::{self, Bootstrap};
use imgproxy::logging;
use imgproxy::server;

#[derive(Parser, Debug)]
#[command(name = "imgproxy", about = "Caching image proxy", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Listen address, overrides server.addr
    #[arg(short = 'a', long = "addr")]
    addr: Option<String>,

    /// Cache directory, overrides storage.path
    #[arg(short = 'd', long = "dir")]
    dir: Option<PathBuf>,

    /// HMAC secret, overrides security.secret
    #[arg(short = 's', long = "secret")]
    secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut cfg, ignored) = match &cli.config {
        Some(path) => config::load(path)?,
        None => (Bootstrap::default(), Vec::new()),
    };

    if let Some(addr) = &cli.addr {
        cfg.server.addr = addr.clone();
    }
    if let Some(dir) = &cli.dir {
        cfg.storage.path = dir.clone();
    }
    if let Some(secret) = &cli.secret {
        cfg.security.secret = secret.clone();
    }

    let _logger = logging::init(&cfg.logger, cli.verbose)?;

    if cfg.strict && !ignored.is_empty() {
        return Err(anyhow!("unknown config fields: {}", ignored.join(", ")));
    }

    if !ignored.is_empty() {
        log::warn!("ignoring unknown config fields: {}", ignored.join(", "));
    }

    cfg.validate()?;

    match &cli.config {
        Some(path) => log::info!("imgproxy starting with config {}", path.display()),
        None => log::info!("imgproxy starting with built-in defaults"),
    }

    server::run(Arc::new(cfg)).await
}
