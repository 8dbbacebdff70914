use std::io::{self, Read};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use imgproxy::cachekey::CacheKey;
use imgproxy::gate::{self, signed};

#[derive(Parser, Debug)]
#[command(name = "imgctl", about = "Build and inspect imgproxy URLs", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hex-encode an origin URL for the registry policy route
    Encode {
        /// Origin URL, read from stdin when omitted
        url: Option<String>,
    },
    /// Produce the signed path `/img/{hmac}/{hex}` for an origin URL
    Sign {
        #[arg(short = 's', long = "secret")]
        secret: String,
        /// Path prefix, e.g. img or avatars
        #[arg(long = "prefix", default_value = "img")]
        prefix: String,
        url: Option<String>,
    },
    /// Decode a hex-encoded URL and show its cache location
    Decode { encoded: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Encode { url } => {
            let url = read_url(url)?;
            println!("{}", hex::encode(url.as_bytes()));
        }
        Command::Sign { secret, prefix, url } => {
            let url = read_url(url)?;
            let tag = signed::sign(secret.as_bytes(), url.as_bytes());
            println!("/{}/{}/{}", prefix.trim_matches('/'), tag, hex::encode(url.as_bytes()));
        }
        Command::Decode { encoded } => {
            let url = gate::decode_url(encoded.trim()).map_err(|err| anyhow!("{err}"))?;
            let key = CacheKey::new(url.as_str());
            println!("url:  {url}");
            println!("hash: {}", key.hash_hex());
            println!("path: {}", key.relative_path().display());
        }
    }
    Ok(())
}

fn read_url(arg: Option<String>) -> Result<String> {
    let raw = match arg {
        Some(url) => url,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf).context("read stdin")?;
            buf
        }
    };
    let url = raw.trim();
    if url.is_empty() {
        return Err(anyhow!("no url given"));
    }
    Ok(url.to_string())
}
