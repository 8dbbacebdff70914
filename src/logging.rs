use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger as FlexiLogger, LoggerHandle, Naming, WriteMode};
use log::LevelFilter;
use tokio::task_local;

use crate::config::Logger;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Clone, Copy)]
struct FormatConfig {
    include_pid: bool,
}

static FORMAT_CONFIG: OnceLock<FormatConfig> = OnceLock::new();

task_local! {
    static REQUEST_ID: String;
}

/// Starts the global logger. The returned handle must outlive the program's logging.
pub fn init(config: &Logger, verbose: bool) -> Result<LoggerHandle> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        parse_level(&config.level)
    };

    FORMAT_CONFIG.get_or_init(|| FormatConfig {
        include_pid: !config.nopid,
    });

    let mut logger = FlexiLogger::try_with_str(level.as_str())
        .context("init logger")?
        .format(log_format);

    if !config.path.trim().is_empty() {
        let spec = FileSpec::try_from(Path::new(&config.path))
            .with_context(|| format!("log file {}", config.path))?;
        logger = logger
            .log_to_file(spec)
            .duplicate_to_stderr(Duplicate::Warn)
            .write_mode(WriteMode::BufferAndFlush);

        if config.max_size > 0 {
            logger = logger.rotate(
                Criterion::Size(config.max_size * 1024 * 1024),
                Naming::Numbers,
                cleanup_policy(config),
            );
        }
    }

    logger.start().context("start logger")
}

fn parse_level(raw: &str) -> LevelFilter {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

fn cleanup_policy(config: &Logger) -> Cleanup {
    if config.max_backups == 0 {
        return Cleanup::Never;
    }
    #[cfg(feature = "compress")]
    if config.compress {
        return Cleanup::KeepCompressedFiles(config.max_backups as usize);
    }
    Cleanup::KeepLogFiles(config.max_backups as usize)
}

fn log_format(
    writer: &mut dyn Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> std::io::Result<()> {
    let cfg = FORMAT_CONFIG
        .get()
        .copied()
        .unwrap_or(FormatConfig { include_pid: true });
    let ts = now.now_utc_owned().format(TIMESTAMP_FORMAT);
    write!(writer, "{} [{}]", ts, record.level())?;
    if cfg.include_pid {
        write!(writer, " pid={}", std::process::id())?;
    }
    if let Some(id) = current_request_id() {
        write!(writer, " req={}", id)?;
    }
    write!(writer, " {}", record.args())
}

pub async fn with_request_id<T>(request_id: String, fut: impl std::future::Future<Output = T>) -> T {
    REQUEST_ID.scope(request_id, fut).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|val| val.clone()).ok()
}
