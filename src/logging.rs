//! Tracing setup for the binary. The library itself never installs a
//! subscriber.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

const DEFAULT_FILTER: &str = "stockroom=info,warn";

/// Log to a daily-rolling file under `<cache dir>/logs`.
///
/// `RUST_LOG` wins over the configured `log_level`. Keep the returned guard
/// alive for the life of the process or buffered lines are lost.
pub fn init(config: &Config) -> Result<WorkerGuard> {
  let dir = config.cache.dir()?.join("logs");
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "stockroom.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter(config.log_level.as_deref()))
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

fn filter(level: Option<&str>) -> EnvFilter {
  EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(level.unwrap_or(DEFAULT_FILTER)))
    .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
