//! Tracing setup for hosts embedding the engine.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Install a global subscriber writing to `<data_dir>/logs/bridgesync.<date>.log`.
///
/// `RUST_LOG` overrides `config.log_level`. The returned guard flushes the
/// non-blocking writer on drop, so the host must keep it alive.
pub fn init(config: &Config) -> Result<WorkerGuard> {
  let log_dir = config.data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = RollingFileAppender::builder()
    .rotation(Rotation::DAILY)
    .filename_prefix("bridgesync")
    .filename_suffix("log")
    .build(&log_dir)
    .map_err(|e| eyre!("Failed to create log appender: {}", e))?;
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.log_level))
    .map_err(|e| eyre!("Invalid log level '{}': {}", config.log_level, e))?;

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
