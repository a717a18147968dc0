//! Tracing setup for the command line tool.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Install the global subscriber.
///
/// RUST_LOG takes precedence over the configured level. When a log file is
/// configured the returned guard must be kept alive to flush it.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

  match &config.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let appender = tracing_appender::rolling::never(dir, name);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(filter)
        .with(
          tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

      Ok(None)
    }
  }
}
