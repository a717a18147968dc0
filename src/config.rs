use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::{Pipeline, StoreOptions};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Cache database (defaults to $XDG_DATA_HOME/stagecache/cache.db)
  pub database: Option<PathBuf>,
  /// Track shadow rows for pending changes
  pub caching: bool,
  /// Store date-time strings in tagged form
  pub transform_dates: bool,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      database: None,
      caching: true,
      transform_dates: false,
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter directive when RUST_LOG is unset
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stagecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stagecache/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stagecache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stagecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-defaults configuration
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Transform pipeline described by this configuration.
  pub fn pipeline(&self) -> Pipeline {
    Pipeline::new().with_transform_dates(self.transform_dates)
  }

  pub fn store_options(&self) -> StoreOptions {
    StoreOptions {
      caching: self.caching,
    }
  }
}
