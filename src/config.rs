use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name under the platform config/data roots.
const APP_NAME: &str = "bridgesync";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Root for the SQLite database, staged blobs and logs.
  /// Defaults to `$XDG_DATA_HOME/bridgesync`.
  pub data_dir: Option<PathBuf>,
  /// Default tracing filter when `RUST_LOG` is unset.
  pub log_level: String,
  pub search_cache: SearchCacheConfig,
  /// Lifetime of cached profile summaries.
  pub summary_ttl_secs: u64,
  /// Concurrent blob transfers per upload batch.
  pub upload_concurrency: usize,
  /// Search terms beyond this count are ignored.
  pub max_search_terms: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchCacheConfig {
  /// Total weight budget of the search result cache.
  pub capacity: usize,
  /// Weight charged per result row.
  pub unit_cost: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      data_dir: None,
      log_level: "info".to_string(),
      search_cache: SearchCacheConfig::default(),
      summary_ttl_secs: 5 * 60,
      upload_concurrency: 3,
      max_search_terms: 10,
    }
  }
}

impl Default for SearchCacheConfig {
  fn default() -> Self {
    Self {
      capacity: 20_000,
      unit_cost: 200,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./bridgesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/bridgesync/config.yaml
  ///
  /// Unlike an explicit path, a missing implicit file is not an error: the
  /// engine runs on defaults.
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
    let local = PathBuf::from("bridgesync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_NAME).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.upload_concurrency == 0 {
      return Err(eyre!("upload_concurrency must be at least 1"));
    }
    if self.search_cache.capacity == 0 {
      return Err(eyre!("search_cache.capacity must be positive"));
    }
    Ok(())
  }

  /// Resolve the data directory, falling back to the platform data dir.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join(APP_NAME))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("sync.db"))
  }

  pub fn summary_ttl(&self) -> Duration {
    Duration::from_secs(self.summary_ttl_secs)
  }
}
