use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::status::{OwnerId, SectionScope};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// SQLite database file (defaults to the data directory)
  pub database: Option<PathBuf>,
  /// Seconds between two update passes of `run`
  #[serde(default = "default_poll_interval")]
  pub poll_interval_secs: u64,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub owners: Vec<OwnerConfig>,
  #[serde(default)]
  pub sections: Vec<SectionConfig>,
}

fn default_poll_interval() -> u64 {
  60
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Upper bound for how long HTTP responses are kept
  #[serde(default = "default_cache_ttl")]
  pub ttl_secs: u64,
  /// Seconds between two sweeps of expired entries
  #[serde(default = "default_cleanup_interval")]
  pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      ttl_secs: default_cache_ttl(),
      cleanup_interval_secs: default_cleanup_interval(),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_cache_ttl() -> u64 {
  24 * 60 * 60
}

fn default_cleanup_interval() -> u64 {
  30 * 60
}

/// An account whose sections are kept fresh.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OwnerConfig {
  pub id: i64,
  pub name: String,
}

/// A section fetched from an HTTP endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SectionConfig {
  pub id: String,
  /// Display name (defaults to the id)
  pub name: Option<String>,
  /// `owner` (per account) or `global`
  #[serde(default)]
  pub scope: SectionScope,
  /// Seconds after a completed run until the data counts as expired
  pub timeout_secs: u64,
  /// URL template, `{owner}` is replaced with the owner id
  pub url: String,
  /// Walk `?page=N` using the `X-Pages` response header
  #[serde(default)]
  pub paged: bool,
}

impl SectionConfig {
  pub fn display_name(&self) -> &str {
    self.name.as_deref().unwrap_or(&self.id)
  }

  pub fn timeout(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.timeout_secs as i64)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./mirrorsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/mirrorsync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/mirrorsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("mirrorsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("mirrorsync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.poll_interval_secs == 0 {
      return Err(eyre!("poll_interval_secs must be positive"));
    }
    check_max("poll_interval_secs", self.poll_interval_secs)?;
    check_max("cache.ttl_secs", self.cache.ttl_secs)?;
    check_max("cache.cleanup_interval_secs", self.cache.cleanup_interval_secs)?;

    let mut owners = BTreeSet::new();
    for owner in &self.owners {
      if OwnerId(owner.id).is_global() {
        return Err(eyre!("Owner id {} is reserved", owner.id));
      }
      if !owners.insert(owner.id) {
        return Err(eyre!("Duplicate owner id {}", owner.id));
      }
    }

    let mut sections = BTreeSet::new();
    for section in &self.sections {
      if section.id.is_empty() {
        return Err(eyre!("Section id must not be empty"));
      }
      if !sections.insert(section.id.as_str()) {
        return Err(eyre!("Duplicate section id {}", section.id));
      }
      if section.timeout_secs == 0 {
        return Err(eyre!("Section {} needs a positive timeout_secs", section.id));
      }
      check_max(&format!("timeout_secs of section {}", section.id), section.timeout_secs)?;
    }

    Ok(())
  }

  pub fn poll_interval(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.poll_interval_secs)
  }
}

/// Upper bound for every duration setting: ten years.
const MAX_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn check_max(name: &str, secs: u64) -> Result<()> {
  if secs > MAX_SECS {
    return Err(eyre!("{} must be at most {} seconds, got {}", name, MAX_SECS, secs));
  }
  Ok(())
}
