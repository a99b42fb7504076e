//! Configuration management for batch sizing, locking, retention, and paths.

use std::{
   fs,
   path::{Path, PathBuf},
   sync::OnceLock,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Exclusive upper bound for any batch size unless overridden.
pub const DEFAULT_BATCH_SIZE_UPPER_BOUND: usize = 9_999_999;

/// Engine configuration loaded from config file and environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   pub batch_size:                 usize,
   pub batch_size_upper_bound:     usize,
   pub requires_update_batch_size: usize,
   pub history_retention_days:     u32,
   pub lock_ttl_ms:                u64,
   pub store_name:                 String,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         batch_size:                 250,
         batch_size_upper_bound:     DEFAULT_BATCH_SIZE_UPPER_BOUND,
         requires_update_batch_size: 2500,
         history_retention_days:     7,
         lock_ttl_ms:                1_800_000,
         store_name:                 "indexing".to_string(),
      }
   }
}

impl Config {
   pub fn load() -> Self {
      Self::load_from(config_file_path())
   }

   /// Loads defaults, then `path` if it exists, then `INDEXSYNC_*` variables.
   pub fn load_from(path: &Path) -> Self {
      let mut figment = Figment::from(Serialized::defaults(Self::default()));
      if path.exists() {
         figment = figment.merge(Toml::file(path));
      }

      figment
         .merge(Env::prefixed("INDEXSYNC_").lowercase(true))
         .extract()
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   /// Writes the default configuration to `path` if nothing exists there yet.
   pub fn create_default_config(path: &Path) -> Result<()> {
      if path.exists() {
         return Ok(());
      }
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      let toml = toml::to_string_pretty(&Self::default())
         .map_err(|e| ConfigError::Invalid(format!("failed to render default config: {e}")))?;
      fs::write(path, toml)?;
      Ok(())
   }

   pub fn validate(&self) -> Result<()> {
      validate_batch_size(self.batch_size, self.batch_size_upper_bound)?;
      validate_batch_size(self.requires_update_batch_size, self.batch_size_upper_bound)?;
      if self.lock_ttl_ms == 0 {
         return Err(ConfigError::Invalid("lock_ttl_ms must be greater than 0".to_string()).into());
      }
      if self.store_name.trim().is_empty() {
         return Err(ConfigError::Invalid("store_name must not be empty".to_string()).into());
      }
      Ok(())
   }

   pub fn lock_ttl(&self) -> chrono::Duration {
      chrono::Duration::milliseconds(self.lock_ttl_ms as i64)
   }
}

/// Checks `0 < size < upper_bound`.
pub fn validate_batch_size(size: usize, upper_bound: usize) -> Result<usize> {
   if size == 0 || size >= upper_bound {
      return Err(ConfigError::InvalidBatchSize { size, upper_bound }.into());
   }
   Ok(size)
}

/// Returns the global configuration instance
pub fn get() -> &'static Config {
   CONFIG.get_or_init(Config::load)
}

/// Returns the base directory for indexsync data and configuration
pub fn base_dir() -> &'static PathBuf {
   static ONCE: OnceLock<PathBuf> = OnceLock::new();
   ONCE.get_or_init(|| resolve_base_dir(".indexsync"))
}

fn resolve_base_dir(dir_name: &str) -> PathBuf {
   BaseDirs::new()
      .map(|d| d.home_dir().join(dir_name))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(dir_name))
      })
      .unwrap_or_else(|| {
         std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(dir_name)
      })
}

macro_rules! define_paths {
   ($($fn_name:ident: $path:literal),* $(,)?) => {
      $(
         pub fn $fn_name() -> &'static PathBuf {
            static ONCE: OnceLock<PathBuf> = OnceLock::new();
            ONCE.get_or_init(|| base_dir().join($path))
         }
      )*
   };
}

define_paths! {
   config_file_path: "config.toml",
   data_dir: "data",
}
