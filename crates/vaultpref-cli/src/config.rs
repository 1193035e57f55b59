use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use vaultpref_storage::{Algorithm, PoolSize, StoreOptions};

/// User-level configuration loaded from `~/.config/vaultpref/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Override for the store directory.
    pub data_dir: Option<PathBuf>,
    /// Cipher for newly created stores.
    pub algorithm: Algorithm,
    /// Upper bound on how long `--apply` writes wait before reaching disk.
    pub flush_interval_ms: u64,
    pub keyring: KeyringConfig,
    pub pool: PoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            algorithm: Algorithm::default(),
            flush_interval_ms: 100,
            keyring: KeyringConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// Keyring entry holding the key-encryption key.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeyringConfig {
    pub service: String,
    pub account: String,
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            service: "vaultpref".to_string(),
            account: "master-key".to_string(),
        }
    }
}

/// Cipher pool sizes; unset sides follow the number of cores.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    pub encryptors: Option<usize>,
    pub decryptors: Option<usize>,
}

impl Config {
    pub fn store_options(&self) -> StoreOptions {
        let cores = PoolSize::default();
        StoreOptions {
            algorithm: self.algorithm,
            pool: PoolSize {
                encryptors: self.pool.encryptors.unwrap_or(cores.encryptors),
                decryptors: self.pool.decryptors.unwrap_or(cores.decryptors),
            },
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("vaultpref").join("config.toml"))
}

/// Write the config to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_if_missing(config, &default_path()?)
}

fn write_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
