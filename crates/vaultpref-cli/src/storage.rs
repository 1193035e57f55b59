use std::path::PathBuf;

use crate::config::Config;
use color_eyre::Result;
use dirs::data_dir;
use tracing::debug;
use vaultpref_storage::{EntryStore, KeyringWrapper};

/// Resolve the default data directory for the store.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("vaultpref"))
}

/// Open the store described by the config, keyed through the OS keychain.
pub fn store_from_config(config: &Config) -> Result<EntryStore> {
    let root = match &config.data_dir {
        Some(root) => root.clone(),
        None => default_data_dir()?,
    };
    debug!(?root, algorithm = ?config.algorithm, "opening encrypted store");
    let wrapper = KeyringWrapper::new(&config.keyring.service, &config.keyring.account);
    Ok(EntryStore::open(root, config.store_options(), wrapper)?)
}

/// Helper for tests to open a store rooted at a temp dir with an in-memory key.
#[cfg(test)]
pub fn test_store(root: impl Into<PathBuf>) -> EntryStore {
    use vaultpref_storage::{InMemoryKeyWrapper, StoreOptions};

    EntryStore::open(root.into(), StoreOptions::default(), InMemoryKeyWrapper::new())
        .expect("open test store")
}
