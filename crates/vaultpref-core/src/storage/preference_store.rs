use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;

use crate::{
    entry::{Action, Entry},
    value::{TypedValue, ValueError, ValueKind},
};

/// Errors produced by preference store implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The platform key-encryption key or the wrapped master key cannot be used.
    #[error("master key unavailable: {reason}")]
    KeyUnavailable { reason: String },
    /// A record failed its AEAD tag check.
    #[error("authentication failed: {context}")]
    AuthenticationFailure { context: String },
    /// A decrypted value could not be decoded.
    #[error(transparent)]
    MalformedValue(#[from] ValueError),
    /// The journal could not be interpreted at the given offset.
    #[error("journal corrupt at offset {offset}: {reason}")]
    CorruptJournal { offset: u64, reason: String },
    /// Underlying read, write or fsync failure.
    #[error("journal i/o failure: {reason}")]
    Io { reason: String },
    /// A typed getter found a value of another kind.
    #[error("type mismatch for key {key}: expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("nonce counter exhausted for the current master key")]
    NonceExhausted,
    #[error("store is locked by another handle: {path}")]
    Locked { path: String },
    /// An earlier authentication failure sealed the store against further use.
    #[error("store failed closed after an integrity failure")]
    FailedClosed,
    #[error("store is closed")]
    Closed,
}

/// Contract shared by the encrypted engine and its test doubles.
pub trait PreferenceStore: Send + Sync {
    /// Fetch the current value for a key, if any.
    fn get(&self, key: &str) -> Result<Option<TypedValue>, StoreError>;

    /// Whether the key currently holds a value.
    fn contains(&self, key: &str) -> bool;

    /// Apply a batch: optionally clear everything, then each entry in order.
    ///
    /// With `should_commit` the call returns only once the batch is durable;
    /// otherwise durability is left to a later flush.
    fn save_entries(
        &self,
        entries: &[Entry],
        should_clear: bool,
        should_commit: bool,
    ) -> Result<(), StoreError>;
}

/// Unencrypted store for tests and dry runs.
/// Values are kept in their encoded form so the codec path is still exercised.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPreferenceStore {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PreferenceStore for InMemoryPreferenceStore {
    fn get(&self, key: &str) -> Result<Option<TypedValue>, StoreError> {
        let map = self.inner.lock().map_err(poisoned)?;
        map.get(key)
            .map(|bytes| TypedValue::decode(bytes).map_err(StoreError::from))
            .transpose()
    }

    fn contains(&self, key: &str) -> bool {
        self.inner
            .lock()
            .map(|map| map.contains_key(key))
            .unwrap_or(false)
    }

    fn save_entries(
        &self,
        entries: &[Entry],
        should_clear: bool,
        _should_commit: bool,
    ) -> Result<(), StoreError> {
        let mut map = self.inner.lock().map_err(poisoned)?;
        if should_clear {
            map.clear();
        }
        for entry in entries {
            match &entry.action {
                Action::Put(value) => {
                    map.insert(entry.key.clone(), value.encode());
                }
                Action::Remove => {
                    map.remove(&entry.key);
                }
            }
        }
        Ok(())
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> StoreError {
    StoreError::Io {
        reason: format!("lock poisoned: {err}"),
    }
}
