//! One-shot import of plaintext preferences into an encrypted store.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::PathBuf,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};
use vaultpref_core::{
    entry::Entry,
    storage::{PreferenceStore, StoreError},
    value::TypedValue,
};

/// A value as held by the foreign store.
///
/// Serialized adjacently tagged: `{"type": "int", "value": 5}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum HostValue {
    String(String),
    Int(i32),
    Bool(bool),
    Float(f32),
    Long(i64),
    StringSet(BTreeSet<String>),
    Double(f64),
    Bytes(Vec<u8>),
    Null,
}

impl HostValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::String(_) => "string",
            HostValue::Int(_) => "int",
            HostValue::Bool(_) => "bool",
            HostValue::Float(_) => "float",
            HostValue::Long(_) => "long",
            HostValue::StringSet(_) => "string_set",
            HostValue::Double(_) => "double",
            HostValue::Bytes(_) => "bytes",
            HostValue::Null => "null",
        }
    }

    /// The equivalent stored value, or `None` for kinds the store cannot hold.
    pub fn into_typed(self) -> Option<TypedValue> {
        match self {
            HostValue::String(v) => Some(TypedValue::String(v)),
            HostValue::Int(v) => Some(TypedValue::Int(v)),
            HostValue::Bool(v) => Some(TypedValue::Bool(v)),
            HostValue::Float(v) => Some(TypedValue::Float(v)),
            HostValue::Long(v) => Some(TypedValue::Long(v)),
            HostValue::StringSet(v) => Some(TypedValue::StringSet(v)),
            HostValue::Double(_) | HostValue::Bytes(_) | HostValue::Null => None,
        }
    }
}

/// Read-only view of a foreign preference store.
pub trait SourceSnapshot {
    fn entries(&self) -> Result<Vec<(String, HostValue)>>;
}

/// Snapshot held in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapSnapshot {
    values: BTreeMap<String, HostValue>,
}

impl MapSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: HostValue) {
        self.values.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, HostValue)> for MapSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, HostValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl SourceSnapshot for MapSnapshot {
    fn entries(&self) -> Result<Vec<(String, HostValue)>> {
        Ok(self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Snapshot exported as a JSON object of key → `HostValue`.
#[derive(Debug, Clone)]
pub struct JsonSnapshot {
    path: PathBuf,
}

impl JsonSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SourceSnapshot for JsonSnapshot {
    fn entries(&self) -> Result<Vec<(String, HostValue)>> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("reading snapshot {}", self.path.display()))?;
        let values: BTreeMap<String, HostValue> = serde_json::from_str(&text)
            .with_context(|| format!("parsing snapshot {}", self.path.display()))?;
        Ok(values.into_iter().collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    /// Keys whose values had no stored equivalent.
    pub skipped: Vec<String>,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to read migration source: {0:#}")]
    Source(anyhow::Error),
    #[error("failed to write migrated entries")]
    Destination(#[from] StoreError),
}

/// Copy every supported value from `source` into `destination` as one batch.
///
/// Unsupported values are skipped. The destination sees exactly one
/// `save_entries` call when there is anything to copy, and none when the
/// source holds no supported values; if the call fails, nothing is migrated.
#[instrument(skip_all, fields(commit = commit))]
pub fn migrate<S, D>(source: &S, destination: &D, commit: bool) -> Result<MigrationReport, MigrationError>
where
    S: SourceSnapshot + ?Sized,
    D: PreferenceStore + ?Sized,
{
    let pairs = source.entries().map_err(MigrationError::Source)?;
    let mut report = MigrationReport::default();
    let mut entries = Vec::with_capacity(pairs.len());
    for (key, host) in pairs {
        let host_type = host.type_name();
        match host.into_typed() {
            Some(value) => entries.push(Entry::put(key, value)),
            None => {
                debug!(%key, host_type, "skipping unsupported value");
                report.skipped.push(key);
            }
        }
    }

    if entries.is_empty() {
        info!(skipped = report.skipped.len(), "nothing to migrate");
        return Ok(report);
    }
    destination.save_entries(&entries, false, commit)?;
    report.migrated = entries.len();
    info!(
        migrated = report.migrated,
        skipped = report.skipped.len(),
        "migration finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use vaultpref_core::storage::InMemoryPreferenceStore;
    use vaultpref_storage::{EntryStore, InMemoryKeyWrapper, StoreOptions};

    use super::*;

    /// Destination that counts writes and optionally refuses them.
    #[derive(Default)]
    struct RecordingStore {
        inner: InMemoryPreferenceStore,
        saves: AtomicUsize,
        fail: bool,
    }

    impl PreferenceStore for RecordingStore {
        fn get(&self, key: &str) -> Result<Option<TypedValue>, StoreError> {
            self.inner.get(key)
        }

        fn contains(&self, key: &str) -> bool {
            self.inner.contains(key)
        }

        fn save_entries(
            &self,
            entries: &[Entry],
            should_clear: bool,
            should_commit: bool,
        ) -> Result<(), StoreError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::Io {
                    reason: "disk full".to_string(),
                });
            }
            self.inner.save_entries(entries, should_clear, should_commit)
        }
    }

    fn mixed_source() -> MapSnapshot {
        [
            ("x", HostValue::Int(5)),
            ("y", HostValue::Double(2.5)),
            ("z", HostValue::String("s".to_string())),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn supported_values_copy_and_others_skip() {
        let destination = RecordingStore::default();
        let report = migrate(&mixed_source(), &destination, true).expect("migrate");

        assert_eq!(report.migrated, 2);
        assert_eq!(report.skipped, vec!["y".to_string()]);
        assert_eq!(destination.saves.load(Ordering::SeqCst), 1);
        assert_eq!(destination.get("x").expect("x"), Some(TypedValue::Int(5)));
        assert_eq!(
            destination.get("z").expect("z"),
            Some(TypedValue::String("s".to_string()))
        );
        assert!(!destination.contains("y"));
    }

    #[test]
    fn destination_failure_fails_the_whole_migration() {
        let source = mixed_source();
        let destination = RecordingStore {
            fail: true,
            ..RecordingStore::default()
        };

        let err = migrate(&source, &destination, true).expect_err("should fail");
        assert!(matches!(err, MigrationError::Destination(StoreError::Io { .. })));
        assert!(!destination.contains("x"));
        assert_eq!(source, mixed_source());
    }

    #[test]
    fn empty_source_writes_nothing() {
        let destination = RecordingStore::default();
        let report = migrate(&MapSnapshot::new(), &destination, true).expect("migrate");
        assert_eq!(report, MigrationReport::default());
        assert_eq!(destination.saves.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn only_unsupported_values_write_nothing() {
        let destination = RecordingStore::default();
        let source: MapSnapshot = [("d", HostValue::Double(1.5)), ("n", HostValue::Null)]
            .into_iter()
            .collect();

        let report = migrate(&source, &destination, true).expect("migrate");
        assert_eq!(report.migrated, 0);
        assert_eq!(report.skipped, vec!["d".to_string(), "n".to_string()]);
        assert_eq!(destination.saves.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn json_snapshot_reads_tagged_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("prefs.json");
        fs::write(
            &path,
            r#"{
                "name": {"type": "string", "value": "ada"},
                "tags": {"type": "string_set", "value": ["a", "b"]},
                "blob": {"type": "bytes", "value": [1, 2]},
                "gone": {"type": "null"}
            }"#,
        )
        .expect("write snapshot");

        let entries = JsonSnapshot::new(&path).entries().expect("entries");
        assert_eq!(entries.len(), 4);
        assert!(entries.contains(&(
            "tags".to_string(),
            HostValue::StringSet(["a".to_string(), "b".to_string()].into())
        )));
        assert!(entries.contains(&("gone".to_string(), HostValue::Null)));
    }

    #[test]
    fn unreadable_source_is_a_source_error() {
        let destination = RecordingStore::default();
        let missing = JsonSnapshot::new("/nonexistent/vaultpref/prefs.json");
        assert!(matches!(
            migrate(&missing, &destination, true),
            Err(MigrationError::Source(_))
        ));
        assert_eq!(destination.saves.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn migrates_into_an_encrypted_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EntryStore::open(dir.path(), StoreOptions::default(), InMemoryKeyWrapper::new())
            .expect("open store");

        migrate(&mixed_source(), &store, true).expect("migrate");
        assert_eq!(store.get_int("x", 0).expect("x"), 5);
        assert_eq!(store.keys(), vec!["x".to_string(), "z".to_string()]);
    }
}
