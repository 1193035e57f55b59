use std::collections::BTreeSet;

use vaultpref_core::{entry::Entry, storage::StoreError, value::TypedValue};

use crate::entry_store::EntryStore;

/// Accumulates a batch of changes for one atomic save.
///
/// Nothing is visible until [`Editor::apply`] or [`Editor::commit`]; a clear
/// always runs before the batch's puts and removes, whatever order they were
/// staged in.
#[must_use = "an editor does nothing until applied or committed"]
pub struct Editor<'a> {
    store: &'a EntryStore,
    entries: Vec<Entry>,
    clear: bool,
}

impl<'a> Editor<'a> {
    pub(crate) fn new(store: &'a EntryStore) -> Self {
        Self {
            store,
            entries: Vec::new(),
            clear: false,
        }
    }

    pub fn put(mut self, key: impl Into<String>, value: impl Into<TypedValue>) -> Self {
        self.entries.push(Entry::put(key, value));
        self
    }

    pub fn put_string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put(key, TypedValue::String(value.into()))
    }

    pub fn put_int(self, key: impl Into<String>, value: i32) -> Self {
        self.put(key, value)
    }

    pub fn put_long(self, key: impl Into<String>, value: i64) -> Self {
        self.put(key, value)
    }

    pub fn put_float(self, key: impl Into<String>, value: f32) -> Self {
        self.put(key, value)
    }

    pub fn put_bool(self, key: impl Into<String>, value: bool) -> Self {
        self.put(key, value)
    }

    pub fn put_string_set(self, key: impl Into<String>, value: BTreeSet<String>) -> Self {
        self.put(key, value)
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.entries.push(Entry::remove(key));
        self
    }

    pub fn clear(mut self) -> Self {
        self.clear = true;
        self
    }

    /// Make the batch visible now; it reaches disk on the next background flush.
    pub fn apply(self) -> Result<(), StoreError> {
        self.store.save_entries(&self.entries, self.clear, false)
    }

    /// Make the batch visible and durable before returning.
    pub fn commit(self) -> Result<(), StoreError> {
        self.store.save_entries(&self.entries, self.clear, true)
    }
}
