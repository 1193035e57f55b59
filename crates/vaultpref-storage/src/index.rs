use std::{collections::HashMap, sync::Arc};

/// Where a record lives in the journal file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub offset: u64,
    pub len: u32,
}

/// Latest live record for a key, with its sealed bytes kept in memory so
/// reads never touch the journal.
#[derive(Debug, Clone)]
pub(crate) struct IndexSlot {
    pub location: RecordLocation,
    pub frame: Arc<[u8]>,
}

#[derive(Debug)]
pub(crate) enum IndexOp {
    Put { key: String, slot: IndexSlot },
    Remove { key: String },
    Clear,
}

/// Plaintext key → latest live record. Rebuilt from the journal on open.
#[derive(Debug, Default)]
pub(crate) struct Index {
    entries: HashMap<String, IndexSlot>,
}

impl Index {
    pub fn get(&self, key: &str) -> Option<&IndexSlot> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn snapshot(&self) -> Vec<(String, IndexSlot)> {
        self.entries
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries = HashMap::new();
    }

    /// Apply one batch in order. Callers hold the write lock for the whole batch.
    pub fn apply_all(&mut self, ops: impl IntoIterator<Item = IndexOp>) {
        for op in ops {
            match op {
                IndexOp::Put { key, slot } => {
                    self.entries.insert(key, slot);
                }
                IndexOp::Remove { key } => {
                    self.entries.remove(&key);
                }
                IndexOp::Clear => self.clear(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(offset: u64) -> IndexSlot {
        IndexSlot {
            location: RecordLocation { offset, len: 1 },
            frame: Arc::from(&[0u8][..]),
        }
    }

    #[test]
    fn ops_apply_in_order() {
        let mut index = Index::default();
        index.apply_all([
            IndexOp::Put {
                key: "a".into(),
                slot: slot(1),
            },
            IndexOp::Clear,
            IndexOp::Put {
                key: "b".into(),
                slot: slot(2),
            },
            IndexOp::Put {
                key: "b".into(),
                slot: slot(3),
            },
            IndexOp::Remove { key: "c".into() },
        ]);

        assert!(!index.contains("a"));
        assert_eq!(index.get("b").map(|s| s.location.offset), Some(3));
        assert_eq!(index.len(), 1);
    }
}
