use crate::value::TypedValue;

/// What a batch does to one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Put(TypedValue),
    Remove,
}

/// One element of a batch edit.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    pub action: Action,
}

impl Entry {
    pub fn put(key: impl Into<String>, value: impl Into<TypedValue>) -> Self {
        Self {
            key: key.into(),
            action: Action::Put(value.into()),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            action: Action::Remove,
        }
    }
}
