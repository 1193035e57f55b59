//! Core abstractions for vaultpref: typed values, batch entries, and the
//! preference store contract shared by the encrypted engine and migration.
//! Holds no I/O or crypto; those live in `vaultpref-storage`.

pub mod entry;
pub mod storage;
pub mod value;
