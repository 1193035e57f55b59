//! Encrypted, journal-backed preference storage.
//!
//! Values are sealed with AES-256-GCM or ChaCha20-Poly1305 under a master key
//! that is itself wrapped by a platform key (the OS keyring, or a test double).

pub mod cipher_pool;
pub mod editor;
pub mod entry_store;
mod index;
pub mod journal;
pub mod key_manager;

pub use cipher_pool::{Algorithm, PoolSize};
pub use editor::Editor;
pub use entry_store::{ChangeEvent, EntryStore, ListenerId, StoreOptions};
pub use index::RecordLocation;
pub use journal::{FileBackend, JournalBackend, RecoveryReport};
pub use key_manager::{InMemoryKeyWrapper, KeyManager, KeyWrapper, KeyringWrapper};
