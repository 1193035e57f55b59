use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File, OpenOptions},
    io,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use fs2::FileExt;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};
use vaultpref_core::{
    entry::{Action, Entry},
    storage::{PreferenceStore, StoreError},
    value::{Preference, TypedValue},
};

use crate::{
    cipher_pool::{Algorithm, CipherPool, PoolSize},
    editor::Editor,
    index::{Index, IndexOp, IndexSlot, RecordLocation},
    journal::{
        encode_frame, record_aad, replay, FileBackend, Frame, Journal, JournalBackend,
        JournalHeader, RecordBody, RecoveryReport, HEADER_LEN,
    },
    key_manager::{KeyManager, KeyWrapper},
};

pub const JOURNAL_FILE: &str = "prefs.journal";
pub const KEY_FILE: &str = "master.key";
pub const LOCK_FILE: &str = "LOCK";

/// Tuning knobs for [`EntryStore::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Cipher for new stores. An existing journal keeps the one in its header.
    pub algorithm: Algorithm,
    pub pool: PoolSize,
    /// How long applied batches may sit in memory before the background flush.
    pub flush_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            pool: PoolSize::default(),
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// Notification sent to listeners after a batch becomes visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Cleared,
    Changed(String),
}

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct Shared {
    header: [u8; HEADER_LEN],
    pool: CipherPool,
    index: RwLock<Index>,
    journal: Mutex<Journal>,
    flush_signal: Condvar,
    flush_interval: Duration,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    failed: AtomicBool,
    closed: AtomicBool,
}

/// Encrypted, journal-backed preference store.
///
/// Reads are served from an in-memory index holding each key's sealed record,
/// so they only take the index read lock. Writers encrypt in parallel and
/// serialize on the journal append lock.
pub struct EntryStore {
    shared: Arc<Shared>,
    keys: KeyManager,
    recovery: RecoveryReport,
    flusher: Mutex<Option<JoinHandle<()>>>,
    _lock: Option<File>,
}

impl EntryStore {
    /// Open (or create) the store in `dir`, taking an exclusive lock on it.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(
        dir: impl AsRef<Path>,
        options: StoreOptions,
        wrapper: impl KeyWrapper + 'static,
    ) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(io_err)?;
        let lock = lock_dir(dir)?;
        let backend = FileBackend::open(&dir.join(JOURNAL_FILE)).map_err(io_err)?;
        let keys = KeyManager::new(dir.join(KEY_FILE), wrapper);
        Self::assemble(Box::new(backend), keys, options, Some(lock))
    }

    /// Open over an arbitrary journal backend. No directory lock is taken.
    pub fn open_with_backend(
        backend: impl JournalBackend + 'static,
        keys: KeyManager,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        Self::assemble(Box::new(backend), keys, options, None)
    }

    fn assemble(
        mut backend: Box<dyn JournalBackend>,
        keys: KeyManager,
        options: StoreOptions,
        lock: Option<File>,
    ) -> Result<Self, StoreError> {
        let bytes = backend.read_all().map_err(io_err)?;

        let fresh = bytes.len() < HEADER_LEN;
        let (header, key) = if fresh {
            // Nothing was ever committed past a partial header.
            if !bytes.is_empty() {
                warn!(len = bytes.len(), "discarding partial journal header");
                backend.truncate(0).map_err(io_err)?;
            }
            let key = keys.get_or_create_master_key()?;
            let header = JournalHeader::generate(options.algorithm, &key);
            backend.write_at(0, &header.encode()).map_err(io_err)?;
            backend.sync().map_err(io_err)?;
            info!(algorithm = ?header.algorithm, "created journal");
            (header, key)
        } else {
            let header = JournalHeader::decode(&bytes)?;
            let key = keys.load_master_key()?;
            if header.key_ref != key.reference() {
                return Err(StoreError::KeyUnavailable {
                    reason: "master key does not match the journal".to_string(),
                });
            }
            if header.algorithm != options.algorithm {
                warn!(
                    journal = ?header.algorithm,
                    requested = ?options.algorithm,
                    "journal algorithm differs from options; keeping the journal's"
                );
            }
            (header, key)
        };

        let header_bytes = header.encode();
        let pool = CipherPool::new(header.algorithm, key, header.salt, options.pool);
        let mut index = Index::default();
        let (durable_len, recovery) = if fresh {
            (HEADER_LEN as u64, RecoveryReport::default())
        } else {
            let (valid_len, report) = replay(&bytes, &header_bytes, &pool, &mut index);
            if let Some(at) = report.truncated_at {
                warn!(
                    truncated_at = at,
                    discarded = report.discarded_bytes,
                    reason = report.reason.as_deref().unwrap_or_default(),
                    "journal tail discarded during recovery"
                );
                backend.truncate(valid_len).map_err(io_err)?;
            }
            (valid_len, report)
        };

        let shared = Arc::new(Shared {
            header: header_bytes,
            pool,
            index: RwLock::new(index),
            journal: Mutex::new(Journal::new(backend, durable_len)),
            flush_signal: Condvar::new(),
            flush_interval: options.flush_interval,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let flusher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("journal-flush".to_string())
                .spawn(move || flush_loop(&shared))
                .map_err(io_err)?
        };

        info!(live_keys = recovery.live_keys, "store opened");
        Ok(Self {
            shared,
            keys,
            recovery,
            flusher: Mutex::new(Some(flusher)),
            _lock: lock,
        })
    }

    /// Outcome of the replay performed when the store was opened.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn algorithm(&self) -> Algorithm {
        self.shared.pool.algorithm()
    }

    /// Start a batch edit.
    pub fn edit(&self) -> Editor<'_> {
        Editor::new(self)
    }

    #[instrument(skip_all, fields(key = %key))]
    pub fn get(&self, key: &str) -> Result<Option<TypedValue>, StoreError> {
        self.ensure_open()?;
        let slot = match self.shared.index.read().get(key) {
            Some(slot) => slot.clone(),
            None => return Ok(None),
        };
        match self.open_slot(&slot)? {
            RecordBody::Put { key: stored, value } if stored == key => {
                Ok(Some(TypedValue::decode(&value)?))
            }
            _ => Err(StoreError::CorruptJournal {
                offset: slot.location.offset,
                reason: "indexed record does not hold this key".to_string(),
            }),
        }
    }

    /// False once the store is closed or has failed closed.
    pub fn contains(&self, key: &str) -> bool {
        self.ensure_open().is_ok() && self.shared.index.read().contains(key)
    }

    /// Typed read. A value stored under another kind is a [`StoreError::TypeMismatch`].
    pub fn get_as<T: Preference>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(value) = self.get(key)? else {
            return Ok(None);
        };
        let found = value.kind();
        T::from_value(value)
            .map(Some)
            .ok_or_else(|| StoreError::TypeMismatch {
                key: key.to_string(),
                expected: T::KIND,
                found,
            })
    }

    pub fn get_string(&self, key: &str, default: &str) -> Result<String, StoreError> {
        Ok(self
            .get_as::<String>(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    pub fn get_int(&self, key: &str, default: i32) -> Result<i32, StoreError> {
        Ok(self.get_as(key)?.unwrap_or(default))
    }

    pub fn get_long(&self, key: &str, default: i64) -> Result<i64, StoreError> {
        Ok(self.get_as(key)?.unwrap_or(default))
    }

    pub fn get_float(&self, key: &str, default: f32) -> Result<f32, StoreError> {
        Ok(self.get_as(key)?.unwrap_or(default))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, StoreError> {
        Ok(self.get_as(key)?.unwrap_or(default))
    }

    pub fn get_string_set(
        &self,
        key: &str,
        default: BTreeSet<String>,
    ) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.get_as(key)?.unwrap_or(default))
    }

    /// Decrypt every live entry.
    ///
    /// A value that decrypts but does not decode is logged and left out; `get`
    /// on that key reports the [`StoreError::MalformedValue`].
    #[instrument(skip_all)]
    pub fn get_all(&self) -> Result<BTreeMap<String, TypedValue>, StoreError> {
        self.ensure_open()?;
        let snapshot = self.shared.index.read().snapshot();
        let mut out = BTreeMap::new();
        for (key, slot) in snapshot {
            if let RecordBody::Put { value, .. } = self.open_slot(&slot)? {
                match TypedValue::decode(&value) {
                    Ok(value) => {
                        out.insert(key, value);
                    }
                    Err(err) => warn!(%key, %err, "skipping malformed value"),
                }
            }
        }
        Ok(out)
    }

    /// Live keys, sorted. Empty once the store is closed or has failed closed.
    pub fn keys(&self) -> Vec<String> {
        if self.ensure_open().is_err() {
            return Vec::new();
        }
        let mut keys: Vec<String> = self
            .shared
            .index
            .read()
            .snapshot()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        if self.ensure_open().is_err() {
            return 0;
        }
        self.shared.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a batch atomically: optionally clear, then each entry in order.
    ///
    /// With `should_commit` the batch is written and fsynced before returning;
    /// on failure nothing becomes visible. Otherwise it is visible at once and
    /// reaches disk on the next background flush.
    #[instrument(skip_all, fields(entries = entries.len(), clear = should_clear, commit = should_commit))]
    pub fn save_entries(
        &self,
        entries: &[Entry],
        should_clear: bool,
        should_commit: bool,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        if entries.is_empty() && !should_clear {
            return if should_commit { self.flush() } else { Ok(()) };
        }

        let mut bodies = Vec::with_capacity(entries.len() + 2);
        if should_clear {
            bodies.push(RecordBody::Clear);
        }
        bodies.extend(entries.iter().map(|entry| match &entry.action {
            Action::Put(value) => RecordBody::Put {
                key: entry.key.clone(),
                value: value.encode(),
            },
            Action::Remove => RecordBody::Remove {
                key: entry.key.clone(),
            },
        }));
        bodies.push(RecordBody::Seal {
            count: bodies.len() as u32,
        });

        // Encryption happens before the append lock so writers overlap on the pool.
        let frames = bodies
            .iter()
            .map(|body| self.seal_body(body))
            .collect::<Result<Vec<_>, _>>()?;
        let events = if self.shared.listeners.read().is_empty() {
            Vec::new()
        } else {
            change_events(entries, should_clear)
        };

        let mut journal = self.shared.journal.lock();
        // A close may have run while this writer waited for the lock.
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let start = journal.end();
        let mut offset = start;
        let mut buf = Vec::with_capacity(frames.iter().map(Vec::len).sum());
        let mut ops = Vec::with_capacity(bodies.len());
        for (body, frame) in bodies.into_iter().zip(frames) {
            let location = RecordLocation {
                offset,
                len: frame.len() as u32,
            };
            match body {
                RecordBody::Put { key, .. } => ops.push(IndexOp::Put {
                    key,
                    slot: IndexSlot {
                        location,
                        frame: Arc::from(frame.as_slice()),
                    },
                }),
                RecordBody::Remove { key } => ops.push(IndexOp::Remove { key }),
                RecordBody::Clear => ops.push(IndexOp::Clear),
                RecordBody::Seal { .. } => {}
            }
            offset += frame.len() as u64;
            buf.extend_from_slice(&frame);
        }
        journal.append(&buf);

        if should_commit {
            if let Err(err) = journal.flush() {
                journal.discard_from(start);
                error!(%err, "commit failed; batch discarded");
                return Err(io_err(err));
            }
        }
        self.shared.index.write().apply_all(ops);
        drop(journal);

        if !should_commit {
            self.shared.flush_signal.notify_one();
        }
        debug!(offset = start, "batch saved");
        self.notify(&events);
        Ok(())
    }

    /// Write and fsync everything applied so far.
    pub fn flush(&self) -> Result<(), StoreError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.shared.journal.lock().flush().map_err(io_err)
    }

    /// Pre-build every pooled cipher instance.
    pub fn warm_up(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let built = self.shared.pool.warm_up()?;
        debug!(built, "cipher pool warmed");
        Ok(())
    }

    /// Register a callback run after each batch becomes visible. Callbacks run
    /// on the writer's thread with no store locks held.
    pub fn register_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Returns false when the id was not registered.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Flush pending writes, stop the background flusher and release the key.
    pub fn close(&self) -> Result<(), StoreError> {
        let flushed = {
            let mut journal = self.shared.journal.lock();
            if self.shared.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            let flushed = journal.flush();
            self.shared.closed.store(true, Ordering::SeqCst);
            flushed
        };
        self.shared.flush_signal.notify_all();
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                warn!("journal flusher panicked");
            }
        }

        self.shared.index.write().clear();
        self.shared.pool.destroy();
        self.keys.destroy();
        info!("store closed");
        flushed.map_err(io_err)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else if self.shared.failed.load(Ordering::SeqCst) {
            Err(StoreError::FailedClosed)
        } else {
            Ok(())
        }
    }

    fn seal_body(&self, body: &RecordBody) -> Result<Vec<u8>, StoreError> {
        let kind = body.kind();
        let sealed = self
            .shared
            .pool
            .seal(&body.encode(), &record_aad(&self.shared.header, kind))
            .map_err(|err| self.trip(err))?;
        encode_frame(kind, &sealed)
    }

    fn open_slot(&self, slot: &IndexSlot) -> Result<RecordBody, StoreError> {
        let frame = Frame::parse(&slot.frame).map_err(|reason| StoreError::CorruptJournal {
            offset: slot.location.offset,
            reason,
        })?;
        frame
            .open(&self.shared.pool, &self.shared.header)
            .map_err(|err| match err {
                StoreError::CorruptJournal { reason, .. } => StoreError::CorruptJournal {
                    offset: slot.location.offset,
                    reason,
                },
                other => self.trip(other),
            })
    }

    /// Integrity failures and nonce exhaustion stop all further use.
    fn trip(&self, err: StoreError) -> StoreError {
        if matches!(
            err,
            StoreError::AuthenticationFailure { .. } | StoreError::NonceExhausted
        ) && !self.shared.failed.swap(true, Ordering::SeqCst)
        {
            error!(%err, "store failed closed");
        }
        err
    }

    fn notify(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self
            .shared
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for event in events {
            for listener in &listeners {
                listener(event);
            }
        }
    }
}

impl Drop for EntryStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "pending writes lost on drop");
        }
    }
}

impl PreferenceStore for EntryStore {
    fn get(&self, key: &str) -> Result<Option<TypedValue>, StoreError> {
        EntryStore::get(self, key)
    }

    fn contains(&self, key: &str) -> bool {
        EntryStore::contains(self, key)
    }

    fn save_entries(
        &self,
        entries: &[Entry],
        should_clear: bool,
        should_commit: bool,
    ) -> Result<(), StoreError> {
        EntryStore::save_entries(self, entries, should_clear, should_commit)
    }
}

fn flush_loop(shared: &Shared) {
    let mut journal = shared.journal.lock();
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        if journal.has_pending() {
            // Wakeups from later applies do not shorten the wait, so a burst
            // shares one fsync.
            let deadline = Instant::now() + shared.flush_interval;
            while !shared.closed.load(Ordering::SeqCst)
                && !shared
                    .flush_signal
                    .wait_until(&mut journal, deadline)
                    .timed_out()
            {}
            if shared.closed.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = journal.flush() {
                error!(%err, "background journal flush failed");
            }
        } else {
            shared.flush_signal.wait(&mut journal);
        }
    }
    debug!("journal flusher stopped");
}

fn change_events(entries: &[Entry], cleared: bool) -> Vec<ChangeEvent> {
    let mut events = Vec::with_capacity(entries.len() + 1);
    if cleared {
        events.push(ChangeEvent::Cleared);
    }
    events.extend(
        entries
            .iter()
            .map(|entry| ChangeEvent::Changed(entry.key.clone())),
    );
    events
}

fn lock_dir(dir: &Path) -> Result<File, StoreError> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(io_err)?;
    file.try_lock_exclusive()
        .map_err(|_| StoreError::Locked {
            path: path.display().to_string(),
        })?;
    Ok(file)
}

fn io_err(err: io::Error) -> StoreError {
    StoreError::Io {
        reason: err.to_string(),
    }
}
