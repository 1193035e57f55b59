//! On-disk journal: header, record framing, durable tail handling and replay.
//!
//! Layout:
//!
//! ```text
//! header  : magic "VPJ1" | version u16 | algorithm u8 | nonce salt [4] | key ref [8]
//! record* : len u32 | kind u8 | nonce [12] | ciphertext | tag [16]
//! ```
//!
//! Integers are little-endian. `len` covers everything after itself. Every
//! batch ends with a `Seal` record; replay only exposes sealed batches.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Arc,
};

use rand::{rngs::OsRng, RngCore};
use tracing::{debug, warn};
use vaultpref_core::storage::StoreError;

use crate::{
    cipher_pool::{Algorithm, CipherPool, Sealed, NONCE_LEN, SALT_LEN, TAG_LEN},
    index::{Index, IndexOp, IndexSlot, RecordLocation},
    key_manager::{MasterKey, KEY_REF_LEN},
};

pub const JOURNAL_MAGIC: [u8; 4] = *b"VPJ1";
pub const JOURNAL_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 1 + SALT_LEN + KEY_REF_LEN;

const LEN_PREFIX: usize = 4;
const MIN_BODY_LEN: usize = 1 + NONCE_LEN + TAG_LEN;
/// Upper bound on a single record; anything larger is treated as a torn length.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub algorithm: Algorithm,
    pub salt: [u8; SALT_LEN],
    pub key_ref: [u8; KEY_REF_LEN],
}

impl JournalHeader {
    /// Fresh header with a random nonce salt.
    pub fn generate(algorithm: Algorithm, key: &MasterKey) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self {
            algorithm,
            salt,
            key_ref: key.reference(),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&JOURNAL_MAGIC);
        out[4..6].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
        out[6] = self.algorithm.id();
        out[7..7 + SALT_LEN].copy_from_slice(&self.salt);
        out[7 + SALT_LEN..].copy_from_slice(&self.key_ref);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptJournal { offset: 0, reason };
        if bytes.len() < HEADER_LEN {
            return Err(corrupt("truncated header".to_string()));
        }
        if bytes[..4] != JOURNAL_MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != JOURNAL_VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let algorithm = Algorithm::from_id(bytes[6])
            .ok_or_else(|| corrupt(format!("unknown algorithm id {}", bytes[6])))?;

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[7..7 + SALT_LEN]);
        let mut key_ref = [0u8; KEY_REF_LEN];
        key_ref.copy_from_slice(&bytes[7 + SALT_LEN..HEADER_LEN]);
        Ok(Self {
            algorithm,
            salt,
            key_ref,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordKind {
    Put = 1,
    Remove = 2,
    Clear = 3,
    Seal = 4,
}

impl RecordKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Put),
            2 => Some(Self::Remove),
            3 => Some(Self::Clear),
            4 => Some(Self::Seal),
            _ => None,
        }
    }
}

/// Plaintext carried inside one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RecordBody {
    Put { key: String, value: Vec<u8> },
    Remove { key: String },
    Clear,
    Seal { count: u32 },
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::Put { .. } => RecordKind::Put,
            RecordBody::Remove { .. } => RecordKind::Remove,
            RecordBody::Clear => RecordKind::Clear,
            RecordBody::Seal { .. } => RecordKind::Seal,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            RecordBody::Put { key, value } => {
                let mut buf = Vec::with_capacity(4 + key.len() + value.len());
                buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
                buf.extend_from_slice(key.as_bytes());
                buf.extend_from_slice(value);
                buf
            }
            RecordBody::Remove { key } => key.as_bytes().to_vec(),
            RecordBody::Clear => Vec::new(),
            RecordBody::Seal { count } => count.to_le_bytes().to_vec(),
        }
    }

    pub fn decode(kind: RecordKind, plaintext: Vec<u8>) -> Result<Self, String> {
        let utf8 = |bytes: Vec<u8>| String::from_utf8(bytes).map_err(|_| "key is not UTF-8".to_string());
        match kind {
            RecordKind::Put => {
                let key_len = read_u32(&plaintext).ok_or("put record too short")? as usize;
                if plaintext.len() < 4 + key_len {
                    return Err("put record key truncated".to_string());
                }
                let value = plaintext[4 + key_len..].to_vec();
                let key = utf8(plaintext[4..4 + key_len].to_vec())?;
                Ok(RecordBody::Put { key, value })
            }
            RecordKind::Remove => Ok(RecordBody::Remove {
                key: utf8(plaintext)?,
            }),
            RecordKind::Clear if plaintext.is_empty() => Ok(RecordBody::Clear),
            RecordKind::Clear => Err("clear record carries a payload".to_string()),
            RecordKind::Seal if plaintext.len() == 4 => Ok(RecordBody::Seal {
                count: read_u32(&plaintext).unwrap_or_default(),
            }),
            RecordKind::Seal => Err("seal record has the wrong size".to_string()),
        }
    }
}

/// A parsed, still-encrypted record.
#[derive(Debug)]
pub(crate) struct Frame<'a> {
    pub kind: RecordKind,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: &'a [u8],
    pub tag: [u8; TAG_LEN],
    pub len: usize,
}

impl<'a> Frame<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, String> {
        let body_len = read_u32(bytes).ok_or("truncated length prefix")? as usize;
        if !(MIN_BODY_LEN..=MAX_BODY_LEN).contains(&body_len) {
            return Err(format!("implausible record length {body_len}"));
        }
        let len = LEN_PREFIX + body_len;
        if bytes.len() < len {
            return Err(format!(
                "record needs {len} bytes, {} remain",
                bytes.len()
            ));
        }
        let kind = RecordKind::from_byte(bytes[LEN_PREFIX])
            .ok_or_else(|| format!("unknown record kind {}", bytes[LEN_PREFIX]))?;

        let nonce_at = LEN_PREFIX + 1;
        let body_at = nonce_at + NONCE_LEN;
        let tag_at = len - TAG_LEN;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[nonce_at..body_at]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&bytes[tag_at..len]);

        Ok(Self {
            kind,
            nonce,
            ciphertext: &bytes[body_at..tag_at],
            tag,
            len,
        })
    }

    /// Authenticate and decrypt against the store's header.
    pub fn open(&self, pool: &CipherPool, header: &[u8; HEADER_LEN]) -> Result<RecordBody, StoreError> {
        let plaintext = pool.open(
            &self.nonce,
            self.ciphertext,
            &self.tag,
            &record_aad(header, self.kind),
        )?;
        RecordBody::decode(self.kind, plaintext).map_err(|reason| StoreError::CorruptJournal {
            offset: 0,
            reason,
        })
    }
}

/// Frame a sealed record.
pub(crate) fn encode_frame(kind: RecordKind, sealed: &Sealed) -> Result<Vec<u8>, StoreError> {
    let body_len = MIN_BODY_LEN + sealed.ciphertext.len();
    if body_len > MAX_BODY_LEN {
        return Err(StoreError::Io {
            reason: format!("record of {body_len} bytes exceeds the {MAX_BODY_LEN} byte limit"),
        });
    }
    let mut frame = Vec::with_capacity(LEN_PREFIX + body_len);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.push(kind as u8);
    frame.extend_from_slice(&sealed.nonce);
    frame.extend_from_slice(&sealed.ciphertext);
    frame.extend_from_slice(&sealed.tag);
    Ok(frame)
}

/// Associated data binding a record to its store and kind.
pub(crate) fn record_aad(header: &[u8; HEADER_LEN], kind: RecordKind) -> [u8; HEADER_LEN + 1] {
    let mut aad = [0u8; HEADER_LEN + 1];
    aad[..HEADER_LEN].copy_from_slice(header);
    aad[HEADER_LEN] = kind as u8;
    aad
}

fn read_u32(bytes: &[u8]) -> Option<u32> {
    let head: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(head))
}

/// What replay found on open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Offset the journal was cut back to, when a torn or corrupt tail was found.
    pub truncated_at: Option<u64>,
    pub discarded_bytes: u64,
    /// Why replay stopped early, if it did.
    pub reason: Option<String>,
    pub batches: usize,
    pub live_keys: usize,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.truncated_at.is_none()
    }
}

/// Rebuild the index from journal bytes (header included).
///
/// Stops at the first record that cannot be framed, authenticated or parsed,
/// and drops any batch not closed by a `Seal`. Returns the length of the
/// valid prefix alongside the report.
pub(crate) fn replay(
    bytes: &[u8],
    header: &[u8; HEADER_LEN],
    pool: &CipherPool,
    index: &mut Index,
) -> (u64, RecoveryReport) {
    let mut report = RecoveryReport::default();
    let mut pos = HEADER_LEN;
    let mut valid_len = HEADER_LEN;
    let mut batch: Vec<IndexOp> = Vec::new();

    while pos < bytes.len() {
        let rest = &bytes[pos..];
        // Even a torn record may have put its nonce on disk; never hand it out again.
        if let Some(raw) = rest.get(LEN_PREFIX + 1..LEN_PREFIX + 1 + NONCE_LEN) {
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(raw);
            pool.observe_nonce(&nonce);
        }

        let frame = match Frame::parse(rest) {
            Ok(frame) => frame,
            Err(reason) => {
                report.reason = Some(reason);
                break;
            }
        };
        let body = match frame.open(pool, header) {
            Ok(body) => body,
            Err(err) => {
                report.reason = Some(err.to_string());
                break;
            }
        };

        let location = RecordLocation {
            offset: pos as u64,
            len: frame.len as u32,
        };
        let end = pos + frame.len;
        match body {
            RecordBody::Put { key, .. } => batch.push(IndexOp::Put {
                key,
                slot: IndexSlot {
                    location,
                    frame: Arc::from(&bytes[pos..end]),
                },
            }),
            RecordBody::Remove { key } => batch.push(IndexOp::Remove { key }),
            RecordBody::Clear => batch.push(IndexOp::Clear),
            RecordBody::Seal { count } => {
                if count as usize != batch.len() {
                    report.reason = Some(format!(
                        "seal expects {count} records, batch has {}",
                        batch.len()
                    ));
                    break;
                }
                index.apply_all(batch.drain(..));
                report.batches += 1;
                valid_len = end;
            }
        }
        pos = end;
    }

    if valid_len < bytes.len() {
        if report.reason.is_none() {
            report.reason = Some("unsealed trailing batch".to_string());
        }
        report.truncated_at = Some(valid_len as u64);
        report.discarded_bytes = (bytes.len() - valid_len) as u64;
    } else {
        report.reason = None;
    }
    report.live_keys = index.len();
    debug!(batches = report.batches, live_keys = report.live_keys, "journal replayed");
    (valid_len as u64, report)
}

/// Byte storage under the journal.
pub trait JournalBackend: Send {
    fn read_all(&mut self) -> io::Result<Vec<u8>>;

    /// Write `bytes` at `offset`, which is always the current end of durable data.
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;

    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

/// Journal stored in a regular file.
pub struct FileBackend {
    file: File,
}

impl FileBackend {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }
}

impl JournalBackend for FileBackend {
    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.file.sync_data()
    }
}

/// Append side of the journal. Guarded by the store's append lock.
pub(crate) struct Journal {
    backend: Box<dyn JournalBackend>,
    durable_len: u64,
    tail: Vec<u8>,
}

impl Journal {
    pub fn new(backend: Box<dyn JournalBackend>, durable_len: u64) -> Self {
        Self {
            backend,
            durable_len,
            tail: Vec::new(),
        }
    }

    /// Offset the next appended byte will land at.
    pub fn end(&self) -> u64 {
        self.durable_len + self.tail.len() as u64
    }

    pub fn has_pending(&self) -> bool {
        !self.tail.is_empty()
    }

    /// Buffer bytes at the tail; returns their starting offset.
    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        let start = self.end();
        self.tail.extend_from_slice(bytes);
        start
    }

    /// Drop buffered bytes from `offset` on. Only unflushed bytes can be dropped.
    pub fn discard_from(&mut self, offset: u64) {
        let keep = offset.saturating_sub(self.durable_len) as usize;
        self.tail.truncate(keep);
    }

    /// Write and fsync the buffered tail. On failure the file is cut back to
    /// the durable prefix and the tail stays buffered.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.tail.is_empty() {
            return Ok(());
        }
        let written = self
            .backend
            .write_at(self.durable_len, &self.tail)
            .and_then(|()| self.backend.sync());
        match written {
            Ok(()) => {
                self.durable_len += self.tail.len() as u64;
                self.tail.clear();
                Ok(())
            }
            Err(err) => {
                if let Err(cut) = self.backend.truncate(self.durable_len) {
                    warn!(%cut, "could not cut journal back after failed flush");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use parking_lot::Mutex;

    use super::*;

    /// In-memory backend with a durability watermark and fault injection.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryBackend {
        disk: Arc<Mutex<MemoryDisk>>,
    }

    #[derive(Default)]
    struct MemoryDisk {
        written: Vec<u8>,
        synced: usize,
        syncs: usize,
        fail_after: Option<usize>,
    }

    impl MemoryBackend {
        pub fn from_bytes(bytes: &[u8]) -> Self {
            let backend = Self::default();
            {
                let mut disk = backend.disk.lock();
                disk.written = bytes.to_vec();
                disk.synced = bytes.len();
            }
            backend
        }

        /// What survives power loss: only synced bytes.
        pub fn crash(&self) -> Self {
            let disk = self.disk.lock();
            Self::from_bytes(&disk.written[..disk.synced])
        }

        pub fn contents(&self) -> Vec<u8> {
            self.disk.lock().written.clone()
        }

        /// The next write stores only `bytes` bytes and then fails.
        pub fn fail_writes_after(&self, bytes: usize) {
            self.disk.lock().fail_after = Some(bytes);
        }

        pub fn heal(&self) {
            self.disk.lock().fail_after = None;
        }

        /// How many times `sync` has been called.
        pub fn syncs(&self) -> usize {
            self.disk.lock().syncs
        }
    }

    impl JournalBackend for MemoryBackend {
        fn read_all(&mut self) -> io::Result<Vec<u8>> {
            Ok(self.contents())
        }

        fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
            let mut disk = self.disk.lock();
            disk.written.truncate(offset as usize);
            if let Some(limit) = disk.fail_after {
                let partial = limit.min(bytes.len());
                disk.written.extend_from_slice(&bytes[..partial]);
                return Err(io::Error::other("injected write failure"));
            }
            disk.written.extend_from_slice(bytes);
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            let mut disk = self.disk.lock();
            disk.synced = disk.written.len();
            disk.syncs += 1;
            Ok(())
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            let mut disk = self.disk.lock();
            disk.written.truncate(len as usize);
            disk.synced = disk.synced.min(len as usize);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{memory::MemoryBackend, *};
    use crate::cipher_pool::PoolSize;

    fn fixture() -> (CipherPool, [u8; HEADER_LEN]) {
        let key = Arc::new(MasterKey::generate());
        let header = JournalHeader::generate(Algorithm::Aes256Gcm, &key);
        let pool = CipherPool::new(header.algorithm, key, header.salt, PoolSize::default());
        (pool, header.encode())
    }

    fn sealed_batch(pool: &CipherPool, header: &[u8; HEADER_LEN], bodies: &[RecordBody]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut all = bodies.to_vec();
        all.push(RecordBody::Seal {
            count: bodies.len() as u32,
        });
        for body in &all {
            let sealed = pool
                .seal(&body.encode(), &record_aad(header, body.kind()))
                .expect("seal");
            out.extend(encode_frame(body.kind(), &sealed).expect("frame"));
        }
        out
    }

    fn put(key: &str) -> RecordBody {
        RecordBody::Put {
            key: key.into(),
            value: vec![0x02, 1, 0, 0, 0],
        }
    }

    #[test]
    fn header_round_trips_and_rejects_garbage() {
        let key = MasterKey::generate();
        let header = JournalHeader::generate(Algorithm::ChaCha20Poly1305, &key);
        assert_eq!(JournalHeader::decode(&header.encode()).expect("decode"), header);

        let mut bad = header.encode();
        bad[0] = b'X';
        assert!(matches!(
            JournalHeader::decode(&bad),
            Err(StoreError::CorruptJournal { offset: 0, .. })
        ));
        let mut future = header.encode();
        future[4] = 9;
        assert!(JournalHeader::decode(&future).is_err());
    }

    #[test]
    fn replay_exposes_only_sealed_batches() {
        let (pool, header) = fixture();
        let mut bytes = header.to_vec();
        bytes.extend(sealed_batch(&pool, &header, &[put("a"), put("b")]));
        let sealed_len = bytes.len();
        let second = sealed_batch(&pool, &header, &[RecordBody::Clear, put("c")]);
        // drop the second batch's seal record
        bytes.extend_from_slice(&second[..second.len() - 10]);

        let mut index = Index::default();
        let (valid, report) = replay(&bytes, &header, &pool, &mut index);

        assert_eq!(valid, sealed_len as u64);
        assert_eq!(report.truncated_at, Some(sealed_len as u64));
        assert_eq!(report.batches, 1);
        assert!(index.contains("a") && index.contains("b"));
        assert!(!index.contains("c"));
        assert!(pool.nonce_counter() >= 6);
    }

    #[test]
    fn replay_stops_at_a_tampered_record() {
        let (pool, header) = fixture();
        let mut bytes = header.to_vec();
        bytes.extend(sealed_batch(&pool, &header, &[put("a")]));
        let good = bytes.len();
        bytes.extend(sealed_batch(&pool, &header, &[put("b")]));
        bytes[good + 20] ^= 0x40;

        let mut index = Index::default();
        let (valid, report) = replay(&bytes, &header, &pool, &mut index);

        assert_eq!(valid, good as u64);
        assert!(report
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("authentication")));
        assert!(index.contains("a") && !index.contains("b"));
    }

    #[test]
    fn records_from_another_store_do_not_authenticate() {
        let (pool, header) = fixture();
        let mut other_header = header;
        other_header[7] ^= 0xff;

        let mut bytes = header.to_vec();
        bytes.extend(sealed_batch(&pool, &other_header, &[put("a")]));
        let mut index = Index::default();
        let (valid, _) = replay(&bytes, &header, &pool, &mut index);
        assert_eq!(valid, HEADER_LEN as u64);
    }

    #[test]
    fn failed_flush_keeps_tail_and_cuts_file_back() {
        let backend = MemoryBackend::from_bytes(b"0123");
        let mut journal = Journal::new(Box::new(backend.clone()), 4);

        journal.append(b"abcdef");
        backend.fail_writes_after(3);
        assert!(journal.flush().is_err());
        assert_eq!(backend.contents(), b"0123");
        assert!(journal.has_pending());

        backend.heal();
        journal.flush().expect("flush");
        assert_eq!(backend.contents(), b"0123abcdef");
        assert_eq!(journal.end(), 10);
    }

    #[test]
    fn discard_only_touches_the_unflushed_tail() {
        let mut journal = Journal::new(Box::new(MemoryBackend::default()), 0);
        journal.append(b"one");
        journal.flush().expect("flush");
        let start = journal.append(b"two");
        journal.discard_from(start);
        assert_eq!(journal.end(), 3);
        assert!(!journal.has_pending());
    }
}
