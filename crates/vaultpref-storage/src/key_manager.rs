use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument};
use vaultpref_core::storage::StoreError;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the data key in bytes (256-bit).
pub const MASTER_KEY_LEN: usize = 32;
/// Length of the key reference written into the journal header.
pub const KEY_REF_LEN: usize = 8;

const KEK_LEN: usize = 32;
const WRAP_NONCE_LEN: usize = 12;
const WRAPPED_MAGIC: &[u8; 4] = b"VPK1";

/// The store's data-encryption key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_LEN],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; MASTER_KEY_LEN] = bytes.try_into().map_err(|_| {
            KeyError::Corrupt(format!(
                "expected {MASTER_KEY_LEN} key bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Raw key bytes. Never log or persist the result.
    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.bytes
    }

    /// Short identifier for this key, safe to store in clear.
    pub fn reference(&self) -> [u8; KEY_REF_LEN] {
        let digest = Sha256::new()
            .chain_update(b"vaultpref-key-ref")
            .chain_update(&self.bytes)
            .finalize();
        let mut out = [0u8; KEY_REF_LEN];
        out.copy_from_slice(&digest[..KEY_REF_LEN]);
        out
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("key-encryption key unavailable: {0}")]
    Unavailable(String),
    #[error("wrapped key corrupt: {0}")]
    Corrupt(String),
    #[error("wrapped key i/o: {0}")]
    Io(String),
}

impl From<KeyError> for StoreError {
    fn from(err: KeyError) -> Self {
        StoreError::KeyUnavailable {
            reason: err.to_string(),
        }
    }
}

/// Platform key escrow: encrypts the master key under a key it never releases.
pub trait KeyWrapper: Send + Sync {
    fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>, KeyError>;

    fn unwrap_key(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeyError>;
}

/// OS keyring-backed wrapper. The key-encryption key lives in the `keyring` crate's store.
pub struct KeyringWrapper {
    service: String,
    account: String,
}

impl KeyringWrapper {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, KeyError> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| KeyError::Keyring(e.to_string()))
    }

    fn load_kek(&self) -> Result<Option<Zeroizing<[u8; KEK_LEN]>>, KeyError> {
        match self.entry()?.get_password() {
            Ok(secret) => decode_kek(&secret).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(KeyError::Unavailable(err.to_string())),
        }
    }
}

impl KeyWrapper for KeyringWrapper {
    fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>, KeyError> {
        let kek = match self.load_kek()? {
            Some(kek) => kek,
            None => {
                let kek = generate_kek();
                self.entry()?
                    .set_password(&encode_kek(&kek))
                    .map_err(|e| KeyError::Keyring(e.to_string()))?;
                info!(service = %self.service, "created key-encryption key in keyring");
                kek
            }
        };
        seal_with_kek(&kek, key)
    }

    fn unwrap_key(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        // Never create a KEK here: a fresh one could not open the existing blob.
        let kek = self.load_kek()?.ok_or_else(|| {
            KeyError::Unavailable(format!(
                "no key-encryption key for {}/{}",
                self.service, self.account
            ))
        })?;
        open_with_kek(&kek, blob)
    }
}

/// In-memory wrapper for tests and ephemeral sessions.
/// Can be locked to simulate an inaccessible platform keystore.
#[derive(Clone)]
pub struct InMemoryKeyWrapper {
    inner: Arc<MemoryKek>,
}

struct MemoryKek {
    kek: Zeroizing<[u8; KEK_LEN]>,
    locked: AtomicBool,
}

impl Default for InMemoryKeyWrapper {
    fn default() -> Self {
        Self {
            inner: Arc::new(MemoryKek {
                kek: generate_kek(),
                locked: AtomicBool::new(false),
            }),
        }
    }
}

impl InMemoryKeyWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) {
        self.inner.locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock(&self) {
        self.inner.locked.store(false, Ordering::SeqCst);
    }

    fn kek(&self) -> Result<&[u8; KEK_LEN], KeyError> {
        if self.inner.locked.load(Ordering::SeqCst) {
            return Err(KeyError::Unavailable("keystore locked".to_string()));
        }
        Ok(&*self.inner.kek)
    }
}

impl KeyWrapper for InMemoryKeyWrapper {
    fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>, KeyError> {
        seal_with_kek(self.kek()?, key)
    }

    fn unwrap_key(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        open_with_kek(self.kek()?, blob)
    }
}

/// Owns the master key lifecycle for one store directory.
pub struct KeyManager {
    path: PathBuf,
    wrapper: Box<dyn KeyWrapper>,
    cached: Mutex<Option<Arc<MasterKey>>>,
}

impl KeyManager {
    pub fn new(path: impl Into<PathBuf>, wrapper: impl KeyWrapper + 'static) -> Self {
        Self {
            path: path.into(),
            wrapper: Box::new(wrapper),
            cached: Mutex::new(None),
        }
    }

    /// Location of the wrapped key file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unwrap the persisted key, or generate, wrap and persist a new one.
    ///
    /// Concurrent callers serialize on the cache lock, so at most one key is
    /// ever generated per manager.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn get_or_create_master_key(&self) -> Result<Arc<MasterKey>, KeyError> {
        self.fetch(true)
    }

    /// Unwrap the persisted key; a missing key file is an error.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn load_master_key(&self) -> Result<Arc<MasterKey>, KeyError> {
        self.fetch(false)
    }

    /// Release the cached key. Its bytes are zeroized once the last holder drops it.
    pub fn destroy(&self) {
        if self.cached.lock().take().is_some() {
            debug!("master key released");
        }
    }

    fn fetch(&self, create: bool) -> Result<Arc<MasterKey>, KeyError> {
        let mut cached = self.cached.lock();
        if let Some(key) = cached.as_ref() {
            return Ok(Arc::clone(key));
        }

        let key = match read_wrapped(&self.path)? {
            Some(blob) => {
                let bytes = self.wrapper.unwrap_key(&blob)?;
                debug!("unwrapped existing master key");
                MasterKey::from_bytes(&bytes)?
            }
            None if create => {
                let key = MasterKey::generate();
                let blob = self.wrapper.wrap_key(key.as_bytes())?;
                write_wrapped(&self.path, &blob)?;
                info!("generated new master key");
                key
            }
            None => {
                return Err(KeyError::Unavailable(format!(
                    "wrapped key missing at {}",
                    self.path.display()
                )))
            }
        };

        let key = Arc::new(key);
        *cached = Some(Arc::clone(&key));
        Ok(key)
    }
}

fn read_wrapped(path: &Path) -> Result<Option<Vec<u8>>, KeyError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(KeyError::Io(err.to_string())),
    };
    match bytes.strip_prefix(WRAPPED_MAGIC.as_slice()) {
        Some(blob) => Ok(Some(blob.to_vec())),
        None => Err(KeyError::Corrupt(format!(
            "{} is not a wrapped key file",
            path.display()
        ))),
    }
}

fn write_wrapped(path: &Path, blob: &[u8]) -> Result<(), KeyError> {
    let io_err = |e: std::io::Error| KeyError::Io(e.to_string());
    let parent = path
        .parent()
        .ok_or_else(|| KeyError::Io("invalid wrapped key path".to_string()))?;
    fs::create_dir_all(parent).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    tmp.write_all(WRAPPED_MAGIC).map_err(io_err)?;
    tmp.write_all(blob).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn seal_with_kek(kek: &[u8; KEK_LEN], key: &[u8]) -> Result<Vec<u8>, KeyError> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(kek));
    let mut nonce = [0u8; WRAP_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), key)
        .map_err(|e| KeyError::Corrupt(format!("wrap failed: {e}")))?;

    let mut blob = Vec::with_capacity(WRAP_NONCE_LEN + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

fn open_with_kek(kek: &[u8; KEK_LEN], blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    if blob.len() <= WRAP_NONCE_LEN {
        return Err(KeyError::Corrupt("wrapped key too short".to_string()));
    }
    let (nonce, sealed) = blob.split_at(WRAP_NONCE_LEN);
    let cipher = Aes256Gcm::new(GenericArray::from_slice(kek));
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map(Zeroizing::new)
        .map_err(|_| KeyError::Corrupt("wrapped key failed authentication".to_string()))
}

fn generate_kek() -> Zeroizing<[u8; KEK_LEN]> {
    let mut kek = Zeroizing::new([0u8; KEK_LEN]);
    OsRng.fill_bytes(&mut kek[..]);
    kek
}

fn encode_kek(kek: &[u8; KEK_LEN]) -> String {
    general_purpose::STANDARD.encode(kek)
}

fn decode_kek(secret: &str) -> Result<Zeroizing<[u8; KEK_LEN]>, KeyError> {
    let bytes = Zeroizing::new(
        general_purpose::STANDARD
            .decode(secret)
            .map_err(|e| KeyError::Decode(e.to_string()))?,
    );

    if bytes.len() != KEK_LEN {
        return Err(KeyError::Decode(format!(
            "expected {KEK_LEN} bytes, got {}",
            bytes.len()
        )));
    }

    let mut out = Zeroizing::new([0u8; KEK_LEN]);
    out.copy_from_slice(&bytes);
    Ok(out)
}
