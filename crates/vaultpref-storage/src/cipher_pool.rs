//! Bounded pool of reusable AEAD cipher instances.
//!
//! Encryptors and decryptors are tracked in separate slot sets so readers and
//! writers never compete for the same instances. A checkout blocks until a
//! slot frees; the returned [`PooledCipher`] goes back to the pool on drop.
//!
//! Nonces are `salt (4 bytes) || counter (8 bytes, big-endian)`. The salt is
//! fixed per store; the counter is the only state shared across pool members.

use std::{
    fmt,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes256Gcm,
};
use chacha20poly1305::ChaCha20Poly1305;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use vaultpref_core::storage::StoreError;
use zeroize::Zeroize;

use crate::key_manager::MasterKey;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const SALT_LEN: usize = 4;

/// AEAD construction used for every record of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Algorithm {
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl Algorithm {
    pub const fn id(self) -> u8 {
        match self {
            Algorithm::Aes256Gcm => 1,
            Algorithm::ChaCha20Poly1305 => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Algorithm::Aes256Gcm),
            2 => Some(Algorithm::ChaCha20Poly1305),
            _ => None,
        }
    }
}

/// Number of pooled instances per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    pub encryptors: usize,
    pub decryptors: usize,
}

impl Default for PoolSize {
    fn default() -> Self {
        let cores = thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self {
            encryptors: cores,
            decryptors: cores,
        }
    }
}

/// Output of a single encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Encrypt,
    Decrypt,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Encrypt => "encryptor",
            Role::Decrypt => "decryptor",
        })
    }
}

enum AeadCipher {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl AeadCipher {
    fn new(algorithm: Algorithm, key: &MasterKey) -> Self {
        let key = key.as_bytes();
        match algorithm {
            Algorithm::Aes256Gcm => {
                AeadCipher::Aes(Box::new(Aes256Gcm::new(GenericArray::from_slice(key))))
            }
            Algorithm::ChaCha20Poly1305 => AeadCipher::ChaCha(Box::new(ChaCha20Poly1305::new(
                GenericArray::from_slice(key),
            ))),
        }
    }

    fn seal_in_place(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        buf: &mut [u8],
    ) -> Result<[u8; TAG_LEN], aes_gcm::aead::Error> {
        let tag = match self {
            AeadCipher::Aes(c) => {
                c.encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf)?
            }
            AeadCipher::ChaCha(c) => {
                c.encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf)?
            }
        };
        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    fn open_in_place(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        buf: &mut [u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<(), aes_gcm::aead::Error> {
        match self {
            AeadCipher::Aes(c) => c.decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                aad,
                buf,
                GenericArray::from_slice(tag),
            ),
            AeadCipher::ChaCha(c) => c.decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                aad,
                buf,
                GenericArray::from_slice(tag),
            ),
        }
    }
}

struct CipherSlot {
    cipher: AeadCipher,
    scratch: Vec<u8>,
    generation: u64,
}

/// A cipher checked out of the pool. Returned to the pool on drop.
pub struct PooledCipher<'a> {
    pool: &'a CipherPool,
    role: Role,
    slot: Option<CipherSlot>,
}

impl PooledCipher<'_> {
    /// Encrypt `plaintext`, returning ciphertext and detached tag.
    pub fn encrypt(
        &mut self,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; TAG_LEN]), StoreError> {
        let slot = self.slot_mut()?;
        slot.scratch.clear();
        slot.scratch.extend_from_slice(plaintext);
        let tag = slot
            .cipher
            .seal_in_place(nonce, aad, &mut slot.scratch)
            .map_err(|_| StoreError::Io {
                reason: "aead encryption rejected the payload".to_string(),
            })?;
        Ok((slot.scratch.clone(), tag))
    }

    /// Decrypt and authenticate. A tag mismatch is always an error.
    pub fn decrypt(
        &mut self,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
        aad: &[u8],
    ) -> Result<Vec<u8>, StoreError> {
        let slot = self.slot_mut()?;
        slot.scratch.clear();
        slot.scratch.extend_from_slice(ciphertext);
        match slot.cipher.open_in_place(nonce, aad, &mut slot.scratch, tag) {
            Ok(()) => Ok(slot.scratch.clone()),
            Err(_) => {
                slot.scratch.zeroize();
                Err(StoreError::AuthenticationFailure {
                    context: "record tag mismatch".to_string(),
                })
            }
        }
    }

    /// Return the instance to the pool. Equivalent to dropping it.
    pub fn release(self) {}

    fn slot_mut(&mut self) -> Result<&mut CipherSlot, StoreError> {
        self.slot.as_mut().ok_or_else(|| StoreError::KeyUnavailable {
            reason: "pooled cipher already released".to_string(),
        })
    }
}

impl Drop for PooledCipher<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.give_back(self.role, slot);
        }
    }
}

struct KeyState {
    key: Option<Arc<MasterKey>>,
    salt: [u8; SALT_LEN],
    generation: u64,
}

struct Slots {
    capacity: usize,
    state: Mutex<SlotState>,
    available: Condvar,
}

struct SlotState {
    idle: Vec<CipherSlot>,
    live: usize,
}

impl Slots {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(SlotState {
                idle: Vec::new(),
                live: 0,
            }),
            available: Condvar::new(),
        }
    }

    fn drain(&self) {
        let mut state = self.state.lock();
        let drained = state.idle.len();
        state.idle.clear();
        state.live -= drained;
        self.available.notify_all();
    }
}

pub struct CipherPool {
    algorithm: Algorithm,
    keys: RwLock<KeyState>,
    counter: AtomicU64,
    encryptors: Slots,
    decryptors: Slots,
}

impl CipherPool {
    pub fn new(
        algorithm: Algorithm,
        key: Arc<MasterKey>,
        salt: [u8; SALT_LEN],
        size: PoolSize,
    ) -> Self {
        Self {
            algorithm,
            keys: RwLock::new(KeyState {
                key: Some(key),
                salt,
                generation: 0,
            }),
            counter: AtomicU64::new(0),
            encryptors: Slots::new(size.encryptors),
            decryptors: Slots::new(size.decryptors),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Block until an encryptor bound to the current key is available.
    pub fn checkout_encryptor(&self) -> Result<PooledCipher<'_>, StoreError> {
        self.checkout(Role::Encrypt)
    }

    /// Block until a decryptor bound to the current key is available.
    pub fn checkout_decryptor(&self) -> Result<PooledCipher<'_>, StoreError> {
        self.checkout(Role::Decrypt)
    }

    /// Reserve the next nonce for the current key.
    pub fn next_nonce(&self) -> Result<[u8; NONCE_LEN], StoreError> {
        // Holding the read lock keeps salt and counter consistent across a rekey.
        let keys = self.keys.read();
        let counter = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_add(1))
            .map_err(|_| StoreError::NonceExhausted)?;
        Ok(build_nonce(keys.salt, counter))
    }

    /// Advance the counter past a nonce already present on disk.
    pub fn observe_nonce(&self, nonce: &[u8; NONCE_LEN]) {
        let keys = self.keys.read();
        if nonce[..SALT_LEN] != keys.salt {
            return;
        }
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&nonce[SALT_LEN..]);
        let next = u64::from_be_bytes(counter).saturating_add(1);
        self.counter.fetch_max(next, Ordering::SeqCst);
    }

    /// Number of nonces handed out (or observed) under the current key.
    pub fn nonce_counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Encrypt with a fresh nonce and a pooled encryptor.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, StoreError> {
        let nonce = self.next_nonce()?;
        let (ciphertext, tag) = self.checkout_encryptor()?.encrypt(&nonce, plaintext, aad)?;
        Ok(Sealed {
            nonce,
            ciphertext,
            tag,
        })
    }

    /// Decrypt with a pooled decryptor.
    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
        aad: &[u8],
    ) -> Result<Vec<u8>, StoreError> {
        self.checkout_decryptor()?
            .decrypt(nonce, ciphertext, tag, aad)
    }

    /// Replace the key. Outstanding instances are discarded when released and
    /// the nonce counter restarts, since uniqueness is scoped per key.
    pub fn rekey(&self, key: Arc<MasterKey>, salt: [u8; SALT_LEN]) {
        {
            let mut keys = self.keys.write();
            keys.key = Some(key);
            keys.salt = salt;
            keys.generation += 1;
            self.counter.store(0, Ordering::SeqCst);
        }
        self.encryptors.drain();
        self.decryptors.drain();
        debug!("cipher pool rekeyed");
    }

    /// Drop the key and every idle instance. Later checkouts fail.
    pub fn destroy(&self) {
        {
            let mut keys = self.keys.write();
            keys.key = None;
            keys.generation += 1;
        }
        self.encryptors.drain();
        self.decryptors.drain();
        debug!("cipher pool destroyed");
    }

    /// Pre-build instances up to capacity on both sides.
    ///
    /// Safe to race with regular checkouts; returns how many were built.
    pub fn warm_up(&self) -> Result<usize, StoreError> {
        let mut built = 0;
        for slots in [&self.encryptors, &self.decryptors] {
            loop {
                {
                    let mut state = slots.state.lock();
                    if state.live >= slots.capacity {
                        break;
                    }
                    state.live += 1;
                }
                match self.build() {
                    Ok(slot) => {
                        if self.shelve(slots, slot) {
                            built += 1;
                        }
                    }
                    Err(err) => {
                        slots.state.lock().live -= 1;
                        slots.available.notify_one();
                        return Err(err);
                    }
                }
            }
        }
        debug!(built, "cipher pool warmed");
        Ok(built)
    }

    fn slots(&self, role: Role) -> &Slots {
        match role {
            Role::Encrypt => &self.encryptors,
            Role::Decrypt => &self.decryptors,
        }
    }

    fn generation(&self) -> u64 {
        self.keys.read().generation
    }

    fn checkout(&self, role: Role) -> Result<PooledCipher<'_>, StoreError> {
        let slots = self.slots(role);
        let mut state = slots.state.lock();
        loop {
            let generation = self.generation();
            if let Some(slot) = state.idle.pop() {
                if slot.generation == generation {
                    return Ok(self.lease(role, slot));
                }
                state.live -= 1;
                continue;
            }

            if state.live < slots.capacity {
                state.live += 1;
                drop(state);
                return match self.build() {
                    Ok(slot) => Ok(self.lease(role, slot)),
                    Err(err) => {
                        slots.state.lock().live -= 1;
                        slots.available.notify_one();
                        Err(err)
                    }
                };
            }

            trace!(%role, "waiting for pooled cipher");
            slots.available.wait(&mut state);
        }
    }

    fn lease(&self, role: Role, slot: CipherSlot) -> PooledCipher<'_> {
        PooledCipher {
            pool: self,
            role,
            slot: Some(slot),
        }
    }

    fn build(&self) -> Result<CipherSlot, StoreError> {
        let keys = self.keys.read();
        let key = keys.key.as_ref().ok_or_else(|| StoreError::KeyUnavailable {
            reason: "cipher pool has no master key".to_string(),
        })?;
        Ok(CipherSlot {
            cipher: AeadCipher::new(self.algorithm, key),
            scratch: Vec::new(),
            generation: keys.generation,
        })
    }

    fn give_back(&self, role: Role, mut slot: CipherSlot) {
        // Keep the allocation, drop the contents.
        slot.scratch.zeroize();
        self.shelve(self.slots(role), slot);
    }

    /// Park a reserved slot as idle, or retire it if the key changed since it
    /// was built. Returns whether it was kept.
    fn shelve(&self, slots: &Slots, slot: CipherSlot) -> bool {
        let mut state = slots.state.lock();
        let current = slot.generation == self.generation();
        if current {
            state.idle.push(slot);
        } else {
            state.live -= 1;
        }
        slots.available.notify_one();
        current
    }
}

pub(crate) fn build_nonce(salt: [u8; SALT_LEN], counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..SALT_LEN].copy_from_slice(&salt);
    nonce[SALT_LEN..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::atomic::AtomicUsize, time::Duration};

    use super::*;

    fn pool(algorithm: Algorithm, encryptors: usize, decryptors: usize) -> CipherPool {
        CipherPool::new(
            algorithm,
            Arc::new(MasterKey::generate()),
            *b"SALT",
            PoolSize {
                encryptors,
                decryptors,
            },
        )
    }

    #[test]
    fn round_trips_with_both_algorithms() {
        for algorithm in [Algorithm::Aes256Gcm, Algorithm::ChaCha20Poly1305] {
            let pool = pool(algorithm, 2, 2);
            let sealed = pool.seal(b"hello pool", b"header").expect("seal");
            assert_ne!(sealed.ciphertext, b"hello pool");

            let plain = pool
                .open(&sealed.nonce, &sealed.ciphertext, &sealed.tag, b"header")
                .expect("open");
            assert_eq!(plain, b"hello pool");
        }
    }

    #[test]
    fn any_flipped_bit_fails_authentication() {
        let pool = pool(Algorithm::ChaCha20Poly1305, 1, 1);
        let sealed = pool.seal(b"tamper-evident", b"aad").expect("seal");

        for byte in 0..sealed.ciphertext.len() {
            let mut ciphertext = sealed.ciphertext.clone();
            ciphertext[byte] ^= 0x01;
            let err = pool
                .open(&sealed.nonce, &ciphertext, &sealed.tag, b"aad")
                .expect_err("flipped ciphertext must not decrypt");
            assert!(matches!(err, StoreError::AuthenticationFailure { .. }));
        }
        for bit in 0..TAG_LEN * 8 {
            let mut tag = sealed.tag;
            tag[bit / 8] ^= 1 << (bit % 8);
            assert!(pool
                .open(&sealed.nonce, &sealed.ciphertext, &tag, b"aad")
                .is_err());
        }
        assert!(pool
            .open(&sealed.nonce, &sealed.ciphertext, &sealed.tag, b"other")
            .is_err());
    }

    #[test]
    fn nonces_are_unique_and_salted() {
        let pool = pool(Algorithm::Aes256Gcm, 1, 1);
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let nonce = pool.next_nonce().expect("nonce");
            assert_eq!(&nonce[..SALT_LEN], b"SALT");
            assert!(seen.insert(nonce), "nonce reused");
        }
    }

    #[test]
    fn observed_nonces_push_the_counter_forward() {
        let pool = pool(Algorithm::Aes256Gcm, 1, 1);
        pool.observe_nonce(&build_nonce(*b"SALT", 41));
        pool.observe_nonce(&build_nonce(*b"SALT", 7));
        pool.observe_nonce(&build_nonce(*b"ELSE", 900));
        assert_eq!(pool.nonce_counter(), 42);
        assert_eq!(pool.next_nonce().expect("nonce"), build_nonce(*b"SALT", 42));
    }

    #[test]
    fn exhausted_counter_is_an_error() {
        let pool = pool(Algorithm::Aes256Gcm, 1, 1);
        pool.observe_nonce(&build_nonce(*b"SALT", u64::MAX - 1));
        assert_eq!(pool.next_nonce(), Err(StoreError::NonceExhausted));
    }

    #[test]
    fn concurrent_checkouts_never_exceed_capacity() {
        let pool = pool(Algorithm::Aes256Gcm, 2, 2);
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let mut cipher = pool.checkout_encryptor().expect("checkout");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    cipher
                        .encrypt(&build_nonce(*b"TEST", 1), b"x", b"")
                        .expect("encrypt");
                    active.fetch_sub(1, Ordering::SeqCst);
                    cipher.release();
                });
            }
        });

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn warm_up_fills_both_sides_once() {
        let pool = pool(Algorithm::ChaCha20Poly1305, 3, 2);
        assert_eq!(pool.warm_up().expect("warm"), 5);
        assert_eq!(pool.warm_up().expect("warm again"), 0);
        pool.seal(b"after warm-up", b"").expect("seal");
    }

    #[test]
    fn rekey_resets_counter_and_retires_old_instances() {
        let pool = pool(Algorithm::Aes256Gcm, 1, 1);
        let old = pool.seal(b"old key", b"").expect("seal");
        let stale = pool.checkout_decryptor().expect("checkout");

        pool.rekey(Arc::new(MasterKey::generate()), *b"NEW!");
        assert_eq!(pool.nonce_counter(), 0);
        drop(stale);

        let nonce = pool.next_nonce().expect("nonce");
        assert_eq!(nonce, build_nonce(*b"NEW!", 0));
        let err = pool
            .open(&old.nonce, &old.ciphertext, &old.tag, b"")
            .expect_err("old ciphertext under new key");
        assert!(matches!(err, StoreError::AuthenticationFailure { .. }));
    }

    #[test]
    fn slot_built_before_destroy_is_not_kept() {
        let pool = pool(Algorithm::Aes256Gcm, 1, 1);
        pool.encryptors.state.lock().live += 1;
        let slot = pool.build().expect("build");

        pool.destroy();
        assert!(!pool.shelve(&pool.encryptors, slot));

        let state = pool.encryptors.state.lock();
        assert!(state.idle.is_empty());
        assert_eq!(state.live, 0);
    }

    #[test]
    fn aes_round_keys_are_wiped_on_drop() {
        fn wipes_on_drop<T: zeroize::ZeroizeOnDrop>() {}
        wipes_on_drop::<aes::Aes256>();
    }

    #[test]
    fn destroyed_pool_refuses_checkouts() {
        let pool = pool(Algorithm::Aes256Gcm, 1, 1);
        pool.warm_up().expect("warm");
        pool.destroy();
        assert!(matches!(
            pool.checkout_encryptor(),
            Err(StoreError::KeyUnavailable { .. })
        ));
    }
}
