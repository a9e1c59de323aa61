// src/keystore.rs
//! Encrypted-at-rest key custody for the validator.
//!
//! Layout on disk:
//! - `<path>`       JSON [`KeystoreFile`]: KDF parameters, a password verifier
//!                  and one entry per key (private key sealed with AES-256-GCM)
//! - `<path>.salt`  32 random bytes, the PBKDF2 salt
//!
//! Both files are written 0600. The store starts `Locked`; a correct password
//! moves it to `Unlocked`. Too many wrong passwords in a row move it to
//! `HardLocked`, which only [`Keystore::reset_lockout`] leaves.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use ed25519_dalek::{Signer, SigningKey};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{self, keys::signing_key_from_hex, CryptoError, NodeSigner};
use crate::error::ErrorKind;

pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 210_000;
const SALT_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const FILE_VERSION: u32 = 1;
const VERIFIER_MARKER: &[u8] = b"ouro-validator-keystore";

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("keystore is locked")]
    Locked,

    #[error("no keystore configured for this node")]
    NotConfigured,

    #[error("keystore hard-locked after too many failed unlocks; operator reset required")]
    HardLocked,

    #[error("wrong password ({remaining} attempt(s) left before hard lock)")]
    WrongPassword { remaining: u32 },

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key {0} is inactive")]
    KeyInactive(String),

    #[error("address mismatch: claimed {claimed}, derived {derived}")]
    AddressMismatch { claimed: String, derived: String },

    #[error("key for address {0} already present")]
    DuplicateKey(String),

    #[error("pbkdf2 iterations {0} below minimum of 100000")]
    WeakKdf(u32),

    #[error("keystore already exists at {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("decryption failed: ciphertext tampered or wrong key")]
    Decrypt,

    #[error("keystore corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    InvalidKey(#[from] CryptoError),

    #[error("keystore io: {0}")]
    Io(#[from] std::io::Error),

    #[error("keystore encoding: {0}")]
    Serde(#[from] serde_json::Error),
}

impl KeystoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeystoreError::KeyNotFound(_)
            | KeystoreError::KeyInactive(_)
            | KeystoreError::AddressMismatch { .. }
            | KeystoreError::DuplicateKey(_)
            | KeystoreError::WeakKdf(_)
            | KeystoreError::NotConfigured
            | KeystoreError::InvalidKey(_) => ErrorKind::Validation,
            KeystoreError::Corrupt(_) => ErrorKind::Fatal,
            _ => ErrorKind::Resource,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            KeystoreError::Locked => "keystore_locked",
            KeystoreError::NotConfigured => "keystore_not_configured",
            KeystoreError::HardLocked => "keystore_hard_locked",
            KeystoreError::WrongPassword { .. } => "wrong_password",
            KeystoreError::KeyNotFound(_) => "key_not_found",
            KeystoreError::KeyInactive(_) => "key_inactive",
            KeystoreError::AddressMismatch { .. } => "address_mismatch",
            KeystoreError::DuplicateKey(_) => "duplicate_key",
            KeystoreError::WeakKdf(_) => "weak_kdf",
            KeystoreError::AlreadyExists(_) => "keystore_exists",
            KeystoreError::Decrypt => "decrypt_failed",
            KeystoreError::Corrupt(_) | KeystoreError::Serde(_) => "keystore_corrupt",
            KeystoreError::InvalidKey(_) => "invalid_key",
            KeystoreError::Io(_) => "keystore_io",
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeystoreConfig {
    pub path: PathBuf,
    pub iterations: u32,
    pub max_failed_attempts: u32,
    pub auto_lock: Duration,
}

impl KeystoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            iterations: DEFAULT_PBKDF2_ITERATIONS,
            max_failed_attempts: 5,
            auto_lock: Duration::from_secs(300),
        }
    }

    pub fn salt_path(&self) -> PathBuf {
        salt_path(&self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Locked,
    Unlocked,
    HardLocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sealed {
    nonce: String,
    ciphertext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKey {
    key_id: String,
    address: String,
    public_key: String,
    encrypted_private_key: Sealed,
    version: u32,
    usage_count: u64,
    is_active: bool,
    created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rotated_from: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeystoreFile {
    version: u32,
    iterations: u32,
    verifier: Sealed,
    #[serde(default)]
    failed_attempts: u32,
    keys: Vec<StoredKey>,
}

/// Public view of a stored key. Never carries private material.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    pub key_id: String,
    pub address: String,
    pub public_key: String,
    pub version: u32,
    pub usage_count: u64,
    pub is_active: bool,
    pub created_at: i64,
    pub rotated_from: Option<String>,
}

impl From<&StoredKey> for KeyMetadata {
    fn from(k: &StoredKey) -> Self {
        Self {
            key_id: k.key_id.clone(),
            address: k.address.clone(),
            public_key: k.public_key.clone(),
            version: k.version,
            usage_count: k.usage_count,
            is_active: k.is_active,
            created_at: k.created_at,
            rotated_from: k.rotated_from.clone(),
        }
    }
}

/// Material that only exists while unlocked. Dropping it wipes the derived
/// key and every cached signing key.
struct Session {
    key: Zeroizing<[u8; 32]>,
    cache: HashMap<String, SigningKey>,
    last_activity: Instant,
}

pub struct Keystore {
    config: KeystoreConfig,
    salt: [u8; SALT_LENGTH],
    file: KeystoreFile,
    session: Option<Session>,
    hard_locked: bool,
    dirty: bool,
}

impl Keystore {
    /// Create a new, empty keystore. Returned unlocked.
    pub fn create(config: KeystoreConfig, password: &str) -> Result<Self, KeystoreError> {
        if config.iterations < MIN_PBKDF2_ITERATIONS {
            return Err(KeystoreError::WeakKdf(config.iterations));
        }
        if config.path.exists() {
            return Err(KeystoreError::AlreadyExists(config.path.clone()));
        }
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut salt = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        write_private(&config.salt_path(), &salt)?;

        let key = derive_key(password, &salt, config.iterations);
        let verifier = seal(&key, VERIFIER_MARKER)?;
        let file = KeystoreFile {
            version: FILE_VERSION,
            iterations: config.iterations,
            verifier,
            failed_attempts: 0,
            keys: Vec::new(),
        };
        let mut store = Self {
            config,
            salt,
            file,
            session: Some(Session {
                key,
                cache: HashMap::new(),
                last_activity: Instant::now(),
            }),
            hard_locked: false,
            dirty: true,
        };
        store.persist()?;
        log::info!("created keystore at {}", store.config.path.display());
        Ok(store)
    }

    /// Open an existing keystore in the `Locked` state.
    pub fn open(config: KeystoreConfig) -> Result<Self, KeystoreError> {
        let salt_bytes = fs::read(config.salt_path())?;
        let salt: [u8; SALT_LENGTH] = salt_bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeystoreError::Corrupt(format!("salt must be {} bytes", SALT_LENGTH)))?;
        let file: KeystoreFile = serde_json::from_slice(&fs::read(&config.path)?)?;
        if file.version != FILE_VERSION {
            return Err(KeystoreError::Corrupt(format!(
                "unsupported keystore version {}",
                file.version
            )));
        }
        if file.iterations < MIN_PBKDF2_ITERATIONS {
            return Err(KeystoreError::WeakKdf(file.iterations));
        }
        for k in &file.keys {
            let pubkey = hex::decode(&k.public_key)
                .map_err(|e| KeystoreError::Corrupt(format!("key {}: {}", k.key_id, e)))?;
            let derived = crypto::address_from_pubkey(&pubkey);
            if derived != k.address {
                return Err(KeystoreError::Corrupt(format!(
                    "key {} address {} does not match its public key ({})",
                    k.key_id, k.address, derived
                )));
            }
        }
        let hard_locked = file.failed_attempts >= config.max_failed_attempts;
        if hard_locked {
            log::warn!("keystore {} is hard-locked", config.path.display());
        }
        Ok(Self {
            config,
            salt,
            file,
            session: None,
            hard_locked,
            dirty: false,
        })
    }

    /// Open if present, otherwise create.
    pub fn open_or_create(config: KeystoreConfig, password: &str) -> Result<Self, KeystoreError> {
        if config.path.exists() {
            let mut ks = Self::open(config)?;
            ks.unlock(password)?;
            Ok(ks)
        } else {
            Self::create(config, password)
        }
    }

    pub fn state(&self) -> LockState {
        if self.hard_locked {
            LockState::HardLocked
        } else if self.session.is_some() {
            LockState::Unlocked
        } else {
            LockState::Locked
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.file.failed_attempts
    }

    pub fn unlock(&mut self, password: &str) -> Result<(), KeystoreError> {
        if self.hard_locked {
            return Err(KeystoreError::HardLocked);
        }
        let key = derive_key(password, &self.salt, self.file.iterations);
        match open_sealed(&key, &self.file.verifier) {
            Ok(marker) if marker.as_slice() == VERIFIER_MARKER => {
                if self.file.failed_attempts != 0 {
                    self.file.failed_attempts = 0;
                    self.dirty = true;
                }
                self.session = Some(Session {
                    key,
                    cache: HashMap::new(),
                    last_activity: Instant::now(),
                });
                self.persist()?;
                log::info!("keystore unlocked");
                Ok(())
            }
            _ => {
                self.file.failed_attempts += 1;
                self.dirty = true;
                let max = self.config.max_failed_attempts;
                let remaining = max.saturating_sub(self.file.failed_attempts);
                if remaining == 0 {
                    self.hard_locked = true;
                    log::error!(
                        "keystore hard-locked after {} failed unlock attempts",
                        self.file.failed_attempts
                    );
                } else {
                    log::warn!("keystore unlock failed, {} attempt(s) left", remaining);
                }
                self.persist()?;
                Err(KeystoreError::WrongPassword { remaining })
            }
        }
    }

    /// Drop the session. The derived key and cached keys are wiped before
    /// this returns.
    pub fn lock(&mut self) {
        if let Err(e) = self.persist() {
            log::warn!("failed to flush keystore on lock: {}", e);
        }
        if self.session.take().is_some() {
            log::info!("keystore locked");
        }
    }

    /// Operator escape hatch out of `HardLocked`.
    pub fn reset_lockout(&mut self) -> Result<(), KeystoreError> {
        self.hard_locked = false;
        self.file.failed_attempts = 0;
        self.dirty = true;
        self.persist()?;
        log::warn!("keystore lockout reset by operator");
        Ok(())
    }

    /// Lock if idle past the auto-lock window as of `now`. Returns true when
    /// this call locked the store.
    pub fn lock_if_idle_at(&mut self, now: Instant) -> bool {
        let idle = match &self.session {
            Some(s) => now.saturating_duration_since(s.last_activity) >= self.config.auto_lock,
            None => false,
        };
        if idle {
            log::info!("keystore auto-locked after {:?} idle", self.config.auto_lock);
            self.lock();
        }
        idle
    }

    pub fn lock_if_idle(&mut self) -> bool {
        self.lock_if_idle_at(Instant::now())
    }

    fn session(&mut self) -> Result<&mut Session, KeystoreError> {
        if self.hard_locked {
            return Err(KeystoreError::HardLocked);
        }
        self.lock_if_idle();
        let session = self.session.as_mut().ok_or(KeystoreError::Locked)?;
        session.last_activity = Instant::now();
        Ok(session)
    }

    pub fn generate_key(&mut self) -> Result<KeyMetadata, KeystoreError> {
        let sk = crypto::generate_keypair();
        let meta = self.insert_key(sk, 1, None)?;
        log::info!("generated key {} ({})", meta.key_id, meta.address);
        Ok(meta)
    }

    /// Import a raw private key. When `claimed_address` is given it must match
    /// the address derived from the key.
    pub fn import_key(
        &mut self,
        private_key_hex: &str,
        claimed_address: Option<&str>,
    ) -> Result<KeyMetadata, KeystoreError> {
        let sk = signing_key_from_hex(private_key_hex)?;
        let derived = crypto::address_of(&sk);
        if let Some(claimed) = claimed_address {
            if !claimed.eq_ignore_ascii_case(&derived) {
                return Err(KeystoreError::AddressMismatch {
                    claimed: claimed.to_string(),
                    derived,
                });
            }
        }
        let meta = self.insert_key(sk, 1, None)?;
        log::info!("imported key {} ({})", meta.key_id, meta.address);
        Ok(meta)
    }

    fn insert_key(
        &mut self,
        sk: SigningKey,
        version: u32,
        rotated_from: Option<String>,
    ) -> Result<KeyMetadata, KeystoreError> {
        let address = crypto::address_of(&sk);
        if self
            .file
            .keys
            .iter()
            .any(|k| k.is_active && k.address == address)
        {
            return Err(KeystoreError::DuplicateKey(address));
        }
        let session = self.session()?;
        let secret = Zeroizing::new(sk.to_bytes());
        let sealed = seal(&session.key, secret.as_slice())?;
        let key_id = uuid::Uuid::new_v4().to_string();
        session.cache.insert(key_id.clone(), sk.clone());

        let stored = StoredKey {
            key_id,
            address,
            public_key: crypto::pubkey_hex(&sk),
            encrypted_private_key: sealed,
            version,
            usage_count: 0,
            is_active: true,
            created_at: chrono::Utc::now().timestamp(),
            rotated_from,
        };
        let meta = KeyMetadata::from(&stored);
        self.file.keys.push(stored);
        self.dirty = true;
        self.persist()?;
        Ok(meta)
    }

    fn position(&self, key_id: &str) -> Result<usize, KeystoreError> {
        self.file
            .keys
            .iter()
            .position(|k| k.key_id == key_id)
            .ok_or_else(|| KeystoreError::KeyNotFound(key_id.to_string()))
    }

    /// Decrypted signing key for an active key, served from the session cache.
    pub fn signing_key(&mut self, key_id: &str) -> Result<SigningKey, KeystoreError> {
        let idx = self.position(key_id)?;
        if !self.file.keys[idx].is_active {
            return Err(KeystoreError::KeyInactive(key_id.to_string()));
        }
        let sealed = self.file.keys[idx].encrypted_private_key.clone();
        let session = self.session()?;
        if let Some(sk) = session.cache.get(key_id) {
            return Ok(sk.clone());
        }
        let plain = Zeroizing::new(open_sealed(&session.key, &sealed)?);
        let bytes: [u8; 32] = plain
            .as_slice()
            .try_into()
            .map_err(|_| KeystoreError::Corrupt(format!("key {} has bad length", key_id)))?;
        let sk = SigningKey::from_bytes(&bytes);
        session.cache.insert(key_id.to_string(), sk.clone());
        Ok(sk)
    }

    pub fn sign(&mut self, key_id: &str, msg: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        let sk = self.signing_key(key_id)?;
        let sig = Signer::sign(&sk, msg).to_bytes().to_vec();
        let idx = self.position(key_id)?;
        self.file.keys[idx].usage_count += 1;
        self.dirty = true;
        Ok(sig)
    }

    /// Signature check against a raw public key. Needs no secret, so it works
    /// in every lock state.
    pub fn verify(&self, public_key: &[u8], msg: &[u8], sig: &[u8]) -> bool {
        crypto::verify_bytes(public_key, msg, sig)
    }

    /// Replace `key_id` with a fresh key. The old entry stays on disk,
    /// marked inactive.
    pub fn rotate_key(&mut self, key_id: &str) -> Result<KeyMetadata, KeystoreError> {
        let idx = self.position(key_id)?;
        if !self.file.keys[idx].is_active {
            return Err(KeystoreError::KeyInactive(key_id.to_string()));
        }
        self.session()?;
        let version = self.file.keys[idx].version + 1;
        self.file.keys[idx].is_active = false;
        if let Some(s) = self.session.as_mut() {
            s.cache.remove(key_id);
        }
        let sk = crypto::generate_keypair();
        match self.insert_key(sk, version, Some(key_id.to_string())) {
            Ok(meta) => {
                log::info!("rotated key {} -> {} (v{})", key_id, meta.key_id, version);
                Ok(meta)
            }
            Err(e) => {
                self.file.keys[idx].is_active = true;
                Err(e)
            }
        }
    }

    pub fn list_keys(&self) -> Vec<KeyMetadata> {
        self.file.keys.iter().map(KeyMetadata::from).collect()
    }

    /// First active key, the default validator identity.
    pub fn primary_key(&self) -> Option<KeyMetadata> {
        self.file
            .keys
            .iter()
            .find(|k| k.is_active)
            .map(KeyMetadata::from)
    }

    fn persist(&mut self) -> Result<(), KeystoreError> {
        if !self.dirty {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&self.file)?;
        write_private(&self.config.path, &bytes)?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for Keystore {
    fn drop(&mut self) {
        if let Err(e) = self.persist() {
            log::warn!("failed to flush keystore on drop: {}", e);
        }
    }
}

/// Signs with one keystore entry. Every signature goes through
/// [`Keystore::sign`], so locking the store stops signing at once.
pub struct KeystoreSigner {
    keystore: Arc<Mutex<Keystore>>,
    key_id: String,
    address: String,
    public_key: String,
}

impl KeystoreSigner {
    pub fn new(keystore: Arc<Mutex<Keystore>>, key: &KeyMetadata) -> Self {
        Self {
            keystore,
            key_id: key.key_id.clone(),
            address: key.address.clone(),
            public_key: key.public_key.clone(),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl NodeSigner for KeystoreSigner {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn public_key_hex(&self) -> String {
        self.public_key.clone()
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.keystore
            .lock()
            .sign(&self.key_id, msg)
            .map_err(|e| CryptoError::SignerUnavailable(e.to_string()))
    }
}

fn salt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".salt");
    path.with_file_name(name)
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key[..]);
    key
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Sealed, KeystoreError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| KeystoreError::Decrypt)?;
    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| KeystoreError::Decrypt)?;
    Ok(Sealed {
        nonce: hex::encode(nonce_bytes),
        ciphertext: hex::encode(ciphertext),
    })
}

fn open_sealed(key: &[u8; 32], sealed: &Sealed) -> Result<Vec<u8>, KeystoreError> {
    let nonce = hex::decode(&sealed.nonce).map_err(|_| KeystoreError::Decrypt)?;
    if nonce.len() != NONCE_LENGTH {
        return Err(KeystoreError::Decrypt);
    }
    let ciphertext = hex::decode(&sealed.ciphertext).map_err(|_| KeystoreError::Decrypt)?;
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| KeystoreError::Decrypt)?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| KeystoreError::Decrypt)
}

/// Atomic write with owner-only permissions.
fn write_private(path: &Path, bytes: &[u8]) -> Result<(), KeystoreError> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut f = fs::File::create(&tmp)?;
        crypto::set_restrictive_permissions(&tmp);
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    crypto::set_restrictive_permissions(path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path) -> KeystoreConfig {
        let mut c = KeystoreConfig::new(dir.join("validator.keystore"));
        c.iterations = MIN_PBKDF2_ITERATIONS;
        c.max_failed_attempts = 3;
        c
    }

    #[test]
    fn rejects_weak_kdf() {
        let dir = tempdir().unwrap();
        let mut c = config(dir.path());
        c.iterations = 1_000;
        assert!(matches!(
            Keystore::create(c, "pw"),
            Err(KeystoreError::WeakKdf(1_000))
        ));
    }

    #[test]
    fn generate_sign_verify_and_reopen() {
        let dir = tempdir().unwrap();
        let c = config(dir.path());
        let (meta, sig) = {
            let mut ks = Keystore::create(c.clone(), "correct horse").unwrap();
            let meta = ks.generate_key().unwrap();
            let sig = ks.sign(&meta.key_id, b"hello").unwrap();
            (meta, sig)
        };
        let pubkey = hex::decode(&meta.public_key).unwrap();

        let mut ks = Keystore::open(c).unwrap();
        assert_eq!(ks.state(), LockState::Locked);
        assert!(ks.verify(&pubkey, b"hello", &sig));
        assert!(matches!(ks.sign(&meta.key_id, b"x"), Err(KeystoreError::Locked)));

        ks.unlock("correct horse").unwrap();
        let sig2 = ks.sign(&meta.key_id, b"again").unwrap();
        assert!(ks.verify(&pubkey, b"again", &sig2));
        assert_eq!(ks.list_keys()[0].usage_count, 2);
    }

    #[test]
    fn files_are_owner_only() {
        let dir = tempdir().unwrap();
        let c = config(dir.path());
        Keystore::create(c.clone(), "pw").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for p in [&c.path, &c.salt_path()] {
                let mode = fs::metadata(p).unwrap().permissions().mode() & 0o777;
                assert_eq!(mode, 0o600, "{}", p.display());
            }
        }
        assert_eq!(fs::read(c.salt_path()).unwrap().len(), SALT_LENGTH);
    }

    #[test]
    fn hard_lock_after_failures_until_reset() {
        let dir = tempdir().unwrap();
        let c = config(dir.path());
        drop(Keystore::create(c.clone(), "right").unwrap());

        let mut ks = Keystore::open(c.clone()).unwrap();
        assert!(matches!(
            ks.unlock("wrong"),
            Err(KeystoreError::WrongPassword { remaining: 2 })
        ));
        assert!(ks.unlock("wrong").is_err());
        assert!(ks.unlock("wrong").is_err());
        assert_eq!(ks.state(), LockState::HardLocked);
        assert!(matches!(ks.unlock("right"), Err(KeystoreError::HardLocked)));

        // survives a restart
        drop(ks);
        let mut ks = Keystore::open(c).unwrap();
        assert_eq!(ks.state(), LockState::HardLocked);

        ks.reset_lockout().unwrap();
        ks.unlock("right").unwrap();
        assert_eq!(ks.state(), LockState::Unlocked);
        assert_eq!(ks.failed_attempts(), 0);
    }

    #[test]
    fn auto_lock_clears_session() {
        let dir = tempdir().unwrap();
        let mut c = config(dir.path());
        c.auto_lock = Duration::from_secs(60);
        let mut ks = Keystore::create(c, "pw").unwrap();
        let meta = ks.generate_key().unwrap();
        assert!(!ks.lock_if_idle_at(Instant::now()));
        assert!(ks.lock_if_idle_at(Instant::now() + Duration::from_secs(61)));
        assert_eq!(ks.state(), LockState::Locked);
        assert!(ks.session.is_none());
        assert!(matches!(ks.signing_key(&meta.key_id), Err(KeystoreError::Locked)));
    }

    #[test]
    fn shared_signer_follows_lock_state() {
        let dir = tempdir().unwrap();
        let mut ks = Keystore::create(config(dir.path()), "pw").unwrap();
        let meta = ks.generate_key().unwrap();
        let shared = Arc::new(Mutex::new(ks));
        let signer = KeystoreSigner::new(shared.clone(), &meta);
        assert_eq!(signer.address(), meta.address);

        let sig = signer.sign(b"prevote").unwrap();
        let pubkey = hex::decode(&meta.public_key).unwrap();
        assert!(crypto::verify_bytes(&pubkey, b"prevote", &sig));

        shared.lock().lock();
        assert!(matches!(signer.sign(b"prevote"), Err(CryptoError::SignerUnavailable(_))));

        shared.lock().unlock("pw").unwrap();
        assert!(signer.sign(b"precommit").is_ok());
        assert_eq!(shared.lock().list_keys()[0].usage_count, 2);
    }

    #[test]
    fn import_checks_address() {
        let dir = tempdir().unwrap();
        let mut ks = Keystore::create(config(dir.path()), "pw").unwrap();
        let sk = crypto::keys::signing_key_from_seed(&[9u8; 32]);
        let secret = hex::encode(sk.to_bytes());

        let err = ks.import_key(&secret, Some("0x0000000000000000000000000000000000000000"));
        assert!(matches!(err, Err(KeystoreError::AddressMismatch { .. })));

        let meta = ks.import_key(&secret, Some(&crypto::address_of(&sk))).unwrap();
        assert_eq!(meta.address, crypto::address_of(&sk));
        assert!(matches!(
            ks.import_key(&secret, None),
            Err(KeystoreError::DuplicateKey(_))
        ));
    }

    #[test]
    fn rotate_keeps_history() {
        let dir = tempdir().unwrap();
        let mut ks = Keystore::create(config(dir.path()), "pw").unwrap();
        let old = ks.generate_key().unwrap();
        let new = ks.rotate_key(&old.key_id).unwrap();
        assert_eq!(new.version, 2);
        assert_eq!(new.rotated_from.as_deref(), Some(old.key_id.as_str()));

        let keys = ks.list_keys();
        assert_eq!(keys.len(), 2);
        assert!(!keys.iter().find(|k| k.key_id == old.key_id).unwrap().is_active);
        assert!(matches!(ks.sign(&old.key_id, b"m"), Err(KeystoreError::KeyInactive(_))));
        assert!(ks.sign(&new.key_id, b"m").is_ok());
        assert_eq!(ks.primary_key().unwrap().key_id, new.key_id);
    }

    #[test]
    fn tampered_ciphertext_is_detected() {
        let dir = tempdir().unwrap();
        let c = config(dir.path());
        let key_id = {
            let mut ks = Keystore::create(c.clone(), "pw").unwrap();
            ks.generate_key().unwrap().key_id
        };
        let mut file: serde_json::Value =
            serde_json::from_slice(&fs::read(&c.path).unwrap()).unwrap();
        let ct = file["keys"][0]["encryptedPrivateKey"]["ciphertext"]
            .as_str()
            .unwrap()
            .to_string();
        let flipped = if ct.starts_with('0') { format!("1{}", &ct[1..]) } else { format!("0{}", &ct[1..]) };
        file["keys"][0]["encryptedPrivateKey"]["ciphertext"] = serde_json::Value::String(flipped);
        fs::write(&c.path, serde_json::to_vec(&file).unwrap()).unwrap();

        let mut ks = Keystore::open(c).unwrap();
        ks.unlock("pw").unwrap();
        assert!(matches!(ks.signing_key(&key_id), Err(KeystoreError::Decrypt)));
    }
}
