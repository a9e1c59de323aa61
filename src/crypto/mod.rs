pub mod hash_chain;
pub mod hashing;
pub mod keys;
pub mod merkle;
pub mod signer;

pub use hash_chain::{HashChainSigner, OneTimeSignature};
pub use hashing::{canonical_json, hash_canonical, sha256};
pub use merkle::{merkle_root, MerkleProof, MerkleTree, ZERO_HASH};
pub use signer::NodeSigner;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::error::ErrorKind;

/// Address prefix shared by every account and validator address.
pub const ADDRESS_PREFIX: &str = "0x";

/// Bytes of the public-key digest kept in an address.
pub const ADDRESS_BYTES: usize = 20;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("hash chain exhausted: index {index} >= capacity {capacity}, rotate the key")]
    ChainExhausted { index: usize, capacity: usize },

    #[error("signer unavailable: {0}")]
    SignerUnavailable(String),
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::InvalidKey(_) => ErrorKind::Validation,
            CryptoError::ChainExhausted { .. } => ErrorKind::Fatal,
            CryptoError::SignerUnavailable(_) => ErrorKind::Resource,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CryptoError::InvalidKey(_) => "invalid_key",
            CryptoError::ChainExhausted { .. } => "hash_chain_exhausted",
            CryptoError::SignerUnavailable(_) => "signer_unavailable",
        }
    }
}

/// Generate a fresh ed25519 signing key from the OS RNG.
pub fn generate_keypair() -> SigningKey {
    let mut csprng = OsRng {};
    SigningKey::generate(&mut csprng)
}

/// Derive the account address from raw public key bytes:
/// `0x` + hex of the first 20 bytes of sha256(pubkey).
pub fn address_from_pubkey(pubkey: &[u8]) -> String {
    let digest = sha256(pubkey);
    format!("{}{}", ADDRESS_PREFIX, hex::encode(&digest[..ADDRESS_BYTES]))
}

/// Address of a signing key's public half.
pub fn address_of(sk: &SigningKey) -> String {
    address_from_pubkey(sk.verifying_key().as_bytes())
}

/// Shape check only: prefix, length and hex alphabet.
pub fn is_valid_address(addr: &str) -> bool {
    match addr.strip_prefix(ADDRESS_PREFIX) {
        Some(body) => {
            body.len() == ADDRESS_BYTES * 2 && body.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

/// Hex-encoded public key of a signing key.
pub fn pubkey_hex(sk: &SigningKey) -> String {
    hex::encode(sk.verifying_key().to_bytes())
}

/// Sign message bytes and return signature bytes.
pub fn sign_bytes(sk: &SigningKey, msg: &[u8]) -> Vec<u8> {
    Signer::sign(sk, msg).to_bytes().to_vec()
}

/// Sign and hex-encode.
pub fn sign_hex(sk: &SigningKey, msg: &[u8]) -> String {
    hex::encode(sign_bytes(sk, msg))
}

/// Verify signature with public key bytes.
/// Malformed keys or signatures verify as false, never as an error.
pub fn verify_bytes(pubkey: &[u8], msg: &[u8], sig: &[u8]) -> bool {
    let pubkey_array: [u8; 32] = match pubkey.try_into() {
        Ok(arr) => arr,
        Err(_) => return false,
    };
    let pk = match VerifyingKey::from_bytes(&pubkey_array) {
        Ok(p) => p,
        Err(_) => return false,
    };

    let sig_array: [u8; 64] = match sig.try_into() {
        Ok(arr) => arr,
        Err(_) => return false,
    };
    let s = Signature::from_bytes(&sig_array);
    pk.verify(msg, &s).is_ok()
}

/// Verify ed25519 signature where public key and signature are hex strings.
pub fn verify_ed25519_hex(pubkey_hex: &str, sig_hex: &str, message: &[u8]) -> bool {
    let pk_bytes = match hex::decode(pubkey_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let sig_bytes = match hex::decode(sig_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };
    verify_bytes(&pk_bytes, message, &sig_bytes)
}

/// Set file permissions to owner-only (0600) on Unix systems.
/// No-op on Windows (ACLs handle security differently).
pub fn set_restrictive_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            log::warn!("Failed to set permissions on {}: {}", path.display(), e);
        }
    }
    let _ = path;
}
