// src/crypto/signer.rs
// Signing seam for consensus and peer handshakes. A raw key signs directly;
// the keystore-backed signer decrypts per call and fails while locked.

use ed25519_dalek::SigningKey;
use std::sync::Arc;

use super::{address_of, pubkey_hex, sign_bytes, CryptoError};

pub trait NodeSigner: Send + Sync {
    fn address(&self) -> String;

    fn public_key_hex(&self) -> String;

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn sign_hex(&self, msg: &[u8]) -> Result<String, CryptoError> {
        self.sign(msg).map(hex::encode)
    }
}

impl NodeSigner for SigningKey {
    fn address(&self) -> String {
        address_of(self)
    }

    fn public_key_hex(&self) -> String {
        pubkey_hex(self)
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(sign_bytes(self, msg))
    }
}

impl<S: NodeSigner + ?Sized> NodeSigner for Arc<S> {
    fn address(&self) -> String {
        (**self).address()
    }

    fn public_key_hex(&self) -> String {
        (**self).public_key_hex()
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        (**self).sign(msg)
    }
}
