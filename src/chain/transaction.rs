// src/chain/transaction.rs
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, keys};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub from: String,
    pub to: String,
    pub value: u64,

    /// Sender account nonce; must equal the account's committed nonce when applied.
    pub nonce: u64,

    /// Normalized integer gas price. Higher price = earlier inclusion.
    #[serde(default)]
    pub gas_price: u64,

    /// Sender public key (hex). `from` must be its derived address.
    pub public_key: String,

    /// ed25519 signature (hex) over the hash string bytes.
    pub signature: String,

    /// sha256 over the canonicalized unsigned fields.
    pub hash: String,
}

/// Fields covered by the transaction hash. Field order here is irrelevant,
/// the hash is taken over the canonical (key-sorted) serialization.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningPayload<'a> {
    from: &'a str,
    to: &'a str,
    value: u64,
    nonce: u64,
    gas_price: u64,
    public_key: &'a str,
}

impl Transaction {
    /// Build, hash and sign a transfer from the owner of `sk`.
    pub fn new_signed(sk: &SigningKey, to: &str, value: u64, nonce: u64, gas_price: u64) -> Self {
        let mut tx = Transaction {
            from: crypto::address_of(sk),
            to: to.to_string(),
            value,
            nonce,
            gas_price,
            public_key: crypto::pubkey_hex(sk),
            signature: String::new(),
            hash: String::new(),
        };
        tx.hash = tx.compute_hash();
        tx.signature = crypto::sign_hex(sk, tx.hash.as_bytes());
        tx
    }

    pub fn compute_hash(&self) -> String {
        let payload = SigningPayload {
            from: &self.from,
            to: &self.to,
            value: self.value,
            nonce: self.nonce,
            gas_price: self.gas_price,
            public_key: &self.public_key,
        };
        // serializing a struct of plain fields cannot fail
        crypto::hash_canonical(&payload).unwrap_or_default()
    }

    /// Shape, hash and signature checks. Stateless: nonce and balance are
    /// checked against account state elsewhere.
    pub fn validate(&self) -> Result<(), String> {
        if !crypto::is_valid_address(&self.from) {
            return Err(format!("invalid sender address '{}'", self.from));
        }
        if !crypto::is_valid_address(&self.to) {
            return Err(format!("invalid recipient address '{}'", self.to));
        }
        let vk = keys::verifying_key_from_hex(&self.public_key)
            .map_err(|e| format!("invalid public key: {}", e))?;
        if crypto::address_from_pubkey(vk.as_bytes()) != self.from {
            return Err("sender address does not match public key".to_string());
        }
        let expected = self.compute_hash();
        if self.hash != expected {
            return Err(format!(
                "hash mismatch: got '{}', expected '{}'",
                self.hash, expected
            ));
        }
        if !crypto::verify_ed25519_hex(&self.public_key, &self.signature, self.hash.as_bytes()) {
            return Err("bad signature".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::signing_key_from_seed;

    fn recipient() -> String {
        crypto::address_of(&signing_key_from_seed(&[9u8; 32]))
    }

    #[test]
    fn signed_transaction_validates() {
        let sk = signing_key_from_seed(&[1u8; 32]);
        let tx = Transaction::new_signed(&sk, &recipient(), 10, 0, 5);
        assert!(tx.validate().is_ok());
    }

    #[test]
    fn tampered_value_fails_hash_check() {
        let sk = signing_key_from_seed(&[1u8; 32]);
        let mut tx = Transaction::new_signed(&sk, &recipient(), 10, 0, 5);
        tx.value = 11;
        let err = tx.validate().unwrap_err();
        assert!(err.contains("hash mismatch"), "{}", err);
    }

    #[test]
    fn rehashed_tamper_fails_signature() {
        let sk = signing_key_from_seed(&[1u8; 32]);
        let mut tx = Transaction::new_signed(&sk, &recipient(), 10, 0, 5);
        tx.value = 11;
        tx.hash = tx.compute_hash();
        assert_eq!(tx.validate().unwrap_err(), "bad signature");
    }

    #[test]
    fn foreign_public_key_rejected() {
        let sk = signing_key_from_seed(&[1u8; 32]);
        let other = signing_key_from_seed(&[2u8; 32]);
        let mut tx = Transaction::new_signed(&sk, &recipient(), 10, 0, 5);
        tx.public_key = crypto::pubkey_hex(&other);
        assert!(tx.validate().unwrap_err().contains("does not match"));
    }

    #[test]
    fn json_uses_camel_case() {
        let sk = signing_key_from_seed(&[1u8; 32]);
        let tx = Transaction::new_signed(&sk, &recipient(), 1, 0, 2);
        let v = serde_json::to_value(&tx).unwrap();
        assert!(v.get("gasPrice").is_some());
        assert!(v.get("publicKey").is_some());
    }
}
