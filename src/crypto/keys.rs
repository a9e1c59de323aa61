// src/crypto/keys.rs
use ed25519_dalek::{SigningKey, VerifyingKey};

use super::CryptoError;

/// Build a signing key from a 32-byte secret seed.
pub fn signing_key_from_seed(seed: &[u8; 32]) -> SigningKey {
    SigningKey::from_bytes(seed)
}

/// Parse a signing key from hex. Accepts a 32-byte seed or 64-byte keypair bytes
/// (secret || public); for keypairs the public half must match.
pub fn signing_key_from_hex(hex_str: &str) -> Result<SigningKey, CryptoError> {
    let raw = hex::decode(hex_str.trim().trim_start_matches("0x"))
        .map_err(|e| CryptoError::InvalidKey(format!("hex: {}", e)))?;
    match raw.len() {
        32 => {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&raw);
            Ok(SigningKey::from_bytes(&seed))
        }
        64 => {
            let mut kp = [0u8; 64];
            kp.copy_from_slice(&raw);
            SigningKey::from_keypair_bytes(&kp)
                .map_err(|e| CryptoError::InvalidKey(format!("keypair: {}", e)))
        }
        n => Err(CryptoError::InvalidKey(format!(
            "expected 32 or 64 bytes, got {}",
            n
        ))),
    }
}

/// Parse a hex public key.
pub fn verifying_key_from_hex(hex_str: &str) -> Result<VerifyingKey, CryptoError> {
    let raw = hex::decode(hex_str.trim())
        .map_err(|e| CryptoError::InvalidKey(format!("hex: {}", e)))?;
    let arr: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("public key must be 32 bytes, got {}", raw.len())))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Derive verifying (public) key bytes from a 32-byte seed.
pub fn public_from_seed(seed: &[u8]) -> Option<Vec<u8>> {
    let arr = <&[u8; 32]>::try_from(seed).ok()?;
    Some(SigningKey::from_bytes(arr).verifying_key().to_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seed_and_keypair_hex() {
        let sk = signing_key_from_seed(&[3u8; 32]);
        let from_seed = signing_key_from_hex(&hex::encode(sk.to_bytes())).unwrap();
        let from_pair = signing_key_from_hex(&hex::encode(sk.to_keypair_bytes())).unwrap();
        assert_eq!(from_seed.to_bytes(), sk.to_bytes());
        assert_eq!(from_pair.to_bytes(), sk.to_bytes());
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(signing_key_from_hex("abcd").is_err());
        assert!(verifying_key_from_hex("abcd").is_err());
        assert!(public_from_seed(&[1u8; 31]).is_none());
    }
}
