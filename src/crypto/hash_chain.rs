// src/crypto/hash_chain.rs
// Hash-chain one-time signatures. Security rests on sha256 preimage
// resistance only, so the scheme survives a quantum adversary.
//
// Chain: c_0 = H(seed), c_{k+1} = H(c_k), public anchor = c_N.
// Signature i reveals c_{N-1-i}; anyone can hash it i+1 times back to the
// anchor. Revealing position i exposes every earlier position, so positions
// are consumed strictly in increasing order and never reused.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{sha256, CryptoError};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OneTimeSignature {
    pub index: usize,
    /// Revealed chain element (hex).
    pub secret: String,
    /// sha256(secret || message) (hex).
    pub tag: String,
}

pub struct HashChainSigner {
    chain: Zeroizing<Vec<[u8; 32]>>,
    anchor: [u8; 32],
    next_index: usize,
}

impl HashChainSigner {
    /// Build a chain of `capacity` signing positions from `seed`.
    pub fn from_seed(seed: &[u8], capacity: usize) -> Self {
        Self::resume(seed, capacity, 0)
    }

    /// Rebuild a signer that already consumed `next_index` positions.
    pub fn resume(seed: &[u8], capacity: usize, next_index: usize) -> Self {
        let mut chain = Zeroizing::new(Vec::with_capacity(capacity));
        let mut cur = sha256(seed);
        for _ in 0..capacity {
            chain.push(cur);
            cur = sha256(&cur);
        }
        HashChainSigner {
            chain,
            anchor: cur,
            next_index,
        }
    }

    pub fn anchor(&self) -> [u8; 32] {
        self.anchor
    }

    pub fn anchor_hex(&self) -> String {
        hex::encode(self.anchor)
    }

    pub fn capacity(&self) -> usize {
        self.chain.len()
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.next_index)
    }

    /// Sign with the next unused position. Exhaustion is fatal: the caller has
    /// to rotate to a fresh seed.
    pub fn sign(&mut self, msg: &[u8]) -> Result<OneTimeSignature, CryptoError> {
        let capacity = self.capacity();
        let index = self.next_index;
        if index >= capacity {
            return Err(CryptoError::ChainExhausted { index, capacity });
        }
        let secret = self.chain[capacity - 1 - index];
        self.next_index += 1;

        let mut tagged = Vec::with_capacity(32 + msg.len());
        tagged.extend_from_slice(&secret);
        tagged.extend_from_slice(msg);
        Ok(OneTimeSignature {
            index,
            secret: hex::encode(secret),
            tag: hex::encode(sha256(&tagged)),
        })
    }
}

/// Stateless check: the revealed secret hashes back to `anchor` in
/// `index + 1` steps and the tag binds it to `msg`.
pub fn verify_one_time(anchor: &[u8; 32], capacity: usize, msg: &[u8], sig: &OneTimeSignature) -> bool {
    if sig.index >= capacity {
        return false;
    }
    let secret: [u8; 32] = match hex::decode(&sig.secret).ok().and_then(|b| b.try_into().ok()) {
        Some(s) => s,
        None => return false,
    };
    let mut tagged = Vec::with_capacity(32 + msg.len());
    tagged.extend_from_slice(&secret);
    tagged.extend_from_slice(msg);
    if hex::encode(sha256(&tagged)) != sig.tag {
        return false;
    }
    let mut cur = secret;
    for _ in 0..=sig.index {
        cur = sha256(&cur);
    }
    &cur == anchor
}

/// Stateful verifier that refuses any position at or below one it already
/// accepted, since those secrets are public.
pub struct OneTimeVerifier {
    anchor: [u8; 32],
    capacity: usize,
    lowest_unused: usize,
}

impl OneTimeVerifier {
    pub fn new(anchor: [u8; 32], capacity: usize) -> Self {
        Self {
            anchor,
            capacity,
            lowest_unused: 0,
        }
    }

    pub fn verify(&mut self, msg: &[u8], sig: &OneTimeSignature) -> bool {
        if sig.index < self.lowest_unused {
            return false;
        }
        if !verify_one_time(&self.anchor, self.capacity, msg, sig) {
            return false;
        }
        self.lowest_unused = sig.index + 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_in_order() {
        let mut signer = HashChainSigner::from_seed(b"seed", 4);
        let anchor = signer.anchor();
        let mut verifier = OneTimeVerifier::new(anchor, 4);
        for i in 0..4 {
            let msg = format!("msg-{}", i);
            let sig = signer.sign(msg.as_bytes()).unwrap();
            assert_eq!(sig.index, i);
            assert!(verify_one_time(&anchor, 4, msg.as_bytes(), &sig));
            assert!(verifier.verify(msg.as_bytes(), &sig));
        }
        assert_eq!(signer.remaining(), 0);
    }

    #[test]
    fn exhaustion_is_fatal() {
        let mut signer = HashChainSigner::from_seed(b"seed", 1);
        signer.sign(b"a").unwrap();
        match signer.sign(b"b") {
            Err(CryptoError::ChainExhausted { index, capacity }) => {
                assert_eq!(index, 1);
                assert_eq!(capacity, 1);
            }
            other => panic!("expected exhaustion, got {:?}", other.map(|s| s.index)),
        }
    }

    #[test]
    fn reused_index_rejected_by_verifier() {
        let mut signer = HashChainSigner::from_seed(b"seed", 3);
        let mut verifier = OneTimeVerifier::new(signer.anchor(), 3);
        let sig = signer.sign(b"first").unwrap();
        assert!(verifier.verify(b"first", &sig));
        assert!(!verifier.verify(b"first", &sig));
    }

    #[test]
    fn wrong_message_or_anchor_fails() {
        let mut signer = HashChainSigner::from_seed(b"seed", 3);
        let sig = signer.sign(b"hello").unwrap();
        assert!(!verify_one_time(&signer.anchor(), 3, b"other", &sig));
        let other = HashChainSigner::from_seed(b"other-seed", 3);
        assert!(!verify_one_time(&other.anchor(), 3, b"hello", &sig));
    }

    #[test]
    fn resume_continues_where_it_stopped() {
        let mut a = HashChainSigner::from_seed(b"s", 5);
        a.sign(b"x").unwrap();
        a.sign(b"y").unwrap();
        let mut b = HashChainSigner::resume(b"s", 5, a.next_index());
        let sig = b.sign(b"z").unwrap();
        assert_eq!(sig.index, 2);
        assert!(verify_one_time(&a.anchor(), 5, b"z", &sig));
    }
}
