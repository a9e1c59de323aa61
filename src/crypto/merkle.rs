// src/crypto/merkle.rs
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Root of an empty list.
pub const ZERO_HASH: [u8; 32] = [0u8; 32];

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Merkle root over an ordered list of 32-byte hashes.
///
/// Empty input yields `ZERO_HASH`, a single hash is returned unchanged, and an
/// odd-length layer pairs its last element with itself.
pub fn merkle_root(hashes: &[[u8; 32]]) -> [u8; 32] {
    MerkleTree::from_hashes(hashes).root()
}

/// Hex convenience wrapper used by block and state hashing.
/// Entries that are not 32-byte hex are hashed with sha256 first.
pub fn merkle_root_hex(hashes: &[String]) -> String {
    let leaves: Vec<[u8; 32]> = hashes
        .iter()
        .map(|h| match hex::decode(h) {
            Ok(b) if b.len() == 32 => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&b);
                arr
            }
            _ => super::sha256(h.as_bytes()),
        })
        .collect();
    hex::encode(merkle_root(&leaves))
}

/// Merkle proof for inclusion verification
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MerkleProof {
    /// Index of the leaf in the tree
    pub index: usize,

    pub leaf: [u8; 32],

    /// Sibling hashes from leaf to root. `true` means the running node is on
    /// the left and the sibling on the right.
    pub siblings: Vec<([u8; 32], bool)>,

    pub root: [u8; 32],
}

impl MerkleProof {
    pub fn verify(&self) -> bool {
        self.compute_root() == self.root
    }

    /// Root implied by the leaf and sibling path, ignoring `self.root`.
    pub fn compute_root(&self) -> [u8; 32] {
        let mut current = self.leaf;
        for (sibling, is_left) in &self.siblings {
            current = if *is_left {
                hash_pair(&current, sibling)
            } else {
                hash_pair(sibling, &current)
            };
        }
        current
    }
}

/// Layered tree kept in memory so proofs can be produced for any leaf.
pub struct MerkleTree {
    levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    pub fn from_hashes(hashes: &[[u8; 32]]) -> Self {
        if hashes.is_empty() {
            return MerkleTree { levels: Vec::new() };
        }
        let mut levels = vec![hashes.to_vec()];
        loop {
            let prev = &levels[levels.len() - 1];
            if prev.len() <= 1 {
                break;
            }
            let next: Vec<[u8; 32]> = prev
                .chunks(2)
                .map(|pair| {
                    let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
                    hash_pair(&pair[0], right)
                })
                .collect();
            levels.push(next);
        }
        MerkleTree { levels }
    }

    pub fn len(&self) -> usize {
        self.levels.first().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn root(&self) -> [u8; 32] {
        self.levels
            .last()
            .and_then(|top| top.first().copied())
            .unwrap_or(ZERO_HASH)
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root())
    }

    pub fn proof_for_index(&self, index: usize) -> Option<MerkleProof> {
        let leaf = *self.levels.first()?.get(index)?;
        let mut siblings = Vec::with_capacity(self.levels.len());
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let is_left = idx % 2 == 0;
            let sibling_idx = if is_left { idx + 1 } else { idx - 1 };
            // odd layer: the last node is paired with itself
            let sibling = level.get(sibling_idx).copied().unwrap_or(level[idx]);
            siblings.push((sibling, is_left));
            idx /= 2;
        }
        Some(MerkleProof {
            index,
            leaf,
            siblings,
            root: self.root(),
        })
    }
}
