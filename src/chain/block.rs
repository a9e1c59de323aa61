// src/chain/block.rs
use serde::{Deserialize, Serialize};

use crate::chain::transaction::Transaction;
use crate::crypto::{self, merkle, MerkleProof, MerkleTree};

/// Precommit signature attached to a committed block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitSignature {
    pub validator: String,
    pub round: u32,
    pub signature: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    /// Unix millis, chosen by the proposer.
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    /// Merkle root over transaction hashes.
    pub tx_root: String,
    pub proposer: String,
    /// Filled in on commit; not covered by `hash`.
    #[serde(default)]
    pub signatures: Vec<CommitSignature>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BlockHeader<'a> {
    height: u64,
    parent_hash: &'a str,
    timestamp: i64,
    tx_root: &'a str,
    proposer: &'a str,
}

impl Block {
    pub fn new(
        height: u64,
        parent_hash: String,
        timestamp: i64,
        transactions: Vec<Transaction>,
        proposer: String,
    ) -> Self {
        let tx_root = tx_root(&transactions);
        let mut block = Block {
            height,
            hash: String::new(),
            parent_hash,
            timestamp,
            transactions,
            tx_root,
            proposer,
            signatures: Vec::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Height-0 block every node derives identically from the chain id.
    pub fn genesis(chain_id: &str) -> Self {
        Block::new(
            0,
            hex::encode(merkle::ZERO_HASH),
            0,
            Vec::new(),
            format!("genesis:{}", chain_id),
        )
    }

    pub fn compute_hash(&self) -> String {
        let header = BlockHeader {
            height: self.height,
            parent_hash: &self.parent_hash,
            timestamp: self.timestamp,
            tx_root: &self.tx_root,
            proposer: &self.proposer,
        };
        crypto::hash_canonical(&header).unwrap_or_default()
    }

    /// Header hash and tx root both match the body.
    pub fn is_well_formed(&self) -> bool {
        self.tx_root == tx_root(&self.transactions) && self.hash == self.compute_hash()
    }

    pub fn tx_hashes(&self) -> Vec<String> {
        self.transactions.iter().map(|t| t.hash.clone()).collect()
    }

    /// Inclusion proof for a transaction of this block.
    pub fn tx_proof(&self, tx_hash: &str) -> Option<MerkleProof> {
        let index = self.transactions.iter().position(|t| t.hash == tx_hash)?;
        let leaves: Vec<[u8; 32]> = self
            .transactions
            .iter()
            .map(|t| leaf_of(&t.hash))
            .collect();
        MerkleTree::from_hashes(&leaves).proof_for_index(index)
    }
}

fn leaf_of(hash_hex: &str) -> [u8; 32] {
    match hex::decode(hash_hex) {
        Ok(b) if b.len() == 32 => {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&b);
            arr
        }
        _ => crypto::sha256(hash_hex.as_bytes()),
    }
}

pub fn tx_root(transactions: &[Transaction]) -> String {
    let hashes: Vec<String> = transactions.iter().map(|t| t.hash.clone()).collect();
    merkle::merkle_root_hex(&hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::signing_key_from_seed;

    fn sample_txs(n: u64) -> Vec<Transaction> {
        let sk = signing_key_from_seed(&[4u8; 32]);
        let to = crypto::address_of(&signing_key_from_seed(&[5u8; 32]));
        (0..n).map(|i| Transaction::new_signed(&sk, &to, 1, i, 1)).collect()
    }

    #[test]
    fn genesis_is_deterministic() {
        assert_eq!(Block::genesis("test-1"), Block::genesis("test-1"));
        assert_ne!(Block::genesis("test-1").hash, Block::genesis("test-2").hash);
        assert_eq!(Block::genesis("x").height, 0);
    }

    #[test]
    fn signatures_do_not_change_hash() {
        let mut b = Block::new(1, "00".into(), 5, sample_txs(2), "v1".into());
        let h = b.hash.clone();
        b.signatures.push(CommitSignature {
            validator: "v1".into(),
            round: 0,
            signature: "ab".into(),
        });
        assert_eq!(b.compute_hash(), h);
        assert!(b.is_well_formed());
    }

    #[test]
    fn tampered_body_is_detected() {
        let mut b = Block::new(1, "00".into(), 5, sample_txs(3), "v1".into());
        b.transactions.pop();
        assert!(!b.is_well_formed());
    }

    #[test]
    fn tx_inclusion_proof() {
        let b = Block::new(1, "00".into(), 5, sample_txs(3), "v1".into());
        let proof = b.tx_proof(&b.transactions[2].hash).unwrap();
        assert!(proof.verify());
        assert_eq!(hex::encode(proof.root), b.tx_root);
        assert!(b.tx_proof("missing").is_none());
    }
}
