// src/bft/messages.rs
// Signed consensus messages. Signatures are hex ed25519 over a pipe-joined
// payload so that every node reproduces the exact bytes without a serializer.

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::chain::Block;
use crate::crypto::{self, CryptoError, NodeSigner};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VoteKind {
    Prevote,
    Precommit,
}

impl VoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteKind::Prevote => "prevote",
            VoteKind::Precommit => "precommit",
        }
    }
}

/// Bytes a validator signs when voting. `None` is a nil vote.
pub fn vote_payload(kind: VoteKind, height: u64, round: u32, block_hash: Option<&str>) -> Vec<u8> {
    format!(
        "{}|{}|{}|{}",
        kind.as_str(),
        height,
        round,
        block_hash.unwrap_or("nil")
    )
    .into_bytes()
}

fn proposal_payload(height: u64, round: u32, block_hash: &str, valid_round: Option<u32>) -> Vec<u8> {
    let vr = valid_round.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
    format!("proposal|{}|{}|{}|{}", height, round, block_hash, vr).into_bytes()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub block: Block,
    /// Round in which the proposer saw a polka for `block`, when re-proposing.
    pub valid_round: Option<u32>,
    pub proposer: String,
    pub signature: String,
}

impl Proposal {
    pub fn new_signed(
        sk: &SigningKey,
        height: u64,
        round: u32,
        block: Block,
        valid_round: Option<u32>,
    ) -> Self {
        let signature = crypto::sign_hex(sk, &proposal_payload(height, round, &block.hash, valid_round));
        Proposal {
            height,
            round,
            block,
            valid_round,
            proposer: crypto::address_of(sk),
            signature,
        }
    }

    /// Signs through a [`NodeSigner`], which may refuse (locked keystore).
    pub fn signed_by<S: NodeSigner + ?Sized>(
        signer: &S,
        height: u64,
        round: u32,
        block: Block,
        valid_round: Option<u32>,
    ) -> Result<Self, CryptoError> {
        let signature = signer.sign_hex(&proposal_payload(height, round, &block.hash, valid_round))?;
        Ok(Proposal {
            height,
            round,
            block,
            valid_round,
            proposer: signer.address(),
            signature,
        })
    }

    pub fn verify(&self, public_key_hex: &str) -> bool {
        let payload = proposal_payload(self.height, self.round, &self.block.hash, self.valid_round);
        crypto::verify_ed25519_hex(public_key_hex, &self.signature, &payload)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub kind: VoteKind,
    pub height: u64,
    pub round: u32,
    pub block_hash: Option<String>,
    pub validator: String,
    pub signature: String,
}

impl Vote {
    pub fn new_signed(
        sk: &SigningKey,
        kind: VoteKind,
        height: u64,
        round: u32,
        block_hash: Option<String>,
    ) -> Self {
        let signature = crypto::sign_hex(sk, &vote_payload(kind, height, round, block_hash.as_deref()));
        Vote {
            kind,
            height,
            round,
            block_hash,
            validator: crypto::address_of(sk),
            signature,
        }
    }

    pub fn signed_by<S: NodeSigner + ?Sized>(
        signer: &S,
        kind: VoteKind,
        height: u64,
        round: u32,
        block_hash: Option<String>,
    ) -> Result<Self, CryptoError> {
        let signature = signer.sign_hex(&vote_payload(kind, height, round, block_hash.as_deref()))?;
        Ok(Vote {
            kind,
            height,
            round,
            block_hash,
            validator: signer.address(),
            signature,
        })
    }

    pub fn verify(&self, public_key_hex: &str) -> bool {
        let payload = vote_payload(self.kind, self.height, self.round, self.block_hash.as_deref());
        crypto::verify_ed25519_hex(public_key_hex, &self.signature, &payload)
    }

    pub fn is_nil(&self) -> bool {
        self.block_hash.is_none()
    }
}

/// Everything the engine sends to or receives from other validators.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "body", rename_all = "camelCase")]
pub enum ConsensusMessage {
    Proposal(Proposal),
    Vote(Vote),
}

impl ConsensusMessage {
    pub fn height(&self) -> u64 {
        match self {
            ConsensusMessage::Proposal(p) => p.height,
            ConsensusMessage::Vote(v) => v.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::signing_key_from_seed;

    #[test]
    fn vote_signature_covers_every_field() {
        let sk = signing_key_from_seed(&[3u8; 32]);
        let pk = crypto::pubkey_hex(&sk);
        let vote = Vote::new_signed(&sk, VoteKind::Prevote, 4, 1, Some("ab".into()));
        assert!(vote.verify(&pk));

        let mut other = vote.clone();
        other.kind = VoteKind::Precommit;
        assert!(!other.verify(&pk));

        let mut other = vote.clone();
        other.block_hash = None;
        assert!(!other.verify(&pk));

        let mut other = vote;
        other.round = 2;
        assert!(!other.verify(&pk));
    }

    #[test]
    fn proposal_signature_binds_valid_round() {
        let sk = signing_key_from_seed(&[3u8; 32]);
        let pk = crypto::pubkey_hex(&sk);
        let block = Block::new(1, "00".into(), 1, Vec::new(), crypto::address_of(&sk));
        let mut p = Proposal::new_signed(&sk, 1, 2, block, Some(1));
        assert!(p.verify(&pk));
        p.valid_round = None;
        assert!(!p.verify(&pk));
    }
}
