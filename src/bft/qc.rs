// src/bft/qc.rs
// Stake-weighted quorum arithmetic and commit certificate checks.
use std::collections::HashSet;

use crate::bft::messages::{vote_payload, VoteKind};
use crate::bft::validator_registry::ValidatorSet;
use crate::bft::ConsensusError;
use crate::chain::Block;
use crate::crypto;

/// `voted / total >= numerator / denominator`, in integers.
pub fn has_quorum(voted: u64, total: u64, numerator: u64, denominator: u64) -> bool {
    if total == 0 {
        return false;
    }
    voted as u128 * denominator as u128 >= total as u128 * numerator as u128
}

/// More than a third of stake: at least one honest validator is in the group.
pub fn exceeds_one_third(voted: u64, total: u64) -> bool {
    total > 0 && voted as u128 * 3 > total as u128
}

/// Check that a committed block carries valid precommits from a quorum of
/// `set`, all for this block at a single round.
pub fn verify_commit(
    block: &Block,
    set: &ValidatorSet,
    numerator: u64,
    denominator: u64,
) -> Result<(), ConsensusError> {
    let round = match block.signatures.first() {
        Some(s) => s.round,
        None => return Err(ConsensusError::InvalidBlock("block carries no commit signatures".into())),
    };

    let mut signers = HashSet::new();
    let mut stake = 0u64;
    for sig in &block.signatures {
        if sig.round != round {
            return Err(ConsensusError::InvalidBlock("commit signatures span rounds".into()));
        }
        let pk = set
            .public_key_of(&sig.validator)
            .ok_or_else(|| ConsensusError::UnknownValidator(sig.validator.clone()))?;
        let payload = vote_payload(VoteKind::Precommit, block.height, round, Some(&block.hash));
        if !crypto::verify_ed25519_hex(pk, &sig.signature, &payload) {
            return Err(ConsensusError::BadSignature(sig.validator.clone()));
        }
        if signers.insert(sig.validator.as_str()) {
            stake += set.stake_of(&sig.validator);
        }
    }

    if has_quorum(stake, set.total_stake(), numerator, denominator) {
        Ok(())
    } else {
        Err(ConsensusError::InvalidBlock(format!(
            "commit stake {} of {} is below quorum",
            stake,
            set.total_stake()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_thirds_boundary() {
        assert!(has_quorum(2, 3, 2, 3));
        assert!(!has_quorum(1, 3, 2, 3));
        assert!(has_quorum(67, 100, 2, 3));
        assert!(!has_quorum(66, 100, 2, 3));
        assert!(!has_quorum(0, 0, 2, 3));
        assert!(has_quorum(u64::MAX, u64::MAX, 2, 3));
    }

    #[test]
    fn one_third_is_strict() {
        assert!(!exceeds_one_third(1, 3));
        assert!(exceeds_one_third(2, 4));
        assert!(!exceeds_one_third(0, 0));
    }
}
