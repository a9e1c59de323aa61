// src/bft/leader_rotation.rs
use crate::bft::validator_registry::{ValidatorInfo, ValidatorSet};

/// Round-robin index over the ordered validator set. Advancing the round
/// moves to the next validator, so a failed proposer is skipped on view change.
pub fn proposer_index(n: usize, height: u64, round: u32) -> usize {
    if n == 0 {
        return 0;
    }
    let slot = (height as u128 + round as u128) % n as u128;
    slot as usize
}

/// Deterministic proposer for `(height, round)`.
pub fn proposer_for(set: &ValidatorSet, height: u64, round: u32) -> Option<&ValidatorInfo> {
    set.get(proposer_index(set.len(), height, round))
}
