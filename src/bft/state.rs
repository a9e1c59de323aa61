// src/bft/state.rs
// Per-height vote bookkeeping with equivocation detection.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::bft::messages::{Vote, VoteKind};
use crate::bft::qc;
use crate::bft::validator_registry::ValidatorSet;
use crate::chain::CommitSignature;

/// Equivocation evidence record
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Equivocation {
    pub validator: String,
    pub height: u64,
    pub round: u32,
    pub kind: VoteKind,
    pub existing: Option<String>,
    pub conflicting: Option<String>,
    pub observed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddVote {
    Added,
    /// Same validator, same value: already counted.
    Duplicate,
    Conflicting(Equivocation),
}

/// Maximum evidence entries kept per height.
const MAX_EVIDENCE: usize = 256;

#[derive(Debug, Default)]
pub struct VoteBook {
    // (round, kind) -> validator -> vote
    votes: HashMap<(u32, VoteKind), BTreeMap<String, Vote>>,
    evidence: Vec<Equivocation>,
}

impl VoteBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.votes.clear();
        self.evidence.clear();
    }

    /// Record `vote`, counting each validator at most once per round and kind.
    /// The first vote wins; a differing second one becomes evidence.
    pub fn add(&mut self, vote: Vote) -> AddVote {
        let slot = self.votes.entry((vote.round, vote.kind)).or_default();
        if let Some(existing) = slot.get(&vote.validator) {
            if existing.block_hash == vote.block_hash {
                return AddVote::Duplicate;
            }
            let ev = Equivocation {
                validator: vote.validator.clone(),
                height: vote.height,
                round: vote.round,
                kind: vote.kind,
                existing: existing.block_hash.clone(),
                conflicting: vote.block_hash.clone(),
                observed_at: Utc::now(),
            };
            if self.evidence.len() < MAX_EVIDENCE {
                self.evidence.push(ev.clone());
            }
            return AddVote::Conflicting(ev);
        }
        slot.insert(vote.validator.clone(), vote);
        AddVote::Added
    }

    fn slot(&self, round: u32, kind: VoteKind) -> Option<&BTreeMap<String, Vote>> {
        self.votes.get(&(round, kind))
    }

    pub fn count(&self, round: u32, kind: VoteKind) -> usize {
        self.slot(round, kind).map(|s| s.len()).unwrap_or(0)
    }

    /// Stake behind every vote of `kind` in `round`, whatever the value.
    pub fn total_stake(&self, round: u32, kind: VoteKind, set: &ValidatorSet) -> u64 {
        self.slot(round, kind)
            .map(|s| s.keys().map(|v| set.stake_of(v)).sum())
            .unwrap_or(0)
    }

    /// Stake of distinct validators seen voting anything in `round`.
    pub fn round_stake(&self, round: u32, set: &ValidatorSet) -> u64 {
        let mut voters: Vec<&String> = Vec::new();
        for kind in [VoteKind::Prevote, VoteKind::Precommit] {
            if let Some(s) = self.slot(round, kind) {
                voters.extend(s.keys());
            }
        }
        voters.sort();
        voters.dedup();
        voters.iter().map(|v| set.stake_of(v)).sum()
    }

    /// The value (`None` = nil) holding a quorum of `kind` votes in `round`.
    pub fn quorum_value(
        &self,
        round: u32,
        kind: VoteKind,
        set: &ValidatorSet,
        numerator: u64,
        denominator: u64,
    ) -> Option<Option<String>> {
        let slot = self.slot(round, kind)?;
        let mut by_value: HashMap<Option<&str>, u64> = HashMap::new();
        for (validator, vote) in slot {
            *by_value.entry(vote.block_hash.as_deref()).or_default() += set.stake_of(validator);
        }
        by_value
            .into_iter()
            .find(|(_, stake)| qc::has_quorum(*stake, set.total_stake(), numerator, denominator))
            .map(|(value, _)| value.map(str::to_string))
    }

    /// Precommit signatures for `block_hash` in `round`, ordered by validator.
    pub fn commit_signatures(&self, round: u32, block_hash: &str) -> Vec<CommitSignature> {
        self.slot(round, VoteKind::Precommit)
            .map(|s| {
                s.values()
                    .filter(|v| v.block_hash.as_deref() == Some(block_hash))
                    .map(|v| CommitSignature {
                        validator: v.validator.clone(),
                        round,
                        signature: v.signature.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn evidence(&self) -> &[Equivocation] {
        &self.evidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::validator_registry::ValidatorInfo;

    fn vote(validator: &str, kind: VoteKind, round: u32, hash: Option<&str>) -> Vote {
        Vote {
            kind,
            height: 1,
            round,
            block_hash: hash.map(str::to_string),
            validator: validator.to_string(),
            signature: format!("sig-{}", validator),
        }
    }

    fn set() -> ValidatorSet {
        ValidatorSet::new(
            [("a", 40), ("b", 30), ("c", 20), ("d", 10)]
                .iter()
                .map(|(a, s)| ValidatorInfo {
                    address: a.to_string(),
                    public_key: String::new(),
                    stake: *s,
                })
                .collect(),
        )
    }

    #[test]
    fn duplicate_votes_do_not_inflate_quorum() {
        let s = set();
        let mut book = VoteBook::new();
        assert_eq!(book.add(vote("a", VoteKind::Prevote, 0, Some("h"))), AddVote::Added);
        assert_eq!(book.add(vote("a", VoteKind::Prevote, 0, Some("h"))), AddVote::Duplicate);
        assert_eq!(book.add(vote("c", VoteKind::Prevote, 0, Some("h"))), AddVote::Added);
        // 60 of 100
        assert_eq!(book.quorum_value(0, VoteKind::Prevote, &s, 2, 3), None);
        book.add(vote("d", VoteKind::Prevote, 0, Some("h")));
        // 70 of 100
        assert_eq!(
            book.quorum_value(0, VoteKind::Prevote, &s, 2, 3),
            Some(Some("h".to_string()))
        );
    }

    #[test]
    fn conflicting_vote_is_evidence_and_not_counted() {
        let s = set();
        let mut book = VoteBook::new();
        book.add(vote("b", VoteKind::Precommit, 2, Some("x")));
        match book.add(vote("b", VoteKind::Precommit, 2, None)) {
            AddVote::Conflicting(ev) => {
                assert_eq!(ev.existing.as_deref(), Some("x"));
                assert_eq!(ev.conflicting, None);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(book.evidence().len(), 1);
        assert_eq!(book.total_stake(2, VoteKind::Precommit, &s), 30);
        // same validator may vote in a different round or phase
        assert_eq!(book.add(vote("b", VoteKind::Prevote, 2, None)), AddVote::Added);
        assert_eq!(book.add(vote("b", VoteKind::Precommit, 3, None)), AddVote::Added);
    }

    #[test]
    fn nil_quorum_and_commit_signatures() {
        let s = set();
        let mut book = VoteBook::new();
        for v in ["a", "b"] {
            book.add(vote(v, VoteKind::Precommit, 0, None));
        }
        assert_eq!(book.quorum_value(0, VoteKind::Precommit, &s, 2, 3), Some(None));

        for v in ["a", "b", "d"] {
            book.add(vote(v, VoteKind::Precommit, 1, Some("blk")));
        }
        book.add(vote("c", VoteKind::Precommit, 1, None));
        let sigs = book.commit_signatures(1, "blk");
        let who: Vec<&str> = sigs.iter().map(|s| s.validator.as_str()).collect();
        assert_eq!(who, vec!["a", "b", "d"]);
        assert_eq!(book.round_stake(1, &s), 100);
    }
}
