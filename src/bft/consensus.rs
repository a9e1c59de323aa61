// src/bft/consensus.rs
// Tendermint-style round state machine. The engine is synchronous and owns
// no timers or sockets: the node feeds it messages and expired timeouts and
// acts on the returned `EngineOutput`.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::bft::leader_rotation::proposer_for;
use crate::bft::messages::{ConsensusMessage, Proposal, Vote, VoteKind};
use crate::bft::state::{AddVote, Equivocation, VoteBook};
use crate::bft::validator_registry::ValidatorSet;
use crate::bft::{ConsensusError, Phase};
use crate::chain::Block;
use crate::config::ConsensusConfig;
use crate::crypto::NodeSigner;

/// Messages for the next height kept until this node catches up.
const MAX_FUTURE_MESSAGES: usize = 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub propose_timeout: Duration,
    pub prevote_timeout: Duration,
    pub precommit_timeout: Duration,
    /// Added per round so that timeouts eventually exceed network delay.
    pub timeout_delta: Duration,
    pub max_rounds_per_height: u32,
    pub quorum_numerator: u64,
    pub quorum_denominator: u64,
}

impl From<&ConsensusConfig> for EngineConfig {
    fn from(c: &ConsensusConfig) -> Self {
        Self {
            propose_timeout: Duration::from_millis(c.propose_timeout_ms),
            prevote_timeout: Duration::from_millis(c.prevote_timeout_ms),
            precommit_timeout: Duration::from_millis(c.precommit_timeout_ms),
            timeout_delta: Duration::from_millis(c.timeout_delta_ms),
            max_rounds_per_height: c.max_rounds_per_height,
            quorum_numerator: c.quorum_numerator,
            quorum_denominator: c.quorum_denominator,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&ConsensusConfig::default())
    }
}

/// Timer the caller must arm; when it fires, pass it back to `on_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTimeout {
    pub height: u64,
    pub round: u32,
    pub phase: Phase,
    pub after: Duration,
}

#[derive(Debug, Default)]
pub struct EngineOutput {
    /// Signed messages to broadcast.
    pub messages: Vec<ConsensusMessage>,
    /// Finalized block carrying its precommit signatures.
    pub committed: Option<Block>,
    /// This node proposes the current round and needs a candidate block.
    pub request_proposal: bool,
    pub timeouts: Vec<ScheduledTimeout>,
    pub rounds_started: u32,
    pub view_changes: u32,
}

impl EngineOutput {
    fn merge(&mut self, other: EngineOutput) {
        self.messages.extend(other.messages);
        if other.committed.is_some() {
            self.committed = other.committed;
        }
        self.request_proposal |= other.request_proposal;
        self.timeouts.extend(other.timeouts);
        self.rounds_started += other.rounds_started;
        self.view_changes += other.view_changes;
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoteTally {
    pub votes: usize,
    pub stake: u64,
}

/// Read-only snapshot for status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusState {
    pub height: u64,
    pub round: u32,
    pub phase: Phase,
    pub proposer: Option<String>,
    pub proposal: Option<String>,
    pub locked_round: Option<u32>,
    pub prevotes: VoteTally,
    pub precommits: VoteTally,
    pub validators: usize,
    pub total_stake: u64,
    pub evidence: usize,
    pub halted: bool,
}

pub struct ConsensusEngine {
    config: EngineConfig,
    signer: Box<dyn NodeSigner>,
    address: String,
    validators: ValidatorSet,

    height: u64,
    parent_hash: String,
    round: u32,
    phase: Phase,

    proposals: HashMap<u32, Proposal>,
    // every block seen as a proposal at this height, by hash
    blocks: HashMap<String, Block>,
    votes: VoteBook,
    locked: Option<(u32, Block)>,
    valid: Option<(u32, Block)>,
    sent_prevote: bool,
    sent_precommit: bool,

    future: Vec<ConsensusMessage>,
    halted: bool,
}

impl ConsensusEngine {
    /// Idle until `start_height`.
    pub fn new<S: NodeSigner + 'static>(config: EngineConfig, signer: S) -> Self {
        let address = signer.address();
        Self {
            config,
            signer: Box::new(signer),
            address,
            validators: ValidatorSet::default(),
            height: 0,
            parent_hash: String::new(),
            round: 0,
            phase: Phase::Commit,
            proposals: HashMap::new(),
            blocks: HashMap::new(),
            votes: VoteBook::new(),
            locked: None,
            valid: None,
            sent_prevote: false,
            sent_precommit: false,
            future: Vec::new(),
            halted: false,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn is_validator(&self) -> bool {
        self.validators.contains(&self.address)
    }

    pub fn evidence(&self) -> &[Equivocation] {
        self.votes.evidence()
    }

    pub fn quorum(&self) -> (u64, u64) {
        (self.config.quorum_numerator, self.config.quorum_denominator)
    }

    pub fn proposer(&self, round: u32) -> Option<&str> {
        proposer_for(&self.validators, self.height, round).map(|v| v.address.as_str())
    }

    fn is_proposer(&self, round: u32) -> bool {
        self.proposer(round) == Some(self.address.as_str())
    }

    pub fn state(&self) -> ConsensusState {
        let tally = |kind| VoteTally {
            votes: self.votes.count(self.round, kind),
            stake: self.votes.total_stake(self.round, kind, &self.validators),
        };
        ConsensusState {
            height: self.height,
            round: self.round,
            phase: self.phase,
            proposer: self.proposer(self.round).map(str::to_string),
            proposal: self.proposals.get(&self.round).map(|p| p.block.hash.clone()),
            locked_round: self.locked.as_ref().map(|(r, _)| *r),
            prevotes: tally(VoteKind::Prevote),
            precommits: tally(VoteKind::Precommit),
            validators: self.validators.len(),
            total_stake: self.validators.total_stake(),
            evidence: self.votes.evidence().len(),
            halted: self.halted,
        }
    }

    fn check_live(&self) -> Result<(), ConsensusError> {
        if self.halted {
            Err(ConsensusError::Halted)
        } else {
            Ok(())
        }
    }

    /// Begin agreement on `height` on top of `parent_hash`. Buffered messages
    /// for this height are replayed. Heights only move forward: a height the
    /// engine already entered is refused, since its votes may be out.
    pub fn start_height(
        &mut self,
        height: u64,
        parent_hash: String,
        validators: ValidatorSet,
    ) -> Result<EngineOutput, ConsensusError> {
        self.check_live()?;
        if self.height > 0 && height <= self.height {
            return Err(ConsensusError::HeightRegression {
                current: self.height,
                requested: height,
            });
        }
        if validators.is_empty() {
            return Err(ConsensusError::EmptyValidatorSet);
        }
        self.validators = validators;
        self.height = height;
        self.parent_hash = parent_hash;
        self.round = 0;
        self.proposals.clear();
        self.blocks.clear();
        self.votes.clear();
        self.locked = None;
        self.valid = None;

        let mut out = EngineOutput::default();
        self.enter_round(0, &mut out)?;

        let buffered = std::mem::take(&mut self.future);
        for msg in buffered {
            let h = msg.height();
            if h > height {
                self.future.push(msg);
                continue;
            }
            if h < height {
                continue;
            }
            let result = match msg {
                ConsensusMessage::Proposal(p) => self.on_proposal(p),
                ConsensusMessage::Vote(v) => self.on_vote(v),
            };
            match result {
                Ok(o) => out.merge(o),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("buffered message dropped: {}", e),
            }
        }
        Ok(out)
    }

    fn timeout(&self, phase: Phase) -> ScheduledTimeout {
        let base = match phase {
            Phase::Propose => self.config.propose_timeout,
            Phase::Prevote => self.config.prevote_timeout,
            Phase::Precommit | Phase::Commit => self.config.precommit_timeout,
        };
        ScheduledTimeout {
            height: self.height,
            round: self.round,
            phase,
            after: base + self.config.timeout_delta * self.round,
        }
    }

    fn enter_round(&mut self, round: u32, out: &mut EngineOutput) -> Result<(), ConsensusError> {
        if round >= self.config.max_rounds_per_height {
            self.halted = true;
            return Err(ConsensusError::MaxRoundsExceeded {
                height: self.height,
                rounds: round,
            });
        }
        if round > 0 {
            out.view_changes += 1;
            info!(
                "view change at height {}: round {} -> {}, proposer {}",
                self.height,
                self.round,
                round,
                self.proposer(round).unwrap_or("-")
            );
        }
        out.rounds_started += 1;
        self.round = round;
        self.phase = Phase::Propose;
        self.sent_prevote = false;
        self.sent_precommit = false;
        out.timeouts.push(self.timeout(Phase::Propose));

        if self.is_proposer(round) && !self.proposals.contains_key(&round) {
            match self.valid.clone() {
                Some((vr, block)) => self.propose(block, Some(vr), out),
                None => out.request_proposal = true,
            }
        }
        self.advance(out)
    }

    fn propose(&mut self, block: Block, valid_round: Option<u32>, out: &mut EngineOutput) {
        debug!(
            "proposing block {} at height {} round {}",
            block.hash, self.height, self.round
        );
        let proposal = match Proposal::signed_by(&*self.signer, self.height, self.round, block, valid_round) {
            Ok(p) => p,
            Err(e) => {
                warn!("not proposing at height {} round {}: {}", self.height, self.round, e);
                return;
            }
        };
        self.blocks.insert(proposal.block.hash.clone(), proposal.block.clone());
        self.proposals.insert(self.round, proposal.clone());
        out.messages.push(ConsensusMessage::Proposal(proposal));
    }

    /// Supply the candidate block after `request_proposal`. Stale supplies
    /// (the round moved on, or a proposal already exists) are ignored.
    pub fn set_proposal_block(&mut self, block: Block) -> Result<EngineOutput, ConsensusError> {
        self.check_live()?;
        let mut out = EngineOutput::default();
        if self.phase != Phase::Propose
            || !self.is_proposer(self.round)
            || self.proposals.contains_key(&self.round)
        {
            debug!("ignoring stale proposal block at height {}", self.height);
            return Ok(out);
        }
        self.check_block(&block, &self.address)?;
        self.propose(block, None, &mut out);
        self.advance(&mut out)?;
        Ok(out)
    }

    fn check_block(&self, block: &Block, proposer: &str) -> Result<(), ConsensusError> {
        if block.height != self.height {
            return Err(ConsensusError::InvalidBlock(format!(
                "block height {} at consensus height {}",
                block.height, self.height
            )));
        }
        if block.parent_hash != self.parent_hash {
            return Err(ConsensusError::InvalidBlock("parent hash does not extend the chain".into()));
        }
        if block.proposer != proposer {
            return Err(ConsensusError::InvalidBlock("block proposer differs from signer".into()));
        }
        if !block.is_well_formed() {
            return Err(ConsensusError::InvalidBlock("hash or tx root mismatch".into()));
        }
        for tx in &block.transactions {
            tx.validate()
                .map_err(|e| ConsensusError::InvalidBlock(format!("tx {}: {}", tx.hash, e)))?;
        }
        Ok(())
    }

    /// Returns true when the message was buffered for the next height.
    fn route_height(&mut self, height: u64, msg: impl FnOnce() -> ConsensusMessage) -> Result<bool, ConsensusError> {
        if height == self.height {
            return Ok(false);
        }
        if height == self.height + 1 && self.future.len() < MAX_FUTURE_MESSAGES {
            self.future.push(msg());
            return Ok(true);
        }
        Err(ConsensusError::WrongHeight {
            expected: self.height,
            got: height,
        })
    }

    pub fn on_proposal(&mut self, proposal: Proposal) -> Result<EngineOutput, ConsensusError> {
        self.check_live()?;
        let mut out = EngineOutput::default();
        if self.route_height(proposal.height, || ConsensusMessage::Proposal(proposal.clone()))? {
            return Ok(out);
        }

        let expected = self.proposer(proposal.round).unwrap_or_default().to_string();
        if proposal.proposer != expected {
            return Err(ConsensusError::WrongProposer {
                round: proposal.round,
                expected,
                got: proposal.proposer,
            });
        }
        let pk = self
            .validators
            .public_key_of(&proposal.proposer)
            .ok_or_else(|| ConsensusError::UnknownValidator(proposal.proposer.clone()))?;
        if !proposal.verify(pk) {
            return Err(ConsensusError::BadSignature(proposal.proposer));
        }
        if let Some(existing) = self.proposals.get(&proposal.round) {
            if existing.block.hash == proposal.block.hash {
                return Ok(out);
            }
            warn!(
                "conflicting proposals from {} at height {} round {}",
                proposal.proposer, proposal.height, proposal.round
            );
            return Err(ConsensusError::Equivocation {
                validator: proposal.proposer,
                round: proposal.round,
            });
        }
        self.check_block(&proposal.block, &proposal.proposer)?;

        let round = proposal.round;
        self.blocks.insert(proposal.block.hash.clone(), proposal.block.clone());
        self.proposals.insert(round, proposal);

        if self.phase == Phase::Commit {
            return Ok(out);
        }
        if round == self.round {
            self.advance(&mut out)?;
        }
        // a precommit quorum from an earlier round may have been waiting on this block
        for r in 0..=self.round {
            if self.phase == Phase::Commit {
                break;
            }
            self.try_commit(r, &mut out);
        }
        Ok(out)
    }

    pub fn on_vote(&mut self, vote: Vote) -> Result<EngineOutput, ConsensusError> {
        self.check_live()?;
        let mut out = EngineOutput::default();
        if self.route_height(vote.height, || ConsensusMessage::Vote(vote.clone()))? {
            return Ok(out);
        }

        let pk = self
            .validators
            .public_key_of(&vote.validator)
            .ok_or_else(|| ConsensusError::UnknownValidator(vote.validator.clone()))?;
        if !vote.verify(pk) {
            return Err(ConsensusError::BadSignature(vote.validator));
        }

        let (round, kind) = (vote.round, vote.kind);
        match self.votes.add(vote.clone()) {
            AddVote::Added => {}
            AddVote::Duplicate => return Err(ConsensusError::DuplicateVote(vote.validator)),
            AddVote::Conflicting(ev) => {
                warn!(
                    "equivocation: {} sent {:?} and {:?} for {} at height {} round {}",
                    ev.validator,
                    ev.existing,
                    ev.conflicting,
                    ev.kind.as_str(),
                    ev.height,
                    ev.round
                );
                return Err(ConsensusError::Equivocation {
                    validator: ev.validator,
                    round: ev.round,
                });
            }
        }

        if self.phase == Phase::Commit {
            return Ok(out);
        }

        if kind == VoteKind::Precommit {
            self.try_commit(round, &mut out);
            if self.phase == Phase::Commit {
                return Ok(out);
            }
        }

        // More than a third of stake already in a later round: skip ahead.
        if round > self.round {
            let stake = self.votes.round_stake(round, &self.validators);
            if crate::bft::qc::exceeds_one_third(stake, self.validators.total_stake()) {
                self.enter_round(round, &mut out)?;
                return Ok(out);
            }
        }

        if round == self.round {
            self.advance(&mut out)?;
        }
        Ok(out)
    }

    /// Any phase timeout that is still current abandons the round.
    pub fn on_timeout(
        &mut self,
        height: u64,
        round: u32,
        phase: Phase,
    ) -> Result<EngineOutput, ConsensusError> {
        self.check_live()?;
        let mut out = EngineOutput::default();
        if height != self.height || round != self.round || phase != self.phase || phase == Phase::Commit {
            return Ok(out);
        }
        debug!(
            "{} timeout at height {} round {}",
            phase.as_str(),
            height,
            round
        );
        self.enter_round(round + 1, &mut out)?;
        Ok(out)
    }

    fn advance(&mut self, out: &mut EngineOutput) -> Result<(), ConsensusError> {
        if self.phase == Phase::Commit {
            return Ok(());
        }
        let r = self.round;
        let (num, den) = self.quorum();

        if self.phase == Phase::Propose {
            if let Some(proposal) = self.proposals.get(&r) {
                let choice = self.prevote_choice(proposal);
                self.cast(VoteKind::Prevote, choice, out);
                self.phase = Phase::Prevote;
                out.timeouts.push(self.timeout(Phase::Prevote));
            }
        }

        if self.phase == Phase::Prevote && !self.sent_precommit {
            match self.votes.quorum_value(r, VoteKind::Prevote, &self.validators, num, den) {
                Some(Some(hash)) => {
                    if let Some(block) = self.blocks.get(&hash).cloned() {
                        debug!("polka for {} at height {} round {}", hash, self.height, r);
                        self.locked = Some((r, block.clone()));
                        self.valid = Some((r, block));
                        self.cast(VoteKind::Precommit, Some(hash), out);
                        self.phase = Phase::Precommit;
                        out.timeouts.push(self.timeout(Phase::Precommit));
                    }
                }
                Some(None) => {
                    self.cast(VoteKind::Precommit, None, out);
                    self.phase = Phase::Precommit;
                    out.timeouts.push(self.timeout(Phase::Precommit));
                }
                None => {}
            }
        }

        self.try_commit(r, out);
        if self.phase == Phase::Commit {
            return Ok(());
        }

        if self.votes.quorum_value(r, VoteKind::Precommit, &self.validators, num, den) == Some(None) {
            return self.enter_round(r + 1, out);
        }
        Ok(())
    }

    fn prevote_choice(&self, proposal: &Proposal) -> Option<String> {
        let hash = &proposal.block.hash;
        match &self.locked {
            None => Some(hash.clone()),
            Some((_, locked)) if &locked.hash == hash => Some(hash.clone()),
            Some((locked_round, _)) => {
                let (num, den) = self.quorum();
                // unlock only on a newer polka for the re-proposed block
                match proposal.valid_round {
                    Some(vr)
                        if vr >= *locked_round
                            && vr < proposal.round
                            && self.votes.quorum_value(vr, VoteKind::Prevote, &self.validators, num, den)
                                == Some(Some(hash.clone())) =>
                    {
                        Some(hash.clone())
                    }
                    _ => None,
                }
            }
        }
    }

    fn cast(&mut self, kind: VoteKind, block_hash: Option<String>, out: &mut EngineOutput) {
        let sent = match kind {
            VoteKind::Prevote => &mut self.sent_prevote,
            VoteKind::Precommit => &mut self.sent_precommit,
        };
        if *sent {
            return;
        }
        *sent = true;
        if !self.validators.contains(&self.address) {
            return;
        }
        let vote = match Vote::signed_by(&*self.signer, kind, self.height, self.round, block_hash) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "abstaining from {} at height {} round {}: {}",
                    kind.as_str(),
                    self.height,
                    self.round,
                    e
                );
                return;
            }
        };
        self.votes.add(vote.clone());
        out.messages.push(ConsensusMessage::Vote(vote));
    }

    fn try_commit(&mut self, round: u32, out: &mut EngineOutput) {
        if self.phase == Phase::Commit {
            return;
        }
        let (num, den) = self.quorum();
        let hash = match self.votes.quorum_value(round, VoteKind::Precommit, &self.validators, num, den) {
            Some(Some(hash)) => hash,
            _ => return,
        };
        match self.blocks.get(&hash) {
            Some(block) => {
                let mut block = block.clone();
                block.signatures = self.votes.commit_signatures(round, &hash);
                info!(
                    "committed block {} at height {} round {} with {} signatures",
                    hash,
                    self.height,
                    round,
                    block.signatures.len()
                );
                self.phase = Phase::Commit;
                out.committed = Some(block);
            }
            None => warn!(
                "precommit quorum for unknown block {} at height {} round {}",
                hash, self.height, round
            ),
        }
    }
}
