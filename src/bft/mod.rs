pub mod consensus;
pub mod leader_rotation;
pub mod messages;
pub mod qc;
pub mod state;
pub mod validator_registry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

// Re-export commonly used items
pub use consensus::{ConsensusEngine, ConsensusState, EngineConfig, EngineOutput, ScheduledTimeout};
pub use messages::{ConsensusMessage, Proposal, Vote, VoteKind};
pub use state::Equivocation;
pub use validator_registry::{GenesisValidatorProvider, ValidatorInfo, ValidatorSet, ValidatorSetProvider};

/// Step of a consensus round.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Propose,
    Prevote,
    Precommit,
    Commit,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Propose => "propose",
            Phase::Prevote => "prevote",
            Phase::Precommit => "precommit",
            Phase::Commit => "commit",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("message for height {got}, engine is at {expected}")]
    WrongHeight { expected: u64, got: u64 },

    #[error("{0} is not in the validator set")]
    UnknownValidator(String),

    #[error("round {round} proposer is {expected}, got {got}")]
    WrongProposer { round: u32, expected: String, got: String },

    #[error("bad signature from {0}")]
    BadSignature(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("duplicate vote from {0}")]
    DuplicateVote(String),

    #[error("equivocation by {validator} at round {round}")]
    Equivocation { validator: String, round: u32 },

    #[error("height {height} not finalized after {rounds} rounds")]
    MaxRoundsExceeded { height: u64, rounds: u32 },

    #[error("height {requested} already entered, engine is at {current}")]
    HeightRegression { current: u64, requested: u64 },

    #[error("consensus engine halted")]
    Halted,

    #[error("validator set is empty")]
    EmptyValidatorSet,

    #[error("validator set unavailable: {0}")]
    Provider(String),
}

impl ConsensusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsensusError::MaxRoundsExceeded { .. }
            | ConsensusError::Halted
            | ConsensusError::EmptyValidatorSet => ErrorKind::Fatal,
            ConsensusError::Provider(_) => ErrorKind::Resource,
            _ => ErrorKind::Protocol,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ConsensusError::WrongHeight { .. } => "stale_height",
            ConsensusError::UnknownValidator(_) => "unknown_validator",
            ConsensusError::WrongProposer { .. } => "wrong_proposer",
            ConsensusError::BadSignature(_) => "bad_signature",
            ConsensusError::InvalidBlock(_) => "invalid_block",
            ConsensusError::DuplicateVote(_) => "duplicate_vote",
            ConsensusError::Equivocation { .. } => "equivocation",
            ConsensusError::MaxRoundsExceeded { .. } => "max_rounds_exceeded",
            ConsensusError::HeightRegression { .. } => "height_regression",
            ConsensusError::Halted => "consensus_halted",
            ConsensusError::EmptyValidatorSet => "empty_validator_set",
            ConsensusError::Provider(_) => "validator_set_unavailable",
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}
