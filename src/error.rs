// src/error.rs
// Node-wide error taxonomy

use thiserror::Error;

use crate::bft::ConsensusError;
use crate::crypto::CryptoError;
use crate::keystore::KeystoreError;
use crate::mempool::MempoolError;
use crate::network::peer_auth::AuthError;
use crate::network::NetworkError;
use crate::storage::StoreError;

/// Coarse error category. Drives how a failure is surfaced: validation errors
/// are rejected at the boundary, protocol errors are absorbed by the state
/// machines, resource errors go back to the caller, fatal errors stop the
/// affected subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Protocol,
    Resource,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Resource => "resource",
            ErrorKind::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Mempool(#[from] MempoolError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("node is not running")]
    NotRunning,

    #[error("node stopped: {0}")]
    Halted(String),
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Crypto(e) => e.kind(),
            NodeError::Keystore(e) => e.kind(),
            NodeError::Store(e) => e.kind(),
            NodeError::Auth(_) => ErrorKind::Protocol,
            NodeError::Mempool(_) => ErrorKind::Validation,
            NodeError::Consensus(e) => e.kind(),
            NodeError::Network(_) => ErrorKind::Resource,
            NodeError::InvalidTransaction(_) => ErrorKind::Validation,
            NodeError::NotRunning => ErrorKind::Resource,
            NodeError::Halted(_) => ErrorKind::Fatal,
        }
    }

    /// Short machine-readable code, stable across releases.
    pub fn reason(&self) -> &'static str {
        match self {
            NodeError::Crypto(e) => e.reason(),
            NodeError::Keystore(e) => e.reason(),
            NodeError::Store(e) => e.reason(),
            NodeError::Auth(e) => e.reason(),
            NodeError::Mempool(e) => e.reason(),
            NodeError::Consensus(e) => e.reason(),
            NodeError::Network(_) => "network_error",
            NodeError::InvalidTransaction(_) => "invalid_transaction",
            NodeError::NotRunning => "not_running",
            NodeError::Halted(_) => "halted",
        }
    }
}

pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_source_error() {
        let e = NodeError::from(MempoolError::AccountCapReached {
            account: "0xabc".into(),
            cap: 4,
        });
        assert_eq!(e.kind(), ErrorKind::Validation);
        assert_eq!(e.reason(), "account_cap_reached");

        let e = NodeError::from(ConsensusError::MaxRoundsExceeded { height: 7, rounds: 10 });
        assert_eq!(e.kind(), ErrorKind::Fatal);

        let e = NodeError::from(KeystoreError::HardLocked);
        assert_eq!(e.kind(), ErrorKind::Resource);
        assert_eq!(e.reason(), "keystore_hard_locked");
    }
}
