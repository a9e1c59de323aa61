// src/network/messages.rs
// Wire format: one JSON envelope per length-delimited frame.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bft::{Proposal, Vote};
use crate::chain::{Block, Transaction};
use crate::crypto;
use crate::network::peer_auth::{ChallengeResponse, PeerIdentity};
use crate::network::NetworkError;

pub const PROTOCOL_VERSION: u8 = 1;

/// Every message a peer may send. Adding a variant forces every `match` on
/// this type to handle it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMessage {
    Hello(PeerIdentity),
    Challenge { challenge: String },
    ChallengeResponse(ChallengeResponse),
    PeerRequest,
    PeerList { peers: Vec<String> },
    NewBlock(Block),
    NewTransaction(Transaction),
    Proposal(Proposal),
    Vote(Vote),
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

impl WireMessage {
    /// Stable name, used in rate-limit keys and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Hello(_) => "hello",
            WireMessage::Challenge { .. } => "challenge",
            WireMessage::ChallengeResponse(_) => "challenge_response",
            WireMessage::PeerRequest => "peer_request",
            WireMessage::PeerList { .. } => "peer_list",
            WireMessage::NewBlock(_) => "new_block",
            WireMessage::NewTransaction(_) => "new_transaction",
            WireMessage::Proposal(_) => "proposal",
            WireMessage::Vote(_) => "vote",
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
        }
    }

    /// Flooded to every peer and deduplicated by message id.
    pub fn is_gossip(&self) -> bool {
        matches!(
            self,
            WireMessage::NewBlock(_)
                | WireMessage::NewTransaction(_)
                | WireMessage::Proposal(_)
                | WireMessage::Vote(_)
        )
    }

    /// deterministic message id for dedupe (sha256 hex of the serialized message)
    pub fn message_id(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(crypto::sha256(&bytes))
    }
}

/// Top-level Envelope message: versioned, typed payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,
    /// Node id of the sending peer; must match the authenticated identity.
    pub sender: String,
    pub message: WireMessage,
}

impl Envelope {
    pub fn new(sender: &str, message: WireMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sender: sender.to_string(),
            message,
        }
    }

    pub fn encode(&self) -> Result<Bytes, NetworkError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, NetworkError> {
        let env: Envelope = serde_json::from_slice(frame)?;
        if env.version != PROTOCOL_VERSION {
            return Err(NetworkError::VersionMismatch(env.version));
        }
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_json_shape() {
        let env = Envelope::new("node-a", WireMessage::Ping { nonce: 7 });
        let v: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(v["message"]["type"], "ping");
        assert_eq!(v["message"]["payload"]["nonce"], 7);
        assert_eq!(v["sender"], "node-a");

        let unit = serde_json::to_value(WireMessage::PeerRequest).unwrap();
        assert_eq!(unit["type"], "peer_request");
    }

    #[test]
    fn rejects_unknown_version_and_type() {
        let mut env = Envelope::new("n", WireMessage::PeerRequest);
        env.version = 9;
        let bytes = serde_json::to_vec(&env).unwrap();
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(NetworkError::VersionMismatch(9))
        ));

        let bogus = br#"{"version":1,"sender":"n","message":{"type":"launch_missiles"}}"#;
        assert!(Envelope::decode(bogus).is_err());
    }

    #[test]
    fn message_id_ignores_sender() {
        let m = WireMessage::PeerList {
            peers: vec!["127.0.0.1:1".into()],
        };
        let a = Envelope::new("a", m.clone());
        let b = Envelope::new("b", m);
        assert_eq!(a.message.message_id(), b.message.message_id());
        assert_ne!(
            WireMessage::Ping { nonce: 1 }.message_id(),
            WireMessage::Ping { nonce: 2 }.message_id()
        );
    }
}
