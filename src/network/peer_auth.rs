// src/network/peer_auth.rs
// Peer identity attestation and challenge-response.
//
// Attestation: the peer signs canonical JSON of its identity tuple (everything
// but the signature). Challenge-response: we hand out 32 random bytes; the
// peer answers with sha256(node_id || challenge) signed with a fresh
// timestamp before the challenge expires.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::NetworkConfig;
use crate::crypto::{self, hashing::canonical_bytes, CryptoError, NodeSigner};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("chain id mismatch: expected {expected}, got {got}")]
    ChainMismatch { expected: String, got: String },

    #[error("network id mismatch: expected {expected}, got {got}")]
    NetworkMismatch { expected: String, got: String },

    #[error("timestamp drift {drift_secs}s outside allowed window")]
    ClockDrift { drift_secs: i64 },

    #[error("nonce already used by {node_id}")]
    NonceReplay { node_id: String },

    #[error("signature verification failed")]
    BadSignature,

    #[error("address {claimed} does not derive from public key ({derived})")]
    AddressMismatch { claimed: String, derived: String },

    #[error("malformed public key")]
    MalformedKey,

    #[error("no outstanding challenge for {0}")]
    ChallengeUnknown(String),

    #[error("challenge expired")]
    ChallengeExpired,

    #[error("challenge response does not match issued challenge")]
    ChallengeMismatch,

    #[error("response from {got}, expected {expected}")]
    PeerMismatch { expected: String, got: String },
}

impl AuthError {
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::ChainMismatch { .. } => "chain_mismatch",
            AuthError::NetworkMismatch { .. } => "network_mismatch",
            AuthError::ClockDrift { .. } => "clock_drift",
            AuthError::NonceReplay { .. } => "nonce_replay",
            AuthError::BadSignature => "bad_signature",
            AuthError::AddressMismatch { .. } => "address_mismatch",
            AuthError::MalformedKey => "malformed_key",
            AuthError::ChallengeUnknown(_) => "challenge_unknown",
            AuthError::ChallengeExpired => "challenge_expired",
            AuthError::ChallengeMismatch => "challenge_mismatch",
            AuthError::PeerMismatch { .. } => "peer_mismatch",
        }
    }
}

/// Signed identity a peer presents on connect.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub node_id: String,
    pub public_key: String,
    pub address: String,
    pub chain_id: String,
    pub network_id: String,
    pub timestamp: i64,
    pub nonce: String,
    /// Where this peer accepts connections, shared through gossip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,
    pub signature: String,
}

/// Signed bytes: canonical JSON of the struct without `signature`.
fn signing_payload<T: Serialize>(value: &T) -> Vec<u8> {
    let mut v = serde_json::to_value(value).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut v {
        map.remove("signature");
    }
    canonical_bytes(&v).unwrap_or_default()
}

fn random_hex(len: usize) -> String {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl PeerIdentity {
    pub fn attest<S: NodeSigner + ?Sized>(
        signer: &S,
        node_id: &str,
        chain_id: &str,
        network_id: &str,
        listen_addr: Option<String>,
    ) -> Result<Self, CryptoError> {
        Self::attest_at(signer, node_id, chain_id, network_id, listen_addr, now_secs())
    }

    pub fn attest_at<S: NodeSigner + ?Sized>(
        signer: &S,
        node_id: &str,
        chain_id: &str,
        network_id: &str,
        listen_addr: Option<String>,
        timestamp: i64,
    ) -> Result<Self, CryptoError> {
        let mut id = Self {
            node_id: node_id.to_string(),
            public_key: signer.public_key_hex(),
            address: signer.address(),
            chain_id: chain_id.to_string(),
            network_id: network_id.to_string(),
            timestamp,
            nonce: random_hex(16),
            listen_addr,
            signature: String::new(),
        };
        id.signature = signer.sign_hex(&signing_payload(&id))?;
        Ok(id)
    }
}

/// Answer to a challenge.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub node_id: String,
    pub challenge: String,
    pub response_hash: String,
    pub timestamp: i64,
    pub signature: String,
}

fn response_hash(node_id: &str, challenge: &str) -> String {
    let mut buf = Vec::with_capacity(node_id.len() + challenge.len());
    buf.extend_from_slice(node_id.as_bytes());
    buf.extend_from_slice(challenge.as_bytes());
    hex::encode(crypto::sha256(&buf))
}

impl ChallengeResponse {
    pub fn answer<S: NodeSigner + ?Sized>(
        signer: &S,
        node_id: &str,
        challenge: &str,
    ) -> Result<Self, CryptoError> {
        Self::answer_at(signer, node_id, challenge, now_secs())
    }

    pub fn answer_at<S: NodeSigner + ?Sized>(
        signer: &S,
        node_id: &str,
        challenge: &str,
        timestamp: i64,
    ) -> Result<Self, CryptoError> {
        let mut resp = Self {
            node_id: node_id.to_string(),
            challenge: challenge.to_string(),
            response_hash: response_hash(node_id, challenge),
            timestamp,
            signature: String::new(),
        };
        resp.signature = signer.sign_hex(&signing_payload(&resp))?;
        Ok(resp)
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub chain_id: String,
    pub network_id: String,
    pub max_clock_drift_secs: i64,
    pub nonce_window_secs: i64,
    pub challenge_expiry_secs: i64,
}

impl From<&NetworkConfig> for AuthConfig {
    fn from(c: &NetworkConfig) -> Self {
        Self {
            chain_id: c.chain_id.clone(),
            network_id: c.network_id.clone(),
            max_clock_drift_secs: c.max_clock_drift_secs,
            nonce_window_secs: c.nonce_window_secs as i64,
            challenge_expiry_secs: c.challenge_expiry_secs as i64,
        }
    }
}

/// Who a challenge was issued to. Keyed by the challenge itself, so several
/// connections claiming one node id each keep their own.
struct PendingChallenge {
    node_id: String,
    public_key: String,
    expires_at: i64,
}

/// Shared across connection tasks. All state is time-bounded.
pub struct PeerAuthenticator {
    config: AuthConfig,
    // (node_id, nonce) -> expiry
    seen_nonces: DashMap<(String, String), i64>,
    // challenge -> issued to
    challenges: DashMap<String, PendingChallenge>,
}

impl PeerAuthenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            seen_nonces: DashMap::new(),
            challenges: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn verify_identity(&self, id: &PeerIdentity) -> Result<(), AuthError> {
        self.verify_identity_at(id, now_secs())
    }

    /// Checks run cheapest first; the nonce is only recorded once everything
    /// else passed, so forged attestations cannot burn a peer's nonces.
    pub fn verify_identity_at(&self, id: &PeerIdentity, now: i64) -> Result<(), AuthError> {
        if id.chain_id != self.config.chain_id {
            return Err(AuthError::ChainMismatch {
                expected: self.config.chain_id.clone(),
                got: id.chain_id.clone(),
            });
        }
        if id.network_id != self.config.network_id {
            return Err(AuthError::NetworkMismatch {
                expected: self.config.network_id.clone(),
                got: id.network_id.clone(),
            });
        }
        let drift = now - id.timestamp;
        if drift.abs() > self.config.max_clock_drift_secs {
            return Err(AuthError::ClockDrift { drift_secs: drift });
        }
        let pubkey = hex::decode(&id.public_key).map_err(|_| AuthError::MalformedKey)?;
        if pubkey.len() != 32 {
            return Err(AuthError::MalformedKey);
        }
        let derived = crypto::address_from_pubkey(&pubkey);
        if !derived.eq_ignore_ascii_case(&id.address) {
            return Err(AuthError::AddressMismatch {
                claimed: id.address.clone(),
                derived,
            });
        }
        let sig = hex::decode(&id.signature).map_err(|_| AuthError::BadSignature)?;
        if !crypto::verify_bytes(&pubkey, &signing_payload(id), &sig) {
            return Err(AuthError::BadSignature);
        }

        let key = (id.node_id.clone(), id.nonce.clone());
        match self.seen_nonces.entry(key) {
            Entry::Occupied(mut e) => {
                if *e.get() > now {
                    return Err(AuthError::NonceReplay {
                        node_id: id.node_id.clone(),
                    });
                }
                e.insert(now + self.config.nonce_window_secs);
            }
            Entry::Vacant(e) => {
                e.insert(now + self.config.nonce_window_secs);
            }
        }
        Ok(())
    }

    /// New challenge bound to the attested peer.
    pub fn issue_challenge(&self, peer: &PeerIdentity) -> String {
        self.issue_challenge_at(peer, now_secs())
    }

    pub fn issue_challenge_at(&self, peer: &PeerIdentity, now: i64) -> String {
        let challenge = random_hex(32);
        self.challenges.insert(
            challenge.clone(),
            PendingChallenge {
                node_id: peer.node_id.clone(),
                public_key: peer.public_key.clone(),
                expires_at: now + self.config.challenge_expiry_secs,
            },
        );
        challenge
    }

    pub fn outstanding_challenges(&self) -> usize {
        self.challenges.len()
    }

    pub fn verify_response(&self, peer: &PeerIdentity, resp: &ChallengeResponse) -> Result<(), AuthError> {
        self.verify_response_at(peer, resp, now_secs())
    }

    /// The outstanding challenge is consumed whatever the outcome.
    pub fn verify_response_at(
        &self,
        peer: &PeerIdentity,
        resp: &ChallengeResponse,
        now: i64,
    ) -> Result<(), AuthError> {
        if resp.node_id != peer.node_id {
            return Err(AuthError::PeerMismatch {
                expected: peer.node_id.clone(),
                got: resp.node_id.clone(),
            });
        }
        let (challenge, pending) = self
            .challenges
            .remove(&resp.challenge)
            .ok_or_else(|| AuthError::ChallengeUnknown(peer.node_id.clone()))?;
        if now > pending.expires_at {
            return Err(AuthError::ChallengeExpired);
        }
        if pending.node_id != peer.node_id
            || pending.public_key != peer.public_key
            || resp.response_hash != response_hash(&peer.node_id, &challenge)
        {
            return Err(AuthError::ChallengeMismatch);
        }
        if (now - resp.timestamp).abs() > self.config.max_clock_drift_secs {
            return Err(AuthError::ClockDrift {
                drift_secs: now - resp.timestamp,
            });
        }
        let pubkey = hex::decode(&peer.public_key).map_err(|_| AuthError::MalformedKey)?;
        let sig = hex::decode(&resp.signature).map_err(|_| AuthError::BadSignature)?;
        if !crypto::verify_bytes(&pubkey, &signing_payload(resp), &sig) {
            return Err(AuthError::BadSignature);
        }
        Ok(())
    }

    /// Drop expired nonces and challenges.
    pub fn prune_at(&self, now: i64) {
        self.seen_nonces.retain(|_, exp| *exp > now);
        self.challenges.retain(|_, c| c.expires_at >= now);
    }

    pub fn prune(&self) {
        self.prune_at(now_secs())
    }

    pub fn tracked_nonces(&self) -> usize {
        self.seen_nonces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::signing_key_from_seed;
    use ed25519_dalek::SigningKey;

    fn auth() -> PeerAuthenticator {
        PeerAuthenticator::new(AuthConfig {
            chain_id: "c".into(),
            network_id: "n".into(),
            max_clock_drift_secs: 30,
            nonce_window_secs: 300,
            challenge_expiry_secs: 30,
        })
    }

    fn identity(now: i64) -> (SigningKey, PeerIdentity) {
        identity_with(5, now)
    }

    fn identity_with(seed: u8, now: i64) -> (SigningKey, PeerIdentity) {
        let sk = signing_key_from_seed(&[seed; 32]);
        let id = PeerIdentity::attest_at(&sk, "peer-1", "c", "n", None, now).unwrap();
        (sk, id)
    }

    #[test]
    fn valid_attestation_then_replay_rejected() {
        let a = auth();
        let (_, id) = identity(1_000);
        assert_eq!(a.verify_identity_at(&id, 1_005), Ok(()));
        assert!(matches!(
            a.verify_identity_at(&id, 1_010),
            Err(AuthError::NonceReplay { .. })
        ));
        // after the window the nonce is forgotten, drift catches the stale copy
        a.prune_at(1_400);
        assert_eq!(a.tracked_nonces(), 0);
        assert!(matches!(
            a.verify_identity_at(&id, 1_400),
            Err(AuthError::ClockDrift { .. })
        ));
    }

    #[test]
    fn each_check_reports_its_reason() {
        let a = auth();
        let (sk, id) = identity(1_000);

        let mut wrong_chain = PeerIdentity::attest_at(&sk, "peer-1", "other", "n", None, 1_000).unwrap();
        assert_eq!(a.verify_identity_at(&wrong_chain, 1_000).unwrap_err().reason(), "chain_mismatch");
        wrong_chain = PeerIdentity::attest_at(&sk, "peer-1", "c", "other", None, 1_000).unwrap();
        assert_eq!(a.verify_identity_at(&wrong_chain, 1_000).unwrap_err().reason(), "network_mismatch");

        assert_eq!(a.verify_identity_at(&id, 1_100).unwrap_err().reason(), "clock_drift");

        let mut tampered = id.clone();
        tampered.node_id = "peer-2".into();
        assert_eq!(a.verify_identity_at(&tampered, 1_000).unwrap_err().reason(), "bad_signature");

        let mut wrong_addr = id.clone();
        wrong_addr.address = crypto::address_of(&signing_key_from_seed(&[6u8; 32]));
        assert_eq!(a.verify_identity_at(&wrong_addr, 1_000).unwrap_err().reason(), "address_mismatch");

        let mut bad_key = id.clone();
        bad_key.public_key = "zz".into();
        assert_eq!(a.verify_identity_at(&bad_key, 1_000).unwrap_err().reason(), "malformed_key");

        // failures above did not consume the nonce
        assert_eq!(a.verify_identity_at(&id, 1_000), Ok(()));
    }

    #[test]
    fn challenge_response_paths() {
        let a = auth();
        let (sk, id) = identity(1_000);

        let ch = a.issue_challenge_at(&id, 1_000);
        let resp = ChallengeResponse::answer_at(&sk, "peer-1", &ch, 1_001).unwrap();
        assert_eq!(a.verify_response_at(&id, &resp, 1_002), Ok(()));
        // consumed
        assert!(matches!(
            a.verify_response_at(&id, &resp, 1_002),
            Err(AuthError::ChallengeUnknown(_))
        ));

        let ch = a.issue_challenge_at(&id, 1_000);
        let late = ChallengeResponse::answer_at(&sk, "peer-1", &ch, 1_040).unwrap();
        assert_eq!(a.verify_response_at(&id, &late, 1_040), Err(AuthError::ChallengeExpired));

        let ch = a.issue_challenge_at(&id, 1_000);
        let mut wrong = ChallengeResponse::answer_at(&sk, "peer-1", &ch, 1_001).unwrap();
        wrong.response_hash = "deadbeef".into();
        assert_eq!(a.verify_response_at(&id, &wrong, 1_001), Err(AuthError::ChallengeMismatch));

        let never_issued = ChallengeResponse::answer_at(&sk, "peer-1", "deadbeef", 1_001).unwrap();
        assert!(matches!(
            a.verify_response_at(&id, &never_issued, 1_001),
            Err(AuthError::ChallengeUnknown(_))
        ));

        let ch = a.issue_challenge_at(&id, 1_000);
        let other = signing_key_from_seed(&[7u8; 32]);
        let forged = ChallengeResponse::answer_at(&other, "peer-1", &ch, 1_001).unwrap();
        assert_eq!(a.verify_response_at(&id, &forged, 1_001), Err(AuthError::BadSignature));

        let imposter = ChallengeResponse::answer_at(&sk, "peer-9", "x", 1_001).unwrap();
        assert!(matches!(
            a.verify_response_at(&id, &imposter, 1_001),
            Err(AuthError::PeerMismatch { .. })
        ));
    }

    #[test]
    fn concurrent_handshakes_for_one_node_id_keep_their_challenges() {
        let a = auth();
        let (sk1, id1) = identity_with(5, 1_000);
        let (sk2, id2) = identity_with(8, 1_000);

        let ch1 = a.issue_challenge_at(&id1, 1_000);
        let ch2 = a.issue_challenge_at(&id2, 1_000);
        assert_eq!(a.outstanding_challenges(), 2);

        // answered in reverse order of issue
        let r2 = ChallengeResponse::answer_at(&sk2, "peer-1", &ch2, 1_001).unwrap();
        let r1 = ChallengeResponse::answer_at(&sk1, "peer-1", &ch1, 1_001).unwrap();
        assert_eq!(a.verify_response_at(&id2, &r2, 1_002), Ok(()));
        assert_eq!(a.verify_response_at(&id1, &r1, 1_002), Ok(()));
        assert_eq!(a.outstanding_challenges(), 0);
    }

    #[test]
    fn challenge_is_bound_to_the_key_it_was_issued_to() {
        let a = auth();
        let (_, id1) = identity_with(5, 1_000);
        let (sk2, id2) = identity_with(8, 1_000);

        let ch1 = a.issue_challenge_at(&id1, 1_000);
        let stolen = ChallengeResponse::answer_at(&sk2, "peer-1", &ch1, 1_001).unwrap();
        assert_eq!(a.verify_response_at(&id2, &stolen, 1_001), Err(AuthError::ChallengeMismatch));
    }
}
