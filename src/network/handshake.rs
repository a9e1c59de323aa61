// src/network/handshake.rs
// Symmetric authentication run by both ends of every connection:
//
//   -> Hello(attestation)        <- Hello(attestation)
//   -> Challenge                 <- Challenge
//   -> ChallengeResponse         <- ChallengeResponse
//
// Each side sends before it reads, so neither end waits on the other.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::crypto::NodeSigner;
use crate::network::messages::{Envelope, WireMessage};
use crate::network::peer_auth::{ChallengeResponse, PeerAuthenticator, PeerIdentity};
use crate::network::NetworkError;

pub type WireFramed<S> = Framed<S, LengthDelimitedCodec>;

/// Wrap a stream in the length-delimited codec with a frame size cap.
pub fn framed<S>(stream: S, max_frame_bytes: usize) -> WireFramed<S>
where
    S: AsyncRead + AsyncWrite,
{
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_framed(stream)
}

/// What this node presents to peers.
#[derive(Clone)]
pub struct LocalIdentity {
    pub node_id: String,
    pub signer: Arc<dyn NodeSigner>,
    pub chain_id: String,
    pub network_id: String,
    pub listen_addr: Option<String>,
}

impl LocalIdentity {
    pub fn attest(&self) -> Result<PeerIdentity, NetworkError> {
        let id = PeerIdentity::attest(
            &*self.signer,
            &self.node_id,
            &self.chain_id,
            &self.network_id,
            self.listen_addr.clone(),
        )?;
        Ok(id)
    }
}

pub async fn send_message<S>(
    framed: &mut WireFramed<S>,
    sender: &str,
    message: WireMessage,
) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = Envelope::new(sender, message).encode()?;
    framed.send(bytes).await?;
    Ok(())
}

pub async fn recv_envelope<S>(framed: &mut WireFramed<S>) -> Result<Envelope, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = framed.next().await.ok_or(NetworkError::ConnectionClosed)??;
    Envelope::decode(&frame)
}

fn unexpected(expected: &'static str, got: &WireMessage) -> NetworkError {
    NetworkError::UnexpectedMessage {
        expected,
        got: got.kind().to_string(),
    }
}

/// Authenticate the remote end. On success returns its verified identity.
pub async fn perform_handshake<S>(
    framed: &mut WireFramed<S>,
    local: &LocalIdentity,
    auth: &PeerAuthenticator,
    limit: Duration,
) -> Result<PeerIdentity, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, exchange(framed, local, auth))
        .await
        .map_err(|_| NetworkError::HandshakeTimeout)?
}

async fn exchange<S>(
    framed: &mut WireFramed<S>,
    local: &LocalIdentity,
    auth: &PeerAuthenticator,
) -> Result<PeerIdentity, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_message(framed, &local.node_id, WireMessage::Hello(local.attest()?)).await?;

    let env = recv_envelope(framed).await?;
    let remote = match env.message {
        WireMessage::Hello(id) => id,
        other => return Err(unexpected("hello", &other)),
    };
    if env.sender != remote.node_id {
        return Err(NetworkError::SenderMismatch {
            claimed: env.sender,
            authenticated: remote.node_id,
        });
    }
    if remote.node_id == local.node_id || remote.address.eq_ignore_ascii_case(&local.signer.address()) {
        return Err(NetworkError::SelfConnection);
    }
    auth.verify_identity(&remote)?;

    let challenge = auth.issue_challenge(&remote);
    send_message(framed, &local.node_id, WireMessage::Challenge { challenge }).await?;

    let env = recv_envelope(framed).await?;
    let theirs = match env.message {
        WireMessage::Challenge { challenge } => challenge,
        other => return Err(unexpected("challenge", &other)),
    };
    let answer = ChallengeResponse::answer(&*local.signer, &local.node_id, &theirs)?;
    send_message(framed, &local.node_id, WireMessage::ChallengeResponse(answer)).await?;

    let env = recv_envelope(framed).await?;
    let response = match env.message {
        WireMessage::ChallengeResponse(r) => r,
        other => return Err(unexpected("challenge_response", &other)),
    };
    auth.verify_response(&remote, &response)?;

    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer_auth::{AuthConfig, AuthError};
    use crate::crypto::keys::signing_key_from_seed;

    fn auth(chain: &str) -> PeerAuthenticator {
        PeerAuthenticator::new(AuthConfig {
            chain_id: chain.to_string(),
            network_id: "testnet".to_string(),
            max_clock_drift_secs: 30,
            nonce_window_secs: 300,
            challenge_expiry_secs: 30,
        })
    }

    fn local(node: &str, seed: u8, chain: &str) -> LocalIdentity {
        LocalIdentity {
            node_id: node.to_string(),
            signer: Arc::new(signing_key_from_seed(&[seed; 32])),
            chain_id: chain.to_string(),
            network_id: "testnet".to_string(),
            listen_addr: None,
        }
    }

    #[tokio::test]
    async fn both_sides_authenticate() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (auth_a, auth_b) = (auth("c1"), auth("c1"));
        let (id_a, id_b) = (local("a", 1, "c1"), local("b", 2, "c1"));
        let mut fa = framed(a, 1 << 20);
        let mut fb = framed(b, 1 << 20);
        let limit = Duration::from_secs(5);

        let (ra, rb) = tokio::join!(
            perform_handshake(&mut fa, &id_a, &auth_a, limit),
            perform_handshake(&mut fb, &id_b, &auth_b, limit)
        );
        assert_eq!(ra.unwrap().node_id, "b");
        assert_eq!(rb.unwrap().node_id, "a");
    }

    #[tokio::test]
    async fn chain_mismatch_is_reported() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (auth_a, auth_b) = (auth("c1"), auth("c1"));
        let (id_a, id_b) = (local("a", 1, "c1"), local("b", 2, "other"));
        let mut fa = framed(a, 1 << 20);
        let mut fb = framed(b, 1 << 20);
        let limit = Duration::from_secs(2);

        let (ra, _) = tokio::join!(
            perform_handshake(&mut fa, &id_a, &auth_a, limit),
            perform_handshake(&mut fb, &id_b, &auth_b, limit)
        );
        match ra {
            Err(NetworkError::Auth(AuthError::ChainMismatch { got, .. })) => assert_eq!(got, "other"),
            other => panic!("unexpected {:?}", other.map(|p| p.node_id)),
        }
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let mut fa = framed(a, 1 << 20);
        let res = perform_handshake(&mut fa, &local("a", 1, "c1"), &auth("c1"), Duration::from_millis(50)).await;
        assert!(matches!(res, Err(NetworkError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn same_key_under_another_node_id_is_self() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (auth_a, auth_b) = (auth("c1"), auth("c1"));
        let (id_a, id_b) = (local("a", 1, "c1"), local("a-clone", 1, "c1"));
        let mut fa = framed(a, 1 << 20);
        let mut fb = framed(b, 1 << 20);
        let limit = Duration::from_millis(500);

        let (ra, _) = tokio::join!(
            perform_handshake(&mut fa, &id_a, &auth_a, limit),
            perform_handshake(&mut fb, &id_b, &auth_b, limit)
        );
        assert!(matches!(ra, Err(NetworkError::SelfConnection)));
    }

    #[tokio::test]
    async fn locked_signer_fails_the_handshake() {
        struct Refusing(ed25519_dalek::SigningKey);
        impl NodeSigner for Refusing {
            fn address(&self) -> String {
                crate::crypto::address_of(&self.0)
            }
            fn public_key_hex(&self) -> String {
                crate::crypto::pubkey_hex(&self.0)
            }
            fn sign(&self, _msg: &[u8]) -> Result<Vec<u8>, crate::crypto::CryptoError> {
                Err(crate::crypto::CryptoError::SignerUnavailable("locked".into()))
            }
        }
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let mut fa = framed(a, 1 << 20);
        let mut id = local("a", 1, "c1");
        id.signer = Arc::new(Refusing(signing_key_from_seed(&[1u8; 32])));
        let res = perform_handshake(&mut fa, &id, &auth("c1"), Duration::from_millis(200)).await;
        assert!(matches!(res, Err(NetworkError::Signer(_))));
    }
}
