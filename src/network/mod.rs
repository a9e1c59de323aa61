// src/network/mod.rs
// Peer transport: authenticated TCP connections carrying length-delimited
// JSON envelopes. Every connection passes the handshake before any
// application message is read, and every inbound message is admitted by the
// rate limiter before dispatch. Application traffic is handed to the node
// over a bounded channel as `NetworkEvent`s; gossip is only relayed once the
// node has accepted it. Peers are keyed by their key-derived address, the
// self-chosen node id is a label.

pub mod handshake;
pub mod messages;
pub mod peer_auth;
pub mod rate_limiter;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bft::{Proposal, Vote};
use crate::chain::{Block, Transaction};
use crate::config::NetworkConfig;
use crate::crypto::{CryptoError, NodeSigner};
use crate::telemetry::Telemetry;

use self::handshake::{LocalIdentity, WireFramed};
use self::messages::{Envelope, WireMessage};
use self::peer_auth::{AuthConfig, AuthError, PeerAuthenticator, PeerIdentity};
use self::rate_limiter::{ip_key, peer_key, RateLimiter};

const PEER_QUEUE: usize = 256;
const DEDUPE_TTL: Duration = Duration::from_secs(120);
const MAX_DEDUPE_ENTRIES: usize = 50_000;
const MAX_KNOWN_PEERS: usize = 2000;
const MAX_PEER_LIST: usize = 64;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("peer authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: String },

    #[error("unsupported protocol version {0}")]
    VersionMismatch(u8),

    #[error("envelope sender {claimed} is not the authenticated peer {authenticated}")]
    SenderMismatch { claimed: String, authenticated: String },

    #[error("connected to self")]
    SelfConnection,

    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error("node id {node_id} is already in use by {holder}")]
    NodeIdConflict { node_id: String, holder: String },

    #[error("signing failed: {0}")]
    Signer(#[from] CryptoError),

    #[error("peer limit of {0} reached")]
    PeerLimit(usize),

    #[error("invalid peer address {0}")]
    InvalidAddress(String),

    #[error("network is shut down")]
    Shutdown,
}

/// Application traffic delivered to the node. Gossip carries the address of
/// the peer it came from, for [`NetworkHandle::relay`].
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    Transaction { tx: Transaction, from: String },
    Block { block: Block, from: String },
    Proposal { proposal: Proposal, from: String },
    Vote { vote: Vote, from: String },
    PeerConnected(PeerInfo),
    PeerDisconnected(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub node_id: String,
    pub address: String,
    pub remote_addr: String,
    pub listen_addr: Option<String>,
    pub outbound: bool,
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

/// Dialable address with reconnect backoff.
#[derive(Debug, Clone, Serialize)]
pub struct PeerEntry {
    pub addr: String,
    pub failures: u32,
    pub backoff_secs: u64,
    pub next_retry_unix: Option<u64>,
    pub bootstrap: bool,
    #[serde(skip)]
    pub dialing: bool,
}

impl PeerEntry {
    pub fn new(addr: String, bootstrap: bool) -> Self {
        Self {
            addr,
            failures: 0,
            backoff_secs: 0,
            next_retry_unix: None,
            bootstrap,
            dialing: false,
        }
    }

    /// Record a connection failure with exponential backoff + jitter
    pub fn record_failure_with_backoff(&mut self) {
        self.record_failure_at(current_unix());
    }

    pub fn record_failure_at(&mut self, now: u64) {
        self.failures = self.failures.saturating_add(1);
        // 5s, 10s, 20s, 40s, 80s, 160s, then capped at 5 min
        self.backoff_secs = match self.failures {
            0..=1 => 5,
            2 => 10,
            3 => 20,
            4 => 40,
            5 => 80,
            6 => 160,
            _ => 300,
        };
        let jitter = now % (self.backoff_secs / 4 + 1);
        self.next_retry_unix = Some(now + self.backoff_secs + jitter);
    }

    pub fn is_ready_for_retry_at(&self, now: u64) -> bool {
        !self.dialing && self.next_retry_unix.map(|t| now >= t).unwrap_or(true)
    }

    /// Reset backoff on successful connection
    pub fn reset_backoff(&mut self) {
        self.failures = 0;
        self.backoff_secs = 0;
        self.next_retry_unix = None;
    }
}

fn current_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn is_valid_peer_address(addr: &str) -> bool {
    addr.parse::<SocketAddr>().is_ok()
}

struct PeerHandle {
    info: PeerInfo,
    conn_id: Uuid,
    tx: mpsc::Sender<Bytes>,
}

struct Shared {
    local: LocalIdentity,
    config: NetworkConfig,
    auth: PeerAuthenticator,
    limiter: Arc<RateLimiter>,
    telemetry: Telemetry,
    peers: DashMap<String, PeerHandle>,
    known: Mutex<HashMap<String, PeerEntry>>,
    seen: Mutex<HashMap<String, Instant>>,
    events: mpsc::Sender<NetworkEvent>,
    shutdown: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl Shared {
    fn peer_gauge(&self) {
        self.telemetry.metrics.peers.set(self.peers.len() as i64);
    }

    /// True the first time a message id is seen within the TTL.
    fn first_sighting(&self, id: String) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        if let Some(t) = seen.get(&id) {
            if now.duration_since(*t) < DEDUPE_TTL {
                return false;
            }
        }
        if seen.len() >= MAX_DEDUPE_ENTRIES {
            seen.retain(|_, t| now.duration_since(*t) < DEDUPE_TTL);
        }
        seen.insert(id, now);
        true
    }

    fn connected_addrs(&self) -> Vec<String> {
        let mut out = Vec::new();
        for p in self.peers.iter() {
            out.push(p.info.remote_addr.clone());
            if let Some(l) = &p.info.listen_addr {
                out.push(l.clone());
            }
        }
        out
    }

    fn learn(&self, addrs: impl IntoIterator<Item = String>) {
        let own = self.local.listen_addr.clone();
        let mut known = self.known.lock();
        for addr in addrs {
            if known.len() >= MAX_KNOWN_PEERS {
                break;
            }
            if !is_valid_peer_address(&addr) || Some(&addr) == own.as_ref() {
                continue;
            }
            known
                .entry(addr.clone())
                .or_insert_with(|| PeerEntry::new(addr, false));
        }
    }

    fn send_frame(&self, peer: &str, frame: Bytes) -> bool {
        match self.peers.get(peer) {
            Some(p) => p.tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Address of the connected peer using `node_id`, if any.
    fn holder_of(&self, node_id: &str) -> Option<String> {
        self.peers
            .iter()
            .find(|p| p.info.node_id == node_id)
            .map(|p| p.key().clone())
    }

    fn fan_out(&self, frame: &Bytes, except: Option<&str>) -> usize {
        let mut sent = 0;
        for p in self.peers.iter() {
            if Some(p.key().as_str()) == except {
                continue;
            }
            match p.tx.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(_) => tracing::debug!(peer = %p.key(), "send queue full, dropping frame"),
            }
        }
        sent
    }
}

/// Handle to the running network service. Cheap to clone.
#[derive(Clone)]
pub struct NetworkHandle {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

pub struct NetworkService;

impl NetworkService {
    /// Bind the listener and spawn the accept and maintenance loops.
    pub async fn start(
        config: NetworkConfig,
        signer: Arc<dyn NodeSigner>,
        node_id: &str,
        limiter: Arc<RateLimiter>,
        telemetry: Telemetry,
        events: mpsc::Sender<NetworkEvent>,
    ) -> Result<NetworkHandle, NetworkError> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let advertised = config
            .public_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());
        tracing::info!("p2p listening on {} (advertised {})", local_addr, advertised);

        let local = LocalIdentity {
            node_id: node_id.to_string(),
            signer,
            chain_id: config.chain_id.clone(),
            network_id: config.network_id.clone(),
            listen_addr: Some(advertised),
        };
        let mut known = HashMap::new();
        for addr in &config.bootstrap_peers {
            if is_valid_peer_address(addr) {
                known.insert(addr.clone(), PeerEntry::new(addr.clone(), true));
            } else {
                tracing::warn!("ignoring invalid bootstrap peer {}", addr);
            }
        }
        let (shutdown, _) = broadcast::channel(1);
        let shared = Arc::new(Shared {
            local,
            auth: PeerAuthenticator::new(AuthConfig::from(&config)),
            config,
            limiter,
            telemetry,
            peers: DashMap::new(),
            known: Mutex::new(known),
            seen: Mutex::new(HashMap::new()),
            events,
            shutdown,
            stopped: AtomicBool::new(false),
        });

        let handle = NetworkHandle {
            shared: shared.clone(),
            local_addr,
            tasks: Arc::new(Mutex::new(Vec::new())),
        };
        let accept = tokio::spawn(accept_loop(shared.clone(), listener));
        let maintain = tokio::spawn(maintenance_loop(handle.clone()));
        handle.tasks.lock().extend([accept, maintain]);
        Ok(handle)
    }
}

impl NetworkHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_id(&self) -> &str {
        &self.shared.local.node_id
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut v: Vec<PeerInfo> = self.shared.peers.iter().map(|p| p.info.clone()).collect();
        v.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        v
    }

    pub fn known_addresses(&self) -> Vec<PeerEntry> {
        self.shared.known.lock().values().cloned().collect()
    }

    /// Flood `message` to every peer. Returns how many peers accepted it.
    pub fn broadcast(&self, message: WireMessage) -> Result<usize, NetworkError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(NetworkError::Shutdown);
        }
        if message.is_gossip() {
            // our own gossip must not come back as news
            self.shared.first_sighting(message.message_id());
        }
        let frame = Envelope::new(&self.shared.local.node_id, message).encode()?;
        Ok(self.shared.fan_out(&frame, None))
    }

    /// Forward gossip the node accepted to every peer but the one it came
    /// from.
    pub fn relay(&self, message: WireMessage, from: &str) -> Result<usize, NetworkError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(NetworkError::Shutdown);
        }
        // relayed under our node id: receivers match sender to the connection
        let frame = Envelope::new(&self.shared.local.node_id, message).encode()?;
        Ok(self.shared.fan_out(&frame, Some(from)))
    }

    pub fn send_to(&self, node_id: &str, message: WireMessage) -> Result<bool, NetworkError> {
        let Some(peer) = self.shared.holder_of(node_id) else {
            return Ok(false);
        };
        let frame = Envelope::new(&self.shared.local.node_id, message).encode()?;
        Ok(self.shared.send_frame(&peer, frame))
    }

    /// Dial `addr` and run the handshake. The connection keeps running in
    /// its own task after this returns.
    pub async fn connect(&self, addr: &str) -> Result<PeerInfo, NetworkError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(NetworkError::Shutdown);
        }
        let sock: SocketAddr = addr
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(addr.to_string()))?;
        let limit = Duration::from_millis(self.shared.config.connect_timeout_ms);
        let stream = tokio::time::timeout(limit, TcpStream::connect(sock))
            .await
            .map_err(|_| NetworkError::ConnectTimeout(addr.to_string()))??;
        let (info, framed, identity) = establish(&self.shared, stream, sock, true).await?;
        tokio::spawn(run_connection(self.shared.clone(), framed, identity, info.clone()));
        Ok(info)
    }

    /// Wait until at least `min` peers are connected or `limit` elapses.
    pub async fn wait_for_peers(&self, min: usize, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.peer_count() >= min {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Stop accepting, close every connection. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.shutdown.send(());
        for t in self.tasks.lock().drain(..) {
            t.abort();
        }
        self.shared.peers.clear();
        self.shared.peer_gauge();
        tracing::info!("p2p network shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.recv() => break,
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    continue;
                }
            },
        };

        let key = ip_key(&remote.ip());
        let decision = shared.limiter.check(&key, 1.0);
        if !decision.allowed {
            shared.telemetry.metrics.messages_rejected.inc();
            tracing::debug!(addr = %remote, retry_after_ms = decision.retry_after_ms, "connection rate limited");
            continue;
        }
        if shared.peers.len() >= shared.config.max_peers {
            tracing::debug!(addr = %remote, "peer limit reached, refusing inbound");
            continue;
        }

        let shared = shared.clone();
        tokio::spawn(async move {
            match establish(&shared, stream, remote, false).await {
                Ok((info, framed, identity)) => run_connection(shared, framed, identity, info).await,
                Err(e) => {
                    tracing::warn!(addr = %remote, "inbound handshake rejected: {}", e);
                    if matches!(e, NetworkError::Auth(_)) {
                        shared.limiter.record_violation(&key);
                    }
                }
            }
        });
    }
}

/// Handshake and register. The returned framed transport is ready for
/// application traffic.
async fn establish<S>(
    shared: &Arc<Shared>,
    stream: S,
    remote: SocketAddr,
    outbound: bool,
) -> Result<(PeerInfo, WireFramed<S>, PeerIdentity), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = handshake::framed(stream, shared.config.max_frame_bytes);
    let limit = Duration::from_millis(shared.config.handshake_timeout_ms);
    let identity = handshake::perform_handshake(&mut framed, &shared.local, &shared.auth, limit).await?;

    if shared.peers.contains_key(&identity.address) {
        return Err(NetworkError::AlreadyConnected(identity.node_id));
    }
    if let Some(holder) = shared.holder_of(&identity.node_id) {
        return Err(NetworkError::NodeIdConflict {
            node_id: identity.node_id,
            holder,
        });
    }
    if shared.peers.len() >= shared.config.max_peers {
        return Err(NetworkError::PeerLimit(shared.config.max_peers));
    }
    let info = PeerInfo {
        node_id: identity.node_id.clone(),
        address: identity.address.clone(),
        remote_addr: remote.to_string(),
        listen_addr: identity.listen_addr.clone(),
        outbound,
        connected_at: chrono::Utc::now(),
    };
    if let Some(l) = &identity.listen_addr {
        shared.learn([l.clone()]);
    }
    Ok((info, framed, identity))
}

async fn run_connection<S>(
    shared: Arc<Shared>,
    framed: WireFramed<S>,
    identity: PeerIdentity,
    info: PeerInfo,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let node_id = identity.node_id.clone();
    let peer = identity.address.clone();
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Bytes>(PEER_QUEUE);

    // A concurrent dial may have registered the same peer meanwhile.
    if shared.holder_of(&node_id).map_or(false, |holder| holder != peer) {
        tracing::warn!(peer = %peer, node_id = %node_id, "node id taken by another key, dropping connection");
        return;
    }
    match shared.peers.entry(peer.clone()) {
        dashmap::mapref::entry::Entry::Occupied(_) => {
            tracing::debug!(peer = %node_id, "duplicate connection dropped");
            return;
        }
        dashmap::mapref::entry::Entry::Vacant(v) => {
            v.insert(PeerHandle {
                info: info.clone(),
                conn_id,
                tx,
            });
        }
    }
    if shared.stopped.load(Ordering::SeqCst) {
        shared.peers.remove_if(&peer, |_, p| p.conn_id == conn_id);
        return;
    }
    shared.peer_gauge();
    tracing::info!(peer = %node_id, addr = %info.remote_addr, outbound = info.outbound, "peer connected");
    if shared.events.send(NetworkEvent::PeerConnected(info)).await.is_err() {
        return;
    }

    let (mut sink, mut stream) = framed.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                tracing::debug!("write failed: {}", e);
                break;
            }
        }
    });

    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => break,
            f = stream.next() => match f {
                Some(Ok(f)) => f,
                Some(Err(e)) => {
                    tracing::debug!(peer = %node_id, "read failed: {}", e);
                    break;
                }
                None => break,
            },
        };
        let env = match Envelope::decode(&frame) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(peer = %node_id, "undecodable frame: {}", e);
                shared.limiter.record_violation(&peer_key(&peer, "decode"));
                shared.telemetry.metrics.messages_rejected.inc();
                continue;
            }
        };
        if env.sender != node_id {
            tracing::warn!(peer = %node_id, claimed = %env.sender, "sender mismatch, dropping message");
            shared.limiter.record_violation(&peer_key(&peer, env.message.kind()));
            shared.telemetry.metrics.messages_rejected.inc();
            continue;
        }
        let decision = shared.limiter.check(&peer_key(&peer, env.message.kind()), 1.0);
        if !decision.allowed {
            shared.telemetry.metrics.messages_rejected.inc();
            tracing::debug!(
                peer = %node_id,
                kind = env.message.kind(),
                retry_after_ms = decision.retry_after_ms,
                "message rate limited"
            );
            continue;
        }
        if !dispatch(&shared, &peer, env.message).await {
            break;
        }
    }

    writer.abort();
    // only remove the entry this task registered
    shared.peers.remove_if(&peer, |_, p| p.conn_id == conn_id);
    shared.peer_gauge();
    tracing::info!(peer = %node_id, "peer disconnected");
    let _ = shared.events.send(NetworkEvent::PeerDisconnected(node_id)).await;
}

/// `from` is the sending peer's address. Returns false when the node side
/// has gone away.
async fn dispatch(shared: &Arc<Shared>, from: &str, message: WireMessage) -> bool {
    if message.is_gossip() && !shared.first_sighting(message.message_id()) {
        return true;
    }

    let from_peer = from.to_string();
    let event = match message {
        WireMessage::NewTransaction(tx) => NetworkEvent::Transaction { tx, from: from_peer },
        WireMessage::NewBlock(block) => NetworkEvent::Block { block, from: from_peer },
        WireMessage::Proposal(proposal) => NetworkEvent::Proposal { proposal, from: from_peer },
        WireMessage::Vote(vote) => NetworkEvent::Vote { vote, from: from_peer },
        WireMessage::Ping { nonce } => {
            if let Ok(frame) = Envelope::new(&shared.local.node_id, WireMessage::Pong { nonce }).encode() {
                shared.send_frame(from, frame);
            }
            return true;
        }
        WireMessage::Pong { .. } => return true,
        WireMessage::PeerRequest => {
            let mut peers: Vec<String> = shared
                .peers
                .iter()
                .filter(|p| p.key() != from)
                .filter_map(|p| p.info.listen_addr.clone())
                .collect();
            peers.truncate(MAX_PEER_LIST);
            if let Ok(frame) = Envelope::new(&shared.local.node_id, WireMessage::PeerList { peers }).encode() {
                shared.send_frame(from, frame);
            }
            return true;
        }
        WireMessage::PeerList { peers } => {
            shared.learn(peers.into_iter().take(MAX_PEER_LIST));
            return true;
        }
        WireMessage::Hello(_) | WireMessage::Challenge { .. } | WireMessage::ChallengeResponse(_) => {
            tracing::warn!(peer = %from, "handshake message after authentication");
            shared.limiter.record_violation(&peer_key(from, "handshake"));
            shared.telemetry.metrics.messages_rejected.inc();
            return true;
        }
    };
    shared.events.send(event).await.is_ok()
}

async fn maintenance_loop(handle: NetworkHandle) {
    let shared = handle.shared.clone();
    let mut shutdown = shared.shutdown.subscribe();
    let mut tick = tokio::time::interval(Duration::from_millis(shared.config.maintenance_interval_ms.max(50)));
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tick.tick() => {}
        }
        shared.auth.prune();
        shared.limiter.cleanup();
        {
            let now = Instant::now();
            shared.seen.lock().retain(|_, t| now.duration_since(*t) < DEDUPE_TTL);
        }

        let count = shared.peers.len();
        if count >= shared.config.max_peers {
            continue;
        }
        let below_min = count < shared.config.min_peers;
        let connected = shared.connected_addrs();
        let now = current_unix();
        let candidates: Vec<String> = {
            let mut known = shared.known.lock();
            let mut picked = Vec::new();
            for entry in known.values_mut() {
                if connected.contains(&entry.addr) || !entry.is_ready_for_retry_at(now) {
                    continue;
                }
                // bootstrap peers are always kept; gossiped ones only while short
                if entry.bootstrap || below_min {
                    entry.dialing = true;
                    picked.push(entry.addr.clone());
                }
                if picked.len() + count >= shared.config.max_peers {
                    break;
                }
            }
            picked
        };
        for addr in candidates {
            let h = handle.clone();
            tokio::spawn(async move {
                let result = h.connect(&addr).await;
                let mut known = h.shared.known.lock();
                if let Some(entry) = known.get_mut(&addr) {
                    entry.dialing = false;
                    match &result {
                        Ok(_) | Err(NetworkError::AlreadyConnected(_)) => entry.reset_backoff(),
                        Err(e) => {
                            tracing::debug!("dial {} failed: {}", addr, e);
                            entry.record_failure_with_backoff();
                        }
                    }
                }
            });
        }
        if below_min && count > 0 {
            if let Ok(frame) = Envelope::new(&shared.local.node_id, WireMessage::PeerRequest).encode() {
                shared.fan_out(&frame, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut e = PeerEntry::new("127.0.0.1:1".into(), false);
        e.record_failure_at(1000);
        assert_eq!(e.backoff_secs, 5);
        assert!(!e.is_ready_for_retry_at(1001));
        for _ in 0..10 {
            e.record_failure_at(1000);
        }
        assert_eq!(e.backoff_secs, 300);
        assert!(e.is_ready_for_retry_at(1000 + 300 + 76));
        e.reset_backoff();
        assert!(e.is_ready_for_retry_at(0));
    }

    #[test]
    fn only_socket_addresses_are_dialable() {
        assert!(is_valid_peer_address("127.0.0.1:9000"));
        assert!(is_valid_peer_address("[::1]:9000"));
        assert!(!is_valid_peer_address("example.org"));
        assert!(!is_valid_peer_address("10.0.0.1"));
    }
}
