// src/node.rs
// Validator orchestrator. One actor task owns the chain store, mempool,
// consensus engine and keystore; the HTTP layer and the network talk to it
// over bounded channels, so every state mutation happens on that one task.

use anyhow::{bail, Context};
use ed25519_dalek::SigningKey;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::bft::qc;
use crate::bft::{
    ConsensusEngine, ConsensusError, ConsensusMessage, ConsensusState, EngineConfig, EngineOutput,
    GenesisValidatorProvider, ScheduledTimeout, ValidatorInfo, ValidatorSet, ValidatorSetProvider,
};
use crate::chain::{Block, Transaction, TransferExecutor};
use crate::config::{self, KeystoreSection, NodeConfig};
use crate::crypto::NodeSigner;
use crate::error::{ErrorKind, NodeError, NodeResult};
use crate::keystore::{KeyMetadata, Keystore, KeystoreError, KeystoreSigner, LockState};
use crate::mempool::{Mempool, MempoolTransaction};
use crate::network::messages::WireMessage;
use crate::network::rate_limiter::RateLimiter;
use crate::network::{NetworkEvent, NetworkHandle, NetworkService, PeerInfo};
use crate::storage::ChainStore;
use crate::telemetry::Telemetry;

const COMMAND_QUEUE: usize = 1024;
const EVENT_QUEUE: usize = 4096;
const TIMEOUT_QUEUE: usize = 256;
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
const PROVIDER_RETRY: Duration = Duration::from_secs(1);
const COMMIT_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: String,
    pub chain_id: String,
    pub state: NodeState,
    pub height: u64,
    pub latest_hash: String,
    pub state_root: String,
    pub peers: usize,
    pub mempool_size: usize,
    pub validator: String,
    pub is_validator: bool,
    pub consensus_height: u64,
    pub consensus_round: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    pub uptime: u64,
    pub tps: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorStatus {
    pub address: String,
    pub public_key: String,
    pub stake: u64,
    pub total_stake: u64,
    pub is_validator: bool,
    pub is_current_proposer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keystore: Option<LockState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyMetadata>,
    pub blocks_produced: u64,
    pub equivocations_seen: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MempoolView {
    pub size: usize,
    pub max_size: usize,
    pub per_account_cap: usize,
    pub transactions: Vec<MempoolTransaction>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub address: String,
    pub balance: u64,
    pub nonce: u64,
    pub pending: usize,
}

enum Command {
    SubmitTransaction {
        tx: Transaction,
        reply: oneshot::Sender<NodeResult<String>>,
    },
    Status(oneshot::Sender<NodeStatus>),
    Consensus(oneshot::Sender<ConsensusState>),
    Mempool {
        limit: usize,
        reply: oneshot::Sender<MempoolView>,
    },
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    LatestBlock(oneshot::Sender<NodeResult<Option<Block>>>),
    BlockAt {
        height: u64,
        reply: oneshot::Sender<NodeResult<Option<Block>>>,
    },
    Validator(oneshot::Sender<ValidatorStatus>),
    Account {
        address: String,
        reply: oneshot::Sender<AccountView>,
    },
    LockKeystore(oneshot::Sender<NodeResult<LockState>>),
    Stop(oneshot::Sender<()>),
}

/// Not yet started node. `start` performs the whole bring-up.
pub struct ValidatorNode {
    config: NodeConfig,
    telemetry: Telemetry,
    signer: Option<SigningKey>,
    provider: Option<Arc<dyn ValidatorSetProvider>>,
}

impl ValidatorNode {
    pub fn new(config: NodeConfig, telemetry: Telemetry) -> Self {
        Self {
            config,
            telemetry,
            signer: None,
            provider: None,
        }
    }

    /// Use `sk` as the validator identity instead of the keystore. The key
    /// then signs without any lock.
    pub fn with_signing_key(mut self, sk: SigningKey) -> Self {
        self.signer = Some(sk);
        self
    }

    pub fn with_validator_provider(mut self, provider: Arc<dyn ValidatorSetProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Stopped -> Starting -> Running. Opens storage, loads the validator
    /// key, brings up P2P, waits for peers and spawns the node actor.
    pub async fn start(self) -> anyhow::Result<NodeHandle> {
        let ValidatorNode {
            config,
            telemetry,
            signer,
            provider,
        } = self;
        let (state_tx, state_rx) = watch::channel(NodeState::Starting);
        info!("node {} starting (chain {})", config.node_id, config.network.chain_id);

        let validation = config::validate(&config);
        validation.print_summary();
        if !validation.valid {
            bail!("invalid configuration: {}", validation.errors.join("; "));
        }

        let (keystore, signer, key_meta) = match signer {
            Some(sk) => {
                let signer: Arc<dyn NodeSigner> = Arc::new(sk);
                (None, signer, None)
            }
            None => {
                let section = config.keystore.clone();
                let (ks, meta) = tokio::task::spawn_blocking(move || load_validator_key(&section))
                    .await
                    .context("keystore task panicked")?
                    .context("loading validator key")?;
                let ks = Arc::new(Mutex::new(ks));
                let signer: Arc<dyn NodeSigner> = Arc::new(KeystoreSigner::new(ks.clone(), &meta));
                (Some(ks), signer, Some(meta))
            }
        };
        let address = signer.address();
        info!("validator address {}", address);

        let store = ChainStore::open(
            &config.storage.data_dir,
            &config.network.chain_id,
            &config.genesis.balances,
            Arc::new(TransferExecutor),
        )
        .context("opening chain store")?;
        info!(
            "chain store at height {} ({})",
            store.latest_height(),
            config.storage.data_dir.display()
        );

        let provider: Arc<dyn ValidatorSetProvider> = match provider {
            Some(p) => p,
            None if config.genesis.validators.is_empty() => {
                warn!("no genesis validators configured, running as sole validator");
                Arc::new(GenesisValidatorProvider::new(ValidatorSet::new(vec![ValidatorInfo {
                    address: address.clone(),
                    public_key: signer.public_key_hex(),
                    stake: 1,
                }])))
            }
            None => Arc::new(
                GenesisValidatorProvider::from_config(&config.genesis.validators)
                    .context("genesis validator set")?,
            ),
        };

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let network = NetworkService::start(
            config.network.clone(),
            signer.clone(),
            &config.node_id,
            limiter,
            telemetry.clone(),
            event_tx,
        )
        .await
        .context("starting p2p network")?;

        let min_peers = config.network.min_peers;
        if min_peers > 0 {
            info!("waiting for {} peer(s)", min_peers);
            let wait = Duration::from_millis(config.network.peer_wait_timeout_ms);
            if !network.wait_for_peers(min_peers, wait).await {
                if config.network.proceed_alone {
                    warn!(
                        "only {} of {} peers after {:?}, proceeding",
                        network.peer_count(),
                        min_peers,
                        wait
                    );
                } else {
                    network.shutdown();
                    bail!(
                        "only {} of {} required peers after {:?}",
                        network.peer_count(),
                        min_peers,
                        wait
                    );
                }
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (timeout_tx, timeout_rx) = mpsc::channel(TIMEOUT_QUEUE);
        let engine = ConsensusEngine::new(EngineConfig::from(&config.consensus), signer.clone());
        let actor = NodeActor {
            mempool: Mempool::new(config.mempool.clone()),
            public_key: signer.public_key_hex(),
            config: config.clone(),
            telemetry: telemetry.clone(),
            store,
            engine,
            provider,
            network: network.clone(),
            keystore: keystore.clone(),
            key_meta,
            commands: command_rx,
            events: event_rx,
            timeouts: timeout_rx,
            timeout_tx,
            next_height_at: None,
            pending_commit: None,
            last_commit: None,
            last_prune: Instant::now(),
            halted: None,
            state: state_tx,
        };
        let span = telemetry.span();
        let task = tokio::spawn(actor.run().instrument(span));

        Ok(NodeHandle {
            commands: command_tx,
            state: state_rx,
            task: Arc::new(Mutex::new(Some(task))),
            network,
            telemetry,
            config: Arc::new(config),
            address,
            keystore,
        })
    }
}

/// Open or create the keystore, unlock it and pick the validator key.
fn load_validator_key(section: &KeystoreSection) -> Result<(Keystore, KeyMetadata), KeystoreError> {
    let password = section.password.as_deref().ok_or(KeystoreError::Locked)?;
    let mut ks = Keystore::open_or_create(section.to_keystore_config(), password)?;
    if ks.state() != LockState::Unlocked {
        ks.unlock(password)?;
    }
    let meta = match &section.key_id {
        Some(id) => ks
            .list_keys()
            .into_iter()
            .find(|k| &k.key_id == id)
            .ok_or_else(|| KeystoreError::KeyNotFound(id.clone()))?,
        None => match ks.primary_key() {
            Some(k) => k,
            None => {
                info!("keystore has no keys, generating validator key");
                ks.generate_key()?
            }
        },
    };
    // a key that cannot be decrypted fails startup, not the first vote
    ks.signing_key(&meta.key_id)?;
    Ok((ks, meta))
}

/// Handle to a started node. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<NodeState>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    network: NetworkHandle,
    telemetry: Telemetry,
    config: Arc<NodeConfig>,
    address: String,
    keystore: Option<Arc<Mutex<Keystore>>>,
}

impl NodeHandle {
    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn network(&self) -> &NetworkHandle {
        &self.network
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> NodeResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| NodeError::NotRunning)?;
        rx.await.map_err(|_| NodeError::NotRunning)
    }

    /// Validate and admit a transaction; returns its hash.
    pub async fn submit_transaction(&self, tx: Transaction) -> NodeResult<String> {
        self.request(|reply| Command::SubmitTransaction { tx, reply })
            .await?
    }

    pub async fn status(&self) -> NodeResult<NodeStatus> {
        self.request(Command::Status).await
    }

    pub async fn consensus(&self) -> NodeResult<ConsensusState> {
        self.request(Command::Consensus).await
    }

    pub async fn mempool(&self, limit: usize) -> NodeResult<MempoolView> {
        self.request(|reply| Command::Mempool { limit, reply }).await
    }

    pub async fn peers(&self) -> NodeResult<Vec<PeerInfo>> {
        self.request(Command::Peers).await
    }

    pub async fn latest_block(&self) -> NodeResult<Option<Block>> {
        self.request(Command::LatestBlock).await?
    }

    pub async fn block_at(&self, height: u64) -> NodeResult<Option<Block>> {
        self.request(|reply| Command::BlockAt { height, reply }).await?
    }

    pub async fn validator(&self) -> NodeResult<ValidatorStatus> {
        self.request(Command::Validator).await
    }

    /// Committed balance and nonce plus the number of pending mempool entries.
    pub async fn account(&self, address: &str) -> NodeResult<AccountView> {
        let address = address.to_string();
        self.request(|reply| Command::Account { address, reply })
            .await
    }

    /// Lock the validator keystore. Consensus keeps following the chain but
    /// this node stops proposing and voting until it is unlocked.
    pub async fn lock_keystore(&self) -> NodeResult<LockState> {
        self.request(Command::LockKeystore).await?
    }

    /// Unlock the validator keystore. Key derivation runs off the node task.
    pub async fn unlock_keystore(&self, password: &str) -> NodeResult<LockState> {
        let ks = self.keystore.clone().ok_or(NodeError::Keystore(KeystoreError::NotConfigured))?;
        let password = password.to_string();
        let state = tokio::task::spawn_blocking(move || {
            let mut ks = ks.lock();
            ks.unlock(&password).map(|_| ks.state())
        })
        .await
        .map_err(|_| NodeError::NotRunning)??;
        info!("validator keystore unlocked");
        Ok(state)
    }

    /// Running -> Stopping -> Stopped. Repeated calls return immediately.
    pub async fn stop(&self) {
        if self.state() == NodeState::Stopped {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("node task ended abnormally: {}", e);
            }
        }
    }

    /// Resolves once the node has reached `Stopped`.
    pub async fn stopped(&self) {
        let mut rx = self.state.clone();
        while *rx.borrow() != NodeState::Stopped {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct NodeActor {
    config: NodeConfig,
    telemetry: Telemetry,
    store: ChainStore,
    mempool: Mempool,
    engine: ConsensusEngine,
    provider: Arc<dyn ValidatorSetProvider>,
    network: NetworkHandle,
    keystore: Option<Arc<Mutex<Keystore>>>,
    key_meta: Option<KeyMetadata>,
    public_key: String,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<NetworkEvent>,
    timeouts: mpsc::Receiver<ScheduledTimeout>,
    timeout_tx: mpsc::Sender<ScheduledTimeout>,
    next_height_at: Option<Instant>,
    // decided block whose commit failed; retried before any new height
    pending_commit: Option<(Block, bool)>,
    last_commit: Option<Instant>,
    last_prune: Instant,
    halted: Option<String>,
    state: watch::Sender<NodeState>,
}

impl NodeActor {
    async fn run(mut self) {
        let _ = self.state.send(NodeState::Running);
        info!("node running, p2p on {}", self.network.local_addr());
        self.begin_height().await;

        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let next_height = self.next_height_at;
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Stop(reply)) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(t) = self.timeouts.recv() => {
                    let result = self.engine.on_timeout(t.height, t.round, t.phase);
                    self.drive(result);
                }
                _ = sleep_until_opt(next_height) => {
                    self.next_height_at = None;
                    match self.pending_commit.take() {
                        Some((block, gossip)) => self.apply_committed(block, gossip),
                        None => self.begin_height().await,
                    }
                }
                _ = housekeeping.tick() => self.housekeeping(),
            }
        }
    }

    fn shutdown(&mut self) {
        let _ = self.state.send(NodeState::Stopping);
        info!("node stopping");
        self.network.shutdown();
        if let Err(e) = self.store.flush() {
            error!("flushing chain store on stop: {}", e);
        }
        if let Some(ks) = &self.keystore {
            ks.lock().lock();
        }
        let _ = self.state.send(NodeState::Stopped);
        info!("node stopped at height {}", self.store.latest_height());
    }

    /// Start consensus on the height after the current tip.
    async fn begin_height(&mut self) {
        if self.halted.is_some() || self.pending_commit.is_some() {
            return;
        }
        let height = self.store.latest_height() + 1;
        let parent = match self.store.latest_hash() {
            Ok(h) => h,
            Err(e) => {
                self.halt(format!("reading chain tip: {}", e));
                return;
            }
        };
        let validators = match self.provider.validators_at(height).await {
            Ok(set) => set,
            Err(e) => {
                warn!("validator set for height {} unavailable: {}", height, e);
                self.next_height_at = Some(Instant::now() + PROVIDER_RETRY);
                return;
            }
        };
        debug!("starting height {} with {} validator(s)", height, validators.len());
        let result = self.engine.start_height(height, parent, validators);
        self.drive(result);
    }

    fn halt(&mut self, reason: String) {
        error!("consensus halted: {}", reason);
        self.halted = Some(reason);
        self.next_height_at = None;
    }

    /// Act on an engine result: protocol errors are logged and dropped,
    /// fatal ones halt consensus.
    fn drive(&mut self, result: Result<EngineOutput, ConsensusError>) {
        let mut pending = match result {
            Ok(out) => vec![out],
            Err(e) if e.is_fatal() => {
                self.halt(e.to_string());
                return;
            }
            Err(e) => {
                debug!("consensus input rejected ({}): {}", e.reason(), e);
                self.telemetry.metrics.messages_rejected.inc();
                return;
            }
        };

        while let Some(out) = pending.pop() {
            let metrics = &self.telemetry.metrics;
            metrics.consensus_rounds.inc_by(out.rounds_started as u64);
            metrics.view_changes.inc_by(out.view_changes as u64);

            for msg in out.messages {
                let wire = match msg {
                    ConsensusMessage::Proposal(p) => WireMessage::Proposal(p),
                    ConsensusMessage::Vote(v) => WireMessage::Vote(v),
                };
                if let Err(e) = self.network.broadcast(wire) {
                    debug!("broadcast skipped: {}", e);
                }
            }
            for t in out.timeouts {
                self.arm(t);
            }
            if let Some(block) = out.committed {
                self.apply_committed(block, true);
            }
            if out.request_proposal {
                let block = self.build_block();
                match self.engine.set_proposal_block(block) {
                    Ok(next) => pending.push(next),
                    Err(e) if e.is_fatal() => {
                        self.halt(e.to_string());
                        return;
                    }
                    Err(e) => warn!("own proposal rejected: {}", e),
                }
            }
        }
    }

    fn arm(&self, t: ScheduledTimeout) {
        let tx = self.timeout_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(t.after).await;
            let _ = tx.send(t).await;
        });
    }

    fn build_block(&self) -> Block {
        let c = &self.config.consensus;
        let state = self.store.state();
        let txs = self
            .mempool
            .select(c.max_block_txs, c.max_block_bytes, |a| state.get_nonce(a));
        let parent = self.store.latest_hash().unwrap_or_default();
        Block::new(
            self.engine.height(),
            parent,
            chrono::Utc::now().timestamp_millis(),
            txs,
            self.engine.address().to_string(),
        )
    }

    /// Persist a finalized block, prune the mempool and schedule the next
    /// height. A failed write keeps the block and retries it; the engine is
    /// not moved until the block is applied.
    fn apply_committed(&mut self, block: Block, gossip: bool) {
        if block.height <= self.store.latest_height() {
            // already taken from a peer's NewBlock
            debug!("height {} already stored", block.height);
            return;
        }
        let outcome = match self.store.commit_block(&block) {
            Ok(o) => o,
            Err(e) => {
                if e.kind() == ErrorKind::Fatal {
                    self.halt(format!("commit of height {} failed: {}", block.height, e));
                } else {
                    error!("commit of height {} failed, retrying: {}", block.height, e);
                    self.pending_commit = Some((block, gossip));
                    self.next_height_at = Some(Instant::now() + COMMIT_RETRY);
                }
                return;
            }
        };

        let removed = self
            .mempool
            .remove_committed(block.transactions.iter().map(|t| t.hash.as_str()));
        let state = self.store.state();
        let stale = self.mempool.prune_stale(|a| state.get_nonce(a));
        let failed = outcome.receipts.iter().filter(|r| !r.success).count();

        let metrics = &self.telemetry.metrics;
        metrics.record_commit(block.height, block.transactions.len());
        metrics.mempool_size.set(self.mempool.len() as i64);
        if block.proposer == self.engine.address() {
            metrics.blocks_produced.inc();
        }
        info!(
            "height {} committed: {} tx ({} failed), {} left mempool, {} stale dropped, root {}",
            block.height,
            block.transactions.len(),
            failed,
            removed,
            stale,
            outcome.state_root
        );

        if gossip {
            if let Err(e) = self.network.broadcast(WireMessage::NewBlock(block)) {
                debug!("block gossip skipped: {}", e);
            }
        }

        let now = Instant::now();
        let interval = Duration::from_millis(self.config.consensus.block_interval_ms);
        self.next_height_at = Some(match self.last_commit {
            Some(prev) => (prev + interval).max(now),
            None => now + interval,
        });
        self.last_commit = Some(now);
    }

    /// Gossip is relayed only once it was accepted here.
    fn handle_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Transaction { tx, from } => match self.admit(tx.clone()) {
                Ok(_) => self.relay(WireMessage::NewTransaction(tx), &from),
                Err(e) => debug!("gossiped transaction refused: {}", e),
            },
            NetworkEvent::Proposal { proposal, from } => {
                let result = self.engine.on_proposal(proposal.clone());
                if result.is_ok() {
                    self.relay(WireMessage::Proposal(proposal), &from);
                }
                self.drive(result);
            }
            NetworkEvent::Vote { vote, from } => {
                let result = self.engine.on_vote(vote.clone());
                if result.is_ok() {
                    self.relay(WireMessage::Vote(vote), &from);
                }
                self.drive(result);
            }
            NetworkEvent::Block { block, from } => {
                if self.catch_up(block.clone()) {
                    self.relay(WireMessage::NewBlock(block), &from);
                }
            }
            NetworkEvent::PeerConnected(peer) => {
                info!("peer {} connected ({})", peer.node_id, peer.remote_addr);
            }
            NetworkEvent::PeerDisconnected(id) => info!("peer {} disconnected", id),
        }
    }

    fn relay(&self, message: WireMessage, from: &str) {
        if let Err(e) = self.network.relay(message, from) {
            debug!("relay skipped: {}", e);
        }
    }

    /// Accept a committed block from a peer when it extends our tip and
    /// carries a valid commit certificate. Returns true when it was applied.
    fn catch_up(&mut self, block: Block) -> bool {
        if self.pending_commit.is_some() {
            return false;
        }
        let next = self.store.latest_height() + 1;
        if block.height != next {
            if block.height > next {
                debug!("ignoring block {} while at height {}", block.height, next - 1);
            }
            return false;
        }
        match self.store.latest_hash() {
            Ok(tip) if tip == block.parent_hash => {}
            _ => {
                warn!("block {} does not extend our tip", block.hash);
                return false;
            }
        }
        let (num, den) = self.engine.quorum();
        if let Err(e) = qc::verify_commit(&block, self.engine.validators(), num, den) {
            warn!("block {} from peer rejected: {}", block.hash, e);
            self.telemetry.metrics.messages_rejected.inc();
            return false;
        }
        info!("catching up to height {} from peer", block.height);
        self.apply_committed(block, false);
        if self.pending_commit.is_some() {
            return false;
        }
        self.next_height_at = Some(Instant::now());
        true
    }

    /// Mempool admission shared by the API and gossip paths.
    fn admit(&mut self, tx: Transaction) -> NodeResult<String> {
        let result = tx
            .validate()
            .map_err(NodeError::InvalidTransaction)
            .and_then(|_| {
                let nonce = self.store.state().get_nonce(&tx.from);
                self.mempool.add(tx.clone(), nonce).map_err(NodeError::from)
            });
        match result {
            Ok(admission) => {
                debug!("admitted {} ({:?})", tx.hash, admission);
                self.telemetry.metrics.mempool_size.set(self.mempool.len() as i64);
                Ok(tx.hash)
            }
            Err(e) => {
                self.telemetry.metrics.txs_rejected.inc();
                Err(e)
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SubmitTransaction { tx, reply } => {
                let result = match self.halted.clone() {
                    Some(reason) => Err(NodeError::Halted(reason)),
                    None => self.admit(tx.clone()),
                };
                if result.is_ok() {
                    if let Err(e) = self.network.broadcast(WireMessage::NewTransaction(tx)) {
                        debug!("transaction gossip skipped: {}", e);
                    }
                }
                let _ = reply.send(result);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Consensus(reply) => {
                let _ = reply.send(self.engine.state());
            }
            Command::Mempool { limit, reply } => {
                let _ = reply.send(MempoolView {
                    size: self.mempool.len(),
                    max_size: self.config.mempool.max_size,
                    per_account_cap: self.config.mempool.per_account_cap,
                    transactions: self.mempool.snapshot(limit),
                });
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.network.peers());
            }
            Command::LatestBlock(reply) => {
                let _ = reply.send(self.store.blocks().latest_block().map_err(NodeError::from));
            }
            Command::BlockAt { height, reply } => {
                let _ = reply.send(
                    self.store
                        .blocks()
                        .get_block_by_height(height)
                        .map_err(NodeError::from),
                );
            }
            Command::Validator(reply) => {
                let _ = reply.send(self.validator_status());
            }
            Command::Account { address, reply } => {
                let account = self.store.state().get_account(&address);
                let pending = self.mempool.pending_for(&address);
                let _ = reply.send(AccountView {
                    address,
                    balance: account.balance,
                    nonce: account.nonce,
                    pending,
                });
            }
            Command::LockKeystore(reply) => {
                let result = match &self.keystore {
                    Some(ks) => {
                        let mut ks = ks.lock();
                        ks.lock();
                        info!("validator keystore locked, signing paused");
                        Ok(ks.state())
                    }
                    None => Err(NodeError::Keystore(KeystoreError::NotConfigured)),
                };
                let _ = reply.send(result);
            }
            Command::Stop(_) => {}
        }
    }

    fn status(&self) -> NodeStatus {
        let metrics = &self.telemetry.metrics;
        NodeStatus {
            node_id: self.config.node_id.clone(),
            chain_id: self.config.network.chain_id.clone(),
            state: *self.state.borrow(),
            height: self.store.latest_height(),
            latest_hash: self.store.latest_hash().unwrap_or_default(),
            state_root: self.store.state().compute_state_root(),
            peers: self.network.peer_count(),
            mempool_size: self.mempool.len(),
            validator: self.engine.address().to_string(),
            is_validator: self.engine.is_validator(),
            consensus_height: self.engine.height(),
            consensus_round: self.engine.round(),
            halted: self.halted.clone(),
            uptime: metrics.uptime_secs(),
            tps: metrics.tps(),
        }
    }

    fn validator_status(&self) -> ValidatorStatus {
        let set = self.engine.validators();
        let address = self.engine.address();
        ValidatorStatus {
            address: address.to_string(),
            public_key: self.public_key.clone(),
            stake: set.stake_of(address),
            total_stake: set.total_stake(),
            is_validator: self.engine.is_validator(),
            is_current_proposer: self.engine.proposer(self.engine.round()) == Some(address),
            keystore: self.keystore.as_ref().map(|k| k.lock().state()),
            key: self.key_meta.clone(),
            blocks_produced: self.telemetry.metrics.blocks_produced.get(),
            equivocations_seen: self.engine.evidence().len(),
        }
    }

    fn housekeeping(&mut self) {
        if let Some(ks) = &self.keystore {
            ks.lock().lock_if_idle();
        }
        self.telemetry.metrics.mempool_size.set(self.mempool.len() as i64);

        let Some(retention) = self.config.storage.prune_retention else {
            return;
        };
        let every = Duration::from_secs(self.config.storage.prune_interval_secs);
        if self.last_prune.elapsed() < every {
            return;
        }
        self.last_prune = Instant::now();
        match self.store.prune(retention) {
            Ok(0) => {}
            Ok(n) => info!("pruned {} block bodies (retention {})", n, retention),
            Err(e) => warn!("pruning failed: {}", e),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
