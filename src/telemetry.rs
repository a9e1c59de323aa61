// src/telemetry.rs
// Metrics and logging setup. Each node owns its own registry; subsystems get
// a `Telemetry` handle at construction instead of reaching for a global.

use parking_lot::Mutex;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Rolling window for TPS
const TPS_WINDOW: Duration = Duration::from_secs(60);
const MAX_TRACKED_TX: usize = 100_000;

pub struct NodeMetrics {
    registry: Registry,
    pub blocks_produced: IntCounter,
    pub blocks_committed: IntCounter,
    pub txs_committed: IntCounter,
    pub txs_rejected: IntCounter,
    pub consensus_rounds: IntCounter,
    pub view_changes: IntCounter,
    pub messages_rejected: IntCounter,
    pub http_requests: IntCounter,
    pub http_errors: IntCounter,
    pub peers: IntGauge,
    pub height: IntGauge,
    pub mempool_size: IntGauge,
    uptime: IntGauge,
    // (commit time, tx count) per committed block
    tx_window: Mutex<VecDeque<(Instant, u64)>>,
    start_time: Instant,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl NodeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("ouro".to_string()), None)?;
        Ok(Self {
            blocks_produced: counter(&registry, "blocks_produced_total", "Blocks proposed by this node and committed")?,
            blocks_committed: counter(&registry, "blocks_committed_total", "Blocks committed")?,
            txs_committed: counter(&registry, "transactions_committed_total", "Transactions included in committed blocks")?,
            txs_rejected: counter(&registry, "transactions_rejected_total", "Transactions refused at admission")?,
            consensus_rounds: counter(&registry, "consensus_rounds_total", "Consensus rounds started")?,
            view_changes: counter(&registry, "view_changes_total", "Rounds abandoned on timeout")?,
            messages_rejected: counter(&registry, "p2p_messages_rejected_total", "Inbound P2P messages dropped by auth or rate limiting")?,
            http_requests: counter(&registry, "http_requests_total", "HTTP requests served")?,
            http_errors: counter(&registry, "http_errors_total", "HTTP responses with status >= 400")?,
            peers: gauge(&registry, "peers", "Authenticated peers")?,
            height: gauge(&registry, "chain_height", "Latest committed height")?,
            mempool_size: gauge(&registry, "mempool_size", "Pending transactions")?,
            uptime: gauge(&registry, "uptime_seconds", "Seconds since start")?,
            registry,
            tx_window: Mutex::new(VecDeque::new()),
            start_time: Instant::now(),
        })
    }

    /// Record a committed block carrying `tx_count` transactions.
    pub fn record_commit(&self, height: u64, tx_count: usize) {
        self.record_commit_at(Instant::now(), height, tx_count)
    }

    pub fn record_commit_at(&self, now: Instant, height: u64, tx_count: usize) {
        self.blocks_committed.inc();
        self.txs_committed.inc_by(tx_count as u64);
        self.height.set(height as i64);

        let mut window = self.tx_window.lock();
        window.push_back((now, tx_count as u64));
        while let Some(&(t, _)) = window.front() {
            if now.saturating_duration_since(t) > TPS_WINDOW || window.len() > MAX_TRACKED_TX {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Transactions per second over the trailing minute, as of `now`.
    pub fn tps_at(&self, now: Instant) -> f64 {
        let window = self.tx_window.lock();
        let total: u64 = window
            .iter()
            .filter(|(t, _)| now.saturating_duration_since(*t) <= TPS_WINDOW)
            .map(|(_, n)| *n)
            .sum();
        total as f64 / TPS_WINDOW.as_secs_f64()
    }

    pub fn tps(&self) -> f64 {
        self.tps_at(Instant::now())
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics as JSON for the dashboard
    pub fn export_json(&self) -> serde_json::Value {
        serde_json::json!({
            "blocksProduced": self.blocks_produced.get(),
            "blocksCommitted": self.blocks_committed.get(),
            "transactionsCommitted": self.txs_committed.get(),
            "transactionsRejected": self.txs_rejected.get(),
            "consensusRounds": self.consensus_rounds.get(),
            "viewChanges": self.view_changes.get(),
            "messagesRejected": self.messages_rejected.get(),
            "httpRequests": self.http_requests.get(),
            "httpErrors": self.http_errors.get(),
            "peers": self.peers.get(),
            "height": self.height.get(),
            "mempoolSize": self.mempool_size.get(),
            "tps": self.tps(),
            "uptime": self.uptime_secs(),
        })
    }

    pub fn export_prometheus(&self) -> String {
        self.uptime.set(self.uptime_secs() as i64);
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            log::warn!("failed to encode metrics: {}", e);
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

/// Handle passed to every subsystem: who we are plus where metrics go.
#[derive(Clone)]
pub struct Telemetry {
    pub node_id: Arc<str>,
    pub metrics: Arc<NodeMetrics>,
}

impl Telemetry {
    pub fn new(node_id: &str) -> Result<Self, prometheus::Error> {
        Ok(Self {
            node_id: Arc::from(node_id),
            metrics: Arc::new(NodeMetrics::new()?),
        })
    }

    /// Span tagging everything logged under it with this node's id.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("node", id = %self.node_id)
    }
}

/// Install the process-wide log sink. `log` records are bridged into the same
/// subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing log subscriber: {}", e))
}
