// src/config.rs
// Node configuration: JSON file + .env + environment overrides, and the
// startup validation pass.

use anyhow::{Context, Result};
use log::{error, info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto;
use crate::keystore::{KeystoreConfig, MIN_PBKDF2_ITERATIONS};

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub log_level: String,
    pub network: NetworkConfig,
    pub consensus: ConsensusConfig,
    pub storage: StorageConfig,
    pub keystore: KeystoreSection,
    pub rate_limit: RateLimitConfig,
    pub api: ApiConfig,
    pub mempool: MempoolConfig,
    pub genesis: GenesisConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_addr: String,
    /// Address advertised to peers in gossip; defaults to `listen_addr`.
    pub public_addr: Option<String>,
    pub bootstrap_peers: Vec<String>,
    pub chain_id: String,
    pub network_id: String,
    pub min_peers: usize,
    pub max_peers: usize,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// How long `start()` waits for `min_peers` before giving up.
    pub peer_wait_timeout_ms: u64,
    /// Enter Running without `min_peers` once the wait times out.
    pub proceed_alone: bool,
    pub max_clock_drift_secs: i64,
    pub nonce_window_secs: u64,
    pub challenge_expiry_secs: u64,
    pub max_frame_bytes: usize,
    pub maintenance_interval_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ConsensusConfig {
    pub propose_timeout_ms: u64,
    pub prevote_timeout_ms: u64,
    pub precommit_timeout_ms: u64,
    /// Added to every phase timeout per round already spent at a height.
    pub timeout_delta_ms: u64,
    pub max_rounds_per_height: u32,
    pub quorum_numerator: u64,
    pub quorum_denominator: u64,
    /// Minimum spacing between committed blocks.
    pub block_interval_ms: u64,
    pub max_block_txs: usize,
    pub max_block_bytes: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Blocks behind the tip whose bodies are kept. `None` disables pruning.
    pub prune_retention: Option<u64>,
    pub prune_interval_secs: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct KeystoreSection {
    pub path: PathBuf,
    /// Normally supplied through `KEYSTORE_PASSWORD`, never written back out.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Key used as the validator identity; first active key when unset.
    pub key_id: Option<String>,
    pub iterations: u32,
    pub max_failed_attempts: u32,
    pub auto_lock_secs: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub burst: f64,
    /// Reputation regained per second, toward 1.0.
    pub reputation_recovery_per_sec: f64,
    pub violation_penalty: f64,
    /// Aggregate checks per one-second window that trip the breaker.
    pub breaker_threshold: u64,
    pub breaker_cooldown_ms: u64,
    /// Idle buckets older than this are dropped by `cleanup`.
    pub idle_ttl_secs: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub addr: String,
    /// Empty list disables authentication on protected routes.
    pub api_keys: Vec<String>,
    pub max_requests: u32,
    pub window_secs: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct MempoolConfig {
    pub max_size: usize,
    pub per_account_cap: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct GenesisConfig {
    pub balances: BTreeMap<String, u64>,
    pub validators: Vec<GenesisValidator>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenesisValidator {
    pub address: String,
    pub public_key: String,
    pub stake: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            log_level: "info".to_string(),
            network: NetworkConfig::default(),
            consensus: ConsensusConfig::default(),
            storage: StorageConfig::default(),
            keystore: KeystoreSection::default(),
            rate_limit: RateLimitConfig::default(),
            api: ApiConfig::default(),
            mempool: MempoolConfig::default(),
            genesis: GenesisConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".to_string(),
            public_addr: None,
            bootstrap_peers: vec![],
            chain_id: "ouro-devnet".to_string(),
            network_id: "devnet".to_string(),
            min_peers: 0,
            max_peers: 32,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
            peer_wait_timeout_ms: 30_000,
            proceed_alone: true,
            max_clock_drift_secs: 30,
            nonce_window_secs: 300,
            challenge_expiry_secs: 30,
            max_frame_bytes: 4 * 1024 * 1024,
            maintenance_interval_ms: 5_000,
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            propose_timeout_ms: 3_000,
            prevote_timeout_ms: 1_000,
            precommit_timeout_ms: 1_000,
            timeout_delta_ms: 500,
            max_rounds_per_height: 10,
            quorum_numerator: 2,
            quorum_denominator: 3,
            block_interval_ms: 1_000,
            max_block_txs: 500,
            max_block_bytes: 1024 * 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            prune_retention: None,
            prune_interval_secs: 600,
        }
    }
}

impl Default for KeystoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./keystore/validator.keystore"),
            password: None,
            key_id: None,
            iterations: crate::keystore::DEFAULT_PBKDF2_ITERATIONS,
            max_failed_attempts: 5,
            auto_lock_secs: 300,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_per_sec: 50.0,
            burst: 20.0,
            reputation_recovery_per_sec: 0.01,
            violation_penalty: 0.2,
            breaker_threshold: 10_000,
            breaker_cooldown_ms: 5_000,
            idle_ttl_secs: 600,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: "127.0.0.1:8000".to_string(),
            api_keys: vec![],
            max_requests: 120,
            window_secs: 60,
        }
    }
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            per_account_cap: 64,
        }
    }
}

impl KeystoreSection {
    pub fn to_keystore_config(&self) -> KeystoreConfig {
        KeystoreConfig {
            path: self.path.clone(),
            iterations: self.iterations,
            max_failed_attempts: self.max_failed_attempts,
            auto_lock: std::time::Duration::from_secs(self.auto_lock_secs),
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

impl NodeConfig {
    /// Config file (if any) -> `.env` -> process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let json = fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                serde_json::from_str::<NodeConfig>(&json)
                    .with_context(|| format!("parsing config {}", p.display()))?
            }
            None => Self::default(),
        };
        dotenvy::dotenv().ok();
        config.apply_overrides(|k| std::env::var(k).ok());
        Ok(config)
    }

    /// Apply `KEY=value` overrides from `lookup`. Unparseable numbers are
    /// ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NODE_ID") {
            self.node_id = v;
        }
        if let Some(v) = lookup("CHAIN_ID") {
            self.network.chain_id = v;
        }
        if let Some(v) = lookup("DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("KEYSTORE_PATH") {
            self.keystore.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("KEYSTORE_PASSWORD") {
            self.keystore.password = Some(v);
        }
        if let Some(v) = lookup("API_ADDR") {
            self.api.addr = v;
        }
        if let Some(v) = lookup("LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = lookup("BOOTSTRAP_PEERS") {
            self.network.bootstrap_peers = split_list(&v);
        }
        if let Some(v) = lookup("API_KEYS") {
            self.api.api_keys = split_list(&v);
        }
        if let Some(v) = lookup("RATE_LIMIT_MAX_REQUESTS") {
            match v.parse() {
                Ok(n) => self.api.max_requests = n,
                Err(_) => warn!("ignoring RATE_LIMIT_MAX_REQUESTS={}: not a number", v),
            }
        }
        if let Some(v) = lookup("RATE_LIMIT_WINDOW_SECS") {
            match v.parse() {
                Ok(n) => self.api.window_secs = n,
                Err(_) => warn!("ignoring RATE_LIMIT_WINDOW_SECS={}: not a number", v),
            }
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v;
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing config {}", path.display()))?;
        // API keys live in here
        crypto::set_restrictive_permissions(path);
        Ok(())
    }

    /// Default config with a freshly generated API key, for `init-config`.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let mut config = Self::default();
        config.api.api_keys = vec![hex::encode(key)];
        config
    }

    /// Copy safe to hand out over the API.
    pub fn redacted(&self) -> Self {
        let mut c = self.clone();
        c.api.api_keys = c.api.api_keys.iter().map(|_| "***".to_string()).collect();
        c.keystore.password = None;
        c
    }

    /// Address peers should dial to reach this node.
    pub fn advertised_addr(&self) -> String {
        self.network
            .public_addr
            .clone()
            .unwrap_or_else(|| self.network.listen_addr.clone())
    }
}

/// Validation result for configuration checks
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        if !self.warnings.is_empty() {
            warn!("Configuration warnings:");
            for w in &self.warnings {
                warn!(" - {}", w);
            }
        }

        if !self.errors.is_empty() {
            error!("Configuration errors:");
            for e in &self.errors {
                error!(" - {}", e);
            }
        }

        if self.valid && self.warnings.is_empty() {
            info!("Configuration validation passed");
        }
    }
}

/// Validate all critical configuration at startup
pub fn validate(config: &NodeConfig) -> ConfigValidation {
    let mut validation = ConfigValidation::new();

    validate_network(config, &mut validation);
    validate_consensus(config, &mut validation);
    validate_storage(config, &mut validation);
    validate_keystore(config, &mut validation);
    validate_api_keys(config, &mut validation);
    validate_genesis(config, &mut validation);

    validation
}

fn validate_network(config: &NodeConfig, validation: &mut ConfigValidation) {
    let net = &config.network;
    if net.listen_addr.parse::<std::net::SocketAddr>().is_err() {
        validation.add_error(format!("network.listen_addr '{}' is not host:port", net.listen_addr));
    }
    if net.min_peers > net.max_peers {
        validation.add_error(format!(
            "network.min_peers ({}) exceeds network.max_peers ({})",
            net.min_peers, net.max_peers
        ));
    }
    if net.chain_id.is_empty() || net.network_id.is_empty() {
        validation.add_error("network.chain_id and network.network_id must be set".into());
    }
    if net.min_peers > 0 && net.bootstrap_peers.is_empty() {
        validation.add_warning(format!(
            "network.min_peers is {} but no bootstrap peers are configured",
            net.min_peers
        ));
    }
    if net.max_clock_drift_secs <= 0 {
        validation.add_error("network.max_clock_drift_secs must be positive".into());
    }
}

fn validate_consensus(config: &NodeConfig, validation: &mut ConfigValidation) {
    let c = &config.consensus;
    if c.quorum_denominator == 0 || c.quorum_numerator > c.quorum_denominator {
        validation.add_error(format!(
            "invalid quorum {}/{}",
            c.quorum_numerator, c.quorum_denominator
        ));
    } else if 3 * c.quorum_numerator < 2 * c.quorum_denominator {
        validation.add_error(format!(
            "quorum {}/{} is below 2/3 and unsafe under byzantine faults",
            c.quorum_numerator, c.quorum_denominator
        ));
    }
    if c.max_rounds_per_height == 0 {
        validation.add_error("consensus.max_rounds_per_height must be at least 1".into());
    }
    if c.max_block_txs == 0 {
        validation.add_error("consensus.max_block_txs must be at least 1".into());
    }
    if c.propose_timeout_ms == 0 || c.prevote_timeout_ms == 0 || c.precommit_timeout_ms == 0 {
        validation.add_error("consensus phase timeouts must be non-zero".into());
    }
}

fn validate_storage(config: &NodeConfig, validation: &mut ConfigValidation) {
    let dir = &config.storage.data_dir;
    if !dir.exists() {
        if let Err(e) = fs::create_dir_all(dir) {
            validation.add_error(format!("Cannot create data directory '{}': {}", dir.display(), e));
        } else {
            info!("Created data directory: {}", dir.display());
        }
    }
    match config.storage.prune_retention {
        None => info!("Block pruning disabled"),
        Some(r) if r < 16 => validation.add_warning(format!(
            "storage.prune_retention {} is very small; peers cannot sync old blocks from this node",
            r
        )),
        Some(_) => {}
    }
}

fn validate_keystore(config: &NodeConfig, validation: &mut ConfigValidation) {
    let ks = &config.keystore;
    if ks.iterations < MIN_PBKDF2_ITERATIONS {
        validation.add_error(format!(
            "keystore.iterations {} below minimum {}",
            ks.iterations, MIN_PBKDF2_ITERATIONS
        ));
    }
    if ks.max_failed_attempts == 0 {
        validation.add_error("keystore.max_failed_attempts must be at least 1".into());
    }
    if ks.password.is_none() {
        validation.add_warning("KEYSTORE_PASSWORD not set; keystore cannot be unlocked".into());
    }
}

fn validate_api_keys(config: &NodeConfig, validation: &mut ConfigValidation) {
    let keys = &config.api.api_keys;
    if keys.is_empty() {
        validation.add_warning("API_KEYS not set - protected routes run without authentication".into());
        return;
    }
    info!("API authentication enabled ({} key(s))", keys.len());
    for (i, key) in keys.iter().enumerate() {
        if key.len() < 32 {
            validation.add_warning(format!(
                "API key #{} is too short ({} chars) - recommend at least 32 characters",
                i + 1,
                key.len()
            ));
        }
        let lower = key.to_lowercase();
        if lower == "password" || lower == "secret" || key == "12345" || lower == "test" {
            validation.add_error(format!("API key #{} is a common/weak value", i + 1));
        }
    }
    if config.api.max_requests == 0 || config.api.window_secs == 0 {
        validation.add_error("api.max_requests and api.window_secs must be non-zero".into());
    }
}

fn validate_genesis(config: &NodeConfig, validation: &mut ConfigValidation) {
    let g = &config.genesis;
    if g.validators.is_empty() {
        validation.add_warning(
            "genesis.validators is empty - node will run as the sole validator".into(),
        );
    }
    for v in &g.validators {
        if v.stake == 0 {
            validation.add_error(format!("validator {} has zero stake", v.address));
        }
        match hex::decode(&v.public_key) {
            Ok(pk) if crypto::address_from_pubkey(&pk) == v.address => {}
            _ => validation.add_error(format!(
                "validator {} public key does not derive its address",
                v.address
            )),
        }
    }
    for addr in g.balances.keys() {
        if !crypto::is_valid_address(addr) {
            validation.add_error(format!("genesis balance for malformed address '{}'", addr));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn base(dir: &Path) -> NodeConfig {
        let mut c = NodeConfig::generate();
        c.storage.data_dir = dir.join("data");
        c.keystore.password = Some("pw".into());
        c
    }

    #[test]
    fn generated_config_is_valid() {
        let dir = tempdir().unwrap();
        let v = validate(&base(dir.path()));
        assert!(v.valid, "{:?}", v.errors);
    }

    #[test]
    fn rejects_unsafe_quorum_and_peer_bounds() {
        let dir = tempdir().unwrap();
        let mut c = base(dir.path());
        c.consensus.quorum_numerator = 1;
        c.consensus.quorum_denominator = 2;
        c.network.min_peers = 10;
        c.network.max_peers = 4;
        let v = validate(&c);
        assert!(!v.valid);
        assert_eq!(v.errors.len(), 2);
    }

    #[test]
    fn genesis_validator_must_derive_address() {
        let dir = tempdir().unwrap();
        let mut c = base(dir.path());
        let sk = crypto::keys::signing_key_from_seed(&[3u8; 32]);
        c.genesis.validators.push(GenesisValidator {
            address: crypto::address_of(&sk),
            public_key: crypto::pubkey_hex(&sk),
            stake: 10,
        });
        assert!(validate(&c).valid);

        c.genesis.validators[0].address = "0x0000000000000000000000000000000000000001".into();
        assert!(!validate(&c).valid);
    }

    #[test]
    fn overrides_apply() {
        let mut env = HashMap::new();
        env.insert("CHAIN_ID", "mainnet-x");
        env.insert("API_KEYS", "a, b,,c");
        env.insert("RATE_LIMIT_MAX_REQUESTS", "7");
        env.insert("RATE_LIMIT_WINDOW_SECS", "nope");
        let mut c = NodeConfig::default();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.network.chain_id, "mainnet-x");
        assert_eq!(c.api.api_keys, vec!["a", "b", "c"]);
        assert_eq!(c.api.max_requests, 7);
        assert_eq!(c.api.window_secs, 60);
    }

    #[test]
    fn save_load_and_redaction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");
        let mut c = base(dir.path());
        c.storage.prune_retention = Some(100);
        c.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("\"password\""));
        let loaded: NodeConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(loaded.storage.prune_retention, Some(100));
        assert_eq!(loaded.node_id, c.node_id);

        let r = c.redacted();
        assert_eq!(r.api.api_keys, vec!["***"]);
        assert!(r.keystore.password.is_none());
    }
}
