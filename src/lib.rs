// BFT validator node: keystore-backed identity, authenticated P2P gossip,
// Tendermint-style consensus over a stake-weighted validator set, and an
// HTTP surface for operators.

pub mod api;
pub mod bft;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod mempool;
pub mod network;
pub mod node;
pub mod storage;
pub mod telemetry;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::NodeConfig;
use crate::keystore::{Keystore, KeystoreConfig};
use crate::node::ValidatorNode;
use crate::telemetry::Telemetry;

pub use crate::error::{ErrorKind, NodeError, NodeResult};
pub use crate::node::{NodeHandle, NodeState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the validator node
    Start {
        /// JSON config file; defaults plus environment overrides when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Log filter, e.g. `info` or `ouro_validator=debug`
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Create a keystore with one validator key and print its address.
    /// The password is read from KEYSTORE_PASSWORD.
    Keygen {
        #[arg(long)]
        keystore: PathBuf,
        /// PBKDF2 iterations (minimum 100000)
        #[arg(long, default_value_t = keystore::DEFAULT_PBKDF2_ITERATIONS)]
        iterations: u32,
    },
    /// Write a default config with a freshly generated API key
    InitConfig {
        #[arg(long, default_value = "config.json")]
        out: PathBuf,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start { config, log_level } => start(config, log_level).await,
        Commands::Keygen {
            keystore,
            iterations,
        } => keygen(keystore, iterations).await,
        Commands::InitConfig { out } => {
            if out.exists() {
                bail!("{} already exists", out.display());
            }
            let config = NodeConfig::generate();
            config.save(&out)?;
            println!("wrote {}", out.display());
            println!("node id: {}", config.node_id);
            println!("an API key was generated; it is stored in the file only");
            Ok(())
        }
    }
}

async fn start(path: Option<PathBuf>, log_level: Option<String>) -> anyhow::Result<()> {
    let mut config = NodeConfig::load(path.as_deref())?;
    if let Some(level) = log_level {
        config.log_level = level;
    }
    telemetry::init_logging(&config.log_level)?;

    let telemetry = Telemetry::new(&config.node_id).context("creating metrics registry")?;
    let api_config = config.api.clone();
    let handle = ValidatorNode::new(config, telemetry).start().await?;

    let api_task = if api_config.enabled {
        let addr: SocketAddr = api_config
            .addr
            .parse()
            .with_context(|| format!("invalid api.addr '{}'", api_config.addr))?;
        let node = handle.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(node.clone(), addr).await {
                log::error!("api server on {} failed: {}", addr, e);
                node.stop().await;
            }
        }))
    } else {
        log::info!("http api disabled");
        None
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupt received, shutting down");
            handle.stop().await;
        }
        _ = handle.stopped() => {}
    }

    if let Some(task) = api_task {
        if let Err(e) = task.await {
            log::warn!("api task ended abnormally: {}", e);
        }
    }
    Ok(())
}

async fn keygen(path: PathBuf, iterations: u32) -> anyhow::Result<()> {
    let password = std::env::var("KEYSTORE_PASSWORD")
        .context("KEYSTORE_PASSWORD must be set to encrypt the keystore")?;
    let meta = tokio::task::spawn_blocking(move || {
        let mut config = KeystoreConfig::new(path);
        config.iterations = iterations;
        let mut ks = Keystore::create(config, &password)?;
        let meta = ks.generate_key()?;
        ks.lock();
        Ok::<_, keystore::KeystoreError>(meta)
    })
    .await
    .context("keystore task panicked")??;

    println!("key id:     {}", meta.key_id);
    println!("address:    {}", meta.address);
    println!("public key: {}", meta.public_key);
    Ok(())
}
