// src/storage/chain_store.rs
// Block log + account state + commit WAL behind one commit path.
//
// Commit order: WAL append (fsync) -> block store -> state apply on a copy ->
// snapshot -> swap in the copy -> WAL truncate. The live state only moves
// once its snapshot is on disk. On open, any block the snapshot has not seen
// is replayed from the block store, and a WAL block at tip+1 is persisted
// and applied.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{BlockStore, CommitLog, StateStore, StoreError, WalRecord};
use crate::chain::{Block, TxExecutor};

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub hash: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    pub height: u64,
    pub hash: String,
    pub state_root: String,
    pub receipts: Vec<TxReceipt>,
}

pub struct ChainStore {
    blocks: BlockStore,
    state: StateStore,
    wal: CommitLog,
    snapshot_path: PathBuf,
    executor: Arc<dyn TxExecutor>,
}

impl ChainStore {
    /// Open (or initialize) the chain under `data_dir` and recover any commit
    /// interrupted by a crash.
    pub fn open(
        data_dir: &Path,
        chain_id: &str,
        genesis_alloc: &BTreeMap<String, u64>,
        executor: Arc<dyn TxExecutor>,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("chain");
        let blocks = BlockStore::open(&db_path.to_string_lossy())?;
        let snapshot_path = data_dir.join("state.snapshot.json");
        let wal = CommitLog::open(&data_dir.join("commit.wal"))?;

        let genesis = Block::genesis(chain_id);
        let snapshot = StateStore::load_snapshot(&snapshot_path)?;
        let state = match (blocks.is_empty(), snapshot) {
            (true, Some(_)) => {
                return Err(StoreError::Corrupt(
                    "state snapshot present but block store is empty".into(),
                ))
            }
            (true, None) => {
                blocks.put_block(&genesis)?;
                let mut s = StateStore::with_allocations(genesis_alloc.iter());
                s.set_applied_height(0);
                s
            }
            (false, snapshot) => {
                let stored = blocks.block_hash_at(0)?;
                if stored.as_deref() != Some(genesis.hash.as_str()) {
                    return Err(StoreError::Corrupt(format!(
                        "genesis mismatch for chain '{}': stored {:?}, expected {}",
                        chain_id, stored, genesis.hash
                    )));
                }
                snapshot.unwrap_or_else(|| {
                    let mut s = StateStore::with_allocations(genesis_alloc.iter());
                    s.set_applied_height(0);
                    s
                })
            }
        };

        let mut store = Self {
            blocks,
            state,
            wal,
            snapshot_path,
            executor,
        };
        let recovered = store.recover()?;
        if recovered > 0 {
            log::warn!("recovered {} block(s) after unclean shutdown", recovered);
        }
        Ok(store)
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Highest block that is both stored and applied to state.
    pub fn latest_height(&self) -> u64 {
        self.state.applied_height().unwrap_or(0)
    }

    pub fn latest_hash(&self) -> Result<String, StoreError> {
        let h = self.latest_height();
        self.blocks
            .block_hash_at(h)?
            .ok_or_else(|| StoreError::Corrupt(format!("no hash index at tip {}", h)))
    }

    fn recover(&mut self) -> Result<usize, StoreError> {
        let mut recovered = 0usize;
        let applied = self.state.applied_height().unwrap_or(0);
        if let Some(latest) = self.blocks.latest_height() {
            for h in (applied + 1)..=latest {
                let block = match self.blocks.get_block_by_height(h) {
                    Ok(Some(b)) => b,
                    Ok(None) | Err(StoreError::Pruned(_)) => {
                        return Err(StoreError::Corrupt(format!(
                            "cannot replay height {}: body unavailable",
                            h
                        )))
                    }
                    Err(e) => return Err(e),
                };
                execute_block(&*self.executor, &mut self.state, &block);
                recovered += 1;
            }
        }

        for record in self.wal.read_all()? {
            let WalRecord::Commit { block } = record;
            if block.height == self.blocks.next_height() {
                self.blocks.put_block(&block)?;
                execute_block(&*self.executor, &mut self.state, &block);
                recovered += 1;
            }
        }

        if recovered > 0 || !self.wal.is_empty()? {
            self.state.save_snapshot(&self.snapshot_path)?;
            self.wal.truncate()?;
        }
        Ok(recovered)
    }

    /// Persist and apply a finalized block. Blocks are applied strictly in
    /// height order and never twice. A failed commit leaves state untouched
    /// and can be retried with the same block.
    pub fn commit_block(&mut self, block: &Block) -> Result<CommitOutcome, StoreError> {
        let expected = self.latest_height() + 1;
        if block.height != expected {
            return Err(StoreError::NonSequentialHeight {
                expected,
                got: block.height,
            });
        }
        if !block.is_well_formed() {
            return Err(StoreError::MalformedBlock(block.height));
        }

        if self.blocks.next_height() > block.height {
            // stored by an earlier attempt that failed later on
            let stored = self.blocks.block_hash_at(block.height)?;
            if stored.as_deref() != Some(block.hash.as_str()) {
                return Err(StoreError::Corrupt(format!(
                    "height {} already holds block {:?}, not {}",
                    block.height, stored, block.hash
                )));
            }
        } else {
            self.wal.append(&WalRecord::Commit {
                block: block.clone(),
            })?;
            if let Err(e) = self.blocks.put_block(block) {
                self.wal.truncate()?;
                return Err(e);
            }
        }

        let mut next = self.state.clone();
        let receipts = execute_block(&*self.executor, &mut next, block);
        next.save_snapshot(&self.snapshot_path)?;
        self.state = next;
        if let Err(e) = self.wal.truncate() {
            // recovery skips a WAL block that is already stored
            log::warn!("commit log truncate after height {} failed: {}", block.height, e);
        }

        Ok(CommitOutcome {
            height: block.height,
            hash: block.hash.clone(),
            state_root: self.state.compute_state_root(),
            receipts,
        })
    }

    /// Drop block bodies more than `retention` blocks behind the applied
    /// tip. Bodies above it stay, recovery replays them.
    pub fn prune(&self, retention: u64) -> Result<usize, StoreError> {
        self.blocks
            .prune_below(self.latest_height().saturating_sub(retention))
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.blocks.flush()?;
        self.state.save_snapshot(&self.snapshot_path)
    }
}

fn execute_block(executor: &dyn TxExecutor, state: &mut StateStore, block: &Block) -> Vec<TxReceipt> {
    let mut receipts = Vec::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        let result = tx.validate().and_then(|_| executor.apply(state, tx));
        if let Err(e) = &result {
            log::debug!("tx {} failed at height {}: {}", tx.hash, block.height, e);
        }
        receipts.push(TxReceipt {
            hash: tx.hash.clone(),
            success: result.is_ok(),
            error: result.err(),
        });
    }
    state.set_applied_height(block.height);
    receipts
}
