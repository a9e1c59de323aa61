// src/storage/block_store.rs
// Append-only block log with height, hash and transaction indexes.
//
// Key layout:
//   block:<height>        -> Block (body, removable by pruning)
//   idx:height:<height>   -> block hash
//   idx:hash:<hash>       -> height
//   idx:tx:<tx hash>      -> height
//   meta:latest           -> u64 LE
//   meta:pruned_below     -> u64 LE

use parking_lot::Mutex;
use rocksdb::WriteBatch;

use super::{batch_put, exists, get, get_counter, open_db, RocksDb, StoreError};
use crate::chain::Block;

const META_LATEST: &str = "meta:latest";
const META_PRUNED_BELOW: &str = "meta:pruned_below";

fn body_key(height: u64) -> String {
    // zero padded so prefix iteration follows height order
    format!("block:{:020}", height)
}

fn height_key(height: u64) -> String {
    format!("idx:height:{:020}", height)
}

fn hash_key(hash: &str) -> String {
    format!("idx:hash:{}", hash)
}

fn tx_key(tx_hash: &str) -> String {
    format!("idx:tx:{}", tx_hash)
}

pub struct BlockStore {
    db: RocksDb,
    /// Serializes writers and caches the latest height.
    latest: Mutex<Option<u64>>,
}

impl BlockStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = open_db(path)?;
        Self::with_db(db)
    }

    pub fn with_db(db: RocksDb) -> Result<Self, StoreError> {
        let latest = get_counter(&db, META_LATEST)?;
        Ok(Self {
            db,
            latest: Mutex::new(latest),
        })
    }

    pub fn latest_height(&self) -> Option<u64> {
        *self.latest.lock()
    }

    pub fn is_empty(&self) -> bool {
        self.latest_height().is_none()
    }

    /// Height the next `put_block` must carry.
    pub fn next_height(&self) -> u64 {
        self.latest_height().map(|h| h + 1).unwrap_or(0)
    }

    /// Append a block. Fails without touching the store unless the block is
    /// well formed, sits at exactly latest+1 and links to the latest hash.
    pub fn put_block(&self, block: &Block) -> Result<(), StoreError> {
        let mut latest = self.latest.lock();
        let expected = latest.map(|h| h + 1).unwrap_or(0);
        if block.height != expected {
            return Err(StoreError::NonSequentialHeight {
                expected,
                got: block.height,
            });
        }
        if exists(&self.db, height_key(block.height))? {
            return Err(StoreError::HeightExists(block.height));
        }
        if exists(&self.db, hash_key(&block.hash))? {
            return Err(StoreError::HashExists(block.hash.clone()));
        }
        if !block.is_well_formed() {
            return Err(StoreError::MalformedBlock(block.height));
        }
        if let Some(prev) = *latest {
            let parent = self.block_hash_at(prev)?.ok_or_else(|| {
                StoreError::Corrupt(format!("missing hash index for height {}", prev))
            })?;
            if parent != block.parent_hash {
                return Err(StoreError::ParentMismatch {
                    height: block.height,
                    expected: parent,
                    got: block.parent_hash.clone(),
                });
            }
        }

        let mut batch = WriteBatch::default();
        batch_put(&mut batch, body_key(block.height), block)?;
        batch_put(&mut batch, height_key(block.height), &block.hash)?;
        batch_put(&mut batch, hash_key(&block.hash), &block.height)?;
        for tx in &block.transactions {
            // first inclusion wins; a replayed tx never moves its index
            if !exists(&self.db, tx_key(&tx.hash))? {
                batch_put(&mut batch, tx_key(&tx.hash), &block.height)?;
            }
        }
        batch.put(META_LATEST.as_bytes(), block.height.to_le_bytes());
        self.db.write(batch)?;

        *latest = Some(block.height);
        log::debug!("stored block {} ({})", block.height, block.hash);
        Ok(())
    }

    /// Full block at `height`. `Ok(None)` above the tip, `Err(Pruned)` when
    /// only the index survives.
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        match self.latest_height() {
            Some(latest) if height <= latest => {}
            _ => return Ok(None),
        }
        match get::<_, Block>(&self.db, body_key(height))? {
            Some(b) => Ok(Some(b)),
            None if exists(&self.db, height_key(height))? => Err(StoreError::Pruned(height)),
            None => Err(StoreError::Corrupt(format!(
                "height {} below tip has neither body nor index",
                height
            ))),
        }
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, StoreError> {
        match self.height_of(hash)? {
            Some(h) => self.get_block_by_height(h),
            None => Ok(None),
        }
    }

    /// Block that included `tx_hash`.
    pub fn get_block_by_tx(&self, tx_hash: &str) -> Result<Option<Block>, StoreError> {
        match get::<_, u64>(&self.db, tx_key(tx_hash))? {
            Some(h) => self.get_block_by_height(h),
            None => Ok(None),
        }
    }

    pub fn tx_height(&self, tx_hash: &str) -> Result<Option<u64>, StoreError> {
        get(&self.db, tx_key(tx_hash))
    }

    /// Hash index lookup; still answers after the body was pruned.
    pub fn block_hash_at(&self, height: u64) -> Result<Option<String>, StoreError> {
        get(&self.db, height_key(height))
    }

    pub fn height_of(&self, hash: &str) -> Result<Option<u64>, StoreError> {
        get(&self.db, hash_key(hash))
    }

    pub fn latest_block(&self) -> Result<Option<Block>, StoreError> {
        match self.latest_height() {
            Some(h) => self.get_block_by_height(h),
            None => Ok(None),
        }
    }

    /// Lazy ordered walk over `from..=to`, clamped to the tip. Each item is
    /// loaded only when the iterator reaches it.
    pub fn get_blocks_by_range(
        &self,
        from: u64,
        to: u64,
    ) -> impl Iterator<Item = Result<Block, StoreError>> + '_ {
        let end = match self.latest_height() {
            Some(latest) => to.min(latest),
            None => 0,
        };
        let empty = self.is_empty() || from > end;
        let range = if empty { 1..=0 } else { from..=end };
        range.filter_map(move |h| self.get_block_by_height(h).transpose())
    }

    pub fn pruned_below(&self) -> Result<u64, StoreError> {
        Ok(get_counter(&self.db, META_PRUNED_BELOW)?.unwrap_or(0))
    }

    /// Drop bodies more than `retention` blocks behind the tip. Index entries
    /// stay so hash and height lookups keep working. Returns bodies removed.
    pub fn prune(&self, retention: u64) -> Result<usize, StoreError> {
        match self.latest_height() {
            Some(latest) => self.prune_below(latest.saturating_sub(retention)),
            None => Ok(0),
        }
    }

    /// Drop every body below `cutoff`, never the tip's.
    pub fn prune_below(&self, cutoff: u64) -> Result<usize, StoreError> {
        let guard = self.latest.lock();
        let latest = match *guard {
            Some(h) => h,
            None => return Ok(0),
        };
        let cutoff = cutoff.min(latest);
        let start = self.pruned_below()?;
        if cutoff <= start {
            return Ok(0);
        }

        let mut batch = WriteBatch::default();
        let mut removed = 0usize;
        for h in start..cutoff {
            if exists(&self.db, body_key(h))? {
                batch.delete(body_key(h).as_bytes());
                removed += 1;
            }
        }
        batch.put(META_PRUNED_BELOW.as_bytes(), cutoff.to_le_bytes());
        self.db.write(batch)?;
        log::info!("pruned {} block bodies below height {}", removed, cutoff);
        Ok(removed)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
