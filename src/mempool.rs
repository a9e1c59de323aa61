// src/mempool.rs
// Pending-transaction pool. Owned by the node actor, so no interior locking:
// admission and post-commit removal are serialized by the actor's queue.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use thiserror::Error;

use crate::chain::Transaction;
use crate::config::MempoolConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction {0} already pending")]
    Duplicate(String),

    #[error("account {account} already has {cap} pending transactions")]
    AccountCapReached { account: String, cap: usize },

    #[error("nonce {got} already used, account nonce is {expected}")]
    StaleNonce { expected: u64, got: u64 },

    #[error("nonce {nonce} already pending with gas price >= {gas_price}")]
    NonceConflict { nonce: u64, gas_price: u64 },

    #[error("mempool full ({max}) and gas price {gas_price} does not beat the cheapest entry")]
    Full { max: usize, gas_price: u64 },
}

impl MempoolError {
    pub fn reason(&self) -> &'static str {
        match self {
            MempoolError::Duplicate(_) => "duplicate_transaction",
            MempoolError::AccountCapReached { .. } => "account_cap_reached",
            MempoolError::StaleNonce { .. } => "stale_nonce",
            MempoolError::NonceConflict { .. } => "nonce_conflict",
            MempoolError::Full { .. } => "mempool_full",
        }
    }
}

/// A pooled transaction plus arrival time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MempoolTransaction {
    #[serde(flatten)]
    pub tx: Transaction,
    pub received_at: DateTime<Utc>,
    pub gas_price: u64,
}

/// What `add` did besides inserting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Added,
    /// Same sender and nonce at a higher gas price; holds the replaced hash.
    Replaced(String),
    /// Pool was full; holds the evicted hash.
    Evicted(String),
}

pub struct Mempool {
    config: MempoolConfig,
    by_hash: HashMap<String, MempoolTransaction>,
    // sender -> nonce -> hash
    by_sender: HashMap<String, BTreeMap<u64, String>>,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            by_hash: HashMap::new(),
            by_sender: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<&MempoolTransaction> {
        self.by_hash.get(hash)
    }

    pub fn pending_for(&self, account: &str) -> usize {
        self.by_sender.get(account).map(|m| m.len()).unwrap_or(0)
    }

    /// Admit an already validated transaction. `account_nonce` is the
    /// sender's committed nonce.
    pub fn add(&mut self, tx: Transaction, account_nonce: u64) -> Result<Admission, MempoolError> {
        self.add_at(tx, account_nonce, Utc::now())
    }

    pub fn add_at(
        &mut self,
        tx: Transaction,
        account_nonce: u64,
        now: DateTime<Utc>,
    ) -> Result<Admission, MempoolError> {
        if self.by_hash.contains_key(&tx.hash) {
            return Err(MempoolError::Duplicate(tx.hash));
        }
        if tx.nonce < account_nonce {
            return Err(MempoolError::StaleNonce {
                expected: account_nonce,
                got: tx.nonce,
            });
        }

        // same nonce: replace only for a strictly better price
        let existing = self
            .by_sender
            .get(&tx.from)
            .and_then(|m| m.get(&tx.nonce))
            .cloned();
        if let Some(old_hash) = existing {
            let old_price = self.by_hash.get(&old_hash).map(|m| m.gas_price).unwrap_or(0);
            if tx.gas_price <= old_price {
                return Err(MempoolError::NonceConflict {
                    nonce: tx.nonce,
                    gas_price: old_price,
                });
            }
            self.remove(&old_hash);
            log::debug!("replaced {} with {} at higher gas price", old_hash, tx.hash);
            self.insert(tx, now);
            return Ok(Admission::Replaced(old_hash));
        }

        if self.pending_for(&tx.from) >= self.config.per_account_cap {
            return Err(MempoolError::AccountCapReached {
                account: tx.from,
                cap: self.config.per_account_cap,
            });
        }

        let mut admission = Admission::Added;
        if self.by_hash.len() >= self.config.max_size {
            let cheapest = self
                .by_hash
                .values()
                .min_by(|a, b| {
                    a.gas_price
                        .cmp(&b.gas_price)
                        .then_with(|| b.received_at.cmp(&a.received_at))
                })
                .map(|m| (m.tx.hash.clone(), m.gas_price));
            match cheapest {
                Some((hash, price)) if tx.gas_price > price => {
                    self.remove(&hash);
                    log::info!(
                        "mempool full, evicted {} (gas price {}) for {} (gas price {})",
                        hash,
                        price,
                        tx.hash,
                        tx.gas_price
                    );
                    admission = Admission::Evicted(hash);
                }
                _ => {
                    return Err(MempoolError::Full {
                        max: self.config.max_size,
                        gas_price: tx.gas_price,
                    })
                }
            }
        }

        self.insert(tx, now);
        Ok(admission)
    }

    fn insert(&mut self, tx: Transaction, now: DateTime<Utc>) {
        self.by_sender
            .entry(tx.from.clone())
            .or_default()
            .insert(tx.nonce, tx.hash.clone());
        self.by_hash.insert(
            tx.hash.clone(),
            MempoolTransaction {
                gas_price: tx.gas_price,
                tx,
                received_at: now,
            },
        );
    }

    pub fn remove(&mut self, hash: &str) -> Option<MempoolTransaction> {
        let entry = self.by_hash.remove(hash)?;
        if let Some(nonces) = self.by_sender.get_mut(&entry.tx.from) {
            nonces.remove(&entry.tx.nonce);
            if nonces.is_empty() {
                self.by_sender.remove(&entry.tx.from);
            }
        }
        Some(entry)
    }

    /// Drop every hash included in a committed block, applied or not.
    pub fn remove_committed<'a, I>(&mut self, hashes: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        hashes.into_iter().filter(|h| self.remove(h).is_some()).count()
    }

    /// Drop entries whose nonce the chain has already passed.
    pub fn prune_stale<F>(&mut self, account_nonce: F) -> usize
    where
        F: Fn(&str) -> u64,
    {
        let stale: Vec<String> = self
            .by_hash
            .values()
            .filter(|m| m.tx.nonce < account_nonce(&m.tx.from))
            .map(|m| m.tx.hash.clone())
            .collect();
        for h in &stale {
            self.remove(h);
        }
        stale.len()
    }

    /// Pick transactions for a block: highest gas price first, each sender's
    /// transactions in contiguous nonce order from its committed nonce.
    pub fn select<F>(&self, max_txs: usize, max_bytes: usize, account_nonce: F) -> Vec<Transaction>
    where
        F: Fn(&str) -> u64,
    {
        let mut heap = BinaryHeap::new();
        for (sender, nonces) in &self.by_sender {
            let next = account_nonce(sender);
            if let Some(hash) = nonces.get(&next) {
                if let Some(m) = self.by_hash.get(hash) {
                    heap.push(Candidate(m));
                }
            }
        }

        let mut picked = Vec::new();
        let mut bytes = 0usize;
        while let Some(Candidate(m)) = heap.pop() {
            if picked.len() >= max_txs {
                break;
            }
            let size = serde_json::to_vec(&m.tx).map(|b| b.len()).unwrap_or(0);
            if bytes + size > max_bytes {
                // the sender's later nonces depend on this one
                continue;
            }
            bytes += size;
            picked.push(m.tx.clone());
            let successor = self
                .by_sender
                .get(&m.tx.from)
                .and_then(|n| n.get(&(m.tx.nonce + 1)))
                .and_then(|h| self.by_hash.get(h));
            if let Some(next) = successor {
                heap.push(Candidate(next));
            }
        }
        picked
    }

    /// Snapshot ordered by gas price, for status endpoints.
    pub fn snapshot(&self, limit: usize) -> Vec<MempoolTransaction> {
        let mut all: Vec<&MempoolTransaction> = self.by_hash.values().collect();
        all.sort_by(|a, b| Candidate(b).cmp(&Candidate(a)));
        all.into_iter().take(limit).cloned().collect()
    }
}

// Max-heap order: gas price, then earlier arrival, then hash.
struct Candidate<'a>(&'a MempoolTransaction);

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .gas_price
            .cmp(&other.0.gas_price)
            .then_with(|| other.0.received_at.cmp(&self.0.received_at))
            .then_with(|| other.0.tx.hash.cmp(&self.0.tx.hash))
    }
}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::crypto::keys::signing_key_from_seed;

    fn pool(max_size: usize, cap: usize) -> Mempool {
        Mempool::new(MempoolConfig {
            max_size,
            per_account_cap: cap,
        })
    }

    fn tx(seed: u8, nonce: u64, gas: u64) -> Transaction {
        let sk = signing_key_from_seed(&[seed; 32]);
        let to = crypto::address_of(&signing_key_from_seed(&[200u8; 32]));
        Transaction::new_signed(&sk, &to, 1, nonce, gas)
    }

    #[test]
    fn per_account_cap_is_enforced() {
        let mut p = pool(100, 2);
        p.add(tx(1, 0, 1), 0).unwrap();
        p.add(tx(1, 1, 1), 0).unwrap();
        let err = p.add(tx(1, 2, 1), 0).unwrap_err();
        assert_eq!(err.reason(), "account_cap_reached");
        // another sender is unaffected
        p.add(tx(2, 0, 1), 0).unwrap();
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn duplicate_and_stale_rejected() {
        let mut p = pool(100, 8);
        let t = tx(1, 3, 1);
        p.add(t.clone(), 0).unwrap();
        assert_eq!(p.add(t, 0).unwrap_err().reason(), "duplicate_transaction");
        assert_eq!(p.add(tx(1, 1, 1), 2).unwrap_err().reason(), "stale_nonce");
    }

    #[test]
    fn same_nonce_replaced_only_by_higher_price() {
        let mut p = pool(100, 8);
        let low = tx(1, 0, 5);
        p.add(low.clone(), 0).unwrap();
        assert!(matches!(
            p.add(tx(1, 0, 5), 0),
            Err(MempoolError::Duplicate(_)) | Err(MempoolError::NonceConflict { .. })
        ));
        let high = tx(1, 0, 9);
        assert_eq!(p.add(high.clone(), 0).unwrap(), Admission::Replaced(low.hash.clone()));
        assert!(!p.contains(&low.hash));
        assert!(p.contains(&high.hash));
        assert_eq!(p.pending_for(&high.from), 1);
    }

    #[test]
    fn full_pool_evicts_cheapest() {
        let mut p = pool(2, 8);
        let cheap = tx(1, 0, 1);
        p.add(cheap.clone(), 0).unwrap();
        p.add(tx(2, 0, 5), 0).unwrap();
        assert_eq!(p.add(tx(3, 0, 1), 0).unwrap_err().reason(), "mempool_full");
        assert_eq!(p.add(tx(3, 0, 7), 0).unwrap(), Admission::Evicted(cheap.hash));
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn selection_prefers_gas_but_keeps_nonce_order() {
        let mut p = pool(100, 8);
        // sender 1: cheap first nonce, expensive second
        let a0 = tx(1, 0, 1);
        let a1 = tx(1, 1, 100);
        let b0 = tx(2, 0, 50);
        let gap = tx(3, 5, 999);
        for t in [&a0, &a1, &b0, &gap] {
            p.add(t.clone(), 0).unwrap();
        }
        let picked: Vec<String> = p
            .select(10, usize::MAX, |_| 0)
            .into_iter()
            .map(|t| t.hash)
            .collect();
        assert_eq!(picked, vec![b0.hash.clone(), a0.hash.clone(), a1.hash.clone()]);

        let two = p.select(2, usize::MAX, |_| 0);
        assert_eq!(two.len(), 2);
        assert_eq!(two[0].hash, b0.hash);
    }

    #[test]
    fn committed_hashes_are_removed() {
        let mut p = pool(100, 8);
        let a = tx(1, 0, 1);
        let b = tx(1, 1, 1);
        p.add(a.clone(), 0).unwrap();
        p.add(b.clone(), 0).unwrap();
        assert_eq!(p.remove_committed([a.hash.as_str(), "unknown"]), 1);
        assert_eq!(p.prune_stale(|_| 2), 1);
        assert!(p.is_empty());
        assert_eq!(p.pending_for(&a.from), 0);
    }
}
