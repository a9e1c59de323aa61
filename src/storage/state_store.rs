// src/storage/state_store.rs
// Account state table with a JSON snapshot file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::StoreError;
use crate::crypto::{self, merkle_root};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountState {
    pub balance: u64,
    pub nonce: u64,
}

#[derive(Serialize, Deserialize)]
struct StateSnapshot {
    /// Last block height whose transactions are reflected in `accounts`.
    applied_height: Option<u64>,
    state_root: String,
    accounts: BTreeMap<String, AccountState>,
}

#[derive(Serialize)]
struct StateLeaf<'a> {
    address: &'a str,
    balance: u64,
    nonce: u64,
}

/// Flat address -> account table. Mutated only by the commit path.
#[derive(Clone, Debug, Default)]
pub struct StateStore {
    accounts: BTreeMap<String, AccountState>,
    applied_height: Option<u64>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh state seeded with genesis balances.
    pub fn with_allocations<'a, I>(alloc: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a u64)>,
    {
        let mut state = Self::new();
        for (addr, balance) in alloc {
            state.set_account(
                addr,
                AccountState {
                    balance: *balance,
                    nonce: 0,
                },
            );
        }
        state
    }

    /// Unknown addresses read as the zero account.
    pub fn get_account(&self, address: &str) -> AccountState {
        self.accounts.get(address).copied().unwrap_or_default()
    }

    pub fn get_balance(&self, address: &str) -> u64 {
        self.get_account(address).balance
    }

    pub fn get_nonce(&self, address: &str) -> u64 {
        self.get_account(address).nonce
    }

    pub fn set_account(&mut self, address: &str, account: AccountState) {
        if account == AccountState::default() {
            // zero accounts are indistinguishable from absent ones
            self.accounts.remove(address);
        } else {
            self.accounts.insert(address.to_string(), account);
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn applied_height(&self) -> Option<u64> {
        self.applied_height
    }

    pub fn set_applied_height(&mut self, height: u64) {
        self.applied_height = Some(height);
    }

    /// Merkle root over address-sorted account leaves. Depends only on the
    /// table contents, never on insertion order.
    pub fn compute_state_root(&self) -> String {
        let leaves: Vec<[u8; 32]> = self
            .accounts
            .iter()
            .map(|(address, acct)| {
                let leaf = StateLeaf {
                    address,
                    balance: acct.balance,
                    nonce: acct.nonce,
                };
                crypto::hashing::canonical_bytes(&leaf)
                    .map(|b| crypto::sha256(&b))
                    .unwrap_or(crypto::ZERO_HASH)
            })
            .collect();
        hex::encode(merkle_root(&leaves))
    }

    /// Atomically replace the snapshot at `path` (temp file + rename).
    pub fn save_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let snapshot = StateSnapshot {
            applied_height: self.applied_height,
            state_root: self.compute_state_root(),
            accounts: self.accounts.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = tmp_path(path);
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        crypto::set_restrictive_permissions(&tmp);
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a snapshot, `Ok(None)` if none exists. The stored root must match
    /// the recomputed one.
    pub fn load_snapshot(path: &Path) -> Result<Option<Self>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        let snapshot: StateSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("state snapshot: {}", e)))?;
        let state = StateStore {
            accounts: snapshot.accounts,
            applied_height: snapshot.applied_height,
        };
        let root = state.compute_state_root();
        if root != snapshot.state_root {
            return Err(StoreError::Corrupt(format!(
                "state snapshot root mismatch: stored {}, computed {}",
                snapshot.state_root, root
            )));
        }
        Ok(Some(state))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unknown_address_reads_zero() {
        let state = StateStore::new();
        assert_eq!(state.get_balance("0xnobody"), 0);
        assert_eq!(state.get_nonce("0xnobody"), 0);
    }

    #[test]
    fn root_independent_of_insertion_order() {
        let mut a = StateStore::new();
        let mut b = StateStore::new();
        let entries = [("0xaa", 5u64, 1u64), ("0xbb", 7, 0), ("0xcc", 1, 3)];
        for (addr, bal, nonce) in entries.iter() {
            a.set_account(addr, AccountState { balance: *bal, nonce: *nonce });
        }
        for (addr, bal, nonce) in entries.iter().rev() {
            b.set_account(addr, AccountState { balance: *bal, nonce: *nonce });
        }
        assert_eq!(a.compute_state_root(), b.compute_state_root());

        b.set_account("0xcc", AccountState { balance: 2, nonce: 3 });
        assert_ne!(a.compute_state_root(), b.compute_state_root());
    }

    #[test]
    fn empty_state_root_is_zero_sentinel() {
        assert_eq!(StateStore::new().compute_state_root(), "0".repeat(64));
    }

    #[test]
    fn snapshot_roundtrip_and_tamper_detection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.snapshot.json");
        assert!(StateStore::load_snapshot(&path).unwrap().is_none());

        let mut state = StateStore::new();
        state.set_account("0xaa", AccountState { balance: 10, nonce: 2 });
        state.set_applied_height(4);
        state.save_snapshot(&path).unwrap();

        let loaded = StateStore::load_snapshot(&path).unwrap().unwrap();
        assert_eq!(loaded.get_account("0xaa"), state.get_account("0xaa"));
        assert_eq!(loaded.applied_height(), Some(4));

        let text = std::fs::read_to_string(&path).unwrap().replace("10", "11");
        std::fs::write(&path, text).unwrap();
        assert!(matches!(
            StateStore::load_snapshot(&path),
            Err(StoreError::Corrupt(_))
        ));
    }
}
