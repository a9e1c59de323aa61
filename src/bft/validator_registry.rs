// src/bft/validator_registry.rs
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::bft::ConsensusError;
use crate::config::GenesisValidator;
use crate::crypto::{self, keys};

/// Validator info with stake
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorInfo {
    pub address: String,
    pub public_key: String,
    pub stake: u64,
}

/// Weighted validator set for one height.
///
/// Ordering is stake descending, then address ascending, so every node
/// derives the same proposer sequence from the same membership.
#[derive(Clone, Debug, Default)]
pub struct ValidatorSet {
    validators: Vec<ValidatorInfo>,
    index: HashMap<String, usize>,
    total_stake: u64,
}

impl ValidatorSet {
    /// Zero-stake entries are dropped. A repeated address keeps its first entry.
    pub fn new(validators: Vec<ValidatorInfo>) -> Self {
        let mut infos: Vec<ValidatorInfo> = Vec::with_capacity(validators.len());
        for v in validators {
            if v.stake > 0 && !infos.iter().any(|i| i.address == v.address) {
                infos.push(v);
            }
        }
        infos.sort_by(|a, b| b.stake.cmp(&a.stake).then_with(|| a.address.cmp(&b.address)));

        let total_stake = infos.iter().map(|v| v.stake).sum();
        let index = infos
            .iter()
            .enumerate()
            .map(|(i, v)| (v.address.clone(), i))
            .collect();
        Self {
            validators: infos,
            index,
            total_stake,
        }
    }

    /// Build from genesis entries, checking each address against its key.
    pub fn from_genesis(entries: &[GenesisValidator]) -> Result<Self, ConsensusError> {
        let mut infos = Vec::with_capacity(entries.len());
        for e in entries {
            let vk = keys::verifying_key_from_hex(&e.public_key)
                .map_err(|err| ConsensusError::Provider(format!("validator {}: {}", e.address, err)))?;
            let derived = crypto::address_from_pubkey(vk.as_bytes());
            if derived != e.address {
                return Err(ConsensusError::Provider(format!(
                    "validator {} does not match its public key (derived {})",
                    e.address, derived
                )));
            }
            infos.push(ValidatorInfo {
                address: e.address.clone(),
                public_key: e.public_key.clone(),
                stake: e.stake,
            });
        }
        Ok(Self::new(infos))
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_stake(&self) -> u64 {
        self.total_stake
    }

    /// Validator at position `index` of the deterministic ordering.
    pub fn get(&self, index: usize) -> Option<&ValidatorInfo> {
        self.validators.get(index)
    }

    pub fn get_by_address(&self, address: &str) -> Option<&ValidatorInfo> {
        self.index.get(address).map(|&i| &self.validators[i])
    }

    pub fn stake_of(&self, address: &str) -> u64 {
        self.get_by_address(address).map(|v| v.stake).unwrap_or(0)
    }

    pub fn public_key_of(&self, address: &str) -> Option<&str> {
        self.get_by_address(address).map(|v| v.public_key.as_str())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.index.contains_key(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidatorInfo> {
        self.validators.iter()
    }
}

/// Source of the active validator set, resolved before every height.
#[async_trait]
pub trait ValidatorSetProvider: Send + Sync {
    async fn validators_at(&self, height: u64) -> Result<ValidatorSet, ConsensusError>;
}

/// Fixed membership taken from the genesis section of the node config.
pub struct GenesisValidatorProvider {
    set: ValidatorSet,
}

impl GenesisValidatorProvider {
    pub fn new(set: ValidatorSet) -> Self {
        Self { set }
    }

    pub fn from_config(entries: &[GenesisValidator]) -> Result<Self, ConsensusError> {
        Ok(Self::new(ValidatorSet::from_genesis(entries)?))
    }
}

#[async_trait]
impl ValidatorSetProvider for GenesisValidatorProvider {
    async fn validators_at(&self, _height: u64) -> Result<ValidatorSet, ConsensusError> {
        if self.set.is_empty() {
            return Err(ConsensusError::EmptyValidatorSet);
        }
        Ok(self.set.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::signing_key_from_seed;

    fn info(addr: &str, stake: u64) -> ValidatorInfo {
        ValidatorInfo {
            address: addr.to_string(),
            public_key: String::new(),
            stake,
        }
    }

    #[test]
    fn ordering_is_stake_then_address() {
        let set = ValidatorSet::new(vec![
            info("0xc", 10),
            info("0xa", 10),
            info("0xb", 30),
            info("0xd", 0),
        ]);
        let order: Vec<&str> = set.iter().map(|v| v.address.as_str()).collect();
        assert_eq!(order, vec!["0xb", "0xa", "0xc"]);
        assert_eq!(set.total_stake(), 50);
        assert_eq!(set.stake_of("0xd"), 0);
        assert!(!set.contains("0xd"));
    }

    #[test]
    fn genesis_entries_must_match_keys() {
        let sk = signing_key_from_seed(&[8u8; 32]);
        let good = GenesisValidator {
            address: crypto::address_of(&sk),
            public_key: crypto::pubkey_hex(&sk),
            stake: 5,
        };
        assert_eq!(ValidatorSet::from_genesis(&[good.clone()]).unwrap().len(), 1);

        let mut bad = good;
        bad.address = crypto::address_of(&signing_key_from_seed(&[9u8; 32]));
        assert!(ValidatorSet::from_genesis(&[bad]).is_err());
    }

    #[tokio::test]
    async fn empty_genesis_provider_errors() {
        let p = GenesisValidatorProvider::new(ValidatorSet::default());
        assert!(matches!(
            p.validators_at(1).await,
            Err(ConsensusError::EmptyValidatorSet)
        ));
    }
}
