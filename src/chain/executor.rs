// src/chain/executor.rs
// Transaction application hook. The node applies committed blocks through a
// `TxExecutor`; the default one moves value between accounts.

use crate::chain::Transaction;
use crate::storage::{AccountState, StateStore};

pub trait TxExecutor: Send + Sync {
    /// Apply one transaction. On `Err` the state must be left untouched.
    fn apply(&self, state: &mut StateStore, tx: &Transaction) -> Result<(), String>;
}

/// Plain value transfer: nonce must match, balance must cover the value.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferExecutor;

impl TxExecutor for TransferExecutor {
    fn apply(&self, state: &mut StateStore, tx: &Transaction) -> Result<(), String> {
        let sender = state.get_account(&tx.from);
        if tx.nonce != sender.nonce {
            return Err(format!(
                "Invalid nonce: got {}, expected {}",
                tx.nonce, sender.nonce
            ));
        }
        if sender.balance < tx.value {
            return Err(format!(
                "Insufficient balance: have {}, need {}",
                sender.balance, tx.value
            ));
        }

        let sender_after = AccountState {
            balance: sender.balance - tx.value,
            nonce: sender.nonce + 1,
        };
        if tx.from == tx.to {
            state.set_account(&tx.from, sender_after);
            return Ok(());
        }
        let recipient = state.get_account(&tx.to);
        let credited = recipient
            .balance
            .checked_add(tx.value)
            .ok_or_else(|| "recipient balance overflow".to_string())?;
        state.set_account(&tx.from, sender_after);
        state.set_account(
            &tx.to,
            AccountState {
                balance: credited,
                nonce: recipient.nonce,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{address_of, keys::signing_key_from_seed};

    #[test]
    fn transfer_moves_value_and_bumps_nonce() {
        let sk = signing_key_from_seed(&[1u8; 32]);
        let from = address_of(&sk);
        let to = address_of(&signing_key_from_seed(&[2u8; 32]));
        let mut state = StateStore::new();
        state.set_account(&from, AccountState { balance: 100, nonce: 0 });

        let tx = Transaction::new_signed(&sk, &to, 30, 0, 1);
        TransferExecutor.apply(&mut state, &tx).unwrap();
        assert_eq!(state.get_balance(&from), 70);
        assert_eq!(state.get_nonce(&from), 1);
        assert_eq!(state.get_balance(&to), 30);
    }

    #[test]
    fn failures_leave_state_untouched() {
        let sk = signing_key_from_seed(&[1u8; 32]);
        let from = address_of(&sk);
        let to = address_of(&signing_key_from_seed(&[2u8; 32]));
        let mut state = StateStore::new();
        state.set_account(&from, AccountState { balance: 10, nonce: 0 });
        let root = state.compute_state_root();

        let too_much = Transaction::new_signed(&sk, &to, 11, 0, 1);
        assert!(TransferExecutor.apply(&mut state, &too_much).is_err());
        let wrong_nonce = Transaction::new_signed(&sk, &to, 1, 5, 1);
        assert!(TransferExecutor.apply(&mut state, &wrong_nonce).is_err());
        assert_eq!(state.compute_state_root(), root);
    }
}
