pub mod block;
pub mod executor;
pub mod transaction;

pub use block::{Block, CommitSignature};
pub use executor::{TransferExecutor, TxExecutor};
pub use transaction::Transaction;
