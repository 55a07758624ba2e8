// Ledger module - THE SHARED HISTORY
// Hash-chained transfer blocks and the balance table they produce

mod block;
mod state;
mod transaction;

pub use block::Block;
pub use state::{Ledger, LedgerError, ValidationError};
pub use transaction::{ClientId, Transaction, TransactionId};
