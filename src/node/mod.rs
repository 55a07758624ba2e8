// Node module - ONE PROCESS
// Wires the mutex coordinator, ledger and messenger of a single process

mod handler;
mod transfer;

pub use handler::{Node, NodeStats, NodeStatus};
pub use transfer::{TransactionCoordinator, TransferError, TransferReceipt, TransferStatus};
