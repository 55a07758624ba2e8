// lamport-ledger
// Replicated transfer ledger whose commits are serialized by Lamport's
// distributed mutual exclusion algorithm.

pub mod clock;
pub mod config;
pub mod ledger;
pub mod mutex;
pub mod network;
pub mod node;

pub use clock::LogicalClock;
pub use config::{ConfigError, MutexSettings, NodeConfig, PeerConfig, TransportSettings};
pub use ledger::{Block, ClientId, Ledger, LedgerError, Transaction, ValidationError};
pub use mutex::{MutexConfig, MutexCoordinator, MutexError, MutexState, ProcessId, Request};
pub use network::{LocalNetwork, PeerMessage, PeerMessenger, PeerUnavailableError, TcpMessenger};
pub use node::{Node, NodeStatus, TransactionCoordinator, TransferError, TransferReceipt, TransferStatus};
