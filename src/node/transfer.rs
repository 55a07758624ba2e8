// Transaction Coordinator - the commit path gated by the distributed mutex
//
// acquire -> validate & commit -> replicate -> release
//
// The block is queued to every peer and flushed before RELEASE is queued.
// With FIFO links each peer therefore applies the block before it can see
// our release, so whoever enters next already holds the new head.

use crate::ledger::{Block, ClientId, Ledger, Transaction, ValidationError};
use crate::mutex::{MutexCoordinator, MutexError};
use crate::network::{broadcast, flush_all, BroadcastReport, PeerMessage, PeerMessenger};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// Result of a transfer as seen by the client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Success,
    Failed,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("SUCCESS"),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

/// Outcome of `submit_transfer`
#[derive(Clone, Debug, PartialEq)]
pub struct TransferReceipt {
    pub status: TransferStatus,
    pub sender: ClientId,
    /// Sender balance when the critical section was entered
    pub before_balance: Decimal,
    /// Sender balance when the critical section was left
    pub after_balance: Decimal,
    /// The committed block, on success
    pub block: Option<Block>,
    /// Why the transfer was rejected, on failure
    pub rejection: Option<ValidationError>,
}

impl TransferReceipt {
    pub fn is_success(&self) -> bool {
        self.status == TransferStatus::Success
    }
}

/// Errors that prevent a transfer from running at all
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Mutual exclusion failed: {0}")]
    Mutex(#[from] MutexError),
}

/// Orchestrates client transfers on one process
pub struct TransactionCoordinator {
    mutex: Arc<MutexCoordinator>,
    ledger: Arc<Ledger>,
    messenger: Arc<dyn PeerMessenger>,
    /// Local transfers take turns: a process has one outstanding request
    local_turn: AsyncMutex<()>,
}

impl TransactionCoordinator {
    pub fn new(mutex: Arc<MutexCoordinator>, ledger: Arc<Ledger>, messenger: Arc<dyn PeerMessenger>) -> Self {
        Self {
            mutex,
            ledger,
            messenger,
            local_turn: AsyncMutex::new(()),
        }
    }

    /// Move `amount` from `sender` to `receiver` under global mutual exclusion
    pub async fn submit_transfer(
        &self,
        sender: ClientId,
        receiver: ClientId,
        amount: Decimal,
    ) -> Result<TransferReceipt, TransferError> {
        let _turn = self.local_turn.lock().await;
        let request = self.mutex.acquire().await?;

        // Critical section: nothing below may return early before release
        let before_balance = self.ledger.balance_of(&sender);
        let transaction = Transaction::new(sender.clone(), receiver, amount);
        let outcome = self.ledger.commit(transaction, request.timestamp());

        if let Ok(block) = &outcome {
            let report = self.replicate(block).await;
            if !report.is_complete() {
                warn!(
                    hash = %block.hash(),
                    failed_peers = report.failures.len(),
                    "Block not replicated to every peer"
                );
            }
        }

        let after_balance = self.ledger.balance_of(&sender);
        self.mutex.release_mutex()?;

        let receipt = match outcome {
            Ok(block) => TransferReceipt {
                status: TransferStatus::Success,
                sender,
                before_balance,
                after_balance,
                block: Some(block),
                rejection: None,
            },
            Err(rejection) => TransferReceipt {
                status: TransferStatus::Failed,
                sender,
                before_balance,
                after_balance,
                block: None,
                rejection: Some(rejection),
            },
        };

        info!(
            status = %receipt.status,
            sender = %receipt.sender,
            before = %receipt.before_balance,
            after = %receipt.after_balance,
            "Transfer finished"
        );
        Ok(receipt)
    }

    /// Send a committed block to every peer and wait for the sends to finish
    pub async fn replicate(&self, block: &Block) -> BroadcastReport {
        let peers = self.mutex.peers();
        let queued = broadcast(self.messenger.as_ref(), peers, &PeerMessage::Block(block.clone()));
        let mut flushed = flush_all(self.messenger.clone(), &queued.delivered).await;
        flushed.failures.extend(queued.failures);
        flushed
    }

    /// Current balance of a client
    pub fn get_balance(&self, client: &ClientId) -> Decimal {
        self.ledger.balance_of(client)
    }

    /// Snapshot of the chain, oldest first
    pub fn get_ledger(&self) -> Vec<Block> {
        self.ledger.chain()
    }
}
