// Node - one process: coordinator, ledger and the inbound dispatch loop

use crate::config::NodeConfig;
use crate::ledger::{Block, ClientId, Ledger};
use crate::mutex::{MutexConfig, MutexCoordinator, MutexState, ProcessId, Request};
use crate::network::{PeerMessage, PeerMessenger};
use crate::node::{TransactionCoordinator, TransferError, TransferReceipt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counters of inbound traffic
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    pub requests_received: u64,
    pub replies_received: u64,
    pub releases_received: u64,
    pub blocks_applied: u64,
    pub blocks_ignored: u64,
    pub blocks_rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    replies: AtomicU64,
    releases: AtomicU64,
    applied: AtomicU64,
    ignored: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time view of a node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeStatus {
    pub process_id: ProcessId,
    pub state: MutexState,
    pub clock: u64,
    pub pending_requests: Vec<Request>,
    pub height: usize,
    pub head_hash: Option<String>,
    pub stats: NodeStats,
}

/// A process taking part in the protocol
pub struct Node {
    process_id: ProcessId,
    mutex: Arc<MutexCoordinator>,
    ledger: Arc<Ledger>,
    transactions: TransactionCoordinator,
    counters: Counters,
}

impl Node {
    /// Wire a node from its parts
    pub fn new(
        process_id: ProcessId,
        peers: Vec<ProcessId>,
        messenger: Arc<dyn PeerMessenger>,
        initial_balance: Decimal,
        mutex_config: MutexConfig,
    ) -> Self {
        let mutex = Arc::new(MutexCoordinator::new(
            process_id.clone(),
            peers,
            messenger.clone(),
            mutex_config,
        ));
        let ledger = Arc::new(Ledger::new(initial_balance));
        let transactions = TransactionCoordinator::new(mutex.clone(), ledger.clone(), messenger);

        Self {
            process_id,
            mutex,
            ledger,
            transactions,
            counters: Counters::default(),
        }
    }

    /// Wire a node from configuration
    pub fn from_config(config: &NodeConfig, messenger: Arc<dyn PeerMessenger>) -> Self {
        Self::new(
            config.process_id(),
            config.peer_ids(),
            messenger,
            config.initial_balance,
            config.mutex_config(),
        )
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    pub fn mutex(&self) -> &Arc<MutexCoordinator> {
        &self.mutex
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Dispatch one inbound message
    pub fn handle(&self, message: PeerMessage) {
        debug!(
            process_id = %self.process_id,
            kind = ?message.message_type(),
            origin = ?message.origin(),
            "Inbound message"
        );
        match message {
            PeerMessage::Request {
                timestamp,
                process_id,
            } => {
                self.counters.requests.fetch_add(1, Ordering::Relaxed);
                self.mutex.on_receive_request(Request::new(timestamp, process_id));
            }
            PeerMessage::Reply { from, timestamp } => {
                self.counters.replies.fetch_add(1, Ordering::Relaxed);
                self.mutex.on_receive_reply(from, timestamp);
            }
            PeerMessage::Release {
                process_id,
                timestamp,
            } => {
                self.counters.releases.fetch_add(1, Ordering::Relaxed);
                self.mutex.on_receive_release(process_id, timestamp);
            }
            PeerMessage::Block(block) => self.apply_block(block),
        }
    }

    fn apply_block(&self, block: Block) {
        let hash = block.hash().to_string();
        match self.ledger.apply_replicated_block(block) {
            Ok(true) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(process_id = %self.process_id, %hash, error = %e, "Rejected replicated block");
            }
        }
    }

    /// Drain an inbox in arrival order until every sender is gone
    pub async fn run_inbox(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<PeerMessage>) {
        debug!(process_id = %self.process_id, "Inbox loop started");
        while let Some(message) = inbox.recv().await {
            self.handle(message);
        }
        info!(process_id = %self.process_id, "Inbox closed");
    }

    /// Spawn `run_inbox` on the runtime
    pub fn spawn_inbox(self: &Arc<Self>, inbox: mpsc::UnboundedReceiver<PeerMessage>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run_inbox(inbox))
    }

    /// Client-facing transfer
    pub async fn submit_transfer(
        &self,
        sender: ClientId,
        receiver: ClientId,
        amount: Decimal,
    ) -> Result<TransferReceipt, TransferError> {
        self.transactions.submit_transfer(sender, receiver, amount).await
    }

    /// Client-facing balance query
    pub fn get_balance(&self, client: &ClientId) -> Decimal {
        self.transactions.get_balance(client)
    }

    /// Client-facing ledger query
    pub fn get_ledger(&self) -> Vec<Block> {
        self.transactions.get_ledger()
    }

    /// Inbound traffic counters
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            requests_received: self.counters.requests.load(Ordering::Relaxed),
            replies_received: self.counters.replies.load(Ordering::Relaxed),
            releases_received: self.counters.releases.load(Ordering::Relaxed),
            blocks_applied: self.counters.applied.load(Ordering::Relaxed),
            blocks_ignored: self.counters.ignored.load(Ordering::Relaxed),
            blocks_rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of protocol and ledger state
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            process_id: self.process_id.clone(),
            state: self.mutex.state(),
            clock: self.mutex.clock(),
            pending_requests: self.mutex.queue_snapshot(),
            height: self.ledger.height(),
            head_hash: self.ledger.head_hash(),
            stats: self.stats(),
        }
    }
}
