// Peer Messenger - how a process hands messages to its peers
//
// `send` only queues: it never blocks and never performs I/O, so the mutex
// coordinator can call it while holding its state lock. That keeps the
// per-peer order of messages equal to the order in which they were stamped.
// Transports move queued messages onto the wire from their own tasks.
// `flush` waits until everything queued for a peer has left the process.

use crate::mutex::ProcessId;
use crate::network::PeerMessage;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::warn;

/// A message could not be handed to a peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Peer {peer} unavailable: {reason}")]
pub struct PeerUnavailableError {
    pub peer: ProcessId,
    pub reason: String,
}

impl PeerUnavailableError {
    pub fn new(peer: ProcessId, reason: impl Into<String>) -> Self {
        Self {
            peer,
            reason: reason.into(),
        }
    }
}

/// Outbound side of the transport used by the protocol
#[async_trait]
pub trait PeerMessenger: Send + Sync {
    /// Queue a message for a peer. Messages to the same peer are delivered
    /// in the order they were queued.
    fn send(&self, to: &ProcessId, message: PeerMessage) -> Result<(), PeerUnavailableError>;

    /// Wait until every message queued for `to` so far has been transmitted.
    /// Reports the failure if any of them could not be.
    async fn flush(&self, to: &ProcessId) -> Result<(), PeerUnavailableError>;
}

/// Outcome of sending one message to several peers
#[derive(Clone, Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<ProcessId>,
    pub failures: Vec<PeerUnavailableError>,
}

impl BroadcastReport {
    /// True if every peer accepted the message
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, peer: &ProcessId, result: Result<(), PeerUnavailableError>) {
        match result {
            Ok(()) => self.delivered.push(peer.clone()),
            Err(e) => {
                warn!(peer = %e.peer, reason = %e.reason, "Peer unavailable");
                self.failures.push(e);
            }
        }
    }
}

/// Queue a message for every peer. A failing peer does not stop the rest.
pub fn broadcast(messenger: &dyn PeerMessenger, peers: &[ProcessId], message: &PeerMessage) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    for peer in peers {
        report.record(peer, messenger.send(peer, message.clone()));
    }
    report
}

/// Flush every peer concurrently and wait for all of them
pub async fn flush_all(messenger: Arc<dyn PeerMessenger>, peers: &[ProcessId]) -> BroadcastReport {
    let mut tasks = JoinSet::new();
    for peer in peers {
        let messenger = messenger.clone();
        let peer = peer.clone();
        tasks.spawn(async move {
            let result = messenger.flush(&peer).await;
            (peer, result)
        });
    }

    let mut pending: HashSet<ProcessId> = peers.iter().cloned().collect();
    let mut report = BroadcastReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((peer, result)) => {
                pending.remove(&peer);
                report.record(&peer, result);
            }
            Err(e) => warn!(error = %e, "Flush task failed"),
        }
    }

    // Tasks that panicked never reported back
    for peer in pending {
        let error = PeerUnavailableError::new(peer.clone(), "flush task aborted");
        report.record(&peer, Err(error));
    }

    report
}

// ============================================================================
// LOCAL NETWORK
// ============================================================================

/// In-process network: one unbounded FIFO inbox per process.
///
/// Used by tests and the simulator. `disconnect` models a crashed process:
/// its inbox is dropped and later sends to it fail.
#[derive(Clone, Debug, Default)]
pub struct LocalNetwork {
    inboxes: Arc<Mutex<HashMap<ProcessId, mpsc::UnboundedSender<PeerMessage>>>>,
}

impl LocalNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProcessId, mpsc::UnboundedSender<PeerMessage>>> {
        self.inboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a process. Returns its messenger and the receiving end of its inbox.
    pub fn join(&self, process_id: ProcessId) -> (LocalMessenger, mpsc::UnboundedReceiver<PeerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(process_id.clone(), tx);
        let messenger = LocalMessenger {
            owner: process_id,
            network: self.clone(),
        };
        (messenger, rx)
    }

    /// Detach a process as if it crashed
    pub fn disconnect(&self, process_id: &ProcessId) {
        self.lock().remove(process_id);
    }

    /// Whether a process is attached
    pub fn is_connected(&self, process_id: &ProcessId) -> bool {
        self.lock().contains_key(process_id)
    }

    fn deliver(&self, to: &ProcessId, message: PeerMessage) -> Result<(), PeerUnavailableError> {
        let inboxes = self.lock();
        let inbox = inboxes
            .get(to)
            .ok_or_else(|| PeerUnavailableError::new(to.clone(), "not connected"))?;
        inbox
            .send(message)
            .map_err(|_| PeerUnavailableError::new(to.clone(), "inbox closed"))
    }
}

/// Messenger for a process attached to a `LocalNetwork`
#[derive(Clone, Debug)]
pub struct LocalMessenger {
    owner: ProcessId,
    network: LocalNetwork,
}

#[async_trait]
impl PeerMessenger for LocalMessenger {
    fn send(&self, to: &ProcessId, message: PeerMessage) -> Result<(), PeerUnavailableError> {
        // A crashed process sends nothing
        if !self.network.is_connected(&self.owner) {
            return Err(PeerUnavailableError::new(to.clone(), "sender disconnected"));
        }
        self.network.deliver(to, message)
    }

    async fn flush(&self, to: &ProcessId) -> Result<(), PeerUnavailableError> {
        // Delivery into the inbox is synchronous; only reachability remains
        if self.network.is_connected(to) {
            Ok(())
        } else {
            Err(PeerUnavailableError::new(to.clone(), "not connected"))
        }
    }
}
