// Mutex Coordinator - Lamport's distributed mutual exclusion
//
// Every process replies to every request immediately. Exclusion comes from
// the entry rule alone: a process enters only when its own request heads the
// queue and every peer has replied. Replies carry the replier's clock, which
// under FIFO delivery guarantees that any older request from that peer has
// already been queued.
//
// All protocol state sits behind one lock. Outgoing messages are queued on
// the messenger while the lock is held so they leave in stamp order; the
// messenger does the actual I/O elsewhere.

use crate::clock::LogicalClock;
use crate::mutex::{ProcessId, Request, RequestQueue};
use crate::network::{broadcast, PeerMessage, PeerMessenger};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// STATE AND CONFIG
// ============================================================================

/// Position of this process in the request/enter/release cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutexState {
    Idle,
    Requesting,
    InCriticalSection,
}

impl Default for MutexState {
    fn default() -> Self {
        Self::Idle
    }
}

impl MutexState {
    /// Check if transition to another state is valid
    pub fn can_transition_to(&self, target: MutexState) -> bool {
        matches!(
            (self, target),
            (Self::Idle, Self::Requesting)
                | (Self::Requesting, Self::InCriticalSection)
                | (Self::Requesting, Self::Idle) // request withdrawn after timeout
                | (Self::InCriticalSection, Self::Idle)
        )
    }
}

impl fmt::Display for MutexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Requesting => "REQUESTING",
            Self::InCriticalSection => "IN_CRITICAL_SECTION",
        };
        f.write_str(name)
    }
}

/// Coordinator configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MutexConfig {
    /// Give up waiting for the critical section after this long.
    /// None waits forever.
    pub request_timeout: Option<Duration>,
}

impl MutexConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// Errors returned by the coordinator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutexError {
    #[error("Illegal {operation} while {state}")]
    IllegalState {
        operation: &'static str,
        state: MutexState,
    },

    #[error("Timed out after {waited:?} waiting for the critical section")]
    Timeout { waited: Duration },
}

impl MutexError {
    /// Check if this is a protocol-state violation by the caller
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState { .. })
    }
}

#[derive(Debug, Default)]
struct ProtocolState {
    clock: LogicalClock,
    state: MutexState,
    queue: RequestQueue,
    /// Peers that replied to the current request
    replies: HashSet<ProcessId>,
    /// Our outstanding request
    my_request: Option<Request>,
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Per-process instance of the mutual exclusion protocol
pub struct MutexCoordinator {
    process_id: ProcessId,
    /// Every other process, fixed for the lifetime of the coordinator
    peers: Vec<ProcessId>,
    config: MutexConfig,
    messenger: Arc<dyn PeerMessenger>,
    state: Mutex<ProtocolState>,
    /// Signalled whenever an inbound message may have changed eligibility
    changed: Notify,
}

impl MutexCoordinator {
    /// Create a coordinator for `process_id` competing with `peers`
    pub fn new(
        process_id: ProcessId,
        peers: Vec<ProcessId>,
        messenger: Arc<dyn PeerMessenger>,
        config: MutexConfig,
    ) -> Self {
        let mut peers: Vec<ProcessId> = peers.into_iter().filter(|p| p != &process_id).collect();
        peers.sort();
        peers.dedup();

        Self {
            process_id,
            peers,
            config,
            messenger,
            state: Mutex::new(ProtocolState::default()),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProtocolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    pub fn peers(&self) -> &[ProcessId] {
        &self.peers
    }

    pub fn config(&self) -> &MutexConfig {
        &self.config
    }

    /// Current protocol state
    pub fn state(&self) -> MutexState {
        self.lock().state
    }

    /// Current clock value
    pub fn clock(&self) -> u64 {
        self.lock().clock.now()
    }

    /// Our outstanding request, if any
    pub fn current_request(&self) -> Option<Request> {
        self.lock().my_request.clone()
    }

    /// Pending requests in total order
    pub fn queue_snapshot(&self) -> Vec<Request> {
        self.lock().queue.iter().cloned().collect()
    }

    /// Whether a process has a request in our queue
    pub fn has_pending_request(&self, process_id: &ProcessId) -> bool {
        self.lock().queue.contains(process_id)
    }

    /// Number of peers that replied to our current request
    pub fn reply_count(&self) -> usize {
        self.lock().replies.len()
    }

    fn illegal(operation: &'static str, state: MutexState) -> MutexError {
        MutexError::IllegalState { operation, state }
    }

    /// Every state change goes through here
    fn transition(inner: &mut ProtocolState, operation: &'static str, target: MutexState) -> Result<(), MutexError> {
        if !inner.state.can_transition_to(target) {
            return Err(Self::illegal(operation, inner.state));
        }
        inner.state = target;
        Ok(())
    }

    fn is_eligible(&self, inner: &ProtocolState) -> bool {
        let Some(mine) = inner.my_request.as_ref() else {
            return false;
        };

        inner.state == MutexState::Requesting
            && inner.queue.is_head(mine)
            && self.peers.iter().all(|p| inner.replies.contains(p))
    }

    fn send_to(&self, to: &ProcessId, message: PeerMessage) {
        if let Err(e) = self.messenger.send(to, message) {
            warn!(process_id = %self.process_id, peer = %e.peer, reason = %e.reason, "Peer unavailable");
        }
    }

    // ------------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------------

    /// Stamp a new request, queue it locally and send it to every peer.
    /// Does not wait; see `wait_until_eligible`.
    pub fn request_mutex(&self) -> Result<Request, MutexError> {
        let request = {
            let mut inner = self.lock();
            Self::transition(&mut inner, "request", MutexState::Requesting)?;

            let timestamp = inner.clock.tick();
            let request = Request::new(timestamp, self.process_id.clone());
            inner.queue.insert(request.clone());
            inner.replies.clear();
            inner.my_request = Some(request.clone());

            broadcast(self.messenger.as_ref(), &self.peers, &PeerMessage::request(&request));
            request
        };

        debug!(process_id = %self.process_id, timestamp = request.timestamp(), "Requested critical section");

        // With no peers the request may already be eligible
        self.changed.notify_waiters();
        Ok(request)
    }

    /// Own request heads the queue and every peer has replied
    pub fn can_enter(&self) -> bool {
        let inner = self.lock();
        self.is_eligible(&inner)
    }

    /// Move into the critical section. Only valid when `can_enter` holds.
    pub fn enter_critical_section(&self) -> Result<(), MutexError> {
        let mut inner = self.lock();
        if !self.is_eligible(&inner) {
            return Err(Self::illegal("enter", inner.state));
        }

        Self::transition(&mut inner, "enter", MutexState::InCriticalSection)?;
        info!(
            process_id = %self.process_id,
            timestamp = inner.my_request.as_ref().map(Request::timestamp),
            "Entered critical section"
        );
        Ok(())
    }

    /// Leave the critical section and tell every peer.
    /// Returns the timestamp carried by the RELEASE.
    pub fn release_mutex(&self) -> Result<u64, MutexError> {
        let timestamp = {
            let mut inner = self.lock();
            if inner.state != MutexState::InCriticalSection {
                return Err(Self::illegal("release", inner.state));
            }
            self.withdraw(&mut inner, "release")?
        };

        info!(process_id = %self.process_id, timestamp, "Released critical section");
        Ok(timestamp)
    }

    /// Give up an outstanding request without entering.
    /// Peers drop it from their queues on the RELEASE.
    pub fn cancel_request(&self) -> Result<u64, MutexError> {
        let timestamp = {
            let mut inner = self.lock();
            if inner.state != MutexState::Requesting {
                return Err(Self::illegal("cancel", inner.state));
            }
            self.withdraw(&mut inner, "cancel")?
        };

        warn!(process_id = %self.process_id, timestamp, "Withdrew request for critical section");
        Ok(timestamp)
    }

    fn withdraw(&self, inner: &mut ProtocolState, operation: &'static str) -> Result<u64, MutexError> {
        Self::transition(inner, operation, MutexState::Idle)?;
        inner.queue.remove(&self.process_id);
        inner.replies.clear();
        inner.my_request = None;

        let timestamp = inner.clock.tick();
        let release = PeerMessage::Release {
            process_id: self.process_id.clone(),
            timestamp,
        };
        broadcast(self.messenger.as_ref(), &self.peers, &release);
        Ok(timestamp)
    }

    /// Wait, without spinning, until `can_enter` holds.
    ///
    /// With a configured timeout the request is withdrawn on expiry and
    /// `MutexError::Timeout` is returned.
    pub async fn wait_until_eligible(&self) -> Result<(), MutexError> {
        match self.config.request_timeout {
            None => self.wait_for_turn().await,
            Some(limit) => match tokio::time::timeout(limit, self.wait_for_turn()).await {
                Ok(result) => result,
                Err(_) => {
                    // Eligibility may have arrived with the deadline
                    if self.can_enter() {
                        return Ok(());
                    }
                    self.cancel_request()?;
                    Err(MutexError::Timeout { waited: limit })
                }
            },
        }
    }

    async fn wait_for_turn(&self) -> Result<(), MutexError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a signal in between is not lost
            notified.as_mut().enable();

            {
                let inner = self.lock();
                if self.is_eligible(&inner) {
                    return Ok(());
                }
                if inner.state != MutexState::Requesting {
                    return Err(Self::illegal("wait", inner.state));
                }
            }

            notified.await;
        }
    }

    /// request_mutex, wait, enter. Returns the winning request.
    pub async fn acquire(&self) -> Result<Request, MutexError> {
        let request = self.request_mutex()?;
        self.wait_until_eligible().await?;
        if let Err(e) = self.enter_critical_section() {
            self.abandon_request();
            return Err(e);
        }
        Ok(request)
    }

    /// Withdraw whatever request is still outstanding so peers do not keep
    /// a stale entry queued. Nothing to withdraw is only worth a log line.
    fn abandon_request(&self) {
        if let Err(e) = self.cancel_request() {
            warn!(process_id = %self.process_id, error = %e, "Could not withdraw request");
        }
    }

    // ------------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------------

    /// Queue a peer's request and always reply with our own clock
    pub fn on_receive_request(&self, request: Request) {
        let requester = request.process_id().clone();
        let reply_timestamp = {
            let mut inner = self.lock();
            inner.clock.observe(request.timestamp());
            inner.queue.insert(request.clone());
            let timestamp = inner.clock.now();

            self.send_to(
                &requester,
                PeerMessage::Reply {
                    from: self.process_id.clone(),
                    timestamp,
                },
            );
            timestamp
        };

        debug!(
            process_id = %self.process_id,
            from = %requester,
            request_timestamp = request.timestamp(),
            reply_timestamp,
            "Queued request and replied"
        );
        self.changed.notify_waiters();
    }

    /// Count a reply towards the current request
    pub fn on_receive_reply(&self, from: ProcessId, timestamp: u64) {
        {
            let mut inner = self.lock();
            inner.clock.observe(timestamp);
            // A reply stamped before our request answers a withdrawn one
            let current = inner
                .my_request
                .as_ref()
                .is_some_and(|mine| timestamp > mine.timestamp());
            if inner.state == MutexState::Requesting && current && self.peers.contains(&from) {
                inner.replies.insert(from.clone());
            }
        }

        debug!(process_id = %self.process_id, %from, timestamp, "Received reply");
        self.changed.notify_waiters();
    }

    /// Drop a peer's request. A missing entry is not an error.
    pub fn on_receive_release(&self, from: ProcessId, timestamp: u64) {
        let removed = {
            let mut inner = self.lock();
            inner.clock.observe(timestamp);
            inner.queue.remove(&from).is_some()
        };

        debug!(process_id = %self.process_id, %from, timestamp, removed, "Received release");
        self.changed.notify_waiters();
    }
}

impl fmt::Debug for MutexCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexCoordinator")
            .field("process_id", &self.process_id)
            .field("peers", &self.peers)
            .field("state", &self.state())
            .finish()
    }
}
