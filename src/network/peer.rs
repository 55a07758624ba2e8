// Peer Registry - the fixed set of processes this one talks to
//
// Membership is decided at start-up from configuration and never changes.

use crate::mutex::ProcessId;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use thiserror::Error;

/// Peer-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Cannot add self as a peer")]
    CannotAddSelf,

    #[error("Peer {0} registered twice")]
    DuplicatePeer(ProcessId),
}

/// Registry of known peers and their addresses
#[derive(Clone, Debug)]
pub struct PeerRegistry {
    /// Our own process ID
    my_id: ProcessId,
    /// Peers ordered by process ID
    peers: BTreeMap<ProcessId, SocketAddr>,
}

impl PeerRegistry {
    /// Create a registry with no peers
    pub fn new(my_id: ProcessId) -> Self {
        Self {
            my_id,
            peers: BTreeMap::new(),
        }
    }

    /// Build a registry from (id, address) pairs
    pub fn from_peers<I>(my_id: ProcessId, peers: I) -> Result<Self, PeerError>
    where
        I: IntoIterator<Item = (ProcessId, SocketAddr)>,
    {
        let mut registry = Self::new(my_id);
        for (id, address) in peers {
            registry.add_peer(id, address)?;
        }
        Ok(registry)
    }

    /// Our own process ID
    pub fn my_id(&self) -> &ProcessId {
        &self.my_id
    }

    /// Register a peer
    pub fn add_peer(&mut self, id: ProcessId, address: SocketAddr) -> Result<(), PeerError> {
        if id == self.my_id {
            return Err(PeerError::CannotAddSelf);
        }
        if self.peers.contains_key(&id) {
            return Err(PeerError::DuplicatePeer(id));
        }
        self.peers.insert(id, address);
        Ok(())
    }

    /// Peer IDs in order
    pub fn peer_ids(&self) -> Vec<ProcessId> {
        self.peers.keys().cloned().collect()
    }

    /// Iterate over (id, address) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&ProcessId, &SocketAddr)> {
        self.peers.iter()
    }

    /// Number of peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if there are no peers
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
