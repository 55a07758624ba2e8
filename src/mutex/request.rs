// Requests and the pending-request queue
//
// Requests are ranked by (timestamp, process id). The queue holds at most one
// request per process, so "my request is the head" and "no request orders
// before mine" are the same predicate.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Identifier of a process taking part in the protocol
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(String);

impl ProcessId {
    /// Create a process ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProcessId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A request to enter the critical section
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    timestamp: u64,
    process_id: ProcessId,
}

impl Request {
    /// Create a new request
    pub fn new(timestamp: u64, process_id: ProcessId) -> Self {
        Self {
            timestamp,
            process_id,
        }
    }

    /// Lamport timestamp the request was stamped with
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Owner of the request
    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }
}

impl Ord for Request {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.process_id.cmp(&other.process_id))
    }
}

impl PartialOrd for Request {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.process_id)
    }
}

/// Pending requests, at most one per process, ordered by the request order
#[derive(Clone, Debug, Default)]
pub struct RequestQueue {
    /// Index: process -> its outstanding request
    by_process: HashMap<ProcessId, Request>,
    /// Requests in total order
    ordered: BTreeSet<Request>,
}

impl RequestQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Insert a request, replacing any other request of the same process.
    /// Returns false if the identical request was already queued.
    pub fn insert(&mut self, request: Request) -> bool {
        match self.by_process.get(request.process_id()) {
            Some(existing) if existing == &request => return false,
            Some(existing) => {
                self.ordered.remove(existing);
            }
            None => {}
        }

        self.ordered.insert(request.clone());
        self.by_process.insert(request.process_id().clone(), request);
        true
    }

    /// Remove the request owned by a process, if any
    pub fn remove(&mut self, process_id: &ProcessId) -> Option<Request> {
        let request = self.by_process.remove(process_id)?;
        self.ordered.remove(&request);
        Some(request)
    }

    /// Get the request owned by a process
    pub fn get(&self, process_id: &ProcessId) -> Option<&Request> {
        self.by_process.get(process_id)
    }

    /// Check whether a process has a pending request
    pub fn contains(&self, process_id: &ProcessId) -> bool {
        self.by_process.contains_key(process_id)
    }

    /// The smallest request under the total order
    pub fn head(&self) -> Option<&Request> {
        self.ordered.first()
    }

    /// Whether the given request is the smallest pending request
    pub fn is_head(&self, request: &Request) -> bool {
        self.head() == Some(request)
    }

    /// Pending requests in total order
    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.ordered.iter()
    }
}
