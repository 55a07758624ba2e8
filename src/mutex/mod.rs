// Mutex module - WHO GOES NEXT
// Lamport's distributed mutual exclusion over a fixed set of processes

mod coordinator;
mod request;

pub use coordinator::{MutexConfig, MutexCoordinator, MutexError, MutexState};
pub use request::{ProcessId, Request, RequestQueue};
