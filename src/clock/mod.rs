// Clock module - LOGICAL TIME
// Lamport clock shared by every protocol event of a process

mod lamport;

pub use lamport::LogicalClock;
