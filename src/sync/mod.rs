//! # Synchronization Primitives
//!
//! The latch is the engine's only in-memory lock: nodes, caches, and queues
//! all guard their state with it. The commit lock is a single process-wide
//! instance built on a latch, coordinating mutators with checkpoint.
//!
//! Logical per-key locks are a different animal entirely and live in
//! [`crate::lock`]: latches are held for microseconds around byte
//! manipulation, while locks are transaction-scoped ownership tokens.

mod commit_lock;
mod latch;

pub use commit_lock::{CommitExclusive, CommitLock, CommitShared};
pub use latch::{ExclusiveGuard, Latch, LatchCondition, Latched, SharedGuard};
