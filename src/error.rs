//! Typed error kinds.
//!
//! Most code paths report failures through `eyre::Result` with context, but
//! the engine must let callers distinguish a handful of conditions: lock
//! failures (retryable), corruption (fatal), a full database, and misuse of
//! closed or broken handles. Those conditions are concrete types, bailed
//! through eyre so a caller can `downcast_ref` on the chain root.

use thiserror::Error;

/// Why a lock acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFailureKind {
    TimedOut,
    Interrupted,
    IllegalUpgrade,
    Deadlock,
}

#[derive(Debug, Error)]
#[error("lock request failed: {kind:?} (index {index_id}, waited {nanos_timeout}ns)")]
pub struct LockFailure {
    pub kind: LockFailureKind,
    pub index_id: u64,
    pub nanos_timeout: u64,
}

/// Deadlock detected while waiting on a lock. Carries the set of lockers
/// participating in the cycle, for diagnostics.
#[derive(Debug, Error)]
#[error("deadlock detected: {cycle:?} (index {index_id})")]
pub struct DeadlockError {
    pub index_id: u64,
    pub cycle: Vec<u64>,
}

/// An invariant violation was detected while reading a page: bad header,
/// illegal node type, key ordering violation, or a garbage accounting
/// mismatch. The database cannot be trusted past this point.
#[derive(Debug, Error)]
#[error("corrupt database: {0}")]
pub struct CorruptDatabase(pub String);

/// The underlying page array refused a write or reported an I/O error.
#[derive(Debug, Error)]
#[error("write failed for page {page_id}: {detail}")]
pub struct WriteFailure {
    pub page_id: u64,
    pub detail: String,
}

/// Page allocation exhausted the configured capacity.
#[derive(Debug, Error)]
#[error("database full: {page_count} pages allocated, limit {page_limit}")]
pub struct DatabaseFull {
    pub page_count: u64,
    pub page_limit: u64,
}

/// A redo write was attempted in a role that forbids it. The commit may
/// still proceed using only undo/local state.
#[derive(Debug, Error)]
#[error("unmodifiable replica")]
pub struct UnmodifiableReplica;

/// Operation attempted on a borked or bogus transaction.
#[derive(Debug, Error)]
#[error("invalid transaction: {0}")]
pub struct InvalidTransaction(pub String);

/// Mutation attempted on an index whose root has been closed.
#[derive(Debug, Error)]
#[error("index {0} is closed")]
pub struct ClosedIndex(pub u64);

/// True if the error chain bottoms out in a lock failure of any kind,
/// including deadlock.
pub fn is_lock_failure(err: &eyre::Report) -> bool {
    err.downcast_ref::<LockFailure>().is_some() || err.downcast_ref::<DeadlockError>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_failure_downcasts_through_eyre() {
        let report = eyre::Report::new(LockFailure {
            kind: LockFailureKind::TimedOut,
            index_id: 7,
            nanos_timeout: 50,
        });
        let failure = report.downcast_ref::<LockFailure>().unwrap();
        assert_eq!(failure.kind, LockFailureKind::TimedOut);
        assert!(is_lock_failure(&report));
    }

    #[test]
    fn deadlock_counts_as_lock_failure() {
        let report = eyre::Report::new(DeadlockError {
            index_id: 1,
            cycle: vec![1, 2],
        });
        assert!(is_lock_failure(&report));
    }

    #[test]
    fn corrupt_database_formats_detail() {
        let err = CorruptDatabase("reserved byte is 3".into());
        assert!(err.to_string().contains("reserved byte"));
    }
}
