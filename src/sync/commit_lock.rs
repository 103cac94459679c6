//! # Commit Lock
//!
//! Process-wide shared/exclusive gate between mutators and the
//! checkpointer. Every data-plane write holds it in shared mode for the
//! duration of the operation; checkpoint takes it exclusively just long
//! enough to flip the dirty generation and capture the redo cut-off.
//!
//! This is a separate primitive from the per-node latches. A thread must
//! never wait on the commit lock while holding a node latch: the
//! checkpointer scans latched nodes while holding the commit lock
//! exclusively, and the combination would deadlock.

use super::latch::Latch;

#[derive(Debug, Default)]
pub struct CommitLock {
    latch: Latch,
}

impl CommitLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared hold for a single mutation.
    pub fn shared(&self) -> CommitShared<'_> {
        self.latch.acquire_shared();
        CommitShared { lock: self }
    }

    /// Exclusive hold for checkpoint quiescing. Blocks until in-flight
    /// mutations drain.
    pub fn exclusive(&self) -> CommitExclusive<'_> {
        self.latch.acquire_exclusive();
        CommitExclusive { lock: self }
    }
}

pub struct CommitShared<'a> {
    lock: &'a CommitLock,
}

impl Drop for CommitShared<'_> {
    fn drop(&mut self) {
        self.lock.latch.release_shared();
    }
}

pub struct CommitExclusive<'a> {
    lock: &'a CommitLock,
}

impl Drop for CommitExclusive<'_> {
    fn drop(&mut self) {
        self.lock.latch.release_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn mutators_share() {
        let lock = CommitLock::new();
        let a = lock.shared();
        let b = lock.shared();
        drop(a);
        drop(b);
    }

    #[test]
    fn checkpoint_waits_for_mutators() {
        let lock = Arc::new(CommitLock::new());
        let guard = lock.shared();

        let l2 = Arc::clone(&lock);
        let checkpointer = thread::spawn(move || {
            let _excl = l2.exclusive();
        });

        thread::sleep(Duration::from_millis(20));
        drop(guard);
        checkpointer.join().unwrap();
    }
}
