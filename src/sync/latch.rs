//! # Latch
//!
//! A short-duration reader/writer lock protecting in-memory structures:
//! node bytes, cache tables, and queues. This is the only synchronization
//! primitive those layers use.
//!
//! ## Semantics
//!
//! - Many shared holders or one exclusive holder.
//! - Pending exclusive acquirers block new shared acquirers, so writers
//!   cannot starve behind a stream of readers.
//! - `downgrade` turns an exclusive hold into a shared hold and never
//!   fails.
//! - `try_upgrade` turns a shared hold into an exclusive hold without
//!   blocking. Upgrades never wait: a waiting upgrade deadlocks against any
//!   other shared holder attempting the same, so the caller must be
//!   prepared to release and retry.
//!
//! ## Conditions
//!
//! A [`LatchCondition`] parks a thread that holds the latch exclusively,
//! releasing the latch while parked and re-acquiring it before returning.
//! The condition's own mutex bridges the release/park gap so a signal
//! cannot be lost in between.
//!
//! ## Latched<T>
//!
//! [`Latched`] pairs a latch with the data it guards and hands out RAII
//! guards. Tree traversal uses the guards for hand-over-hand descent: take
//! the child guard, then drop the parent guard. The raw latch API remains
//! available for callers that manage hold durations manually.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LatchState {
    /// Number of shared holders.
    shared: usize,
    /// True while an exclusive holder exists.
    exclusive: bool,
    /// Exclusive acquirers currently parked. New shared acquirers defer to
    /// them.
    waiting_exclusive: usize,
}

/// One-writer/many-reader latch with condition support.
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    readers: Condvar,
    writers: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_shared(&self) {
        let mut state = self.state.lock();
        while state.exclusive || state.waiting_exclusive > 0 {
            self.readers.wait(&mut state);
        }
        state.shared += 1;
    }

    pub fn try_acquire_shared(&self) -> bool {
        let mut state = self.state.lock();
        if state.exclusive || state.waiting_exclusive > 0 {
            return false;
        }
        state.shared += 1;
        true
    }

    pub fn acquire_exclusive(&self) {
        let mut state = self.state.lock();
        state.waiting_exclusive += 1;
        while state.exclusive || state.shared > 0 {
            self.writers.wait(&mut state);
        }
        state.waiting_exclusive -= 1;
        state.exclusive = true;
    }

    pub fn try_acquire_exclusive(&self) -> bool {
        let mut state = self.state.lock();
        if state.exclusive || state.shared > 0 {
            return false;
        }
        state.exclusive = true;
        true
    }

    /// Exclusive to shared. Infallible; the hold is continuous.
    pub fn downgrade(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.exclusive);
        state.exclusive = false;
        state.shared = 1;
        drop(state);
        // Other readers may proceed; writers must wait for the shared hold.
        self.readers.notify_all();
    }

    /// Shared to exclusive, without blocking. Fails unless the caller is
    /// the only shared holder.
    pub fn try_upgrade(&self) -> bool {
        let mut state = self.state.lock();
        debug_assert!(state.shared > 0);
        if state.shared != 1 {
            return false;
        }
        state.shared = 0;
        state.exclusive = true;
        true
    }

    pub fn release_shared(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.shared > 0 && !state.exclusive);
        state.shared -= 1;
        let wake_writer = state.shared == 0 && state.waiting_exclusive > 0;
        drop(state);
        if wake_writer {
            self.writers.notify_one();
        }
    }

    pub fn release_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.exclusive);
        state.exclusive = false;
        let wake_writer = state.waiting_exclusive > 0;
        drop(state);
        if wake_writer {
            self.writers.notify_one();
        } else {
            self.readers.notify_all();
        }
    }
}

/// Condition bound to a latch held exclusively by the waiting thread.
#[derive(Debug, Default)]
pub struct LatchCondition {
    gate: Mutex<()>,
    cond: Condvar,
}

impl LatchCondition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks until signalled or the timeout elapses. The caller must hold
    /// `latch` exclusively; it is released while parked and re-acquired
    /// before returning. A negative timeout waits forever. Returns false on
    /// timeout.
    pub fn await_nanos(&self, latch: &Latch, nanos: i64) -> bool {
        // Taking the gate before releasing the latch closes the window in
        // which a signal could fire unseen.
        let mut gate = self.gate.lock();
        latch.release_exclusive();
        let signalled = if nanos < 0 {
            self.cond.wait(&mut gate);
            true
        } else {
            !self
                .cond
                .wait_for(&mut gate, Duration::from_nanos(nanos as u64))
                .timed_out()
        };
        drop(gate);
        latch.acquire_exclusive();
        signalled
    }

    pub fn signal(&self) {
        let _gate = self.gate.lock();
        self.cond.notify_one();
    }

    pub fn signal_all(&self) {
        let _gate = self.gate.lock();
        self.cond.notify_all();
    }
}

/// A latch fused with the value it guards, handing out RAII guards.
#[derive(Debug, Default)]
pub struct Latched<T> {
    latch: Latch,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is mediated by the latch. Shared guards hand
// out &T under a shared hold, exclusive guards &mut T under an exclusive
// hold, and a reference is only ever created while the corresponding hold
// is live.
unsafe impl<T: Send> Send for Latched<T> {}
unsafe impl<T: Send + Sync> Sync for Latched<T> {}

impl<T> Latched<T> {
    pub fn new(value: T) -> Self {
        Self {
            latch: Latch::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    pub fn read(&self) -> SharedGuard<'_, T> {
        self.latch.acquire_shared();
        SharedGuard { owner: self }
    }

    pub fn try_read(&self) -> Option<SharedGuard<'_, T>> {
        self.latch.try_acquire_shared().then(|| SharedGuard { owner: self })
    }

    pub fn write(&self) -> ExclusiveGuard<'_, T> {
        self.latch.acquire_exclusive();
        ExclusiveGuard { owner: self }
    }

    pub fn try_write(&self) -> Option<ExclusiveGuard<'_, T>> {
        self.latch
            .try_acquire_exclusive()
            .then(|| ExclusiveGuard { owner: self })
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct SharedGuard<'a, T> {
    owner: &'a Latched<T>,
}

impl<'a, T> SharedGuard<'a, T> {
    /// Attempts an in-place upgrade. On failure the shared hold is kept.
    pub fn try_upgrade(self) -> Result<ExclusiveGuard<'a, T>, SharedGuard<'a, T>> {
        if self.owner.latch.try_upgrade() {
            let owner = self.owner;
            std::mem::forget(self);
            Ok(ExclusiveGuard { owner })
        } else {
            Err(self)
        }
    }
}

impl<T> Deref for SharedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a shared hold is live for the guard's lifetime.
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> Drop for SharedGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.latch.release_shared();
    }
}

pub struct ExclusiveGuard<'a, T> {
    owner: &'a Latched<T>,
}

impl<'a, T> ExclusiveGuard<'a, T> {
    pub fn downgrade(self) -> SharedGuard<'a, T> {
        let owner = self.owner;
        std::mem::forget(self);
        owner.latch.downgrade();
        SharedGuard { owner }
    }

    /// Parks on `cond`, releasing the latch while parked. The guard must
    /// not be dereferenced by the caller during the wait (it cannot be,
    /// short of another thread; the borrow is held here).
    pub fn await_condition(&mut self, cond: &LatchCondition, nanos: i64) -> bool {
        cond.await_nanos(&self.owner.latch, nanos)
    }
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: an exclusive hold is live for the guard's lifetime.
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: an exclusive hold is live for the guard's lifetime, and
        // the &mut self receiver prevents aliased derefs from this guard.
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.latch.release_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_holders_coexist() {
        let latch = Latch::new();
        latch.acquire_shared();
        assert!(latch.try_acquire_shared());
        assert!(!latch.try_acquire_exclusive());
        latch.release_shared();
        latch.release_shared();
        assert!(latch.try_acquire_exclusive());
        latch.release_exclusive();
    }

    #[test]
    fn exclusive_excludes_everyone() {
        let latch = Latch::new();
        latch.acquire_exclusive();
        assert!(!latch.try_acquire_shared());
        assert!(!latch.try_acquire_exclusive());
        latch.release_exclusive();
    }

    #[test]
    fn downgrade_keeps_hold() {
        let latch = Latch::new();
        latch.acquire_exclusive();
        latch.downgrade();
        assert!(!latch.try_acquire_exclusive());
        assert!(latch.try_acquire_shared());
        latch.release_shared();
        latch.release_shared();
    }

    #[test]
    fn try_upgrade_requires_sole_holder() {
        let latch = Latch::new();
        latch.acquire_shared();
        latch.acquire_shared();
        assert!(!latch.try_upgrade());
        latch.release_shared();
        assert!(latch.try_upgrade());
        latch.release_exclusive();
    }

    #[test]
    fn pending_exclusive_blocks_new_shared() {
        let latch = Arc::new(Latch::new());
        latch.acquire_shared();

        let l2 = Arc::clone(&latch);
        let writer = thread::spawn(move || {
            l2.acquire_exclusive();
            l2.release_exclusive();
        });

        // Give the writer time to park.
        thread::sleep(Duration::from_millis(50));
        assert!(!latch.try_acquire_shared());

        latch.release_shared();
        writer.join().unwrap();
    }

    #[test]
    fn condition_wakes_waiter() {
        let latch = Arc::new(Latch::new());
        let cond = Arc::new(LatchCondition::new());
        let woke = Arc::new(AtomicUsize::new(0));

        let (l2, c2, w2) = (Arc::clone(&latch), Arc::clone(&cond), Arc::clone(&woke));
        let waiter = thread::spawn(move || {
            l2.acquire_exclusive();
            let signalled = c2.await_nanos(&l2, 5_000_000_000);
            assert!(signalled);
            w2.fetch_add(1, Ordering::SeqCst);
            l2.release_exclusive();
        });

        thread::sleep(Duration::from_millis(50));
        cond.signal();
        waiter.join().unwrap();
        assert_eq!(woke.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn condition_times_out() {
        let latch = Latch::new();
        let cond = LatchCondition::new();
        latch.acquire_exclusive();
        let signalled = cond.await_nanos(&latch, 10_000_000);
        assert!(!signalled);
        latch.release_exclusive();
    }

    #[test]
    fn latched_guards_round_trip() {
        let cell = Latched::new(41u32);
        {
            let mut guard = cell.write();
            *guard += 1;
        }
        let guard = cell.read();
        assert_eq!(*guard, 42);
    }

    #[test]
    fn latched_guard_upgrade_and_downgrade() {
        let cell = Latched::new(vec![1, 2, 3]);
        let shared = cell.read();
        let mut excl = shared.try_upgrade().ok().unwrap();
        excl.push(4);
        let shared = excl.downgrade();
        assert_eq!(shared.len(), 4);
    }

    #[test]
    fn latched_concurrent_increments() {
        let cell = Arc::new(Latched::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&cell);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *c.write() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*cell.read(), 8000);
    }
}
