//! Locker: a scoped stack of acquired locks.
//!
//! A locker is used by one thread at a time. Acquired locks are pushed
//! onto a chain of fixed-capacity blocks — the first holds 8 entries and
//! capacities double up to 64 — with a bitmap marking which entries are
//! upgrades rather than initial acquisitions. An upgrade entry is only
//! ever released back down to upgradable; releasing it fully would strip
//! ownership the stack still accounts for elsewhere.
//!
//! An upgrade that immediately follows its own acquisition within the
//! same scope is suppressed: the earlier entry alone then releases the
//! lock fully, which is what `unlock_last` relies on.
//!
//! Scopes capture the stack tail on entry; exiting a scope releases
//! everything acquired since, and committing a nested scope instead
//! promotes those locks to the parent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, Result};
use smallvec::SmallVec;

use super::{lock_hash, LockKey, LockManager, LockResult, LockerId};
use crate::error::{LockFailure, LockFailureKind};

const FIRST_BLOCK_CAPACITY: usize = 8;
// Limited by the bits available in the upgrades bitmap.
const HIGHEST_BLOCK_CAPACITY: usize = 64;

static NEXT_LOCKER_ID: AtomicU64 = AtomicU64::new(1);

/// A ghost to reap at commit: the key whose leaf slot holds a logical
/// delete.
#[derive(Debug, Clone)]
pub(crate) struct GhostRef {
    pub index_id: u64,
    pub key: Vec<u8>,
    pub hash: u64,
}

#[derive(Debug, Clone)]
struct HeldLock {
    index_id: u64,
    key: Vec<u8>,
    hash: u64,
}

impl HeldLock {
    fn lock_key(&self) -> LockKey {
        LockKey {
            index_id: self.index_id,
            key: self.key.clone(),
        }
    }

    fn same_lock(&self, index_id: u64, key: &[u8]) -> bool {
        self.index_id == index_id && self.key == key
    }
}

struct Block {
    locks: Vec<HeldLock>,
    upgrades: u64,
    prev: Option<Box<Block>>,
}

impl Block {
    fn new(capacity: usize, prev: Option<Box<Block>>) -> Self {
        Self {
            locks: Vec::with_capacity(capacity),
            upgrades: 0,
            prev,
        }
    }

    fn is_full(&self) -> bool {
        self.locks.len() == self.locks.capacity()
    }

    fn next_capacity(&self) -> usize {
        (self.locks.capacity() << 1).min(HIGHEST_BLOCK_CAPACITY)
    }
}

struct ParentScope {
    /// Total locks held when the scope was entered.
    lock_count: usize,
}

pub struct Locker {
    id: LockerId,
    manager: Arc<LockManager>,
    /// None when no locks are held.
    tail: Option<Box<Block>>,
    lock_count: usize,
    scopes: Vec<ParentScope>,
    ghosts: SmallVec<[GhostRef; 4]>,
}

impl Locker {
    pub fn new(manager: Arc<LockManager>) -> Self {
        Self {
            id: NEXT_LOCKER_ID.fetch_add(1, Ordering::Relaxed),
            manager,
            tail: None,
            lock_count: 0,
            scopes: Vec::new(),
            ghosts: SmallVec::new(),
        }
    }

    pub fn id(&self) -> LockerId {
        self.id
    }

    fn scope_start(&self) -> usize {
        self.scopes.last().map(|s| s.lock_count).unwrap_or(0)
    }

    fn push(&mut self, held: HeldLock, upgrade: bool) {
        // Suppress an upgrade of the lock acquired immediately before it
        // within this scope.
        if upgrade && self.lock_count > self.scope_start() {
            if let Some(tail) = &self.tail {
                if let Some(last) = tail.locks.last() {
                    if last.same_lock(held.index_id, &held.key) {
                        return;
                    }
                }
            }
        }

        let needs_block = match &self.tail {
            None => true,
            Some(tail) => tail.is_full(),
        };
        if needs_block {
            let capacity = match &self.tail {
                None => FIRST_BLOCK_CAPACITY,
                Some(tail) => tail.next_capacity(),
            };
            let prev = self.tail.take();
            self.tail = Some(Box::new(Block::new(capacity, prev)));
        }

        let tail = self.tail.as_mut().expect("tail block exists");
        if upgrade {
            tail.upgrades |= 1u64 << tail.locks.len();
        }
        tail.locks.push(held);
        self.lock_count += 1;
    }

    fn pop_entry(&mut self) -> Option<(HeldLock, bool)> {
        let tail = self.tail.as_mut()?;
        let index = tail.locks.len().checked_sub(1)?;
        let held = tail.locks.pop().expect("non-empty block");
        let upgrade = tail.upgrades & (1u64 << index) != 0;
        tail.upgrades &= !(1u64 << index);
        if tail.locks.is_empty() {
            let prev = tail.prev.take();
            self.tail = prev;
        }
        self.lock_count -= 1;
        Some((held, upgrade))
    }

    fn record(&mut self, index_id: u64, key: &[u8], hash: u64, result: LockResult) {
        match result {
            LockResult::Acquired => self.push(
                HeldLock {
                    index_id,
                    key: key.to_vec(),
                    hash,
                },
                false,
            ),
            LockResult::Upgraded => self.push(
                HeldLock {
                    index_id,
                    key: key.to_vec(),
                    hash,
                },
                true,
            ),
            _ => {}
        }
    }

    /// Shared acquisition. Timeouts trigger deadlock detection; a
    /// detected cycle surfaces as `DeadlockError`.
    pub fn try_lock_shared(
        &mut self,
        index_id: u64,
        key: &[u8],
        timeout: Duration,
    ) -> Result<LockResult> {
        let hash = lock_hash(index_id, key);
        let lock_key = LockKey {
            index_id,
            key: key.to_vec(),
        };
        let result = self
            .manager
            .try_lock_shared(self.id, &lock_key, hash, timeout);
        self.after_attempt(index_id, key, hash, result, timeout)
    }

    pub fn try_lock_upgradable(
        &mut self,
        index_id: u64,
        key: &[u8],
        timeout: Duration,
    ) -> Result<LockResult> {
        let hash = lock_hash(index_id, key);
        let lock_key = LockKey {
            index_id,
            key: key.to_vec(),
        };
        let result = self
            .manager
            .try_lock_upgradable(self.id, &lock_key, hash, timeout);
        self.after_attempt(index_id, key, hash, result, timeout)
    }

    pub fn try_lock_exclusive(
        &mut self,
        index_id: u64,
        key: &[u8],
        timeout: Duration,
    ) -> Result<LockResult> {
        let hash = lock_hash(index_id, key);
        let lock_key = LockKey {
            index_id,
            key: key.to_vec(),
        };
        let result = self
            .manager
            .try_lock_exclusive(self.id, &lock_key, hash, timeout);
        self.after_attempt(index_id, key, hash, result, timeout)
    }

    fn after_attempt(
        &mut self,
        index_id: u64,
        key: &[u8],
        hash: u64,
        result: LockResult,
        timeout: Duration,
    ) -> Result<LockResult> {
        if result == LockResult::TimedOutLock {
            if let Some(deadlock) = self.manager.detect_deadlock(self.id, index_id) {
                self.manager.clear_wait(self.id);
                return Err(deadlock.into());
            }
            self.manager.clear_wait(self.id);
        }
        self.record(index_id, key, hash, result);
        Ok(result)
    }

    /// Like `try_lock_*` but converts refusals into `LockFailure` errors.
    pub fn lock_exclusive(
        &mut self,
        index_id: u64,
        key: &[u8],
        timeout: Duration,
    ) -> Result<LockResult> {
        let result = self.try_lock_exclusive(index_id, key, timeout)?;
        if result.is_granted() {
            return Ok(result);
        }
        Err(lock_failure(result, index_id, timeout))
    }

    pub fn lock_shared(
        &mut self,
        index_id: u64,
        key: &[u8],
        timeout: Duration,
    ) -> Result<LockResult> {
        let result = self.try_lock_shared(index_id, key, timeout)?;
        if result.is_granted() {
            return Ok(result);
        }
        Err(lock_failure(result, index_id, timeout))
    }

    pub fn lock_upgradable(
        &mut self,
        index_id: u64,
        key: &[u8],
        timeout: Duration,
    ) -> Result<LockResult> {
        let result = self.try_lock_upgradable(index_id, key, timeout)?;
        if result.is_granted() {
            return Ok(result);
        }
        Err(lock_failure(result, index_id, timeout))
    }

    /// Ownership check.
    pub fn lock_check(&self, index_id: u64, key: &[u8]) -> LockResult {
        let hash = lock_hash(index_id, key);
        let lock_key = LockKey {
            index_id,
            key: key.to_vec(),
        };
        self.manager.check(self.id, &lock_key, hash)
    }

    /// Fully releases the last lock acquired in the current scope.
    /// Refuses to release a non-immediate upgrade, which would strip
    /// ownership an earlier stack entry still accounts for.
    pub fn unlock_last(&mut self) -> Result<()> {
        if self.lock_count == 0 || self.lock_count == self.scope_start() {
            bail!("no locks held in this scope");
        }
        let tail = self.tail.as_ref().expect("locks held");
        let index = tail.locks.len() - 1;
        if tail.upgrades & (1u64 << index) != 0 {
            bail!("cannot fully unlock a non-immediate upgrade");
        }
        let (held, _) = self.pop_entry().expect("locks held");
        self.manager.unlock(self.id, &held.lock_key(), held.hash);
        Ok(())
    }

    /// Releases the last acquired lock down to upgradable strength.
    pub fn unlock_last_to_upgradable(&mut self) -> Result<()> {
        if self.lock_count == 0 || self.lock_count == self.scope_start() {
            bail!("no locks held in this scope");
        }
        let tail = self.tail.as_mut().expect("locks held");
        let index = tail.locks.len() - 1;
        let upgrade = tail.upgrades & (1u64 << index) != 0;
        if upgrade {
            // The upgrade entry is consumed; the earlier entry still owns
            // the upgradable hold.
            let (held, _) = self.pop_entry().expect("locks held");
            self.manager
                .unlock_to_upgradable(self.id, &held.lock_key(), held.hash);
        } else {
            let held = tail.locks[index].clone();
            self.manager
                .unlock_to_upgradable(self.id, &held.lock_key(), held.hash);
        }
        Ok(())
    }

    /// Remembers a ghosted key for reaping at commit, and flags the lock.
    pub(crate) fn add_ghost(&mut self, index_id: u64, key: &[u8]) {
        let hash = lock_hash(index_id, key);
        let lock_key = LockKey {
            index_id,
            key: key.to_vec(),
        };
        self.manager.mark_ghosted(self.id, &lock_key, hash);
        self.ghosts.push(GhostRef {
            index_id,
            key: key.to_vec(),
            hash,
        });
    }

    /// Takes the accumulated ghost set for reaping.
    pub(crate) fn take_ghosts(&mut self) -> SmallVec<[GhostRef; 4]> {
        std::mem::take(&mut self.ghosts)
    }

    /// Enters a nested scope, capturing the stack tail.
    pub fn scope_enter(&mut self) {
        self.scopes.push(ParentScope {
            lock_count: self.lock_count,
        });
    }

    /// Promotes all locks of the current scope into the parent and exits
    /// the scope without releasing anything.
    pub fn promote_scope(&mut self) {
        self.scopes.pop();
    }

    /// Releases all locks acquired since the current scope's entry,
    /// honoring the upgrade bitmap: upgrades are only downgraded back to
    /// upgradable, never fully released.
    pub fn scope_unlock_all(&mut self) {
        let target = self.scope_start();
        while self.lock_count > target {
            let (held, upgrade) = self.pop_entry().expect("counted locks exist");
            if upgrade {
                self.manager
                    .unlock_to_upgradable(self.id, &held.lock_key(), held.hash);
            } else {
                self.manager.unlock(self.id, &held.lock_key(), held.hash);
            }
        }
    }

    /// Exits the current scope, releasing its locks.
    pub fn scope_exit(&mut self) {
        self.scope_unlock_all();
        self.scopes.pop();
    }

    /// Releases every lock and exits every scope.
    pub fn scope_exit_all(&mut self) {
        self.scopes.clear();
        self.scope_unlock_all();
        self.ghosts.clear();
    }

    pub fn held_lock_count(&self) -> usize {
        self.lock_count
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        self.scope_exit_all();
    }
}

fn lock_failure(result: LockResult, index_id: u64, timeout: Duration) -> eyre::Report {
    let kind = match result {
        LockResult::Illegal => LockFailureKind::IllegalUpgrade,
        LockResult::Interrupted => LockFailureKind::Interrupted,
        _ => LockFailureKind::TimedOut,
    };
    LockFailure {
        kind,
        index_id,
        nanos_timeout: timeout.as_nanos().min(u64::MAX as u128) as u64,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(20);

    fn locker() -> (Arc<LockManager>, Locker) {
        let manager = Arc::new(LockManager::new());
        let locker = Locker::new(Arc::clone(&manager));
        (manager, locker)
    }

    #[test]
    fn acquire_and_unlock_last() {
        let (_mgr, mut locker) = locker();
        assert_eq!(
            locker.try_lock_exclusive(1, b"k", T).unwrap(),
            LockResult::Acquired
        );
        assert_eq!(locker.held_lock_count(), 1);
        assert_eq!(locker.lock_check(1, b"k"), LockResult::OwnedExclusive);

        locker.unlock_last().unwrap();
        assert_eq!(locker.held_lock_count(), 0);
        assert_eq!(locker.lock_check(1, b"k"), LockResult::Unowned);
    }

    #[test]
    fn block_chain_grows_past_first_capacity() {
        let (_mgr, mut locker) = locker();
        for i in 0..100u32 {
            let key = i.to_be_bytes();
            assert_eq!(
                locker.try_lock_exclusive(1, &key, T).unwrap(),
                LockResult::Acquired
            );
        }
        assert_eq!(locker.held_lock_count(), 100);
        locker.scope_exit_all();
        assert_eq!(locker.held_lock_count(), 0);
        assert_eq!(locker.lock_check(1, &5u32.to_be_bytes()), LockResult::Unowned);
    }

    #[test]
    fn immediate_upgrade_is_suppressed() {
        let (_mgr, mut locker) = locker();
        assert_eq!(
            locker.try_lock_upgradable(1, b"k", T).unwrap(),
            LockResult::Acquired
        );
        assert_eq!(
            locker.try_lock_exclusive(1, b"k", T).unwrap(),
            LockResult::Upgraded
        );
        // One stack entry: unlock_last fully releases.
        assert_eq!(locker.held_lock_count(), 1);
        locker.unlock_last().unwrap();
        assert_eq!(locker.lock_check(1, b"k"), LockResult::Unowned);
    }

    #[test]
    fn non_immediate_upgrade_refuses_full_unlock() {
        let (_mgr, mut locker) = locker();
        locker.try_lock_upgradable(1, b"a", T).unwrap();
        locker.try_lock_shared(1, b"b", T).unwrap();
        assert_eq!(
            locker.try_lock_exclusive(1, b"a", T).unwrap(),
            LockResult::Upgraded
        );
        assert_eq!(locker.held_lock_count(), 3);
        assert!(locker.unlock_last().is_err());

        locker.unlock_last_to_upgradable().unwrap();
        assert_eq!(locker.lock_check(1, b"a"), LockResult::OwnedUpgradable);
    }

    #[test]
    fn scope_exit_releases_only_scope_locks() {
        let (_mgr, mut locker) = locker();
        locker.try_lock_exclusive(1, b"outer", T).unwrap();
        locker.scope_enter();
        locker.try_lock_exclusive(1, b"inner", T).unwrap();

        locker.scope_exit();
        assert_eq!(locker.lock_check(1, b"inner"), LockResult::Unowned);
        assert_eq!(locker.lock_check(1, b"outer"), LockResult::OwnedExclusive);
    }

    #[test]
    fn scope_upgrade_downgrades_on_exit() {
        let (_mgr, mut locker) = locker();
        locker.try_lock_upgradable(1, b"k", T).unwrap();
        locker.scope_enter();
        locker.try_lock_shared(1, b"other", T).unwrap();
        assert_eq!(
            locker.try_lock_exclusive(1, b"k", T).unwrap(),
            LockResult::Upgraded
        );

        locker.scope_exit();
        // The outer scope still owns the upgradable hold.
        assert_eq!(locker.lock_check(1, b"k"), LockResult::OwnedUpgradable);
        assert_eq!(locker.lock_check(1, b"other"), LockResult::Unowned);
    }

    #[test]
    fn promote_moves_locks_to_parent_scope() {
        let (_mgr, mut locker) = locker();
        locker.scope_enter();
        locker.try_lock_exclusive(1, b"k", T).unwrap();
        locker.promote_scope();

        // The lock survives; a later full exit releases it.
        assert_eq!(locker.lock_check(1, b"k"), LockResult::OwnedExclusive);
        locker.scope_exit_all();
        assert_eq!(locker.lock_check(1, b"k"), LockResult::Unowned);
    }

    #[test]
    fn two_lockers_conflict_and_hand_over() {
        let (mgr, mut a) = locker();
        let mut b = Locker::new(Arc::clone(&mgr));

        a.try_lock_exclusive(9, b"key", T).unwrap();
        let denied = b
            .try_lock_shared(9, b"key", Duration::from_millis(50))
            .unwrap();
        assert_eq!(denied, LockResult::TimedOutLock);

        a.scope_exit_all();
        let granted = b.try_lock_shared(9, b"key", T).unwrap();
        assert_eq!(granted, LockResult::Acquired);
    }

    #[test]
    fn ghost_set_accumulates_and_drains() {
        let (mgr, mut locker) = locker();
        locker.try_lock_exclusive(3, b"gone", T).unwrap();
        locker.add_ghost(3, b"gone");

        let lock_key = LockKey {
            index_id: 3,
            key: b"gone".to_vec(),
        };
        assert!(mgr.is_ghosted(&lock_key, lock_hash(3, b"gone")));

        let ghosts = locker.take_ghosts();
        assert_eq!(ghosts.len(), 1);
        assert_eq!(ghosts[0].key, b"gone");
        assert!(locker.take_ghosts().is_empty());
    }

    #[test]
    fn dropping_locker_releases_everything() {
        let (mgr, mut locker) = locker();
        locker.try_lock_exclusive(1, b"k", T).unwrap();
        drop(locker);

        let mut other = Locker::new(mgr);
        assert_eq!(
            other.try_lock_exclusive(1, b"k", T).unwrap(),
            LockResult::Acquired
        );
    }
}
