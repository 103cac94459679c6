//! # Lock Manager
//!
//! Logical, per-(index, key) ownership tokens, scoped to transactions.
//! Latches serialize microsecond-scale byte manipulation; locks serialize
//! transactions and can be held for their whole lifetime.
//!
//! ## Lock compatibility
//!
//! ```text
//! state        | new shared | new upgradable | new exclusive
//! -------------+------------+----------------+--------------
//! UNOWNED      | yes        | yes            | yes
//! SHARED (N)   | yes        | yes*           | no
//! UPGRADABLE U | yes        | no (U: owned)  | U only (UPGRADED)
//! EXCLUSIVE X  | X: owned   | X: owned       | X: owned
//!
//! * only while no upgradable owner exists
//! ```
//!
//! Upgrading a bare shared hold to exclusive is ILLEGAL: two shared
//! holders upgrading would deadlock against each other, so the upgrade
//! path runs through the upgradable state instead.
//!
//! ## Waiting and deadlocks
//!
//! Acquisition waits are bounded by a per-request timeout. A locker that
//! times out leaves its wait-for edge registered; the locker front end
//! walks the wait-for graph (lock → holders → the locks those holders
//! wait on) and reports a cycle as a deadlock, without ever modifying
//! lock state.
//!
//! ## Ghosts
//!
//! A transactional delete marks the lock ghosted: other transactions
//! blocked on the key learn of the delete only after commit, when the
//! ghost is reaped and the lock released.

mod locker;

pub use locker::Locker;
pub(crate) use locker::GhostRef;

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::config::LOCK_TABLE_SHARD_COUNT;
use crate::error::DeadlockError;
use crate::storage::scramble;

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// Not granted: timed out waiting.
    TimedOutLock,
    /// Not granted: waiter was interrupted.
    Interrupted,
    /// Not granted: shared-to-exclusive upgrade attempted.
    Illegal,
    /// Granted; caller now owns the lock.
    Acquired,
    /// Granted via upgrade from an upgradable hold.
    Upgraded,
    /// Already owned at shared strength; no new unlock is owed.
    OwnedShared,
    /// Already owned at upgradable strength.
    OwnedUpgradable,
    /// Already owned at exclusive strength.
    OwnedExclusive,
    /// Ownership check result only.
    Unowned,
}

impl LockResult {
    pub fn is_granted(self) -> bool {
        matches!(
            self,
            LockResult::Acquired
                | LockResult::Upgraded
                | LockResult::OwnedShared
                | LockResult::OwnedUpgradable
                | LockResult::OwnedExclusive
        )
    }

    /// True when the caller acquired something it must later release.
    pub fn is_new_acquisition(self) -> bool {
        matches!(self, LockResult::Acquired | LockResult::Upgraded)
    }
}

pub(crate) type LockerId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct LockKey {
    pub index_id: u64,
    pub key: Vec<u8>,
}

pub(crate) fn lock_hash(index_id: u64, key: &[u8]) -> u64 {
    let mut h = scramble(index_id);
    for chunk in key.chunks(8) {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        h = scramble(h ^ u64::from_le_bytes(word));
    }
    h
}

#[derive(Debug, Default)]
struct LockEntry {
    /// Upgradable or exclusive owner.
    owner: Option<LockerId>,
    /// True when `owner` holds the lock exclusively.
    exclusive: bool,
    shared: SmallVec<[LockerId; 4]>,
    /// Set by delete-at-commit; reaped when the owner commits.
    ghosted: bool,
    waiting_exclusive: u32,
}

impl LockEntry {
    fn is_unowned(&self) -> bool {
        self.owner.is_none() && self.shared.is_empty()
    }

    fn owns_shared(&self, id: LockerId) -> bool {
        self.shared.contains(&id)
    }
}

struct Shard {
    locks: Mutex<HashMap<LockKey, LockEntry>>,
    cond: Condvar,
}

/// Sharded table of per-key locks plus the global wait-for registry.
pub struct LockManager {
    shards: Vec<Shard>,
    /// locker id -> the lock it is currently waiting on.
    waits: Mutex<HashMap<LockerId, LockKey>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            shards: (0..LOCK_TABLE_SHARD_COUNT)
                .map(|_| Shard {
                    locks: Mutex::new(HashMap::new()),
                    cond: Condvar::new(),
                })
                .collect(),
            waits: Mutex::new(HashMap::new()),
        }
    }

    fn shard(&self, hash: u64) -> &Shard {
        &self.shards[(hash as usize) & (LOCK_TABLE_SHARD_COUNT - 1)]
    }

    fn begin_wait(&self, id: LockerId, key: &LockKey) {
        self.waits.lock().insert(id, key.clone());
    }

    fn end_wait(&self, id: LockerId) {
        self.waits.lock().remove(&id);
    }

    /// Clears a stale wait edge left by a timed-out request.
    pub(crate) fn clear_wait(&self, id: LockerId) {
        self.end_wait(id);
    }

    /// Shared acquisition. Never produces Illegal.
    pub(crate) fn try_lock_shared(
        &self,
        id: LockerId,
        lock_key: &LockKey,
        hash: u64,
        timeout: Duration,
    ) -> LockResult {
        let shard = self.shard(hash);
        let mut locks = shard.locks.lock();
        let deadline = Instant::now() + timeout;
        loop {
            let entry = locks.entry(lock_key.clone()).or_default();
            if entry.owner == Some(id) {
                return if entry.exclusive {
                    LockResult::OwnedExclusive
                } else {
                    LockResult::OwnedUpgradable
                };
            }
            if entry.owns_shared(id) {
                return LockResult::OwnedShared;
            }
            // Pending exclusive acquirers block new shared acquirers.
            if !entry.exclusive && entry.waiting_exclusive == 0 {
                entry.shared.push(id);
                return LockResult::Acquired;
            }
            self.begin_wait(id, lock_key);
            let timed_out = shard.cond.wait_until(&mut locks, deadline).timed_out();
            if timed_out {
                return LockResult::TimedOutLock;
            }
            self.end_wait(id);
        }
    }

    /// Upgradable acquisition: denies other upgradables and exclusives
    /// while held, but admits shared holders.
    pub(crate) fn try_lock_upgradable(
        &self,
        id: LockerId,
        lock_key: &LockKey,
        hash: u64,
        timeout: Duration,
    ) -> LockResult {
        let shard = self.shard(hash);
        let mut locks = shard.locks.lock();
        let deadline = Instant::now() + timeout;
        loop {
            let entry = locks.entry(lock_key.clone()).or_default();
            if entry.owner == Some(id) {
                return if entry.exclusive {
                    LockResult::OwnedExclusive
                } else {
                    LockResult::OwnedUpgradable
                };
            }
            if entry.owns_shared(id) {
                // A shared owner cannot upgrade without deadlocking
                // against other shared owners.
                return LockResult::Illegal;
            }
            if entry.owner.is_none() {
                entry.owner = Some(id);
                return LockResult::Acquired;
            }
            self.begin_wait(id, lock_key);
            let timed_out = shard.cond.wait_until(&mut locks, deadline).timed_out();
            if timed_out {
                return LockResult::TimedOutLock;
            }
            self.end_wait(id);
        }
    }

    /// Exclusive acquisition, upgrading an upgradable hold when present.
    pub(crate) fn try_lock_exclusive(
        &self,
        id: LockerId,
        lock_key: &LockKey,
        hash: u64,
        timeout: Duration,
    ) -> LockResult {
        let shard = self.shard(hash);
        let mut locks = shard.locks.lock();
        let deadline = Instant::now() + timeout;

        // Phase one: obtain the upgradable role.
        let had_upgradable;
        loop {
            let entry = locks.entry(lock_key.clone()).or_default();
            if entry.owner == Some(id) {
                if entry.exclusive {
                    return LockResult::OwnedExclusive;
                }
                had_upgradable = true;
                break;
            }
            if entry.owns_shared(id) {
                return LockResult::Illegal;
            }
            if entry.owner.is_none() {
                entry.owner = Some(id);
                had_upgradable = false;
                break;
            }
            entry.waiting_exclusive += 1;
            self.begin_wait(id, lock_key);
            let timed_out = shard.cond.wait_until(&mut locks, deadline).timed_out();
            let entry = locks.get_mut(lock_key).expect("waited-on entry persists");
            entry.waiting_exclusive -= 1;
            if timed_out {
                return LockResult::TimedOutLock;
            }
            self.end_wait(id);
        }

        // Phase two: holding the role, wait for shared holders to drain.
        loop {
            let entry = locks.get_mut(lock_key).expect("owned entry persists");
            if entry.shared.iter().all(|&s| s == id) {
                entry.exclusive = true;
                return if had_upgradable {
                    LockResult::Upgraded
                } else {
                    LockResult::Acquired
                };
            }
            entry.waiting_exclusive += 1;
            self.begin_wait(id, lock_key);
            let timed_out = shard.cond.wait_until(&mut locks, deadline).timed_out();
            let entry = locks.get_mut(lock_key).expect("owned entry persists");
            entry.waiting_exclusive -= 1;
            if timed_out {
                if !had_upgradable {
                    // Surrender the role claimed in phase one; a prior
                    // upgradable hold survives the failed upgrade.
                    entry.owner = None;
                    if entry.is_unowned() && entry.waiting_exclusive == 0 {
                        locks.remove(lock_key);
                    }
                    shard.cond.notify_all();
                }
                return LockResult::TimedOutLock;
            }
            self.end_wait(id);
        }
    }

    /// Ownership check, never waits.
    pub(crate) fn check(&self, id: LockerId, lock_key: &LockKey, hash: u64) -> LockResult {
        let shard = self.shard(hash);
        let locks = shard.locks.lock();
        match locks.get(lock_key) {
            None => LockResult::Unowned,
            Some(entry) => {
                if entry.owner == Some(id) {
                    if entry.exclusive {
                        LockResult::OwnedExclusive
                    } else {
                        LockResult::OwnedUpgradable
                    }
                } else if entry.owns_shared(id) {
                    LockResult::OwnedShared
                } else {
                    LockResult::Unowned
                }
            }
        }
    }

    /// Fully releases whatever `id` holds on the key.
    pub(crate) fn unlock(&self, id: LockerId, lock_key: &LockKey, hash: u64) {
        let shard = self.shard(hash);
        let mut locks = shard.locks.lock();
        if let Some(entry) = locks.get_mut(lock_key) {
            if entry.owner == Some(id) {
                entry.owner = None;
                entry.exclusive = false;
                entry.ghosted = false;
            } else if let Some(at) = entry.shared.iter().position(|&s| s == id) {
                entry.shared.swap_remove(at);
            }
            if entry.is_unowned() && entry.waiting_exclusive == 0 {
                locks.remove(lock_key);
            }
        }
        shard.cond.notify_all();
    }

    /// Releases down to a shared hold.
    pub(crate) fn unlock_to_shared(&self, id: LockerId, lock_key: &LockKey, hash: u64) {
        let shard = self.shard(hash);
        let mut locks = shard.locks.lock();
        if let Some(entry) = locks.get_mut(lock_key) {
            if entry.owner == Some(id) {
                entry.owner = None;
                entry.exclusive = false;
                if !entry.owns_shared(id) {
                    entry.shared.push(id);
                }
            }
        }
        shard.cond.notify_all();
    }

    /// Releases an exclusive hold down to upgradable.
    pub(crate) fn unlock_to_upgradable(&self, id: LockerId, lock_key: &LockKey, hash: u64) {
        let shard = self.shard(hash);
        let mut locks = shard.locks.lock();
        if let Some(entry) = locks.get_mut(lock_key) {
            if entry.owner == Some(id) {
                entry.exclusive = false;
            }
        }
        shard.cond.notify_all();
    }

    /// Flags the lock as covering a ghost entry.
    pub(crate) fn mark_ghosted(&self, id: LockerId, lock_key: &LockKey, hash: u64) {
        let shard = self.shard(hash);
        let mut locks = shard.locks.lock();
        if let Some(entry) = locks.get_mut(lock_key) {
            if entry.owner == Some(id) {
                entry.ghosted = true;
            }
        }
    }

    pub(crate) fn is_ghosted(&self, lock_key: &LockKey, hash: u64) -> bool {
        let shard = self.shard(hash);
        let locks = shard.locks.lock();
        locks.get(lock_key).map(|e| e.ghosted).unwrap_or(false)
    }

    fn owners_of(&self, lock_key: &LockKey) -> SmallVec<[LockerId; 4]> {
        let hash = lock_hash(lock_key.index_id, &lock_key.key);
        let shard = self.shard(hash);
        let locks = shard.locks.lock();
        let mut owners = SmallVec::new();
        if let Some(entry) = locks.get(lock_key) {
            if let Some(owner) = entry.owner {
                owners.push(owner);
            }
            owners.extend(entry.shared.iter().copied());
        }
        owners
    }

    /// Walks the wait-for graph from `id`, which just timed out waiting.
    /// Returns the cycle members if `id` participates in one. Never
    /// modifies lock state.
    pub(crate) fn detect_deadlock(&self, id: LockerId, index_id: u64) -> Option<DeadlockError> {
        let origin = { self.waits.lock().get(&id).cloned() }?;

        let mut visited: Vec<LockerId> = Vec::new();
        let mut stack: Vec<LockerId> = Vec::new();
        for owner in self.owners_of(&origin) {
            if owner != id {
                stack.push(owner);
            }
        }

        while let Some(current) = stack.pop() {
            if current == id {
                visited.push(id);
                visited.sort_unstable();
                visited.dedup();
                return Some(DeadlockError {
                    index_id,
                    cycle: visited,
                });
            }
            if visited.contains(&current) {
                continue;
            }
            visited.push(current);
            let next_key = { self.waits.lock().get(&current).cloned() };
            if let Some(next_key) = next_key {
                for owner in self.owners_of(&next_key) {
                    stack.push(owner);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const T: Duration = Duration::from_millis(20);

    fn key(index_id: u64, key: &[u8]) -> (LockKey, u64) {
        (
            LockKey {
                index_id,
                key: key.to_vec(),
            },
            lock_hash(index_id, key),
        )
    }

    #[test]
    fn shared_holders_coexist() {
        let mgr = LockManager::new();
        let (k, h) = key(1, b"a");
        assert_eq!(mgr.try_lock_shared(10, &k, h, T), LockResult::Acquired);
        assert_eq!(mgr.try_lock_shared(11, &k, h, T), LockResult::Acquired);
        assert_eq!(mgr.try_lock_shared(10, &k, h, T), LockResult::OwnedShared);
        mgr.unlock(10, &k, h);
        mgr.unlock(11, &k, h);
    }

    #[test]
    fn exclusive_blocks_shared_until_release() {
        let mgr = LockManager::new();
        let (k, h) = key(1, b"a");
        assert_eq!(mgr.try_lock_exclusive(10, &k, h, T), LockResult::Acquired);
        assert_eq!(mgr.try_lock_shared(11, &k, h, T), LockResult::TimedOutLock);
        mgr.clear_wait(11);
        mgr.unlock(10, &k, h);
        assert_eq!(mgr.try_lock_shared(11, &k, h, T), LockResult::Acquired);
    }

    #[test]
    fn shared_to_exclusive_is_illegal() {
        let mgr = LockManager::new();
        let (k, h) = key(1, b"a");
        assert_eq!(mgr.try_lock_shared(10, &k, h, T), LockResult::Acquired);
        assert_eq!(mgr.try_lock_exclusive(10, &k, h, T), LockResult::Illegal);
        assert_eq!(mgr.try_lock_upgradable(10, &k, h, T), LockResult::Illegal);
    }

    #[test]
    fn upgradable_admits_shared_but_not_upgradable() {
        let mgr = LockManager::new();
        let (k, h) = key(1, b"a");
        assert_eq!(mgr.try_lock_upgradable(10, &k, h, T), LockResult::Acquired);
        assert_eq!(mgr.try_lock_shared(11, &k, h, T), LockResult::Acquired);
        assert_eq!(
            mgr.try_lock_upgradable(12, &k, h, T),
            LockResult::TimedOutLock
        );
        mgr.clear_wait(12);
    }

    #[test]
    fn upgradable_upgrades_after_shared_drain() {
        let mgr = Arc::new(LockManager::new());
        let (k, h) = key(1, b"a");
        assert_eq!(mgr.try_lock_upgradable(10, &k, h, T), LockResult::Acquired);
        assert_eq!(mgr.try_lock_shared(11, &k, h, T), LockResult::Acquired);

        let (m2, k2) = (Arc::clone(&mgr), k.clone());
        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            m2.unlock(11, &k2, h);
        });

        let result = mgr.try_lock_exclusive(10, &k, h, Duration::from_millis(500));
        assert_eq!(result, LockResult::Upgraded);
        release.join().unwrap();
        mgr.unlock(10, &k, h);
    }

    #[test]
    fn pending_exclusive_blocks_new_shared() {
        let mgr = Arc::new(LockManager::new());
        let (k, h) = key(1, b"a");
        assert_eq!(mgr.try_lock_shared(10, &k, h, T), LockResult::Acquired);

        let (m2, k2) = (Arc::clone(&mgr), k.clone());
        let writer = thread::spawn(move || {
            m2.try_lock_exclusive(11, &k2, h, Duration::from_millis(500))
        });
        thread::sleep(Duration::from_millis(30));

        // A fresh shared request defers to the parked exclusive.
        assert_eq!(mgr.try_lock_shared(12, &k, h, T), LockResult::TimedOutLock);
        mgr.clear_wait(12);

        mgr.unlock(10, &k, h);
        assert_eq!(writer.join().unwrap(), LockResult::Acquired);
    }

    #[test]
    fn ghost_flag_round_trip() {
        let mgr = LockManager::new();
        let (k, h) = key(1, b"a");
        mgr.try_lock_exclusive(10, &k, h, T);
        mgr.mark_ghosted(10, &k, h);
        assert!(mgr.is_ghosted(&k, h));
        mgr.unlock(10, &k, h);
        assert!(!mgr.is_ghosted(&k, h));
    }

    #[test]
    fn deadlock_detected_between_two_lockers() {
        let mgr = Arc::new(LockManager::new());
        let (ka, ha) = key(1, b"k1");
        let (kb, hb) = key(1, b"k2");

        assert_eq!(mgr.try_lock_exclusive(10, &ka, ha, T), LockResult::Acquired);
        assert_eq!(mgr.try_lock_exclusive(20, &kb, hb, T), LockResult::Acquired);

        let (m2, ka2) = (Arc::clone(&mgr), ka.clone());
        let other = thread::spawn(move || {
            // Locker 20 waits for k1 held by 10.
            let r = m2.try_lock_exclusive(20, &ka2, ha, Duration::from_millis(400));
            r
        });
        thread::sleep(Duration::from_millis(30));

        // Locker 10 waits for k2 held by 20: cycle.
        let r = mgr.try_lock_exclusive(10, &kb, hb, Duration::from_millis(200));
        assert_eq!(r, LockResult::TimedOutLock);
        let deadlock = mgr.detect_deadlock(10, 1).expect("cycle exists");
        assert!(deadlock.cycle.contains(&10) && deadlock.cycle.contains(&20));
        mgr.clear_wait(10);

        // Breaking the cycle lets the other locker through.
        mgr.unlock(10, &ka, ha);
        assert_eq!(other.join().unwrap(), LockResult::Acquired);
        mgr.unlock(20, &ka, ha);
        mgr.unlock(20, &kb, hb);
    }
}
