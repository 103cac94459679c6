//! # Transactions
//!
//! A transaction composes the three substrates: the [`Locker`] owns the
//! per-key locks, the [`UndoLog`] records inverse operations for
//! rollback, and the redo log records forward operations for durability.
//! Every data-plane operation runs the same sequence: acquire the lock,
//! push undo, mutate the node, emit redo — all under the commit lock in
//! shared mode.
//!
//! ## Scopes
//!
//! Scopes nest. Entering a scope captures the undo savepoint and the
//! lock-stack tail; exiting rolls back to them. Committing a nested scope
//! records a scoped commit in redo and promotes its locks to the parent.
//! Committing the top scope writes the undo COMMIT marker and the final
//! redo record under one commit-lock hold, syncs per the durability
//! mode, reaps ghosts, releases locks, and truncates the undo chain.
//!
//! ## Borked transactions
//!
//! A transaction whose rollback failed is tagged borked rather than
//! silently dropped: the database is panicked, further mutation is
//! refused, and only reset/exit remain callable — they release newly
//! acquired locks without touching the undo chain.

mod undo;

pub(crate) use undo::{UndoLog, UndoPageStore};
pub(crate) use undo::{
    OP_COMMIT, OP_COMMIT_TRUNCATE, OP_CUSTOM, OP_SCOPE_COMMIT, OP_SCOPE_ENTER, OP_UNDELETE,
    OP_UNDELETE_FRAGMENTED, OP_UNINSERT, OP_UNUPDATE,
};

use std::sync::Arc;
use std::time::Duration;

use eyre::{ensure, Result};

use crate::config::{DurabilityMode, LockMode};
use crate::db::DbShared;
use crate::error::InvalidTransaction;
use crate::lock::Locker;

// State flags.
const HAS_SCOPE: u8 = 1;
const HAS_COMMIT: u8 = 2;
const HAS_TRASH: u8 = 4;

struct Scope {
    undo_savepoint: u64,
}

/// Why a transaction can no longer be used.
enum Borked {
    /// The sentinel transaction: operations pass through without any
    /// transactional bookkeeping.
    Bogus,
    /// Rollback failed; the cause is recorded.
    Failed(String),
}

pub struct Transaction {
    db: Arc<DbShared>,
    locker: Locker,
    /// 0 until the first durable action.
    txn_id: u64,
    durability: DurabilityMode,
    lock_mode: LockMode,
    lock_timeout: Duration,
    undo: Option<UndoLog>,
    scopes: Vec<Scope>,
    flags: u8,
    borked: Option<Borked>,
}

impl Transaction {
    pub(crate) fn new(db: Arc<DbShared>, durability: DurabilityMode) -> Self {
        let locker = Locker::new(Arc::clone(db.lock_manager()));
        let lock_timeout = db.lock_timeout();
        Self {
            db,
            locker,
            txn_id: 0,
            durability,
            lock_mode: LockMode::default(),
            lock_timeout,
            undo: None,
            scopes: Vec::new(),
            flags: 0,
            borked: None,
        }
    }

    /// The sentinel transaction: passes operations through without
    /// locking, undo, or redo.
    pub(crate) fn bogus(db: Arc<DbShared>) -> Self {
        let mut txn = Self::new(db, DurabilityMode::NoRedo);
        txn.borked = Some(Borked::Bogus);
        txn
    }

    pub fn id(&self) -> u64 {
        self.txn_id
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn set_lock_mode(&mut self, mode: LockMode) {
        self.lock_mode = mode;
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn set_lock_timeout(&mut self, timeout: Duration) {
        self.lock_timeout = timeout;
    }

    pub(crate) fn is_bogus(&self) -> bool {
        matches!(self.borked, Some(Borked::Bogus))
    }

    pub(crate) fn is_no_redo(&self) -> bool {
        self.durability == DurabilityMode::NoRedo
    }

    pub(crate) fn locker_mut(&mut self) -> &mut Locker {
        &mut self.locker
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        match &self.borked {
            None | Some(Borked::Bogus) => Ok(()),
            Some(Borked::Failed(cause)) => {
                Err(InvalidTransaction(format!("borked: {cause}")).into())
            }
        }
    }

    /// Assigns the transaction id on the first durable action.
    pub(crate) fn ensure_redo_id(&mut self, db: &DbShared) -> Result<u64> {
        if self.txn_id == 0 {
            self.txn_id = db.assign_txn_id();
            self.flags |= HAS_COMMIT;
        }
        Ok(self.txn_id)
    }

    fn undo_mut(&mut self) -> &mut UndoLog {
        let page_size = self.db.page_size();
        self.undo.get_or_insert_with(|| UndoLog::new(page_size))
    }

    pub(crate) fn undo_push_uninsert(
        &mut self,
        db: &DbShared,
        index_id: u64,
        key: &[u8],
    ) -> Result<()> {
        self.undo_mut().push_uninsert(db.undo_store(), index_id, key)
    }

    pub(crate) fn undo_push_unupdate(
        &mut self,
        db: &DbShared,
        index_id: u64,
        entry_bytes: &[u8],
    ) -> Result<()> {
        self.undo_mut()
            .push_unupdate(db.undo_store(), index_id, entry_bytes)
    }

    pub(crate) fn undo_push_undelete(
        &mut self,
        db: &DbShared,
        index_id: u64,
        entry_bytes: &[u8],
        fragmented: bool,
    ) -> Result<()> {
        if fragmented {
            self.flags |= HAS_TRASH;
        }
        self.undo_mut()
            .push_undelete(db.undo_store(), index_id, entry_bytes, fragmented)
    }

    /// Records an application-defined undo payload.
    pub fn custom_undo(&mut self, message: &[u8]) -> Result<()> {
        self.check_usable()?;
        ensure!(!self.is_bogus(), InvalidTransaction("bogus".into()));
        let db = Arc::clone(&self.db);
        self.undo_mut().push_custom(db.undo_store(), message)
    }

    /// Records an application-defined redo payload.
    pub fn custom_redo(&mut self, message: &[u8]) -> Result<()> {
        self.check_usable()?;
        ensure!(!self.is_bogus(), InvalidTransaction("bogus".into()));
        let db = Arc::clone(&self.db);
        let txn_id = self.ensure_redo_id(&db)?;
        db.redo.txn_custom(txn_id, message)
    }

    /// Enters a nested scope.
    pub fn enter(&mut self) -> Result<()> {
        self.check_usable()?;
        if self.is_bogus() {
            return Ok(());
        }
        self.locker.scope_enter();
        let savepoint = self.undo.as_ref().map(|u| u.savepoint()).unwrap_or(0);
        if self.undo.is_some() {
            let db = Arc::clone(&self.db);
            self.undo
                .as_mut()
                .expect("checked")
                .push_scope_enter(db.undo_store())?;
        }
        self.scopes.push(Scope {
            undo_savepoint: savepoint,
        });
        self.flags |= HAS_SCOPE;
        if self.txn_id != 0 && !self.is_no_redo() {
            self.db.redo.txn_enter(self.txn_id)?;
        }
        Ok(())
    }

    /// Commits the current scope. For a nested scope, locks promote to
    /// the parent; for the top scope, the transaction becomes durable per
    /// its mode.
    pub fn commit(&mut self) -> Result<()> {
        self.check_usable()?;
        if self.is_bogus() {
            return Ok(());
        }

        if let Some(scope) = self.scopes.pop() {
            // Nested commit: scoped redo marker, lock promotion, and the
            // parent inherits the undo entries.
            if self.txn_id != 0 && !self.is_no_redo() {
                self.db.redo.txn_commit(self.txn_id)?;
            }
            if self.undo.is_some() {
                let db = Arc::clone(&self.db);
                self.undo
                    .as_mut()
                    .expect("checked")
                    .push_scope_commit(db.undo_store())?;
            }
            self.locker.promote_scope();
            let _ = scope;
            if self.scopes.is_empty() {
                self.flags &= !HAS_SCOPE;
            }
            return Ok(());
        }

        self.commit_top()
    }

    fn commit_top(&mut self) -> Result<()> {
        let db = Arc::clone(&self.db);

        if self.txn_id != 0 {
            // The undo COMMIT marker and the final redo record go out
            // under one commit-lock hold, so a checkpoint observes both
            // or neither.
            let sync_pos;
            {
                let _commit = db.commit_lock.shared();
                if let Some(undo) = self.undo.as_mut() {
                    undo.push_commit(db.undo_store())?;
                }
                sync_pos = if self.is_no_redo() {
                    0
                } else {
                    db.redo.txn_commit_final(self.txn_id, self.durability)?
                };
            }
            if sync_pos > 0 {
                db.redo.commit_sync(sync_pos)?;
            }
        }

        // Reap ghosts, then release locks.
        for ghost in self.locker.take_ghosts() {
            if let Some(tree) = db.tree_by_id(ghost.index_id) {
                crate::tree::reap_ghost(&db, &tree, &ghost.key)?;
            }
        }
        self.locker.scope_exit_all();

        if let Some(undo) = self.undo.as_mut() {
            undo.truncate(db.undo_store())?;
        }
        self.txn_id = 0;
        self.flags = 0;
        Ok(())
    }

    /// Rolls back the current scope and exits it; the top scope rollback
    /// undoes the whole transaction.
    pub fn exit(&mut self) -> Result<()> {
        if matches!(self.borked, Some(Borked::Failed(_))) {
            // A borked transaction releases newly acquired locks but must
            // not touch the undo chain again.
            self.locker.scope_exit_all();
            self.scopes.clear();
            return Ok(());
        }
        if self.is_bogus() {
            return Ok(());
        }

        if let Some(scope) = self.scopes.pop() {
            self.rollback_to(scope.undo_savepoint)?;
            if self.txn_id != 0 && !self.is_no_redo() {
                self.db.redo.txn_rollback(self.txn_id)?;
            }
            self.locker.scope_exit();
            return Ok(());
        }

        self.rollback_to(0)?;
        if self.txn_id != 0 && !self.is_no_redo() {
            self.db.redo.txn_rollback_final(self.txn_id)?;
        }
        self.locker.scope_exit_all();
        self.txn_id = 0;
        self.flags = 0;
        Ok(())
    }

    /// Rolls back everything and exits every scope.
    pub fn reset(&mut self) -> Result<()> {
        while !self.scopes.is_empty() {
            self.exit()?;
        }
        self.exit()
    }

    /// Applies undo entries until the savepoint. Failure marks the
    /// transaction borked and panics the database.
    fn rollback_to(&mut self, savepoint: u64) -> Result<()> {
        let db = Arc::clone(&self.db);
        let result = self.apply_undo_to(&db, savepoint);
        if let Err(e) = &result {
            self.borked = Some(Borked::Failed(e.to_string()));
            db.panic_db(&format!("rollback failed: {e}"));
        }
        result
    }

    fn apply_undo_to(&mut self, db: &DbShared, savepoint: u64) -> Result<()> {
        let Some(undo) = self.undo.as_mut() else {
            return Ok(());
        };
        while undo.savepoint() > savepoint {
            let Some(entry) = undo.pop(db.undo_store())? else {
                break;
            };
            match entry.op {
                OP_UNINSERT => {
                    let (index_id, key) = entry.split_index_id()?;
                    if let Some(tree) = db.tree_by_id(index_id) {
                        crate::tree::undo_remove_entry(db, &tree, key)?;
                    }
                }
                OP_UNUPDATE | OP_UNDELETE | OP_UNDELETE_FRAGMENTED => {
                    let (index_id, entry_bytes) = entry.split_index_id()?;
                    if let Some(tree) = db.tree_by_id(index_id) {
                        let key = db.entry_key(entry_bytes)?;
                        crate::tree::undo_restore_entry(db, &tree, &key, entry_bytes)?;
                    }
                }
                OP_SCOPE_ENTER | OP_SCOPE_COMMIT | OP_CUSTOM => {}
                OP_COMMIT | OP_COMMIT_TRUNCATE => {
                    // Markers from an earlier committed scope; nothing to
                    // apply.
                }
                other => eyre::bail!("unknown undo op {:#x}", other),
            }
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_bogus() {
            return;
        }
        // Best-effort rollback; errors already panicked the database.
        let _ = self.reset();
    }
}
