//! # Tree
//!
//! A named ordered index over the node arena. The tree owns its root
//! slot — the root node is pinned unevictable and its arena slot and page
//! id never change, even as the tree grows and shrinks levels.
//!
//! ## Latching discipline
//!
//! Reads descend hand-over-hand with shared latches: the child is latched
//! before the parent is released. Loading an absent child requires the
//! parent exclusively, so the read path upgrades with `try_upgrade` and
//! restarts the descent when the upgrade loses; it never waits while
//! holding a shared latch.
//!
//! Writes descend with exclusive latches and release ancestors as soon as
//! the child is *safe* — guaranteed to absorb the worst case without
//! splitting or merging. The retained spine above an unsafe child is
//! exactly the set of nodes a split or merge cascade may touch, so phase
//! two of a split always finds its parent already latched.
//!
//! Lock order is strictly: transaction locks first, then the commit lock
//! in shared mode, then node latches top-down. A thread never waits on a
//! lock while holding a latch.

mod cursor;

pub use cursor::TreeCursor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;

use crate::db::DbShared;
use crate::error::ClosedIndex;
use crate::node::{
    adjust_frames_for_delete, adjust_frames_for_insert, entry_length_at, finish_split_root,
    insert_split_child_ref, midpoint_key, move_internal_to_left, move_leaf_to_left, root_delete,
    split_internal, split_leaf, CachedState, LeafAlloc, NodeContext, NodeState, PreparedEntry,
    ValueShape,
};
use crate::sync::ExclusiveGuard;
use crate::txn::Transaction;

/// Shared identity of an open tree.
pub(crate) struct TreeInner {
    pub id: u64,
    pub name: Mutex<Vec<u8>>,
    pub root_slot: u32,
    pub closed: AtomicBool,
}

/// A named ordered index mapping byte keys to byte values.
pub struct Tree {
    pub(crate) db: Arc<DbShared>,
    pub(crate) inner: Arc<TreeInner>,
}

impl Tree {
    pub(crate) fn new(db: Arc<DbShared>, inner: Arc<TreeInner>) -> Self {
        Self { db, inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> Vec<u8> {
        self.inner.name.lock().clone()
    }

    fn check_open(&self) -> Result<()> {
        ensure!(
            !self.inner.closed.load(Ordering::Acquire),
            ClosedIndex(self.inner.id)
        );
        self.db.check_panicked()
    }

    /// Point read. With a transaction, read locking follows the
    /// transaction's lock mode; without one, the read is latch-consistent
    /// only.
    pub fn load(&self, txn: Option<&mut Transaction>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        use crate::config::LockMode;

        self.check_open()?;
        let Some(txn) = txn else {
            return read_value(&self.db, &self.inner, key);
        };
        txn.check_usable()?;
        if txn.is_bogus() {
            return read_value(&self.db, &self.inner, key);
        }
        let timeout = txn.lock_timeout();
        match txn.lock_mode() {
            LockMode::Unsafe => read_value(&self.db, &self.inner, key),
            LockMode::ReadCommitted => {
                let result = txn.locker_mut().lock_shared(self.inner.id, key, timeout)?;
                let value = read_value(&self.db, &self.inner, key)?;
                if result.is_new_acquisition() {
                    txn.locker_mut().unlock_last()?;
                }
                Ok(value)
            }
            LockMode::RepeatableRead => {
                txn.locker_mut().lock_shared(self.inner.id, key, timeout)?;
                read_value(&self.db, &self.inner, key)
            }
            LockMode::Upgradable => {
                txn.locker_mut().lock_upgradable(self.inner.id, key, timeout)?;
                read_value(&self.db, &self.inner, key)
            }
        }
    }

    /// Unconditional store. A transactional store is undone on rollback;
    /// an auto-commit store is durable per the database durability mode.
    pub fn store(&self, txn: Option<&mut Transaction>, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_open()?;
        write_value(&self.db, &self.inner, txn, key, Some(value)).map(|_| ())
    }

    /// Store returning the previous value.
    pub fn exchange(
        &self,
        txn: Option<&mut Transaction>,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        write_value(&self.db, &self.inner, txn, key, Some(value))
    }

    /// Store only if the key is absent. Returns false when it exists.
    pub fn insert(
        &self,
        mut txn: Option<&mut Transaction>,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        self.check_open()?;
        // Pin the key exclusively first, so the existence check and the
        // store are one atomic step.
        let existing = self.load_for_update(&mut txn, key)?;
        if existing.is_some() {
            return Ok(false);
        }
        write_value(&self.db, &self.inner, txn, key, Some(value))?;
        Ok(true)
    }

    /// Store only if the key is present. Returns false when it is absent.
    pub fn replace(
        &self,
        mut txn: Option<&mut Transaction>,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        self.check_open()?;
        let existing = self.load_for_update(&mut txn, key)?;
        if existing.is_none() {
            return Ok(false);
        }
        write_value(&self.db, &self.inner, txn, key, Some(value))?;
        Ok(true)
    }

    fn load_for_update(
        &self,
        txn: &mut Option<&mut Transaction>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if let Some(txn) = txn.as_deref_mut() {
            txn.check_usable()?;
            if !txn.is_bogus() {
                let timeout = txn.lock_timeout();
                txn.locker_mut()
                    .lock_exclusive(self.inner.id, key, timeout)?;
            }
        }
        read_value(&self.db, &self.inner, key)
    }

    /// Deletes the key. Transactional deletes leave a ghost until commit;
    /// auto-commit deletes remove the slot immediately. Returns true when
    /// the key existed.
    pub fn delete(&self, txn: Option<&mut Transaction>, key: &[u8]) -> Result<bool> {
        self.check_open()?;
        write_value(&self.db, &self.inner, txn, key, None).map(|old| old.is_some())
    }

    /// A cursor over the tree, initially unpositioned.
    pub fn cursor(&self) -> TreeCursor {
        TreeCursor::new(Arc::clone(&self.db), Arc::clone(&self.inner))
    }

    /// Number of live (non-ghost) entries, by cursor sweep.
    pub fn count(&self) -> Result<u64> {
        let mut cursor = self.cursor();
        let mut count = 0;
        cursor.first()?;
        while cursor.key().is_some() {
            count += 1;
            cursor.next()?;
        }
        Ok(count)
    }

    /// Depth of the tree: 1 for a lone leaf root.
    pub fn height(&self) -> Result<u32> {
        let mut height = 1;
        let mut guard = self.db.arena.node(self.inner.root_slot).state.write();
        loop {
            if guard.is_leaf() {
                return Ok(height);
            }
            // Walk the leftmost spine.
            let child_id = guard.retrieve_child_ref_id(0);
            let (_slot, child) = load_child_exclusive(&self.db, &mut guard, child_id)?;
            drop(guard);
            guard = child;
            height += 1;
        }
    }
}

// --- read path -----------------------------------------------------------

/// Latch-coupled shared descent to the leaf and value copy-out.
pub(crate) fn read_value(db: &DbShared, tree: &TreeInner, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let ctx = db.node_ctx();
    'restart: loop {
        let mut guard = db.arena.node(tree.root_slot).state.read();

        loop {
            if guard.is_leaf() {
                let pos = guard.binary_search(&ctx, key)?;
                if pos < 0 {
                    return Ok(None);
                }
                return guard.retrieve_leaf_value(&ctx, pos);
            }

            let pos = guard.binary_search(&ctx, key)?;
            let child_pos = if pos < 0 { !pos } else { pos + 2 };
            let child_id = guard.retrieve_child_ref_id(child_pos);

            match db.arena.map.get(child_id) {
                Some(child_slot) => {
                    let child_guard = db.arena.node(child_slot).state.read();
                    if child_guard.id != child_id {
                        // Evicted between lookup and latch; retry.
                        drop(child_guard);
                        drop(guard);
                        continue 'restart;
                    }
                    db.arena.used(child_slot);
                    // Hand over hand: child pinned, parent released.
                    drop(guard);
                    guard = child_guard;
                }
                None => {
                    // Loading needs the parent exclusive. Upgrades never
                    // wait; on failure restart the descent.
                    match guard.try_upgrade() {
                        Ok(mut excl) => {
                            let (_slot, child_excl) =
                                load_child_exclusive(db, &mut excl, child_id)?;
                            drop(excl);
                            guard = child_excl.downgrade();
                        }
                        Err(_shared) => continue 'restart,
                    }
                }
            }
        }
    }
}

/// Loads a child node by page id, returning it exclusively latched. The
/// caller holds the parent exclusively, which keeps the child reference
/// stable.
pub(crate) fn load_child_exclusive<'a>(
    db: &'a DbShared,
    _parent: &mut ExclusiveGuard<'_, NodeState>,
    child_id: u64,
) -> Result<(u32, ExclusiveGuard<'a, NodeState>)> {
    loop {
        if let Some(slot) = db.arena.map.get(child_id) {
            let guard = db.arena.node(slot).state.write();
            if guard.id == child_id {
                db.arena.used(slot);
                return Ok((slot, guard));
            }
            continue;
        }

        let (slot, mut guard) = db.arena.alloc_latched(&db.evict_ctx())?;
        if !db.page_cache.remove(child_id, &mut guard.page) {
            db.page_array
                .read_page(child_id, &mut guard.page, 0, db.page_size())?;
        }
        guard.verify_header(child_id)?;
        guard.id = child_id;
        guard.cached_state = CachedState::Clean;
        match db.arena.map.insert(child_id, slot) {
            Ok(()) => return Ok((slot, guard)),
            Err(_existing) => {
                // Another thread loaded it first; abandon this copy.
                guard.id = 0;
                drop(guard);
                db.arena.unused(slot);
            }
        }
    }
}

// --- write path ----------------------------------------------------------

struct Ancestor<'a> {
    slot: u32,
    guard: ExclusiveGuard<'a, NodeState>,
    /// 2-based child position taken during descent.
    child_pos: i32,
}

struct WriteDescent<'a> {
    /// Retained unsafe spine, root-most first.
    stack: Vec<Ancestor<'a>>,
    leaf_slot: u32,
    leaf: ExclusiveGuard<'a, NodeState>,
    /// Search result for the key in the leaf.
    pos: i32,
}

/// Exclusive descent retaining the spine above unsafe nodes. A node is
/// safe when it can absorb the worst case — an entry insert or a
/// separator push-down — without splitting, and is in no danger of
/// merging.
fn descend_for_write<'a>(
    db: &'a DbShared,
    tree: &TreeInner,
    key: &[u8],
    insert_len: usize,
) -> Result<WriteDescent<'a>> {
    let ctx = db.node_ctx();
    // Worst-case separator a child split pushes into its parent.
    let internal_need = ctx.max_key_size + 2 + 10;

    let mut stack: Vec<Ancestor<'a>> = Vec::new();
    let mut slot = tree.root_slot;
    let mut guard = db.arena.node(slot).state.write();

    loop {
        if guard.is_leaf() {
            let pos = guard.binary_search(&ctx, key)?;
            let avail = guard.available_leaf_bytes();
            let safe =
                avail >= insert_len + 2 && !guard.should_merge(avail + ctx.max_entry_size);
            if safe {
                stack.clear();
            }
            return Ok(WriteDescent {
                stack,
                leaf_slot: slot,
                leaf: guard,
                pos,
            });
        }

        let pos = guard.binary_search(&ctx, key)?;
        let child_pos = if pos < 0 { !pos } else { pos + 2 };
        let child_id = guard.retrieve_child_ref_id(child_pos);
        let (child_slot, child_guard) = load_child_exclusive(db, &mut guard, child_id)?;

        // An internal node that can absorb a separator insert and will
        // not merge releases everything above it.
        let avail = guard.available_internal_bytes();
        let safe = avail >= internal_need && !guard.should_merge(avail + internal_need);
        if safe {
            stack.clear();
        }
        stack.push(Ancestor {
            slot,
            guard,
            child_pos,
        });

        slot = child_slot;
        guard = child_guard;
    }
}

/// The store/delete core: lock, undo, mutate, redo. Returns the previous
/// value.
pub(crate) fn write_value(
    db: &DbShared,
    tree: &TreeInner,
    txn: Option<&mut Transaction>,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<Option<Vec<u8>>> {
    db.check_panicked()?;

    match txn {
        Some(txn) => {
            txn.check_usable()?;
            if txn.is_bogus() {
                return write_autocommit(db, tree, key, value, true);
            }
            let timeout = txn.lock_timeout();
            txn.locker_mut().lock_exclusive(tree.id, key, timeout)?;
            write_transactional(db, tree, txn, key, value)
        }
        None => write_autocommit(db, tree, key, value, false),
    }
}

/// What a key's slot held before a transactional mutation: the encoded
/// entry (possibly a ghost), the live value, and the fragmented bit.
struct EntrySnapshot {
    entry_bytes: Vec<u8>,
    value: Option<Vec<u8>>,
    value_fragmented: bool,
}

/// Copies the key's current entry out under shared latches. The caller
/// holds the key lock exclusively, so the snapshot cannot go stale.
fn read_entry_snapshot(
    db: &DbShared,
    tree: &TreeInner,
    key: &[u8],
) -> Result<Option<EntrySnapshot>> {
    let ctx = db.node_ctx();
    'restart: loop {
        let mut guard = db.arena.node(tree.root_slot).state.read();
        loop {
            if guard.is_leaf() {
                let pos = guard.binary_search(&ctx, key)?;
                if pos < 0 {
                    return Ok(None);
                }
                let entry_bytes = guard.copy_leaf_entry_bytes(pos);
                let value = guard.retrieve_leaf_value(&ctx, pos)?;
                let value_fragmented = matches!(
                    guard.leaf_value_shape(pos),
                    ValueShape::Inline {
                        fragmented: true,
                        ..
                    }
                );
                return Ok(Some(EntrySnapshot {
                    entry_bytes,
                    value,
                    value_fragmented,
                }));
            }
            let pos = guard.binary_search(&ctx, key)?;
            let child_pos = if pos < 0 { !pos } else { pos + 2 };
            let child_id = guard.retrieve_child_ref_id(child_pos);
            match db.arena.map.get(child_id) {
                Some(child_slot) => {
                    let child_guard = db.arena.node(child_slot).state.read();
                    if child_guard.id != child_id {
                        drop(child_guard);
                        drop(guard);
                        continue 'restart;
                    }
                    db.arena.used(child_slot);
                    drop(guard);
                    guard = child_guard;
                }
                None => match guard.try_upgrade() {
                    Ok(mut excl) => {
                        let (_slot, child_excl) = load_child_exclusive(db, &mut excl, child_id)?;
                        drop(excl);
                        guard = child_excl.downgrade();
                    }
                    Err(_shared) => continue 'restart,
                },
            }
        }
    }
}

fn write_transactional(
    db: &DbShared,
    tree: &TreeInner,
    txn: &mut Transaction,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<Option<Vec<u8>>> {
    let _commit = db.commit_lock.shared();
    let txn_id = txn.ensure_redo_id(db)?;

    // Undo is recorded before the mutation: acquire lock, push undo,
    // mutate the node, emit redo.
    let snapshot = read_entry_snapshot(db, tree, key)?;

    match value {
        Some(value) => {
            match &snapshot {
                None => txn.undo_push_uninsert(db, tree.id, key)?,
                Some(snap) => txn.undo_push_unupdate(db, tree.id, &snap.entry_bytes)?,
            }
            apply_leaf_write(db, tree, Some(&mut *txn), key, Some(value))?;
            if !txn.is_no_redo() {
                db.redo.txn_store(txn_id, tree.id, key, value)?;
            }
        }
        None => {
            // Deleting an absent key (or this transaction's own ghost)
            // mutates nothing.
            if let Some(snap) = &snapshot {
                if snap.value.is_some() {
                    txn.undo_push_undelete(
                        db,
                        tree.id,
                        &snap.entry_bytes,
                        snap.value_fragmented,
                    )?;
                    apply_leaf_write(db, tree, Some(&mut *txn), key, None)?;
                    txn.locker_mut().add_ghost(tree.id, key);
                    if !txn.is_no_redo() {
                        db.redo.txn_delete(txn_id, tree.id, key)?;
                    }
                }
            }
        }
    }
    Ok(snapshot.and_then(|s| s.value))
}

fn write_autocommit(
    db: &DbShared,
    tree: &TreeInner,
    key: &[u8],
    value: Option<&[u8]>,
    bogus: bool,
) -> Result<Option<Vec<u8>>> {
    let _commit = db.commit_lock.shared();
    let outcome = apply_leaf_write(db, tree, None, key, value)?;
    if !bogus {
        let sync_pos = db.redo.store(tree.id, key, value, db.durability())?;
        if sync_pos > 0 {
            db.redo.commit_sync(sync_pos)?;
        }
    }
    Ok(outcome.old_value)
}

struct WriteOutcome {
    old_value: Option<Vec<u8>>,
    /// Encoded bytes of the displaced entry, for the undo record.
    old_entry: Vec<u8>,
    old_fragmented: bool,
}

/// Descends and applies one leaf mutation, orchestrating split, merge,
/// and root transitions.
fn apply_leaf_write(
    db: &DbShared,
    tree: &TreeInner,
    txn: Option<&mut Transaction>,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<WriteOutcome> {
    let ctx = db.node_ctx();

    let prepared = match value {
        Some(value) => Some(PreparedEntry::new(&ctx, key, value)?),
        None => None,
    };
    let insert_len = prepared.as_ref().map(|p| p.encoded_len).unwrap_or(0);

    let mut descent = descend_for_write(db, tree, key, insert_len)?;
    let pos = descent.pos;

    // Capture the displaced entry before mutating, both for the caller
    // and the undo record.
    let mut outcome = WriteOutcome {
        old_value: None,
        old_entry: Vec::new(),
        old_fragmented: false,
    };
    if pos >= 0 {
        outcome.old_value = descent.leaf.retrieve_leaf_value(&ctx, pos)?;
        if outcome.old_value.is_some() {
            outcome.old_entry = descent.leaf.copy_leaf_entry_bytes(pos);
            outcome.old_fragmented = matches!(
                descent.leaf.leaf_value_shape(pos),
                ValueShape::Inline {
                    fragmented: true,
                    ..
                }
            );
        }
    }

    match (&prepared, pos >= 0) {
        (Some(prepared), true) => {
            db.mark_dirty(&mut descent.leaf);
            if outcome.old_fragmented {
                // Preserve the displaced chain for rollback.
                dispose_fragmented_value(&ctx, &descent.leaf, pos, &txn)?;
            }
            if !prepared.value_fragmented
                && !outcome.old_fragmented
                && descent.leaf.try_quick_update_leaf_value(pos, &prepared.value)
            {
                // Quick update: the value fit the existing slot exactly.
            } else {
                descent.leaf.delete_leaf_entry_keep_fragments(pos)?;
                adjust_frames_for_delete(&mut descent.leaf, pos);
                insert_with_structure(db, &mut descent, pos, prepared)?;
            }
        }
        (Some(prepared), false) => {
            db.mark_dirty(&mut descent.leaf);
            insert_with_structure(db, &mut descent, !pos, prepared)?;
        }
        (None, true) => {
            if outcome.old_value.is_some() {
                db.mark_dirty(&mut descent.leaf);
                if txn.is_some() {
                    // Transactional delete: ghost until commit.
                    if outcome.old_fragmented {
                        dispose_fragmented_value(&ctx, &descent.leaf, pos, &txn)?;
                    }
                    descent.leaf.ghost_leaf_value(pos);
                } else {
                    descent.leaf.delete_leaf_entry(&ctx, pos)?;
                    adjust_frames_for_delete(&mut descent.leaf, pos);
                    merge_after_delete(db, descent)?;
                }
            }
        }
        (None, false) => {}
    }

    Ok(outcome)
}

/// Hands a displaced fragmented value's chain to the trash index (under
/// a transaction) or frees it outright.
fn dispose_fragmented_value(
    ctx: &NodeContext<'_>,
    leaf: &ExclusiveGuard<'_, NodeState>,
    pos: i32,
    txn: &Option<&mut Transaction>,
) -> Result<()> {
    if let ValueShape::Inline { data_loc, len, .. } = leaf.leaf_value_shape(pos) {
        let placeholder = leaf.page[data_loc..data_loc + len].to_vec();
        match txn {
            Some(txn) => ctx.frag.trash_fragments(txn.id(), &placeholder)?,
            None => ctx.frag.delete_fragments(&placeholder)?,
        }
    }
    Ok(())
}

/// Inserts a prepared entry at `pos`, rebalancing or splitting up the
/// retained spine as needed.
fn insert_with_structure(
    db: &DbShared,
    descent: &mut WriteDescent<'_>,
    pos: i32,
    entry: &PreparedEntry,
) -> Result<()> {
    let ctx = db.node_ctx();

    match descent.leaf.create_leaf_entry(&ctx, pos, entry.encoded_len) {
        LeafAlloc::Loc(loc) => {
            descent.leaf.copy_to_leaf_entry(entry, loc);
            adjust_frames_for_insert(&mut descent.leaf, pos);
            return Ok(());
        }
        LeafAlloc::Full => {}
    }

    // Rebalance into a sibling before splitting, when a parent is held.
    if try_rebalance_leaf(db, descent, pos, entry)? {
        return Ok(());
    }

    // Split. Failures past this point leave orphaned structure, so they
    // panic the database.
    split_cascade(db, descent, pos, entry).map_err(|e| {
        db.panic_db(&format!("split failed: {e}"));
        e
    })
}

/// Allocates a fresh unevictable node with a new page id, exclusively
/// latched and dirty.
fn alloc_fresh_node(db: &DbShared) -> Result<(u32, ExclusiveGuard<'_, NodeState>)> {
    let (slot, mut guard) = db.arena.alloc_latched(&db.evict_ctx())?;
    let id = db.allocate_page_id()?;
    guard.id = id;
    db.mark_dirty(&mut guard);
    db.arena.make_unevictable(slot);
    db.arena
        .map
        .insert(id, slot)
        .map_err(|existing| eyre::eyre!("fresh page id {} already mapped to {}", id, existing))?;
    Ok((slot, guard))
}

/// Two-phase split walk: phase one on the current node, then phase two
/// at each retained ancestor, cascading while parents are full.
fn split_cascade(
    db: &DbShared,
    descent: &mut WriteDescent<'_>,
    pos: i32,
    entry: &PreparedEntry,
) -> Result<()> {
    let ctx = db.node_ctx();

    // Phase one on the leaf.
    let (sib_slot, mut sib_guard) = alloc_fresh_node(db)?;
    split_leaf(&ctx, &mut descent.leaf, &mut sib_guard, sib_slot, pos, entry)?;
    drop(sib_guard);

    // From here on, `descent.leaf` tracks whichever node carries the
    // pending split, regardless of its level.
    loop {
        if descent.stack.is_empty() {
            // The splitting node is the root: finish in place.
            let sibling_slot = descent
                .leaf
                .split
                .as_ref()
                .expect("pending split")
                .sibling_slot;
            let (child_slot, mut child_guard) = alloc_fresh_node(db)?;
            finish_split_root(child_slot, &mut descent.leaf, &mut child_guard)?;
            drop(child_guard);
            db.arena.make_evictable(child_slot);
            db.arena.make_evictable(sibling_slot);
            return Ok(());
        }

        let mut parent = descent.stack.pop().expect("checked non-empty");
        db.mark_dirty(&mut parent.guard);
        let split = descent.leaf.split.take().expect("pending split");

        if insert_split_child_ref(&ctx, &mut parent.guard, parent.child_pos, &split)? {
            db.arena.make_evictable(split.sibling_slot);
            return Ok(());
        }

        // Parent is full: split it with the pending separator, then keep
        // cascading with the parent as the splitting node.
        let (psib_slot, mut psib_guard) = alloc_fresh_node(db)?;
        split_internal(
            &ctx,
            &mut parent.guard,
            &mut psib_guard,
            psib_slot,
            parent.child_pos,
            &split.key,
            split.key_fragmented,
            split.sibling_id,
        )?;
        db.arena.make_evictable(split.sibling_slot);
        drop(psib_guard);

        descent.leaf = parent.guard;
        descent.leaf_slot = parent.slot;
    }
}

/// Attempts to move entries into an adjacent sibling instead of
/// splitting. Sibling choice starts on the side picked by the low bit of
/// the node's id; sibling latching is try-only and any snag aborts.
fn try_rebalance_leaf(
    db: &DbShared,
    descent: &mut WriteDescent<'_>,
    pos: i32,
    entry: &PreparedEntry,
) -> Result<bool> {
    if descent.stack.is_empty() {
        return Ok(false);
    }
    let ctx = db.node_ctx();
    let first_left = descent.leaf.id & 1 == 0;

    for left in [first_left, !first_left] {
        let parent = descent.stack.last_mut().expect("checked non-empty");
        let child_pos = parent.child_pos;
        let sibling_pos = if left { child_pos - 2 } else { child_pos + 2 };
        if sibling_pos < 0 || sibling_pos > parent.guard.highest_pos() {
            continue;
        }
        let sibling_id = parent.guard.retrieve_child_ref_id(sibling_pos);
        let Some(sibling_slot) = db.arena.map.get(sibling_id) else {
            continue; // not resident; rebalance is best-effort
        };
        let Some(mut sibling) = db.arena.node(sibling_slot).state.try_write() else {
            continue;
        };
        if sibling.id != sibling_id
            || sibling.split.is_some()
            || !sibling.is_leaf()
            || sibling.cached_state != descent.leaf.cached_state
        {
            continue;
        }

        if rebalance_leaf_move(
            db,
            &ctx,
            &mut parent.guard,
            child_pos,
            &mut descent.leaf,
            &mut sibling,
            sibling_slot,
            left,
            pos,
            entry,
        )? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Moves entries from `node` toward `sibling`, rewrites the parent
/// separator, then inserts the pending entry. Aborts without mutating
/// when the books do not balance.
#[allow(clippy::too_many_arguments)]
fn rebalance_leaf_move(
    db: &DbShared,
    ctx: &NodeContext<'_>,
    parent: &mut ExclusiveGuard<'_, NodeState>,
    child_pos: i32,
    node: &mut ExclusiveGuard<'_, NodeState>,
    sibling: &mut ExclusiveGuard<'_, NodeState>,
    sibling_slot: u32,
    left: bool,
    pos: i32,
    entry: &PreparedEntry,
) -> Result<bool> {
    let num_keys = node.num_keys() as i32;
    if num_keys < 2 {
        return Ok(false);
    }
    let deficit = (entry.encoded_len + 2) as i64;

    // The insertion position must stay strictly inside this node's
    // retained range, so boundary keys exist on both sides.
    let max_moved = if left {
        (pos / 2 - 1).max(0)
    } else {
        (num_keys - pos / 2 - 1).max(0)
    };
    if max_moved == 0 {
        return Ok(false);
    }

    let mut moved = 0i32;
    let mut moved_bytes = 0i64;
    let start_avail = node.available_leaf_bytes() as i64;
    while moved < max_moved && start_avail + moved_bytes + (moved as i64) * 2 < deficit {
        let probe_pos = if left {
            moved * 2
        } else {
            (num_keys - 1 - moved) * 2
        };
        let loc = node.entry_loc(probe_pos);
        moved_bytes += entry_length_at(&node.page, loc) as i64;
        moved += 1;
    }
    if start_avail + moved_bytes + (moved as i64) * 2 < deficit {
        return Ok(false);
    }

    // The receiver must absorb the moved bytes plus their vector slots.
    if (sibling.available_leaf_bytes() as i64) < moved_bytes + (moved as i64) * 2 {
        return Ok(false);
    }

    // New separator between the post-move boundary keys, written into the
    // parent first; aborting after a parent rewrite would corrupt.
    let boundary = moved * 2;
    let (sep, parent_key_pos) = if left {
        let low = node.retrieve_key(ctx, boundary - 2)?;
        let high = node.retrieve_key(ctx, boundary)?;
        (midpoint_key(&low, &high)?, child_pos - 2)
    } else {
        let donate_start = (num_keys - moved) * 2;
        let low = node.retrieve_key(ctx, donate_start - 2)?;
        let high = node.retrieve_key(ctx, donate_start)?;
        (midpoint_key(&low, &high)?, child_pos)
    };
    if sep.len() > ctx.max_key_size {
        return Ok(false);
    }
    if !parent.update_internal_key(ctx, parent_key_pos, &sep)? {
        return Ok(false);
    }
    db.mark_dirty(parent);
    db.mark_dirty(sibling);
    db.mark_dirty(node);

    node.donate_leaf_entries(ctx, sibling, sibling_slot, left, moved as usize)?;

    // Finally insert the pending entry into this node.
    let insert_pos = if left { pos - boundary } else { pos };
    match node.create_leaf_entry(ctx, insert_pos, entry.encoded_len) {
        LeafAlloc::Loc(loc) => {
            node.copy_to_leaf_entry(entry, loc);
            adjust_frames_for_insert(node, insert_pos);
            Ok(true)
        }
        LeafAlloc::Full => bail!("rebalance freed insufficient space"),
    }
}

/// After a physical delete, merges a drained leaf into its neighbor and
/// cascades the underflow toward the root.
fn merge_after_delete<'a>(db: &'a DbShared, mut descent: WriteDescent<'a>) -> Result<()> {
    let ctx = db.node_ctx();

    if !descent.leaf.should_leaf_merge() {
        return Ok(());
    }
    let Some(mut parent) = descent.stack.pop() else {
        return Ok(()); // a leaf root never merges
    };

    let child_pos = parent.child_pos;
    let (left_pos, right_pos) = if child_pos > 0 {
        (child_pos - 2, child_pos)
    } else if child_pos + 2 <= parent.guard.highest_pos() {
        (child_pos, child_pos + 2)
    } else {
        return Ok(());
    };

    let left_id = parent.guard.retrieve_child_ref_id(left_pos);
    let right_id = parent.guard.retrieve_child_ref_id(right_pos);
    let leaf_is_left = left_id == descent.leaf.id;
    let other_id = if leaf_is_left { right_id } else { left_id };

    let (other_slot, mut other) = load_child_exclusive(db, &mut parent.guard, other_id)?;
    if other.split.is_some() || !other.is_leaf() {
        return Ok(());
    }

    let (right_slot, left, right) = if leaf_is_left {
        (other_slot, &mut descent.leaf, &mut other)
    } else {
        (descent.leaf_slot, &mut other, &mut descent.leaf)
    };

    let occupied =
        (right.page_size() - crate::config::TN_HEADER_SIZE) - right.available_leaf_bytes();
    if left.available_leaf_bytes() < occupied {
        return Ok(());
    }

    db.mark_dirty(&mut parent.guard);
    db.mark_dirty(left);
    db.mark_dirty(right);
    let left_slot = if leaf_is_left {
        descent.leaf_slot
    } else {
        other_slot
    };
    let right_page_id = right.id;
    move_leaf_to_left(&ctx, left_slot, left, right)?;
    parent.guard.delete_right_child_ref(right_pos);
    db.arena.map.remove(right_page_id, right_slot);
    right.id = 0;
    right.cached_state = CachedState::Clean;
    db.free_page_id(right_page_id)?;
    drop(other);
    drop(descent.leaf);
    db.arena.unused(right_slot);

    // The parent may now be drained.
    merge_internal_chain(db, descent.stack, parent)
}

/// Walks the retained spine upward, merging drained internal nodes and
/// finally collapsing a drained internal root into its lone child.
fn merge_internal_chain<'a>(
    db: &'a DbShared,
    mut stack: Vec<Ancestor<'a>>,
    mut node: Ancestor<'a>,
) -> Result<()> {
    let ctx = db.node_ctx();

    loop {
        if stack.is_empty() {
            // A drained internal root with a single child collapses; the
            // displaced child degrades into a stub until cursors drain.
            if !node.guard.is_leaf() && node.guard.num_keys() == 0 {
                let child_id = node.guard.retrieve_child_ref_id(0);
                let (child_slot, mut child) =
                    load_child_exclusive(db, &mut node.guard, child_id)?;
                if child.split.is_none() {
                    db.mark_dirty(&mut node.guard);
                    let (freed_id, _state) = root_delete(node.slot, &mut node.guard, &mut child)?;
                    db.arena.map.remove(freed_id, child_slot);
                    db.free_page_id(freed_id)?;
                    drop(child);
                    db.arena.unused(child_slot);
                }
            }
            return Ok(());
        }

        if !node.guard.should_internal_merge() {
            return Ok(());
        }
        let mut parent = stack.pop().expect("checked non-empty");

        let child_pos = parent.child_pos;
        let (left_pos, right_pos) = if child_pos > 0 {
            (child_pos - 2, child_pos)
        } else if child_pos + 2 <= parent.guard.highest_pos() {
            (child_pos, child_pos + 2)
        } else {
            node = parent;
            continue;
        };
        let left_id = parent.guard.retrieve_child_ref_id(left_pos);
        let right_id = parent.guard.retrieve_child_ref_id(right_pos);
        let node_is_left = left_id == node.guard.id;
        let other_id = if node_is_left { right_id } else { left_id };

        let (other_slot, mut other) = load_child_exclusive(db, &mut parent.guard, other_id)?;
        if other.split.is_some() || other.is_leaf() {
            node = parent;
            continue;
        }

        // The separator between the siblings comes down from the parent.
        let sep = parent.guard.retrieve_key(&ctx, left_pos)?;

        let (right_slot, left, right) = if node_is_left {
            (other_slot, &mut node.guard, &mut other)
        } else {
            (node.slot, &mut other, &mut node.guard)
        };

        let occupied = (right.page_size() - crate::config::TN_HEADER_SIZE)
            - right.available_internal_bytes();
        if left.available_internal_bytes() < occupied + sep.len() + 12 {
            node = parent;
            continue;
        }

        db.mark_dirty(&mut parent.guard);
        db.mark_dirty(left);
        db.mark_dirty(right);
        let right_page_id = right.id;
        move_internal_to_left(&ctx, left, right, &sep, false)?;
        parent.guard.delete_right_child_ref(right_pos);
        db.arena.map.remove(right_page_id, right_slot);
        right.id = 0;
        right.cached_state = CachedState::Clean;
        db.free_page_id(right_page_id)?;
        drop(other);
        drop(node);
        db.arena.unused(right_slot);

        node = parent;
    }
}

/// Recovery replay: applies a committed redo mutation directly, without
/// locks, undo, or further redo.
pub(crate) fn replay_write(
    db: &DbShared,
    tree: &TreeInner,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<()> {
    let _commit = db.commit_lock.shared();
    apply_leaf_write(db, tree, None, key, value).map(|_| ())
}

/// Physically removes a ghost slot after commit. Merging is left to
/// later deletes.
pub(crate) fn reap_ghost(db: &DbShared, tree: &TreeInner, key: &[u8]) -> Result<()> {
    let ctx = db.node_ctx();
    let mut descent = descend_for_write(db, tree, key, 0)?;
    if descent.pos >= 0 && !descent.leaf.has_leaf_value(descent.pos) {
        db.mark_dirty(&mut descent.leaf);
        descent.leaf.delete_leaf_entry(&ctx, descent.pos)?;
        adjust_frames_for_delete(&mut descent.leaf, descent.pos);
    }
    Ok(())
}

/// Restores a displaced entry during rollback: the slot's current
/// content (if any) is dropped and the saved bytes reinstated.
pub(crate) fn undo_restore_entry(
    db: &DbShared,
    tree: &TreeInner,
    key: &[u8],
    entry_bytes: &[u8],
) -> Result<()> {
    let ctx = db.node_ctx();
    let mut descent = descend_for_write(db, tree, key, entry_bytes.len())?;
    db.mark_dirty(&mut descent.leaf);
    let insert_pos = if descent.pos >= 0 {
        descent
            .leaf
            .delete_leaf_entry_keep_fragments(descent.pos)?;
        adjust_frames_for_delete(&mut descent.leaf, descent.pos);
        descent.pos
    } else {
        !descent.pos
    };
    match descent
        .leaf
        .create_leaf_entry(&ctx, insert_pos, entry_bytes.len())
    {
        LeafAlloc::Loc(loc) => {
            descent.leaf.page[loc..loc + entry_bytes.len()].copy_from_slice(entry_bytes);
            adjust_frames_for_insert(&mut descent.leaf, insert_pos);
            Ok(())
        }
        // The displaced entry fit this tree before; with its own slot
        // reclaimed and the key lock still held, it must fit again.
        LeafAlloc::Full => bail!("no room to restore displaced entry"),
    }
}

/// Removes an inserted entry during rollback.
pub(crate) fn undo_remove_entry(db: &DbShared, tree: &TreeInner, key: &[u8]) -> Result<()> {
    let ctx = db.node_ctx();
    let mut descent = descend_for_write(db, tree, key, 0)?;
    if descent.pos >= 0 {
        db.mark_dirty(&mut descent.leaf);
        descent.leaf.delete_leaf_entry(&ctx, descent.pos)?;
        adjust_frames_for_delete(&mut descent.leaf, descent.pos);
        merge_after_delete(db, descent)?;
    }
    Ok(())
}
