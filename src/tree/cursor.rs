//! # Tree Cursor
//!
//! A cursor owns one frame bound into the current leaf's frame list,
//! protected by that leaf's latch. Structural changes — split, merge,
//! rebalance — relocate bound frames while holding the latch, so a
//! cursor's position survives concurrent reshaping without pinning pages
//! for the duration.
//!
//! Moving past the edge of the bound leaf re-seeks from the root using
//! the cursor's copied key. Seeks descend with the parent latched until
//! the child subtree answers, trying successive siblings when a subtree
//! has nothing beyond the key — an all-ghost leaf, for instance.
//!
//! Ghost entries are invisible: iteration skips them and `load` reports
//! them as absent.

use std::sync::Arc;

use eyre::Result;

use super::{load_child_exclusive, write_value, TreeInner};
use crate::db::DbShared;
use crate::node::{Frame, NodeState, NIL_SLOT};
use crate::sync::ExclusiveGuard;
use crate::txn::Transaction;

/// Seek direction for the edge-crossing paths.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Dir {
    Forward,
    Backward,
}

impl Dir {
    fn step(self) -> i32 {
        match self {
            Dir::Forward => 2,
            Dir::Backward => -2,
        }
    }
}

pub struct TreeCursor {
    db: Arc<DbShared>,
    tree: Arc<TreeInner>,
    frame: Arc<Frame>,
    key: Option<Vec<u8>>,
}

/// Latches the frame's bound node, retrying across relocations.
fn latch_bound<'a>(
    db: &'a DbShared,
    frame: &Arc<Frame>,
) -> Option<(u32, ExclusiveGuard<'a, NodeState>)> {
    loop {
        let slot = frame.node_slot();
        if slot == NIL_SLOT {
            return None;
        }
        let guard = db.arena.node(slot).state.write();
        if frame.node_slot() == slot {
            return Some((slot, guard));
        }
    }
}

fn unbind(db: &DbShared, frame: &Arc<Frame>) {
    if let Some((_slot, mut guard)) = latch_bound(db, frame) {
        guard.unbind_frame(frame);
    }
}

impl TreeCursor {
    pub(crate) fn new(db: Arc<DbShared>, tree: Arc<TreeInner>) -> Self {
        Self {
            db,
            tree,
            frame: Frame::new(),
            key: None,
        }
    }

    /// Current key, or `None` when unpositioned or exhausted.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Unbinds and forgets the position.
    pub fn reset(&mut self) {
        unbind(&self.db, &self.frame);
        self.key = None;
    }

    /// Positions at the key, bound whether or not the key exists.
    pub fn find(&mut self, key: &[u8]) -> Result<()> {
        let db = Arc::clone(&self.db);
        unbind(&db, &self.frame);
        let ctx = db.node_ctx();
        let mut slot = self.tree.root_slot;
        let mut guard = db.arena.node(slot).state.write();
        loop {
            if guard.is_leaf() {
                let pos = guard.binary_search(&ctx, key)?;
                guard.bind_frame(slot, &self.frame, pos);
                self.key = Some(key.to_vec());
                return Ok(());
            }
            let pos = guard.binary_search(&ctx, key)?;
            let child_pos = if pos < 0 { !pos } else { pos + 2 };
            let child_id = guard.retrieve_child_ref_id(child_pos);
            let (child_slot, child_guard) = load_child_exclusive(&db, &mut guard, child_id)?;
            drop(guard);
            slot = child_slot;
            guard = child_guard;
        }
    }

    /// Positions at the first live entry.
    pub fn first(&mut self) -> Result<()> {
        let db = Arc::clone(&self.db);
        unbind(&db, &self.frame);
        self.key = None;
        let root = self.tree.root_slot;
        let guard = db.arena.node(root).state.write();
        self.seek_edge(&db, root, guard, Dir::Forward)?;
        Ok(())
    }

    /// Positions at the last live entry.
    pub fn last(&mut self) -> Result<()> {
        let db = Arc::clone(&self.db);
        unbind(&db, &self.frame);
        self.key = None;
        let root = self.tree.root_slot;
        let guard = db.arena.node(root).state.write();
        self.seek_edge(&db, root, guard, Dir::Backward)?;
        Ok(())
    }

    /// Advances to the next live entry, or exhausts the cursor.
    pub fn next(&mut self) -> Result<()> {
        self.step(Dir::Forward)
    }

    /// Retreats to the previous live entry, or exhausts the cursor.
    pub fn previous(&mut self) -> Result<()> {
        self.step(Dir::Backward)
    }

    fn step(&mut self, dir: Dir) -> Result<()> {
        let db = Arc::clone(&self.db);
        let Some((slot, mut guard)) = latch_bound(&db, &self.frame) else {
            self.key = None;
            return Ok(());
        };
        let pos = self.frame.pos();
        // A not-found binding names the first entry above the key, so
        // forward starts right on it and backward one below it.
        let mut candidate = match dir {
            Dir::Forward => {
                if pos < 0 {
                    !pos
                } else {
                    pos + 2
                }
            }
            Dir::Backward => {
                if pos < 0 {
                    !pos - 2
                } else {
                    pos - 2
                }
            }
        };
        let highest = guard.highest_key_pos();
        while candidate >= 0 && candidate <= highest {
            if guard.has_leaf_value(candidate) {
                let ctx = db.node_ctx();
                let key = guard.retrieve_key(&ctx, candidate)?;
                guard.unbind_frame(&self.frame);
                guard.bind_frame(slot, &self.frame, candidate);
                self.key = Some(key);
                return Ok(());
            }
            candidate += dir.step();
        }

        // Off the edge of this leaf: re-seek beyond the current key.
        guard.unbind_frame(&self.frame);
        drop(guard);
        let Some(key) = self.key.take() else {
            return Ok(());
        };
        let root = self.tree.root_slot;
        let root_guard = db.arena.node(root).state.write();
        self.seek_beyond(&db, root, root_guard, &key, dir)?;
        Ok(())
    }

    /// Value at the current position; `None` for ghosts, missing keys,
    /// and exhausted cursors.
    pub fn load(&mut self) -> Result<Option<Vec<u8>>> {
        if self.key.is_none() {
            return Ok(None);
        }
        let db = Arc::clone(&self.db);
        let Some((_slot, guard)) = latch_bound(&db, &self.frame) else {
            // The binding was lost; re-find by key.
            let key = self.key.clone().expect("key present");
            self.find(&key)?;
            return self.load();
        };
        let pos = self.frame.pos();
        if pos < 0 || !guard.has_leaf_value(pos) {
            return Ok(None);
        }
        let ctx = db.node_ctx();
        guard.retrieve_leaf_value(&ctx, pos)
    }

    /// Stores through the cursor at its current key.
    pub fn store(&mut self, txn: Option<&mut Transaction>, value: &[u8]) -> Result<()> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| eyre::eyre!("cursor is unpositioned"))?;
        write_value(&self.db, &self.tree, txn, &key, Some(value))?;
        Ok(())
    }

    /// Deletes the entry at the current key.
    pub fn delete(&mut self, txn: Option<&mut Transaction>) -> Result<()> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| eyre::eyre!("cursor is unpositioned"))?;
        write_value(&self.db, &self.tree, txn, &key, None)?;
        Ok(())
    }

    /// Binds to the extreme live entry of the subtree. Returns false when
    /// the subtree holds only ghosts.
    fn seek_edge(
        &mut self,
        db: &DbShared,
        slot: u32,
        mut guard: ExclusiveGuard<'_, NodeState>,
        dir: Dir,
    ) -> Result<bool> {
        if guard.is_leaf() {
            let highest = guard.highest_key_pos();
            let mut candidate = match dir {
                Dir::Forward => 0,
                Dir::Backward => highest,
            };
            while candidate >= 0 && candidate <= highest {
                if guard.has_leaf_value(candidate) {
                    let ctx = db.node_ctx();
                    let key = guard.retrieve_key(&ctx, candidate)?;
                    guard.bind_frame(slot, &self.frame, candidate);
                    self.key = Some(key);
                    return Ok(true);
                }
                candidate += dir.step();
            }
            return Ok(false);
        }

        let highest = guard.highest_pos();
        let mut child_pos = match dir {
            Dir::Forward => 0,
            Dir::Backward => highest,
        };
        loop {
            let child_id = guard.retrieve_child_ref_id(child_pos);
            let (child_slot, child_guard) = load_child_exclusive(db, &mut guard, child_id)?;
            if self.seek_edge(db, child_slot, child_guard, dir)? {
                return Ok(true);
            }
            child_pos += dir.step();
            if child_pos < 0 || child_pos > highest {
                return Ok(false);
            }
        }
    }

    /// Binds to the nearest live entry strictly beyond `key` in the seek
    /// direction. Returns false when the subtree has none.
    fn seek_beyond(
        &mut self,
        db: &DbShared,
        slot: u32,
        mut guard: ExclusiveGuard<'_, NodeState>,
        key: &[u8],
        dir: Dir,
    ) -> Result<bool> {
        let ctx = db.node_ctx();
        if guard.is_leaf() {
            let pos = guard.binary_search(&ctx, key)?;
            let highest = guard.highest_key_pos();
            let mut candidate = match dir {
                Dir::Forward => {
                    if pos < 0 {
                        !pos
                    } else {
                        pos + 2
                    }
                }
                Dir::Backward => {
                    if pos < 0 {
                        !pos - 2
                    } else {
                        pos - 2
                    }
                }
            };
            while candidate >= 0 && candidate <= highest {
                if guard.has_leaf_value(candidate) {
                    let found = guard.retrieve_key(&ctx, candidate)?;
                    guard.bind_frame(slot, &self.frame, candidate);
                    self.key = Some(found);
                    return Ok(true);
                }
                candidate += dir.step();
            }
            return Ok(false);
        }

        let pos = guard.binary_search(&ctx, key)?;
        let straddle = if pos < 0 { !pos } else { pos + 2 };
        let highest = guard.highest_pos();
        let mut child_pos = straddle;
        loop {
            let child_id = guard.retrieve_child_ref_id(child_pos);
            let (child_slot, child_guard) = load_child_exclusive(db, &mut guard, child_id)?;
            // The subtree straddling the key gets the precise seek; those
            // beyond it take their edge entry.
            let found = if child_pos == straddle {
                self.seek_beyond(db, child_slot, child_guard, key, dir)?
            } else {
                self.seek_edge(db, child_slot, child_guard, dir)?
            };
            if found {
                return Ok(true);
            }
            child_pos += dir.step();
            if child_pos < 0 || child_pos > highest {
                return Ok(false);
            }
        }
    }
}

impl Drop for TreeCursor {
    fn drop(&mut self) {
        unbind(&self.db, &self.frame);
    }
}
