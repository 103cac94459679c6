//! Split, rebalance, and merge: the operations that move entries between
//! nodes.
//!
//! A split runs in two phases. Phase one, under the splitting node's
//! exclusive latch, moves roughly half the entries into a freshly
//! allocated unevictable sibling and records a [`Split`] descriptor on
//! the node; the sibling is not yet reachable from the parent. Phase two,
//! under the parent's exclusive latch, materializes the descriptor as a
//! separator key plus child id in the parent (possibly cascading), clears
//! the descriptor, and lets the sibling be evicted again. At the root the
//! split finishes by copying the root's content into a new child and
//! promoting the split key into the root, which becomes internal — the
//! root node itself never moves.
//!
//! Rebalance is the only path that touches a sibling without splitting:
//! it shifts entries across under the parent's latch and rewrites the
//! parent's separator. Merge is its terminal form on the delete path,
//! absorbing a drained right node into its left sibling.
//!
//! Cursor frames bound to a moved entry are relocated while both latches
//! are held, so an iterating cursor never observes a torn move.

use eyre::{bail, ensure, Result};

use super::encoding::{calculate_key_length, encode_key, entry_length_at, midpoint_key};
use super::internal::InternalAlloc;
use super::leaf::{LeafAlloc, PreparedEntry};
use super::{
    CachedState, NodeContext, NodeState, HIGH_EXTREMITY, LOW_EXTREMITY, TYPE_TN_BIN, TYPE_TN_IN,
    TYPE_TN_LEAF,
};

/// Transient descriptor attached to a node between split phases.
#[derive(Debug)]
pub(crate) struct Split {
    /// True when the new sibling holds the low half.
    pub new_is_left: bool,
    pub sibling_slot: u32,
    pub sibling_id: u64,
    /// Full separator key: everything in the left half is <= it in the
    /// leaf case, strictly below it in the internal case.
    pub key: Vec<u8>,
    pub key_fragmented: bool,
}

impl Split {
    pub(crate) fn encoded_key_length(&self) -> usize {
        if self.key_fragmented {
            2 + self.key.len()
        } else {
            calculate_key_length(&self.key)
        }
    }
}

/// Splits a full leaf while inserting a prepared entry at `pos`. The
/// sibling must be empty, unevictable, and exclusively latched; on return
/// the node carries the split descriptor.
pub(crate) fn split_leaf(
    ctx: &NodeContext<'_>,
    node: &mut NodeState,
    sibling: &mut NodeState,
    sibling_slot: u32,
    pos: i32,
    entry: &PreparedEntry,
) -> Result<()> {
    ensure!(node.split.is_none(), "node is already splitting");

    let svs = node.search_vec_start();
    let sve = node.search_vec_end();
    let vec_len = sve + 2 - svs;

    // Find the byte midpoint of the live entries.
    let mut total = 0usize;
    let mut entry_lens = Vec::with_capacity(vec_len / 2);
    let mut vec_loc = svs;
    while vec_loc <= sve {
        let loc = u16::from_le_bytes([node.page[vec_loc], node.page[vec_loc + 1]]) as usize;
        let len = entry_length_at(&node.page, loc);
        entry_lens.push(len);
        total += len;
        vec_loc += 2;
    }

    // Split side tracks the insertion: a low insert sends the low half to
    // the new (left) sibling, a high insert sends the high half right.
    let new_is_left = pos < vec_len as i32 / 2;

    sibling.set_typ(if new_is_left {
        TYPE_TN_LEAF | (node.typ() & LOW_EXTREMITY)
    } else {
        TYPE_TN_LEAF | (node.typ() & HIGH_EXTREMITY)
    });
    sibling.clear_entries();
    sibling.cached_state = node.cached_state;

    // Number of entries moved off the node: walk from the donated end
    // until half the bytes have moved.
    let mut moved = 0usize;
    let mut moved_bytes = 0usize;
    if new_is_left {
        while moved < entry_lens.len() - 1 && moved_bytes < total / 2 {
            moved_bytes += entry_lens[moved];
            moved += 1;
        }
    } else {
        while moved < entry_lens.len() - 1 && moved_bytes < total / 2 {
            moved_bytes += entry_lens[entry_lens.len() - 1 - moved];
            moved += 1;
        }
    }
    let moved_vec_bytes = moved * 2;

    if new_is_left {
        // Copy the low entries into the sibling, appending in order.
        for i in 0..moved {
            let src_pos = (i * 2) as i32;
            let src_loc = node.entry_loc(src_pos);
            let len = entry_lens[i];
            match sibling.create_leaf_entry(ctx, src_pos, len) {
                LeafAlloc::Loc(dst_loc) => {
                    let (src_page, dst_page) = (&node.page, &mut sibling.page);
                    dst_page[dst_loc..dst_loc + len]
                        .copy_from_slice(&src_page[src_loc..src_loc + len]);
                }
                LeafAlloc::Full => bail!("split sibling overflow"),
            }
        }
        // Drop the moved prefix from the node.
        node.set_search_vec_start(svs + moved_vec_bytes);
        node.set_garbage(node.garbage() + moved_bytes);
        node.set_typ(node.typ() & !LOW_EXTREMITY);

        // Relocate frames bound below the boundary.
        relocate_leaf_frames(node, sibling, sibling_slot, |p| {
            if p < moved_vec_bytes as i32 {
                Some(p)
            } else {
                None
            }
        });
        shift_remaining_frames(node, -(moved_vec_bytes as i32));
    } else {
        // Copy the high entries into the sibling, prepending in reverse
        // so order is preserved.
        let first_moved = entry_lens.len() - moved;
        for i in (first_moved..entry_lens.len()).rev() {
            let src_pos = (i * 2) as i32;
            let src_loc = node.entry_loc(src_pos);
            let len = entry_lens[i];
            match sibling.create_leaf_entry(ctx, 0, len) {
                LeafAlloc::Loc(dst_loc) => {
                    let (src_page, dst_page) = (&node.page, &mut sibling.page);
                    dst_page[dst_loc..dst_loc + len]
                        .copy_from_slice(&src_page[src_loc..src_loc + len]);
                }
                LeafAlloc::Full => bail!("split sibling overflow"),
            }
        }
        node.set_search_vec_end(sve - moved_vec_bytes);
        node.set_garbage(node.garbage() + moved_bytes);
        node.set_typ(node.typ() & !HIGH_EXTREMITY);

        let boundary = (first_moved * 2) as i32;
        relocate_leaf_frames(node, sibling, sibling_slot, |p| {
            if p >= boundary {
                Some(p - boundary)
            } else {
                None
            }
        });
    }

    // Insert the pending entry into whichever half owns its position.
    let boundary = if new_is_left {
        moved_vec_bytes as i32
    } else {
        ((entry_lens.len() - moved) * 2) as i32
    };
    let (target, target_pos): (&mut NodeState, i32) = if new_is_left {
        if pos < boundary {
            (sibling, pos)
        } else {
            (node, pos - boundary)
        }
    } else if pos < boundary {
        (node, pos)
    } else {
        (sibling, pos - boundary)
    };
    match target.create_leaf_entry(ctx, target_pos, entry.encoded_len) {
        LeafAlloc::Loc(loc) => target.copy_to_leaf_entry(entry, loc),
        LeafAlloc::Full => bail!("no room for entry after split"),
    }
    adjust_frames_for_insert(target, target_pos);

    // Separator: midpoint between the highest key of the left half and
    // the lowest key of the right half.
    let (left, right): (&NodeState, &NodeState) = if new_is_left {
        (sibling, node)
    } else {
        (node, sibling)
    };
    let low = left.retrieve_key(ctx, left.highest_key_pos())?;
    let high = right.retrieve_key(ctx, 0)?;
    let key = midpoint_key(&low, &high)?;
    ensure!(
        key.len() <= ctx.max_key_size,
        "split separator would need fragmenting",
    );

    node.split = Some(Box::new(Split {
        new_is_left,
        sibling_slot,
        sibling_id: sibling.id,
        key,
        key_fragmented: false,
    }));
    Ok(())
}

fn relocate_leaf_frames<F: Fn(i32) -> Option<i32>>(
    node: &mut NodeState,
    sibling: &mut NodeState,
    sibling_slot: u32,
    map_pos: F,
) {
    let mut i = 0;
    while i < node.frames.len() {
        let pos = node.frames[i].pos();
        // Not-found frames keep their complement form through relocation.
        let key_pos = if pos < 0 { !pos } else { pos };
        if let Some(new_key_pos) = map_pos(key_pos) {
            let frame = node.frames.swap_remove(i);
            let new_pos = if pos < 0 { !new_key_pos } else { new_key_pos };
            sibling.bind_frame(sibling_slot, &frame, new_pos);
        } else {
            i += 1;
        }
    }
}

fn shift_remaining_frames(node: &mut NodeState, delta: i32) {
    for frame in &node.frames {
        let pos = frame.pos();
        if pos < 0 {
            frame.set_pos(!((!pos) + delta));
        } else {
            frame.set_pos(pos + delta);
        }
    }
}

/// Shifts frames at or above an insertion position two bytes right.
/// Caller holds the node latch.
pub(crate) fn adjust_frames_for_insert(node: &mut NodeState, pos: i32) {
    for frame in &node.frames {
        let frame_pos = frame.pos();
        let key_pos = if frame_pos < 0 { !frame_pos } else { frame_pos };
        if key_pos >= pos {
            frame.set_pos(if frame_pos < 0 {
                !(key_pos + 2)
            } else {
                key_pos + 2
            });
        }
    }
}

/// Shifts frames past a deleted position two bytes left; frames on the
/// deleted entry itself become not-found bindings at the same spot.
pub(crate) fn adjust_frames_for_delete(node: &mut NodeState, pos: i32) {
    for frame in &node.frames {
        let frame_pos = frame.pos();
        let key_pos = if frame_pos < 0 { !frame_pos } else { frame_pos };
        if key_pos > pos {
            frame.set_pos(if frame_pos < 0 {
                !(key_pos - 2)
            } else {
                key_pos - 2
            });
        } else if key_pos == pos && frame_pos >= 0 {
            frame.set_pos(!pos);
        }
    }
}

/// Splits a full internal node while inserting a separator at `key_pos`
/// with its right child at 8-based `new_child_pos`. The median key is
/// promoted into the descriptor; when the incoming key itself is the
/// median it is promoted directly without ever living in either half.
pub(crate) fn split_internal(
    ctx: &NodeContext<'_>,
    node: &mut NodeState,
    sibling: &mut NodeState,
    sibling_slot: u32,
    key_pos: i32,
    new_key: &[u8],
    new_key_fragmented: bool,
    new_child_id: u64,
) -> Result<()> {
    ensure!(node.split.is_none(), "node is already splitting");

    // Materialize the merged sequence of keys and children.
    let num_keys = node.num_keys();
    let mut keys: Vec<(Vec<u8>, bool)> = Vec::with_capacity(num_keys + 1);
    let mut children: Vec<u64> = Vec::with_capacity(num_keys + 2);
    for i in 0..num_keys {
        let pos = (i * 2) as i32;
        let loc = node.entry_loc(pos);
        let key = super::encoding::decode_key_at(&node.page, loc);
        keys.push((
            node.page[key.data_loc..key.data_loc + key.len].to_vec(),
            key.fragmented,
        ));
    }
    for i in 0..=num_keys {
        children.push(node.retrieve_child_ref_id((i * 2) as i32));
    }

    let insert_at = (key_pos / 2) as usize;
    keys.insert(insert_at, (new_key.to_vec(), new_key_fragmented));
    // The new child goes just right of the new key.
    children.insert(insert_at + 1, new_child_id);

    let median = keys.len() / 2;
    let (split_key, split_key_fragmented) = keys[median].clone();
    let node_typ = node.typ();

    // Left half keeps the node; right half goes to the sibling.
    sibling.set_typ((node_typ & 0xF4) | (node_typ & HIGH_EXTREMITY));
    sibling.clear_entries();
    sibling.cached_state = node.cached_state;
    rebuild_internal(ctx, sibling, &keys[median + 1..], &children[median + 1..])?;

    let left_typ = (node_typ & 0xF4) | (node_typ & LOW_EXTREMITY);
    node.set_typ(left_typ);
    node.clear_entries();
    rebuild_internal(ctx, node, &keys[..median], &children[..=median])?;

    node.split = Some(Box::new(Split {
        new_is_left: false,
        sibling_slot,
        sibling_id: sibling.id,
        key: split_key,
        key_fragmented: split_key_fragmented,
    }));
    Ok(())
}

/// Rebuilds an internal node from scratch with the given keys and
/// children (children.len() == keys.len() + 1).
fn rebuild_internal(
    ctx: &NodeContext<'_>,
    state: &mut NodeState,
    keys: &[(Vec<u8>, bool)],
    children: &[u64],
) -> Result<()> {
    debug_assert_eq!(children.len(), keys.len() + 1);
    // Seed the first child of the empty vector.
    let base = state.search_vec_end() + 2;
    state.page[base..base + 8].copy_from_slice(&children[0].to_le_bytes());

    for (i, (key, fragmented)) in keys.iter().enumerate() {
        let key_pos = (i * 2) as i32;
        let encoded_len = if *fragmented {
            2 + key.len()
        } else {
            calculate_key_length(key)
        };
        match state.create_internal_entry(ctx, key_pos, encoded_len, ((i + 1) * 8) as i32) {
            InternalAlloc::Loc {
                entry_loc,
                child_loc,
            } => {
                encode_key(&mut state.page, entry_loc, key, *fragmented);
                state.page[child_loc..child_loc + 8]
                    .copy_from_slice(&children[i + 1].to_le_bytes());
            }
            InternalAlloc::Full => bail!("internal rebuild overflow"),
        }
    }
    Ok(())
}

impl NodeState {
    /// Rebalance move: donates `count` entries from this node's low end
    /// (appended to a left sibling) or high end (prepended to a right
    /// sibling), relocating their cursor frames. The caller has verified
    /// the receiver's capacity and updated the parent separator.
    pub(crate) fn donate_leaf_entries(
        &mut self,
        ctx: &NodeContext<'_>,
        sibling: &mut NodeState,
        sibling_slot: u32,
        to_left: bool,
        count: usize,
    ) -> Result<()> {
        let num_keys = self.num_keys();
        debug_assert!(count < num_keys);
        let mut moved_bytes = 0usize;

        if to_left {
            let base = sibling.highest_key_pos() + 2;
            for i in 0..count {
                let src_loc = self.entry_loc((i * 2) as i32);
                let len = entry_length_at(&self.page, src_loc);
                match sibling.create_leaf_entry(ctx, base + (i * 2) as i32, len) {
                    LeafAlloc::Loc(dst_loc) => {
                        sibling.page[dst_loc..dst_loc + len]
                            .copy_from_slice(&self.page[src_loc..src_loc + len]);
                    }
                    LeafAlloc::Full => bail!("rebalance receiver overflow"),
                }
                moved_bytes += len;
            }
            let boundary = (count * 2) as i32;
            self.set_search_vec_start(self.search_vec_start() + count * 2);
            self.set_garbage(self.garbage() + moved_bytes);
            relocate_leaf_frames(self, sibling, sibling_slot, |p| {
                if p < boundary {
                    Some(p + base)
                } else {
                    None
                }
            });
            shift_remaining_frames(self, -boundary);
        } else {
            let first_moved = num_keys - count;
            for i in (first_moved..num_keys).rev() {
                let src_loc = self.entry_loc((i * 2) as i32);
                let len = entry_length_at(&self.page, src_loc);
                match sibling.create_leaf_entry(ctx, 0, len) {
                    LeafAlloc::Loc(dst_loc) => {
                        sibling.page[dst_loc..dst_loc + len]
                            .copy_from_slice(&self.page[src_loc..src_loc + len]);
                    }
                    LeafAlloc::Full => bail!("rebalance receiver overflow"),
                }
                moved_bytes += len;
            }
            let boundary = (first_moved * 2) as i32;
            self.set_search_vec_end(self.search_vec_end() - count * 2);
            self.set_garbage(self.garbage() + moved_bytes);
            // Frames already bound in the sibling shift right past the
            // incoming prefix.
            for frame in &sibling.frames {
                let pos = frame.pos();
                let key_pos = if pos < 0 { !pos } else { pos };
                let shifted = key_pos + (count * 2) as i32;
                frame.set_pos(if pos < 0 { !shifted } else { shifted });
            }
            relocate_leaf_frames(self, sibling, sibling_slot, |p| {
                if p >= boundary {
                    Some(p - boundary)
                } else {
                    None
                }
            });
        }
        Ok(())
    }
}

/// Phase two at an ordinary parent: materializes a child's split as a
/// separator plus child id. `key_pos` is the 2-based position where the
/// separator belongs (the child's own position). Returns false when the
/// parent itself is full and must split first.
pub(crate) fn insert_split_child_ref(
    ctx: &NodeContext<'_>,
    parent: &mut NodeState,
    key_pos: i32,
    split: &Split,
) -> Result<bool> {
    let new_child_pos = if split.new_is_left {
        // New sibling holds the low half: it takes the child's slot and
        // the old child shifts right.
        key_pos >> 1
    } else {
        (key_pos >> 1) + 1
    };

    match parent.create_internal_entry(
        ctx,
        key_pos,
        split.encoded_key_length(),
        new_child_pos << 3,
    ) {
        InternalAlloc::Loc {
            entry_loc,
            child_loc,
        } => {
            encode_key(&mut parent.page, entry_loc, &split.key, split.key_fragmented);
            parent.page[child_loc..child_loc + 8]
                .copy_from_slice(&split.sibling_id.to_le_bytes());
            Ok(true)
        }
        InternalAlloc::Full => Ok(false),
    }
}

/// Finishes a root split. The root's current content (already carrying
/// the split descriptor) moves into `child`, and the root becomes an
/// internal node holding only the promoted key and two child ids. The
/// root's identity — its arena slot and page id — never changes.
pub(crate) fn finish_split_root(
    child_slot: u32,
    root: &mut NodeState,
    child: &mut NodeState,
) -> Result<()> {
    let split = *root.split.take().expect("root split descriptor");

    // Move the root's page into the child wholesale.
    std::mem::swap(&mut root.page, &mut child.page);
    child.cached_state = root.cached_state;

    // Frames bound to the old root content follow it into the child.
    let frames = std::mem::take(&mut root.frames);
    for frame in frames {
        let pos = frame.pos();
        child.bind_frame(child_slot, &frame, pos);
    }

    let was_leaf = child.is_leaf();
    let root_typ = if was_leaf { TYPE_TN_BIN } else { TYPE_TN_IN };
    root.set_typ(root_typ | LOW_EXTREMITY | HIGH_EXTREMITY);
    root.clear_entries();

    let (left_id, right_id) = if split.new_is_left {
        (split.sibling_id, child.id)
    } else {
        (child.id, split.sibling_id)
    };

    // Write the lone separator and the two children directly. The vector
    // is about to grow one slot to the left.
    let encoded_len = split.encoded_key_length();
    let free = root.search_vec_start() - 2 - root.left_seg_tail();
    ensure!(encoded_len <= free, "root split key too large");
    let entry_loc = root.left_seg_tail();
    encode_key(&mut root.page, entry_loc, &split.key, split.key_fragmented);
    root.set_left_seg_tail(entry_loc + encoded_len);

    let svs = root.search_vec_start() - 2;
    root.set_search_vec_start(svs);
    root.set_search_vec_end(svs);
    root.set_entry_loc(0, entry_loc);
    root.set_child_ref_id(0, left_id);
    root.set_child_ref_id(2, right_id);
    Ok(())
}

/// Moves every entry of `right` to the tail of `left` and empties
/// `right`. Caller has verified the fit and holds both latches plus the
/// parent's.
pub(crate) fn move_leaf_to_left(
    ctx: &NodeContext<'_>,
    left_slot: u32,
    left: &mut NodeState,
    right: &mut NodeState,
) -> Result<()> {
    let left_old_end = left.highest_key_pos() + 2;

    let svs = right.search_vec_start();
    let sve = right.search_vec_end();
    let mut vec_loc = svs;
    let mut dst_pos = left_old_end;
    while vec_loc <= sve {
        let src_loc = u16::from_le_bytes([right.page[vec_loc], right.page[vec_loc + 1]]) as usize;
        let len = entry_length_at(&right.page, src_loc);
        match left.create_leaf_entry(ctx, dst_pos, len) {
            LeafAlloc::Loc(dst_loc) => {
                left.page[dst_loc..dst_loc + len]
                    .copy_from_slice(&right.page[src_loc..src_loc + len]);
            }
            LeafAlloc::Full => bail!("merge target overflow"),
        }
        vec_loc += 2;
        dst_pos += 2;
    }

    // Cursors in the right node follow their entries.
    relocate_leaf_frames(right, left, left_slot, |p| Some(p + left_old_end));

    // If the right node was the high extremity, the left one now is.
    let typ = left.typ() | (right.typ() & HIGH_EXTREMITY);
    left.set_typ(typ);
    right.clear_entries();
    Ok(())
}

/// Moves every entry of the right internal node into the left one,
/// absorbing the parent separator between them. The parent separator's
/// encoded bytes are passed in; the caller then deletes the right child
/// ref from the parent.
pub(crate) fn move_internal_to_left(
    ctx: &NodeContext<'_>,
    left: &mut NodeState,
    right: &mut NodeState,
    parent_key: &[u8],
    parent_key_fragmented: bool,
) -> Result<()> {
    // The parent key becomes the separator between left's last child and
    // right's first child.
    let mut keys: Vec<(Vec<u8>, bool)> = vec![(parent_key.to_vec(), parent_key_fragmented)];
    let mut children: Vec<u64> = Vec::new();
    for i in 0..right.num_keys() {
        let loc = right.entry_loc((i * 2) as i32);
        let key = super::encoding::decode_key_at(&right.page, loc);
        keys.push((
            right.page[key.data_loc..key.data_loc + key.len].to_vec(),
            key.fragmented,
        ));
    }
    for i in 0..=right.num_keys() {
        children.push(right.retrieve_child_ref_id((i * 2) as i32));
    }

    let mut key_pos = left.highest_key_pos() + 2;
    let mut child_index = (key_pos / 2) + 1;
    for (i, (key, fragmented)) in keys.iter().enumerate() {
        let encoded_len = if *fragmented {
            2 + key.len()
        } else {
            calculate_key_length(key)
        };
        match left.create_internal_entry(ctx, key_pos, encoded_len, (child_index * 8) as i32) {
            InternalAlloc::Loc {
                entry_loc,
                child_loc,
            } => {
                encode_key(&mut left.page, entry_loc, key, *fragmented);
                left.page[child_loc..child_loc + 8]
                    .copy_from_slice(&children[i].to_le_bytes());
            }
            InternalAlloc::Full => bail!("internal merge target overflow"),
        }
        key_pos += 2;
        child_index += 1;
    }

    let typ = left.typ() | (right.typ() & HIGH_EXTREMITY);
    left.set_typ(typ);
    right.clear_entries();
    Ok(())
}

/// Deletes an internal root that has drained to a single child: the
/// child's content is swapped into the root and the child degrades into
/// a stub. Cursors bound to the child follow the content into the root.
pub(crate) fn root_delete(
    root_slot: u32,
    root: &mut NodeState,
    child: &mut NodeState,
) -> Result<(u64, CachedState)> {
    ensure!(
        !root.is_leaf() && root.num_keys() == 0,
        "root delete requires a drained internal root",
    );
    ensure!(child.split.is_none(), "child is mid-split");

    let freed_id = child.id;
    let freed_state = child.cached_state;

    std::mem::swap(&mut root.page, &mut child.page);
    root.cached_state = child.cached_state;

    let frames = std::mem::take(&mut child.frames);
    for frame in frames {
        let pos = frame.pos();
        root.bind_frame(root_slot, &frame, pos);
    }

    // The child becomes a stub: reserved id, clean, drained.
    child.id = crate::config::STUB_ID;
    child.cached_state = CachedState::Clean;
    child.as_empty_root();
    Ok((freed_id, freed_state))
}
