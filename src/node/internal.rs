//! Internal-node algorithms.
//!
//! Internal nodes store separator keys in the search vector and 8-byte
//! child ids contiguously after the vector end — one more child than keys.
//! Making room for a new separator therefore means opening a 2-byte gap in
//! the vector *and* an 8-byte gap in the child array in one motion. Two
//! shift strategies exist and the one moving fewer bytes wins:
//!
//! - shift the vector left by 10 and the leading child ids left by 8
//!   (gaps open at the key position and child position), or
//! - shift the vector prefix left by 2 and the trailing child ids right
//!   by 8.
//!
//! Deletion mirrors the same choice in reverse. When neither shift fits,
//! the node re-centers its vector or compacts into a spare page; when even
//! compaction cannot help, the node reports `Full` and the tree layer
//! rebalances or splits.

use eyre::Result;

use super::encoding::{calculate_key_length, encode_key, key_length_at};
use super::{NodeContext, NodeState, TN_HEADER_SIZE};

/// Result of asking an internal node for separator space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalAlloc {
    /// Key entry location and absolute child-id location, both allocated
    /// and pointed to; content is the caller's to write.
    Loc { entry_loc: usize, child_loc: usize },
    /// No room even after compaction; rebalance or split.
    Full,
}

enum CompactMode {
    /// Insert a new key at `key_pos` and a new child gap at the 8-based
    /// `child_pos`.
    Insert { key_pos: i32, child_pos: i32 },
    /// Reallocate the key at `key_pos` with a new size, keeping the child
    /// array as is.
    Replace { key_pos: i32 },
}

impl NodeState {
    /// Child id at a 2-based child position.
    pub(crate) fn retrieve_child_ref_id(&self, child_pos: i32) -> u64 {
        let loc = self.search_vec_end() + 2 + ((child_pos as usize) << 2);
        u64::from_le_bytes(self.page[loc..loc + 8].try_into().expect("8-byte child id"))
    }

    pub(crate) fn set_child_ref_id(&mut self, child_pos: i32, id: u64) {
        let loc = self.search_vec_end() + 2 + ((child_pos as usize) << 2);
        self.page[loc..loc + 8].copy_from_slice(&id.to_le_bytes());
    }

    /// Free bytes after the child-id region.
    fn internal_right_space(&self) -> i32 {
        let sve = self.search_vec_end() as i32;
        let svs = self.search_vec_start() as i32;
        let child_ids_len = ((sve - svs + 2) << 2) + 8;
        self.right_seg_tail() as i32 + 1 - (sve + 2 + child_ids_len)
    }

    /// Makes room for a separator of `encoded_len` at 2-based `key_pos`
    /// with a child gap at 8-based `new_child_pos`. On success the search
    /// vector slot points at the returned entry location; the key bytes
    /// and child id are the caller's to write.
    pub(crate) fn create_internal_entry(
        &mut self,
        ctx: &NodeContext<'_>,
        key_pos: i32,
        encoded_len: usize,
        new_child_pos: i32,
    ) -> InternalAlloc {
        let svs = self.search_vec_start() as i32;
        let sve = self.search_vec_end() as i32;

        let left_space = svs - self.left_seg_tail() as i32;
        let right_space = self.internal_right_space();

        let vec_len = sve - svs + 2;
        let child_ids_len = (vec_len << 2) + 8;

        // Try the cheaper of the two combined shifts.
        if new_child_pos < ((3 * vec_len + key_pos + 8) >> 1) {
            // Vector left by 10, leading child ids left by 8.
            if left_space >= 10 {
                if let Some(entry_loc) = self.alloc_page_entry(
                    encoded_len,
                    (left_space - 10) as usize,
                    right_space.max(0) as usize,
                ) {
                    let svs_u = svs as usize;
                    self.page
                        .copy_within(svs_u..svs_u + key_pos as usize, svs_u - 10);
                    self.page.copy_within(
                        svs_u + key_pos as usize
                            ..svs_u + (vec_len + new_child_pos) as usize,
                        svs_u + key_pos as usize - 8,
                    );
                    self.set_search_vec_start(svs_u - 10);
                    self.set_search_vec_end((sve - 8) as usize);
                    let abs_key = svs_u - 10 + key_pos as usize;
                    self.page[abs_key..abs_key + 2]
                        .copy_from_slice(&(entry_loc as u16).to_le_bytes());
                    let child_loc = (sve - 8 + 2 + new_child_pos) as usize;
                    return InternalAlloc::Loc {
                        entry_loc,
                        child_loc,
                    };
                }
            }
        } else if left_space >= 2 && right_space >= 8 {
            // Vector prefix left by 2, trailing child ids right by 8.
            if let Some(entry_loc) = self.alloc_page_entry(
                encoded_len,
                (left_space - 2) as usize,
                (right_space - 8) as usize,
            ) {
                let svs_u = svs as usize;
                self.page
                    .copy_within(svs_u..svs_u + key_pos as usize, svs_u - 2);
                self.set_search_vec_start(svs_u - 2);
                let trail_start = (sve + 2 + new_child_pos) as usize;
                let trail_len = (child_ids_len - new_child_pos) as usize;
                self.page
                    .copy_within(trail_start..trail_start + trail_len, trail_start + 8);
                let abs_key = svs_u - 2 + key_pos as usize;
                self.page[abs_key..abs_key + 2]
                    .copy_from_slice(&(entry_loc as u16).to_le_bytes());
                let child_loc = (sve + 2 + new_child_pos) as usize;
                return InternalAlloc::Loc {
                    entry_loc,
                    child_loc,
                };
            }
        }

        // Space remaining around the vector once everything is accounted.
        let remaining = left_space + right_space - encoded_len as i32 - 10;

        if (self.garbage() as i32) > remaining {
            if (self.garbage() as i32) + remaining < 0 {
                return InternalAlloc::Full;
            }
            let (entry_loc, child_loc) = self.compact_internal(
                ctx,
                encoded_len,
                CompactMode::Insert {
                    key_pos,
                    child_pos: new_child_pos,
                },
            );
            return InternalAlloc::Loc {
                entry_loc,
                child_loc,
            };
        }

        // Re-center the vector plus child ids, biased for even alignment.
        let new_svs;
        let entry_loc;
        if remaining > 0 || (self.right_seg_tail() & 1) != 0 {
            new_svs = (self.right_seg_tail() as i32 - vec_len - child_ids_len + (1 - 10)
                - (remaining >> 1))
                & !1;
            entry_loc = self.left_seg_tail();
            self.set_left_seg_tail(entry_loc + encoded_len);
        } else if (self.left_seg_tail() & 1) == 0 {
            new_svs = self.left_seg_tail() as i32 + ((remaining >> 1) & !1);
            entry_loc = self.right_seg_tail() + 1 - encoded_len;
            self.set_right_seg_tail(entry_loc - 1);
        } else {
            let (entry_loc, child_loc) = self.compact_internal(
                ctx,
                encoded_len,
                CompactMode::Insert {
                    key_pos,
                    child_pos: new_child_pos,
                },
            );
            return InternalAlloc::Loc {
                entry_loc,
                child_loc,
            };
        }

        let new_sve = new_svs + vec_len;
        // Three regions: vector prefix, vector suffix plus leading child
        // ids (opening the key gap), and trailing child ids (opening the
        // child gap). Copy order depends on the move direction.
        let r1 = (
            svs as usize,
            new_svs as usize,
            key_pos as usize,
        );
        let r2 = (
            (svs + key_pos) as usize,
            (new_svs + key_pos + 2) as usize,
            (vec_len - key_pos + new_child_pos) as usize,
        );
        let r3 = (
            (sve + 2 + new_child_pos) as usize,
            (new_sve + 10 + new_child_pos) as usize,
            (child_ids_len - new_child_pos) as usize,
        );
        if new_svs <= svs {
            for (src, dst, len) in [r1, r2, r3] {
                self.page.copy_within(src..src + len, dst);
            }
        } else {
            for (src, dst, len) in [r3, r2, r1] {
                self.page.copy_within(src..src + len, dst);
            }
        }

        self.set_search_vec_start(new_svs as usize);
        self.set_search_vec_end(new_sve as usize);
        let abs_key = (new_svs + key_pos) as usize;
        self.page[abs_key..abs_key + 2].copy_from_slice(&(entry_loc as u16).to_le_bytes());
        InternalAlloc::Loc {
            entry_loc,
            child_loc: (new_sve + 2 + new_child_pos) as usize,
        }
    }

    /// Copying compaction for internal nodes: rebuilds entries, vector,
    /// and child ids into a spare page, reserving a pending allocation.
    /// Returns the pending entry location and the absolute child-id
    /// location of the gap (for `Replace`, the existing child location).
    fn compact_internal(
        &mut self,
        ctx: &NodeContext<'_>,
        encoded_len: usize,
        mode: CompactMode,
    ) -> (usize, usize) {
        let page_size = self.page_size();
        let svs = self.search_vec_start();
        let sve = self.search_vec_end();
        let vec_len = sve + 2 - svs;
        let child_ids_len = (vec_len << 2) + 8;

        let (new_vec_len, new_child_len, insert_key_abs, insert_child_off) = match mode {
            CompactMode::Insert { key_pos, child_pos } => (
                vec_len + 2,
                child_ids_len + 8,
                Some(svs + key_pos as usize),
                child_pos as usize,
            ),
            CompactMode::Replace { key_pos } => {
                (vec_len, child_ids_len, Some(svs + key_pos as usize), 0)
            }
        };
        let replace = matches!(mode, CompactMode::Replace { .. });

        let mut dest = ctx.spares.remove();
        dest[0] = self.typ();
        dest[1] = 0;

        // Vector and children go to the far right; free space stays
        // contiguous between the left segment and the vector.
        let new_svs = (page_size - new_child_len - new_vec_len) & !1;

        let mut dest_loc = TN_HEADER_SIZE;
        let mut new_vec_loc = new_svs;
        let mut pending_vec_loc = None;

        let mut vec_loc = svs;
        while vec_loc <= sve {
            if Some(vec_loc) == insert_key_abs {
                pending_vec_loc = Some(new_vec_loc);
                if replace {
                    // The old key at this slot is dropped.
                    vec_loc += 2;
                    continue;
                }
                new_vec_loc += 2;
            }
            let source_loc =
                u16::from_le_bytes([self.page[vec_loc], self.page[vec_loc + 1]]) as usize;
            let len = key_length_at(&self.page, source_loc);
            dest[new_vec_loc..new_vec_loc + 2].copy_from_slice(&(dest_loc as u16).to_le_bytes());
            dest[dest_loc..dest_loc + len].copy_from_slice(&self.page[source_loc..source_loc + len]);
            dest_loc += len;
            vec_loc += 2;
            new_vec_loc += 2;
        }
        let pending = pending_vec_loc.unwrap_or(new_vec_loc);
        dest[pending..pending + 2].copy_from_slice(&(dest_loc as u16).to_le_bytes());

        // Child ids, with a gap when inserting.
        let new_sve = new_svs + new_vec_len - 2;
        let old_child_base = sve + 2;
        let new_child_base = new_sve + 2;
        let child_loc = new_child_base + insert_child_off;
        if replace {
            dest[new_child_base..new_child_base + child_ids_len]
                .copy_from_slice(&self.page[old_child_base..old_child_base + child_ids_len]);
        } else {
            dest[new_child_base..child_loc].copy_from_slice(
                &self.page[old_child_base..old_child_base + insert_child_off],
            );
            dest[child_loc + 8..new_child_base + new_child_len].copy_from_slice(
                &self.page
                    [old_child_base + insert_child_off..old_child_base + child_ids_len],
            );
        }

        let old = std::mem::replace(&mut self.page, dest);
        ctx.spares.add(old);

        self.set_garbage(0);
        self.set_left_seg_tail(dest_loc + encoded_len);
        self.set_right_seg_tail(page_size - 1);
        self.set_search_vec_start(new_svs);
        self.set_search_vec_end(new_sve);

        (dest_loc, child_loc)
    }

    /// Rewrites the separator at `key_pos` with a different key, used when
    /// a rebalance moves the boundary. May compact. Returns false when the
    /// node simply has no room for the larger key.
    pub(crate) fn update_internal_key(
        &mut self,
        ctx: &NodeContext<'_>,
        key_pos: i32,
        new_key: &[u8],
    ) -> Result<bool> {
        let encoded_len = calculate_key_length(new_key);
        let old_loc = self.entry_loc(key_pos);
        let old_len = key_length_at(&self.page, old_loc);

        if encoded_len <= old_len {
            encode_key(&mut self.page, old_loc, new_key, false);
            self.set_garbage(self.garbage() + old_len - encoded_len);
            return Ok(true);
        }

        // Old key becomes garbage; the new one needs a fresh allocation.
        self.set_garbage(self.garbage() + old_len);
        let left_space = self.search_vec_start() - self.left_seg_tail();
        let right_space = self.internal_right_space().max(0) as usize;
        if let Some(entry_loc) = self.alloc_page_entry(encoded_len, left_space, right_space) {
            encode_key(&mut self.page, entry_loc, new_key, false);
            self.set_entry_loc(key_pos, entry_loc);
            return Ok(true);
        }

        if self.garbage() + left_space + right_space < encoded_len {
            // Undo the garbage accounting; the caller aborts.
            self.set_garbage(self.garbage() - old_len);
            return Ok(false);
        }

        let (entry_loc, _) =
            self.compact_internal(ctx, encoded_len, CompactMode::Replace { key_pos });
        encode_key(&mut self.page, entry_loc, new_key, false);
        Ok(true)
    }

    /// Deletes the reference to a right child that merged left, adjusting
    /// bound cursor frames.
    pub(crate) fn delete_right_child_ref(&mut self, child_pos: i32) {
        for frame in &self.frames {
            let pos = frame.pos();
            if pos >= child_pos {
                frame.set_pos(pos - 2);
            }
        }
        self.delete_child_ref(child_pos);
    }

    /// Deletes the reference to a left child that merged right, adjusting
    /// bound cursor frames.
    pub(crate) fn delete_left_child_ref(&mut self, child_pos: i32) {
        for frame in &self.frames {
            let pos = frame.pos();
            if pos > child_pos {
                frame.set_pos(pos - 2);
            }
        }
        self.delete_child_ref(child_pos);
    }

    /// Removes the child id at the 2-based `child_pos` and its adjoining
    /// separator key. Frames are the caller's concern.
    fn delete_child_ref(&mut self, child_pos: i32) {
        let key_pos = if child_pos == 0 { 0 } else { child_pos - 2 };
        let svs = self.search_vec_start();
        let sve = self.search_vec_end();

        let entry_loc = self.entry_loc(key_pos);
        self.set_garbage(self.garbage() + key_length_at(&self.page, entry_loc));

        // 8-based child offset.
        let child_off = (child_pos as usize) << 2;
        let key_off = key_pos as usize;

        if (child_off as i32) < ((3 * (sve as i32 - svs as i32) + key_pos + 8) >> 1) {
            // Shift vector suffix and leading child ids right by 8, vector
            // prefix right by 10.
            let start = svs + key_off + 2;
            let len = sve - svs - key_off + child_off;
            self.page.copy_within(start..start + len, start + 8);
            self.page.copy_within(svs..svs + key_off, svs + 10);
            self.set_search_vec_start(svs + 10);
            self.set_search_vec_end(sve + 8);
        } else {
            // Shift trailing child ids left by 8, vector prefix right by 2.
            let child_ids_len = ((sve - svs + 2) << 2) + 8;
            let start = sve + child_off + 2 + 8;
            let len = child_ids_len - child_off - 8;
            self.page.copy_within(start..start + len, start - 8);
            self.page.copy_within(svs..svs + key_off, svs + 2);
            self.set_search_vec_start(svs + 2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::DenyFragments;
    use crate::node::{test_context, CachedState, TYPE_TN_BIN};
    use crate::storage::SparePagePool;

    fn internal(page_size: usize, first_child: u64) -> NodeState {
        let mut state = NodeState {
            page: vec![0u8; page_size].into_boxed_slice(),
            id: 2,
            cached_state: CachedState::Clean,
            split: None,
            frames: Vec::new(),
        };
        state.set_typ(TYPE_TN_BIN);
        state.clear_entries();
        // An internal node always has one more child than keys; seed the
        // lone child of the empty vector.
        let base = state.search_vec_end() + 2;
        state.page[base..base + 8].copy_from_slice(&first_child.to_le_bytes());
        state
    }

    fn insert_separator(
        state: &mut NodeState,
        ctx: &NodeContext<'_>,
        key: &[u8],
        right_child: u64,
    ) -> bool {
        let pos = state.binary_search(ctx, key).unwrap();
        assert!(pos < 0);
        let key_pos = !pos;
        let child_pos = (key_pos >> 1) + 1;
        match state.create_internal_entry(
            ctx,
            key_pos,
            calculate_key_length(key),
            child_pos << 3,
        ) {
            InternalAlloc::Loc {
                entry_loc,
                child_loc,
            } => {
                encode_key(&mut state.page, entry_loc, key, false);
                state.page[child_loc..child_loc + 8]
                    .copy_from_slice(&right_child.to_le_bytes());
                true
            }
            InternalAlloc::Full => false,
        }
    }

    #[test]
    fn inserts_keep_keys_and_children_aligned() {
        let frag = DenyFragments;
        let spares = SparePagePool::new(1024, 2);
        let ctx = test_context(&frag, &spares);
        let mut state = internal(1024, 100);

        assert!(insert_separator(&mut state, &ctx, b"m", 200));
        assert!(insert_separator(&mut state, &ctx, b"f", 150));
        assert!(insert_separator(&mut state, &ctx, b"t", 300));

        assert_eq!(state.num_keys(), 3);
        assert_eq!(state.retrieve_key(&ctx, 0).unwrap(), b"f");
        assert_eq!(state.retrieve_key(&ctx, 2).unwrap(), b"m");
        assert_eq!(state.retrieve_key(&ctx, 4).unwrap(), b"t");

        assert_eq!(state.retrieve_child_ref_id(0), 100);
        assert_eq!(state.retrieve_child_ref_id(2), 150);
        assert_eq!(state.retrieve_child_ref_id(4), 200);
        assert_eq!(state.retrieve_child_ref_id(6), 300);
        state.verify_header(2).unwrap();
    }

    #[test]
    fn many_inserts_exercise_both_shift_variants() {
        let frag = DenyFragments;
        let spares = SparePagePool::new(4096, 2);
        let ctx = test_context(&frag, &spares);
        let mut state = internal(4096, 1);

        let mut n = 0u64;
        for i in 0..100 {
            let key = format!("sep{:03}", i * 7 % 100);
            if state.binary_search(&ctx, key.as_bytes()).unwrap() >= 0 {
                continue;
            }
            n += 1;
            if !insert_separator(&mut state, &ctx, key.as_bytes(), 1000 + n) {
                break;
            }
        }
        assert!(n >= 50);
        state.verify_header(2).unwrap();

        // Keys ascend and children stay distinct.
        for pos in (2..=state.highest_key_pos()).step_by(2) {
            let prev = state.retrieve_key(&ctx, pos - 2).unwrap();
            let this = state.retrieve_key(&ctx, pos).unwrap();
            assert!(prev < this);
        }
        let mut ids = std::collections::HashSet::new();
        for child_pos in (0..=state.highest_pos()).step_by(2) {
            assert!(ids.insert(state.retrieve_child_ref_id(child_pos)));
        }
    }

    #[test]
    fn delete_right_child_ref_drops_key_and_child() {
        let frag = DenyFragments;
        let spares = SparePagePool::new(1024, 2);
        let ctx = test_context(&frag, &spares);
        let mut state = internal(1024, 100);
        insert_separator(&mut state, &ctx, b"f", 150);
        insert_separator(&mut state, &ctx, b"m", 200);

        // Child at position 2 (id 150) merged left; drop it with key "f".
        state.delete_right_child_ref(2);

        assert_eq!(state.num_keys(), 1);
        assert_eq!(state.retrieve_key(&ctx, 0).unwrap(), b"m");
        assert_eq!(state.retrieve_child_ref_id(0), 100);
        assert_eq!(state.retrieve_child_ref_id(2), 200);
        state.verify_header(2).unwrap();
    }

    #[test]
    fn delete_left_child_ref_keeps_right_sibling() {
        let frag = DenyFragments;
        let spares = SparePagePool::new(1024, 2);
        let ctx = test_context(&frag, &spares);
        let mut state = internal(1024, 100);
        insert_separator(&mut state, &ctx, b"f", 150);
        insert_separator(&mut state, &ctx, b"m", 200);

        // Child at position 0 (id 100) merged right into 150.
        state.delete_left_child_ref(0);

        assert_eq!(state.num_keys(), 1);
        assert_eq!(state.retrieve_key(&ctx, 0).unwrap(), b"m");
        assert_eq!(state.retrieve_child_ref_id(0), 150);
        assert_eq!(state.retrieve_child_ref_id(2), 200);
    }

    #[test]
    fn update_internal_key_in_place_and_grown() {
        let frag = DenyFragments;
        let spares = SparePagePool::new(1024, 2);
        let ctx = test_context(&frag, &spares);
        let mut state = internal(1024, 100);
        insert_separator(&mut state, &ctx, b"middle", 200);

        // Same-size replacement.
        assert!(state.update_internal_key(&ctx, 0, b"mizzle").unwrap());
        assert_eq!(state.retrieve_key(&ctx, 0).unwrap(), b"mizzle");

        // Larger replacement forces reallocation.
        assert!(state
            .update_internal_key(&ctx, 0, b"much-longer-separator")
            .unwrap());
        assert_eq!(
            state.retrieve_key(&ctx, 0).unwrap(),
            b"much-longer-separator"
        );
        assert_eq!(state.retrieve_child_ref_id(0), 100);
        assert_eq!(state.retrieve_child_ref_id(2), 200);
        state.verify_header(2).unwrap();
    }
}
