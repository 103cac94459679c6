//! Leaf-node algorithms: search, retrieval, entry creation with the
//! allocation ladder, update, deletion, ghosting, and compaction.
//!
//! Positions are 2-based byte offsets into the search vector. A search
//! returns the complement (`!pos`) of the insertion position when the key
//! is absent, mirroring the convention used throughout the tree layer.
//!
//! ## Allocation ladder
//!
//! Creating an entry tries, in order:
//!
//! 1. Shift the nearer end of the search vector by two bytes and allocate
//!    the entry from whichever segment has room.
//! 2. Re-center the search vector (biased so it ends on an even address)
//!    and allocate from the segment left behind.
//! 3. Full compaction into a spare page, when reclaimable garbage covers
//!    the deficit.
//! 4. Report `Full`; the tree layer then attempts sibling rebalance and
//!    finally splits.

use eyre::{bail, Result};

use super::encoding::{
    calculate_key_length, calculate_value_length, decode_key_at, decode_value_at, encode_key,
    encode_value, entry_length_at, key_length_at, ValueShape,
};
use super::{NodeContext, NodeState, GHOST, TN_HEADER_SIZE};

/// Result of asking a node for entry space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafAlloc {
    /// Entry location, already pointed to by the search vector slot.
    Loc(usize),
    /// No room even after compaction; rebalance or split.
    Full,
}

/// A key/value pair fully encoded-ready: the key may have been replaced by
/// a fragment placeholder, likewise the value.
pub(crate) struct PreparedEntry {
    pub akey: Vec<u8>,
    pub key_fragmented: bool,
    pub value: Vec<u8>,
    pub value_fragmented: bool,
    pub encoded_len: usize,
}

impl PreparedEntry {
    /// Applies the per-tree ceilings, fragmenting the key and value
    /// through the external service as needed.
    pub(crate) fn new(ctx: &NodeContext<'_>, okey: &[u8], value: &[u8]) -> Result<Self> {
        let (akey, key_fragmented) = if okey.len() > ctx.max_key_size {
            (ctx.frag.fragment_key(okey)?, true)
        } else {
            (okey.to_vec(), false)
        };
        let key_len = if key_fragmented {
            2 + akey.len()
        } else {
            calculate_key_length(&akey)
        };

        let mut value_fragmented = false;
        let mut stored = value.to_vec();
        let mut encoded_len = key_len + calculate_value_length(stored.len(), false);
        if encoded_len > ctx.max_entry_size {
            stored = ctx
                .frag
                .fragment_value(value, ctx.max_entry_size - key_len)?;
            value_fragmented = true;
            encoded_len = key_len + calculate_value_length(stored.len(), true);
            if encoded_len > ctx.max_entry_size {
                // Undo the fragmentation before surfacing the failure.
                ctx.frag.delete_fragments(&stored)?;
                bail!(
                    "entry too large even fragmented: {} > {}",
                    encoded_len,
                    ctx.max_entry_size,
                );
            }
        }

        Ok(Self {
            akey,
            key_fragmented,
            value: stored,
            value_fragmented,
            encoded_len,
        })
    }
}

impl NodeState {
    /// Binary search over the search vector with prefix-match carry: each
    /// comparison skips the bytes already known equal from the current low
    /// and high probes.
    ///
    /// Returns the 2-based position when found, or the complement of the
    /// 2-based insertion position when not.
    pub(crate) fn binary_search(&self, ctx: &NodeContext<'_>, key: &[u8]) -> Result<i32> {
        let page = &self.page;
        let mut low_pos = self.search_vec_start() as i32;
        let mut high_pos = self.search_vec_end() as i32;

        let mut low_match = 0usize;
        let mut high_match = 0usize;

        let mut fragmented_buf: Vec<u8>;

        while low_pos <= high_pos {
            let mid_pos = ((low_pos + high_pos) >> 1) & !1;

            let loc = self.entry_loc(mid_pos - self.search_vec_start() as i32);
            let entry_key = decode_key_at(page, loc);
            let compare: &[u8] = if entry_key.fragmented {
                fragmented_buf =
                    ctx.frag
                        .reconstruct_key(page, entry_key.data_loc, entry_key.len)?;
                &fragmented_buf
            } else {
                &page[entry_key.data_loc..entry_key.data_loc + entry_key.len]
            };

            let min_len = compare.len().min(key.len());
            let mut i = low_match.min(high_match);
            let mut decided = false;
            while i < min_len {
                let cb = compare[i];
                let kb = key[i];
                if cb != kb {
                    if cb < kb {
                        low_pos = mid_pos + 2;
                        low_match = i;
                    } else {
                        high_pos = mid_pos - 2;
                        high_match = i;
                    }
                    decided = true;
                    break;
                }
                i += 1;
            }
            if decided {
                continue;
            }

            if compare.len() < key.len() {
                low_pos = mid_pos + 2;
                low_match = i;
            } else if compare.len() > key.len() {
                high_pos = mid_pos - 2;
                high_match = i;
            } else {
                return Ok(mid_pos - self.search_vec_start() as i32);
            }
        }

        Ok(!(low_pos - self.search_vec_start() as i32))
    }

    /// Materializes the key at a 2-based position.
    pub(crate) fn retrieve_key(&self, ctx: &NodeContext<'_>, pos: i32) -> Result<Vec<u8>> {
        let loc = self.entry_loc(pos);
        let key = decode_key_at(&self.page, loc);
        if key.fragmented {
            ctx.frag.reconstruct_key(&self.page, key.data_loc, key.len)
        } else {
            Ok(self.page[key.data_loc..key.data_loc + key.len].to_vec())
        }
    }

    /// Materializes the value at a 2-based leaf position; `None` for a
    /// ghost.
    pub(crate) fn retrieve_leaf_value(
        &self,
        ctx: &NodeContext<'_>,
        pos: i32,
    ) -> Result<Option<Vec<u8>>> {
        let loc = self.entry_loc(pos);
        let value_loc = loc + key_length_at(&self.page, loc);
        match decode_value_at(&self.page, value_loc) {
            ValueShape::Ghost => Ok(None),
            ValueShape::Inline {
                data_loc,
                len,
                fragmented,
            } => {
                if fragmented {
                    Ok(Some(ctx.frag.reconstruct(&self.page, data_loc, len)?))
                } else {
                    Ok(Some(self.page[data_loc..data_loc + len].to_vec()))
                }
            }
        }
    }

    /// True when the position holds a live (non-ghost) value.
    pub(crate) fn has_leaf_value(&self, pos: i32) -> bool {
        let loc = self.entry_loc(pos);
        let value_loc = loc + key_length_at(&self.page, loc);
        decode_value_at(&self.page, value_loc) != ValueShape::Ghost
    }

    /// Shape of the value at a 2-based leaf position.
    pub(crate) fn leaf_value_shape(&self, pos: i32) -> ValueShape {
        let loc = self.entry_loc(pos);
        let value_loc = loc + key_length_at(&self.page, loc);
        decode_value_at(&self.page, value_loc)
    }

    /// Raw encoded bytes of the entry, for the undo log.
    pub(crate) fn copy_leaf_entry_bytes(&self, pos: i32) -> Vec<u8> {
        let loc = self.entry_loc(pos);
        let len = entry_length_at(&self.page, loc);
        self.page[loc..loc + len].to_vec()
    }

    /// Writes a prepared entry into an allocated location.
    pub(crate) fn copy_to_leaf_entry(&mut self, entry: &PreparedEntry, loc: usize) {
        let value_loc = encode_key(&mut self.page, loc, &entry.akey, entry.key_fragmented);
        encode_value(&mut self.page, value_loc, &entry.value, entry.value_fragmented);
    }

    /// Allocates space for an entry of `encoded_len` at the 2-based
    /// insertion position `pos`, writing the search vector slot on
    /// success. The entry bytes themselves are the caller's to fill.
    pub(crate) fn create_leaf_entry(
        &mut self,
        ctx: &NodeContext<'_>,
        pos: i32,
        encoded_len: usize,
    ) -> LeafAlloc {
        let svs = self.search_vec_start() as i32;
        let sve = self.search_vec_end() as i32;

        let mut left_space = svs - self.left_seg_tail() as i32;
        let mut right_space = self.right_seg_tail() as i32 - sve - 1;

        // Fast path: shift the nearer end of the vector by one slot.
        if pos < ((sve - svs + 2) >> 1) {
            if left_space >= 2 {
                if let Some(entry_loc) =
                    self.alloc_page_entry(encoded_len, (left_space - 2) as usize, right_space.max(0) as usize)
                {
                    let new_svs = (svs - 2) as usize;
                    self.page
                        .copy_within(svs as usize..(svs + pos) as usize, new_svs);
                    self.set_search_vec_start(new_svs);
                    self.set_entry_loc(pos, entry_loc);
                    return LeafAlloc::Loc(entry_loc);
                }
            }
        } else if right_space >= 2 {
            if let Some(entry_loc) =
                self.alloc_page_entry(encoded_len, left_space.max(0) as usize, (right_space - 2) as usize)
            {
                let abs = (svs + pos) as usize;
                self.page.copy_within(abs..(sve + 2) as usize, abs + 2);
                self.set_search_vec_end((sve + 2) as usize);
                self.set_entry_loc(pos, entry_loc);
                return LeafAlloc::Loc(entry_loc);
            }
        }

        left_space = left_space.max(0);
        right_space = right_space.max(0);

        // Space remaining around the vector once the entry and its slot
        // are accounted for.
        let remaining = left_space + right_space - encoded_len as i32 - 2;

        if (self.garbage() as i32) > remaining {
            if (self.garbage() as i32) + remaining < 0 {
                // Compaction cannot make room; rebalance or split.
                return LeafAlloc::Full;
            }
            return LeafAlloc::Loc(self.compact_leaf(ctx, encoded_len, pos, true));
        }

        let vec_len = (sve - svs + 2) as i32;
        let new_svs;
        let entry_loc;
        if remaining > 0 || (self.right_seg_tail() & 1) != 0 {
            // Re-center biased right, keeping even alignment, and allocate
            // from the left segment.
            new_svs =
                (self.right_seg_tail() as i32 - vec_len + (1 - 2) - (remaining >> 1)) & !1;
            entry_loc = self.left_seg_tail();
            self.set_left_seg_tail(entry_loc + encoded_len);
        } else if (self.left_seg_tail() & 1) == 0 {
            // Re-center biased left and allocate from the right segment.
            new_svs = self.left_seg_tail() as i32 + ((remaining >> 1) & !1);
            entry_loc = self.right_seg_tail() + 1 - encoded_len;
            self.set_right_seg_tail(entry_loc - 1);
        } else {
            // Neither bias aligns the vector; fall back to compaction.
            return LeafAlloc::Loc(self.compact_leaf(ctx, encoded_len, pos, true));
        }

        self.move_search_vector_with_gap(svs as usize, new_svs as usize, pos as usize, vec_len as usize);
        self.set_search_vec_start(new_svs as usize);
        self.set_search_vec_end((new_svs + vec_len) as usize);
        self.set_entry_loc(pos, entry_loc);
        LeafAlloc::Loc(entry_loc)
    }

    /// Allocates `encoded_len` bytes from whichever segment fits, favoring
    /// the larger one. Returns the entry location, or `None` if neither
    /// fits.
    pub(crate) fn alloc_page_entry(
        &mut self,
        encoded_len: usize,
        left_space: usize,
        right_space: usize,
    ) -> Option<usize> {
        if encoded_len <= left_space && left_space >= right_space {
            let entry_loc = self.left_seg_tail();
            self.set_left_seg_tail(entry_loc + encoded_len);
            Some(entry_loc)
        } else if encoded_len <= right_space {
            let entry_loc = self.right_seg_tail() + 1 - encoded_len;
            self.set_right_seg_tail(entry_loc - 1);
            Some(entry_loc)
        } else {
            None
        }
    }

    /// Moves the search vector to `new_svs`, opening a 2-byte gap at
    /// byte-offset `pos`. Copy order respects overlap direction.
    pub(crate) fn move_search_vector_with_gap(
        &mut self,
        svs: usize,
        new_svs: usize,
        pos: usize,
        vec_len: usize,
    ) {
        if new_svs <= svs {
            self.page.copy_within(svs..svs + pos, new_svs);
            self.page
                .copy_within(svs + pos..svs + vec_len, new_svs + pos + 2);
        } else {
            self.page
                .copy_within(svs + pos..svs + vec_len, new_svs + pos + 2);
            self.page.copy_within(svs..svs + pos, new_svs);
        }
    }

    /// Compacts by copying surviving entries into a spare page in vector
    /// order, allocating room for a pending entry of `encoded_len` whose
    /// vector slot lands at `pos`. Returns the pending entry's location.
    pub(crate) fn compact_leaf(
        &mut self,
        ctx: &NodeContext<'_>,
        encoded_len: usize,
        pos: i32,
        for_insert: bool,
    ) -> usize {
        let page_size = self.page_size();
        let mut search_vec_loc = self.search_vec_start();
        let mut new_vec_size = self.search_vec_end() + 2 - search_vec_loc;
        if for_insert {
            new_vec_size += 2;
        }
        let abs_pos = pos as usize + search_vec_loc;

        // Place the vector so free space stays balanced after the copy.
        let vec_capacity =
            self.garbage() + self.right_seg_tail() + 1 - self.left_seg_tail() - encoded_len;
        let new_vec_start = page_size - (((vec_capacity + new_vec_size) >> 1) & !1);

        let mut dest = ctx.spares.remove();
        dest[0] = self.typ();
        dest[1] = 0;

        let mut dest_loc = TN_HEADER_SIZE;
        let mut new_vec_loc = new_vec_start;
        let mut pending_vec_loc = None;
        let search_vec_end = self.search_vec_end();

        while search_vec_loc <= search_vec_end {
            if search_vec_loc == abs_pos {
                pending_vec_loc = Some(new_vec_loc);
                if for_insert {
                    new_vec_loc += 2;
                } else {
                    // Update in place: the old entry is dropped.
                    search_vec_loc += 2;
                    continue;
                }
            }
            let source_loc = u16::from_le_bytes([
                self.page[search_vec_loc],
                self.page[search_vec_loc + 1],
            ]) as usize;
            let len = entry_length_at(&self.page, source_loc);
            dest[new_vec_loc..new_vec_loc + 2].copy_from_slice(&(dest_loc as u16).to_le_bytes());
            dest[dest_loc..dest_loc + len].copy_from_slice(&self.page[source_loc..source_loc + len]);
            dest_loc += len;
            search_vec_loc += 2;
            new_vec_loc += 2;
        }

        // Point the pending slot at the allocation that follows the
        // survivors.
        let pending = pending_vec_loc.unwrap_or(new_vec_loc);
        dest[pending..pending + 2].copy_from_slice(&(dest_loc as u16).to_le_bytes());

        let old = std::mem::replace(&mut self.page, dest);
        ctx.spares.add(old);

        self.set_garbage(0);
        self.set_left_seg_tail(dest_loc + encoded_len);
        self.set_right_seg_tail(page_size - 1);
        self.set_search_vec_start(new_vec_start);
        self.set_search_vec_end(new_vec_start + new_vec_size - 2);

        dest_loc
    }

    /// Physically deletes the entry, freeing fragmented content and
    /// shifting the shorter side of the search vector inward.
    pub(crate) fn delete_leaf_entry(&mut self, ctx: &NodeContext<'_>, pos: i32) -> Result<()> {
        let entry_loc = self.entry_loc(pos);
        let key = decode_key_at(&self.page, entry_loc);
        if key.fragmented {
            ctx.frag
                .delete_fragments(&self.page[key.data_loc..key.data_loc + key.len])?;
        }
        let value_loc = key.data_loc + key.len;
        let shape = decode_value_at(&self.page, value_loc);
        if let ValueShape::Inline {
            data_loc,
            len,
            fragmented: true,
        } = shape
        {
            ctx.frag
                .delete_fragments(&self.page[data_loc..data_loc + len])?;
        }
        let entry_len = (value_loc - entry_loc) + shape.encoded_len(value_loc);
        self.finish_delete_leaf_entry(pos, entry_len);
        Ok(())
    }

    /// Physically deletes the entry without touching fragmented content:
    /// used when the fragments were already handed to the trash index, or
    /// when the encoded entry was copied out for an undo record that may
    /// restore it.
    pub(crate) fn delete_leaf_entry_keep_fragments(&mut self, pos: i32) -> Result<()> {
        let entry_loc = self.entry_loc(pos);
        let entry_len = entry_length_at(&self.page, entry_loc);
        self.finish_delete_leaf_entry(pos, entry_len);
        Ok(())
    }

    /// Accounts the entry as garbage and closes its vector slot.
    pub(crate) fn finish_delete_leaf_entry(&mut self, pos: i32, entry_len: usize) {
        self.set_garbage(self.garbage() + entry_len);

        let svs = self.search_vec_start();
        let sve = self.search_vec_end();
        if pos < ((sve as i32 - svs as i32 + 2) >> 1) {
            // Shift the left side right.
            self.page.copy_within(svs..svs + pos as usize, svs + 2);
            self.set_search_vec_start(svs + 2);
        } else {
            // Shift the right side left.
            let abs = svs + pos as usize;
            self.page.copy_within(abs + 2..sve + 2, abs);
            self.set_search_vec_end(sve - 2);
        }
    }

    /// Transactional delete: replaces the value with a ghost. The slot
    /// persists until the owning transaction commits and reaps it.
    pub(crate) fn ghost_leaf_value(&mut self, pos: i32) {
        let entry_loc = self.entry_loc(pos);
        let value_loc = entry_loc + key_length_at(&self.page, entry_loc);
        let old_len = decode_value_at(&self.page, value_loc).encoded_len(value_loc);
        self.page[value_loc] = GHOST;
        self.set_garbage(self.garbage() + old_len - 1);
    }

    /// Updates the value in place when the replacement encodes to exactly
    /// the old size. Returns false when the caller must delete and
    /// reinsert instead.
    pub(crate) fn try_quick_update_leaf_value(&mut self, pos: i32, value: &[u8]) -> bool {
        let entry_loc = self.entry_loc(pos);
        let value_loc = entry_loc + key_length_at(&self.page, entry_loc);
        let shape = decode_value_at(&self.page, value_loc);
        if let ValueShape::Inline {
            fragmented: true, ..
        } = shape
        {
            // Fragmented values route through the trash index first.
            return false;
        }
        let old_len = shape.encoded_len(value_loc);
        if calculate_value_length(value.len(), false) != old_len {
            return false;
        }
        encode_value(&mut self.page, value_loc, value, false);
        true
    }

    /// Restores a full encoded entry (key and value bytes) at the 2-based
    /// insertion position, used by undo rollback.
    pub(crate) fn restore_leaf_entry(
        &mut self,
        ctx: &NodeContext<'_>,
        pos: i32,
        entry_bytes: &[u8],
    ) -> Result<()> {
        match self.create_leaf_entry(ctx, pos, entry_bytes.len()) {
            LeafAlloc::Loc(loc) => {
                self.page[loc..loc + entry_bytes.len()].copy_from_slice(entry_bytes);
                Ok(())
            }
            LeafAlloc::Full => bail!("no room to restore entry during rollback"),
        }
    }
}
