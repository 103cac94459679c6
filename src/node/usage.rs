//! Node arena and usage list.
//!
//! All nodes are allocated up front in a fixed slab sized from the cache
//! budget; "allocating" a node means evicting the least-recently-used
//! eligible one. The usage list is a doubly-linked LRU over arena slot
//! indices — the links live in the list's own arrays, guarded by the
//! list's latch, so relinking never touches a node's latch.
//!
//! Eviction walks from the least-recent end and skips nodes that have
//! bound cursor frames, are mid-split, or whose latch cannot be acquired
//! without waiting. A dirty evictee is written through the page array and
//! becomes clean; a clean evictee's bytes are offered to the raw page
//! cache and the optional secondary cache. The node map entry and the
//! node's id are cleared before the slot is reused.

use eyre::{bail, Result};

use super::map::NodeMap;
use super::{Node, NodeState};
use crate::storage::{PageArray, PageCache, SecondaryPageCache};
use crate::sync::{ExclusiveGuard, Latched};

const NIL: i32 = -1;

/// Everything eviction needs to spill a node.
pub(crate) struct EvictContext<'a> {
    pub page_array: &'a dyn PageArray,
    pub page_cache: &'a PageCache,
    pub secondary: Option<&'a dyn SecondaryPageCache>,
}

struct UsageState {
    more_used: Box<[i32]>,
    less_used: Box<[i32]>,
    most: i32,
    least: i32,
    /// Whether the slot is linked into the LRU (unevictable nodes are
    /// unlinked).
    linked: Box<[bool]>,
}

impl UsageState {
    fn unlink(&mut self, slot: u32) {
        let i = slot as usize;
        if !self.linked[i] {
            return;
        }
        let less = self.less_used[i];
        let more = self.more_used[i];
        if less >= 0 {
            self.more_used[less as usize] = more;
        } else {
            self.least = more;
        }
        if more >= 0 {
            self.less_used[more as usize] = less;
        } else {
            self.most = less;
        }
        self.less_used[i] = NIL;
        self.more_used[i] = NIL;
        self.linked[i] = false;
    }

    fn link_most(&mut self, slot: u32) {
        let i = slot as usize;
        debug_assert!(!self.linked[i]);
        self.less_used[i] = self.most;
        self.more_used[i] = NIL;
        if self.most >= 0 {
            self.more_used[self.most as usize] = slot as i32;
        } else {
            self.least = slot as i32;
        }
        self.most = slot as i32;
        self.linked[i] = true;
    }

    fn link_least(&mut self, slot: u32) {
        let i = slot as usize;
        debug_assert!(!self.linked[i]);
        self.more_used[i] = self.least;
        self.less_used[i] = NIL;
        if self.least >= 0 {
            self.less_used[self.least as usize] = slot as i32;
        } else {
            self.most = slot as i32;
        }
        self.least = slot as i32;
        self.linked[i] = true;
    }
}

pub(crate) struct NodeArena {
    nodes: Box<[Node]>,
    usage: Latched<UsageState>,
    pub(crate) map: NodeMap,
}

impl NodeArena {
    pub(crate) fn new(capacity: usize, page_size: usize) -> Self {
        let capacity = capacity.max(8);
        let nodes: Box<[Node]> = (0..capacity as u32)
            .map(|slot| Node::new(slot, page_size))
            .collect();

        let mut more_used = vec![NIL; capacity].into_boxed_slice();
        let mut less_used = vec![NIL; capacity].into_boxed_slice();
        for i in 0..capacity {
            less_used[i] = i as i32 - 1;
            more_used[i] = if i + 1 < capacity { i as i32 + 1 } else { NIL };
        }

        Self {
            nodes,
            usage: Latched::new(UsageState {
                more_used,
                less_used,
                most: capacity as i32 - 1,
                least: 0,
                linked: vec![true; capacity].into_boxed_slice(),
            }),
            map: NodeMap::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub(crate) fn node(&self, slot: u32) -> &Node {
        &self.nodes[slot as usize]
    }

    /// Marks the node most recently used. Caller holds any latch on it.
    pub(crate) fn used(&self, slot: u32) {
        let mut usage = self.usage.write();
        if usage.linked[slot as usize] && usage.most != slot as i32 {
            usage.unlink(slot);
            usage.link_most(slot);
        }
    }

    /// Marks the node least recently used so its slot recycles first.
    pub(crate) fn unused(&self, slot: u32) {
        let mut usage = self.usage.write();
        if usage.linked[slot as usize] && usage.least != slot as i32 {
            usage.unlink(slot);
            usage.link_least(slot);
        }
    }

    /// Pins the node out of the eviction list (roots, mid-split nodes).
    pub(crate) fn make_unevictable(&self, slot: u32) {
        let mut usage = self.usage.write();
        usage.unlink(slot);
    }

    /// Returns a pinned node to the eviction list as most recently used.
    pub(crate) fn make_evictable(&self, slot: u32) {
        let mut usage = self.usage.write();
        if !usage.linked[slot as usize] {
            usage.link_most(slot);
        }
    }

    /// Allocates a node by evicting the least-recently-used eligible one,
    /// returning it exclusively latched with id 0. The slot is moved to
    /// the most-recent end.
    pub(crate) fn alloc_latched(
        &self,
        evict: &EvictContext<'_>,
    ) -> Result<(u32, ExclusiveGuard<'_, NodeState>)> {
        // Snapshot the walk order; trying latches while holding the usage
        // latch would invert the usual ordering.
        let order: Vec<u32> = {
            let usage = self.usage.read();
            let mut order = Vec::with_capacity(self.nodes.len());
            let mut at = usage.least;
            while at >= 0 {
                order.push(at as u32);
                at = usage.more_used[at as usize];
            }
            order
        };

        for slot in order {
            let node = self.node(slot);
            let Some(mut guard) = node.state.try_write() else {
                continue;
            };
            if guard.split.is_some() || guard.has_bound_frames() {
                continue;
            }
            self.evict_into_free(slot, &mut guard, evict)?;
            self.used(slot);
            return Ok((slot, guard));
        }

        bail!(
            "node cache exhausted: all {} nodes are latched or pinned",
            self.nodes.len(),
        )
    }

    /// Spills the node's current page (if any) and leaves the slot free.
    fn evict_into_free(
        &self,
        slot: u32,
        guard: &mut ExclusiveGuard<'_, NodeState>,
        evict: &EvictContext<'_>,
    ) -> Result<()> {
        let id = guard.id;
        if id == 0 {
            return Ok(());
        }
        if guard.cached_state.is_dirty() {
            evict.page_array.write_page(id, &guard.page, 0)?;
            guard.cached_state = super::CachedState::Clean;
        } else {
            evict.page_cache.add(id, &guard.page);
            if let Some(secondary) = evict.secondary {
                secondary.cache_page(id, &guard.page);
            }
        }
        self.map.remove(id, slot);
        guard.id = 0;
        Ok(())
    }

    /// Writes every node dirty in `state` through the page array, leaving
    /// it clean. Used by checkpoint (old generation) and close (both).
    pub(crate) fn flush_dirty(
        &self,
        states: &[super::CachedState],
        page_array: &dyn PageArray,
    ) -> Result<usize> {
        let mut flushed = 0;
        for node in self.nodes.iter() {
            let mut guard = node.state.write();
            if guard.id != 0 && states.contains(&guard.cached_state) {
                page_array.write_page(guard.id, &guard.page, 0)?;
                guard.cached_state = super::CachedState::Clean;
                flushed += 1;
            }
        }
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CachedState;
    use crate::storage::{FilePageArray, PageCache};
    use tempfile::tempdir;

    fn fixture(capacity: usize) -> (tempfile::TempDir, FilePageArray, PageCache, NodeArena) {
        let dir = tempdir().unwrap();
        let array = FilePageArray::open(&dir.path().join("p.db"), 512, 64).unwrap();
        let cache = PageCache::new(8 * (24 + 512), 512, 0);
        let arena = NodeArena::new(capacity, 512);
        (dir, array, cache, arena)
    }

    #[test]
    fn alloc_cycles_through_free_slots() {
        let (_dir, array, cache, arena) = fixture(8);
        let evict = EvictContext {
            page_array: &array,
            page_cache: &cache,
            secondary: None,
        };

        let mut seen = std::collections::HashSet::new();
        for _ in 0..8 {
            let (slot, guard) = arena.alloc_latched(&evict).unwrap();
            assert!(seen.insert(slot));
            drop(guard);
        }
    }

    #[test]
    fn dirty_eviction_writes_through() {
        let (_dir, array, cache, arena) = fixture(8);
        let evict = EvictContext {
            page_array: &array,
            page_cache: &cache,
            secondary: None,
        };

        let (slot, mut guard) = arena.alloc_latched(&evict).unwrap();
        guard.id = 3;
        guard.cached_state = CachedState::Dirty0;
        guard.page[0] = 0xEE;
        arena.map.insert(3, slot).unwrap();
        drop(guard);
        arena.unused(slot);

        // Drain every slot; slot 3's node must be written out.
        let mut guards = Vec::new();
        for _ in 0..8 {
            guards.push(arena.alloc_latched(&evict).unwrap());
        }
        assert_eq!(arena.map.get(3), None);

        let mut out = vec![0u8; 512];
        array.read_page(3, &mut out, 0, 512).unwrap();
        assert_eq!(out[0], 0xEE);
    }

    #[test]
    fn clean_eviction_offers_to_page_cache() {
        let (_dir, array, cache, arena) = fixture(8);
        let evict = EvictContext {
            page_array: &array,
            page_cache: &cache,
            secondary: None,
        };

        let (slot, mut guard) = arena.alloc_latched(&evict).unwrap();
        guard.id = 5;
        guard.page[0] = 0xAA;
        arena.map.insert(5, slot).unwrap();
        drop(guard);
        arena.unused(slot);

        let mut guards = Vec::new();
        for _ in 0..8 {
            guards.push(arena.alloc_latched(&evict).unwrap());
        }

        let mut out = vec![0u8; 512];
        assert!(cache.remove(5, &mut out));
        assert_eq!(out[0], 0xAA);
    }

    #[test]
    fn unevictable_nodes_are_skipped() {
        let (_dir, array, cache, arena) = fixture(8);
        let evict = EvictContext {
            page_array: &array,
            page_cache: &cache,
            secondary: None,
        };

        for slot in 0..7u32 {
            arena.make_unevictable(slot);
        }
        let (slot, guard) = arena.alloc_latched(&evict).unwrap();
        assert_eq!(slot, 7);
        drop(guard);

        arena.make_unevictable(7);
        assert!(arena.alloc_latched(&evict).is_err());

        arena.make_evictable(3);
        let (slot, _guard) = arena.alloc_latched(&evict).unwrap();
        assert_eq!(slot, 3);
    }

    #[test]
    fn latched_nodes_are_skipped() {
        let (_dir, array, cache, arena) = fixture(8);
        let evict = EvictContext {
            page_array: &array,
            page_cache: &cache,
            secondary: None,
        };

        // Hold slot 0 (the least recently used) latched; allocation must
        // come from another slot.
        let held = arena.node(0).state.write();
        let (slot, _guard) = arena.alloc_latched(&evict).unwrap();
        assert_ne!(slot, 0);
        drop(held);
    }

    #[test]
    fn used_reorders_lru() {
        let (_dir, array, cache, arena) = fixture(4);
        let evict = EvictContext {
            page_array: &array,
            page_cache: &cache,
            secondary: None,
        };

        // Touch slot 0 so it becomes most recently used; the next
        // allocation must pick slot 1 instead.
        arena.used(0);
        let (slot, _guard) = arena.alloc_latched(&evict).unwrap();
        assert_eq!(slot, 1);
    }
}
