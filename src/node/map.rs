//! Node map: the process-wide registry of currently loaded nodes, from
//! page id to arena slot. Partitioned into latched shards so lookups do
//! not contend on a single latch the way the raw page cache does.
//!
//! The map enforces the one-live-node-per-id invariant: an insert for an
//! id that is already present is refused, and the caller adopts the
//! existing node instead.

use hashbrown::HashMap;

use crate::config::NODE_MAP_SHARD_COUNT;
use crate::storage::scramble;
use crate::sync::Latched;

pub(crate) struct NodeMap {
    shards: Vec<Latched<HashMap<u64, u32>>>,
}

impl NodeMap {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..NODE_MAP_SHARD_COUNT)
                .map(|_| Latched::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, id: u64) -> &Latched<HashMap<u64, u32>> {
        &self.shards[(scramble(id) as usize) & (NODE_MAP_SHARD_COUNT - 1)]
    }

    pub(crate) fn get(&self, id: u64) -> Option<u32> {
        self.shard(id).read().get(&id).copied()
    }

    /// Registers `slot` for `id`. If the id is already mapped, nothing is
    /// inserted and the existing slot is returned as the error.
    pub(crate) fn insert(&self, id: u64, slot: u32) -> Result<(), u32> {
        let mut guard = self.shard(id).write();
        match guard.try_insert(id, slot) {
            Ok(_) => Ok(()),
            Err(occupied) => Err(*occupied.entry.get()),
        }
    }

    /// Removes the mapping, but only if it still points at `slot`.
    pub(crate) fn remove(&self, id: u64, slot: u32) {
        let mut guard = self.shard(id).write();
        if guard.get(&id) == Some(&slot) {
            guard.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let map = NodeMap::new();
        assert_eq!(map.get(42), None);
        map.insert(42, 7).unwrap();
        assert_eq!(map.get(42), Some(7));
        map.remove(42, 7);
        assert_eq!(map.get(42), None);
    }

    #[test]
    fn duplicate_insert_reports_existing() {
        let map = NodeMap::new();
        map.insert(42, 7).unwrap();
        assert_eq!(map.insert(42, 9), Err(7));
        assert_eq!(map.get(42), Some(7));
    }

    #[test]
    fn remove_checks_slot_identity() {
        let map = NodeMap::new();
        map.insert(42, 7).unwrap();
        map.remove(42, 9); // stale remove from another slot
        assert_eq!(map.get(42), Some(7));
    }

    #[test]
    fn ids_spread_over_shards() {
        let map = NodeMap::new();
        for id in 0..1000 {
            map.insert(id, id as u32).unwrap();
        }
        for id in 0..1000 {
            assert_eq!(map.get(id), Some(id as u32));
        }
    }
}
