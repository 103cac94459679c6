//! # Database
//!
//! The composition root: owns the page array, caches, node arena, lock
//! manager, redo log, and the registry of named trees, and wires them
//! into the transaction machinery.
//!
//! ## File layout
//!
//! A database named `data` occupies two files:
//!
//! ```text
//! data            the paged file: header page 0, stub page 1, tree pages
//! data.redo.N     the current redo log; N advances at each checkpoint
//! ```
//!
//! Page 0 carries a 128-byte header with the allocation high-water mark,
//! the registry root, and the current redo number. Named trees live in a
//! registry tree (id 1) mapping name to (tree id, root page id); tree
//! root pages are allocated once and never move, so registry entries are
//! immutable after creation.
//!
//! ## Checkpoint
//!
//! Checkpoint briefly takes the commit lock exclusively to flip the
//! dirty generation and switch to a fresh redo file, then — with mutators
//! running again — flushes the old generation's dirty nodes, syncs the
//! page array, persists the header, and deletes the old redo file. Crash
//! recovery replays the surviving redo files' committed transactions.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, ensure, Context, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{DurabilityMode, Options, FIRST_ALLOCATABLE_ID, SPARE_PAGE_COUNT};
use crate::error::DatabaseFull;
use crate::fragment::{DenyFragments, FragmentStore};
use crate::lock::LockManager;
use crate::node::{
    decode_key_at, CachedState, EvictContext, NodeArena, NodeContext, NodeState,
};
use crate::redo::{RedoDecoder, RedoLog, RedoRecord};
use crate::storage::{
    scramble, FilePageArray, PageArray, PageCache, SecondaryPageCache, SparePagePool,
};
use crate::sync::{CommitLock, ExclusiveGuard, Latched};
use crate::tree::{replay_write, Tree, TreeInner};
use crate::txn::{Transaction, UndoPageStore};

const DB_MAGIC: &[u8; 16] = b"BurlDB format 1\x00";
const DB_VERSION: u32 = 1;
const HEADER_SIZE: usize = 128;

/// Reserved tree id for the name registry.
const REGISTRY_TREE_ID: u64 = 1;
/// First id handed to user trees.
const FIRST_TREE_ID: u64 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DbHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    registry_root: U64,
    next_page_id: U64,
    next_tree_id: U64,
    next_txn_id: U64,
    redo_number: U64,
    flags: U64,
    reserved: [u8; 56],
}

const _: () = assert!(std::mem::size_of::<DbHeader>() == HEADER_SIZE);

impl DbHeader {
    fn new(page_size: u32, registry_root: u64) -> Self {
        Self {
            magic: *DB_MAGIC,
            version: U32::new(DB_VERSION),
            page_size: U32::new(page_size),
            registry_root: U64::new(registry_root),
            next_page_id: U64::new(FIRST_ALLOCATABLE_ID),
            next_tree_id: U64::new(FIRST_TREE_ID),
            next_txn_id: U64::new(1),
            redo_number: U64::new(1),
            flags: U64::new(0),
            reserved: [0u8; 56],
        }
    }

    zerocopy_accessors! {
        version: u32,
        page_size: u32,
        registry_root: u64,
        next_page_id: u64,
        next_tree_id: u64,
        next_txn_id: u64,
        redo_number: u64,
    }
}

struct AllocState {
    next_id: u64,
    free: Vec<u64>,
    limit: u64,
}

struct TreeRegistry {
    by_id: HashMap<u64, Arc<TreeInner>>,
    by_name: HashMap<Vec<u8>, u64>,
    next_tree_id: u64,
}

/// Everything the engine components share.
pub(crate) struct DbShared {
    base_path: PathBuf,
    page_size: usize,
    max_key_size: usize,
    max_entry_size: usize,
    durability: DurabilityMode,
    lock_timeout: Duration,

    pub(crate) page_array: Box<dyn PageArray>,
    pub(crate) page_cache: PageCache,
    pub(crate) secondary: Option<Box<dyn SecondaryPageCache>>,
    pub(crate) spares: SparePagePool,
    pub(crate) frag: Box<dyn FragmentStore>,
    pub(crate) arena: NodeArena,
    lock_manager: Arc<LockManager>,
    pub(crate) commit_lock: CommitLock,
    pub(crate) redo: RedoLog,

    allocator: Latched<AllocState>,
    next_txn: AtomicU64,
    /// Current dirty generation; flipped by checkpoint.
    dirty_generation: AtomicBool,
    redo_number: AtomicU64,
    registry_root: AtomicU64,
    panicked: Mutex<Option<String>>,
    trees: Mutex<TreeRegistry>,
}

impl DbShared {
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    pub(crate) fn durability(&self) -> DurabilityMode {
        self.durability
    }

    pub(crate) fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub(crate) fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub(crate) fn node_ctx(&self) -> NodeContext<'_> {
        NodeContext {
            frag: &*self.frag,
            spares: &self.spares,
            max_key_size: self.max_key_size,
            max_entry_size: self.max_entry_size,
        }
    }

    pub(crate) fn evict_ctx(&self) -> EvictContext<'_> {
        EvictContext {
            page_array: &*self.page_array,
            page_cache: &self.page_cache,
            secondary: self.secondary.as_deref(),
        }
    }

    pub(crate) fn undo_store(&self) -> &dyn UndoPageStore {
        self
    }

    pub(crate) fn assign_txn_id(&self) -> u64 {
        self.next_txn.fetch_add(1, Ordering::Relaxed)
    }

    /// Marks a node dirty in the current generation.
    pub(crate) fn mark_dirty(&self, state: &mut NodeState) {
        if !state.cached_state.is_dirty() {
            state.cached_state = CachedState::dirty(self.dirty_generation.load(Ordering::Acquire));
        }
    }

    pub(crate) fn allocate_page_id(&self) -> Result<u64> {
        let mut alloc = self.allocator.write();
        if let Some(id) = alloc.free.pop() {
            return Ok(id);
        }
        if alloc.next_id >= alloc.limit {
            return Err(DatabaseFull {
                page_count: alloc.next_id,
                page_limit: alloc.limit,
            }
            .into());
        }
        let id = alloc.next_id;
        alloc.next_id += 1;
        // Grow the backing file in doubling chunks.
        if id >= self.page_array.page_count() {
            let grown = (self.page_array.page_count() * 2).max(id + 1).min(alloc.limit);
            self.page_array.set_page_count(grown)?;
        }
        Ok(id)
    }

    pub(crate) fn free_page_id(&self, id: u64) -> Result<()> {
        ensure!(id >= FIRST_ALLOCATABLE_ID, "cannot free reserved page {}", id);
        self.allocator.write().free.push(id);
        Ok(())
    }

    pub(crate) fn tree_by_id(&self, id: u64) -> Option<Arc<TreeInner>> {
        self.trees.lock().by_id.get(&id).cloned()
    }

    /// Materializes the key of an encoded leaf entry, for undo replay.
    pub(crate) fn entry_key(&self, entry_bytes: &[u8]) -> Result<Vec<u8>> {
        let key = decode_key_at(entry_bytes, 0);
        if key.fragmented {
            self.frag.reconstruct_key(entry_bytes, key.data_loc, key.len)
        } else {
            Ok(entry_bytes[key.data_loc..key.data_loc + key.len].to_vec())
        }
    }

    pub(crate) fn panic_db(&self, cause: &str) {
        let mut panicked = self.panicked.lock();
        if panicked.is_none() {
            *panicked = Some(cause.to_string());
        }
    }

    pub(crate) fn check_panicked(&self) -> Result<()> {
        if let Some(cause) = self.panicked.lock().as_ref() {
            bail!("database is panicked: {}", cause);
        }
        Ok(())
    }

    fn redo_path(&self, number: u64) -> PathBuf {
        redo_path_for(&self.base_path, number)
    }

    /// Writes the header into page 0 and syncs.
    fn persist_header(&self) -> Result<()> {
        let alloc_next = self.allocator.read().next_id;
        let trees = self.trees.lock();
        let mut header = DbHeader::new(self.page_size as u32, self.registry_root.load(Ordering::Acquire));
        header.set_next_page_id(alloc_next);
        header.set_next_tree_id(trees.next_tree_id);
        drop(trees);
        header.set_next_txn_id(self.next_txn.load(Ordering::Acquire));
        header.set_redo_number(self.redo_number.load(Ordering::Acquire));

        let mut page = vec![0u8; self.page_size];
        page[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        self.page_array.write_page(0, &page, 0)?;
        self.page_array.sync(true)?;
        Ok(())
    }
}

impl UndoPageStore for DbShared {
    fn allocate_page_id(&self) -> Result<u64> {
        DbShared::allocate_page_id(self)
    }

    fn write_undo_page(&self, id: u64, page: &[u8]) -> Result<()> {
        self.page_array.write_page(id, page, 0)
    }

    fn read_undo_page(&self, id: u64, page: &mut [u8]) -> Result<()> {
        self.page_array.read_page(id, page, 0, self.page_size)
    }

    fn free_page_id(&self, id: u64) -> Result<()> {
        DbShared::free_page_id(self, id)
    }
}

fn redo_path_for(base: &std::path::Path, number: u64) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".redo.{}", number));
    PathBuf::from(name)
}

/// An embedded transactional key/value database.
pub struct Database {
    shared: Arc<DbShared>,
}

impl Database {
    /// Opens or creates the database described by the options, running
    /// crash recovery before returning.
    pub fn open(options: Options) -> Result<Database> {
        options.validate()?;
        let page_size = options.page_size;

        let page_array = FilePageArray::open(&options.path, page_size as u32, 4)
            .wrap_err("failed to open the page file")?;

        // Read or initialize the header.
        let mut page0 = vec![0u8; page_size];
        page_array.read_page(0, &mut page0, 0, page_size)?;
        let fresh = page0[..16] != *DB_MAGIC;
        let header = if fresh {
            ensure!(options.create, "database does not exist and create is off");
            DbHeader::new(page_size as u32, 0)
        } else {
            let header = DbHeader::read_from_bytes(&page0[..HEADER_SIZE])
                .map_err(|e| eyre::eyre!("failed to parse header: {:?}", e))?;
            ensure!(
                header.version() == DB_VERSION,
                "unsupported database version {}",
                header.version(),
            );
            ensure!(
                header.page_size() as usize == page_size,
                "page size mismatch: file {} vs configured {}",
                header.page_size(),
                page_size,
            );
            header
        };

        let node_count = options.cache_bytes / page_size;
        let arena = NodeArena::new(node_count, page_size);

        // The writer starts past both replay candidates so creating it
        // cannot truncate a file recovery still needs.
        let checkpointed_number = header.redo_number();
        let open_number = if fresh {
            checkpointed_number
        } else {
            checkpointed_number + 2
        };
        let redo = if options.durability_mode == DurabilityMode::NoRedo {
            RedoLog::disabled()
        } else {
            RedoLog::create(
                &redo_path_for(&options.path, open_number),
                scramble(open_number) as u32,
            )?
        };

        let shared = Arc::new(DbShared {
            base_path: options.path.clone(),
            page_size,
            max_key_size: options.effective_max_key_size(),
            max_entry_size: options.effective_max_entry_size(),
            durability: options.durability_mode,
            lock_timeout: Duration::from_nanos(options.lock_timeout_nanos),
            page_array: Box::new(page_array),
            page_cache: PageCache::new(options.cache_bytes / 4, page_size, 0),
            secondary: None,
            spares: SparePagePool::new(page_size, SPARE_PAGE_COUNT),
            frag: Box::new(DenyFragments),
            arena,
            lock_manager: Arc::new(LockManager::new()),
            commit_lock: CommitLock::new(),
            redo,
            allocator: Latched::new(AllocState {
                next_id: header.next_page_id(),
                free: Vec::new(),
                limit: u64::MAX,
            }),
            next_txn: AtomicU64::new(header.next_txn_id()),
            dirty_generation: AtomicBool::new(false),
            redo_number: AtomicU64::new(open_number),
            registry_root: AtomicU64::new(header.registry_root()),
            panicked: Mutex::new(None),
            trees: Mutex::new(TreeRegistry {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
                next_tree_id: header.next_tree_id(),
            }),
        });

        let db = Database { shared };

        // Bootstrap the registry tree.
        if fresh {
            let root_id = db.shared.allocate_page_id()?;
            db.shared.registry_root.store(root_id, Ordering::Release);
            let slot = db.load_root(root_id, true)?;
            db.register_tree(REGISTRY_TREE_ID, b"(registry)".to_vec(), slot);
            db.shared.persist_header()?;
        } else {
            let root_id = db.shared.registry_root.load(Ordering::Acquire);
            let slot = db.load_root(root_id, false)?;
            db.register_tree(REGISTRY_TREE_ID, b"(registry)".to_vec(), slot);
            db.open_registered_trees()?;
        }

        // Recovery: replay committed transactions from surviving redo
        // files, then checkpoint into a clean slate and drop the stale
        // files.
        if !fresh {
            db.replay_redo(checkpointed_number)?;
            db.replay_redo(checkpointed_number + 1)?;
        }
        db.checkpoint()?;
        if !fresh {
            for number in [checkpointed_number, checkpointed_number + 1] {
                let stale = db.shared.redo_path(number);
                if stale.exists() {
                    std::fs::remove_file(&stale).wrap_err("failed to remove stale redo")?;
                }
            }
        }

        Ok(db)
    }

    fn register_tree(&self, id: u64, name: Vec<u8>, root_slot: u32) -> Arc<TreeInner> {
        let inner = Arc::new(TreeInner {
            id,
            name: Mutex::new(name.clone()),
            root_slot,
            closed: AtomicBool::new(false),
        });
        let mut trees = self.shared.trees.lock();
        trees.by_id.insert(id, Arc::clone(&inner));
        trees.by_name.insert(name, id);
        inner
    }

    /// Loads (or initializes) a tree root into the arena, pinned
    /// unevictable.
    fn load_root(&self, root_id: u64, fresh: bool) -> Result<u32> {
        let db = &self.shared;
        let (slot, mut guard) = db.arena.alloc_latched(&db.evict_ctx())?;
        if fresh {
            guard.as_empty_root();
            guard.id = root_id;
            db.mark_dirty(&mut guard);
        } else {
            if !db.page_cache.remove(root_id, &mut guard.page) {
                db.page_array
                    .read_page(root_id, &mut guard.page, 0, db.page_size)?;
            }
            guard.verify_header(root_id)?;
            guard.id = root_id;
            guard.cached_state = CachedState::Clean;
        }
        db.arena
            .map
            .insert(root_id, slot)
            .map_err(|other| eyre::eyre!("root page {} already mapped to {}", root_id, other))?;
        db.arena.make_unevictable(slot);
        Ok(slot)
    }

    /// Opens the trees recorded in the registry.
    fn open_registered_trees(&self) -> Result<()> {
        let registry = self
            .shared
            .tree_by_id(REGISTRY_TREE_ID)
            .expect("registry bootstrapped");
        let tree = Tree::new(Arc::clone(&self.shared), registry);
        let mut cursor = tree.cursor();
        cursor.first()?;
        let mut entries = Vec::new();
        while let Some(name) = cursor.key().map(|k| k.to_vec()) {
            if let Some(value) = cursor.load()? {
                ensure!(value.len() == 16, "malformed registry entry");
                let id = u64::from_le_bytes(value[..8].try_into().expect("8 bytes"));
                let root = u64::from_le_bytes(value[8..16].try_into().expect("8 bytes"));
                entries.push((name, id, root));
            }
            cursor.next()?;
        }
        drop(cursor);
        for (name, id, root) in entries {
            let slot = self.load_root(root, false)?;
            self.register_tree(id, name, slot);
        }
        Ok(())
    }

    /// Opens a named tree, creating it if absent.
    pub fn open_tree(&self, name: &[u8]) -> Result<Tree> {
        self.shared.check_panicked()?;
        ensure!(
            name != b"(registry)",
            "the registry name is reserved",
        );
        if let Some(id) = self.shared.trees.lock().by_name.get(name).copied() {
            let inner = self.shared.tree_by_id(id).expect("registered tree");
            return Ok(Tree::new(Arc::clone(&self.shared), inner));
        }

        // Create: allocate the root, register, persist the name.
        let root_id = self.shared.allocate_page_id()?;
        let slot = self.load_root(root_id, true)?;
        let id = {
            let mut trees = self.shared.trees.lock();
            let id = trees.next_tree_id;
            trees.next_tree_id += 1;
            id
        };
        let inner = self.register_tree(id, name.to_vec(), slot);

        let registry = self
            .shared
            .tree_by_id(REGISTRY_TREE_ID)
            .expect("registry bootstrapped");
        let registry_tree = Tree::new(Arc::clone(&self.shared), registry);
        let mut value = Vec::with_capacity(16);
        value.extend_from_slice(&id.to_le_bytes());
        value.extend_from_slice(&root_id.to_le_bytes());
        registry_tree.store(None, name, &value)?;
        // Creation is checkpointed immediately, so recovery always knows
        // every tree a surviving redo record can reference.
        self.checkpoint()?;

        Ok(Tree::new(Arc::clone(&self.shared), inner))
    }

    /// Renames a tree.
    pub fn rename_tree(&self, name: &[u8], new_name: &[u8]) -> Result<()> {
        self.shared.check_panicked()?;
        let registry = self
            .shared
            .tree_by_id(REGISTRY_TREE_ID)
            .expect("registry bootstrapped");
        let registry_tree = Tree::new(Arc::clone(&self.shared), registry);

        let id = {
            let trees = self.shared.trees.lock();
            *trees
                .by_name
                .get(name)
                .ok_or_else(|| eyre::eyre!("no tree named {:?}", name))?
        };
        ensure!(
            !self.shared.trees.lock().by_name.contains_key(new_name),
            "a tree named {:?} already exists",
            new_name,
        );

        let value = registry_tree
            .load(None, name)?
            .ok_or_else(|| eyre::eyre!("registry entry missing"))?;
        registry_tree.store(None, new_name, &value)?;
        registry_tree.delete(None, name)?;

        let mut trees = self.shared.trees.lock();
        trees.by_name.remove(name);
        trees.by_name.insert(new_name.to_vec(), id);
        if let Some(inner) = trees.by_id.get(&id) {
            *inner.name.lock() = new_name.to_vec();
        }
        drop(trees);

        self.shared.redo.rename_index(0, id, new_name)?;
        Ok(())
    }

    /// Drops a tree, freeing its pages. Open handles observe ClosedIndex.
    pub fn delete_tree(&self, name: &[u8]) -> Result<()> {
        self.shared.check_panicked()?;
        let id = {
            let trees = self.shared.trees.lock();
            *trees
                .by_name
                .get(name)
                .ok_or_else(|| eyre::eyre!("no tree named {:?}", name))?
        };
        ensure!(id != REGISTRY_TREE_ID, "cannot delete the registry");

        let inner = self.shared.tree_by_id(id).expect("registered tree");
        inner.closed.store(true, Ordering::Release);

        // Free the subtree under the root, then reset the root to an
        // empty stub so draining cursors stay harmless.
        let db = &self.shared;
        let root_id;
        {
            let mut guard = db.arena.node(inner.root_slot).state.write();
            root_id = guard.id;
            free_children(db, &mut guard)?;
            guard.as_empty_root();
            guard.id = crate::config::STUB_ID;
            guard.cached_state = CachedState::Clean;
        }
        db.arena.map.remove(root_id, inner.root_slot);
        db.arena.make_evictable(inner.root_slot);
        db.free_page_id(root_id)?;

        let registry = self
            .shared
            .tree_by_id(REGISTRY_TREE_ID)
            .expect("registry bootstrapped");
        Tree::new(Arc::clone(&self.shared), registry).delete(None, name)?;

        let mut trees = self.shared.trees.lock();
        trees.by_name.remove(name);
        trees.by_id.remove(&id);
        drop(trees);

        self.shared.redo.delete_index(0, id)?;
        Ok(())
    }

    /// Starts a transaction with the database durability mode.
    pub fn begin(&self) -> Result<Transaction> {
        self.shared.check_panicked()?;
        Ok(Transaction::new(
            Arc::clone(&self.shared),
            self.shared.durability,
        ))
    }

    /// Starts a transaction with an explicit durability mode.
    pub fn begin_with(&self, durability: DurabilityMode) -> Result<Transaction> {
        self.shared.check_panicked()?;
        Ok(Transaction::new(Arc::clone(&self.shared), durability))
    }

    /// The pass-through sentinel transaction.
    pub fn bogus_transaction(&self) -> Transaction {
        Transaction::bogus(Arc::clone(&self.shared))
    }

    /// Forces buffered redo to durable storage, completing NoSync
    /// commits.
    pub fn sync(&self) -> Result<()> {
        self.shared.redo.sync()
    }

    /// Flushes the previous dirty generation and truncates earlier redo.
    pub fn checkpoint(&self) -> Result<()> {
        let db = &self.shared;
        db.check_panicked()?;

        let old_generation;
        let old_redo_number;
        {
            // Quiesce writers only for the generation flip and the redo
            // switch.
            let _excl = db.commit_lock.exclusive();
            old_generation = db.dirty_generation.fetch_xor(true, Ordering::AcqRel);
            old_redo_number = db.redo_number.fetch_add(1, Ordering::AcqRel);
            let new_path = db.redo_path(old_redo_number + 1);
            db.redo
                .rotate(&new_path, scramble(old_redo_number + 1) as u32)?;
        }

        // Flush the old generation while new mutations dirty the next.
        db.arena
            .flush_dirty(&[CachedState::dirty(old_generation)], &*db.page_array)?;
        db.page_array.sync(true)?;
        db.persist_header()?;

        let old_path = db.redo_path(old_redo_number);
        if old_path.exists() {
            std::fs::remove_file(&old_path)
                .wrap_err("failed to remove the checkpointed redo file")?;
        }
        Ok(())
    }

    /// Flushes everything and closes cleanly: after this, recovery has
    /// nothing to do.
    pub fn close(self) -> Result<()> {
        let db = &self.shared;
        db.check_panicked()?;
        db.arena.flush_dirty(
            &[CachedState::Dirty0, CachedState::Dirty1],
            &*db.page_array,
        )?;
        db.page_array.sync(true)?;
        db.persist_header()?;
        db.redo.close(0)?;
        db.page_array.close()?;
        Ok(())
    }

    /// Replays the committed transactions of one redo file, if present.
    fn replay_redo(&self, number: u64) -> Result<usize> {
        let path = self.shared.redo_path(number);
        if !path.exists() {
            return Ok(0);
        }
        let records = RedoDecoder::open(&path)?.collect_all()?;

        // First pass: per-transaction op buffers with scope markers, so
        // nested rollbacks drop exactly their scope.
        let mut applied = 0usize;
        let mut pending: HashMap<u64, Vec<RedoRecord>> = HashMap::new();
        for record in records {
            match record {
                RedoRecord::Store { index_id, key, value } => {
                    self.replay_apply(index_id, &key, Some(&value))?;
                    applied += 1;
                }
                RedoRecord::Delete { index_id, key } => {
                    self.replay_apply(index_id, &key, None)?;
                    applied += 1;
                }
                RedoRecord::TxnEnter { txn_id } => {
                    pending
                        .entry(txn_id)
                        .or_default()
                        .push(RedoRecord::TxnEnter { txn_id });
                }
                record @ (RedoRecord::TxnStore { .. } | RedoRecord::TxnDelete { .. }) => {
                    let txn_id = match &record {
                        RedoRecord::TxnStore { txn_id, .. } => *txn_id,
                        RedoRecord::TxnDelete { txn_id, .. } => *txn_id,
                        _ => unreachable!(),
                    };
                    pending.entry(txn_id).or_default().push(record);
                }
                RedoRecord::TxnRollback { txn_id } => {
                    // Drop back to the last scope marker.
                    if let Some(ops) = pending.get_mut(&txn_id) {
                        while let Some(op) = ops.pop() {
                            if matches!(op, RedoRecord::TxnEnter { .. }) {
                                break;
                            }
                        }
                    }
                }
                RedoRecord::TxnRollbackFinal { txn_id } => {
                    pending.remove(&txn_id);
                }
                RedoRecord::TxnCommit { .. } => {}
                RedoRecord::TxnCommitFinal { txn_id } => {
                    if let Some(ops) = pending.remove(&txn_id) {
                        for op in ops {
                            match op {
                                RedoRecord::TxnStore {
                                    index_id,
                                    key,
                                    value,
                                    ..
                                } => {
                                    self.replay_apply(index_id, &key, Some(&value))?;
                                    applied += 1;
                                }
                                RedoRecord::TxnDelete { index_id, key, .. } => {
                                    self.replay_apply(index_id, &key, None)?;
                                    applied += 1;
                                }
                                _ => {}
                            }
                        }
                    }
                }
                // Index management and administrative records carry no
                // replayable tree state here.
                _ => {}
            }
        }
        Ok(applied)
    }

    fn replay_apply(&self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if let Some(tree) = self.shared.tree_by_id(index_id) {
            replay_write(&self.shared, &tree, key, value)?;
        }
        Ok(())
    }

    /// Runs tree-structure invariant checks over a named tree. Test and
    /// tooling hook.
    pub fn verify_tree(&self, name: &[u8]) -> Result<()> {
        let id = {
            let trees = self.shared.trees.lock();
            *trees
                .by_name
                .get(name)
                .ok_or_else(|| eyre::eyre!("no tree named {:?}", name))?
        };
        let inner = self.shared.tree_by_id(id).expect("registered");
        let db = &self.shared;
        let mut guard = db.arena.node(inner.root_slot).state.write();
        verify_subtree(db, &mut guard, None, None)
    }
}

/// Frees every page under an internal node, depth first.
fn free_children(db: &DbShared, guard: &mut ExclusiveGuard<'_, NodeState>) -> Result<()> {
    if guard.is_leaf() {
        return Ok(());
    }
    for child_pos in (0..=guard.highest_pos()).step_by(2) {
        let child_id = guard.retrieve_child_ref_id(child_pos);
        let (child_slot, mut child) = crate::tree::load_child_exclusive(db, guard, child_id)?;
        free_children(db, &mut child)?;
        db.arena.map.remove(child_id, child_slot);
        child.id = 0;
        child.cached_state = CachedState::Clean;
        drop(child);
        db.arena.unused(child_slot);
        db.free_page_id(child_id)?;
    }
    Ok(())
}

/// Recursive structural check: header invariants, key ordering, garbage
/// accounting, and separator bounds.
fn verify_subtree(
    db: &DbShared,
    guard: &mut ExclusiveGuard<'_, NodeState>,
    low: Option<&[u8]>,
    high: Option<&[u8]>,
) -> Result<()> {
    let ctx = db.node_ctx();
    guard.verify_header(guard.id)?;

    // Keys ascend strictly and respect the separator bounds.
    let mut prev: Option<Vec<u8>> = None;
    for pos in (0..=guard.highest_key_pos()).step_by(2) {
        let key = guard.retrieve_key(&ctx, pos)?;
        if let Some(prev) = &prev {
            ensure!(*prev < key, "key order violation in node {}", guard.id);
        }
        if let Some(low) = low {
            ensure!(key.as_slice() >= low, "key below subtree bound");
        }
        if let Some(high) = high {
            ensure!(key.as_slice() < high, "key above subtree bound");
        }
        prev = Some(key);
    }

    if guard.is_leaf() {
        return Ok(());
    }
    for child_pos in (0..=guard.highest_pos()).step_by(2) {
        let child_low = if child_pos == 0 {
            low.map(|l| l.to_vec())
        } else {
            Some(guard.retrieve_key(&ctx, child_pos - 2)?)
        };
        let child_high = if child_pos > guard.highest_key_pos() {
            high.map(|h| h.to_vec())
        } else {
            Some(guard.retrieve_key(&ctx, child_pos)?)
        };
        let child_id = guard.retrieve_child_ref_id(child_pos);
        let (_slot, mut child) = crate::tree::load_child_exclusive(db, guard, child_id)?;
        verify_subtree(db, &mut child, child_low.as_deref(), child_high.as_deref())?;
    }
    Ok(())
}
