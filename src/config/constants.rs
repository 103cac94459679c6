//! # BurlDB Configuration Constants
//!
//! Centralizes the layout constants the engine depends on. Constants that
//! depend on each other are co-located so a change to one is checked against
//! the others.
//!
//! ## Dependency Graph
//!
//! ```text
//! MIN_PAGE_SIZE (512) .. MAX_PAGE_SIZE (65536)
//!       │
//!       ├─> TN_HEADER_SIZE (12 bytes, fixed)
//!       │     Every tree/undo node starts with this header. Segment tails
//!       │     and search-vector pointers are u16, which is why a page can
//!       │     never exceed 65536 bytes.
//!       │
//!       └─> default max_key_size / max_entry_size are derived from the
//!           configured page size at open time (see config::Options).
//!
//! NODE_MAP_SHARD_COUNT (16)
//!       │
//!       └─> LOCK_TABLE_SHARD_COUNT (16)
//!             Both registries hash 64-bit ids; shard counts are powers of
//!             two so the shard index is a mask, not a division.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `MIN_PAGE_SIZE` and `MAX_PAGE_SIZE` are powers of two.
//! 2. `TN_HEADER_SIZE` is even, so an empty search vector lands on an even
//!    address.
//! 3. Shard counts are powers of two.

/// Smallest supported page size in bytes.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size in bytes. Segment pointers are u16, so pages
/// cannot grow past this.
pub const MAX_PAGE_SIZE: usize = 65536;

/// Default page size when the caller does not choose one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Size of the tree-node header. Bytes 0..12 of every tree and undo page.
pub const TN_HEADER_SIZE: usize = 12;

/// Page id reserved for stub roots. Id 0 means "unused".
pub const STUB_ID: u64 = 1;

/// First page id handed out by the allocator. Page 0 holds the database
/// header and page 1 is the stub sentinel.
pub const FIRST_ALLOCATABLE_ID: u64 = 2;

/// Number of shards in the node map. Power of two.
pub const NODE_MAP_SHARD_COUNT: usize = 16;

/// Number of shards in the lock table. Power of two.
pub const LOCK_TABLE_SHARD_COUNT: usize = 16;

/// Default per-request lock timeout.
pub const DEFAULT_LOCK_TIMEOUT_NANOS: u64 = 1_000_000_000;

/// Default capacity of the node cache in bytes.
pub const DEFAULT_CACHE_BYTES: usize = 16 * 1024 * 1024;

/// Number of spare page buffers kept for compaction.
pub const SPARE_PAGE_COUNT: usize = 4;

/// Size of the redo writer's in-memory buffer.
pub const REDO_BUFFER_SIZE: usize = 64 * 1024;

/// Redo bytes after which an automatic checkpoint is suggested.
pub const DEFAULT_CHECKPOINT_THRESHOLD: u64 = 16 * 1024 * 1024;

const _: () = assert!(MIN_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_PAGE_SIZE.is_power_of_two());
const _: () = assert!(DEFAULT_PAGE_SIZE.is_power_of_two());
const _: () = assert!(TN_HEADER_SIZE % 2 == 0, "search vector alignment");
const _: () = assert!(NODE_MAP_SHARD_COUNT.is_power_of_two());
const _: () = assert!(LOCK_TABLE_SHARD_COUNT.is_power_of_two());
