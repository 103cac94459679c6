//! # Storage Layer
//!
//! The engine reads and writes fixed-size pages through the [`PageArray`]
//! trait and never touches files directly. The bundled implementation,
//! [`FilePageArray`], memory-maps a single backing file and grows it by
//! remapping.
//!
//! ## Page Identity
//!
//! Pages are identified by 64-bit ids. Id 0 means "unused" and id 1 is
//! reserved for stub roots; real allocation starts at id 2. A page id is an
//! index into the array — id times page size is the file offset.
//!
//! ## Caching Tiers
//!
//! ```text
//! ┌───────────────────────────────┐
//! │ Node arena (latched, parsed)  │  in-memory Nodes, LRU usage list
//! ├───────────────────────────────┤
//! │ PageCache (raw bytes, LRU)    │  recently evicted page images
//! ├───────────────────────────────┤
//! │ SecondaryPageCache (optional) │  consumed interface, e.g. off-heap
//! ├───────────────────────────────┤
//! │ PageArray                     │  the durable file
//! └───────────────────────────────┘
//! ```
//!
//! A node being evicted clean offers its bytes down the tiers; a node load
//! asks the tiers before paying for file I/O.
//!
//! ## Error Policy
//!
//! I/O failures surface to the caller verbatim; the storage layer does not
//! retry.

mod file_array;
mod page_cache;
mod spare_pool;

pub use file_array::FilePageArray;
pub use page_cache::{scramble, PageCache};
pub use spare_pool::SparePagePool;

use eyre::Result;

/// Read/write fixed-size pages by index. The consumed interface behind
/// which the low-level backing store lives.
pub trait PageArray: Send + Sync {
    fn page_size(&self) -> u32;

    fn page_count(&self) -> u64;

    /// Grows (or truncates) the array. Growth zero-fills.
    fn set_page_count(&self, count: u64) -> Result<()>;

    /// Reads `length` bytes of the page at `index` into `buf[offset..]`.
    fn read_page(&self, index: u64, buf: &mut [u8], offset: usize, length: usize) -> Result<()>;

    /// Writes the full page image in `buf` to the page at `index`, starting
    /// from `buf[offset..]`.
    fn write_page(&self, index: u64, buf: &[u8], offset: usize) -> Result<()>;

    /// Flushes to durable storage. With `metadata`, file metadata too.
    fn sync(&self, metadata: bool) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Optional second-tier cache for evicted-but-clean pages. Consumed
/// interface; the engine ships none.
pub trait SecondaryPageCache: Send + Sync {
    /// Offers a clean page image for later retrieval.
    fn cache_page(&self, id: u64, page: &[u8]);

    /// Swaps the provided buffer for an equivalent one the cache is willing
    /// to hand back, so the evicting node need not allocate.
    fn evict_page(&self, id: u64, page: Box<[u8]>) -> Box<[u8]>;
}
