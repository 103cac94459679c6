//! Runtime options for opening a database.
//!
//! The builder validates the page size (power of two within the supported
//! range) and derives the key/entry ceilings from it unless the caller pins
//! them explicitly. Derivations follow the node format: a leaf page must be
//! able to hold at least two maximum-size entries, and an internal page at
//! least two maximum-size keys plus their child ids.

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{ensure, Result};

use super::constants::{
    DEFAULT_CACHE_BYTES, DEFAULT_LOCK_TIMEOUT_NANOS, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
    MIN_PAGE_SIZE, TN_HEADER_SIZE,
};

/// How much durability a commit buys before it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Flush and fsync the redo log before commit returns.
    Sync,
    /// Flush to the OS but do not fsync; durability is reported by the next
    /// explicit sync or checkpoint.
    #[default]
    NoSync,
    /// Leave records in the writer buffer; flushed on demand or shutdown.
    NoFlush,
    /// Record nothing. Used by temporary trees.
    NoRedo,
}

/// Default lock acquisition strength for transactional reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Read locks held until scope exit.
    #[default]
    Upgradable,
    /// Shared read locks held until scope exit.
    RepeatableRead,
    /// Shared read locks released immediately after each read.
    ReadCommitted,
    /// No read locks at all.
    Unsafe,
}

/// Open-time configuration. Built with setters, consumed by
/// [`crate::Database::open`].
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) path: PathBuf,
    pub(crate) page_size: usize,
    pub(crate) cache_bytes: usize,
    pub(crate) lock_timeout_nanos: u64,
    pub(crate) durability_mode: DurabilityMode,
    pub(crate) max_key_size: Option<usize>,
    pub(crate) max_entry_size: Option<usize>,
    pub(crate) max_fragmented_entry_size: Option<usize>,
    pub(crate) create: bool,
}

impl Options {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            page_size: DEFAULT_PAGE_SIZE,
            cache_bytes: DEFAULT_CACHE_BYTES,
            lock_timeout_nanos: DEFAULT_LOCK_TIMEOUT_NANOS,
            durability_mode: DurabilityMode::default(),
            max_key_size: None,
            max_entry_size: None,
            max_fragmented_entry_size: None,
            create: true,
        }
    }

    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    pub fn cache_bytes(mut self, bytes: usize) -> Self {
        self.cache_bytes = bytes;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_nanos = timeout.as_nanos().min(u64::MAX as u128) as u64;
        self
    }

    pub fn durability_mode(mut self, mode: DurabilityMode) -> Self {
        self.durability_mode = mode;
        self
    }

    pub fn max_key_size(mut self, bytes: usize) -> Self {
        self.max_key_size = Some(bytes);
        self
    }

    pub fn max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = Some(bytes);
        self
    }

    pub fn max_fragmented_entry_size(mut self, bytes: usize) -> Self {
        self.max_fragmented_entry_size = Some(bytes);
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(
            self.page_size.is_power_of_two()
                && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size),
            "page size {} must be a power of two in {}..={}",
            self.page_size,
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE,
        );
        ensure!(
            self.cache_bytes >= self.page_size * 8,
            "cache of {} bytes holds fewer than 8 pages of {} bytes",
            self.cache_bytes,
            self.page_size,
        );
        if let Some(max_key) = self.max_key_size {
            ensure!(
                max_key >= 1 && max_key <= self.derived_max_key_size(),
                "max key size {} outside 1..={}",
                max_key,
                self.derived_max_key_size(),
            );
        }
        Ok(())
    }

    /// Largest key an internal page can hold twice over, capped at the
    /// 16383-byte encoding limit.
    pub(crate) fn derived_max_key_size(&self) -> usize {
        let usable = (self.page_size - TN_HEADER_SIZE) / 2 - (2 + 8 + 2);
        usable.min(16383)
    }

    /// Largest encoded leaf entry: half a page, so any leaf can hold two.
    pub(crate) fn derived_max_entry_size(&self) -> usize {
        (self.page_size - TN_HEADER_SIZE) / 2 - 2
    }

    pub(crate) fn effective_max_key_size(&self) -> usize {
        self.max_key_size
            .unwrap_or_else(|| self.derived_max_key_size())
    }

    pub(crate) fn effective_max_entry_size(&self) -> usize {
        self.max_entry_size
            .unwrap_or_else(|| self.derived_max_entry_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let opts = Options::new("/tmp/x");
        opts.validate().unwrap();
        assert_eq!(opts.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(opts.durability_mode, DurabilityMode::NoSync);
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let opts = Options::new("/tmp/x").page_size(3000);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_tiny_cache() {
        let opts = Options::new("/tmp/x").page_size(4096).cache_bytes(4096);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn derived_key_ceiling_tracks_page_size() {
        let small = Options::new("/tmp/x").page_size(512);
        let large = Options::new("/tmp/x").page_size(65536);
        assert!(small.derived_max_key_size() < large.derived_max_key_size());
        assert!(large.derived_max_key_size() <= 16383);
    }
}
