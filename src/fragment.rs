//! External fragment service interface.
//!
//! Keys longer than the per-tree maximum and values that would push an
//! entry past the entry ceiling are stored outside the node, replaced in
//! the page by a short placeholder with the fragmented header bit set.
//! The engine only defines the hooks; reconstruction, deletion, and the
//! fragmented-trash index used by transactional deletes live behind this
//! trait.
//!
//! The bundled [`DenyFragments`] refuses to fragment, which turns
//! oversized entries into errors. That is the correct default for an
//! engine whose ceilings guarantee any two entries fit a page.

use eyre::{bail, Result};

pub trait FragmentStore: Send + Sync {
    /// Stores an oversized key, returning the placeholder bytes to embed.
    fn fragment_key(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Stores an oversized value, returning placeholder bytes no longer
    /// than `max_size`.
    fn fragment_value(&self, value: &[u8], max_size: usize) -> Result<Vec<u8>>;

    /// Materializes a fragmented value from its placeholder within a page.
    fn reconstruct(&self, page: &[u8], loc: usize, len: usize) -> Result<Vec<u8>>;

    /// Materializes a fragmented key from its placeholder within a page.
    fn reconstruct_key(&self, page: &[u8], loc: usize, len: usize) -> Result<Vec<u8>>;

    /// Frees the fragment chain behind a placeholder.
    fn delete_fragments(&self, placeholder: &[u8]) -> Result<()>;

    /// Moves a fragment chain into the trash index keyed by transaction
    /// id: commit deletes the chain, rollback reinstates it.
    fn trash_fragments(&self, txn_id: u64, placeholder: &[u8]) -> Result<()>;
}

/// Fragment store that refuses all fragmentation.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyFragments;

impl FragmentStore for DenyFragments {
    fn fragment_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        bail!("key of {} bytes exceeds the maximum key size", key.len())
    }

    fn fragment_value(&self, value: &[u8], _max_size: usize) -> Result<Vec<u8>> {
        bail!("value of {} bytes exceeds the maximum entry size", value.len())
    }

    fn reconstruct(&self, _page: &[u8], _loc: usize, _len: usize) -> Result<Vec<u8>> {
        bail!("fragmented value encountered with no fragment store bound")
    }

    fn reconstruct_key(&self, _page: &[u8], _loc: usize, _len: usize) -> Result<Vec<u8>> {
        bail!("fragmented key encountered with no fragment store bound")
    }

    fn delete_fragments(&self, _placeholder: &[u8]) -> Result<()> {
        Ok(())
    }

    fn trash_fragments(&self, _txn_id: u64, _placeholder: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_refuses_fragmentation() {
        let deny = DenyFragments;
        assert!(deny.fragment_key(&[0; 20000]).is_err());
        assert!(deny.fragment_value(&[0; 1 << 21], 100).is_err());
        assert!(deny.reconstruct(&[0; 16], 0, 8).is_err());
        assert!(deny.delete_fragments(&[0; 8]).is_ok());
    }
}
