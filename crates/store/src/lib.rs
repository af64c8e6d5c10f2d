//! Typed transactional access to the chain database.
//!
//! Tables: headers (`hash -> header` with total difficulty), canonical
//! (`number -> hash`), bodies (`hash -> body`), stage progress
//! (`name -> height`), the head triple, and the fork table written at
//! init for diagnostics.
//!
//! Readers see committed state only. Writes are staged on a [`RwTx`] and
//! applied atomically on commit, so a crash leaves a consistent prefix.
//! One writer transaction exists at a time; `begin_rw` serializes writers
//! behind a coarse async lock.

pub mod error;
pub mod memory;

use alloy_primitives::U256;
use chain::{BlockBody, BlockHeader, BlockNum, Hash};

pub use error::StoreError;
pub use memory::{MemoryStore, RwTx};

/// Canonical head: hash, cumulative difficulty, height. Updated atomically
/// with the batch that advanced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadInfo {
    pub hash: Hash,
    pub td: U256,
    pub height: BlockNum,
}

/// Read-only view of committed state.
pub trait StoreReader: Send + Sync {
    fn header(&self, hash: &Hash) -> Result<Option<BlockHeader>, StoreError>;

    fn total_difficulty(&self, hash: &Hash) -> Result<Option<U256>, StoreError>;

    fn canonical_hash(&self, number: BlockNum) -> Result<Option<Hash>, StoreError>;

    fn canonical_header(&self, number: BlockNum) -> Result<Option<BlockHeader>, StoreError> {
        match self.canonical_hash(number)? {
            Some(hash) => self.header(&hash),
            None => Ok(None),
        }
    }

    fn body(&self, hash: &Hash) -> Result<Option<BlockBody>, StoreError>;

    fn has_body(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.body(hash)?.is_some())
    }

    fn head(&self) -> Result<HeadInfo, StoreError>;

    /// Last processed height for a stage, 0 if the stage never ran.
    fn stage_progress(&self, stage: &str) -> Result<BlockNum, StoreError>;

    /// Canonical headers in `range` that have no body yet, ascending.
    fn headers_without_bodies(
        &self,
        range: std::ops::RangeInclusive<BlockNum>,
    ) -> Result<Vec<(BlockNum, BlockHeader)>, StoreError>;
}
