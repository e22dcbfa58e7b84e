//! Block storage on a transactional key/value store.
//!
//! Records are keyed `(name, index, version)`. The version is a monotonically
//! decreasing integer: a more negative version is newer. Listing the records
//! of one `(name, index)` pair in ascending key order therefore yields the
//! newest version first, which is what the read path relies on. No secondary
//! index is needed to resolve "latest visible version".
//!
//! Alongside the numbered page blocks, each file may carry one synthetic
//! purge record (sorted after every page index) whose payload maps page
//! indices to obsolete-version thresholds.

pub mod batch;
pub mod engine;
pub mod memory;

use std::ops::Bound;

use serde_derive::{Deserialize, Serialize};

/// Version tag on a block record. Decremented for every journalled
/// transaction, so smaller means newer. The newest committed version of
/// block 0 is the file's atomic commit marker.
pub type Version = i64;

/// The index column of a block key. Derived ordering puts every page before
/// the purge record, mirroring how the host store sorts numbers before
/// string keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockIndex {
    Page(u32),
    Purge,
}

/// Composite primary key of a block record.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub name: String,
    pub index: BlockIndex,
    pub version: Version,
}

/// One stored record. `file_size` is carried on block 0 of database files
/// only; the purge record keeps its page map bincode-encoded in `data`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub name: String,
    pub index: BlockIndex,
    pub version: Version,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl BlockRecord {
    pub fn key(&self) -> BlockKey {
        BlockKey { name: self.name.clone(), index: self.index, version: self.version }
    }
}

/// Half-open (or closed) composite key range, scanned in ascending order.
pub type KeyRange = (Bound<BlockKey>, Bound<BlockKey>);

fn key(name: &str, index: BlockIndex, version: Version) -> BlockKey {
    BlockKey { name: name.to_string(), index, version }
}

/// All versions of one page, newest first.
pub fn block_range(name: &str, page: u32) -> KeyRange {
    (
        Bound::Included(key(name, BlockIndex::Page(page), Version::MIN)),
        Bound::Included(key(name, BlockIndex::Page(page), Version::MAX)),
    )
}

/// Versions of one page no newer than `version`, newest first. The first
/// record of this range is what a reader running at `version` sees.
pub fn at_or_older(name: &str, page: u32, version: Version) -> KeyRange {
    (
        Bound::Included(key(name, BlockIndex::Page(page), version)),
        Bound::Included(key(name, BlockIndex::Page(page), Version::MAX)),
    )
}

/// Versions of one page strictly older than `version`. Used to reconstruct
/// pre-transaction page images and to reclaim superseded versions.
pub fn older_than(name: &str, page: u32, version: Version) -> KeyRange {
    (
        Bound::Excluded(key(name, BlockIndex::Page(page), version)),
        Bound::Included(key(name, BlockIndex::Page(page), Version::MAX)),
    )
}

/// Every version of every page at or above `page`. Truncation sweeps this.
pub fn pages_from(name: &str, page: u32) -> KeyRange {
    (
        Bound::Included(key(name, BlockIndex::Page(page), Version::MIN)),
        Bound::Included(key(name, BlockIndex::Page(u32::MAX), Version::MAX)),
    )
}

/// Everything stored under one file name, purge record included.
pub fn file_range(name: &str) -> KeyRange {
    (
        Bound::Included(key(name, BlockIndex::Page(0), Version::MIN)),
        Bound::Included(key(name, BlockIndex::Purge, Version::MAX)),
    )
}

/// The file's purge record, if present.
pub fn purge_range(name: &str) -> KeyRange {
    (
        Bound::Included(key(name, BlockIndex::Purge, Version::MIN)),
        Bound::Included(key(name, BlockIndex::Purge, Version::MAX)),
    )
}

pub fn purge_key(name: &str) -> BlockKey {
    key(name, BlockIndex::Purge, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_versions_sort_first() {
        let newer = key("/a", BlockIndex::Page(3), -2);
        let older = key("/a", BlockIndex::Page(3), -1);
        let oldest = key("/a", BlockIndex::Page(3), 0);
        assert!(newer < older);
        assert!(older < oldest);
    }

    #[test]
    fn purge_record_sorts_after_every_page() {
        let last_page = key("/a", BlockIndex::Page(u32::MAX), Version::MAX);
        let purge = purge_key("/a");
        assert!(last_page < purge);
    }

    #[test]
    fn keys_group_by_name_first() {
        let a = key("/a", BlockIndex::Purge, Version::MAX);
        let b = key("/b", BlockIndex::Page(0), Version::MIN);
        assert!(a < b);
    }
}
