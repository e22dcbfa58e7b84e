//! In-memory state per open file handle.

use std::collections::HashSet;

use crate::kvs::Version;
use crate::lock::LockManager;

/// Which half of the VFS serves this file's I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Database,
    Journal,
}

/// The cached first block of a file.
///
/// For a database file this is the authoritative copy between syncs: reads
/// of block 0 are served from it, writes mutate it in place, and only xSync
/// publishes it to the store, which is what makes that publish the file's
/// atomic commit point. For a journal file `data` holds the header sector,
/// which is the only journal region whose bytes are remembered at all.
#[derive(Clone, Debug, PartialEq)]
pub struct Block0 {
    pub data: Vec<u8>,
    pub file_size: u64,
    pub version: Version,
}

/// Per-handle state, created on open and dropped on close.
pub struct FileEntry {
    pub path: String,
    pub flags: u32,
    pub kind: FileKind,
    pub block0: Block0,
    pub locks: LockManager,

    /// True between the journal-header write that opens a transaction and
    /// the database sync that commits it.
    pub txn_active: bool,

    /// Page index recorded for each journal entry, in journal order.
    /// Maintained on the database entry by its sibling journal's writes.
    pub journal_pages: Vec<u32>,

    /// Pages written through this handle during the active transaction.
    pub changed_pages: HashSet<u32>,

    /// Journal read cache: the page index and reconstructed bytes of the
    /// most recently served journal entry. Lives on the journal's own entry
    /// so concurrently open journals cannot evict each other.
    pub cached_page: Option<u32>,
    pub cached_entry: Vec<u8>,
}

impl FileEntry {
    pub fn new(path: String, flags: u32, kind: FileKind, block0: Block0, locks: LockManager) -> Self {
        FileEntry {
            path,
            flags,
            kind,
            block0,
            locks,
            txn_active: false,
            journal_pages: Vec::new(),
            changed_pages: HashSet::new(),
            cached_page: None,
            cached_entry: Vec::new(),
        }
    }
}
