//! Versioned block storage for database files.
//!
//! Every write lands at the file's current in-memory version; every read
//! resolves "the newest version no newer than mine" with a single ascending
//! range scan, because versions are stored more-negative-is-newer. Block 0
//! is special on both paths: it is served from and mutated in the cached
//! copy, and only [`VersionedStore::sync`] publishes it. Since the newest
//! committed block-0 record defines which versions of every other block are
//! visible, that publish is the file's atomic commit point: pages written
//! at a decremented version beforehand are invisible garbage until it lands,
//! and stay invisible garbage if it never does.
//!
//! The garbage is reclaimed two ways: the purge record accumulated here at
//! commit feeds the deferred purge task, and the RESERVED-lock cleanup sweep
//! removes versions newer than the published block 0 that an aborted writer
//! left behind.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec;
use crate::config::Durability;
use crate::error::{Error, VfsResult};
use crate::file::{Block0, FileEntry};
use crate::kvs::batch::KvsAdaptor;
use crate::kvs::engine::{Kvs, KvsTxn, TxnMode};
use crate::kvs::{
    at_or_older, block_range, file_range, older_than, pages_from, purge_key, purge_range,
    BlockIndex, BlockRecord, Version,
};

pub struct VersionedStore<K: Kvs> {
    adaptor: KvsAdaptor<K>,
    block_size: usize,
}

impl<K: Kvs> VersionedStore<K> {
    pub fn new(kvs: Arc<K>, durability: Durability, block_size: usize) -> Self {
        VersionedStore { adaptor: KvsAdaptor::new(kvs, durability), block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn kvs(&self) -> Arc<K> {
        self.adaptor.kvs()
    }

    /// Loads the newest committed block 0 of `name`, if the file exists.
    pub async fn load_block0(&mut self, name: &str) -> VfsResult<Option<Block0>> {
        let txn = self.adaptor.txn(TxnMode::ReadOnly).await?;
        Ok(txn.first(block_range(name, 0)).await?.map(|record| Block0 {
            file_size: record.file_size.unwrap_or(record.data.len() as u64),
            version: record.version,
            data: record.data,
        }))
    }

    /// Creates a zero-filled block 0 for a fresh file and, when `persist` is
    /// set, commits it so other connections can observe the file.
    pub async fn create_block0(&mut self, name: &str, persist: bool) -> VfsResult<Block0> {
        let block0 = Block0 { data: vec![0; self.block_size], file_size: 0, version: 0 };
        if persist {
            let record = block0_record(name, &block0);
            self.adaptor.txn(TxnMode::ReadWrite).await?.put(record);
            self.adaptor.flush().await?;
        }
        Ok(block0)
    }

    /// Whether any block-0 record exists under `name`.
    pub async fn exists(&mut self, name: &str) -> VfsResult<bool> {
        let txn = self.adaptor.txn(TxnMode::ReadOnly).await?;
        Ok(txn.first(block_range(name, 0)).await?.is_some())
    }

    /// Removes every record stored under `name`. With `sync_dir` the removal
    /// is awaited through the durability barrier.
    pub async fn delete_file(&mut self, name: &str, sync_dir: bool) -> VfsResult<()> {
        self.adaptor.txn(TxnMode::ReadWrite).await?.delete_range(file_range(name));
        if sync_dir {
            self.adaptor.sync().await?;
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes at `offset`. A read extending past the file
    /// end zero-fills the tail and reports [`Error::ShortRead`].
    pub async fn read(&mut self, file: &mut FileEntry, buf: &mut [u8], offset: u64) -> VfsResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset < self.block_size as u64 {
            self.reconcile_block0(file).await?;
        }
        let file_size = file.block0.file_size;
        let version = file.block0.version;
        let mut short = false;

        for span in codec::spans(offset, buf.len(), self.block_size) {
            let dst = &mut buf[span.buf_offset..span.buf_offset + span.len];
            let start = span.index as u64 * self.block_size as u64 + span.offset as u64;
            if start >= file_size {
                dst.fill(0);
                short = true;
                continue;
            }
            let avail = std::cmp::min(span.len as u64, file_size - start) as usize;

            if span.index == 0 {
                copy_padded(dst, &file.block0.data, span.offset, avail);
            } else {
                let txn = self.adaptor.txn(TxnMode::ReadOnly).await?;
                match txn.first(at_or_older(&file.path, span.index, version)).await? {
                    Some(record) => copy_padded(dst, &record.data, span.offset, avail),
                    None => {
                        // Hole left by a truncate-then-extend; reads as zeros.
                        log::debug!("missing block {} of {}", span.index, file.path);
                        dst[..avail].fill(0);
                    }
                }
            }
            if avail < span.len {
                dst[avail..].fill(0);
                short = true;
            }
        }
        if short {
            return Err(Error::ShortRead);
        }
        Ok(())
    }

    /// Writes `buf` at `offset`.
    ///
    /// An aligned whole-block write is enqueued directly at the current
    /// version and returns as soon as it is on the open transaction, except
    /// for block 0, which is only mutated in memory until sync. Anything
    /// else falls back to read-modify-write over each touched block, within
    /// one transaction.
    pub async fn write(&mut self, file: &mut FileEntry, buf: &[u8], offset: u64) -> VfsResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let bs = self.block_size;
        let version = file.block0.version;

        if offset % bs as u64 == 0 && buf.len() == bs {
            // Fast path: one full block.
            let index = (offset / bs as u64) as u32;
            if index == 0 {
                file.block0.data.clear();
                file.block0.data.extend_from_slice(buf);
            } else {
                let record = BlockRecord {
                    name: file.path.clone(),
                    index: BlockIndex::Page(index),
                    version,
                    data: buf.to_vec(),
                    file_size: None,
                };
                self.adaptor.txn(TxnMode::ReadWrite).await?.put(record);
            }
            if file.txn_active {
                file.changed_pages.insert(index);
            }
        } else {
            let spans: Vec<codec::Span> = codec::spans(offset, buf.len(), bs).collect();
            for span in &spans {
                let src = &buf[span.buf_offset..span.buf_offset + span.len];
                if span.index == 0 {
                    if file.block0.data.len() < bs {
                        file.block0.data.resize(bs, 0);
                    }
                    file.block0.data[span.offset..span.offset + span.len].copy_from_slice(src);
                } else {
                    let txn = self.adaptor.txn(TxnMode::ReadWrite).await?;
                    let existing =
                        txn.first(at_or_older(&file.path, span.index, version)).await?;
                    let mut data = existing.map(|r| r.data).unwrap_or_default();
                    if data.len() < bs {
                        data.resize(bs, 0);
                    }
                    data[span.offset..span.offset + span.len].copy_from_slice(src);
                    txn.put(BlockRecord {
                        name: file.path.clone(),
                        index: BlockIndex::Page(span.index),
                        version,
                        data,
                        file_size: None,
                    });
                }
                if file.txn_active {
                    file.changed_pages.insert(span.index);
                }
            }
        }

        let end = offset + buf.len() as u64;
        if end > file.block0.file_size {
            file.block0.file_size = end;
        }
        Ok(())
    }

    /// Shrinks the file to `size`. Growing is a no-op: extension happens by
    /// writing past the end, without materializing blocks.
    pub async fn truncate(&mut self, file: &mut FileEntry, size: u64) -> VfsResult<()> {
        if size >= file.block0.file_size {
            return Ok(());
        }
        file.block0.file_size = size;
        let bs = self.block_size as u64;
        let first_dropped = std::cmp::max(1, size.div_ceil(bs)) as u32;
        let name = file.path.clone();
        let record = block0_record(&name, &file.block0);

        let txn = self.adaptor.txn(TxnMode::ReadWrite).await?;
        txn.put(record);
        txn.delete_range(pages_from(&name, first_dropped));
        // Thresholds for deleted pages would make a later purge sweep ranges
        // that no longer exist; drop them now.
        if let Some(purge) = txn.first(purge_range(&name)).await? {
            let mut map: BTreeMap<u32, Version> = bincode::deserialize(&purge.data)?;
            let before = map.len();
            map.retain(|page, _| *page < first_dropped);
            if map.len() != before {
                txn.put(BlockRecord {
                    name: name.clone(),
                    index: BlockIndex::Purge,
                    version: 0,
                    data: bincode::serialize(&map)?,
                    file_size: None,
                });
            }
        }
        Ok(())
    }

    /// Commits the file's state.
    ///
    /// Publishes the cached block 0 (the atomic commit point), folds the
    /// journalled-and-changed pages of a finishing transaction into the
    /// purge record, commits, and awaits durability unless relaxed. Returns
    /// the purge record's entry count when a transaction was committed, so
    /// the caller can decide whether a purge is worth scheduling.
    pub async fn sync(&mut self, file: &mut FileEntry) -> VfsResult<Option<usize>> {
        let name = file.path.clone();
        if file.block0.data.len() < self.block_size {
            file.block0.data.resize(self.block_size, 0);
        }
        let mut purge_entries = None;

        let txn = self.adaptor.txn(TxnMode::ReadWrite).await?;
        txn.put(block0_record(&name, &file.block0));

        if file.txn_active {
            let mut map: BTreeMap<u32, Version> = match txn.first(purge_range(&name)).await? {
                Some(record) => bincode::deserialize(&record.data)?,
                None => BTreeMap::new(),
            };
            for page in file.journal_pages.iter().filter(|p| file.changed_pages.contains(*p)) {
                // Anything older than the version published above is now
                // reclaimable for this page.
                map.insert(*page, file.block0.version);
            }
            txn.put(BlockRecord {
                name: name.clone(),
                index: BlockIndex::Purge,
                version: 0,
                data: bincode::serialize(&map)?,
                file_size: None,
            });
            purge_entries = Some(map.len());
            file.txn_active = false;
            file.changed_pages.clear();
            file.journal_pages.clear();
        }

        self.adaptor.sync().await?;
        Ok(purge_entries)
    }

    /// RESERVED-lock cleanup: removes every version newer than the published
    /// block 0. Runs when a writer reaches RESERVED, so versions left by an
    /// abandoned transaction are gone before this writer reads or writes.
    pub async fn reserved_cleanup(&mut self, file: &mut FileEntry) -> VfsResult<()> {
        let name = file.path.clone();
        let txn = self.adaptor.txn(TxnMode::ReadWrite).await?;
        let Some(published) = txn.first(block_range(&name, 0)).await?.map(|r| r.version) else {
            return Ok(());
        };
        let mut swept = 0;
        for key in txn.keys(file_range(&name)).await? {
            if key.version < published && matches!(key.index, BlockIndex::Page(_)) {
                txn.delete(&key);
                swept += 1;
            }
        }
        if swept > 0 {
            log::info!("dropped {swept} uncommitted block versions of {name}");
        }
        Ok(())
    }

    /// Pre-transaction image of `page`: the newest version strictly older
    /// than `version`. The journal emulator reconstructs entries from this.
    pub async fn page_before(
        &mut self,
        name: &str,
        page: u32,
        version: Version,
    ) -> VfsResult<Option<BlockRecord>> {
        let txn = self.adaptor.txn(TxnMode::ReadOnly).await?;
        txn.first(older_than(name, page, version)).await
    }

    /// Commits any open transaction without a durability barrier.
    pub async fn flush(&mut self) -> VfsResult<()> {
        self.adaptor.flush().await
    }

    /// Adopts the stored block 0 when it is newer than the cached one,
    /// which happens after another connection commits.
    async fn reconcile_block0(&mut self, file: &mut FileEntry) -> VfsResult<()> {
        let txn = self.adaptor.txn(TxnMode::ReadOnly).await?;
        if let Some(stored) = txn.first(block_range(&file.path, 0)).await? {
            if stored.version < file.block0.version {
                file.block0 = Block0 {
                    file_size: stored.file_size.unwrap_or(stored.data.len() as u64),
                    version: stored.version,
                    data: stored.data,
                };
            }
        }
        Ok(())
    }
}

fn block0_record(name: &str, block0: &Block0) -> BlockRecord {
    BlockRecord {
        name: name.to_string(),
        index: BlockIndex::Page(0),
        version: block0.version,
        data: block0.data.clone(),
        file_size: Some(block0.file_size),
    }
}

fn copy_padded(dst: &mut [u8], src: &[u8], offset: usize, avail: usize) {
    let have = src.len().saturating_sub(offset).min(avail);
    dst[..have].copy_from_slice(&src[offset..offset + have]);
    if have < avail {
        dst[have..avail].fill(0);
    }
}

/// Reads the purge record and deletes, for every page it names, all versions
/// strictly older than the recorded threshold, then drops the record. The
/// whole sweep runs in one read-modify-write transaction.
pub(crate) async fn run_purge<K: Kvs>(
    kvs: &K,
    durability: Durability,
    name: &str,
) -> VfsResult<usize> {
    let mut txn = kvs.begin(TxnMode::ReadWrite, durability)?;
    let Some(record) = txn.first(purge_range(name)).await? else {
        return Ok(0);
    };
    let map: BTreeMap<u32, Version> = bincode::deserialize(&record.data)?;
    let pages = map.len();
    for (page, threshold) in map {
        txn.delete_range(older_than(name, page, threshold));
    }
    txn.delete(&purge_key(name));
    txn.commit().await?;
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileKind;
    use crate::kvs::memory::Memory;
    use crate::lock::{LockManager, LockService};
    use pretty_assertions::assert_eq;

    const BS: usize = 4096;

    struct Fixture {
        kvs: Arc<Memory>,
        store: VersionedStore<Memory>,
    }

    impl Fixture {
        fn new() -> Self {
            let kvs = Arc::new(Memory::new());
            let store = VersionedStore::new(kvs.clone(), Durability::Default, BS);
            Fixture { kvs, store }
        }

        async fn open(&mut self, name: &str) -> FileEntry {
            let block0 = self.store.create_block0(name, true).await.unwrap();
            let locks = LockManager::new(Arc::new(LockService::new()), name.to_string());
            FileEntry::new(name.to_string(), 0, FileKind::Database, block0, locks)
        }
    }

    fn block(byte: u8) -> Vec<u8> {
        vec![byte; BS]
    }

    #[tokio::test]
    async fn whole_block_round_trip() -> VfsResult<()> {
        let mut fx = Fixture::new();
        let mut file = fx.open("/db").await;

        fx.store.write(&mut file, &block(1), 0).await?;
        fx.store.write(&mut file, &block(2), BS as u64).await?;
        assert_eq!(file.block0.file_size, 2 * BS as u64);

        let mut buf = vec![0u8; 2 * BS];
        fx.store.read(&mut file, &mut buf, 0).await?;
        assert_eq!(&buf[..BS], &block(1)[..]);
        assert_eq!(&buf[BS..], &block(2)[..]);
        Ok(())
    }

    #[tokio::test]
    async fn misaligned_write_read_modifies_in_place() -> VfsResult<()> {
        let mut fx = Fixture::new();
        let mut file = fx.open("/db").await;
        fx.store.write(&mut file, &block(1), 0).await?;
        fx.store.write(&mut file, &block(2), BS as u64).await?;

        // Straddle the block boundary.
        fx.store.write(&mut file, &[9u8; 100], BS as u64 - 50).await?;

        let mut buf = vec![0u8; 2 * BS];
        fx.store.read(&mut file, &mut buf, 0).await?;
        assert!(buf[..BS - 50].iter().all(|b| *b == 1));
        assert!(buf[BS - 50..BS + 50].iter().all(|b| *b == 9));
        assert!(buf[BS + 50..2 * BS].iter().all(|b| *b == 2));
        Ok(())
    }

    #[tokio::test]
    async fn short_read_zero_fills_the_tail() -> VfsResult<()> {
        let mut fx = Fixture::new();
        let mut file = fx.open("/db").await;
        fx.store.write(&mut file, &[5u8; 10], 0).await?;

        let mut buf = vec![0xffu8; 20];
        assert_eq!(fx.store.read(&mut file, &mut buf, 5).await, Err(Error::ShortRead));
        assert_eq!(&buf[..5], &[5u8; 5]);
        assert_eq!(&buf[5..], &[0u8; 15]);

        // Entirely past the end.
        let mut buf = vec![0xffu8; 8];
        assert_eq!(fx.store.read(&mut file, &mut buf, 100).await, Err(Error::ShortRead));
        assert_eq!(buf, vec![0u8; 8]);

        // Zero-length reads are no-ops even past the end.
        fx.store.read(&mut file, &mut [], 100).await?;
        Ok(())
    }

    #[tokio::test]
    async fn block0_publishes_only_on_sync() -> VfsResult<()> {
        let mut fx = Fixture::new();
        let mut file = fx.open("/db").await;

        fx.store.write(&mut file, &block(7), 0).await?;
        fx.store.flush().await?;
        // The store still holds the zero-filled creation block.
        let stored = fx.store.load_block0("/db").await?.unwrap();
        assert_eq!(stored.data, block(0));

        fx.store.sync(&mut file).await?;
        let stored = fx.store.load_block0("/db").await?.unwrap();
        assert_eq!(stored.data, block(7));
        assert_eq!(stored.file_size, BS as u64);
        Ok(())
    }

    #[tokio::test]
    async fn truncate_drops_blocks_and_purge_thresholds() -> VfsResult<()> {
        let mut fx = Fixture::new();
        let mut file = fx.open("/db").await;
        for i in 0..4u8 {
            fx.store.write(&mut file, &block(i + 1), i as u64 * BS as u64).await?;
        }
        fx.store.sync(&mut file).await?;

        // Growing is a no-op.
        fx.store.truncate(&mut file, 10 * BS as u64).await?;
        assert_eq!(file.block0.file_size, 4 * BS as u64);

        fx.store.truncate(&mut file, 2 * BS as u64).await?;
        fx.store.sync(&mut file).await?;
        assert_eq!(file.block0.file_size, 2 * BS as u64);
        assert_eq!(fx.kvs.records_for("/db"), 2);

        let mut buf = vec![0u8; BS];
        assert_eq!(
            fx.store.read(&mut file, &mut buf, 2 * BS as u64).await,
            Err(Error::ShortRead)
        );
        Ok(())
    }

    #[tokio::test]
    async fn reserved_cleanup_sweeps_abandoned_versions() -> VfsResult<()> {
        let mut fx = Fixture::new();
        let mut file = fx.open("/db").await;
        fx.store.write(&mut file, &block(1), BS as u64).await?;
        fx.store.sync(&mut file).await?;
        assert_eq!(fx.kvs.records_for("/db"), 2);

        // An abandoned transaction left a page at a newer (smaller) version
        // than the published block 0 and never committed.
        file.block0.version -= 1;
        fx.store.write(&mut file, &block(9), BS as u64).await?;
        fx.store.flush().await?;
        assert_eq!(fx.kvs.records_for("/db"), 3);

        fx.store.reserved_cleanup(&mut file).await?;
        fx.store.flush().await?;
        assert_eq!(fx.kvs.records_for("/db"), 2);
        Ok(())
    }

    #[tokio::test]
    async fn sync_records_purgeable_pages_and_purge_reclaims_them() -> VfsResult<()> {
        let mut fx = Fixture::new();
        let mut file = fx.open("/db").await;
        fx.store.write(&mut file, &block(1), BS as u64).await?;
        fx.store.sync(&mut file).await?;

        // A journalled transaction rewrites page 1.
        file.txn_active = true;
        file.journal_pages = vec![1];
        file.block0.version -= 1;
        fx.store.write(&mut file, &block(2), BS as u64).await?;
        let entries = fx.store.sync(&mut file).await?;
        assert_eq!(entries, Some(1));
        assert!(!file.txn_active);

        // Both versions of page 1 exist until the purge runs.
        assert_eq!(fx.kvs.records_for("/db"), 4);
        assert!(fx.kvs.has_purge_record("/db"));
        let swept = run_purge(fx.kvs.as_ref(), Durability::Default, "/db").await?;
        assert_eq!(swept, 1);
        assert_eq!(fx.kvs.records_for("/db"), 3);
        assert!(!fx.kvs.has_purge_record("/db"));

        // The surviving version of page 1 is the committed rewrite.
        let mut buf = vec![0u8; BS];
        fx.store.read(&mut file, &mut buf, BS as u64).await?;
        assert_eq!(buf, block(2));
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_adopts_a_newer_committed_block0() -> VfsResult<()> {
        let kvs = Arc::new(Memory::new());
        let mut store_a = VersionedStore::new(kvs.clone(), Durability::Default, BS);
        let mut store_b = VersionedStore::new(kvs.clone(), Durability::Default, BS);

        let block0 = store_a.create_block0("/db", true).await?;
        let locks = || LockManager::new(Arc::new(LockService::new()), "/db".to_string());
        let mut a = FileEntry::new("/db".into(), 0, FileKind::Database, block0, locks());

        let loaded = store_b.load_block0("/db").await?.unwrap();
        let mut b = FileEntry::new("/db".into(), 0, FileKind::Database, loaded, locks());

        // A commits a new version while b's cache still points at version 0.
        a.block0.version -= 1;
        store_a.write(&mut a, &block(3), 0).await?;
        store_a.write(&mut a, &block(4), BS as u64).await?;
        store_a.sync(&mut a).await?;

        let mut buf = vec![0u8; BS];
        store_b.read(&mut b, &mut buf, 0).await?;
        assert_eq!(buf, block(3));
        assert_eq!(b.block0.version, a.block0.version);
        assert_eq!(b.block0.file_size, 2 * BS as u64);
        Ok(())
    }
}
