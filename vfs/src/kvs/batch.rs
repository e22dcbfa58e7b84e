use std::sync::Arc;

use crate::config::Durability;
use crate::error::VfsResult;
use crate::kvs::engine::{Kvs, KvsTxn, TxnMode};

/// Batches VFS operations onto shared store transactions.
///
/// The engine emits many tiny reads and writes per page; opening a store
/// transaction per operation would be prohibitive. The adaptor instead keeps
/// at most one transaction open and hands it out to every operation that is
/// scheduled before it completes:
///
/// - a request at the same or weaker mode joins the open transaction, so a
///   read issued after an enqueued write observes that write;
/// - a read-write request while a read-only transaction is open commits the
///   read-only one and opens a fresh read-write transaction;
/// - [`KvsAdaptor::sync`] commits the open transaction and, unless the
///   durability option is `Relaxed`, awaits the store's durability barrier.
///
/// A commit failure surfaces as an error from the operation that forced the
/// commit; nothing is retried.
pub struct KvsAdaptor<K: Kvs> {
    kvs: Arc<K>,
    durability: Durability,
    current: Option<(TxnMode, K::Txn)>,
}

impl<K: Kvs> KvsAdaptor<K> {
    pub fn new(kvs: Arc<K>, durability: Durability) -> Self {
        KvsAdaptor { kvs, durability, current: None }
    }

    /// The transaction every pending operation of `mode` coalesces into.
    pub async fn txn(&mut self, mode: TxnMode) -> VfsResult<&mut K::Txn> {
        let needs_upgrade = matches!(&self.current, Some((current, _)) if mode > *current);
        if needs_upgrade {
            // Upgrade: retire the read-only transaction first.
            let (_, txn) = self.current.take().expect("transaction present");
            txn.commit().await?;
        }
        if self.current.is_none() {
            self.current = Some((mode, self.kvs.begin(mode, self.durability)?));
        }
        Ok(&mut self.current.as_mut().expect("transaction present").1)
    }

    /// Commits the open transaction without a durability barrier.
    pub async fn flush(&mut self) -> VfsResult<()> {
        if let Some((_, txn)) = self.current.take() {
            txn.commit().await?;
        }
        Ok(())
    }

    /// Commits the open transaction and waits for durability, except under
    /// `Relaxed` durability where the explicit barrier is skipped.
    pub async fn sync(&mut self) -> VfsResult<()> {
        self.flush().await?;
        if self.durability != Durability::Relaxed {
            self.kvs.sync().await?;
        }
        Ok(())
    }

    pub fn kvs(&self) -> Arc<K> {
        self.kvs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvs::memory::Memory;
    use crate::kvs::{block_range, BlockIndex, BlockRecord};

    fn record(page: u32, version: i64) -> BlockRecord {
        BlockRecord {
            name: "/f".to_string(),
            index: BlockIndex::Page(page),
            version,
            data: vec![page as u8; 4],
            file_size: None,
        }
    }

    #[tokio::test]
    async fn reads_join_the_open_write_transaction() -> VfsResult<()> {
        let store = Arc::new(Memory::new());
        let mut adaptor = KvsAdaptor::new(store.clone(), Durability::Default);

        adaptor.txn(TxnMode::ReadWrite).await?.put(record(1, 0));
        // Not committed yet: the shared store has no record.
        assert_eq!(store.records_for("/f"), 0);
        // A read scheduled now still sees the enqueued write.
        let seen = adaptor.txn(TxnMode::ReadOnly).await?.first(block_range("/f", 1)).await?;
        assert!(seen.is_some());

        adaptor.sync().await?;
        assert_eq!(store.records_for("/f"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn upgrade_commits_the_read_only_transaction() -> VfsResult<()> {
        let store = Arc::new(Memory::new());
        let mut adaptor = KvsAdaptor::new(store.clone(), Durability::Default);

        assert!(adaptor.txn(TxnMode::ReadOnly).await?.first(block_range("/f", 1)).await?.is_none());
        adaptor.txn(TxnMode::ReadWrite).await?.put(record(1, 0));
        adaptor.flush().await?;
        assert_eq!(store.records_for("/f"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn relaxed_durability_skips_the_barrier() -> VfsResult<()> {
        let store = Arc::new(Memory::new());

        let mut strict = KvsAdaptor::new(store.clone(), Durability::Default);
        strict.txn(TxnMode::ReadWrite).await?.put(record(1, 0));
        strict.sync().await?;
        assert_eq!(store.sync_count(), 1);

        let mut relaxed = KvsAdaptor::new(store.clone(), Durability::Relaxed);
        relaxed.txn(TxnMode::ReadWrite).await?.put(record(2, 0));
        relaxed.sync().await?;
        // Committed, but no second barrier was requested.
        assert_eq!(store.records_for("/f"), 2);
        assert_eq!(store.sync_count(), 1);
        Ok(())
    }
}
