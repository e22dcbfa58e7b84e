use async_trait::async_trait;

use crate::config::Durability;
use crate::error::VfsResult;
use crate::kvs::{BlockKey, BlockRecord, KeyRange};

/// Transaction mode. `ReadWrite` subsumes `ReadOnly`: reads scheduled while
/// a read-write transaction is open are served from that transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

/// A key/value store holding block records under the composite key
/// `(name, index, version)`, in ascending lexicographic order.
///
/// The store is asynchronous and transactional: all access goes through a
/// transaction handle obtained from [`Kvs::begin`]. Mutations are enqueued on
/// the handle and become visible to other transactions atomically at commit.
/// `sync` is the store-level durability barrier, distinct from commit.
#[async_trait]
pub trait Kvs: Send + Sync + 'static {
    type Txn: KvsTxn;

    /// Opens a transaction. The durability argument is a hint forwarded to
    /// the host store; backends may ignore it.
    fn begin(&self, mode: TxnMode, durability: Durability) -> VfsResult<Self::Txn>;

    /// Waits until previously committed transactions are durable.
    async fn sync(&self) -> VfsResult<()>;

    /// Version of the on-store schema this connection is bound to.
    fn schema_version(&self) -> u32;
}

/// One open transaction.
///
/// Reads observe the transaction's own pending writes. Write methods enqueue
/// and return immediately; failures surface at [`KvsTxn::commit`]. Dropping
/// an uncommitted transaction discards its writes.
#[async_trait]
pub trait KvsTxn: Send {
    /// First record of `range` in ascending key order, i.e. the newest
    /// version within a single `(name, index)` group.
    async fn first(&mut self, range: KeyRange) -> VfsResult<Option<BlockRecord>>;

    /// All keys of `range` in ascending order.
    async fn keys(&mut self, range: KeyRange) -> VfsResult<Vec<BlockKey>>;

    /// Inserts or replaces one record.
    fn put(&mut self, record: BlockRecord);

    /// Removes one record if present.
    fn delete(&mut self, key: &BlockKey);

    /// Removes every record in `range`.
    fn delete_range(&mut self, range: KeyRange);

    /// Atomically applies the enqueued writes.
    async fn commit(self) -> VfsResult<()>;
}
