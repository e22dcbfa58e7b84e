use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::Durability;
use crate::error::{Error, VfsResult};
use crate::kvs::engine::{Kvs, KvsTxn, TxnMode};
use crate::kvs::{BlockIndex, BlockKey, BlockRecord, KeyRange};

/// Schema version this build writes and reads. Version 1 stores can be
/// upgraded in one step; anything else is rejected at open.
pub const SCHEMA_VERSION: u32 = 2;

/// In-memory reference store backed by a `BTreeMap`, shared by every
/// connection that clones it. Read-write transactions run on a snapshot and
/// replay their writes atomically at commit; read-only transactions read
/// through to the latest committed state. Favors clarity over throughput;
/// hosts bind their real store behind the same traits.
#[derive(Debug)]
pub struct Memory {
    shared: Arc<Mutex<Shared>>,
}

#[derive(Debug)]
struct Shared {
    records: BTreeMap<BlockKey, BlockRecord>,
    schema_version: u32,
    upgraded_from: Option<u32>,
    sync_count: u64,
}

impl Memory {
    /// Creates an empty store at the current schema version.
    pub fn new() -> Self {
        Self::open_at(SCHEMA_VERSION).expect("current schema version always opens")
    }

    /// Opens a store whose persisted schema is `version`, applying the
    /// one-step upgrade when exactly one version behind.
    pub fn open_at(version: u32) -> VfsResult<Self> {
        let upgraded_from = match version {
            SCHEMA_VERSION => None,
            v if v + 1 == SCHEMA_VERSION => {
                log::info!("upgrading block store schema v{v} -> v{SCHEMA_VERSION}");
                Some(v)
            }
            v => return Err(Error::Schema { found: v, supported: SCHEMA_VERSION }),
        };
        Ok(Memory {
            shared: Arc::new(Mutex::new(Shared {
                records: BTreeMap::new(),
                schema_version: SCHEMA_VERSION,
                upgraded_from,
                sync_count: 0,
            })),
        })
    }

    /// Number of page records stored under `name`, all versions counted,
    /// purge record excluded.
    pub fn records_for(&self, name: &str) -> usize {
        let shared = self.shared.lock().unwrap();
        shared
            .records
            .keys()
            .filter(|k| k.name == name && matches!(k.index, BlockIndex::Page(_)))
            .count()
    }

    pub fn has_purge_record(&self, name: &str) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.records.keys().any(|k| k.name == name && k.index == BlockIndex::Purge)
    }

    /// How many durability barriers have been requested.
    pub fn sync_count(&self) -> u64 {
        self.shared.lock().unwrap().sync_count
    }

    pub fn upgraded_from(&self) -> Option<u32> {
        self.shared.lock().unwrap().upgraded_from
    }
}

impl Clone for Memory {
    fn clone(&self) -> Self {
        Memory { shared: self.shared.clone() }
    }
}

impl std::fmt::Display for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory")
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Kvs for Memory {
    type Txn = MemoryTxn;

    fn begin(&self, mode: TxnMode, _durability: Durability) -> VfsResult<MemoryTxn> {
        let snapshot = match mode {
            TxnMode::ReadWrite => self.shared.lock().unwrap().records.clone(),
            TxnMode::ReadOnly => BTreeMap::new(),
        };
        Ok(MemoryTxn { shared: self.shared.clone(), mode, snapshot, ops: Vec::new() })
    }

    async fn sync(&self) -> VfsResult<()> {
        self.shared.lock().unwrap().sync_count += 1;
        Ok(())
    }

    fn schema_version(&self) -> u32 {
        self.shared.lock().unwrap().schema_version
    }
}

enum WriteOp {
    Put(BlockRecord),
    Delete(BlockKey),
    DeleteRange(KeyRange),
}

pub struct MemoryTxn {
    shared: Arc<Mutex<Shared>>,
    mode: TxnMode,
    /// Committed state as of `begin`, with this transaction's own writes
    /// applied on top. Read-write mode only.
    snapshot: BTreeMap<BlockKey, BlockRecord>,
    ops: Vec<WriteOp>,
}

impl MemoryTxn {
    fn with_view<T>(&mut self, read: impl FnOnce(&BTreeMap<BlockKey, BlockRecord>) -> T) -> T {
        match self.mode {
            TxnMode::ReadWrite => read(&self.snapshot),
            TxnMode::ReadOnly => read(&self.shared.lock().unwrap().records),
        }
    }
}

fn remove_range(records: &mut BTreeMap<BlockKey, BlockRecord>, range: &KeyRange) {
    let doomed: Vec<BlockKey> = records.range(range.clone()).map(|(k, _)| k.clone()).collect();
    for key in doomed {
        records.remove(&key);
    }
}

#[async_trait]
impl KvsTxn for MemoryTxn {
    async fn first(&mut self, range: KeyRange) -> VfsResult<Option<BlockRecord>> {
        Ok(self.with_view(|records| records.range(range).next().map(|(_, r)| r.clone())))
    }

    async fn keys(&mut self, range: KeyRange) -> VfsResult<Vec<BlockKey>> {
        Ok(self.with_view(|records| records.range(range).map(|(k, _)| k.clone()).collect()))
    }

    fn put(&mut self, record: BlockRecord) {
        assert_eq!(self.mode, TxnMode::ReadWrite, "write in a read-only transaction");
        self.snapshot.insert(record.key(), record.clone());
        self.ops.push(WriteOp::Put(record));
    }

    fn delete(&mut self, key: &BlockKey) {
        assert_eq!(self.mode, TxnMode::ReadWrite, "write in a read-only transaction");
        self.snapshot.remove(key);
        self.ops.push(WriteOp::Delete(key.clone()));
    }

    fn delete_range(&mut self, range: KeyRange) {
        assert_eq!(self.mode, TxnMode::ReadWrite, "write in a read-only transaction");
        remove_range(&mut self.snapshot, &range);
        self.ops.push(WriteOp::DeleteRange(range));
    }

    async fn commit(self) -> VfsResult<()> {
        if self.mode == TxnMode::ReadOnly {
            return Ok(());
        }
        let mut shared = self.shared.lock().unwrap();
        for op in self.ops {
            match op {
                WriteOp::Put(record) => {
                    shared.records.insert(record.key(), record);
                }
                WriteOp::Delete(key) => {
                    shared.records.remove(&key);
                }
                WriteOp::DeleteRange(range) => remove_range(&mut shared.records, &range),
            }
        }
        Ok(())
    }
}
