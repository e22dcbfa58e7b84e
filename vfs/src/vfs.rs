//! Engine-facing operations.
//!
//! Every entry point takes a file id or name, performs the operation through
//! the versioned store or the journal emulator depending on the file kind,
//! and reports one of the engine's status integers. Typed errors stop here:
//! they are logged and mapped, never thrown across the boundary. The one
//! exception is handing in a file id that was never opened: that is a bug
//! in the caller, and it panics rather than being masked as an I/O error.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use crate::config::VfsOptions;
use crate::error::{Error, VfsResult};
use crate::file::{FileEntry, FileKind};
use crate::journal;
use crate::kvs::engine::Kvs;
use crate::lock::{LockLevel, LockManager, LockService};
use crate::purge::PurgeScheduler;
use crate::store::VersionedStore;

// Status integers, as the engine defines them.
pub const OK: i32 = 0;
pub const BUSY: i32 = 5;
pub const IOERR: i32 = 10;
pub const CANTOPEN: i32 = 14;
pub const IOERR_SHORT_READ: i32 = IOERR | (2 << 8);

// Open flags of interest.
pub const OPEN_READONLY: u32 = 0x1;
pub const OPEN_READWRITE: u32 = 0x2;
pub const OPEN_CREATE: u32 = 0x4;
pub const OPEN_DELETEONCLOSE: u32 = 0x8;
pub const OPEN_MAIN_DB: u32 = 0x100;
pub const OPEN_MAIN_JOURNAL: u32 = 0x800;
pub const OPEN_TEMP_JOURNAL: u32 = 0x1000;

// Device characteristics.
pub const IOCAP_SAFE_APPEND: u32 = 0x200;
pub const IOCAP_SEQUENTIAL: u32 = 0x400;
pub const IOCAP_UNDELETABLE_WHEN_OPEN: u32 = 0x800;

const JOURNAL_SUFFIX: &str = "-journal";

const NO_SUCH_FILE: &str = "operation on a file id that was never opened";

/// The virtual file system: block-granular, versioned storage for database
/// files and synthesized rollback journals, over one shared key/value store.
///
/// One `Vfs` is one engine connection. Connections in the same group share
/// the store and the lock service; mutual exclusion between them is entirely
/// the lock manager's business.
pub struct Vfs<K: Kvs> {
    store: VersionedStore<K>,
    purge: PurgeScheduler<K>,
    lock_service: Arc<LockService>,
    files: HashMap<u64, RefCell<FileEntry>>,
    options: VfsOptions,
}

impl<K: Kvs> Vfs<K> {
    pub fn new(kvs: Arc<K>, lock_service: Arc<LockService>, options: VfsOptions) -> Self {
        log::info!("opening vfs connection, block store schema v{}", kvs.schema_version());
        let store = VersionedStore::new(kvs.clone(), options.durability, options.block_size);
        let purge =
            PurgeScheduler::new(kvs, options.purge, options.purge_at_least, options.durability);
        Vfs { store, purge, lock_service, files: HashMap::new(), options }
    }

    /// Opens `name` under `file_id`. Missing files are created when the
    /// CREATE flag is set; otherwise the open fails with *cannot-open*.
    pub async fn open(&mut self, name: &str, file_id: u64, flags: u32, out_flags: &mut u32) -> i32 {
        match self.do_open(name, file_id, flags).await {
            Ok(()) => {
                *out_flags = flags;
                OK
            }
            Err(err) => {
                log::warn!("open of {name} failed: {err}");
                err.status()
            }
        }
    }

    pub async fn close(&mut self, file_id: u64) -> i32 {
        let cell = self.files.remove(&file_id).expect("close of a file id that was never opened");
        let entry = cell.into_inner();
        if entry.flags & OPEN_DELETEONCLOSE != 0 {
            if let Err(err) = self.store.delete_file(&entry.path, false).await {
                log::error!("delete-on-close of {} failed: {err}", entry.path);
                return err.status();
            }
        }
        OK
    }

    /// Fills `buf` from the file at `offset`. A read past the end of the
    /// file zero-fills the tail and reports *short-read*.
    pub async fn read(&mut self, file_id: u64, buf: &mut [u8], offset: u64) -> i32 {
        let cell = self.files.get(&file_id).expect(NO_SUCH_FILE);
        let kind = cell.borrow().kind;
        let result = match kind {
            FileKind::Database => self.store.read(&mut cell.borrow_mut(), buf, offset).await,
            FileKind::Journal => {
                let path = cell.borrow().path.clone();
                match database_for(&self.files, &path) {
                    Ok(db) => {
                        journal::read(
                            &mut self.store,
                            &mut cell.borrow_mut(),
                            &mut db.borrow_mut(),
                            buf,
                            offset,
                        )
                        .await
                    }
                    Err(err) => Err(err),
                }
            }
        };
        match result {
            Ok(()) => OK,
            Err(Error::ShortRead) => IOERR_SHORT_READ,
            Err(err) => {
                log::error!("read at {offset} failed: {err}");
                err.status()
            }
        }
    }

    pub async fn write(&mut self, file_id: u64, buf: &[u8], offset: u64) -> i32 {
        let cell = self.files.get(&file_id).expect(NO_SUCH_FILE);
        let kind = cell.borrow().kind;
        let result = match kind {
            FileKind::Database => self.store.write(&mut cell.borrow_mut(), buf, offset).await,
            FileKind::Journal => {
                let path = cell.borrow().path.clone();
                match database_for(&self.files, &path) {
                    Ok(db) => journal::write(
                        &mut cell.borrow_mut(),
                        &mut db.borrow_mut(),
                        self.options.block_size,
                        buf,
                        offset,
                    ),
                    Err(err) => Err(err),
                }
            }
        };
        status_of(result, "write")
    }

    /// Shrinks the file. Growing beyond the current size is a no-op.
    pub async fn truncate(&mut self, file_id: u64, size: u64) -> i32 {
        let cell = self.files.get(&file_id).expect(NO_SUCH_FILE);
        let kind = cell.borrow().kind;
        let result = match kind {
            FileKind::Database => self.store.truncate(&mut cell.borrow_mut(), size).await,
            FileKind::Journal => {
                // Journals carry no store records; only the logical size moves.
                let mut entry = cell.borrow_mut();
                if size < entry.block0.file_size {
                    entry.block0.file_size = size;
                }
                Ok(())
            }
        };
        status_of(result, "truncate")
    }

    /// Commits a database file: publishes block 0, records purgeable
    /// versions, and awaits durability per the configured option. A no-op
    /// for journal files, whose bytes are never stored.
    pub async fn sync(&mut self, file_id: u64, _flags: u32) -> i32 {
        let cell = self.files.get(&file_id).expect(NO_SUCH_FILE);
        if cell.borrow().kind == FileKind::Journal {
            return OK;
        }
        let sync_result = self.store.sync(&mut cell.borrow_mut()).await;
        match sync_result {
            Ok(purge_entries) => {
                if let Some(entries) = purge_entries {
                    let path = cell.borrow().path.clone();
                    self.purge.maybe_schedule(&path, entries);
                }
                OK
            }
            Err(err) => {
                log::error!("sync failed: {err}");
                err.status()
            }
        }
    }

    pub fn file_size(&self, file_id: u64, out: &mut u64) -> i32 {
        let cell = self.files.get(&file_id).expect(NO_SUCH_FILE);
        *out = cell.borrow().block0.file_size;
        OK
    }

    /// Escalates the file's lock to `level`. Crossing into RESERVED also
    /// sweeps block versions a previous writer abandoned above the committed
    /// block 0.
    pub async fn lock(&mut self, file_id: u64, level: u8) -> i32 {
        let target = match LockLevel::try_from(level) {
            Ok(target) => target,
            Err(err) => return status_of(Err(err), "lock"),
        };
        let cell = self.files.get(&file_id).expect(NO_SUCH_FILE);
        let mut entry = cell.borrow_mut();
        let before = entry.locks.level();
        match entry.locks.lock(target).await {
            Ok(()) => {}
            Err(Error::Busy) => return BUSY,
            Err(err) => {
                log::error!("lock to level {level} failed: {err}");
                return err.status();
            }
        }
        if entry.kind == FileKind::Database
            && before < LockLevel::Reserved
            && entry.locks.level() >= LockLevel::Reserved
        {
            if let Err(err) = self.store.reserved_cleanup(&mut entry).await {
                log::error!("reserved-lock cleanup failed: {err}");
                return err.status();
            }
        }
        OK
    }

    /// Downgrades the file's lock to `level`. Never upgrades.
    pub async fn unlock(&mut self, file_id: u64, level: u8) -> i32 {
        let target = match LockLevel::try_from(level) {
            Ok(target) => target,
            Err(err) => return status_of(Err(err), "unlock"),
        };
        let cell = self.files.get(&file_id).expect(NO_SUCH_FILE);
        cell.borrow_mut().locks.unlock(target);
        OK
    }

    /// Whether any connection holds RESERVED or higher on this file.
    pub fn check_reserved_lock(&self, file_id: u64, out: &mut bool) -> i32 {
        let cell = self.files.get(&file_id).expect(NO_SUCH_FILE);
        *out = cell.borrow().locks.reserved();
        OK
    }

    pub fn sector_size(&self) -> i32 {
        self.options.block_size as i32
    }

    pub fn device_characteristics(&self) -> i32 {
        (IOCAP_SAFE_APPEND | IOCAP_SEQUENTIAL | IOCAP_UNDELETABLE_WHEN_OPEN) as i32
    }

    /// Probes whether `name` exists in the store.
    pub async fn access(&mut self, name: &str, _flags: u32, out: &mut bool) -> i32 {
        let path = match canonical_path(name) {
            Ok(path) => path,
            Err(err) => return status_of(Err(err), "access"),
        };
        match self.store.exists(&path).await {
            Ok(exists) => {
                *out = exists;
                OK
            }
            Err(err) => {
                log::error!("access probe of {name} failed: {err}");
                err.status()
            }
        }
    }

    /// Removes every record stored under `name`. With `sync_dir` the
    /// removal is awaited through the durability barrier.
    pub async fn delete(&mut self, name: &str, sync_dir: bool) -> i32 {
        let path = match canonical_path(name) {
            Ok(path) => path,
            Err(err) => return status_of(Err(err), "delete"),
        };
        status_of(self.store.delete_file(&path, sync_dir).await, "delete")
    }

    /// Recovery hook: releases `name`'s locks no matter which connection
    /// holds them. The abandoned holder cannot stomp the next owner.
    pub fn force_clear_lock(&self, name: &str) -> VfsResult<()> {
        let path = canonical_path(name)?;
        LockManager::force_clear(&self.lock_service, &path);
        Ok(())
    }

    /// Reclaims obsolete versions of `name` immediately. The required call
    /// under the `manual` purge policy.
    pub async fn purge(&mut self, name: &str) -> VfsResult<usize> {
        let path = canonical_path(name)?;
        // Purges read-modify-write the purge record in their own store
        // transaction; pending batched writes must land first.
        self.store.flush().await?;
        self.purge.purge(&path).await
    }

    async fn do_open(&mut self, name: &str, file_id: u64, flags: u32) -> VfsResult<()> {
        let path = canonical_path(name)?;
        let kind = if flags & (OPEN_MAIN_JOURNAL | OPEN_TEMP_JOURNAL) != 0 {
            FileKind::Journal
        } else {
            FileKind::Database
        };
        let existing = match kind {
            FileKind::Database => self.store.load_block0(&path).await?,
            // Journal bytes are never stored, so there is nothing to load.
            FileKind::Journal => None,
        };
        let block0 = match existing {
            Some(block0) => block0,
            None if flags & OPEN_CREATE != 0 => {
                self.store.create_block0(&path, kind == FileKind::Database).await?
            }
            None => return Err(Error::CannotOpen(path)),
        };
        let locks = LockManager::new(self.lock_service.clone(), path.clone());
        log::debug!("opened {path} as {kind:?} (file id {file_id})");
        self.files.insert(file_id, RefCell::new(FileEntry::new(path, flags, kind, block0, locks)));
        Ok(())
    }
}

/// Finds the open database entry a journal belongs to.
fn database_for<'a>(
    files: &'a HashMap<u64, RefCell<FileEntry>>,
    journal_path: &str,
) -> VfsResult<&'a RefCell<FileEntry>> {
    let db_path = journal_path.strip_suffix(JOURNAL_SUFFIX).unwrap_or(journal_path);
    files
        .values()
        .find(|cell| {
            let entry = cell.borrow();
            entry.kind == FileKind::Database && entry.path == db_path
        })
        .ok_or_else(|| Error::Internal(format!("no open database file for {journal_path}")))
}

/// Resolves an engine-supplied name to a canonical absolute path, so
/// relative and absolute spellings address the same file.
fn canonical_path(name: &str) -> VfsResult<String> {
    let base = Url::parse("file:///").expect("static base url");
    let url = base.join(name).map_err(|err| Error::CannotOpen(format!("{name}: {err}")))?;
    Ok(url.path().to_string())
}

fn status_of(result: VfsResult<()>, op: &str) -> i32 {
    match result {
        Ok(()) => OK,
        Err(err) => {
            log::error!("{op} failed: {err}");
            err.status()
        }
    }
}
