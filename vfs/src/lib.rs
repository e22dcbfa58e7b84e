//! `blockvfs` bridges an embedded SQL engine's POSIX-like file interface
//! onto an asynchronous key/value store that offers only transactional
//! multi-key batches, with no in-place overwrite and no byte-range I/O.
//!
//! Database files are stored as fixed-size blocks keyed
//! `(name, index, version)`, where a more negative version is newer. The
//! newest committed version of block 0 carries the file size and the
//! published version, and is the file's single atomic commit marker: pages
//! written during a journalled transaction land at a decremented version
//! and stay invisible until xSync republishes block 0. The engine's
//! rollback journal costs nothing to store: its header lives in RAM and
//! every page entry is reconstructed on demand from the pre-transaction
//! block versions still sitting in the store.
//!
//! ## Getting started
//!
//! ```
//! use std::sync::Arc;
//!
//! use blockvfs::config::VfsOptions;
//! use blockvfs::kvs::memory::Memory;
//! use blockvfs::lock::LockService;
//! use blockvfs::vfs::{self, Vfs};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let kvs = Arc::new(Memory::new());
//!     let locks = Arc::new(LockService::new());
//!     let mut fs = Vfs::new(kvs, locks, VfsOptions::default());
//!
//!     let flags = vfs::OPEN_MAIN_DB | vfs::OPEN_READWRITE | vfs::OPEN_CREATE;
//!     let mut out_flags = 0;
//!     assert_eq!(fs.open("demo.db", 1, flags, &mut out_flags).await, vfs::OK);
//!
//!     let page = vec![7u8; 4096];
//!     assert_eq!(fs.write(1, &page, 0).await, vfs::OK);
//!     assert_eq!(fs.sync(1, 0).await, vfs::OK);
//!
//!     let mut back = vec![0u8; 4096];
//!     assert_eq!(fs.read(1, &mut back, 0).await, vfs::OK);
//!     assert_eq!(back, page);
//!     assert_eq!(fs.close(1).await, vfs::OK);
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod file;
pub mod journal;
pub mod kvs;
pub mod lock;
pub mod purge;
pub mod store;
pub mod vfs;

pub use config::{Durability, PurgePolicy, VfsOptions};
pub use error::{Error, VfsResult};
pub use vfs::Vfs;
