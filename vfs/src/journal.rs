//! Zero-store rollback-journal emulation.
//!
//! The engine believes it is writing a journal file: a header sector, then a
//! stream of page entries of `page_size + 8` bytes each (4 bytes of 1-based
//! page index, the page image, 4 bytes of checksum). None of those bytes
//! need to be persisted. The header is kept in RAM on the journal's entry;
//! a page-entry write only records which page sits at which entry index on
//! the sibling database entry, and the page image and checksum are thrown
//! away. Should the engine roll back, reads reconstruct each entry
//! byte-for-byte from the pre-transaction versions of the database blocks,
//! which are still in the store because the transaction's own writes landed
//! at a decremented version and block 0 was never republished.
//!
//! A header write whose first byte is non-zero opens a fresh transaction:
//! it resets the page bookkeeping and decrements the database's in-memory
//! block-0 version so subsequent page writes land at the new version.

use bytes::{BufMut, BytesMut};
use byteorder::{BigEndian, ByteOrder};

use crate::codec;
use crate::error::{Error, VfsResult};
use crate::file::FileEntry;
use crate::kvs::engine::Kvs;
use crate::store::VersionedStore;

/// Applies a journal write. Pure bookkeeping, nothing touches the store.
pub fn write(
    journal: &mut FileEntry,
    db: &mut FileEntry,
    block_size: usize,
    buf: &[u8],
    offset: u64,
) -> VfsResult<()> {
    if buf.is_empty() {
        return Ok(());
    }
    if offset == 0 {
        if journal.block0.data.len() < buf.len() {
            journal.block0.data.resize(buf.len(), 0);
        }
        journal.block0.data[..buf.len()].copy_from_slice(buf);
        if buf[0] != 0 {
            log::debug!("journalled transaction opened on {}", db.path);
            db.journal_pages.clear();
            db.changed_pages.clear();
            db.txn_active = true;
            journal.cached_page = None;
            journal.cached_entry.clear();
            db.block0.version -= 1;
        }
    } else {
        let sector = codec::header_sector_size(&journal.block0.data) as u64;
        let entry_size = (block_size + 8) as u64;
        if sector > 0 && offset >= sector && (offset - sector) % entry_size == 0 && buf.len() >= 4 {
            let entry_index = ((offset - sector) / entry_size) as usize;
            let page = BigEndian::read_u32(&buf[0..4]);
            if page >= 1 {
                if db.journal_pages.len() <= entry_index {
                    db.journal_pages.resize(entry_index + 1, 0);
                }
                db.journal_pages[entry_index] = page - 1;
            }
        }
        // Page images and checksums are reconstructed on demand; any write
        // that is not an entry header is dropped here.
    }

    let end = offset + buf.len() as u64;
    if end > journal.block0.file_size {
        journal.block0.file_size = end;
    }
    Ok(())
}

/// Serves a journal read from the in-memory header and reconstructed page
/// entries. Two reads of the same offset yield identical bytes as long as
/// the transaction stays open.
pub async fn read<K: Kvs>(
    store: &mut VersionedStore<K>,
    journal: &mut FileEntry,
    db: &mut FileEntry,
    buf: &mut [u8],
    offset: u64,
) -> VfsResult<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let block_size = store.block_size();
    let file_size = journal.block0.file_size;
    let sector = codec::header_sector_size(&journal.block0.data) as u64;
    let entry_size = block_size + 8;

    let mut pos = offset;
    let mut out = 0;
    while out < buf.len() {
        if pos >= file_size {
            buf[out..].fill(0);
            break;
        }
        let n = if sector == 0 || pos < sector {
            // Header region.
            let region_end = std::cmp::min(if sector == 0 { file_size } else { sector }, file_size);
            let n = std::cmp::min(buf.len() - out, (region_end - pos) as usize);
            let header = &journal.block0.data;
            for i in 0..n {
                buf[out + i] = header.get((pos + i as u64) as usize).copied().unwrap_or(0);
            }
            n
        } else {
            let rel = pos - sector;
            let entry_index = (rel / entry_size as u64) as usize;
            let entry_offset = (rel % entry_size as u64) as usize;
            let page = *db.journal_pages.get(entry_index).ok_or_else(|| {
                Error::Internal(format!(
                    "journal entry {entry_index} of {} was never written",
                    journal.path
                ))
            })?;

            if journal.cached_page != Some(page) {
                journal.cached_entry = build_entry(store, journal, db, page, block_size).await?;
                journal.cached_page = Some(page);
            }
            let n = std::cmp::min(buf.len() - out, entry_size - entry_offset);
            let n = std::cmp::min(n as u64, file_size - pos) as usize;
            buf[out..out + n].copy_from_slice(&journal.cached_entry[entry_offset..entry_offset + n]);
            n
        };
        pos += n as u64;
        out += n;
    }

    if file_size.saturating_sub(offset) < buf.len() as u64 {
        return Err(Error::ShortRead);
    }
    Ok(())
}

/// Reconstructs one page entry: 1-based index, the pre-transaction page
/// image, and the checksum seeded from the header nonce.
async fn build_entry<K: Kvs>(
    store: &mut VersionedStore<K>,
    journal: &FileEntry,
    db: &FileEntry,
    page: u32,
    block_size: usize,
) -> VfsResult<Vec<u8>> {
    let image = store.page_before(&db.path, page, db.block0.version).await?;
    let nonce = codec::header_nonce(&journal.block0.data);

    let mut entry = BytesMut::with_capacity(block_size + 8);
    entry.put_u32(page + 1);
    match image {
        Some(record) => {
            entry.put_slice(&record.data);
            if record.data.len() < block_size {
                entry.put_bytes(0, block_size - record.data.len());
            }
        }
        None => entry.put_bytes(0, block_size),
    }
    let checksum = codec::journal_checksum(&entry[4..4 + block_size], nonce, block_size);
    entry.put_u32(checksum);
    Ok(entry.to_vec())
}
