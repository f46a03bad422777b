// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A file of equal-size cells with a free-cell linked list, as described in §4.1 of the
//! design: the storage substrate that B-tree nodes (and `SpaceManager` list nodes) are
//! persisted into.
//!
//! ```text
//! [ header: 32 bytes            ]
//! [ cell 1: 1 byte marker + entry_bytes ]
//! [ cell 2: 1 byte marker + entry_bytes ]
//! ...
//! ```
//!
//! Addresses are 1-based; address `0` means "none". Empty cells (marker `0`) thread a
//! singly-linked free list through their first 8 payload bytes; `first_space` in the
//! header is the list's head.

use crate::coding::{read_u64, write_u64};
use crate::error::{Error, Result};
use crate::page_cache::PageCache;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: u64 = 32;
const MARKER_EMPTY: u8 = 0;
const MARKER_RESERVED: u8 = 1;
const MARKER_VALID: u8 = 2;

/// Page cache sizing used unless a caller asks for a specific capacity via
/// [`EquiBlobsFile::open_with_cache`]. Every tree node this file stores is re-read far more
/// often than it is written (lookups dominate inserts/removes), so a modest read cache pays
/// for itself even for small trees.
const DEFAULT_CACHE_CAPACITY: usize = 512;

/// A file of fixed-size cells, each independently addressable and individually
/// allocatable/freeable.
///
/// Reads go through a [`PageCache`] keyed by cell address. The cache only ever holds bytes
/// already durable on disk: `store_blob`/`delete_blob` write straight through before touching
/// the cache, so a crash can never lose data the cache alone was holding. This trades away the
/// spec's "writes back lazily" framing for a strictly read-through cache — a deliberate choice
/// given the format has no write-ahead log to make deferred node writes crash-safe.
pub struct EquiBlobsFile {
    file: File,
    path: PathBuf,
    entry_bytes: usize,
    total_entries: u64,
    total_spaces: u64,
    first_entry: u64,
    first_space: u64,
    cache: PageCache<Vec<u8>>,
}

impl EquiBlobsFile {
    fn cell_len(&self) -> u64 {
        1 + self.entry_bytes as u64
    }

    fn cell_offset(&self, addr: u64) -> u64 {
        HEADER_LEN + (addr - 1) * self.cell_len()
    }

    /// Opens or creates the file at `path`, holding cells of exactly `entry_bytes` bytes, with
    /// a default-sized read cache.
    pub fn open<P: AsRef<Path>>(path: P, entry_bytes: usize) -> Result<Self> {
        Self::open_with_cache(path, entry_bytes, DEFAULT_CACHE_CAPACITY)
    }

    /// Like [`open`](Self::open), with an explicit page cache capacity.
    pub fn open_with_cache<P: AsRef<Path>>(
        path: P,
        entry_bytes: usize,
        cache_capacity: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();

        let (total_entries, total_spaces, first_entry, first_space) = if len == 0 {
            file.write_all(&[0u8; HEADER_LEN as usize])?;
            file.sync_all()?;
            (0, 0, 0, 0)
        } else {
            if len < HEADER_LEN {
                return Err(Error::Corruption(format!(
                    "{path:?}: file shorter than the header"
                )));
            }
            file.seek(SeekFrom::Start(0))?;
            let total_entries = read_u64(&mut file)?;
            let total_spaces = read_u64(&mut file)?;
            let first_entry = read_u64(&mut file)?;
            let first_space = read_u64(&mut file)?;

            let expected_len = HEADER_LEN + (total_entries + total_spaces) * (1 + entry_bytes as u64);
            if expected_len != len {
                return Err(Error::Corruption(format!(
                    "{path:?}: file size {len} does not match header-implied size {expected_len}"
                )));
            }

            (total_entries, total_spaces, first_entry, first_space)
        };

        Ok(Self {
            file,
            path,
            entry_bytes,
            total_entries,
            total_spaces,
            first_entry,
            first_space,
            cache: PageCache::new(cache_capacity),
        })
    }

    fn flush_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        write_u64(&mut self.file, self.total_entries)?;
        write_u64(&mut self.file, self.total_spaces)?;
        write_u64(&mut self.file, self.first_entry)?;
        write_u64(&mut self.file, self.first_space)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read_marker(&mut self, addr: u64) -> Result<u8> {
        self.file.seek(SeekFrom::Start(self.cell_offset(addr)))?;
        let mut marker = [0u8; 1];
        self.file.read_exact(&mut marker)?;
        Ok(marker[0])
    }

    fn write_marker(&mut self, addr: u64, marker: u8) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.cell_offset(addr)))?;
        self.file.write_all(&[marker])?;
        Ok(())
    }

    fn read_next_free(&mut self, addr: u64) -> Result<u64> {
        self.file
            .seek(SeekFrom::Start(self.cell_offset(addr) + 1))?;
        Ok(read_u64(&mut self.file)?)
    }

    fn write_next_free(&mut self, addr: u64, next: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(self.cell_offset(addr) + 1))?;
        write_u64(&mut self.file, next)?;
        // zero-fill the remainder of the payload so a stale valid-record tail never lingers.
        let remaining = self.entry_bytes - 8;
        if remaining > 0 {
            self.file.write_all(&vec![0u8; remaining])?;
        }
        Ok(())
    }

    /// Number of cells currently holding reserved-or-valid data.
    #[must_use]
    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    /// Number of cells currently on the free list.
    #[must_use]
    pub fn total_spaces(&self) -> u64 {
        self.total_spaces
    }

    /// The header's `first_entry` slot. Unused by `EquiBlobsFile` itself; the owning
    /// structure (a `BTree`'s root node address, here) is free to repurpose it as its own
    /// single persisted pointer rather than maintaining a separate file.
    #[must_use]
    pub fn first_entry(&self) -> u64 {
        self.first_entry
    }

    /// Updates and flushes the header's `first_entry` slot.
    pub fn set_first_entry(&mut self, value: u64) -> Result<()> {
        self.first_entry = value;
        self.flush_header()
    }

    /// Allocates a cell, preferring the free list, and returns its address.
    pub fn free_address(&mut self) -> Result<u64> {
        let addr = if self.first_space != 0 {
            let addr = self.first_space;
            let next = self.read_next_free(addr)?;
            self.first_space = next;
            self.total_spaces -= 1;
            self.write_marker(addr, MARKER_RESERVED)?;
            addr
        } else {
            let addr = self.total_entries + self.total_spaces + 1;
            self.file.seek(SeekFrom::Start(self.cell_offset(addr)))?;
            let mut cell = vec![0u8; 1 + self.entry_bytes];
            cell[0] = MARKER_RESERVED;
            self.file.write_all(&cell)?;
            addr
        };

        self.total_entries += 1;
        self.flush_header()?;
        Ok(addr)
    }

    /// Writes `bytes` into the cell at `addr`, marking it valid.
    pub fn store_blob(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.entry_bytes {
            return Err(Error::InvalidArgument(format!(
                "expected {} bytes, got {}",
                self.entry_bytes,
                bytes.len()
            )));
        }

        let marker = self.read_marker(addr)?;
        if marker != MARKER_RESERVED && marker != MARKER_VALID {
            return Err(Error::Corruption(format!(
                "{:?}: cell {addr} is not reserved or valid (marker {marker})",
                self.path
            )));
        }

        self.file.seek(SeekFrom::Start(self.cell_offset(addr)))?;
        self.file.write_all(&[MARKER_VALID])?;
        self.file.write_all(bytes)?;

        self.cache.insert(addr, bytes.to_vec());

        Ok(())
    }

    /// Reads the payload of the cell at `addr`, requiring it to be valid.
    pub fn retrieve_blob(&mut self, addr: u64) -> Result<Vec<u8>> {
        if let Some(payload) = self.cache.get(addr) {
            return Ok(payload);
        }

        let marker = self.read_marker(addr)?;
        if marker != MARKER_VALID {
            return Err(Error::Corruption(format!(
                "{:?}: cell {addr} is not valid (marker {marker})",
                self.path
            )));
        }

        let mut payload = vec![0u8; self.entry_bytes];
        self.file.read_exact(&mut payload)?;
        self.cache.insert(addr, payload.clone());
        Ok(payload)
    }

    /// Frees the cell at `addr`, splicing it onto the head of the free list.
    pub fn delete_blob(&mut self, addr: u64) -> Result<()> {
        let marker = self.read_marker(addr)?;
        if marker != MARKER_RESERVED && marker != MARKER_VALID {
            return Err(Error::Corruption(format!(
                "{:?}: cell {addr} is not reserved or valid (marker {marker})",
                self.path
            )));
        }

        self.write_marker(addr, MARKER_EMPTY)?;
        self.write_next_free(addr, self.first_space)?;
        self.first_space = addr;
        self.total_entries -= 1;
        self.total_spaces += 1;
        self.cache.remove(addr);

        self.trim_tail()?;
        self.flush_header()?;

        Ok(())
    }

    /// Unlinks `addr` from the free list without touching its marker byte.
    fn unlink_free_cell(&mut self, addr: u64) -> Result<()> {
        if self.first_space == addr {
            self.first_space = self.read_next_free(addr)?;
            return Ok(());
        }

        let mut prev = self.first_space;
        let mut steps = 0u64;

        while prev != 0 {
            let next = self.read_next_free(prev)?;
            if next == addr {
                let next_next = self.read_next_free(addr)?;
                self.write_next_free(prev, next_next)?;
                return Ok(());
            }
            prev = next;

            steps += 1;
            if steps > self.total_spaces + 1 {
                return Err(Error::Corruption(format!(
                    "{:?}: free list is cyclic or does not contain cell {addr}",
                    self.path
                )));
            }
        }

        Err(Error::Corruption(format!(
            "{:?}: free list does not contain cell {addr}",
            self.path
        )))
    }

    /// Removes trailing empty cells from the file, shrinking it and the free list.
    fn trim_tail(&mut self) -> Result<()> {
        loop {
            let tail_addr = self.total_entries + self.total_spaces;
            if tail_addr == 0 {
                break;
            }

            let marker = self.read_marker(tail_addr)?;
            if marker != MARKER_EMPTY {
                break;
            }

            self.unlink_free_cell(tail_addr)?;
            self.total_spaces -= 1;

            let new_len = self.cell_offset(tail_addr);
            self.file.set_len(new_len)?;
        }

        Ok(())
    }

    /// Validates the free list length, cell markers, and counters against file size.
    /// Returns the number of problems found.
    pub fn check(&mut self) -> Result<u64> {
        let mut errors = 0u64;

        let expected_len =
            HEADER_LEN + (self.total_entries + self.total_spaces) * self.cell_len();
        let actual_len = self.file.metadata()?.len();
        if expected_len != actual_len {
            log::warn!(
                "{:?}: file size {actual_len} does not match expected {expected_len}",
                self.path
            );
            errors += 1;
        }

        let mut visited = 0u64;
        let mut addr = self.first_space;
        while addr != 0 {
            visited += 1;
            if visited > self.total_spaces + 1 {
                log::warn!("{:?}: free list is cyclic", self.path);
                errors += 1;
                break;
            }

            let marker = self.read_marker(addr)?;
            if marker != MARKER_EMPTY {
                log::warn!("{:?}: free list cell {addr} has marker {marker}", self.path);
                errors += 1;
            }

            addr = self.read_next_free(addr)?;
        }

        if visited != self.total_spaces {
            log::warn!(
                "{:?}: free list length {visited} does not match total_spaces {}",
                self.path,
                self.total_spaces
            );
            errors += 1;
        }

        Ok(errors)
    }

    /// Flushes any pending writes to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> EquiBlobsFile {
        EquiBlobsFile::open(dir.join("cells.blobs"), 16).unwrap()
    }

    #[test]
    fn allocate_store_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = open(dir.path());

        let addr = f.free_address().unwrap();
        assert_eq!(addr, 1);
        f.store_blob(addr, &[7u8; 16]).unwrap();
        assert_eq!(f.retrieve_blob(addr).unwrap(), vec![7u8; 16]);
    }

    #[test]
    fn freed_cells_are_reused_before_extending() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = open(dir.path());

        let a = f.free_address().unwrap();
        let b = f.free_address().unwrap();
        f.store_blob(a, &[1u8; 16]).unwrap();
        f.store_blob(b, &[2u8; 16]).unwrap();

        f.delete_blob(a).unwrap();
        let c = f.free_address().unwrap();
        assert_eq!(c, a, "freed cell should be recycled before growing the file");
    }

    #[test]
    fn deleting_tail_cell_trims_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.blobs");
        let mut f = EquiBlobsFile::open(&path, 16).unwrap();

        let a = f.free_address().unwrap();
        let b = f.free_address().unwrap();
        f.store_blob(a, &[1u8; 16]).unwrap();
        f.store_blob(b, &[2u8; 16]).unwrap();

        let len_before = std::fs::metadata(&path).unwrap().len();
        f.delete_blob(b).unwrap();
        let len_after = std::fs::metadata(&path).unwrap().len();
        assert!(len_after < len_before);
        assert_eq!(f.total_spaces(), 0);
    }

    #[test]
    fn reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.blobs");

        {
            let mut f = EquiBlobsFile::open(&path, 16).unwrap();
            let addr = f.free_address().unwrap();
            f.store_blob(addr, &[9u8; 16]).unwrap();
        }

        let mut f = EquiBlobsFile::open(&path, 16).unwrap();
        assert_eq!(f.total_entries(), 1);
        assert_eq!(f.retrieve_blob(1).unwrap(), vec![9u8; 16]);
    }

    #[test]
    fn check_reports_no_errors_on_healthy_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = open(dir.path());
        let a = f.free_address().unwrap();
        f.store_blob(a, &[0u8; 16]).unwrap();
        assert_eq!(f.check().unwrap(), 0);
    }

    #[test]
    fn recycled_address_does_not_see_stale_cached_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = open(dir.path());

        let a = f.free_address().unwrap();
        f.store_blob(a, &[1u8; 16]).unwrap();
        assert_eq!(f.retrieve_blob(a).unwrap(), vec![1u8; 16]);

        f.delete_blob(a).unwrap();
        let b = f.free_address().unwrap();
        assert_eq!(b, a, "recycled address should be reused before extending");
        f.store_blob(b, &[2u8; 16]).unwrap();
        assert_eq!(f.retrieve_blob(b).unwrap(), vec![2u8; 16]);
    }

    #[test]
    fn store_blob_rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = open(dir.path());
        let a = f.free_address().unwrap();
        assert!(f.store_blob(a, &[0u8; 8]).is_err());
    }
}
