// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `FlatFileDB`: the orchestrator that ties the `FlatFile`, address index, `SpaceManager`
//! and directory lock/dirty-flag/version bookkeeping into the public `open`/`put`/`get`/
//! `delete`/`gc`/`check` surface (§4.6, §6).

use crate::btree::BTree;
use crate::config::Config;
use crate::dirty_flag::DirtyFlag;
use crate::error::{Error, Result};
use crate::flat_file::{FlatFile, ScanEntry};
use crate::fs_lock::DirectoryLock;
use crate::space_manager::SpaceManager;
use crate::version_file::{self, CURRENT_SCHEMA_VERSION};
use std::path::PathBuf;

const BLOBS_FILE_NAME: &str = "database.blobs";
const INDEX_FILE_NAME: &str = "database_index.blobs";
const SPACE_INDEX_FILE_NAME: &str = "space_index.blobs";
const SPACE_LIST_FILE_NAME: &str = "space_list.blobs";

/// A single, single-process embedded key-value store: `u64` object ids to opaque byte
/// strings, backed by the on-disk layout described in §6.
///
/// The database is always in exactly one of two states, `Open` (this value exists) or
/// `Closed` (it has been consumed by [`close`](Self::close) or dropped). There is no
/// intermediate state visible to callers.
pub struct FlatFileDB {
    #[allow(dead_code)] // kept alive for its Drop impl, which releases the directory lock
    lock: DirectoryLock,
    dir: PathBuf,
    flat_file: FlatFile,
    index: BTree,
    space_manager: SpaceManager,
    dirty_flag: DirtyFlag,
}

impl FlatFileDB {
    /// Opens (creating if necessary) the database directory described by `config`.
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.path)?;
        let lock = DirectoryLock::acquire(&config.path)?;

        match version_file::read(&config.path)? {
            Some(found) => version_file::check_compatible(found, CURRENT_SCHEMA_VERSION)?,
            None => version_file::write(&config.path, CURRENT_SCHEMA_VERSION)?,
        }

        let dirty_flag = DirtyFlag::new(&config.path);
        let was_dirty = dirty_flag.is_set();
        if was_dirty && !config.repair_on_open {
            return Err(Error::Corruption(
                "database was not closed cleanly; open with repair_on_open(true) to recover"
                    .to_string(),
            ));
        }

        let flat_file = FlatFile::open(config.path.join(BLOBS_FILE_NAME))?;
        let index = BTree::open_with_cache(
            config.path.join(INDEX_FILE_NAME),
            config.btree_order,
            config.cache_capacity,
        )?;
        let space_manager = SpaceManager::open(
            config.path.join(SPACE_INDEX_FILE_NAME),
            config.path.join(SPACE_LIST_FILE_NAME),
        )?;

        let mut db = Self {
            lock,
            dir: config.path,
            flat_file,
            index,
            space_manager,
            dirty_flag,
        };

        if was_dirty {
            log::warn!("{:?}: dirty flag present on open, regenerating index and spaces", db.dir);
            db.regenerate_index_and_spaces()?;
            db.dirty_flag.clear()?;
        }

        Ok(db)
    }

    /// Flushes any pending state and releases the directory lock. Dropping a `FlatFileDB`
    /// without calling `close` leaves the dirty flag set, forcing repair on the next `open`.
    pub fn close(self) -> Result<()> {
        self.dirty_flag.clear()?;
        Ok(())
    }

    /// Inserts or overwrites `bytes` under `id`.
    pub fn put(&mut self, id: u64, bytes: &[u8]) -> Result<()> {
        self.dirty_flag.set()?;

        if let Some(offset) = self.index.get(id)? {
            let freed = self.flat_file.delete(offset)?;
            self.space_manager.add_space(offset, freed)?;
            self.index.remove(id)?;
        }

        let offset = self.flat_file.write(&mut self.space_manager, id, bytes, false)?;
        self.index.insert(id, offset)?;
        Ok(())
    }

    /// Returns the bytes stored under `id`, or `None` if no record exists.
    pub fn get(&mut self, id: u64) -> Result<Option<Vec<u8>>> {
        let Some(offset) = self.index.get(id)? else {
            return Ok(None);
        };

        match self.flat_file.read(id, offset) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Removes the record stored under `id`. Returns whether a record was actually removed.
    pub fn delete(&mut self, id: u64) -> Result<bool> {
        let Some(offset) = self.index.get(id)? else {
            return Ok(false);
        };

        self.dirty_flag.set()?;
        let freed = self.flat_file.delete(offset)?;
        self.space_manager.add_space(offset, freed)?;
        self.index.remove(id)?;
        Ok(true)
    }

    /// Whether a record currently exists for `id`.
    pub fn contains(&mut self, id: u64) -> Result<bool> {
        Ok(self.index.get(id)?.is_some())
    }

    /// Clears the mark bit on every record. The first step of a GC pass.
    pub fn mark_clear(&mut self) -> Result<()> {
        self.flat_file.clear_all_marks()
    }

    /// Sets the mark bit on the record for `id`.
    pub fn mark(&mut self, id: u64) -> Result<()> {
        let offset = self.index.get(id)?.ok_or(Error::NotFound)?;
        self.flat_file.mark(offset)
    }

    /// Reports whether `id`'s record is currently marked.
    pub fn is_marked(&mut self, id: u64) -> Result<bool> {
        let offset = self.index.get(id)?.ok_or(Error::NotFound)?;
        self.flat_file.is_marked(offset)
    }

    /// Deletes every unmarked record, then defragments. Returns the ids removed.
    pub fn sweep(&mut self) -> Result<Vec<u64>> {
        self.dirty_flag.set()?;

        let mut targets = Vec::new();
        self.flat_file.scan(|entry| {
            if let ScanEntry::Valid { offset, id, marked } = entry {
                if !marked {
                    targets.push((id, offset));
                }
            }
            Ok(())
        })?;

        let mut removed = Vec::with_capacity(targets.len());
        for (id, offset) in targets {
            let freed = self.flat_file.delete(offset)?;
            self.space_manager.add_space(offset, freed)?;
            self.index.remove(id)?;
            removed.push(id);
        }

        self.defragment()?;

        Ok(removed)
    }

    /// Runs a full mark-and-sweep collection: clears all marks, marks every id yielded by
    /// `reachable` that currently has a record, then sweeps. Returns the ids removed.
    pub fn gc<I: IntoIterator<Item = u64>>(&mut self, reachable: I) -> Result<Vec<u64>> {
        self.mark_clear()?;
        for id in reachable {
            if self.contains(id)? {
                self.mark(id)?;
            }
        }
        self.sweep()
    }

    fn defragment(&mut self) -> Result<()> {
        let index = &mut self.index;
        self.flat_file.defragment(|id, _from, to| index.insert(id, to))?;
        self.space_manager.clear()?;
        Ok(())
    }

    /// Validates the address index, the `SpaceManager`, and the cross-references between
    /// them and the `FlatFile`. Returns the number of problems found. When `repair` is true
    /// and problems are found (or the database was left dirty), rebuilds the index and
    /// free-space list from a sequential scan of the `FlatFile`.
    pub fn check(&mut self, repair: bool) -> Result<u64> {
        let mut errors = 0u64;

        let mut tree_problems = Vec::new();
        self.index.check(|msg| tree_problems.push(msg))?;
        errors += tree_problems.len() as u64;
        for msg in &tree_problems {
            log::warn!("{:?}: address index: {msg}", self.dir);
        }

        errors += self.space_manager.check(Some(&mut self.flat_file))?;

        let mut dangling = Vec::new();
        self.index.each(|id, offset| {
            if let Err(e) = self.flat_file.read(id, offset) {
                dangling.push((id, e.to_string()));
            }
            Ok(())
        })?;
        errors += dangling.len() as u64;
        for (id, reason) in &dangling {
            log::warn!(
                "{:?}: address index entry {id} does not resolve to a valid record: {reason}",
                self.dir
            );
        }

        if repair && (errors > 0 || self.dirty_flag.is_set()) {
            self.regenerate_index_and_spaces()?;
            self.dirty_flag.clear()?;
        }

        Ok(errors)
    }

    /// Clears the address index and `SpaceManager`, then rebuilds both from a corruption-
    /// tolerant sequential scan of the `FlatFile`.
    fn regenerate_index_and_spaces(&mut self) -> Result<()> {
        let stale_ids: Vec<u64> = {
            let mut ids = Vec::new();
            self.index.each(|id, _| {
                ids.push(id);
                Ok(())
            })?;
            ids
        };
        for id in stale_ids {
            self.index.remove(id)?;
        }
        self.space_manager.clear()?;

        let mut entries = Vec::new();
        let skipped = self.flat_file.scan_recover(|entry| {
            entries.push(entry);
            Ok(())
        })?;
        if skipped > 0 {
            log::warn!("{:?}: skipped {skipped} corrupted bytes while regenerating", self.dir);
        }

        for entry in entries {
            match entry {
                ScanEntry::Valid { offset, id, .. } => match self.flat_file.read(id, offset) {
                    Ok(_) => {
                        self.index.insert(id, offset)?;
                    }
                    Err(Error::ChecksumMismatch { .. }) => {
                        log::warn!(
                            "{:?}: dropping record {id} at offset {offset}: payload checksum mismatch",
                            self.dir
                        );
                        let freed = self.flat_file.delete(offset)?;
                        self.space_manager.add_space(offset, freed)?;
                    }
                    Err(e) => return Err(e),
                },
                ScanEntry::Free { offset, length } if length > 0 => {
                    self.space_manager.add_space(offset, length)?;
                }
                ScanEntry::Free { .. } => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &std::path::Path) -> FlatFileDB {
        Config::new(dir).open().unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open(dir.path());
        db.put(1, b"hello").unwrap();
        db.put(2, b"world").unwrap();
        assert_eq!(db.get(1).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(db.get(2).unwrap(), Some(b"world".to_vec()));
    }

    #[test]
    fn survives_close_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut db = open(dir.path());
            db.put(1, b"hello").unwrap();
            db.put(2, b"world").unwrap();
            db.close().unwrap();
        }

        let mut db = open(dir.path());
        assert_eq!(db.get(1).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(db.get(2).unwrap(), Some(b"world".to_vec()));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open(dir.path());
        db.put(1, b"x").unwrap();

        assert!(db.delete(1).unwrap());
        assert!(!db.delete(1).unwrap());
        assert_eq!(db.get(1).unwrap(), None);
    }

    #[test]
    fn overwrite_replaces_value_without_duplicate_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open(dir.path());
        db.put(1, b"aaaa").unwrap();
        db.put(1, b"bbbb").unwrap();
        assert_eq!(db.get(1).unwrap(), Some(b"bbbb".to_vec()));

        let mut valid_count = 0;
        db.flat_file
            .scan(|entry| {
                if let ScanEntry::Valid { id, .. } = entry {
                    if id == 1 {
                        valid_count += 1;
                    }
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(valid_count, 1);
    }

    #[test]
    fn gc_keeps_only_reachable_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open(dir.path());
        for id in 1..=10u64 {
            db.put(id, &id.to_le_bytes()).unwrap();
        }

        let reachable: Vec<u64> = (1..=5).collect();
        let mut removed = db.gc(reachable.clone()).unwrap();
        removed.sort_unstable();
        assert_eq!(removed, (6..=10).collect::<Vec<_>>());

        for id in reachable {
            assert!(db.contains(id).unwrap());
        }
        for id in 6..=10u64 {
            assert!(!db.contains(id).unwrap());
        }
    }

    #[test]
    fn check_reports_no_errors_on_healthy_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open(dir.path());
        for id in 1..=50u64 {
            db.put(id, &id.to_le_bytes()).unwrap();
        }
        assert_eq!(db.check(false).unwrap(), 0);
    }

    #[test]
    fn dirty_flag_without_repair_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut db = open(dir.path());
            db.put(1, b"x").unwrap();
            // dropped without calling close(): dirty flag stays set.
        }

        let err = Config::new(dir.path()).open().unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn dirty_flag_with_repair_recovers_and_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut db = open(dir.path());
            db.put(1, b"hello").unwrap();
        }

        let mut db = Config::new(dir.path()).repair_on_open(true).open().unwrap();
        assert_eq!(db.get(1).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(db.check(false).unwrap(), 0);
    }

    #[test]
    fn check_repair_rebuilds_after_header_corruption() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut db = open(dir.path());
            db.put(1, b"hello world").unwrap();
            db.put(2, b"second record").unwrap();
            db.close().unwrap();
        }

        // Flip a byte inside record 1's header, invalidating its header CRC. `scan_recover`
        // will resynchronize past it, dropping it, while record 2 survives.
        let blobs_path = dir.path().join(BLOBS_FILE_NAME);
        let mut bytes = std::fs::read(&blobs_path).unwrap();
        bytes[5] ^= 0xFF;
        std::fs::write(&blobs_path, bytes).unwrap();

        let mut db = Config::new(dir.path()).repair_on_open(true).open().unwrap();
        let errors = db.check(true).unwrap();
        assert!(errors > 0);
        assert!(!db.contains(1).unwrap());
        assert_eq!(db.get(2).unwrap(), Some(b"second record".to_vec()));
    }

    #[test]
    fn corrupted_payload_is_reported_and_repaired_away() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut db = open(dir.path());
            db.put(1, b"hello world").unwrap();
            db.close().unwrap();
        }

        let blobs_path = dir.path().join(BLOBS_FILE_NAME);
        let mut bytes = std::fs::read(&blobs_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&blobs_path, bytes).unwrap();

        let mut db = open(dir.path());
        assert!(matches!(db.get(1), Err(Error::ChecksumMismatch { .. })));

        let errors = db.check(true).unwrap();
        assert_eq!(errors, 1);
        assert!(!db.contains(1).unwrap());
    }

    /// Simulates a crash that lands between `put`'s `FlatFile::write` (durable on disk,
    /// fsynced) and its `index.insert` (never happens): the payload is fully on disk but the
    /// index doesn't know about it yet. `check(repair=true)` must resolve this into the
    /// post-put state (the record becomes visible), never a torn one.
    #[test]
    fn crash_between_payload_flush_and_index_update_recovers_to_post_put_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open(dir.path());
        db.put(1, b"already durable").unwrap();

        let offset = db
            .flat_file
            .write(&mut db.space_manager, 2, b"never indexed", false)
            .unwrap();
        let _ = offset;

        assert!(!db.contains(2).unwrap());
        // The dirty flag (set by the earlier `put` and never cleared, since no clean `close`
        // happened) forces a rebuild regardless of how many cross-check errors are found.
        db.check(true).unwrap();
        assert_eq!(db.get(2).unwrap(), Some(b"never indexed".to_vec()));
        assert_eq!(db.get(1).unwrap(), Some(b"already durable".to_vec()));
    }
}
