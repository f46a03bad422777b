// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Builder-style configuration for a [`FlatFileDB`](crate::db::FlatFileDB) (§10.3).

use crate::db::FlatFileDB;
use crate::error::Result;
use crate::path::absolute_path;
use std::path::PathBuf;

/// Default order of the address-index and space-manager B-trees: odd, and large enough that
/// a few thousand entries fit in a shallow tree without wasting much space per node.
pub const DEFAULT_BTREE_ORDER: usize = 63;

/// Default page-cache sizing for the address index, in nodes.
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Configuration for opening or creating a [`FlatFileDB`].
///
/// ```
/// # let folder = tempfile::tempdir()?;
/// use perobs_core::Config;
///
/// let db = Config::new(folder.path()).repair_on_open(true).open()?;
/// # drop(db);
/// # Ok::<(), perobs_core::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) path: PathBuf,
    pub(crate) btree_order: usize,
    pub(crate) cache_capacity: usize,
    pub(crate) repair_on_open: bool,
}

impl Config {
    /// Starts a configuration for a database directory at `path`. The directory is created on
    /// `open` if it does not already exist.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: absolute_path(path.into()),
            btree_order: DEFAULT_BTREE_ORDER,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            repair_on_open: false,
        }
    }

    /// Sets the order of the address-index B-tree. Must be odd and in `3..65535`; validated
    /// when [`open`](Self::open) is called.
    #[must_use]
    pub fn btree_order(mut self, order: usize) -> Self {
        self.btree_order = order;
        self
    }

    /// Sets the page cache's entry capacity.
    #[must_use]
    pub fn page_cache(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Whether `open` should transparently repair a dirty or corrupted database (regenerating
    /// the index and free-space list from the `FlatFile`) instead of failing. Defaults to
    /// `false`.
    #[must_use]
    pub fn repair_on_open(mut self, repair: bool) -> Self {
        self.repair_on_open = repair;
        self
    }

    /// Opens (creating if necessary) the database described by this configuration.
    pub fn open(self) -> Result<FlatFileDB> {
        FlatFileDB::open(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        assert_eq!(config.btree_order, DEFAULT_BTREE_ORDER);
        assert!(!config.repair_on_open);
    }

    #[test]
    fn builder_methods_compose() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .btree_order(5)
            .page_cache(64)
            .repair_on_open(true);

        assert_eq!(config.btree_order, 5);
        assert_eq!(config.cache_capacity, 64);
        assert!(config.repair_on_open);
    }
}
