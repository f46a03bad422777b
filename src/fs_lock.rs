// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Exclusive advisory process lock, held for the lifetime of an open database.
//!
//! A single process-wide `.lock` file inside the database directory is `flock`-ed
//! (via `fs4`) for the duration the database is open. A second `open` of the same
//! directory, in this or another process, fails with `Error::LockedByAnotherProcess`
//! instead of silently racing the first.

use crate::error::{Error, Result};
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE_NAME: &str = ".lock";

/// An acquired exclusive lock on a database directory. Dropping it releases the lock.
pub struct DirectoryLock {
    file: File,
    path: PathBuf,
}

impl DirectoryLock {
    /// Attempts to acquire the exclusive lock for `dir`, creating the lock file if needed.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                log::debug!("acquired database lock at {path:?}");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(Error::LockedByAnotherProcess)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("failed to release database lock at {:?}: {e}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_attempt_fails() {
        let dir = tempfile::tempdir().unwrap();
        let first = DirectoryLock::acquire(dir.path()).unwrap();
        let second = DirectoryLock::acquire(dir.path());
        assert!(matches!(second, Err(Error::LockedByAnotherProcess)));
        drop(first);
        // Once released, a new lock can be acquired again.
        DirectoryLock::acquire(dir.path()).unwrap();
    }
}
