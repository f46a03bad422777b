// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The `<name>.dirty` marker file (§5, §6): created the moment a database stops being
//! pristine, removed only once every pending write has been flushed and the database closes
//! cleanly. A dirty flag found on `open` means the previous session never got that far, and
//! recovery (or a fatal error, depending on configuration) follows.

use crate::error::Result;
use std::path::{Path, PathBuf};

const FILE_NAME: &str = "database.dirty";

/// Tracks whether a database directory is in a "clean" (flushed, closed normally) state.
pub struct DirtyFlag {
    path: PathBuf,
}

impl DirtyFlag {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(FILE_NAME),
        }
    }

    /// Whether the flag file is currently present.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// Creates the flag file if it does not already exist. Idempotent.
    pub fn set(&self) -> Result<()> {
        if !self.path.exists() {
            std::fs::write(&self.path, b"")?;
        }
        Ok(())
    }

    /// Removes the flag file if present. Idempotent.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
