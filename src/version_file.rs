// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The `version` file: a plain-text integer recording the on-disk schema version of a
//! database directory. `open` refuses to touch a directory whose version is newer than
//! the version this build knows how to read.

use crate::error::{Error, Result};
use std::path::Path;

/// On-disk schema version of a database directory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct SchemaVersion(pub u32);

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The schema version written by this build when creating a new database.
pub const CURRENT_SCHEMA_VERSION: SchemaVersion = SchemaVersion(1);

const FILE_NAME: &str = "version";

/// Reads the `version` file in `dir`, if present.
pub fn read(dir: &Path) -> Result<Option<SchemaVersion>> {
    let path = dir.join(FILE_NAME);

    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let value: u32 = contents.trim().parse().map_err(|_| {
                Error::Corruption(format!("version file {path:?} does not contain an integer"))
            })?;
            Ok(Some(SchemaVersion(value)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes `version` to the `version` file in `dir`, creating or truncating it.
pub fn write(dir: &Path, version: SchemaVersion) -> Result<()> {
    std::fs::write(dir.join(FILE_NAME), version.0.to_string())?;
    Ok(())
}

/// Verifies that `found` is not newer than `supported`.
pub fn check_compatible(found: SchemaVersion, supported: SchemaVersion) -> Result<()> {
    if found > supported {
        Err(Error::VersionMismatch { found, supported })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_version_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read(dir.path()).unwrap(), None);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), SchemaVersion(7)).unwrap();
        assert_eq!(read(dir.path()).unwrap(), Some(SchemaVersion(7)));
    }

    #[test]
    fn rejects_newer_than_supported() {
        let err = check_compatible(SchemaVersion(2), SchemaVersion(1)).unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
    }

    #[test]
    fn accepts_equal_or_older() {
        check_compatible(SchemaVersion(1), SchemaVersion(1)).unwrap();
        check_compatible(SchemaVersion(0), SchemaVersion(1)).unwrap();
    }

    #[test]
    fn corrupt_version_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FILE_NAME), "not-a-number").unwrap();
        assert!(read(dir.path()).is_err());
    }
}
