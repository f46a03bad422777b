// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::version_file::SchemaVersion;

/// Errors that can occur while operating the storage engine.
#[derive(Debug)]
pub enum Error {
    /// No record exists for the requested id.
    NotFound,

    /// A header or payload CRC-32 did not match the bytes it covers.
    ChecksumMismatch {
        /// The checksum recorded on disk.
        expected: u32,
        /// The checksum actually computed over the bytes read.
        got: u32,
    },

    /// An underlying file operation failed.
    Io(std::io::Error),

    /// A structural invariant of the on-disk format was violated.
    Corruption(String),

    /// The on-disk schema version is newer than this build understands.
    VersionMismatch {
        /// The version found on disk.
        found: SchemaVersion,
        /// The newest version this build supports.
        supported: SchemaVersion,
    },

    /// Another process already holds the exclusive database lock.
    LockedByAnotherProcess,

    /// A caller-supplied argument violated a precondition.
    InvalidArgument(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "no record for the given id"),
            Self::ChecksumMismatch { expected, got } => {
                write!(f, "checksum mismatch: expected {expected:#010x}, got {got:#010x}")
            }
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Corruption(msg) => write!(f, "corrupted database: {msg}"),
            Self::VersionMismatch { found, supported } => write!(
                f,
                "database schema version {found} is newer than the supported version {supported}"
            ),
            Self::LockedByAnotherProcess => {
                write!(f, "database is locked by another process")
            }
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Storage engine result.
pub type Result<T> = std::result::Result<T, Error>;
