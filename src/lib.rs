// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A persistent, single-file object store.
//!
//! ##### About
//!
//! `perobs-core` implements the storage engine underneath a persistent Ruby object store,
//! ported to a self-contained Rust core: a single growable file (the `FlatFile`) holding
//! CRC-protected, variable-length byte records addressed by an on-disk B-tree, plus an
//! exact-fit free-space tracker (the `SpaceManager`) that lets deleted records' space be
//! reused without fragmentation-prone splitting.
//!
//! Records are identified by a caller-chosen `u64` id, not a key — there is no ordering or
//! range query over ids. What `perobs-core` buys you over a directory of files is crash
//! safety (every record is individually checksummed, and an uncleanly-closed database is
//! detected and can be repaired), and a simple mark-and-sweep garbage collector for
//! reclaiming space occupied by objects an application no longer references.
//!
//! # Example usage
//!
//! ```
//! use perobs_core::Config;
//! # let folder = tempfile::tempdir()?;
//!
//! let mut db = Config::new(folder.path()).open()?;
//!
//! db.put(1, b"hello")?;
//! assert_eq!(db.get(1)?, Some(b"hello".to_vec()));
//!
//! // A mark-and-sweep pass keeps only ids the application still references.
//! let removed = db.gc([1])?;
//! assert!(removed.is_empty());
//!
//! db.close()?;
//! # Ok::<(), perobs_core::Error>(())
//! ```
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

mod btree;
mod checksum;
mod coding;
mod config;
mod db;
mod dirty_flag;
mod equi_blobs_file;
mod error;
mod flat_file;
mod fs_lock;
mod page_cache;
mod path;
mod space_manager;
mod version_file;

pub use config::Config;
pub use db::FlatFileDB;
pub use error::{Error, Result};
pub use version_file::SchemaVersion;
