// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tracks free regions of the `FlatFile` by exact byte length (§3 "SpaceManager", §4.4).
//!
//! Two files back this: a `u64 -> u64` [`BTree`] mapping a length to the address of the
//! head of that length's free list, and an `EquiBlobsFile` whose cells hold
//! `(space_offset, next_list_node_address)` pairs. Allocation is exact-fit only — a
//! request for length `L` is satisfied only by a region of exactly `L` bytes, never a
//! larger one split down, since that would leave an unusable tail gap.

use crate::btree::BTree;
use crate::coding::{read_u64, write_u64};
use crate::equi_blobs_file::EquiBlobsFile;
use crate::error::{Error, Result};
use crate::flat_file::{FlatFile, ScanEntry};
use std::path::Path;

const LIST_NODE_BYTES: usize = 16; // (space_offset: u64, next_list_node_address: u64)

pub struct SpaceManager {
    index: BTree,
    list: EquiBlobsFile,
}

fn decode_list_node(bytes: &[u8]) -> Result<(u64, u64)> {
    let mut r = bytes;
    let offset = read_u64(&mut r)?;
    let next = read_u64(&mut r)?;
    Ok((offset, next))
}

#[allow(clippy::unwrap_used)] // writes into a Vec<u8>, which cannot fail
fn encode_list_node(offset: u64, next: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LIST_NODE_BYTES);
    write_u64(&mut buf, offset).unwrap();
    write_u64(&mut buf, next).unwrap();
    buf
}

impl SpaceManager {
    pub fn open<P: AsRef<Path>>(index_path: P, list_path: P) -> Result<Self> {
        // The length->head index never needs more than a handful of distinct lengths in
        // practice; a modest fixed order keeps its nodes small.
        let index = BTree::open(index_path, 63)?;
        let list = EquiBlobsFile::open(list_path, LIST_NODE_BYTES)?;
        Ok(Self { index, list })
    }

    /// Registers a free region of `length` bytes at `offset`, pushing it onto the head of
    /// that length's list.
    pub fn add_space(&mut self, offset: u64, length: u64) -> Result<()> {
        let head = self.index.get(length)?.unwrap_or(0);
        let node_addr = self.list.free_address()?;
        self.list
            .store_blob(node_addr, &encode_list_node(offset, head))?;
        self.index.insert(length, node_addr)?;
        Ok(())
    }

    /// Returns and removes a free region of exactly `length` bytes, if one is recorded.
    pub fn get_space(&mut self, length: u64) -> Result<Option<(u64, u64)>> {
        let Some(head) = self.index.get(length)? else {
            return Ok(None);
        };

        let (offset, next) = decode_list_node(&self.list.retrieve_blob(head)?)?;
        self.list.delete_blob(head)?;

        if next == 0 {
            self.index.remove(length)?;
        } else {
            self.index.insert(length, next)?;
        }

        Ok(Some((offset, length)))
    }

    /// Linear scan of the `length` list for `offset`. Used only by `check`.
    pub fn has_space(&mut self, offset: u64, length: u64) -> Result<bool> {
        let Some(mut addr) = self.index.get(length)? else {
            return Ok(false);
        };

        let mut steps = 0u64;
        while addr != 0 {
            let (node_offset, next) = decode_list_node(&self.list.retrieve_blob(addr)?)?;
            if node_offset == offset {
                return Ok(true);
            }
            addr = next;

            steps += 1;
            if steps > self.list.total_entries() + 1 {
                return Err(Error::Corruption(
                    "space manager free list is cyclic".to_string(),
                ));
            }
        }

        Ok(false)
    }

    /// Drops every recorded free region without touching the underlying `FlatFile`. Used
    /// after a `defragment`, which leaves no free regions behind.
    pub fn clear(&mut self) -> Result<()> {
        let lengths: Vec<u64> = {
            let mut out = Vec::new();
            self.index.each(|length, _| {
                out.push(length);
                Ok(())
            })?;
            out
        };

        for length in lengths {
            while self.get_space(length)?.is_some() {}
        }

        Ok(())
    }

    /// Verifies every list is non-cyclic, and (when `flat_file` is given) that every
    /// recorded region actually corresponds to a free region of the expected length.
    /// Returns the number of problems found.
    pub fn check(&mut self, flat_file: Option<&mut FlatFile>) -> Result<u64> {
        let mut errors = 0u64;

        let entries: Vec<(u64, u64)> = {
            let mut out = Vec::new();
            self.index.each(|length, head| {
                out.push((length, head));
                Ok(())
            })?;
            out
        };

        let mut recorded: Vec<(u64, u64)> = Vec::new(); // (offset, length)

        for (length, head) in entries {
            let mut addr = head;
            let mut steps = 0u64;
            while addr != 0 {
                steps += 1;
                if steps > self.list.total_entries() + 1 {
                    log::warn!("space manager list for length {length} is cyclic");
                    errors += 1;
                    break;
                }

                let (offset, next) = decode_list_node(&self.list.retrieve_blob(addr)?)?;
                recorded.push((offset, length));
                addr = next;
            }
        }

        if let Some(flat_file) = flat_file {
            let mut free_regions = Vec::new();
            flat_file.scan(|entry| {
                if let ScanEntry::Free { offset, length } = entry {
                    free_regions.push((offset, length));
                }
                Ok(())
            })?;

            for (offset, length) in &recorded {
                if !free_regions.contains(&(*offset, *length)) {
                    log::warn!(
                        "space manager records free region at {offset} (length {length}) that is not free in the FlatFile"
                    );
                    errors += 1;
                }
            }
        }

        Ok(errors)
    }
}
