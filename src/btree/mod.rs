// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An order-`N` B+-tree mapping `u64` keys to `u64` values, persisted as fixed-size nodes
//! inside an [`EquiBlobsFile`](crate::equi_blobs_file::EquiBlobsFile) (§3 "B-tree node",
//! §4.3). Both the object-id address index and the `SpaceManager`'s length index need
//! exactly a `u64 -> u64` map, so the tree is kept concrete over that pair rather than
//! generic.
//!
//! Data lives only in leaves, which are threaded into a doubly-linked chain via
//! `prev_leaf`/`next_leaf`, so `each`/`reverse_each` can walk every entry in key order
//! without touching internal nodes. Internal separators are *copies* of the smallest key
//! reachable through the child to their right, never removed on a leaf split — the
//! classic B+-tree shape.

mod node;

use crate::equi_blobs_file::EquiBlobsFile;
use crate::error::{Error, Result};
use node::Node;
use std::path::Path;

pub struct BTree {
    file: EquiBlobsFile,
    order: usize,
    entry_count: u64,
}

impl BTree {
    /// Opens or creates a tree of the given `order` (odd, `3..=65535`) at `path`.
    pub fn open<P: AsRef<Path>>(path: P, order: usize) -> Result<Self> {
        let file = EquiBlobsFile::open(path, Self::validated_entry_bytes(order)?)?;
        Self::from_file(file, order)
    }

    /// Like [`open`](Self::open), with an explicit node-cache capacity (see
    /// [`EquiBlobsFile::open_with_cache`]).
    pub fn open_with_cache<P: AsRef<Path>>(
        path: P,
        order: usize,
        cache_capacity: usize,
    ) -> Result<Self> {
        let file =
            EquiBlobsFile::open_with_cache(path, Self::validated_entry_bytes(order)?, cache_capacity)?;
        Self::from_file(file, order)
    }

    fn validated_entry_bytes(order: usize) -> Result<usize> {
        if order < 3 || order >= 65535 || order % 2 == 0 {
            return Err(Error::InvalidArgument(format!(
                "B-tree order must be odd and in 3..65535, got {order}"
            )));
        }
        Ok(Node::entry_bytes(order))
    }

    fn from_file(file: EquiBlobsFile, order: usize) -> Result<Self> {
        let mut tree = Self {
            file,
            order,
            entry_count: 0,
        };
        tree.entry_count = tree.count_leaf_entries()?;
        Ok(tree)
    }

    fn min_keys(&self) -> usize {
        self.order.div_ceil(2)
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.entry_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    fn root_addr(&self) -> u64 {
        self.file.first_entry()
    }

    fn set_root_addr(&mut self, addr: u64) -> Result<()> {
        self.file.set_first_entry(addr)
    }

    fn read_node(&mut self, addr: u64) -> Result<Node> {
        let bytes = self.file.retrieve_blob(addr)?;
        Node::decode(self.order, &bytes)
    }

    fn write_node(&mut self, addr: u64, node: &Node) -> Result<()> {
        self.file.store_blob(addr, &node.encode(self.order))
    }

    fn alloc_node(&mut self, node: &Node) -> Result<u64> {
        let addr = self.file.free_address()?;
        self.write_node(addr, node)?;
        Ok(addr)
    }

    fn free_node(&mut self, addr: u64) -> Result<()> {
        self.file.delete_blob(addr)
    }

    fn set_node_parent(&mut self, addr: u64, parent: u64) -> Result<()> {
        if addr == 0 {
            return Ok(());
        }
        let mut node = self.read_node(addr)?;
        node.parent = parent;
        self.write_node(addr, &node)
    }

    #[allow(clippy::unwrap_used)] // non-leaf nodes always have order+1 children, never empty
    fn leftmost_leaf_addr(&mut self) -> Result<u64> {
        let mut addr = self.root_addr();
        if addr == 0 {
            return Ok(0);
        }
        loop {
            let node = self.read_node(addr)?;
            if node.is_leaf {
                return Ok(addr);
            }
            addr = node.slots[0];
        }
    }

    #[allow(clippy::unwrap_used)] // non-leaf nodes always have order+1 children, never empty
    fn rightmost_leaf_addr(&mut self) -> Result<u64> {
        let mut addr = self.root_addr();
        if addr == 0 {
            return Ok(0);
        }
        loop {
            let node = self.read_node(addr)?;
            if node.is_leaf {
                return Ok(addr);
            }
            addr = *node.slots.last().unwrap();
        }
    }

    fn count_leaf_entries(&mut self) -> Result<u64> {
        let mut count = 0u64;
        let mut addr = self.leftmost_leaf_addr()?;
        while addr != 0 {
            let node = self.read_node(addr)?;
            count += node.keys.len() as u64;
            addr = node.next_leaf;
        }
        Ok(count)
    }

    /// Looks up `key`, returning its value if present.
    #[allow(clippy::indexing_slicing)] // binary_search/partition_point indices are always in range
    pub fn get(&mut self, key: u64) -> Result<Option<u64>> {
        let mut addr = self.root_addr();
        if addr == 0 {
            return Ok(None);
        }

        loop {
            let node = self.read_node(addr)?;
            if node.is_leaf {
                return Ok(match node.keys.binary_search(&key) {
                    Ok(idx) => Some(node.slots[idx]),
                    Err(_) => None,
                });
            }
            let idx = node.keys.partition_point(|&k| k <= key);
            addr = node.slots[idx];
        }
    }

    /// Inserts `(key, value)`, overwriting any existing value for `key`.
    #[allow(clippy::indexing_slicing)] // descent indices come from partition_point/binary_search, always in range
    pub fn insert(&mut self, key: u64, value: u64) -> Result<()> {
        if self.root_addr() == 0 {
            let mut root = Node::new_leaf();
            root.keys.push(key);
            root.slots.push(value);
            let addr = self.alloc_node(&root)?;
            self.set_root_addr(addr)?;
            self.entry_count = 1;
            return Ok(());
        }

        let mut path: Vec<(u64, usize)> = Vec::new();
        let mut addr = self.root_addr();
        loop {
            let node = self.read_node(addr)?;
            if node.is_leaf {
                break;
            }
            let idx = node.keys.partition_point(|&k| k <= key);
            path.push((addr, idx));
            addr = node.slots[idx];
        }

        let leaf_addr = addr;
        let mut leaf = self.read_node(leaf_addr)?;

        match leaf.keys.binary_search(&key) {
            Ok(idx) => {
                leaf.slots[idx] = value;
                self.write_node(leaf_addr, &leaf)?;
                return Ok(());
            }
            Err(idx) => {
                leaf.keys.insert(idx, key);
                leaf.slots.insert(idx, value);
            }
        }
        self.entry_count += 1;

        if leaf.keys.len() <= self.order {
            self.write_node(leaf_addr, &leaf)?;
            return Ok(());
        }

        let mid = self.order / 2;
        let right_keys = leaf.keys.split_off(mid);
        let right_slots = leaf.slots.split_off(mid);
        let promote_key = right_keys[0];

        let right_next = leaf.next_leaf;
        let right_node = Node {
            is_leaf: true,
            parent: 0,
            prev_leaf: leaf_addr,
            next_leaf: right_next,
            keys: right_keys,
            slots: right_slots,
        };
        let right_addr = self.alloc_node(&right_node)?;

        leaf.next_leaf = right_addr;
        self.write_node(leaf_addr, &leaf)?;

        if right_next != 0 {
            let mut next_node = self.read_node(right_next)?;
            next_node.prev_leaf = right_addr;
            self.write_node(right_next, &next_node)?;
        }

        self.insert_into_parent(path, leaf_addr, promote_key, right_addr)
    }

    #[allow(clippy::indexing_slicing, clippy::unwrap_used)] // a freshly-split internal node always has >=2 children
    fn insert_into_parent(
        &mut self,
        mut path: Vec<(u64, usize)>,
        mut left_addr: u64,
        mut promote_key: u64,
        mut right_addr: u64,
    ) -> Result<()> {
        loop {
            match path.pop() {
                None => {
                    let new_root = Node {
                        is_leaf: false,
                        parent: 0,
                        prev_leaf: 0,
                        next_leaf: 0,
                        keys: vec![promote_key],
                        slots: vec![left_addr, right_addr],
                    };
                    let new_root_addr = self.alloc_node(&new_root)?;
                    self.set_node_parent(left_addr, new_root_addr)?;
                    self.set_node_parent(right_addr, new_root_addr)?;
                    self.set_root_addr(new_root_addr)?;
                    return Ok(());
                }
                Some((parent_addr, child_idx)) => {
                    let mut parent = self.read_node(parent_addr)?;
                    debug_assert_eq!(parent.slots[child_idx], left_addr);

                    parent.keys.insert(child_idx, promote_key);
                    parent.slots.insert(child_idx + 1, right_addr);
                    self.set_node_parent(right_addr, parent_addr)?;

                    if parent.keys.len() <= self.order {
                        self.write_node(parent_addr, &parent)?;
                        return Ok(());
                    }

                    let mid = self.order / 2;
                    let right_keys = parent.keys.split_off(mid + 1);
                    let promote = parent.keys.pop().unwrap();
                    let right_slots = parent.slots.split_off(mid + 1);

                    let right_node = Node {
                        is_leaf: false,
                        parent: 0,
                        prev_leaf: 0,
                        next_leaf: 0,
                        keys: right_keys,
                        slots: right_slots,
                    };
                    let new_right_addr = self.alloc_node(&right_node)?;
                    for &child in &right_node.slots {
                        self.set_node_parent(child, new_right_addr)?;
                    }

                    self.write_node(parent_addr, &parent)?;

                    left_addr = parent_addr;
                    promote_key = promote;
                    right_addr = new_right_addr;
                    // loop continues, promoting one level further up
                }
            }
        }
    }

    /// Removes `key`, returning whether it was present.
    #[allow(clippy::indexing_slicing)] // descent indices come from partition_point/binary_search, always in range
    pub fn remove(&mut self, key: u64) -> Result<bool> {
        if self.root_addr() == 0 {
            return Ok(false);
        }

        let mut path: Vec<(u64, usize)> = Vec::new();
        let mut addr = self.root_addr();
        loop {
            let node = self.read_node(addr)?;
            if node.is_leaf {
                break;
            }
            let idx = node.keys.partition_point(|&k| k <= key);
            path.push((addr, idx));
            addr = node.slots[idx];
        }

        let leaf_addr = addr;
        let mut leaf = self.read_node(leaf_addr)?;
        let pos = match leaf.keys.binary_search(&key) {
            Ok(p) => p,
            Err(_) => return Ok(false),
        };
        leaf.keys.remove(pos);
        leaf.slots.remove(pos);
        self.entry_count -= 1;

        if path.is_empty() {
            if leaf.keys.is_empty() {
                self.free_node(leaf_addr)?;
                self.set_root_addr(0)?;
            } else {
                self.write_node(leaf_addr, &leaf)?;
            }
            return Ok(true);
        }

        if leaf.keys.len() >= self.min_keys() {
            self.write_node(leaf_addr, &leaf)?;
            return Ok(true);
        }

        self.fix_underflow(path, leaf_addr, leaf)?;
        Ok(true)
    }

    #[allow(clippy::indexing_slicing, clippy::unwrap_used)] // sibling/parent access is guarded by the B-tree's own structural invariants
    fn fix_underflow(
        &mut self,
        mut path: Vec<(u64, usize)>,
        mut addr: u64,
        mut node: Node,
    ) -> Result<()> {
        let min_keys = self.min_keys();

        loop {
            let Some(&(parent_addr, idx)) = path.last() else {
                // `node` is the root.
                if !node.is_leaf && node.keys.is_empty() {
                    let only_child = node.slots[0];
                    self.free_node(addr)?;
                    self.set_node_parent(only_child, 0)?;
                    self.set_root_addr(only_child)?;
                } else {
                    self.write_node(addr, &node)?;
                }
                return Ok(());
            };

            if node.keys.len() >= min_keys {
                self.write_node(addr, &node)?;
                return Ok(());
            }

            let mut parent = self.read_node(parent_addr)?;

            let left_addr = if idx > 0 { Some(parent.slots[idx - 1]) } else { None };
            let right_addr = if idx + 1 < parent.slots.len() {
                Some(parent.slots[idx + 1])
            } else {
                None
            };

            let left_len = match left_addr {
                Some(a) => Some(self.read_node(a)?.keys.len()),
                None => None,
            };
            let right_len = match right_addr {
                Some(a) => Some(self.read_node(a)?.keys.len()),
                None => None,
            };

            let can_borrow_left = left_len.is_some_and(|n| n > min_keys);
            let can_borrow_right = right_len.is_some_and(|n| n > min_keys);

            if can_borrow_left && (!can_borrow_right || left_len >= right_len) {
                let left_addr = left_addr.unwrap();
                let mut left = self.read_node(left_addr)?;
                if node.is_leaf {
                    let k = left.keys.pop().unwrap();
                    let v = left.slots.pop().unwrap();
                    node.keys.insert(0, k);
                    node.slots.insert(0, v);
                    parent.keys[idx - 1] = node.keys[0];
                } else {
                    let old_sep = parent.keys[idx - 1];
                    let moved_child = left.slots.pop().unwrap();
                    let moved_key = left.keys.pop().unwrap();
                    node.keys.insert(0, old_sep);
                    node.slots.insert(0, moved_child);
                    self.set_node_parent(moved_child, addr)?;
                    parent.keys[idx - 1] = moved_key;
                }
                self.write_node(left_addr, &left)?;
                self.write_node(addr, &node)?;
                self.write_node(parent_addr, &parent)?;
                return Ok(());
            }

            if can_borrow_right {
                let right_addr = right_addr.unwrap();
                let mut right = self.read_node(right_addr)?;
                if node.is_leaf {
                    let k = right.keys.remove(0);
                    let v = right.slots.remove(0);
                    node.keys.push(k);
                    node.slots.push(v);
                    parent.keys[idx] = right.keys[0];
                } else {
                    let old_sep = parent.keys[idx];
                    let moved_child = right.slots.remove(0);
                    let moved_key = right.keys.remove(0);
                    node.keys.push(old_sep);
                    node.slots.push(moved_child);
                    self.set_node_parent(moved_child, addr)?;
                    parent.keys[idx] = moved_key;
                }
                self.write_node(right_addr, &right)?;
                self.write_node(addr, &node)?;
                self.write_node(parent_addr, &parent)?;
                return Ok(());
            }

            if let Some(left_addr) = left_addr {
                let mut left = self.read_node(left_addr)?;
                if node.is_leaf {
                    left.keys.extend(node.keys);
                    left.slots.extend(node.slots);
                    left.next_leaf = node.next_leaf;
                    if node.next_leaf != 0 {
                        let mut nxt = self.read_node(node.next_leaf)?;
                        nxt.prev_leaf = left_addr;
                        self.write_node(node.next_leaf, &nxt)?;
                    }
                } else {
                    left.keys.push(parent.keys[idx - 1]);
                    left.keys.extend(node.keys);
                    for &c in &node.slots {
                        self.set_node_parent(c, left_addr)?;
                    }
                    left.slots.extend(node.slots);
                }
                self.write_node(left_addr, &left)?;
                self.free_node(addr)?;
                parent.keys.remove(idx - 1);
                parent.slots.remove(idx);
            } else {
                let right_addr = right_addr.expect("underflowing non-root node has a sibling");
                let right = self.read_node(right_addr)?;
                if node.is_leaf {
                    node.keys.extend(right.keys);
                    node.slots.extend(right.slots);
                    node.next_leaf = right.next_leaf;
                    if right.next_leaf != 0 {
                        let mut nxt = self.read_node(right.next_leaf)?;
                        nxt.prev_leaf = addr;
                        self.write_node(right.next_leaf, &nxt)?;
                    }
                } else {
                    node.keys.push(parent.keys[idx]);
                    node.keys.extend(right.keys);
                    for &c in &right.slots {
                        self.set_node_parent(c, addr)?;
                    }
                    node.slots.extend(right.slots);
                }
                self.write_node(addr, &node)?;
                self.free_node(right_addr)?;
                parent.keys.remove(idx);
                parent.slots.remove(idx + 1);
            }

            path.pop();
            node = parent;
            addr = parent_addr;
        }
    }

    /// Visits every `(key, value)` pair in ascending key order.
    #[allow(clippy::indexing_slicing)] // i ranges over 0..keys.len(), and slots.len() == keys.len() in a leaf
    pub fn each<F: FnMut(u64, u64) -> Result<()>>(&mut self, mut f: F) -> Result<()> {
        let mut addr = self.leftmost_leaf_addr()?;
        while addr != 0 {
            let node = self.read_node(addr)?;
            for i in 0..node.keys.len() {
                f(node.keys[i], node.slots[i])?;
            }
            addr = node.next_leaf;
        }
        Ok(())
    }

    /// Visits every `(key, value)` pair in descending key order.
    #[allow(clippy::indexing_slicing)] // i ranges over 0..keys.len(), and slots.len() == keys.len() in a leaf
    pub fn reverse_each<F: FnMut(u64, u64) -> Result<()>>(&mut self, mut f: F) -> Result<()> {
        let mut addr = self.rightmost_leaf_addr()?;
        while addr != 0 {
            let node = self.read_node(addr)?;
            for i in (0..node.keys.len()).rev() {
                f(node.keys[i], node.slots[i])?;
            }
            addr = node.prev_leaf;
        }
        Ok(())
    }

    /// Recursively verifies structural invariants, reporting each violation to `report`.
    /// Returns the number of violations found.
    pub fn check<F: FnMut(String)>(&mut self, mut report: F) -> Result<u64> {
        let mut errors = 0u64;

        if self.root_addr() != 0 {
            errors += self.check_node(self.root_addr(), true, &mut report)?;
        }

        let counted = self.count_leaf_entries()?;
        if counted != self.entry_count {
            report(format!(
                "entry counter {} does not match leaf-chain count {counted}",
                self.entry_count
            ));
            errors += 1;
        }

        Ok(errors)
    }

    fn check_node<F: FnMut(String)>(
        &mut self,
        addr: u64,
        is_root: bool,
        report: &mut F,
    ) -> Result<u64> {
        let mut errors = 0u64;
        let node = self.read_node(addr)?;

        if !node.keys.windows(2).all(|w| w[0] < w[1]) {
            report(format!("node {addr} keys are not strictly ascending"));
            errors += 1;
        }

        if !is_root && (node.keys.len() < self.min_keys() || node.keys.len() > self.order) {
            report(format!(
                "node {addr} has {} keys, outside [{}, {}]",
                node.keys.len(),
                self.min_keys(),
                self.order
            ));
            errors += 1;
        }

        if node.is_leaf {
            if node.keys.len() != node.slots.len() {
                report(format!("leaf {addr} has mismatched key/value counts"));
                errors += 1;
            }
        } else {
            if node.slots.len() != node.keys.len() + 1 {
                report(format!("internal node {addr} has wrong child count"));
                errors += 1;
            }
            for &child in &node.slots {
                errors += self.check_node(child, false, report)?;
            }
        }

        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = BTree::open(dir.path().join("t.blobs"), 3).unwrap();

        for i in 1..=50u64 {
            tree.insert(i, i * 10).unwrap();
        }
        for i in 1..=50u64 {
            assert_eq!(tree.get(i).unwrap(), Some(i * 10));
        }
        assert_eq!(tree.len(), 50);
    }

    #[test]
    fn each_yields_ascending_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = BTree::open(dir.path().join("t.blobs"), 5).unwrap();

        for i in (1..=200u64).rev() {
            tree.insert(i, i).unwrap();
        }

        let mut seen = Vec::new();
        tree.each(|k, _| {
            seen.push(k);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, (1..=200).collect::<Vec<_>>());
    }

    #[test]
    fn reverse_each_yields_descending_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = BTree::open(dir.path().join("t.blobs"), 5).unwrap();
        for i in 1..=200u64 {
            tree.insert(i, i).unwrap();
        }

        let mut seen = Vec::new();
        tree.reverse_each(|k, _| {
            seen.push(k);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, (1..=200).rev().collect::<Vec<_>>());
    }

    #[test]
    fn remove_then_get_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = BTree::open(dir.path().join("t.blobs"), 3).unwrap();
        for i in 1..=30u64 {
            tree.insert(i, i).unwrap();
        }
        for i in 1..=30u64 {
            assert!(tree.remove(i).unwrap());
            assert_eq!(tree.get(i).unwrap(), None);
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn remove_missing_key_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = BTree::open(dir.path().join("t.blobs"), 3).unwrap();
        tree.insert(1, 1).unwrap();
        assert!(!tree.remove(2).unwrap());
    }

    #[test]
    fn large_random_order_survives_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = BTree::open(dir.path().join("t.blobs"), 7).unwrap();

        let mut keys: Vec<u64> = (1..=1000).collect();
        // deterministic shuffle, no external rng dependency needed for this unit test
        for i in 0..keys.len() {
            let j = (i * 2654435761 + 17) % keys.len();
            keys.swap(i, j);
        }

        for &k in &keys {
            tree.insert(k, k * 2).unwrap();
        }

        let mut problems = Vec::new();
        let errors = tree.check(|msg| problems.push(msg)).unwrap();
        assert_eq!(errors, 0, "unexpected check failures: {problems:?}");
        assert_eq!(tree.len(), 1000);
    }

    #[test]
    fn rejects_even_order() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BTree::open(dir.path().join("t.blobs"), 4).is_err());
    }

    #[test]
    fn low_order_survives_reopen_in_ascending_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.blobs");

        let mut keys: Vec<u64> = (1..=500).collect();
        for i in 0..keys.len() {
            let j = (i * 2654435761 + 17) % keys.len();
            keys.swap(i, j);
        }

        {
            let mut tree = BTree::open(&path, 3).unwrap();
            for &k in &keys {
                tree.insert(k, k).unwrap();
            }
        }

        let mut tree = BTree::open(&path, 3).unwrap();
        let mut seen = Vec::new();
        tree.each(|k, v| {
            seen.push(k);
            assert_eq!(v, k);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, (1..=500).collect::<Vec<_>>());
    }
}
