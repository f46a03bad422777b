// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Fixed-size on-disk layout of a single B-tree node (§3 "B-tree node", §4.3).

use crate::coding::{read_u16, read_u64, read_u8, write_u16, write_u64, write_u8};
use crate::error::{Error, Result};

/// An order-`order` node: a leaf holds `keys[i] -> slots[i]` pairs (`slots` are values);
/// an internal node holds `keys.len() + 1` children in `slots`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct Node {
    pub is_leaf: bool,
    pub parent: u64,
    pub prev_leaf: u64,
    pub next_leaf: u64,
    pub keys: Vec<u64>,
    pub slots: Vec<u64>,
}

impl Node {
    pub fn new_leaf() -> Self {
        Self {
            is_leaf: true,
            parent: 0,
            prev_leaf: 0,
            next_leaf: 0,
            keys: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Serialized cell size for a tree of the given `order`.
    pub fn entry_bytes(order: usize) -> usize {
        // is_leaf(1) + parent(8) + prev_leaf(8) + next_leaf(8) + key_count(2)
        // + keys(order*8) + slots((order+1)*8)
        27 + (2 * order + 1) * 8
    }

    #[allow(clippy::unwrap_used)] // writes into a Vec<u8>, which cannot fail
    pub fn encode(&self, order: usize) -> Vec<u8> {
        assert!(self.keys.len() <= order);
        assert!(self.slots.len() <= order + 1);

        let mut buf = Vec::with_capacity(Self::entry_bytes(order));
        write_u8(&mut buf, u8::from(self.is_leaf)).unwrap();
        write_u64(&mut buf, self.parent).unwrap();
        write_u64(&mut buf, self.prev_leaf).unwrap();
        write_u64(&mut buf, self.next_leaf).unwrap();
        write_u16(&mut buf, self.keys.len() as u16).unwrap();

        for i in 0..order {
            write_u64(&mut buf, *self.keys.get(i).unwrap_or(&0)).unwrap();
        }
        for i in 0..=order {
            write_u64(&mut buf, *self.slots.get(i).unwrap_or(&0)).unwrap();
        }

        buf
    }

    #[allow(clippy::indexing_slicing)] // key_count/slot_count are checked against order above
    pub fn decode(order: usize, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::entry_bytes(order) {
            return Err(Error::Corruption(format!(
                "B-tree node has {} bytes, expected {}",
                bytes.len(),
                Self::entry_bytes(order)
            )));
        }

        let mut r = bytes;
        let is_leaf = read_u8(&mut r)? != 0;
        let parent = read_u64(&mut r)?;
        let prev_leaf = read_u64(&mut r)?;
        let next_leaf = read_u64(&mut r)?;
        let key_count = read_u16(&mut r)? as usize;

        if key_count > order {
            return Err(Error::Corruption(format!(
                "B-tree node reports {key_count} keys, order is {order}"
            )));
        }

        let mut all_keys = Vec::with_capacity(order);
        for _ in 0..order {
            all_keys.push(read_u64(&mut r)?);
        }
        let keys = all_keys[..key_count].to_vec();

        let slot_count = if is_leaf { key_count } else { key_count + 1 };
        let mut all_slots = Vec::with_capacity(order + 1);
        for _ in 0..=order {
            all_slots.push(read_u64(&mut r)?);
        }
        let slots = all_slots[..slot_count].to_vec();

        Ok(Self {
            is_leaf,
            parent,
            prev_leaf,
            next_leaf,
            keys,
            slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trips() {
        let node = Node {
            is_leaf: true,
            parent: 3,
            prev_leaf: 1,
            next_leaf: 2,
            keys: vec![10, 20, 30],
            slots: vec![100, 200, 300],
        };
        let bytes = node.encode(5);
        assert_eq!(bytes.len(), Node::entry_bytes(5));
        assert_eq!(Node::decode(5, &bytes).unwrap(), node);
    }

    #[test]
    fn internal_round_trips() {
        let node = Node {
            is_leaf: false,
            parent: 0,
            prev_leaf: 0,
            next_leaf: 0,
            keys: vec![10, 20],
            slots: vec![1, 2, 3],
        };
        let bytes = node.encode(5);
        assert_eq!(Node::decode(5, &bytes).unwrap(), node);
    }
}
