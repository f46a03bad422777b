// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A bounded, modulo-indexed read cache (§4.5).
//!
//! Unlike a textbook LRU, a slot is chosen by `address % capacity`: a collision simply
//! evicts whatever previously lived in that slot. This is safe because every entry this
//! cache ever holds is already durable on disk before it is cached (see
//! [`EquiBlobsFile`](crate::equi_blobs_file::EquiBlobsFile)'s write-through discipline), so
//! dropping an entry on eviction never loses data.

struct Slot<T> {
    address: u64,
    value: T,
}

/// A read-through cache over values of type `T`, keyed by a `u64` address.
pub struct PageCache<T> {
    capacity: usize,
    slots: Vec<Option<Slot<T>>>,
}

impl<T: Clone> PageCache<T> {
    /// Creates a cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    fn slot_index(&self, address: u64) -> usize {
        (address as usize) % self.capacity
    }

    /// Caches `value` for `address`, evicting whatever previously occupied that slot.
    #[allow(clippy::indexing_slicing)] // slot_index() is always < self.slots.len()
    pub fn insert(&mut self, address: u64, value: T) {
        let idx = self.slot_index(address);
        self.slots[idx] = Some(Slot { address, value });
    }

    /// Returns a clone of the cached value for `address`, if present.
    #[must_use]
    #[allow(clippy::indexing_slicing)] // slot_index() is always < self.slots.len()
    pub fn get(&self, address: u64) -> Option<T> {
        let idx = self.slot_index(address);
        match &self.slots[idx] {
            Some(slot) if slot.address == address => Some(slot.value.clone()),
            _ => None,
        }
    }

    /// Drops the cached entry for `address`, if any. Used when the caller knows the backing
    /// store and the cache have diverged (e.g. the address was just freed and may be
    /// recycled for unrelated data).
    #[allow(clippy::indexing_slicing)] // slot_index() is always < self.slots.len()
    pub fn remove(&mut self, address: u64) {
        let idx = self.slot_index(address);
        if matches!(&self.slots[idx], Some(slot) if slot.address == address) {
            self.slots[idx] = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_after_insert_returns_value() {
        let mut cache: PageCache<u64> = PageCache::new(4);
        cache.insert(1, 100);
        assert_eq!(cache.get(1), Some(100));
        assert_eq!(cache.get(2), None);
    }

    #[test]
    fn colliding_address_evicts_previous_entry() {
        let mut cache: PageCache<u64> = PageCache::new(4);
        cache.insert(1, 10);

        // address 5 collides with address 1 in a 4-slot cache.
        cache.insert(5, 50);

        assert_eq!(cache.get(1), None);
        assert_eq!(cache.get(5), Some(50));
    }

    #[test]
    fn remove_drops_single_entry() {
        let mut cache: PageCache<u64> = PageCache::new(8);
        cache.insert(1, 1);
        cache.remove(1);
        assert_eq!(cache.get(1), None);
    }

    #[test]
    fn remove_of_stale_address_in_slot_is_a_no_op() {
        let mut cache: PageCache<u64> = PageCache::new(4);
        cache.insert(1, 10);
        cache.insert(5, 50); // evicts address 1 from the shared slot
        cache.remove(1); // address 1 no longer occupies that slot
        assert_eq!(cache.get(5), Some(50));
    }
}
