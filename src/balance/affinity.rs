// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded recency cache from correlation id to the last replica index used.

use std::collections::VecDeque;

use parking_lot::Mutex;

pub const DEFAULT_AFFINITY_CAPACITY: usize = 10;

/// Least-recently-used map `correlation_id -> last index`.
///
/// Capacity is small (tens of entries), so a deque scanned front-to-back is
/// both simpler and faster than a linked hash map. The front is most recent.
#[derive(Debug)]
pub struct AffinityCache {
    capacity: usize,
    entries: Mutex<VecDeque<(i64, usize)>>,
}

impl AffinityCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Look up an id, promoting it to most recent.
    pub fn get(&self, correlation_id: i64) -> Option<usize> {
        let mut entries = self.entries.lock();
        Self::promote(&mut entries, correlation_id)
    }

    pub fn put(&self, correlation_id: i64, index: usize) {
        let mut entries = self.entries.lock();
        Self::insert(&mut entries, self.capacity, correlation_id, index);
    }

    /// Read-modify-write under one lock: `choose` receives the cached index
    /// (if any) and returns the index to store.
    pub fn update<F>(&self, correlation_id: i64, choose: F) -> usize
    where
        F: FnOnce(Option<usize>) -> usize,
    {
        let mut entries = self.entries.lock();
        let chosen = choose(Self::promote(&mut entries, correlation_id));
        Self::insert(&mut entries, self.capacity, correlation_id, chosen);
        chosen
    }

    fn promote(entries: &mut VecDeque<(i64, usize)>, correlation_id: i64) -> Option<usize> {
        let pos = entries.iter().position(|(id, _)| *id == correlation_id)?;
        let entry = entries.remove(pos)?;
        entries.push_front(entry);
        Some(entry.1)
    }

    fn insert(entries: &mut VecDeque<(i64, usize)>, capacity: usize, correlation_id: i64, index: usize) {
        if let Some(pos) = entries.iter().position(|(id, _)| *id == correlation_id) {
            entries.remove(pos);
        }
        entries.push_front((correlation_id, index));
        entries.truncate(capacity);
    }
}

impl Default for AffinityCache {
    fn default() -> Self {
        Self::new(DEFAULT_AFFINITY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing() {
        let cache = AffinityCache::default();
        assert_eq!(cache.get(7), None);
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 10);
    }

    #[test]
    fn test_put_overwrites() {
        let cache = AffinityCache::new(4);
        cache.put(1, 0);
        cache.put(1, 3);
        assert_eq!(cache.get(1), Some(3));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = AffinityCache::new(2);
        cache.put(1, 0);
        cache.put(2, 1);
        // touch 1 so 2 becomes the eviction candidate
        assert_eq!(cache.get(1), Some(0));
        cache.put(3, 2);

        assert_eq!(cache.get(2), None);
        assert_eq!(cache.get(1), Some(0));
        assert_eq!(cache.get(3), Some(2));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_update_sees_previous_value() {
        let cache = AffinityCache::new(3);
        assert_eq!(cache.update(9, |prev| prev.map_or(0, |i| i + 1)), 0);
        assert_eq!(cache.update(9, |prev| prev.map_or(0, |i| i + 1)), 1);
        assert_eq!(cache.get(9), Some(1));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let cache = AffinityCache::new(0);
        cache.put(1, 1);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.get(1), Some(1));
    }
}
