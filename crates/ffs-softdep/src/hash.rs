#![forbid(unsafe_code)]
//! Keyed lookup tables for pagedeps, inodedeps and newblks.
//!
//! Buckets are chained vectors indexed by a randomly keyed hash, so a
//! workload cannot pick keys that collide on purpose. The bucket layout is
//! visible because the cleanup passes walk the table round-robin.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

#[derive(Debug)]
pub struct DepHash<K, V> {
    buckets: Vec<Vec<(K, V)>>,
    mask: usize,
    hasher: RandomState,
    len: usize,
}

impl<K: Hash + Eq + Copy, V: Copy> DepHash<K, V> {
    /// Table with `size` rounded up to a power of two buckets.
    #[must_use]
    pub fn with_buckets(size: usize) -> Self {
        let n = size.max(1).next_power_of_two();
        Self {
            buckets: (0..n).map(|_| Vec::new()).collect(),
            mask: n - 1,
            hasher: RandomState::new(),
            len: 0,
        }
    }

    fn bucket_of(&self, key: &K) -> usize {
        #[expect(clippy::cast_possible_truncation)]
        let h = self.hasher.hash_one(key) as usize;
        h & self.mask
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.buckets[self.bucket_of(key)]
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    /// Insert at the head of the key's chain. The caller guarantees the key
    /// is absent.
    pub fn insert(&mut self, key: K, value: V) {
        let b = self.bucket_of(&key);
        self.buckets[b].insert(0, (key, value));
        self.len += 1;
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let b = self.bucket_of(key);
        let pos = self.buckets[b].iter().position(|(k, _)| k == key)?;
        self.len -= 1;
        Some(self.buckets[b].remove(pos).1)
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn bucket(&self, index: usize) -> &[(K, V)] {
        self.buckets.get(index).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn values(&self) -> impl Iterator<Item = V> + '_ {
        self.buckets.iter().flatten().map(|(_, v)| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_count_rounds_up() {
        let h: DepHash<u64, u32> = DepHash::with_buckets(51);
        assert_eq!(h.bucket_count(), 64);
        let h: DepHash<u64, u32> = DepHash::with_buckets(0);
        assert_eq!(h.bucket_count(), 1);
    }

    #[test]
    fn insert_get_remove() {
        let mut h = DepHash::with_buckets(4);
        for k in 0..100_u64 {
            h.insert(k, k * 2);
        }
        assert_eq!(h.len(), 100);
        assert_eq!(h.get(&37), Some(74));
        assert_eq!(h.remove(&37), Some(74));
        assert_eq!(h.get(&37), None);
        assert_eq!(h.remove(&37), None);
        let total: usize = (0..h.bucket_count()).map(|b| h.bucket(b).len()).sum();
        assert_eq!(total, 99);
        assert_eq!(h.values().count(), 99);
    }
}
