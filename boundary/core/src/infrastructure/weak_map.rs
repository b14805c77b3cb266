// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Weakly keyed map and soft references.
//!
//! [`WeakKeyMap`] is keyed by the allocation identity of an `Arc` and holds
//! only a `Weak` to the key, so membership never keeps a key alive. An entry
//! whose key has been dropped can no longer be looked up and is expunged the
//! next time the map gains a new key.
//!
//! Keying by address is sound because the stored `Weak` keeps the allocation
//! (not the value) reserved: no new `Arc` can be placed at that address while
//! the entry exists.
//!
//! [`SoftRef`] is a clearable strong slot. It stands in for a reference the
//! runtime may drop under memory pressure; its owner decides when to clear it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

struct WeakEntry<K, V> {
    key: Weak<K>,
    value: V,
}

impl<K, V> WeakEntry<K, V> {
    fn is_live(&self) -> bool {
        self.key.strong_count() > 0
    }
}

pub struct WeakKeyMap<K, V> {
    entries: HashMap<usize, WeakEntry<K, V>>,
}

fn identity<K>(key: &Arc<K>) -> usize {
    Arc::as_ptr(key) as *const () as usize
}

impl<K, V> WeakKeyMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &Arc<K>) -> Option<&V> {
        self.entries
            .get(&identity(key))
            .filter(|entry| entry.is_live())
            .map(|entry| &entry.value)
    }

    pub fn get_mut(&mut self, key: &Arc<K>) -> Option<&mut V> {
        self.entries
            .get_mut(&identity(key))
            .filter(|entry| entry.is_live())
            .map(|entry| &mut entry.value)
    }

    /// Value for `key`, inserting `make()` if absent. Inserting a new key
    /// first expunges entries whose keys have been dropped.
    pub fn get_or_insert_with(&mut self, key: &Arc<K>, make: impl FnOnce() -> V) -> &mut V {
        let id = identity(key);
        if !self.entries.contains_key(&id) {
            self.expunge_stale();
        }
        &mut self
            .entries
            .entry(id)
            .or_insert_with(|| WeakEntry {
                key: Arc::downgrade(key),
                value: make(),
            })
            .value
    }

    /// Drop every entry whose key is gone. Returns how many were removed.
    pub fn expunge_stale(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live());
        before - self.entries.len()
    }

    /// Number of entries whose key is still alive.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|entry| entry.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values of entries whose key is still alive.
    pub fn live_values(&self) -> impl Iterator<Item = &V> {
        self.entries
            .values()
            .filter(|entry| entry.is_live())
            .map(|entry| &entry.value)
    }

    pub fn live_values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries
            .values_mut()
            .filter(|entry| entry.is_live())
            .map(|entry| &mut entry.value)
    }
}

impl<K, V> Default for WeakKeyMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SoftRef<T> {
    referent: Option<Arc<T>>,
    last_access: Instant,
}

impl<T> SoftRef<T> {
    pub fn new(referent: Arc<T>) -> Self {
        Self {
            referent: Some(referent),
            last_access: Instant::now(),
        }
    }

    /// The referent, if not cleared. Counts as a use for idle tracking.
    pub fn get(&mut self) -> Option<Arc<T>> {
        let referent = self.referent.clone()?;
        self.last_access = Instant::now();
        Some(referent)
    }

    /// Returns true if a referent was released.
    pub fn clear(&mut self) -> bool {
        self.referent.take().is_some()
    }

    pub fn is_cleared(&self) -> bool {
        self.referent.is_none()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_does_not_keep_key_alive() {
        let mut map = WeakKeyMap::new();
        let key = Arc::new("domain-a".to_string());
        map.get_or_insert_with(&key, || 1);
        assert_eq!(map.get(&key), Some(&1));

        let weak = Arc::downgrade(&key);
        drop(key);
        assert!(weak.upgrade().is_none());
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_stale_entries_expunged_on_insert() {
        let mut map = WeakKeyMap::new();
        let dropped = Arc::new(1u32);
        map.get_or_insert_with(&dropped, || "stale");
        drop(dropped);

        let kept = Arc::new(2u32);
        map.get_or_insert_with(&kept, || "live");
        assert_eq!(map.entries.len(), 1);
        assert_eq!(map.get(&kept), Some(&"live"));
    }

    #[test]
    fn test_keys_compare_by_identity() {
        let mut map = WeakKeyMap::new();
        let a = Arc::new(7u8);
        let b = Arc::new(7u8);
        *map.get_or_insert_with(&a, || 0) += 1;
        *map.get_or_insert_with(&a, || 0) += 1;
        map.get_or_insert_with(&b, || 10);
        assert_eq!(map.get(&a), Some(&2));
        assert_eq!(map.get(&b), Some(&10));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_soft_ref_clear() {
        let mut soft = SoftRef::new(Arc::new(5));
        assert_eq!(soft.get().as_deref(), Some(&5));
        assert!(soft.clear());
        assert!(soft.is_cleared());
        assert!(soft.get().is_none());
        assert!(!soft.clear());
    }
}
