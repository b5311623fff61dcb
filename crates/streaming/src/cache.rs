use std::collections::{BTreeMap, BTreeSet};

use crate::keys::CacheKey;

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// A fresh copy of the stored tile.
    Hit(Vec<u8>),
    /// The tile is known to contain no features.
    Empty,
    Miss,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    bytes: Vec<u8>,
    last_used_tick: u64,
    inserted_tick: u64,
    pinned: bool,
}

/// Bounded LRU of encoded tiles with eviction-resistant pins.
///
/// Notes on determinism:
/// - Entries are keyed in a `BTreeMap` for stable traversal order.
/// - Eviction is LRU by `last_used_tick` among unpinned entries, with a
///   tie-break by key ordering. When everything is pinned the oldest insertion
///   goes, so `len() <= capacity` always holds.
#[derive(Debug)]
pub struct TileCache {
    capacity: usize,
    empty_retention_zoom: u8,
    tick: u64,
    entries: BTreeMap<CacheKey, CacheEntry>,
    empties: BTreeSet<CacheKey>,
}

impl TileCache {
    pub fn new(capacity: usize, empty_retention_zoom: u8) -> Self {
        Self {
            capacity: capacity.max(1),
            empty_retention_zoom,
            tick: 0,
            entries: BTreeMap::new(),
            empties: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored non-empty tiles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn empty_len(&self) -> usize {
        self.empties.len()
    }

    pub fn pinned_len(&self) -> usize {
        self.entries.values().filter(|e| e.pinned).count()
    }

    /// Looks up a tile; a hit becomes most recently used.
    pub fn get(&mut self, key: &CacheKey) -> CacheLookup {
        if let Some(entry) = self.entries.get_mut(key) {
            self.tick += 1;
            entry.last_used_tick = self.tick;
            return CacheLookup::Hit(entry.bytes.clone());
        }
        if self.empties.contains(key) {
            return CacheLookup::Empty;
        }
        CacheLookup::Miss
    }

    /// Lookup without touching recency.
    pub fn peek(&self, key: &CacheKey) -> CacheLookup {
        if let Some(entry) = self.entries.get(key) {
            return CacheLookup::Hit(entry.bytes.clone());
        }
        if self.empties.contains(key) {
            return CacheLookup::Empty;
        }
        CacheLookup::Miss
    }

    /// Stores a tile and returns the keys evicted to stay within capacity.
    ///
    /// Zero-length bytes record an empty marker, except at or above the
    /// retention zoom where empties are dropped.
    pub fn set(&mut self, key: CacheKey, bytes: Vec<u8>, pinned: bool) -> Vec<CacheKey> {
        if bytes.is_empty() {
            if key.coord.z < self.empty_retention_zoom {
                self.entries.remove(&key);
                self.empties.insert(key);
            }
            return Vec::new();
        }

        self.empties.remove(&key);
        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.bytes = bytes;
                entry.last_used_tick = tick;
                entry.pinned = pinned;
            }
            None => {
                self.entries.insert(
                    key.clone(),
                    CacheEntry {
                        bytes,
                        last_used_tick: tick,
                        inserted_tick: tick,
                        pinned,
                    },
                );
            }
        }

        self.evict_as_needed()
    }

    /// Drops everything, returning the number of stored tiles removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.empties.clear();
        removed
    }

    fn evict_as_needed(&mut self) -> Vec<CacheKey> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let lru_unpinned = self
                .entries
                .iter()
                .filter(|(_, e)| !e.pinned)
                .min_by(|(ka, ea), (kb, eb)| {
                    ea.last_used_tick
                        .cmp(&eb.last_used_tick)
                        .then_with(|| ka.cmp(kb))
                })
                .map(|(k, _)| k.clone());

            // Everything is pinned: fall back to the oldest insertion.
            let candidate = lru_unpinned.or_else(|| {
                self.entries
                    .iter()
                    .min_by(|(ka, ea), (kb, eb)| {
                        ea.inserted_tick
                            .cmp(&eb.inserted_tick)
                            .then_with(|| ka.cmp(kb))
                    })
                    .map(|(k, _)| k.clone())
            });

            let Some(key) = candidate else {
                break;
            };
            self.entries.remove(&key);
            evicted.push(key);
        }
        evicted
    }
}
