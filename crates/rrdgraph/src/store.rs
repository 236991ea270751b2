// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory sample cache: `cache key -> ordered sample buffer + flag word`.
//!
//! The map is split over 256 shards, each behind its own mutex, so a reader
//! of one shard never blocks a writer of another. Entries are long-lived:
//! `pop_all` drains the buffer but the entry and its flag word survive.

use crate::item::GraphItem;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

/// Series not yet materialized locally; the RRD file lives on a remote owner.
pub const GRAPH_F_MISS: u32 = 1 << 0;
/// Last send/fetch for this series failed.
pub const GRAPH_F_ERR: u32 = 1 << 1;
/// A send task holds the series (samples popped, RPC in flight).
pub const GRAPH_F_SENDING: u32 = 1 << 2;
/// A fetch task holds the series (file transfer in flight).
pub const GRAPH_F_FETCHING: u32 = 1 << 3;

const SHARD_COUNT: usize = 256;

#[derive(Debug, Default)]
struct CacheEntry {
    /// Newest sample at the front; ascending timestamps back-to-front.
    items: VecDeque<GraphItem>,
    flag: u32,
}

type Shard = Mutex<HashMap<String, CacheEntry>>;

/// Sharded concurrent sample cache.
pub struct GraphItemMap {
    shards: Vec<Shard>,
}

impl Default for GraphItemMap {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphItemMap {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self { shards }
    }

    /// Number of shards; the flusher sweeps them round-robin.
    pub fn shard_count(&self) -> usize {
        SHARD_COUNT
    }

    fn shard_for(&self, key: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Push a sample for `key`, creating the entry on first sight with
    /// `init_flag`. Samples older than or equal to the current head are
    /// dropped, keeping each series strictly monotone.
    ///
    /// Returns true if the sample was admitted.
    pub fn push_front_with_flag(&self, key: &str, item: GraphItem, init_flag: u32) -> bool {
        let mut shard = self.shard_for(key).lock();
        match shard.get_mut(key) {
            Some(entry) => push_monotone(entry, item),
            None => {
                let mut entry = CacheEntry {
                    items: VecDeque::new(),
                    flag: init_flag,
                };
                entry.items.push_front(item);
                shard.insert(key.to_string(), entry);
                true
            }
        }
    }

    /// `push_front_with_flag` with a zero initial flag.
    pub fn push_front(&self, key: &str, item: GraphItem) -> bool {
        self.push_front_with_flag(key, item, 0)
    }

    /// Newest sample for `key`, if any.
    pub fn first(&self, key: &str) -> Option<GraphItem> {
        let shard = self.shard_for(key).lock();
        shard.get(key).and_then(|e| e.items.front().cloned())
    }

    /// Snapshot in ascending-timestamp order without draining.
    pub fn fetch_all(&self, key: &str) -> Vec<GraphItem> {
        let shard = self.shard_for(key).lock();
        match shard.get(key) {
            Some(entry) => entry.items.iter().rev().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Drain: snapshot in ascending order and clear the buffer. The entry
    /// and its flag word survive.
    pub fn pop_all(&self, key: &str) -> Vec<GraphItem> {
        let mut shard = self.shard_for(key).lock();
        match shard.get_mut(key) {
            Some(entry) => entry.items.drain(..).rev().collect(),
            None => Vec::new(),
        }
    }

    /// Restore samples after a failed flush. `items` must be in ascending
    /// timestamp order; only samples strictly newer than the current head
    /// are re-admitted, so a restore can never resurrect a superseded
    /// timestamp.
    pub fn push_all(&self, key: &str, items: Vec<GraphItem>) {
        if items.is_empty() {
            return;
        }
        let mut shard = self.shard_for(key).lock();
        let entry = shard.entry(key.to_string()).or_default();
        for item in items {
            push_monotone(entry, item);
        }
    }

    /// Read the flag word, creating the entry if absent.
    pub fn get_flag(&self, key: &str) -> u32 {
        let mut shard = self.shard_for(key).lock();
        shard.entry(key.to_string()).or_default().flag
    }

    /// Overwrite the whole flag word, creating the entry if absent.
    pub fn set_flag(&self, key: &str, flag: u32) {
        let mut shard = self.shard_for(key).lock();
        shard.entry(key.to_string()).or_default().flag = flag;
    }

    /// OR `bits` into the flag word.
    pub fn or_flag(&self, key: &str, bits: u32) {
        let mut shard = self.shard_for(key).lock();
        let entry = shard.entry(key.to_string()).or_default();
        entry.flag |= bits;
    }

    /// Clear `bits` from the flag word.
    pub fn clear_flag(&self, key: &str, bits: u32) {
        let mut shard = self.shard_for(key).lock();
        let entry = shard.entry(key.to_string()).or_default();
        entry.flag &= !bits;
    }

    /// Claim the series for a send or fetch task: sets `bit` and returns
    /// true unless SENDING or FETCHING is already held by someone else.
    /// The whole test-and-set happens under the shard lock, so SENDING and
    /// FETCHING can never both be set for one key.
    pub fn try_set_busy(&self, key: &str, bit: u32) -> bool {
        debug_assert!(bit == GRAPH_F_SENDING || bit == GRAPH_F_FETCHING);
        let mut shard = self.shard_for(key).lock();
        let entry = shard.entry(key.to_string()).or_default();
        if entry.flag & (GRAPH_F_SENDING | GRAPH_F_FETCHING) != 0 {
            return false;
        }
        entry.flag |= bit;
        true
    }

    /// True if an entry exists for `key` (even with an empty buffer).
    pub fn contains_key(&self, key: &str) -> bool {
        self.shard_for(key).lock().contains_key(key)
    }

    /// Number of cached samples for `key`.
    pub fn items_len(&self, key: &str) -> usize {
        let shard = self.shard_for(key).lock();
        shard.get(key).map_or(0, |e| e.items.len())
    }

    /// Total number of series entries.
    pub fn key_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Total number of buffered samples across all series.
    pub fn item_total(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().values().map(|e| e.items.len()).sum::<usize>())
            .sum()
    }

    /// `(key, buffered samples, flag)` for every entry in shard `idx`.
    /// One lock acquisition; the flusher consumes this.
    pub fn shard_stats(&self, idx: usize) -> Vec<(String, usize, u32)> {
        let shard = self.shards[idx % SHARD_COUNT].lock();
        shard
            .iter()
            .map(|(k, e)| (k.clone(), e.items.len(), e.flag))
            .collect()
    }
}

fn push_monotone(entry: &mut CacheEntry, item: GraphItem) -> bool {
    if let Some(head) = entry.items.front() {
        if item.timestamp <= head.timestamp {
            return false;
        }
    }
    entry.items.push_front(item);
    true
}
