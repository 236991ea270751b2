// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Series index: endpoint name -> endpoint id, and
//! `(endpoint id, counter) -> (dsType, step)`.
//!
//! Populated on ingest, consumed on query. Durability is delegated to an
//! external index store; queries never block on it. The weekly GC prunes
//! counters unseen for the retention horizon (and endpoints left with no
//! counters).

use crate::item::GraphItem;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug)]
struct CounterMeta {
    ds_type: String,
    step: i64,
    last_seen: AtomicI64,
}

/// Concurrent in-memory series index.
pub struct IndexCache {
    endpoints: DashMap<String, u64>,
    counters: DashMap<(u64, String), CounterMeta>,
    next_id: AtomicU64,
}

impl Default for IndexCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexCache {
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
            counters: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Record both mappings for a received item. Idempotent per identity:
    /// the first writer of a counter fixes its `(dsType, step)`; later
    /// conflicting updates only refresh the last-seen timestamp.
    pub fn receive_item(&self, item: &GraphItem, now: i64) {
        let id = self.endpoint_id_or_insert(&item.endpoint);
        let key = (id, item.counter_name());
        if let Some(meta) = self.counters.get(&key) {
            meta.last_seen.store(now, Ordering::Relaxed);
            return;
        }
        self.counters.entry(key).or_insert_with(|| CounterMeta {
            ds_type: item.ds_type.clone(),
            step: item.step,
            last_seen: AtomicI64::new(now),
        });
    }

    fn endpoint_id_or_insert(&self, endpoint: &str) -> u64 {
        if let Some(id) = self.endpoints.get(endpoint) {
            return *id;
        }
        *self
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Endpoint id, if the endpoint has ever been seen.
    pub fn endpoint_id(&self, endpoint: &str) -> Option<u64> {
        self.endpoints.get(endpoint).map(|id| *id)
    }

    /// `(dsType, step)` for a counter of an endpoint.
    pub fn ds_type_and_step(&self, endpoint_id: u64, counter: &str) -> Option<(String, i64)> {
        self.counters
            .get(&(endpoint_id, counter.to_string()))
            .map(|meta| (meta.ds_type.clone(), meta.step))
    }

    /// Drop counters last seen before `horizon_ts`, then endpoints with no
    /// remaining counters. Returns `(endpoints deleted, counters deleted)`.
    pub fn delete_older_than(&self, horizon_ts: i64) -> (usize, usize) {
        let counters_before = self.counters.len();
        self.counters
            .retain(|_, meta| meta.last_seen.load(Ordering::Relaxed) >= horizon_ts);
        let counters_deleted = counters_before - self.counters.len();

        let live_ids: std::collections::HashSet<u64> =
            self.counters.iter().map(|e| e.key().0).collect();
        let endpoints_before = self.endpoints.len();
        self.endpoints.retain(|_, id| live_ids.contains(id));
        let endpoints_deleted = endpoints_before - self.endpoints.len();

        (endpoints_deleted, counters_deleted)
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn item(endpoint: &str, metric: &str, ds_type: &str, step: i64) -> GraphItem {
        GraphItem {
            endpoint: endpoint.into(),
            metric: metric.into(),
            tags: BTreeMap::new(),
            value: 0.0,
            timestamp: 0,
            ds_type: ds_type.into(),
            step,
            heartbeat: 0,
            min: "U".into(),
            max: "U".into(),
        }
    }

    #[test]
    fn receive_then_lookup() {
        let index = IndexCache::new();
        index.receive_item(&item("host-a", "cpu.idle", "GAUGE", 60), 1000);

        let id = index.endpoint_id("host-a").unwrap();
        let (ds, step) = index.ds_type_and_step(id, "cpu.idle").unwrap();
        assert_eq!(ds, "GAUGE");
        assert_eq!(step, 60);
        assert!(index.endpoint_id("host-b").is_none());
        assert!(index.ds_type_and_step(id, "cpu.busy").is_none());
    }

    #[test]
    fn endpoint_ids_are_stable_and_unique() {
        let index = IndexCache::new();
        index.receive_item(&item("host-a", "m", "GAUGE", 60), 0);
        index.receive_item(&item("host-b", "m", "GAUGE", 60), 0);
        index.receive_item(&item("host-a", "m2", "GAUGE", 60), 0);

        let a = index.endpoint_id("host-a").unwrap();
        let b = index.endpoint_id("host-b").unwrap();
        assert_ne!(a, b);
        assert_eq!(index.endpoint_id("host-a").unwrap(), a);
    }

    #[test]
    fn first_writer_wins_on_conflict() {
        let index = IndexCache::new();
        index.receive_item(&item("host-a", "traffic", "COUNTER", 60), 100);
        index.receive_item(&item("host-a", "traffic", "GAUGE", 300), 200);

        let id = index.endpoint_id("host-a").unwrap();
        let (ds, step) = index.ds_type_and_step(id, "traffic").unwrap();
        assert_eq!(ds, "COUNTER");
        assert_eq!(step, 60);
    }

    #[test]
    fn gc_prunes_stale_counters_and_orphan_endpoints() {
        let index = IndexCache::new();
        index.receive_item(&item("old-host", "m", "GAUGE", 60), 100);
        index.receive_item(&item("live-host", "m", "GAUGE", 60), 100);
        // refresh only live-host past the horizon
        index.receive_item(&item("live-host", "m", "GAUGE", 60), 5000);

        let (endpoints, counters) = index.delete_older_than(1000);
        assert_eq!(endpoints, 1);
        assert_eq!(counters, 1);
        assert!(index.endpoint_id("old-host").is_none());
        let id = index.endpoint_id("live-host").unwrap();
        assert!(index.ds_type_and_step(id, "m").is_some());
    }
}
