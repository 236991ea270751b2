// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monotonic counters surfaced by the admin interface, plus a live tap of
//! the most recent received items matching a configurable series filter.

use crate::item::{md5_hex, GraphItem};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

// Migration stat slots.
pub const FETCH_S_SUCCESS: usize = 0;
pub const FETCH_S_ERR: usize = 1;
pub const SEND_S_SUCCESS: usize = 2;
pub const SEND_S_ERR: usize = 3;
pub const QUERY_S_SUCCESS: usize = 4;
pub const QUERY_S_ERR: usize = 5;
pub const CONN_S_ERR: usize = 6;
pub const CONN_S_DIAL: usize = 7;
const STAT_SIZE: usize = 8;

/// Process-wide monotonic counters. Increment is a Relaxed atomic add;
/// snapshots load every counter once.
#[derive(Default)]
pub struct GraphStats {
    graph_rpc_recv: AtomicU64,
    query: AtomicU64,
    index_update_all: AtomicU64,
    index_delete: AtomicU64,
    migrate: [AtomicU64; STAT_SIZE],
}

impl GraphStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_recv(&self) {
        self.graph_rpc_recv.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_query(&self) {
        self.query.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_index_update(&self) {
        self.index_update_all.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_index_delete(&self) {
        self.index_delete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_migrate(&self, slot: usize) {
        self.migrate[slot].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            graph_rpc_recv_cnt: self.graph_rpc_recv.load(Ordering::Relaxed),
            query_cnt: self.query.load(Ordering::Relaxed),
            index_update_all_cnt: self.index_update_all.load(Ordering::Relaxed),
            index_delete_cnt: self.index_delete.load(Ordering::Relaxed),
            fetch_s_success: self.migrate[FETCH_S_SUCCESS].load(Ordering::Relaxed),
            fetch_s_err: self.migrate[FETCH_S_ERR].load(Ordering::Relaxed),
            send_s_success: self.migrate[SEND_S_SUCCESS].load(Ordering::Relaxed),
            send_s_err: self.migrate[SEND_S_ERR].load(Ordering::Relaxed),
            query_s_success: self.migrate[QUERY_S_SUCCESS].load(Ordering::Relaxed),
            query_s_err: self.migrate[QUERY_S_ERR].load(Ordering::Relaxed),
            conn_s_err: self.migrate[CONN_S_ERR].load(Ordering::Relaxed),
            conn_s_dial: self.migrate[CONN_S_DIAL].load(Ordering::Relaxed),
        }
    }
}

/// One consistent read of every counter.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub graph_rpc_recv_cnt: u64,
    pub query_cnt: u64,
    pub index_update_all_cnt: u64,
    pub index_delete_cnt: u64,
    pub fetch_s_success: u64,
    pub fetch_s_err: u64,
    pub send_s_success: u64,
    pub send_s_err: u64,
    pub query_s_success: u64,
    pub query_s_err: u64,
    pub conn_s_err: u64,
    pub conn_s_dial: u64,
}

const TRACE_CAPACITY: usize = 20;

/// Live tap: keeps the last few received items whose fingerprint matches
/// the configured `(endpoint, metric, tags)` filter.
pub struct RecvDataTrace {
    pk: RwLock<String>,
    items: Mutex<VecDeque<GraphItem>>,
}

impl Default for RecvDataTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvDataTrace {
    pub fn new() -> Self {
        Self {
            pk: RwLock::new(String::new()),
            items: Mutex::new(VecDeque::with_capacity(TRACE_CAPACITY)),
        }
    }

    /// Point the tap at a series; clears previously captured items.
    pub fn set_trace_config(
        &self,
        endpoint: &str,
        metric: &str,
        tags: &BTreeMap<String, String>,
    ) {
        let pk = if tags.is_empty() {
            format!("{endpoint}/{metric}")
        } else {
            let joined: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
            format!("{endpoint}/{metric}/{}", joined.join(","))
        };
        *self.pk.write() = md5_hex(&pk);
        self.items.lock().clear();
    }

    /// True if `checksum` is the traced fingerprint.
    pub fn matches(&self, checksum: &str) -> bool {
        let pk = self.pk.read();
        !pk.is_empty() && *pk == checksum
    }

    /// Capture an item (newest first, bounded).
    pub fn push_front(&self, item: GraphItem) {
        let mut items = self.items.lock();
        if items.len() == TRACE_CAPACITY {
            items.pop_back();
        }
        items.push_front(item);
    }

    /// Captured items, newest first.
    pub fn filter_all(&self) -> Vec<GraphItem> {
        self.items.lock().iter().cloned().collect()
    }
}
