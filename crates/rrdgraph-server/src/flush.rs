// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic flusher: drains the sample cache into RRD files.
//!
//! A sweep walks the cache shards round-robin. Series still marked MISS
//! are routed to the owner node as fetch tasks; everything else with
//! enough buffered samples is flushed locally. Sustained slow local
//! writes raise the process-wide flush-timeout flag, which degrades
//! remote fetches to sends until latency recovers.

use crate::migrate::Task;
use crate::runtime::Runtime;
use rrdgraph::rrd::MIN_FLUSH_ITEMS;
use rrdgraph::{
    rrd_file_path, split_rrd_cache_key, RrdBackend, GRAPH_F_ERR, GRAPH_F_FETCHING, GRAPH_F_MISS,
    GRAPH_F_SENDING,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A single-key flush slower than this marks local i/o as struggling.
const SLOW_FLUSH: Duration = Duration::from_millis(1000);

/// Run sweeps on the configured interval until shutdown.
pub async fn run_flusher(rt: Arc<Runtime>, shutdown: Arc<Notify>) {
    let period = Duration::from_secs(rt.cfg.flush_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => sweep(&rt).await,
            _ = shutdown.notified() => {
                debug!("flusher shutting down");
                return;
            }
        }
    }
}

/// One pass over every shard.
pub async fn sweep(rt: &Runtime) {
    let mut flushed = 0usize;
    let mut enqueued = 0usize;

    for idx in 0..rt.cache.shard_count() {
        for (key, len, flag) in rt.cache.shard_stats(idx) {
            if flag & (GRAPH_F_SENDING | GRAPH_F_FETCHING) != 0 {
                continue;
            }

            if flag & GRAPH_F_MISS != 0 {
                if enqueue_fetch(rt, &key).await {
                    enqueued += 1;
                    continue;
                }
                // owned locally (or no ring): materialize here instead
                rt.cache.clear_flag(&key, GRAPH_F_MISS);
            }

            if len >= MIN_FLUSH_ITEMS {
                flush_key(rt, &key);
                flushed += 1;
            }
        }
    }

    if flushed > 0 || enqueued > 0 {
        debug!(flushed, enqueued, "flusher sweep done");
    }
}

/// Route a MISS series to its owner's fetch queue. False when the series
/// has no remote owner and must be handled locally.
async fn enqueue_fetch(rt: &Runtime, key: &str) -> bool {
    let (Some(ring), Some(migrator)) = (&rt.ring, &rt.migrator) else {
        return false;
    };
    let Some((md5, _, _)) = split_rrd_cache_key(key) else {
        return false;
    };
    let Some(owner) = ring.owner(md5) else {
        return false;
    };
    if rt.cfg.is_local_node(owner) || !migrator.has_node(owner) {
        return false;
    }
    migrator
        .enqueue(owner, Task::Fetch { key: key.to_string() })
        .await
}

/// Flush one series to its file under the SENDING bit.
pub fn flush_key(rt: &Runtime, key: &str) {
    if !rt.cache.try_set_busy(key, GRAPH_F_SENDING) {
        return;
    }
    let start = Instant::now();

    let items = rt.cache.pop_all(key);
    if items.len() >= MIN_FLUSH_ITEMS {
        match split_rrd_cache_key(key) {
            Some((md5, ds_type, step)) => {
                let path = rrd_file_path(&rt.cfg.rrd.storage, md5, ds_type, step);
                if let Err(e) = rt.rrd.flush(&path, &items) {
                    warn!(key, error = %e, "flush failed, samples retained");
                    rt.cache.push_all(key, items);
                    rt.cache.or_flag(key, GRAPH_F_ERR);
                }
            }
            None => warn!(key, "unparseable cache key, samples dropped"),
        }
    } else if !items.is_empty() {
        // raced with a drain; put the leftovers back
        rt.cache.push_all(key, items);
    }

    rt.cache.clear_flag(key, GRAPH_F_SENDING);

    if let Some(migrator) = &rt.migrator {
        migrator.set_flush_timeout(start.elapsed() > SLOW_FLUSH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use rrdgraph::rrd::ConsolFn;
    use rrdgraph::GraphItem;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn gauge_item(ts: i64, value: f64) -> GraphItem {
        GraphItem {
            endpoint: "host-a".into(),
            metric: "cpu.idle".into(),
            tags: BTreeMap::new(),
            value,
            timestamp: ts,
            ds_type: "GAUGE".into(),
            step: 60,
            heartbeat: 120,
            min: "U".into(),
            max: "U".into(),
        }
    }

    fn test_runtime(dir: &TempDir) -> Runtime {
        let mut cfg = GraphConfig::default();
        cfg.rrd.storage = dir.path().to_string_lossy().into_owned();
        Runtime::new(cfg)
    }

    #[tokio::test]
    async fn sweep_flushes_full_series() {
        let dir = TempDir::new().unwrap();
        let rt = test_runtime(&dir);

        let key = gauge_item(0, 0.0).rrd_cache_key();
        for (ts, v) in [(100, 1.0), (160, 2.0), (220, 3.0)] {
            rt.cache.push_front(&key, gauge_item(ts, v));
        }

        sweep(&rt).await;

        assert_eq!(rt.cache.items_len(&key), 0);
        let (md5, ds, step) = split_rrd_cache_key(&key).unwrap();
        let path = rrd_file_path(&rt.cfg.rrd.storage, md5, ds, step);
        let datas = rt
            .rrd
            .fetch(&path, ConsolFn::Average, 100, 220, 60)
            .unwrap();
        assert_eq!(datas.len(), 3);
        assert_eq!(datas[2].value.0, 3.0);
    }

    #[tokio::test]
    async fn sweep_leaves_short_series_buffered() {
        let dir = TempDir::new().unwrap();
        let rt = test_runtime(&dir);

        let key = gauge_item(0, 0.0).rrd_cache_key();
        rt.cache.push_front(&key, gauge_item(100, 1.0));
        rt.cache.push_front(&key, gauge_item(160, 2.0));

        sweep(&rt).await;
        assert_eq!(rt.cache.items_len(&key), 2);
    }

    #[tokio::test]
    async fn sweep_skips_busy_series() {
        let dir = TempDir::new().unwrap();
        let rt = test_runtime(&dir);

        let key = gauge_item(0, 0.0).rrd_cache_key();
        for (ts, v) in [(100, 1.0), (160, 2.0), (220, 3.0)] {
            rt.cache.push_front(&key, gauge_item(ts, v));
        }
        rt.cache.try_set_busy(&key, GRAPH_F_FETCHING);

        sweep(&rt).await;
        assert_eq!(rt.cache.items_len(&key), 3);
    }

    #[tokio::test]
    async fn miss_without_ring_falls_back_to_local_flush() {
        let dir = TempDir::new().unwrap();
        let rt = test_runtime(&dir);

        let key = gauge_item(0, 0.0).rrd_cache_key();
        rt.cache
            .push_front_with_flag(&key, gauge_item(100, 1.0), GRAPH_F_MISS);
        rt.cache.push_front(&key, gauge_item(160, 2.0));
        rt.cache.push_front(&key, gauge_item(220, 3.0));

        sweep(&rt).await;

        assert_eq!(rt.cache.get_flag(&key) & GRAPH_F_MISS, 0);
        assert_eq!(rt.cache.items_len(&key), 0);
    }
}
