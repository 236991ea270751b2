// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared runtime state, constructed once at startup and passed
//! explicitly. Keeping construction pure keeps tests free of hidden
//! singletons.

use crate::config::GraphConfig;
use crate::migrate::Migrator;
use rrdgraph::{ConsistentRing, GraphItemMap, GraphStats, IndexCache, RecvDataTrace, RrdFileBackend};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;

/// Everything the facade, the flusher and the admin surface share.
pub struct Runtime {
    pub cfg: GraphConfig,
    pub cache: Arc<GraphItemMap>,
    pub index: Arc<IndexCache>,
    pub stats: Arc<GraphStats>,
    pub trace: Arc<RecvDataTrace>,
    pub rrd: Arc<RrdFileBackend>,
    /// Present when migration is enabled.
    pub ring: Option<ConsistentRing>,
    /// Attached after the worker pool dialed its connections.
    pub migrator: Option<Migrator>,
    /// Singleton permit for the index GC; an overlapping run is skipped.
    pub gc_gate: Semaphore,
}

impl Runtime {
    /// Build the runtime without a migration pool (attach one with
    /// `migrator = Some(..)` after `Migrator::start`).
    pub fn new(cfg: GraphConfig) -> Self {
        let ring = if cfg.migrate.enabled {
            Some(ConsistentRing::new(
                cfg.migrate.replicas,
                cfg.migrate.cluster.keys(),
            ))
        } else {
            None
        };

        Self {
            cfg,
            cache: Arc::new(GraphItemMap::new()),
            index: Arc::new(IndexCache::new()),
            stats: Arc::new(GraphStats::new()),
            trace: Arc::new(RecvDataTrace::new()),
            rrd: Arc::new(RrdFileBackend::default()),
            ring,
            migrator: None,
            gc_gate: Semaphore::new(1),
        }
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
