// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rrdgraph core - ingest/query/cache plumbing for an RRD-backed
//! time-series graph component.
//!
//! # Architecture
//!
//! ```text
//! GraphItemMap   (sharded in-memory sample cache, flag word per series)
//! IndexCache     (endpoint ids, counter -> dsType/step, last-seen)
//! RrdBackend     (fetch/flush seam over per-series round-robin files)
//! ConsistentRing (fingerprint -> authoritative cluster node)
//! merge          (RRD data + live cache -> one aligned series)
//! GraphStats     (atomic counters surfaced by the admin interface)
//! ```
//!
//! The crate is the synchronous data plane; the companion
//! `rrdgraph-server` crate wires it into an RPC service with cluster
//! migration workers.

pub mod index;
pub mod item;
pub mod merge;
pub mod proc;
pub mod ring;
pub mod rrd;
pub mod store;

pub use index::IndexCache;
pub use item::{
    form_rrd_cache_key, rrd_file_path, split_rrd_cache_key, DsType, GraphItem, JsonF64, RrdData,
};
pub use merge::merge_with_cache;
pub use proc::{GraphStats, RecvDataTrace, StatsSnapshot};
pub use ring::ConsistentRing;
pub use rrd::{ConsolFn, RrdBackend, RrdError, RrdFileBackend};
pub use store::{
    GraphItemMap, GRAPH_F_ERR, GRAPH_F_FETCHING, GRAPH_F_MISS, GRAPH_F_SENDING,
};
