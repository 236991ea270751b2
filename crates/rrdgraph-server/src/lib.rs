// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rrdgraph service.
//!
//! Wires the `rrdgraph` core into a running node:
//!
//! ```text
//! GraphRpcServer  (length-prefixed JSON over TCP: Ping/Send/Query/Info/GetRrd)
//! GraphService    (the facade orchestrating cache, index, rrd, migration)
//! Migrator        (per-node queues + workers over persistent connections)
//! flusher         (periodic cache -> RRD sweeps)
//! index GC cron   (weekly retention pruning)
//! admin router    (read-only HTTP: statistics, trace tap, forced GC)
//! ```
//!
//! Everything shares one explicitly constructed [`runtime::Runtime`].

pub mod admin;
pub mod config;
pub mod cron;
pub mod flush;
pub mod migrate;
pub mod rpc;
pub mod runtime;
pub mod service;

pub use config::{ConfigError, GraphConfig};
pub use migrate::{Migrator, Task};
pub use rpc::{GraphRpcServer, RpcClient, RpcError};
pub use runtime::Runtime;
pub use service::{GraphService, ServiceError};
