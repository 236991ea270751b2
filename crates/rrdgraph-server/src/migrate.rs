// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cluster migration workers.
//!
//! Every remote node gets a task queue of capacity 1 and `concurrency`
//! workers, each owning one persistent RPC connection. The tiny queue
//! serializes per-node pressure on purpose: a slow node backs up into the
//! enqueuer instead of into memory.
//!
//! A worker never exits on connection errors; it re-dials in place at
//! 500 ms intervals and stays blocked while doing so (one task in flight
//! per worker).

use crate::config::GraphConfig;
use crate::rpc::{GraphRequest, GraphResponse, QueryParam, QueryResponse, RpcClient, RpcError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rrdgraph::proc::{
    CONN_S_DIAL, CONN_S_ERR, FETCH_S_ERR, FETCH_S_SUCCESS, QUERY_S_ERR, QUERY_S_SUCCESS,
    SEND_S_ERR, SEND_S_SUCCESS,
};
use rrdgraph::rrd::write_atomic;
use rrdgraph::{
    rrd_file_path, split_rrd_cache_key, GraphItemMap, GraphStats, RrdBackend, RrdFileBackend,
    GRAPH_F_ERR, GRAPH_F_FETCHING, GRAPH_F_MISS, GRAPH_F_SENDING,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

const RPC_RETRIES: usize = 3;
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Work shipped to a remote node's queue.
pub enum Task {
    /// Pop the buffered samples for `key` and send them to the owner.
    Send { key: String },

    /// Forward a range query to the owner and reply through `done`.
    Query {
        param: QueryParam,
        done: oneshot::Sender<Result<QueryResponse, RpcError>>,
    },

    /// Pull the owner's RRD file for `key` local, then flush the buffered
    /// samples into it.
    Fetch { key: String },
}

#[derive(Clone)]
struct WorkerCtx {
    cache: Arc<GraphItemMap>,
    rrd: Arc<RrdFileBackend>,
    stats: Arc<GraphStats>,
    storage: String,
    call_timeout: Duration,
    flush_timeout: Arc<AtomicBool>,
}

/// Handle over the per-node queues.
pub struct Migrator {
    queues: HashMap<String, mpsc::Sender<Task>>,
    flush_timeout: Arc<AtomicBool>,
}

impl Migrator {
    /// Dial `concurrency` connections per remote node and spawn their
    /// workers. A dial failure at startup is fatal.
    pub async fn start(
        cfg: &GraphConfig,
        cache: Arc<GraphItemMap>,
        rrd: Arc<RrdFileBackend>,
        stats: Arc<GraphStats>,
    ) -> Result<Self, RpcError> {
        let flush_timeout = Arc::new(AtomicBool::new(false));
        let ctx = WorkerCtx {
            cache,
            rrd,
            stats,
            storage: cfg.rrd.storage.clone(),
            call_timeout: Duration::from_millis(cfg.call_timeout_ms),
            flush_timeout: Arc::clone(&flush_timeout),
        };

        let mut queues = HashMap::new();
        for (node, addr) in &cfg.migrate.cluster {
            if cfg.is_local_node(node) {
                continue;
            }
            let (tx, rx) = mpsc::channel::<Task>(1);
            let rx = Arc::new(Mutex::new(rx));
            for slot in 0..cfg.migrate.concurrency {
                let client = RpcClient::dial(addr).await?;
                tokio::spawn(task_worker(
                    node.clone(),
                    slot,
                    Arc::clone(&rx),
                    client,
                    ctx.clone(),
                ));
            }
            info!(node = %node, addr = %addr, concurrency = cfg.migrate.concurrency, "migration workers up");
            queues.insert(node.clone(), tx);
        }

        Ok(Self {
            queues,
            flush_timeout,
        })
    }

    /// Queue a task for `node`, waiting for queue space. False if the
    /// node has no queue (unknown or local).
    pub async fn enqueue(&self, node: &str, task: Task) -> bool {
        match self.queues.get(node) {
            Some(tx) => tx.send(task).await.is_ok(),
            None => false,
        }
    }

    pub fn has_node(&self, node: &str) -> bool {
        self.queues.contains_key(node)
    }

    /// Raised by the flusher when local RRD writes run slow; fetch tasks
    /// degrade to sends while set.
    pub fn set_flush_timeout(&self, slow: bool) {
        self.flush_timeout.store(slow, Ordering::Relaxed);
    }

    pub fn flush_timeout(&self) -> bool {
        self.flush_timeout.load(Ordering::Relaxed)
    }
}

async fn task_worker(
    node: String,
    slot: usize,
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    mut client: RpcClient,
    ctx: WorkerCtx,
) {
    debug!(node = %node, slot, "migration worker started");
    loop {
        let task = {
            let mut rx = rx.lock().await;
            match rx.recv().await {
                Some(task) => task,
                None => return,
            }
        };

        match task {
            Task::Send { key } => {
                let stat = match send_data(&mut client, &ctx, &key).await {
                    Ok(()) => SEND_S_SUCCESS,
                    Err(_) => SEND_S_ERR,
                };
                ctx.stats.incr_migrate(stat);
            }
            Task::Query { param, done } => {
                let result = query_data(&mut client, &ctx, param).await;
                ctx.stats.incr_migrate(match &result {
                    Ok(_) => QUERY_S_SUCCESS,
                    Err(_) => QUERY_S_ERR,
                });
                let _ = done.send(result);
            }
            Task::Fetch { key } => {
                if ctx.flush_timeout.load(Ordering::Relaxed) {
                    // local i/o is behind; shipping samples beats pulling
                    // a whole file we cannot flush into anyway
                    let stat = match send_data(&mut client, &ctx, &key).await {
                        Ok(()) => SEND_S_SUCCESS,
                        Err(_) => SEND_S_ERR,
                    };
                    ctx.stats.incr_migrate(stat);
                } else {
                    let stat = match fetch_rrd(&mut client, &ctx, &key).await {
                        Ok(()) => FETCH_S_SUCCESS,
                        Err(_) => FETCH_S_ERR,
                    };
                    ctx.stats.incr_migrate(stat);
                }
            }
        }
    }
}

/// Call with up to three attempts. A shutdown (or poisoned) connection is
/// re-dialed between attempts; the worker blocks in the re-dial loop.
async fn call_with_retry(
    client: &mut RpcClient,
    ctx: &WorkerCtx,
    request: &GraphRequest,
) -> Result<GraphResponse, RpcError> {
    let mut last_err = RpcError::Shutdown("not attempted".into());
    for _ in 0..RPC_RETRIES {
        match client.call(request, ctx.call_timeout).await {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                // a timed-out exchange also poisons our strict
                // request/response framing, so re-dial for that too
                if e.needs_reconnect() || client.is_poisoned() {
                    reconnect(client, ctx).await;
                }
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Close and re-dial until it works, at 500 ms intervals. Blocks the
/// worker, which is the intended back-pressure.
async fn reconnect(client: &mut RpcClient, ctx: &WorkerCtx) {
    ctx.stats.incr_migrate(CONN_S_ERR);
    loop {
        ctx.stats.incr_migrate(CONN_S_DIAL);
        match client.redial().await {
            Ok(()) => return,
            Err(e) => {
                debug!(addr = client.addr(), error = %e, "re-dial failed");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}

async fn send_data(client: &mut RpcClient, ctx: &WorkerCtx, key: &str) -> Result<(), RpcError> {
    if !ctx.cache.try_set_busy(key, GRAPH_F_SENDING) {
        // another send/fetch holds the series; the cache keeps accumulating
        return Ok(());
    }

    let items = ctx.cache.pop_all(key);
    let result = if items.is_empty() {
        Ok(())
    } else {
        match call_with_retry(client, ctx, &GraphRequest::Send(items.clone())).await {
            Ok(_) => Ok(()),
            Err(e) => {
                ctx.cache.push_all(key, items);
                ctx.cache.or_flag(key, GRAPH_F_ERR);
                Err(e)
            }
        }
    };

    ctx.cache.clear_flag(key, GRAPH_F_SENDING);
    result
}

async fn query_data(
    client: &mut RpcClient,
    ctx: &WorkerCtx,
    param: QueryParam,
) -> Result<QueryResponse, RpcError> {
    match call_with_retry(client, ctx, &GraphRequest::Query(param)).await? {
        GraphResponse::Query(resp) => Ok(resp),
        other => Err(RpcError::Protocol(format!(
            "unexpected response to Graph.Query: {other:?}"
        ))),
    }
}

async fn fetch_rrd(client: &mut RpcClient, ctx: &WorkerCtx, key: &str) -> Result<(), RpcError> {
    if !ctx.cache.try_set_busy(key, GRAPH_F_FETCHING) {
        return Ok(());
    }
    let result = fetch_rrd_locked(client, ctx, key).await;
    ctx.cache.clear_flag(key, GRAPH_F_FETCHING);
    result
}

async fn fetch_rrd_locked(
    client: &mut RpcClient,
    ctx: &WorkerCtx,
    key: &str,
) -> Result<(), RpcError> {
    let Some((md5, ds_type, step)) = split_rrd_cache_key(key) else {
        return Err(RpcError::Protocol(format!("bad cache key: {key}")));
    };
    let path = rrd_file_path(&ctx.storage, md5, ds_type, step);

    let items = ctx.cache.pop_all(key);
    if items.is_empty() {
        return Ok(());
    }

    let restore = |e: RpcError, items| {
        ctx.cache.push_all(key, items);
        ctx.cache.or_flag(key, GRAPH_F_ERR);
        Err(e)
    };

    let body64 = match call_with_retry(client, ctx, &GraphRequest::GetRrd(key.to_string())).await {
        Ok(GraphResponse::Rrd(file)) => file.body64,
        Ok(other) => {
            return restore(
                RpcError::Protocol(format!("unexpected response to Graph.GetRrd: {other:?}")),
                items,
            )
        }
        Err(e) => return restore(e, items),
    };

    let bytes = match BASE64.decode(body64.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => return restore(RpcError::Protocol(format!("bad body64: {e}")), items),
    };
    if let Err(e) = write_atomic(&path, &bytes) {
        return restore(RpcError::Io(format!("write {}: {e}", path.display())), items);
    }

    ctx.cache.clear_flag(key, GRAPH_F_MISS);
    // the series is materialized; the buffered samples land on top of it
    if let Err(e) = ctx.rrd.flush(&path, &items) {
        warn!(key, error = %e, "flush after fetch failed");
    }
    Ok(())
}
