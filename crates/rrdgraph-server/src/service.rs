// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The Graph facade: ingest, query, info and file transfer, orchestrating
//! cache, index, RRD engine and the migration layer.

use crate::migrate::Task;
use crate::rpc::{File64, InfoParam, InfoResponse, QueryParam, QueryResponse, RpcError};
use crate::runtime::{unix_now, Runtime};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rrdgraph::rrd::MIN_FLUSH_ITEMS;
use rrdgraph::{
    form_rrd_cache_key, item::md5_hex, merge_with_cache, rrd_file_path, split_rrd_cache_key,
    ConsolFn, GraphItem, RrdBackend, RrdError, GRAPH_F_MISS, GRAPH_F_SENDING,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Errors a facade operation can surface to the RPC layer. NotFound never
/// appears here; unknown series answer with empty responses.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("rrd: {0}")]
    Rrd(#[from] RrdError),

    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// A send or fetch task holds the series right now.
    #[error("series busy")]
    Busy,

    #[error("bad cache key: {0}")]
    BadKey(String),

    /// The owner node's queue is gone or the reply channel dropped.
    #[error("owner node unreachable")]
    Unroutable,
}

/// Public operations, bound to one `Runtime`.
pub struct GraphService {
    rt: Arc<Runtime>,
}

impl GraphService {
    pub fn new(rt: Arc<Runtime>) -> Self {
        Self { rt }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    /// Ingest a batch. Fire-and-forget: the RPC layer acknowledges before
    /// this runs; per-item failures are dropped silently.
    pub fn handle_send(&self, items: Vec<GraphItem>) {
        let now = unix_now();
        for item in items {
            if item.endpoint.is_empty() || item.metric.is_empty() || item.step <= 0 {
                continue;
            }
            let checksum = item.checksum();

            self.rt.stats.incr_recv();
            if self.rt.trace.matches(&checksum) {
                self.rt.trace.push_front(item.clone());
            }

            let key = form_rrd_cache_key(&checksum, &item.ds_type, item.step);

            // monotone-per-series: drop anything at or before the head
            if let Some(head) = self.rt.cache.first(&key) {
                if item.timestamp <= head.timestamp {
                    continue;
                }
            }

            // first sight of a series without a local file: it may live on
            // a remote owner, mark it for materialization
            let mut init_flag = 0;
            if self.rt.cfg.migrate.enabled && !self.rt.cache.contains_key(&key) {
                let path = rrd_file_path(&self.rt.cfg.rrd.storage, &checksum, &item.ds_type, item.step);
                if !path.exists() {
                    init_flag = GRAPH_F_MISS;
                }
            }

            self.rt.index.receive_item(&item, now);
            self.rt.stats.incr_index_update();
            self.rt.cache.push_front_with_flag(&key, item, init_flag);
        }
    }

    /// Range query: local RRD fetch merged with the live buffer, or a
    /// forward to the owner node while the series is not yet materialized.
    pub async fn handle_query(&self, param: QueryParam) -> Result<QueryResponse, ServiceError> {
        self.rt.stats.incr_query();

        let Some(endpoint_id) = self.rt.index.endpoint_id(&param.endpoint) else {
            return Ok(QueryResponse::empty(&param.endpoint, &param.counter));
        };
        let Some((ds_type, step)) = self.rt.index.ds_type_and_step(endpoint_id, &param.counter)
        else {
            return Ok(QueryResponse::empty(&param.endpoint, &param.counter));
        };

        let md5 = md5_hex(&format!("{}/{}", param.endpoint, param.counter));
        let key = form_rrd_cache_key(&md5, &ds_type, step);

        if let Some(resp) = self.forward_query(&md5, &key, &param).await? {
            return Ok(resp);
        }

        let path = rrd_file_path(&self.rt.cfg.rrd.storage, &md5, &ds_type, step);
        let cf: ConsolFn = param.consol_fun.parse().unwrap_or_default();

        let datas = match self.rt.rrd.fetch(&path, cf, param.start, param.end, step) {
            Ok(datas) => datas,
            Err(err) => {
                // typically a missing file: materialize from the buffer
                let items = self.rt.cache.pop_all(&key);
                if items.len() < MIN_FLUSH_ITEMS {
                    self.rt.cache.push_all(&key, items);
                    self.debug_series(&md5, || format!("fetch failed, too few samples: {err}"));
                    return Ok(QueryResponse::empty(&param.endpoint, &param.counter));
                }
                if let Err(flush_err) = self.rt.rrd.flush(&path, &items) {
                    self.rt.cache.push_all(&key, items);
                    self.debug_series(&md5, || format!("flush failed: {flush_err}"));
                    return Ok(QueryResponse::empty(&param.endpoint, &param.counter));
                }
                self.rt
                    .rrd
                    .fetch(&path, cf, param.start, param.end, step)
                    .unwrap_or_default()
            }
        };

        let items = self.rt.cache.fetch_all(&key);
        self.debug_series(&md5, || {
            format!(
                "query start={} end={} items={} datas={}",
                param.start,
                param.end,
                items.len(),
                datas.len()
            )
        });

        let values = merge_with_cache(&datas, &items, &ds_type, step);
        Ok(QueryResponse {
            values,
            endpoint: param.endpoint,
            counter: param.counter,
            ds_type,
            step,
        })
    }

    /// Forward the query to the owning node while the series is still
    /// marked MISS. `Ok(None)` means: answer locally.
    async fn forward_query(
        &self,
        md5: &str,
        key: &str,
        param: &QueryParam,
    ) -> Result<Option<QueryResponse>, ServiceError> {
        let (Some(ring), Some(migrator)) = (&self.rt.ring, &self.rt.migrator) else {
            return Ok(None);
        };
        if !self.rt.cache.contains_key(key)
            || self.rt.cache.get_flag(key) & GRAPH_F_MISS == 0
        {
            return Ok(None);
        }
        let Some(owner) = ring.owner(md5) else {
            return Ok(None);
        };
        if self.rt.cfg.is_local_node(owner) || !migrator.has_node(owner) {
            return Ok(None);
        }

        let (done, reply) = oneshot::channel();
        if !migrator
            .enqueue(
                owner,
                Task::Query {
                    param: param.clone(),
                    done,
                },
            )
            .await
        {
            return Err(ServiceError::Unroutable);
        }
        match reply.await {
            Ok(Ok(resp)) => Ok(Some(resp)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ServiceError::Unroutable),
        }
    }

    /// Series metadata; does not touch the cache.
    pub fn handle_info(&self, param: InfoParam) -> InfoResponse {
        let Some(endpoint_id) = self.rt.index.endpoint_id(&param.endpoint) else {
            return InfoResponse::default();
        };
        let Some((ds_type, step)) = self.rt.index.ds_type_and_step(endpoint_id, &param.counter)
        else {
            return InfoResponse::default();
        };

        let md5 = md5_hex(&format!("{}/{}", param.endpoint, param.counter));
        let filename = rrd_file_path(&self.rt.cfg.rrd.storage, &md5, &ds_type, step)
            .display()
            .to_string();
        InfoResponse {
            consol_fun: ds_type,
            step,
            filename,
        }
    }

    /// Serve the series' RRD file to a migrating peer: flush what is
    /// buffered, then hand out the file bytes base64-encoded.
    pub fn handle_get_rrd(&self, key: &str) -> Result<File64, ServiceError> {
        let Some((md5, ds_type, step)) = split_rrd_cache_key(key) else {
            return Err(ServiceError::BadKey(key.to_string()));
        };
        let path = rrd_file_path(&self.rt.cfg.rrd.storage, md5, ds_type, step);

        if !self.rt.cache.try_set_busy(key, GRAPH_F_SENDING) {
            return Err(ServiceError::Busy);
        }
        let result = (|| {
            let items = self.rt.cache.pop_all(key);
            if !items.is_empty() {
                if let Err(e) = self.rt.rrd.flush(&path, &items) {
                    self.rt.cache.push_all(key, items);
                    return Err(ServiceError::Rrd(e));
                }
            }
            let bytes = std::fs::read(&path)?;
            Ok(File64 {
                body64: BASE64.encode(bytes),
            })
        })();
        self.rt.cache.clear_flag(key, GRAPH_F_SENDING);
        result
    }

    fn debug_series(&self, md5: &str, message: impl FnOnce() -> String) {
        if self.rt.cfg.debug && self.rt.cfg.debug_checksum == md5 {
            debug!(checksum = md5, "{}", message());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use rrdgraph::RrdData;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn test_runtime(dir: &TempDir) -> Arc<Runtime> {
        let mut cfg = GraphConfig::default();
        cfg.rrd.storage = dir.path().to_string_lossy().into_owned();
        Arc::new(Runtime::new(cfg))
    }

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

    fn query(start: i64, end: i64) -> QueryParam {
        QueryParam {
            endpoint: "host-a".into(),
            counter: "cpu.idle".into(),
            consol_fun: "AVERAGE".into(),
            start,
            end,
        }
    }

    fn plain_values(datas: &[RrdData]) -> Vec<f64> {
        datas.iter().map(|d| d.value.0).collect()
    }

    #[tokio::test]
    async fn unknown_endpoint_answers_empty() {
        let dir = TempDir::new().unwrap();
        let service = GraphService::new(test_runtime(&dir));

        let resp = service.handle_query(query(0, 100)).await.unwrap();
        assert!(resp.values.is_empty());
        assert_eq!(resp.endpoint, "host-a");
        assert_eq!(resp.step, 0);
    }

    #[tokio::test]
    async fn ingest_then_query_materializes_and_answers() {
        let dir = TempDir::new().unwrap();
        let service = GraphService::new(test_runtime(&dir));

        service.handle_send(vec![
            gauge_item(100, 1.0),
            gauge_item(160, 2.0),
            gauge_item(220, 3.0),
        ]);

        let resp = service.handle_query(query(100, 220)).await.unwrap();
        assert_eq!(resp.ds_type, "GAUGE");
        assert_eq!(resp.step, 60);
        let ts: Vec<i64> = resp.values.iter().map(|d| d.timestamp).collect();
        assert_eq!(ts, vec![100, 160, 220]);
        assert_eq!(plain_values(&resp.values), vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn too_few_samples_keep_buffering() {
        let dir = TempDir::new().unwrap();
        let service = GraphService::new(test_runtime(&dir));

        service.handle_send(vec![gauge_item(100, 1.0), gauge_item(160, 2.0)]);

        let resp = service.handle_query(query(100, 160)).await.unwrap();
        assert!(resp.values.is_empty());

        // the samples were restored, not lost
        let key = gauge_item(0, 0.0).rrd_cache_key();
        assert_eq!(service.runtime().cache.items_len(&key), 2);
    }

    #[tokio::test]
    async fn stale_items_are_dropped_on_ingest() {
        let dir = TempDir::new().unwrap();
        let service = GraphService::new(test_runtime(&dir));

        service.handle_send(vec![gauge_item(100, 1.0)]);
        service.handle_send(vec![gauge_item(90, 9.0)]);

        let key = gauge_item(0, 0.0).rrd_cache_key();
        let cached = service.runtime().cache.fetch_all(&key);
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].timestamp, 100);
    }

    #[tokio::test]
    async fn query_merges_live_buffer_over_rrd() {
        let dir = TempDir::new().unwrap();
        let service = GraphService::new(test_runtime(&dir));

        // materialize three samples into the file
        service.handle_send(vec![
            gauge_item(100, 1.0),
            gauge_item(160, 2.0),
            gauge_item(220, 3.0),
        ]);
        service.handle_query(query(100, 220)).await.unwrap();

        // two fresher samples stay in memory
        service.handle_send(vec![gauge_item(280, 4.0), gauge_item(340, 5.0)]);

        let resp = service.handle_query(query(100, 340)).await.unwrap();
        let ts: Vec<i64> = resp.values.iter().map(|d| d.timestamp).collect();
        assert_eq!(ts, vec![100, 160, 220, 280, 340]);
        assert_eq!(plain_values(&resp.values), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[tokio::test]
    async fn info_reports_type_step_and_filename() {
        let dir = TempDir::new().unwrap();
        let service = GraphService::new(test_runtime(&dir));

        service.handle_send(vec![gauge_item(100, 1.0)]);

        let info = service.handle_info(InfoParam {
            endpoint: "host-a".into(),
            counter: "cpu.idle".into(),
        });
        assert_eq!(info.consol_fun, "GAUGE");
        assert_eq!(info.step, 60);
        assert!(info.filename.ends_with("_GAUGE_60.rrd"));

        let missing = service.handle_info(InfoParam {
            endpoint: "nope".into(),
            counter: "cpu.idle".into(),
        });
        assert_eq!(missing.step, 0);
        assert!(missing.filename.is_empty());
    }

    #[tokio::test]
    async fn get_rrd_round_trips_file_bytes() {
        let dir = TempDir::new().unwrap();
        let service = GraphService::new(test_runtime(&dir));

        service.handle_send(vec![
            gauge_item(100, 1.0),
            gauge_item(160, 2.0),
            gauge_item(220, 3.0),
        ]);
        let key = gauge_item(0, 0.0).rrd_cache_key();

        let file = service.handle_get_rrd(&key).unwrap();
        let bytes = BASE64.decode(file.body64.as_bytes()).unwrap();
        assert_eq!(&bytes[0..4], b"RRDG");

        // the buffered samples were flushed on the way out
        assert_eq!(service.runtime().cache.items_len(&key), 0);
        assert_eq!(service.runtime().cache.get_flag(&key), 0);
    }

    #[tokio::test]
    async fn get_rrd_for_unknown_series_fails() {
        let dir = TempDir::new().unwrap();
        let service = GraphService::new(test_runtime(&dir));

        assert!(matches!(
            service.handle_get_rrd("not-a-key"),
            Err(ServiceError::BadKey(_))
        ));
        let err = service
            .handle_get_rrd("0123456789abcdef0123456789abcdef_GAUGE_60")
            .unwrap_err();
        assert!(matches!(err, ServiceError::Io(_)));
    }

    #[tokio::test]
    async fn busy_series_refuses_get_rrd() {
        let dir = TempDir::new().unwrap();
        let service = GraphService::new(test_runtime(&dir));
        let key = "0123456789abcdef0123456789abcdef_GAUGE_60";

        assert!(service.runtime().cache.try_set_busy(key, GRAPH_F_SENDING));
        assert!(matches!(
            service.handle_get_rrd(key),
            Err(ServiceError::Busy)
        ));
    }
}
