// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Read-only HTTP admin surface.
//!
//! - `GET /statistics/all`    - telemetry snapshot
//! - `GET /statistics/config` - effective configuration
//! - `GET /trace/:endpoint/:metric[/:tags]` - live tap of received items
//! - `GET /index/delete`      - force an index GC run

use crate::cron;
use crate::runtime::Runtime;
use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the admin router.
pub fn admin_router(rt: Arc<Runtime>) -> Router {
    Router::new()
        .route("/statistics/all", get(statistics_all))
        .route("/statistics/config", get(statistics_config))
        .route("/trace/:endpoint/:metric", get(trace_series))
        .route("/trace/:endpoint/:metric/:tags", get(trace_series_tags))
        .route("/index/delete", get(index_delete))
        .layer(CorsLayer::new().allow_origin(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(rt)
}

async fn statistics_all(State(rt): State<Arc<Runtime>>) -> Json<Value> {
    Json(json!({
        "counters": rt.stats.snapshot(),
        "cache": {
            "keys": rt.cache.key_count(),
            "items": rt.cache.item_total(),
        },
        "index": {
            "endpoints": rt.index.endpoint_count(),
            "counters": rt.index.counter_count(),
        },
    }))
}

async fn statistics_config(State(rt): State<Arc<Runtime>>) -> Json<Value> {
    Json(json!(rt.cfg))
}

async fn trace_series(
    State(rt): State<Arc<Runtime>>,
    Path((endpoint, metric)): Path<(String, String)>,
) -> Json<Value> {
    rt.trace
        .set_trace_config(&endpoint, &metric, &BTreeMap::new());
    Json(json!(rt.trace.filter_all()))
}

async fn trace_series_tags(
    State(rt): State<Arc<Runtime>>,
    Path((endpoint, metric, tags)): Path<(String, String, String)>,
) -> Json<Value> {
    rt.trace
        .set_trace_config(&endpoint, &metric, &parse_tags(&tags));
    Json(json!(rt.trace.filter_all()))
}

async fn index_delete(State(rt): State<Arc<Runtime>>) -> Json<Value> {
    match cron::delete_index(&rt) {
        Some((endpoints, counters)) => Json(json!({
            "msg": "done",
            "endpoints": endpoints,
            "counters": counters,
        })),
        None => Json(json!({ "msg": "already running" })),
    }
}

/// `k=v,k=v` -> map; malformed pairs are ignored.
fn parse_tags(raw: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    for pair in raw.split(',') {
        let mut kv = pair.splitn(2, '=');
        if let (Some(k), Some(v)) = (kv.next(), kv.next()) {
            if !k.is_empty() {
                tags.insert(k.to_string(), v.to_string());
            }
        }
    }
    tags
}
