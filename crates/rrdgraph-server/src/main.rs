// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rrdgraph service CLI.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (RPC on :6070, admin HTTP on :6071)
//! rrdgraph-server
//!
//! # With a configuration file
//! rrdgraph-server --config graph.toml
//!
//! # Override listen addresses and storage root
//! rrdgraph-server --rpc 0.0.0.0:7070 --http 0.0.0.0:7071 --storage /data/rrd
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use rrdgraph_server::admin::admin_router;
use rrdgraph_server::config::GraphConfig;
use rrdgraph_server::migrate::Migrator;
use rrdgraph_server::rpc::GraphRpcServer;
use rrdgraph_server::runtime::Runtime;
use rrdgraph_server::service::GraphService;
use rrdgraph_server::{cron, flush};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// RRD-backed time-series graph node.
#[derive(Parser, Debug)]
#[command(name = "rrdgraph-server")]
#[command(about = "rrdgraph node - ingest, cache, query and cluster migration over RRD files")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RPC listen address (overrides the file)
    #[arg(long)]
    rpc: Option<String>,

    /// Admin HTTP listen address (overrides the file)
    #[arg(long)]
    http: Option<String>,

    /// RRD storage root (overrides the file)
    #[arg(long)]
    storage: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let mut cfg = match &args.config {
        Some(path) => GraphConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GraphConfig::default(),
    };
    if let Some(rpc) = args.rpc {
        cfg.listen.rpc = rpc;
    }
    if let Some(http) = args.http {
        cfg.listen.http = http;
    }
    if let Some(storage) = args.storage {
        cfg.rrd.storage = storage;
    }
    cfg.validate().context("invalid configuration")?;

    info!(
        rpc = %cfg.listen.rpc,
        http = %cfg.listen.http,
        storage = %cfg.rrd.storage,
        migrate = cfg.migrate.enabled,
        "starting rrdgraph-server"
    );

    let mut rt = Runtime::new(cfg);
    if rt.cfg.migrate.enabled {
        let migrator = Migrator::start(
            &rt.cfg,
            Arc::clone(&rt.cache),
            Arc::clone(&rt.rrd),
            Arc::clone(&rt.stats),
        )
        .await
        .context("dialing migration cluster")?;
        rt.migrator = Some(migrator);
    }
    let rt = Arc::new(rt);

    let service = Arc::new(GraphService::new(Arc::clone(&rt)));
    let shutdown = Arc::new(Notify::new());

    let rpc_listener = TcpListener::bind(&rt.cfg.listen.rpc)
        .await
        .with_context(|| format!("binding rpc {}", rt.cfg.listen.rpc))?;
    let rpc_server = GraphRpcServer::new(Arc::clone(&service), Arc::clone(&shutdown));
    tokio::spawn(async move {
        if let Err(e) = rpc_server.run(rpc_listener).await {
            tracing::error!(error = %e, "rpc server exited");
        }
    });

    let http_listener = TcpListener::bind(&rt.cfg.listen.http)
        .await
        .with_context(|| format!("binding http {}", rt.cfg.listen.http))?;
    info!(addr = %http_listener.local_addr()?, "admin http listening");
    let router = admin_router(Arc::clone(&rt));
    let http_shutdown = Arc::clone(&shutdown);
    tokio::spawn(async move {
        let serve = axum::serve(http_listener, router)
            .with_graceful_shutdown(async move { http_shutdown.notified().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "admin http exited");
        }
    });

    tokio::spawn(flush::run_flusher(Arc::clone(&rt), Arc::clone(&shutdown)));
    tokio::spawn(cron::run_index_gc(Arc::clone(&rt), Arc::clone(&shutdown)));

    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("shutting down");
    shutdown.notify_waiters();

    Ok(())
}
