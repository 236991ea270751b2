// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC surface: TCP accept loop and per-connection request dispatch.

use super::protocol::{read_frame, write_frame, GraphRequest, GraphResponse};
use crate::service::GraphService;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// The Graph RPC server.
pub struct GraphRpcServer {
    service: Arc<GraphService>,
    shutdown: Arc<Notify>,
}

impl GraphRpcServer {
    pub fn new(service: Arc<GraphService>, shutdown: Arc<Notify>) -> Self {
        Self { service, shutdown }
    }

    /// Accept connections until shutdown is notified. Each connection gets
    /// its own task; a connection failure never takes the server down.
    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "graph rpc listening");
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!(%peer, "rpc connection accepted");
                            let service = Arc::clone(&self.service);
                            tokio::spawn(async move {
                                handle_connection(stream, service).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("graph rpc shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, service: Arc<GraphService>) {
    if let Err(e) = keepalive(&stream) {
        debug!(error = %e, "keepalive setup failed");
    }

    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "rpc read failed");
                return;
            }
        };

        let response = dispatch(&service, &frame).await;
        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "response encode failed");
                return;
            }
        };
        if let Err(e) = write_frame(&mut stream, &payload).await {
            debug!(error = %e, "rpc write failed");
            return;
        }
    }
}

async fn dispatch(service: &Arc<GraphService>, frame: &[u8]) -> GraphResponse {
    let request: GraphRequest = match serde_json::from_slice(frame) {
        Ok(request) => request,
        Err(e) => {
            return GraphResponse::Error {
                message: format!("bad request: {e}"),
            }
        }
    };

    match request {
        GraphRequest::Ping => GraphResponse::Pong,
        GraphRequest::Send(items) => {
            // fire-and-forget: acknowledge now, ingest in the background
            let service = Arc::clone(service);
            tokio::spawn(async move {
                service.handle_send(items);
            });
            GraphResponse::Ok
        }
        GraphRequest::Query(param) => match service.handle_query(param).await {
            Ok(resp) => GraphResponse::Query(resp),
            Err(e) => GraphResponse::Error {
                message: e.to_string(),
            },
        },
        GraphRequest::Info(param) => GraphResponse::Info(service.handle_info(param)),
        GraphRequest::GetRrd(key) => match service.handle_get_rrd(&key) {
            Ok(file) => GraphResponse::Rrd(file),
            Err(e) => GraphResponse::Error {
                message: e.to_string(),
            },
        },
    }
}

fn keepalive(stream: &TcpStream) -> std::io::Result<()> {
    socket2::SockRef::from(stream).set_keepalive(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::rpc::{QueryParam, RpcClient};
    use crate::runtime::Runtime;
    use rrdgraph::GraphItem;
    use std::collections::BTreeMap;
    use std::time::Duration;
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

    async fn spawn_server(dir: &TempDir) -> String {
        let mut cfg = GraphConfig::default();
        cfg.rrd.storage = dir.path().to_string_lossy().into_owned();
        let rt = Arc::new(Runtime::new(cfg));
        let service = Arc::new(GraphService::new(rt));
        let shutdown = Arc::new(Notify::new());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = GraphRpcServer::new(service, shutdown);
        tokio::spawn(async move {
            let _ = server.run(listener).await;
        });
        addr
    }

    #[tokio::test]
    async fn ping_pong() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_server(&dir).await;

        let mut client = RpcClient::dial(&addr).await.unwrap();
        let resp = client
            .call(&GraphRequest::Ping, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(resp, GraphResponse::Pong));
    }

    #[tokio::test]
    async fn send_then_query_end_to_end() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_server(&dir).await;
        let mut client = RpcClient::dial(&addr).await.unwrap();

        let resp = client
            .call(
                &GraphRequest::Send(vec![
                    gauge_item(100, 1.0),
                    gauge_item(160, 2.0),
                    gauge_item(220, 3.0),
                ]),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(resp, GraphResponse::Ok));

        // ingest is asynchronous from the caller's perspective; poll
        let query = GraphRequest::Query(QueryParam {
            endpoint: "host-a".into(),
            counter: "cpu.idle".into(),
            consol_fun: "AVERAGE".into(),
            start: 100,
            end: 220,
        });
        let mut values = Vec::new();
        for _ in 0..100 {
            match client.call(&query, Duration::from_secs(1)).await.unwrap() {
                GraphResponse::Query(q) if q.values.len() == 3 => {
                    values = q.values;
                    break;
                }
                GraphResponse::Query(_) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                other => panic!("unexpected response: {other:?}"),
            }
        }
        let got: Vec<(i64, f64)> = values.iter().map(|d| (d.timestamp, d.value.0)).collect();
        assert_eq!(got, vec![(100, 1.0), (160, 2.0), (220, 3.0)]);
    }

    #[tokio::test]
    async fn malformed_request_answers_error() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_server(&dir).await;

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        write_frame(&mut stream, b"{\"method\":\"Graph.Nope\"}")
            .await
            .unwrap();
        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        let resp: GraphResponse = serde_json::from_slice(&frame).unwrap();
        assert!(matches!(resp, GraphResponse::Error { .. }));
    }
}
