// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Graph RPC wire protocol.
//!
//! One JSON request per TCP frame over a persistent connection:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON payload      |
//! +----------------+-------------------+
//! ```

use rrdgraph::{GraphItem, RrdData};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::RpcError;

/// Frames above this are rejected (an RRD file body fits comfortably).
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// RPC requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum GraphRequest {
    #[serde(rename = "Graph.Ping")]
    Ping,

    #[serde(rename = "Graph.Send")]
    Send(Vec<GraphItem>),

    #[serde(rename = "Graph.Query")]
    Query(QueryParam),

    #[serde(rename = "Graph.Info")]
    Info(InfoParam),

    /// Argument is the rrd cache key (`md5_dsType_step`).
    #[serde(rename = "Graph.GetRrd")]
    GetRrd(String),
}

/// RPC responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GraphResponse {
    #[serde(rename = "pong")]
    Pong,

    /// Fire-and-forget acknowledgement (Graph.Send).
    #[serde(rename = "ok")]
    Ok,

    #[serde(rename = "query")]
    Query(QueryResponse),

    #[serde(rename = "info")]
    Info(InfoResponse),

    #[serde(rename = "rrd")]
    Rrd(File64),

    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryParam {
    pub endpoint: String,
    pub counter: String,
    #[serde(rename = "consolFun")]
    pub consol_fun: String,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub values: Vec<RrdData>,
    pub endpoint: String,
    pub counter: String,
    #[serde(rename = "dsType")]
    pub ds_type: String,
    pub step: i64,
}

impl QueryResponse {
    /// The NotFound shape: empty values, identity echoed back.
    pub fn empty(endpoint: &str, counter: &str) -> Self {
        Self {
            values: Vec::new(),
            endpoint: endpoint.to_string(),
            counter: counter.to_string(),
            ds_type: String::new(),
            step: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoParam {
    pub endpoint: String,
    pub counter: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoResponse {
    #[serde(rename = "consolFun")]
    pub consol_fun: String,
    pub step: i64,
    pub filename: String,
}

/// Base64 of a whole RRD file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File64 {
    pub body64: String,
}

/// Read one length-prefixed frame. `Ok(None)` on clean EOF at a frame
/// boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Vec<u8>>, RpcError> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(RpcError::Shutdown(e.to_string())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(RpcError::Protocol("empty frame".into()));
    }
    if len > MAX_FRAME {
        return Err(RpcError::Protocol(format!(
            "frame too large: {len} > {MAX_FRAME}"
        )));
    }

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .await
        .map_err(|e| RpcError::Shutdown(e.to_string()))?;
    Ok(Some(buf))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<(), RpcError> {
    if payload.len() > MAX_FRAME {
        return Err(RpcError::Protocol(format!(
            "frame too large: {} > {MAX_FRAME}",
            payload.len()
        )));
    }
    let len = (payload.len() as u32).to_be_bytes();
    w.write_all(&len)
        .await
        .map_err(|e| RpcError::Shutdown(e.to_string()))?;
    w.write_all(payload)
        .await
        .map_err(|e| RpcError::Shutdown(e.to_string()))?;
    w.flush()
        .await
        .map_err(|e| RpcError::Shutdown(e.to_string()))?;
    Ok(())
}
