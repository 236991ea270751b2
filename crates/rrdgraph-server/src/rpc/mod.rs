// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Graph RPC: wire protocol, TCP server and the persistent client used by
//! the migration workers.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RpcClient;
pub use protocol::{
    File64, GraphRequest, GraphResponse, InfoParam, InfoResponse, QueryParam, QueryResponse,
};
pub use server::GraphRpcServer;

use thiserror::Error;

/// RPC call errors.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Per-call deadline exceeded. Retried without reconnecting.
    #[error("i/o timeout")]
    Timeout,

    /// Connection lost or unusable. The worker reconnects before the next
    /// attempt.
    #[error("connection shut down: {0}")]
    Shutdown(String),

    /// Malformed frame or JSON; the stream can no longer be trusted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote answered with an error response.
    #[error("remote error: {0}")]
    Remote(String),

    /// Local i/o failure while completing a task (e.g. writing a fetched
    /// file). The connection itself is fine.
    #[error("i/o error: {0}")]
    Io(String),
}

impl RpcError {
    /// Errors after which the connection must be re-dialed.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, RpcError::Shutdown(_) | RpcError::Protocol(_))
    }
}
