// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistent RPC client.
//!
//! One client per (node, worker slot); the owning worker is the only user,
//! so the handle needs no locking. Reconnection replaces the owned stream.

use super::protocol::{read_frame, write_frame, GraphRequest, GraphResponse};
use super::RpcError;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Persistent connection to one remote graph node.
#[derive(Debug)]
pub struct RpcClient {
    addr: String,
    stream: TcpStream,
    /// A timed-out or garbled exchange leaves the frame stream ambiguous;
    /// the connection is unusable until re-dialed.
    poisoned: bool,
}

impl RpcClient {
    /// Connect with a 1 s dial timeout and TCP keep-alive.
    pub async fn dial(addr: &str) -> Result<Self, RpcError> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Timeout)?
            .map_err(|e| RpcError::Shutdown(e.to_string()))?;
        set_keepalive(&stream)?;
        stream
            .set_nodelay(true)
            .map_err(|e| RpcError::Shutdown(e.to_string()))?;
        Ok(Self {
            addr: addr.to_string(),
            stream,
            poisoned: false,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// True once an exchange timed out or garbled the stream; only a
    /// `redial` clears it.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// One request/response exchange bounded by `deadline`.
    ///
    /// A timeout poisons the connection: the response may still arrive
    /// later and would be mistaken for the next call's answer.
    pub async fn call(
        &mut self,
        request: &GraphRequest,
        deadline: Duration,
    ) -> Result<GraphResponse, RpcError> {
        if self.poisoned {
            return Err(RpcError::Shutdown("poisoned connection".into()));
        }

        match tokio::time::timeout(deadline, self.exchange(request)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                self.poisoned = true;
                Err(e)
            }
            Err(_) => {
                self.poisoned = true;
                Err(RpcError::Timeout)
            }
        }
    }

    async fn exchange(&mut self, request: &GraphRequest) -> Result<GraphResponse, RpcError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| RpcError::Protocol(e.to_string()))?;
        write_frame(&mut self.stream, &payload).await?;

        let frame = read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| RpcError::Shutdown("connection closed".into()))?;
        let resp: GraphResponse =
            serde_json::from_slice(&frame).map_err(|e| RpcError::Protocol(e.to_string()))?;

        match resp {
            GraphResponse::Error { message } => Err(RpcError::Remote(message)),
            other => Ok(other),
        }
    }

    /// Replace the owned stream with a freshly dialed one.
    pub async fn redial(&mut self) -> Result<(), RpcError> {
        let fresh = Self::dial(&self.addr).await?;
        debug!(addr = %self.addr, "rpc client reconnected");
        self.stream = fresh.stream;
        self.poisoned = false;
        Ok(())
    }
}

fn set_keepalive(stream: &TcpStream) -> Result<(), RpcError> {
    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(true)
        .map_err(|e| RpcError::Shutdown(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{read_frame, write_frame};
    use tokio::net::TcpListener;

    async fn echo_pong_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    while let Ok(Some(_)) = read_frame(&mut stream).await {
                        let resp = serde_json::to_vec(&GraphResponse::Pong).unwrap();
                        if write_frame(&mut stream, &resp).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn call_round_trip() {
        let addr = echo_pong_server().await;
        let mut client = RpcClient::dial(&addr).await.unwrap();
        let resp = client
            .call(&GraphRequest::Ping, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(resp, GraphResponse::Pong));
    }

    #[tokio::test]
    async fn dial_refused_is_shutdown() {
        // a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = RpcClient::dial(&addr).await.unwrap_err();
        assert!(err.needs_reconnect() || matches!(err, RpcError::Timeout));
    }

    #[tokio::test]
    async fn timeout_poisons_connection() {
        // server that never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let mut client = RpcClient::dial(&addr).await.unwrap();
        let err = client
            .call(&GraphRequest::Ping, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout));

        // the next call refuses to reuse the ambiguous stream
        let err = client
            .call(&GraphRequest::Ping, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Shutdown(_)));
    }
}
