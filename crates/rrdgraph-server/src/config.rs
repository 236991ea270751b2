// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration; CLI
//! flags override the file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Verbose per-series logging.
    #[serde(default)]
    pub debug: bool,

    /// Fingerprint the debug logging is scoped to ("" = none).
    #[serde(default)]
    pub debug_checksum: String,

    /// Deadline for every outbound RPC call (milliseconds).
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Seconds between flusher sweeps over the sample cache.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub rrd: RrdConfig,

    #[serde(default)]
    pub heartbeat: PeerConfig,

    #[serde(default)]
    pub transfer: PeerConfig,

    #[serde(default)]
    pub migrate: MigrateConfig,
}

/// Listen addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// RPC surface (length-prefixed JSON over TCP).
    #[serde(default = "default_rpc_listen")]
    pub rpc: String,

    /// Read-only HTTP admin surface.
    #[serde(default = "default_http_listen")]
    pub http: String,
}

/// RRD storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrdConfig {
    /// Root directory for the per-series RRD files.
    #[serde(default = "default_storage")]
    pub storage: String,
}

/// An external peer service (heartbeat server, transfer). Recognized and
/// validated; the clients live in sibling components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub addr: String,

    #[serde(default = "default_peer_timeout_ms")]
    pub timeout_ms: u64,
}

/// Cluster migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Virtual nodes per backend on the consistent-hash ring.
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Persistent connections (and workers) per remote node.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// This node's id in `cluster`, if it appears there. Series owned by
    /// the local node are never fetched remotely.
    #[serde(default)]
    pub local_node: Option<String>,

    /// node id -> "host:port"
    #[serde(default)]
    pub cluster: BTreeMap<String, String>,
}

fn default_call_timeout_ms() -> u64 {
    5000
}

fn default_flush_interval_secs() -> u64 {
    60
}

fn default_rpc_listen() -> String {
    "0.0.0.0:6070".to_string()
}

fn default_http_listen() -> String {
    "0.0.0.0:6071".to_string()
}

fn default_storage() -> String {
    "./data/rrd".to_string()
}

fn default_peer_timeout_ms() -> u64 {
    1000
}

fn default_replicas() -> usize {
    500
}

fn default_concurrency() -> usize {
    2
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            rpc: default_rpc_listen(),
            http: default_http_listen(),
        }
    }
}

impl Default for RrdConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
        }
    }
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            replicas: default_replicas(),
            concurrency: default_concurrency(),
            local_node: None,
            cluster: BTreeMap::new(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            debug: false,
            debug_checksum: String::new(),
            call_timeout_ms: default_call_timeout_ms(),
            flush_interval_secs: default_flush_interval_secs(),
            listen: ListenConfig::default(),
            rrd: RrdConfig::default(),
            heartbeat: PeerConfig::default(),
            transfer: PeerConfig::default(),
            migrate: MigrateConfig::default(),
        }
    }
}

impl GraphConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rrd.storage.is_empty() {
            return Err(ConfigError::Invalid("rrd.storage must not be empty".into()));
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid("call_timeout_ms must be > 0".into()));
        }
        if self.migrate.enabled {
            if self.migrate.cluster.is_empty() {
                return Err(ConfigError::Invalid(
                    "migrate.enabled requires a non-empty migrate.cluster".into(),
                ));
            }
            if self.migrate.concurrency == 0 {
                return Err(ConfigError::Invalid(
                    "migrate.concurrency must be >= 1".into(),
                ));
            }
            if let Some(local) = &self.migrate.local_node {
                if !self.migrate.cluster.contains_key(local) {
                    return Err(ConfigError::Invalid(format!(
                        "migrate.local_node {local} is not in migrate.cluster"
                    )));
                }
            }
        }
        for (name, peer) in [("heartbeat", &self.heartbeat), ("transfer", &self.transfer)] {
            if peer.enabled && peer.addr.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{name}.enabled requires {name}.addr"
                )));
            }
        }
        Ok(())
    }

    /// True when `node` names this process in the migrate cluster.
    pub fn is_local_node(&self, node: &str) -> bool {
        self.migrate.local_node.as_deref() == Some(node)
    }
}
