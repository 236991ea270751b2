// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RRD engine: the fetch/flush seam over per-series round-robin files.
//!
//! `RrdBackend` is the contract the facade and the migration workers
//! program against; `RrdFileBackend` is the shipped implementation over a
//! compact single-archive file format (see `file`).

mod file;

pub use file::{write_atomic, RrdFileBackend, DEFAULT_ROWS};

use crate::item::{GraphItem, RrdData};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Below this many buffered samples a flush is skipped: RRD updates need
/// enough points to be meaningful and to avoid thrash.
pub const MIN_FLUSH_ITEMS: usize = 3;

/// RRD engine errors.
#[derive(Debug, Error)]
pub enum RrdError {
    /// No file for the series yet; the facade treats this as
    /// "materialize first".
    #[error("rrd file not found: {0}")]
    NotFound(PathBuf),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed rrd file: {0}")]
    Format(String),

    #[error("unknown dsType: {0}")]
    BadDsType(String),
}

/// Consolidation function applied when the requested step is coarser than
/// the file's native step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsolFn {
    #[default]
    Average,
    Max,
    Min,
    Last,
}

impl fmt::Display for ConsolFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsolFn::Average => "AVERAGE",
            ConsolFn::Max => "MAX",
            ConsolFn::Min => "MIN",
            ConsolFn::Last => "LAST",
        };
        f.write_str(s)
    }
}

impl FromStr for ConsolFn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AVERAGE" => Ok(ConsolFn::Average),
            "MAX" => Ok(ConsolFn::Max),
            "MIN" => Ok(ConsolFn::Min),
            "LAST" => Ok(ConsolFn::Last),
            other => Err(format!("unknown consolidation function: {other}")),
        }
    }
}

/// Disk read/update primitive for one series file.
pub trait RrdBackend: Send + Sync {
    /// Read an aligned range. Buckets with no stored value come back as
    /// NaN; a missing file is an error.
    fn fetch(
        &self,
        path: &Path,
        cf: ConsolFn,
        start: i64,
        end: i64,
        step: i64,
    ) -> Result<Vec<RrdData>, RrdError>;

    /// Apply a batch update, creating the file if missing. Samples are
    /// applied in ascending timestamp order; duplicate timestamps coalesce
    /// to the last write; samples at or before the file's last update are
    /// skipped.
    fn flush(&self, path: &Path, items: &[GraphItem]) -> Result<(), RrdError>;
}
