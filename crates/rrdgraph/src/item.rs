// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Series identity: graph items, fingerprints, cache keys and RRD paths.
//!
//! A series is identified by `endpoint/metric[/k=v,...]`; its fingerprint is
//! the md5 of that primary key. The cache key appends dsType and step so the
//! RRD filename is derivable from the key alone.

use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Data-source kind of a series.
///
/// GAUGE stores the value as-is; COUNTER and DERIVE treat the value as a
/// monotonic counter and store the rate between successive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DsType {
    #[serde(rename = "GAUGE")]
    Gauge,
    #[serde(rename = "COUNTER")]
    Counter,
    #[serde(rename = "DERIVE")]
    Derive,
}

impl DsType {
    /// True for the rate-converting kinds (COUNTER, DERIVE).
    pub fn is_rate(self) -> bool {
        matches!(self, DsType::Counter | DsType::Derive)
    }
}

impl fmt::Display for DsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DsType::Gauge => "GAUGE",
            DsType::Counter => "COUNTER",
            DsType::Derive => "DERIVE",
        };
        f.write_str(s)
    }
}

impl FromStr for DsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GAUGE" => Ok(DsType::Gauge),
            "COUNTER" => Ok(DsType::Counter),
            "DERIVE" => Ok(DsType::Derive),
            other => Err(format!("unknown dsType: {other}")),
        }
    }
}

/// One received metric sample with its full series identity.
///
/// `ds_type` stays a free-form string on the wire; unknown kinds are
/// carried through ingest and only rejected where their semantics are
/// actually needed (flush, merge).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphItem {
    pub endpoint: String,
    pub metric: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: i64,
    #[serde(rename = "dsType")]
    pub ds_type: String,
    pub step: i64,
    #[serde(default)]
    pub heartbeat: i64,
    #[serde(default = "unknown_bound")]
    pub min: String,
    #[serde(default = "unknown_bound")]
    pub max: String,
}

fn unknown_bound() -> String {
    "U".to_string()
}

impl GraphItem {
    /// Primary key: `endpoint/metric` or `endpoint/metric/k=v,k=v` with
    /// tags in sorted order (BTreeMap iterates sorted).
    pub fn primary_key(&self) -> String {
        if self.tags.is_empty() {
            format!("{}/{}", self.endpoint, self.metric)
        } else {
            format!("{}/{}/{}", self.endpoint, self.metric, join_tags(&self.tags))
        }
    }

    /// Counter name as the index sees it: metric plus sorted tags.
    pub fn counter_name(&self) -> String {
        if self.tags.is_empty() {
            self.metric.clone()
        } else {
            format!("{}/{}", self.metric, join_tags(&self.tags))
        }
    }

    /// Stable fingerprint of the series identity: md5 hex of the primary
    /// key. Value and timestamp do not participate.
    pub fn checksum(&self) -> String {
        md5_hex(&self.primary_key())
    }

    /// Cache key: checksum extended with dsType and step, so the RRD
    /// filename is derivable from the key.
    pub fn rrd_cache_key(&self) -> String {
        form_rrd_cache_key(&self.checksum(), &self.ds_type, self.step)
    }
}

fn join_tags(tags: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (i, (k, v)) in tags.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

/// md5 of `input` as lowercase hex.
pub fn md5_hex(input: &str) -> String {
    use std::fmt::Write;
    let digest = Md5::digest(input.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in digest.iter() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// `{md5}_{dsType}_{step}` - the key the sample cache and the migration
/// layer are keyed by.
pub fn form_rrd_cache_key(md5: &str, ds_type: &str, step: i64) -> String {
    format!("{md5}_{ds_type}_{step}")
}

/// Split a cache key back into `(md5, dsType, step)`. Returns `None` for
/// keys that do not parse.
pub fn split_rrd_cache_key(key: &str) -> Option<(&str, &str, i64)> {
    let mut rev = key.rsplitn(3, '_');
    let step = rev.next()?.parse::<i64>().ok()?;
    let ds_type = rev.next()?;
    let md5 = rev.next()?;
    if md5.is_empty() || ds_type.is_empty() {
        return None;
    }
    Some((md5, ds_type, step))
}

/// `<root>/<md5[0:2]>/<md5>_<dsType>_<step>.rrd`; the two-character prefix
/// gives a 256-way directory fanout.
pub fn rrd_file_path(root: &str, md5: &str, ds_type: &str, step: i64) -> PathBuf {
    let mut path = PathBuf::from(root);
    path.push(&md5[0..2.min(md5.len())]);
    path.push(format!("{md5}_{ds_type}_{step}.rrd"));
    path
}

/// `f64` that serializes NaN and infinities as JSON `null` and reads
/// `null` back as NaN. RRD buckets use NaN for "missing".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JsonF64(pub f64);

impl JsonF64 {
    pub fn is_nan(self) -> bool {
        self.0.is_nan()
    }
}

impl From<f64> for JsonF64 {
    fn from(v: f64) -> Self {
        JsonF64(v)
    }
}

impl From<JsonF64> for f64 {
    fn from(v: JsonF64) -> Self {
        v.0
    }
}

impl Serialize for JsonF64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_finite() {
            serializer.serialize_f64(self.0)
        } else {
            serializer.serialize_none()
        }
    }
}

impl<'de> Deserialize<'de> for JsonF64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Option::<f64>::deserialize(deserializer)?;
        Ok(JsonF64(v.unwrap_or(f64::NAN)))
    }
}

/// One RRD bucket: aligned timestamp plus value (NaN = missing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrdData {
    pub timestamp: i64,
    pub value: JsonF64,
}

impl RrdData {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self {
            timestamp,
            value: JsonF64(value),
        }
    }
}
