// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-archive round-robin file format.
//!
//! Layout (little-endian):
//!
//! ```text
//! +-------+---------+--------+-----+------+------+-----------+---------+----------+
//! | magic | version | dsType | pad | step | rows | origin_ts | last_ts | last_raw |
//! |  4B   |   u32   |   u8   | 3B  | i64  | u32  |    i64    |   i64   |   f64    |
//! +-------+---------+--------+-----+------+------+-----------+---------+----------+
//! | rows x f64 slots, circular over bucket index                                  |
//! +-------------------------------------------------------------------------------+
//! ```
//!
//! Bucket `k` holds the consolidated value for `origin_ts + k*step`; its
//! slot is `k % rows`. `last_raw` carries the previous raw counter value
//! across flush batches so COUNTER/DERIVE rates survive process restarts.
//! Writes go through a temp file and an atomic rename.

use super::{ConsolFn, RrdBackend, RrdError};
use crate::item::{DsType, GraphItem, RrdData};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::debug;

const MAGIC: [u8; 4] = *b"RRDG";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 48;

/// One week of 60-second buckets.
pub const DEFAULT_ROWS: u32 = 10_080;

struct RrdFile {
    ds_type: DsType,
    step: i64,
    rows: u32,
    origin_ts: i64,
    last_ts: i64,
    last_raw: f64,
    slots: Vec<f64>,
}

impl RrdFile {
    fn create(ds_type: DsType, step: i64, rows: u32, first_ts: i64) -> Self {
        Self {
            ds_type,
            step,
            rows,
            origin_ts: first_ts,
            // first sample at origin_ts must pass the ts > last_ts check
            last_ts: first_ts - step,
            last_raw: f64::NAN,
            slots: vec![f64::NAN; rows as usize],
        }
    }

    fn decode(buf: &[u8]) -> Result<Self, RrdError> {
        if buf.len() < HEADER_LEN {
            return Err(RrdError::Format("short header".into()));
        }
        if buf[0..4] != MAGIC {
            return Err(RrdError::Format("bad magic".into()));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(RrdError::Format(format!("unsupported version {version}")));
        }
        let ds_type = match buf[8] {
            0 => DsType::Gauge,
            1 => DsType::Counter,
            2 => DsType::Derive,
            other => return Err(RrdError::Format(format!("bad dsType byte {other}"))),
        };
        let step = i64::from_le_bytes(buf[12..20].try_into().unwrap());
        let rows = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let origin_ts = i64::from_le_bytes(buf[24..32].try_into().unwrap());
        let last_ts = i64::from_le_bytes(buf[32..40].try_into().unwrap());
        let last_raw = f64::from_le_bytes(buf[40..48].try_into().unwrap());

        if step <= 0 || rows == 0 {
            return Err(RrdError::Format("non-positive step or zero rows".into()));
        }
        let want = HEADER_LEN + rows as usize * 8;
        if buf.len() != want {
            return Err(RrdError::Format(format!(
                "slot area truncated: {} != {want}",
                buf.len()
            )));
        }

        let mut slots = Vec::with_capacity(rows as usize);
        for i in 0..rows as usize {
            let off = HEADER_LEN + i * 8;
            slots.push(f64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
        }

        Ok(Self {
            ds_type,
            step,
            rows,
            origin_ts,
            last_ts,
            last_raw,
            slots,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.slots.len() * 8);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.push(match self.ds_type {
            DsType::Gauge => 0,
            DsType::Counter => 1,
            DsType::Derive => 2,
        });
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.step.to_le_bytes());
        buf.extend_from_slice(&self.rows.to_le_bytes());
        buf.extend_from_slice(&self.origin_ts.to_le_bytes());
        buf.extend_from_slice(&self.last_ts.to_le_bytes());
        buf.extend_from_slice(&self.last_raw.to_le_bytes());
        for slot in &self.slots {
            buf.extend_from_slice(&slot.to_le_bytes());
        }
        buf
    }

    fn bucket_of(&self, ts: i64) -> i64 {
        (ts - self.origin_ts).div_euclid(self.step)
    }

    /// Apply one sample. Assumes `ts > last_ts` (caller filters).
    fn apply(&mut self, ts: i64, raw: f64) {
        let value = if self.ds_type.is_rate() {
            if self.last_raw.is_finite() && ts > self.last_ts {
                let rate = (raw - self.last_raw) / (ts - self.last_ts) as f64;
                if rate < 0.0 {
                    f64::NAN
                } else {
                    rate
                }
            } else {
                f64::NAN
            }
        } else {
            raw
        };

        let prev_bucket = self.bucket_of(self.last_ts);
        let bucket = self.bucket_of(ts);

        // invalidate skipped buckets so a wrap cannot expose stale values
        let gap = (bucket - prev_bucket - 1).clamp(0, self.rows as i64);
        for j in 1..=gap {
            let idx = (prev_bucket + j).rem_euclid(self.rows as i64) as usize;
            self.slots[idx] = f64::NAN;
        }

        self.slots[bucket.rem_euclid(self.rows as i64) as usize] = value;
        self.last_ts = ts;
        self.last_raw = raw;
    }

    /// Value of native bucket `k`, NaN outside the retained window.
    fn bucket_value(&self, k: i64) -> f64 {
        let last_bucket = self.bucket_of(self.last_ts);
        if k < 0 || k > last_bucket || k <= last_bucket - self.rows as i64 {
            return f64::NAN;
        }
        self.slots[k.rem_euclid(self.rows as i64) as usize]
    }
}

/// File-backed RRD engine.
pub struct RrdFileBackend {
    rows: u32,
}

impl Default for RrdFileBackend {
    fn default() -> Self {
        Self { rows: DEFAULT_ROWS }
    }
}

impl RrdFileBackend {
    pub fn new(rows: u32) -> Self {
        Self { rows: rows.max(1) }
    }

    fn load(path: &Path) -> Result<RrdFile, RrdError> {
        let buf = match fs::read(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RrdError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        RrdFile::decode(&buf)
    }
}

impl RrdBackend for RrdFileBackend {
    fn fetch(
        &self,
        path: &Path,
        cf: ConsolFn,
        start: i64,
        end: i64,
        step: i64,
    ) -> Result<Vec<RrdData>, RrdError> {
        let file = Self::load(path)?;
        let native = file.step;

        // coarser-than-native steps consolidate whole groups of buckets
        let req = if step <= native {
            native
        } else {
            step.div_euclid(native).saturating_mul(native)
                + if step % native == 0 { 0 } else { native }
        };
        let factor = (req / native) as usize;

        let m_start = (start - file.origin_ts).div_euclid(req)
            + if (start - file.origin_ts).rem_euclid(req) == 0 {
                0
            } else {
                1
            };
        let m_end = (end - file.origin_ts).div_euclid(req);
        if m_end < m_start {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity((m_end - m_start + 1) as usize);
        for m in m_start..=m_end {
            let base = m * factor as i64;
            let members = (0..factor).map(|j| file.bucket_value(base + j as i64));
            let value = consolidate(cf, members);
            out.push(RrdData::new(file.origin_ts + m * req, value));
        }
        Ok(out)
    }

    fn flush(&self, path: &Path, items: &[GraphItem]) -> Result<(), RrdError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut sorted: Vec<&GraphItem> = items.iter().collect();
        sorted.sort_by_key(|i| i.timestamp);

        let ds_type: DsType = sorted[0]
            .ds_type
            .parse()
            .map_err(|_| RrdError::BadDsType(sorted[0].ds_type.clone()))?;
        let step = sorted[0].step;
        if step <= 0 {
            return Err(RrdError::Format(format!("non-positive step {step}")));
        }

        let mut file = match Self::load(path) {
            Ok(file) => file,
            Err(RrdError::NotFound(_)) => {
                RrdFile::create(ds_type, step, self.rows, sorted[0].timestamp)
            }
            Err(e) => return Err(e),
        };

        let mut applied = 0usize;
        let mut idx = 0;
        while idx < sorted.len() {
            // duplicate timestamps coalesce to the last write
            while idx + 1 < sorted.len() && sorted[idx + 1].timestamp == sorted[idx].timestamp {
                idx += 1;
            }
            let item = sorted[idx];
            if item.timestamp > file.last_ts {
                file.apply(item.timestamp, item.value);
                applied += 1;
            }
            idx += 1;
        }

        debug!(path = %path.display(), total = items.len(), applied, "rrd flush");
        write_atomic(path, &file.encode())?;
        Ok(())
    }
}

fn consolidate(cf: ConsolFn, members: impl Iterator<Item = f64>) -> f64 {
    let live: Vec<f64> = members.filter(|v| !v.is_nan()).collect();
    if live.is_empty() {
        return f64::NAN;
    }
    match cf {
        ConsolFn::Average => live.iter().sum::<f64>() / live.len() as f64,
        ConsolFn::Max => live.iter().cloned().fold(f64::MIN, f64::max),
        ConsolFn::Min => live.iter().cloned().fold(f64::MAX, f64::min),
        ConsolFn::Last => *live.last().unwrap(),
    }
}

/// Write `bytes` to `path` via a temp file in the same directory and an
/// atomic rename. Creates missing parent directories.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rrd".to_string())
    ));
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn item(ts: i64, value: f64, ds_type: &str, step: i64) -> GraphItem {
        GraphItem {
            endpoint: "host-a".into(),
            metric: "m".into(),
            tags: BTreeMap::new(),
            value,
            timestamp: ts,
            ds_type: ds_type.into(),
            step,
            heartbeat: 0,
            min: "U".into(),
            max: "U".into(),
        }
    }

    fn values(datas: &[RrdData]) -> Vec<f64> {
        datas.iter().map(|d| d.value.0).collect()
    }

    fn timestamps(datas: &[RrdData]) -> Vec<i64> {
        datas.iter().map(|d| d.timestamp).collect()
    }

    #[test]
    fn fetch_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let backend = RrdFileBackend::default();
        let err = backend
            .fetch(&dir.path().join("nope.rrd"), ConsolFn::Average, 0, 100, 60)
            .unwrap_err();
        assert!(matches!(err, RrdError::NotFound(_)));
    }

    #[test]
    fn gauge_flush_then_fetch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ab").join("series.rrd");
        let backend = RrdFileBackend::default();

        let items = vec![
            item(100, 1.0, "GAUGE", 60),
            item(160, 2.0, "GAUGE", 60),
            item(220, 3.0, "GAUGE", 60),
        ];
        backend.flush(&path, &items).unwrap();

        let datas = backend
            .fetch(&path, ConsolFn::Average, 100, 220, 60)
            .unwrap();
        assert_eq!(timestamps(&datas), vec![100, 160, 220]);
        assert_eq!(values(&datas), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn counter_rate_with_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.rrd");
        let backend = RrdFileBackend::default();

        let items = vec![
            item(0, 100.0, "COUNTER", 60),
            item(60, 160.0, "COUNTER", 60),
            item(120, 50.0, "COUNTER", 60),
        ];
        backend.flush(&path, &items).unwrap();

        let datas = backend.fetch(&path, ConsolFn::Average, 0, 120, 60).unwrap();
        assert_eq!(timestamps(&datas), vec![0, 60, 120]);
        assert!(datas[0].value.is_nan()); // no previous sample
        assert_eq!(datas[1].value.0, 1.0); // (160-100)/60
        assert!(datas[2].value.is_nan()); // counter reset
    }

    #[test]
    fn counter_rate_survives_separate_flushes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.rrd");
        let backend = RrdFileBackend::default();

        backend
            .flush(&path, &[item(0, 100.0, "COUNTER", 60)])
            .unwrap();
        backend
            .flush(&path, &[item(60, 160.0, "COUNTER", 60)])
            .unwrap();

        let datas = backend.fetch(&path, ConsolFn::Average, 0, 60, 60).unwrap();
        assert_eq!(values(&datas)[1], 1.0);
    }

    #[test]
    fn past_updates_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.rrd");
        let backend = RrdFileBackend::default();

        backend
            .flush(&path, &[item(100, 1.0, "GAUGE", 60), item(160, 2.0, "GAUGE", 60)])
            .unwrap();
        backend
            .flush(&path, &[item(100, 99.0, "GAUGE", 60)])
            .unwrap();

        let datas = backend
            .fetch(&path, ConsolFn::Average, 100, 160, 60)
            .unwrap();
        assert_eq!(values(&datas), vec![1.0, 2.0]);
    }

    #[test]
    fn duplicate_timestamps_coalesce_to_last() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.rrd");
        let backend = RrdFileBackend::default();

        backend
            .flush(
                &path,
                &[item(100, 1.0, "GAUGE", 60), item(100, 7.0, "GAUGE", 60)],
            )
            .unwrap();

        let datas = backend
            .fetch(&path, ConsolFn::Average, 100, 100, 60)
            .unwrap();
        assert_eq!(values(&datas), vec![7.0]);
    }

    #[test]
    fn gap_buckets_come_back_nan() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.rrd");
        let backend = RrdFileBackend::default();

        backend
            .flush(&path, &[item(100, 1.0, "GAUGE", 60), item(280, 4.0, "GAUGE", 60)])
            .unwrap();

        let datas = backend
            .fetch(&path, ConsolFn::Average, 100, 280, 60)
            .unwrap();
        assert_eq!(timestamps(&datas), vec![100, 160, 220, 280]);
        assert_eq!(datas[0].value.0, 1.0);
        assert!(datas[1].value.is_nan());
        assert!(datas[2].value.is_nan());
        assert_eq!(datas[3].value.0, 4.0);
    }

    #[test]
    fn coarse_step_consolidates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.rrd");
        let backend = RrdFileBackend::default();

        backend
            .flush(
                &path,
                &[
                    item(0, 2.0, "GAUGE", 60),
                    item(60, 4.0, "GAUGE", 60),
                    item(120, 8.0, "GAUGE", 60),
                    item(180, 16.0, "GAUGE", 60),
                ],
            )
            .unwrap();

        let avg = backend.fetch(&path, ConsolFn::Average, 0, 180, 120).unwrap();
        assert_eq!(timestamps(&avg), vec![0, 120]);
        assert_eq!(values(&avg), vec![3.0, 12.0]);

        let max = backend.fetch(&path, ConsolFn::Max, 0, 180, 120).unwrap();
        assert_eq!(values(&max), vec![4.0, 16.0]);
    }

    #[test]
    fn wrap_does_not_expose_stale_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.rrd");
        let backend = RrdFileBackend::new(4);

        backend
            .flush(
                &path,
                &[
                    item(0, 1.0, "GAUGE", 60),
                    item(60, 2.0, "GAUGE", 60),
                    item(120, 3.0, "GAUGE", 60),
                    item(180, 4.0, "GAUGE", 60),
                    // wraps over the slot of ts=0, then skips ts=300
                    item(240, 5.0, "GAUGE", 60),
                    item(360, 7.0, "GAUGE", 60),
                ],
            )
            .unwrap();

        let datas = backend.fetch(&path, ConsolFn::Average, 0, 360, 60).unwrap();
        assert!(datas[0].value.is_nan()); // fell out of the window
        assert!(datas[5].value.is_nan()); // skipped bucket, not the stale ts=60
        assert_eq!(datas[4].value.0, 5.0);
        assert_eq!(datas[6].value.0, 7.0);
    }
}
