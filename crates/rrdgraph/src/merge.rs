// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Merge of on-disk RRD data with the live in-memory buffer.
//!
//! The in-memory buffer is the truth for the freshest window; the RRD has
//! consolidated readings that fill holes. Merging by timestamp with NaN
//! fallback keeps both without double-counting.
//!
//! Two passes: first the buffered items are projected onto a step-aligned
//! `cache` series (rate conversion for COUNTER/DERIVE happens here), then
//! the output walks from `datas[0]` to the last buffered timestamp taking
//! cache values where present and falling back to the RRD bucket.

use crate::item::{GraphItem, RrdData};

/// Merge `datas` (RRD buckets, aligned at `step`) with `items` (buffered
/// samples, strictly ascending timestamps).
///
/// Returns `datas` unchanged when the inputs are too small to merge or do
/// not overlap, and an empty series for an unsupported dsType.
pub fn merge_with_cache(
    datas: &[RrdData],
    items: &[GraphItem],
    ds_type: &str,
    step: i64,
) -> Vec<RrdData> {
    let items_size = items.len();
    let datas_size = datas.len();

    let mergeable = items_size > 1
        && datas_size > 2
        && step > 0
        && datas[1].timestamp - datas[0].timestamp == step
        && items[items_size - 1].timestamp > datas[0].timestamp;
    if !mergeable {
        return datas.to_vec();
    }

    let cache = match ds_type {
        "GAUGE" => gauge_series(items, step),
        "COUNTER" | "DERIVE" => rate_series(items, step),
        _ => return Vec::new(),
    };

    let size =
        ((items[items_size - 1].timestamp - datas[0].timestamp) / step + 1) as usize;
    let mut ret = Vec::with_capacity(size);
    let mut cache_idx = 0usize;
    let mut ts = datas[0].timestamp;

    for i in 0..size {
        let value = if i < datas_size {
            if cache_idx < cache.len() && ts == cache[cache_idx].timestamp {
                let v = if cache[cache_idx].value.is_nan() {
                    // keep the RRD's consolidated reading visible through
                    // in-memory holes
                    datas[i].value
                } else {
                    cache[cache_idx].value
                };
                cache_idx += 1;
                v
            } else {
                datas[i].value
            }
        } else if cache_idx < cache.len() && ts == cache[cache_idx].timestamp {
            let v = cache[cache_idx].value;
            cache_idx += 1;
            v
        } else {
            f64::NAN.into()
        };
        ret.push(RrdData {
            timestamp: ts,
            value,
        });
        ts += step;
    }

    ret
}

/// Step-aligned projection of GAUGE items: bucket value where an item's
/// timestamp hits the bucket, NaN otherwise.
fn gauge_series(items: &[GraphItem], step: i64) -> Vec<RrdData> {
    let size = cache_len(items, step);
    let mut out = Vec::with_capacity(size);
    let mut idx = 0usize;
    let mut ts = items[0].timestamp;

    for _ in 0..size {
        let value = if idx < items.len() && ts == items[idx].timestamp {
            let v = items[idx].value;
            idx += 1;
            v
        } else {
            f64::NAN
        };
        out.push(RrdData::new(ts, value));
        ts += step;
    }
    out
}

/// Step-aligned rate projection of COUNTER/DERIVE items. The rate between
/// two consecutive items lands in the bucket of the later one; negative
/// rates (counter reset) and buckets without a closing item are NaN.
fn rate_series(items: &[GraphItem], step: i64) -> Vec<RrdData> {
    let size = cache_len(items, step);
    let mut out = Vec::with_capacity(size);
    let mut idx = 0usize;
    let mut ts = items[0].timestamp;

    for _ in 0..size {
        let value = if idx + 1 < items.len()
            && ts == items[idx + 1].timestamp
            && items[idx].timestamp != items[idx + 1].timestamp
        {
            let rate = (items[idx + 1].value - items[idx].value)
                / (items[idx + 1].timestamp - items[idx].timestamp) as f64;
            idx += 1;
            if rate < 0.0 {
                f64::NAN
            } else {
                rate
            }
        } else {
            f64::NAN
        };
        out.push(RrdData::new(ts, value));
        ts += step;
    }
    out
}

fn cache_len(items: &[GraphItem], step: i64) -> usize {
    ((items[items.len() - 1].timestamp - items[0].timestamp) / step + 1) as usize
}
