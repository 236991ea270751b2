// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Weekly index GC: prunes series unseen for the retention horizon.
//!
//! Fires Saturdays at 02:00 UTC (cron `0 0 2 ? * 6`). A singleton permit
//! skips a run while the previous one still executes; the admin surface
//! can force a run between schedules.

use crate::runtime::{unix_now, Runtime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

/// Maximum index entry age: one week by last-seen timestamp.
const RETENTION_SECS: i64 = 7 * 24 * 3600;

const DAY: i64 = 86_400;
const FIRE_OFFSET: i64 = 2 * 3600; // 02:00:00 UTC
const SATURDAY: i64 = 6;

/// Next Saturday 02:00 UTC strictly after `now`.
pub fn next_weekly_run(now: i64) -> i64 {
    let today = now.div_euclid(DAY) * DAY;
    for d in 0..=7 {
        let day_start = today + d * DAY;
        // epoch day zero (1970-01-01) was a Thursday; 0 = Sunday
        let weekday = (day_start.div_euclid(DAY) + 4).rem_euclid(7);
        let fire = day_start + FIRE_OFFSET;
        if weekday == SATURDAY && fire > now {
            return fire;
        }
    }
    // the window above always contains a Saturday
    today + 7 * DAY + FIRE_OFFSET
}

/// Sleep-until-fire loop, until shutdown.
pub async fn run_index_gc(rt: Arc<Runtime>, shutdown: Arc<Notify>) {
    loop {
        let now = unix_now();
        let wait = (next_weekly_run(now) - now).max(1) as u64;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(wait)) => {
                delete_index(&rt);
            }
            _ = shutdown.notified() => return,
        }
    }
}

/// One GC run. Returns the deleted `(endpoints, counters)`, or `None`
/// when a run is already in flight.
pub fn delete_index(rt: &Runtime) -> Option<(usize, usize)> {
    let Ok(_permit) = rt.gc_gate.try_acquire() else {
        info!("index gc already running, skipped");
        return None;
    };

    let started = unix_now();
    let horizon = started - RETENTION_SECS;
    let (endpoints, counters) = rt.index.delete_older_than(horizon);
    rt.stats.incr_index_delete();

    info!(
        endpoints,
        counters,
        took_secs = unix_now() - started,
        "index gc done"
    );
    Some((endpoints, counters))
}
