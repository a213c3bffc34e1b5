//! Runtime counters and developer-facing cache statistics.
//!
//! Reporting only: nothing in here feeds back into cache behavior. The
//! snapshot is what a host application surfaces in a developer HUD.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::warn;

#[derive(Debug)]
struct StatsInner {
    started_at: Instant,
    lookups: u64,
    hits: u64,
    pyramid_bytes: u64,
    pyramid_capacity: u64,
    pyramid_entries: usize,
    jobs_in_flight: usize,
    jobs_queued: usize,
}

impl Default for StatsInner {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            lookups: 0,
            hits: 0,
            pyramid_bytes: 0,
            pyramid_capacity: 0,
            pyramid_entries: 0,
            jobs_in_flight: 0,
            jobs_queued: 0,
        }
    }
}

/// Thread-safe counter collection shared across the cache components.
#[derive(Debug, Default)]
pub struct StatsCollector {
    inner: parking_lot::Mutex<StatsInner>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record whether a pyramid lookup produced a hit.
    pub fn record_lookup(&self, hit: bool) {
        let mut guard = self.inner.lock();
        guard.lookups = guard.lookups.saturating_add(1);
        if hit {
            guard.hits = guard.hits.saturating_add(1);
        }
    }

    /// Update the pyramid ledger mirror.
    pub fn update_pyramid_usage(&self, used_bytes: u64, capacity_bytes: u64, entries: usize) {
        let mut guard = self.inner.lock();
        guard.pyramid_bytes = used_bytes;
        guard.pyramid_capacity = capacity_bytes;
        guard.pyramid_entries = entries;
    }

    /// Update generation pipeline depth.
    pub fn update_pipeline_depth(&self, in_flight: usize, queued: usize) {
        let mut guard = self.inner.lock();
        guard.jobs_in_flight = in_flight;
        guard.jobs_queued = queued;
    }

    /// Immutable snapshot for presentation.
    pub fn snapshot(&self) -> CacheSnapshot {
        let guard = self.inner.lock();
        let hit_ratio =
            if guard.lookups == 0 { 0.0 } else { guard.hits as f32 / guard.lookups as f32 };

        CacheSnapshot {
            timestamp_ms: now_ms(),
            uptime_ms: guard.started_at.elapsed().as_millis() as u64,
            lookups: guard.lookups,
            hit_ratio,
            pyramid_bytes: guard.pyramid_bytes,
            pyramid_capacity: guard.pyramid_capacity,
            pyramid_entries: guard.pyramid_entries,
            jobs_in_flight: guard.jobs_in_flight,
            jobs_queued: guard.jobs_queued,
        }
    }
}

fn now_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(delta) => delta.as_millis() as u64,
        Err(err) => {
            warn!("system clock error: {err}");
            0
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    pub timestamp_ms: u64,
    pub uptime_ms: u64,
    pub lookups: u64,
    pub hit_ratio: f32,
    pub pyramid_bytes: u64,
    pub pyramid_capacity: u64,
    pub pyramid_entries: usize,
    pub jobs_in_flight: usize,
    pub jobs_queued: usize,
}

impl CacheSnapshot {
    /// JSON payload for a developer HUD or log line.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
