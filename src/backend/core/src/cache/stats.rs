//! Cache statistics.
//!
//! Counters are process-local atomics, mirrored to the `metrics` facade as
//! they are bumped. Derived figures are computed when a snapshot is taken.
//!
//! `operations` counts logical manager calls and is bumped separately from
//! the outcome counters: one `remember` miss records a miss and a set but is
//! still one operation.

use crate::telemetry::metrics as names;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Concurrent statistics collector owned by a cache manager.
#[derive(Debug)]
pub struct StatsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
    bytes_stored: AtomicU64,
    operations: AtomicU64,
    started: RwLock<(Instant, DateTime<Utc>)>,
}

/// Point-in-time view of the collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub flushes: u64,
    pub bytes_stored: u64,
    pub operations: u64,
    /// `hits / (hits + misses)`, zero before the first read
    pub hit_rate: f64,
    pub ops_per_second: f64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: f64,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            bytes_stored: AtomicU64::new(0),
            operations: AtomicU64::new(0),
            started: RwLock::new((Instant::now(), Utc::now())),
        }
    }

    /// One logical call, whatever its outcome.
    pub fn record_operation(&self, op: &'static str) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_OPERATIONS, "op" => op).increment(1);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_HITS).increment(1);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_MISSES).increment(1);
    }

    pub fn record_set(&self, bytes: usize) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.bytes_stored.fetch_add(bytes as u64, Ordering::Relaxed);
        counter!(names::CACHE_SETS).increment(1);
        counter!(names::CACHE_BYTES_STORED).increment(bytes as u64);
        metrics::histogram!(names::CACHE_ENTRY_SIZE).record(bytes as f64);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_DELETES).increment(1);
    }

    /// One flush operation, whatever the number of keys it removed.
    pub fn record_flush(&self, kind: &'static str) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_FLUSHES, "kind" => kind).increment(1);
    }

    /// Take a snapshot with derived rates.
    pub fn snapshot(&self) -> StatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let sets = self.sets.load(Ordering::Relaxed);
        let deletes = self.deletes.load(Ordering::Relaxed);
        let flushes = self.flushes.load(Ordering::Relaxed);
        let bytes_stored = self.bytes_stored.load(Ordering::Relaxed);
        let operations = self.operations.load(Ordering::Relaxed);

        let (started, started_at) = *self.started.read();
        let uptime_secs = started.elapsed().as_secs_f64();

        let reads = hits + misses;
        let hit_rate = if reads == 0 {
            0.0
        } else {
            hits as f64 / reads as f64
        };
        let ops_per_second = if uptime_secs > 0.0 {
            operations as f64 / uptime_secs
        } else {
            0.0
        };

        StatsSnapshot {
            hits,
            misses,
            sets,
            deletes,
            flushes,
            bytes_stored,
            operations,
            hit_rate,
            ops_per_second,
            started_at,
            uptime_secs,
        }
    }

    /// Zero every counter and restart the clock.
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.sets,
            &self.deletes,
            &self.flushes,
            &self.bytes_stored,
            &self.operations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.started.write() = (Instant::now(), Utc::now());
    }
}
