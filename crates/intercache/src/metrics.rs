//! Cache performance monitoring and metrics

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

/// Point-in-time view of a cache layer's counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Calls answered from the in-memory mapping
    pub hits: u64,
    /// Calls that had to invoke the getter
    pub misses: u64,
    /// Getter results the validator refused to cache
    pub rejections: u64,
    /// Writes mirrored to the persistence backend
    pub persisted_writes: u64,
    /// Backend operations that failed and were treated as no-ops
    pub persistence_failures: u64,
    /// Entries restored from the persistence backend
    pub rehydrated: u64,
    /// Entries currently held in memory
    pub entry_count: usize,
    /// Average getter latency (milliseconds)
    pub avg_getter_time_ms: f64,
    pub created_at: SystemTime,
}

impl CacheStats {
    /// Hit rate as a percentage (0.0 to 100.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Thread-safe cache metrics tracker
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    rejections: Arc<AtomicU64>,
    persisted_writes: Arc<AtomicU64>,
    persistence_failures: Arc<AtomicU64>,
    rehydrated: Arc<AtomicU64>,
    total_getter_time_us: Arc<AtomicU64>,
    created_at: SystemTime,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            rejections: Arc::new(AtomicU64::new(0)),
            persisted_writes: Arc::new(AtomicU64::new(0)),
            persistence_failures: Arc::new(AtomicU64::new(0)),
            rehydrated: Arc::new(AtomicU64::new(0)),
            total_getter_time_us: Arc::new(AtomicU64::new(0)),
            created_at: SystemTime::now(),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a miss together with the time the getter took
    pub fn record_miss(&self, getter_time_ms: f64) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.total_getter_time_us
            .fetch_add((getter_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted_write(&self) {
        self.persisted_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rehydrated(&self, count: u64) {
        self.rehydrated.fetch_add(count, Ordering::Relaxed);
    }

    /// Snapshot of the counters; `entry_count` is supplied by the owner
    pub fn snapshot(&self, entry_count: usize) -> CacheStats {
        let misses = self.misses.load(Ordering::Relaxed);
        let total_getter_time_us = self.total_getter_time_us.load(Ordering::Relaxed);
        let avg_getter_time_ms = if misses > 0 {
            total_getter_time_us as f64 / misses as f64 / 1000.0
        } else {
            0.0
        };

        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses,
            rejections: self.rejections.load(Ordering::Relaxed),
            persisted_writes: self.persisted_writes.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            rehydrated: self.rehydrated.load(Ordering::Relaxed),
            entry_count,
            avg_getter_time_ms,
            created_at: self.created_at,
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Operation timing helper
#[derive(Debug)]
pub struct OperationTimer {
    start_time: std::time::Instant,
}

impl OperationTimer {
    pub fn start() -> Self {
        Self {
            start_time: std::time::Instant::now(),
        }
    }

    /// Elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64() * 1000.0
    }
}
