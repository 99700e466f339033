//! Memory accounting across rooms.
//!
//! The tracker only reports; the eviction policy reacting to its thresholds
//! lives in the chat manager's monitor worker.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Usage above this share of the limit logs a warning.
const NEAR_LIMIT_PERCENT: f64 = 80.0;

/// Usage above this share of the limit triggers emergency eviction.
const CRITICAL_PERCENT: f64 = 90.0;

/// Aggregated byte counts for the whole chat service.
pub struct MemoryTracker {
    total_bytes: AtomicU64,
    total_messages: AtomicU64,
    active_streams: AtomicU64,
    max_bytes: u64,
}

/// Snapshot of tracker state for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub total_mb: f64,
    pub max_bytes: u64,
    pub max_mb: f64,
    pub usage_percent: f64,
    pub total_messages: u64,
    pub active_streams: u64,
    pub is_near_limit: bool,
    pub is_critical: bool,
}

impl MemoryTracker {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            total_bytes: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            active_streams: AtomicU64::new(0),
            max_bytes: max_bytes.max(1),
        }
    }

    /// Replace the aggregate counters with a freshly computed sweep.
    pub fn update(&self, bytes: u64, messages: u64, streams: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
        self.total_messages.store(messages, Ordering::Relaxed);
        self.active_streams.store(streams, Ordering::Relaxed);
    }

    pub fn usage_percent(&self) -> f64 {
        self.total_bytes.load(Ordering::Relaxed) as f64 / self.max_bytes as f64 * 100.0
    }

    pub fn near_limit(&self) -> bool {
        self.usage_percent() > NEAR_LIMIT_PERCENT
    }

    pub fn critical(&self) -> bool {
        self.usage_percent() > CRITICAL_PERCENT
    }

    pub fn stats(&self) -> MemoryStats {
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);
        let usage_percent = self.usage_percent();
        MemoryStats {
            total_bytes,
            total_mb: total_bytes as f64 / (1024.0 * 1024.0),
            max_bytes: self.max_bytes,
            max_mb: self.max_bytes as f64 / (1024.0 * 1024.0),
            usage_percent,
            total_messages: self.total_messages.load(Ordering::Relaxed),
            active_streams: self.active_streams.load(Ordering::Relaxed),
            is_near_limit: usage_percent > NEAR_LIMIT_PERCENT,
            is_critical: usage_percent > CRITICAL_PERCENT,
        }
    }
}
