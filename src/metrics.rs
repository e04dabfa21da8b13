//! Build counters and timings
//!
//! Counters use relaxed atomics; a snapshot is a best-effort view and is not
//! taken atomically across counters.

use crate::error::FailureKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Something worth counting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    /// A build actually started (not a hit, not a coalesced wait)
    BuildStarted,
    CacheHit,
    CacheMiss,
    /// A caller joined a build already in flight
    Coalesced,
    /// An entry write failed transiently and was retried
    EntryRetried,
    /// An oversized entry was dropped in skip mode
    EntrySkipped,
    BuildSucceeded { duration: Duration },
    BuildFailed(FailureKind),
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub builds_started: u64,
    pub builds_succeeded: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub coalesced: u64,
    pub entries_retried: u64,
    pub entries_skipped: u64,
    pub failures: BTreeMap<FailureKind, u64>,
    pub build_duration: DurationStats,
}

impl MetricsSnapshot {
    pub fn failures_total(&self) -> u64 {
        self.failures.values().sum()
    }

    pub fn failures_of(&self, kind: FailureKind) -> u64 {
        self.failures.get(&kind).copied().unwrap_or(0)
    }
}

/// Aggregate of successful build durations, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DurationStats {
    pub count: u64,
    pub total_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DurationStats {
    pub fn mean_ms(&self) -> Option<u64> {
        (self.count > 0).then(|| self.total_ms / self.count)
    }
}

/// Additive, thread-safe metrics sink shared through `Arc`
#[derive(Debug)]
pub struct MetricsCollector {
    builds_started: AtomicU64,
    builds_succeeded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    coalesced: AtomicU64,
    entries_retried: AtomicU64,
    entries_skipped: AtomicU64,
    duration_count: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_min_ms: AtomicU64,
    duration_max_ms: AtomicU64,
    failures: Mutex<BTreeMap<FailureKind, u64>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            builds_started: AtomicU64::new(0),
            builds_succeeded: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            entries_retried: AtomicU64::new(0),
            entries_skipped: AtomicU64::new(0),
            duration_count: AtomicU64::new(0),
            duration_total_ms: AtomicU64::new(0),
            duration_min_ms: AtomicU64::new(u64::MAX),
            duration_max_ms: AtomicU64::new(0),
            failures: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, event: MetricEvent) {
        match event {
            MetricEvent::BuildStarted => bump(&self.builds_started),
            MetricEvent::CacheHit => bump(&self.cache_hits),
            MetricEvent::CacheMiss => bump(&self.cache_misses),
            MetricEvent::Coalesced => bump(&self.coalesced),
            MetricEvent::EntryRetried => bump(&self.entries_retried),
            MetricEvent::EntrySkipped => bump(&self.entries_skipped),
            MetricEvent::BuildSucceeded { duration } => {
                bump(&self.builds_succeeded);
                let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                bump(&self.duration_count);
                self.duration_total_ms.fetch_add(ms, Ordering::Relaxed);
                self.duration_min_ms.fetch_min(ms, Ordering::Relaxed);
                self.duration_max_ms.fetch_max(ms, Ordering::Relaxed);
            }
            MetricEvent::BuildFailed(kind) => {
                let mut failures = self
                    .failures
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *failures.entry(kind).or_insert(0) += 1;
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = load(&self.duration_count);
        MetricsSnapshot {
            builds_started: load(&self.builds_started),
            builds_succeeded: load(&self.builds_succeeded),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            coalesced: load(&self.coalesced),
            entries_retried: load(&self.entries_retried),
            entries_skipped: load(&self.entries_skipped),
            failures: self
                .failures
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            build_duration: DurationStats {
                count,
                total_ms: load(&self.duration_total_ms),
                min_ms: if count == 0 { 0 } else { load(&self.duration_min_ms) },
                max_ms: load(&self.duration_max_ms),
            },
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.builds_started,
            &self.builds_succeeded,
            &self.cache_hits,
            &self.cache_misses,
            &self.coalesced,
            &self.entries_retried,
            &self.entries_skipped,
            &self.duration_count,
            &self.duration_total_ms,
            &self.duration_max_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.duration_min_ms.store(u64::MAX, Ordering::Relaxed);
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
