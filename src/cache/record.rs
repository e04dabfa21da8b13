//! Cache records and their on-disk sidecars

use crate::cache::key::CacheKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Cache size status relative to configured limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSizeStatus {
    /// Under 80% of limit
    Ok,
    /// Between 80% and 100% of limit
    Warning,
    /// At or over the limit
    Exceeded,
}

impl CacheSizeStatus {
    pub fn from_usage(current_bytes: u64, limit_bytes: u64) -> Self {
        let percent = Self::percentage(current_bytes, limit_bytes);
        if percent >= 100.0 {
            Self::Exceeded
        } else if percent >= 80.0 {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    /// Percentage of `limit_bytes` in use; 0 when unlimited
    pub fn percentage(current_bytes: u64, limit_bytes: u64) -> f64 {
        if limit_bytes == 0 {
            return 0.0;
        }
        (current_bytes as f64 / limit_bytes as f64) * 100.0
    }
}

/// A verified archive in the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheRecord {
    pub key: CacheKey,
    pub archive_path: PathBuf,
    /// SHA-256 of the archive bytes
    pub integrity_hash: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl CacheRecord {
    /// Record for `key`; the sidecar's own key must already have been checked
    pub(crate) fn from_sidecar(key: CacheKey, sidecar: RecordSidecar, archive_path: PathBuf) -> Self {
        Self {
            key,
            archive_path,
            integrity_hash: sidecar.integrity_hash,
            created_at: sidecar.created_at,
            size_bytes: sidecar.size_bytes,
        }
    }

    pub(crate) fn sidecar(&self) -> RecordSidecar {
        RecordSidecar {
            key: self.key.clone(),
            integrity_hash: self.integrity_hash.clone(),
            created_at: self.created_at,
            size_bytes: self.size_bytes,
        }
    }

    /// Time since the record was stored; zero for timestamps in the future
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_older_than(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }
}

/// JSON stored next to each archive; its presence publishes the record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RecordSidecar {
    pub key: CacheKey,
    pub integrity_hash: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Records removed by an eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub removed: Vec<CacheKey>,
    pub bytes_freed: u64,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }

    pub fn count(&self) -> usize {
        self.removed.len()
    }

    pub(crate) fn push(&mut self, record: &CacheRecord) {
        self.removed.push(record.key.clone());
        self.bytes_freed += record.size_bytes;
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: EvictionReport) {
        self.removed.extend(other.removed);
        self.bytes_freed += other.bytes_freed;
    }
}
