//! Configuration schema for docpack
//!
//! Configuration is stored at `~/.config/docpack/config.toml`

use crate::archive::ArchiveConfig;
use crate::monitor::PressureThresholds;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Archive building settings
    pub archive: ArchiveSettings,

    /// Cache settings
    pub cache: CacheConfig,

    /// Retry settings for entry writes
    pub retry: RetryConfig,

    /// Resource pressure thresholds
    pub monitor: MonitorConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Archive building configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    /// Compression level 0-9 (0 = store only)
    pub compression_level: u32,

    /// Largest single entry accepted, in bytes
    pub max_entry_bytes: u64,

    /// Largest aggregate of entry bytes accepted
    pub max_total_bytes: u64,

    /// Keep directory components in entry names
    pub preserve_directory_structure: bool,

    /// Entries above this size are streamed in chunks (before pressure scaling)
    pub streaming_threshold_bytes: u64,

    /// Chunk size for streamed entries
    pub chunk_size_bytes: usize,

    /// Drop oversized entries with a warning instead of failing the build
    pub skip_oversized_entries: bool,

    /// Wall-clock budget for a single build (0 = unbounded)
    pub build_timeout_secs: u64,

    /// Archives up to this size are returned in memory, larger ones by path
    pub inline_result_max_bytes: u64,

    /// Entries hashed concurrently while computing the cache key
    pub prepare_parallelism: usize,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            compression_level: 6,
            max_entry_bytes: 64 * MB,
            max_total_bytes: 512 * MB,
            preserve_directory_structure: true,
            streaming_threshold_bytes: MB,
            chunk_size_bytes: 64 * 1024,
            skip_oversized_entries: false,
            build_timeout_secs: 300,
            inline_result_max_bytes: 16 * MB,
            prepare_parallelism: 4,
        }
    }
}

impl ArchiveSettings {
    /// The per-request part of these settings
    pub fn request_config(&self) -> ArchiveConfig {
        ArchiveConfig {
            compression_level: self.compression_level,
            max_entry_bytes: self.max_entry_bytes,
            max_total_bytes: self.max_total_bytes,
            preserve_directory_structure: self.preserve_directory_structure,
            skip_oversized_entries: self.skip_oversized_entries,
        }
    }

    /// Build timeout, `None` when disabled
    pub fn build_timeout(&self) -> Option<Duration> {
        (self.build_timeout_secs > 0).then(|| Duration::from_secs(self.build_timeout_secs))
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory (defaults to the platform cache dir)
    pub dir: Option<PathBuf>,

    /// Remove archives older than N days after each store (0 = disabled)
    pub ttl_days: u32,

    /// Maximum total cache size in MB before oldest archives are removed (0 = unbounded)
    pub max_total_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_days: 30,
            max_total_mb: 2048,
        }
    }
}

impl CacheConfig {
    /// Age limit for cached archives
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_days > 0).then(|| Duration::from_secs(u64::from(self.ttl_days) * 24 * 60 * 60))
    }

    /// Size cap for the cache directory in bytes
    pub fn max_total_bytes(&self) -> Option<u64> {
        (self.max_total_mb > 0).then(|| self.max_total_mb * MB)
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per entry write, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// Convert to the retry policy value used by the builder
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Resource monitor configuration (percentages)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub memory_medium_percent: f64,
    pub memory_high_percent: f64,
    pub cpu_medium_percent: f64,
    pub cpu_high_percent: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let thresholds = PressureThresholds::default();
        Self {
            memory_medium_percent: thresholds.memory_medium,
            memory_high_percent: thresholds.memory_high,
            cpu_medium_percent: thresholds.cpu_medium,
            cpu_high_percent: thresholds.cpu_high,
        }
    }
}

impl MonitorConfig {
    /// Convert to monitor thresholds
    pub fn thresholds(&self) -> PressureThresholds {
        PressureThresholds {
            memory_medium: self.memory_medium_percent,
            memory_high: self.memory_high_percent,
            cpu_medium: self.cpu_medium_percent,
            cpu_high: self.cpu_high_percent,
        }
    }
}
