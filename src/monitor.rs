//! Resource pressure sampling
//!
//! The builder asks the monitor before every entry how much it may buffer in
//! memory. Under load the streaming threshold shrinks so that large entries are
//! chunked instead of read whole.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Coarse system load level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A single memory/CPU reading, both in percent (0-100)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

/// Percent thresholds at which each resource counts as medium or high pressure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    pub memory_medium: f64,
    pub memory_high: f64,
    pub cpu_medium: f64,
    pub cpu_high: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            memory_medium: 70.0,
            memory_high: 85.0,
            cpu_medium: 75.0,
            cpu_high: 90.0,
        }
    }
}

impl PressureThresholds {
    /// Classify a reading; the worse of the two resources wins
    pub fn classify(&self, usage: ResourceUsage) -> PressureLevel {
        let level = |value: f64, medium: f64, high: f64| {
            if value >= high {
                PressureLevel::High
            } else if value >= medium {
                PressureLevel::Medium
            } else {
                PressureLevel::Low
            }
        };

        level(usage.memory_percent, self.memory_medium, self.memory_high).max(level(
            usage.cpu_percent,
            self.cpu_medium,
            self.cpu_high,
        ))
    }
}

/// Source of resource readings
///
/// Implemented by the real system sampler and by fixed samplers used to
/// simulate load.
pub trait ResourceSampler: Send + Sync {
    /// Take one reading
    fn sample(&self) -> io::Result<ResourceUsage>;
}

/// Reads system memory and load average via `sysinfo(2)`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSampler;

impl ResourceSampler for SystemSampler {
    #[cfg(target_os = "linux")]
    fn sample(&self) -> io::Result<ResourceUsage> {
        // SAFETY: sysinfo only writes into the zeroed struct we pass.
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        if unsafe { libc::sysinfo(&mut info) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let unit = u64::from(info.mem_unit.max(1));
        let total = info.totalram as u64 * unit;
        if total == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "sysinfo reported no RAM"));
        }
        let available = (info.freeram as u64 + info.bufferram as u64) * unit;
        let memory_percent = 100.0 * (total.saturating_sub(available)) as f64 / total as f64;

        // loads[] is fixed point with 16 fractional bits
        let load_1m = info.loads[0] as f64 / f64::from(1u32 << 16);
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        let cpu_percent = (100.0 * load_1m / cores).min(100.0);

        Ok(ResourceUsage {
            memory_percent,
            cpu_percent,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self) -> io::Result<ResourceUsage> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "resource sampling is only implemented on Linux",
        ))
    }
}

/// Always returns the same reading
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler(pub ResourceUsage);

impl FixedSampler {
    /// A reading that classifies as the given level under default thresholds
    pub fn at(level: PressureLevel) -> Self {
        let percent = match level {
            PressureLevel::Low => 10.0,
            PressureLevel::Medium => 80.0,
            PressureLevel::High => 95.0,
        };
        Self(ResourceUsage {
            memory_percent: percent,
            cpu_percent: percent,
        })
    }
}

impl ResourceSampler for FixedSampler {
    fn sample(&self) -> io::Result<ResourceUsage> {
        Ok(self.0)
    }
}

/// Tracks pressure and scales the streaming threshold accordingly
pub struct ResourceMonitor {
    sampler: Box<dyn ResourceSampler>,
    thresholds: PressureThresholds,
    last_level: Mutex<PressureLevel>,
}

impl ResourceMonitor {
    /// Create a monitor over the given sampler
    pub fn new(sampler: impl ResourceSampler + 'static, thresholds: PressureThresholds) -> Self {
        Self {
            sampler: Box::new(sampler),
            thresholds,
            last_level: Mutex::new(PressureLevel::Low),
        }
    }

    /// Monitor backed by the system sampler
    pub fn system(thresholds: PressureThresholds) -> Self {
        Self::new(SystemSampler, thresholds)
    }

    /// Current pressure level
    ///
    /// Never fails: a sampling error is logged and the last known level is
    /// returned instead.
    pub fn sample(&self) -> PressureLevel {
        let mut last = self
            .last_level
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match self.sampler.sample() {
            Ok(usage) => {
                let level = self.thresholds.classify(usage);
                if level != *last {
                    debug!(
                        "Resource pressure {} -> {} (mem {:.1}%, cpu {:.1}%)",
                        *last, level, usage.memory_percent, usage.cpu_percent
                    );
                }
                *last = level;
                level
            }
            Err(e) => {
                warn!("Resource sampling failed, keeping {} pressure: {}", *last, e);
                *last
            }
        }
    }

    /// Last level observed without taking a new sample
    pub fn last_level(&self) -> PressureLevel {
        *self
            .last_level
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Streaming threshold for the current pressure level
    pub fn recommended_streaming_threshold(&self, base_threshold: u64) -> u64 {
        scale_threshold(base_threshold, self.sample())
    }
}

/// Scale a base threshold down as pressure rises
pub fn scale_threshold(base_threshold: u64, level: PressureLevel) -> u64 {
    match level {
        PressureLevel::Low => base_threshold,
        PressureLevel::Medium => base_threshold / 4 * 3,
        PressureLevel::High => base_threshold / 2,
    }
}
