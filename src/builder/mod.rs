//! Archive builder
//!
//! Turns an [`ArchiveRequest`] into a finished archive, answering from the
//! cache when it can:
//!
//! ```text
//! request -> key -> cache hit ---------------------------------> result
//!                -> miss -> join/start build -> write entries
//!                        -> seal -> verify -> store -> release -> result
//! ```
//!
//! One build runs per key at a time. Callers asking for a key that is already
//! building wait for that build and share its outcome, success or failure.

mod build;
mod inflight;

use crate::archive::{ArchiveRequest, SealedArchive};
use crate::cache::{content_hashes, CacheKey, CacheRecord, ContentCache, StoreSource};
use crate::config::Config;
use crate::error::{DocpackError, DocpackResult};
use crate::metrics::{MetricEvent, MetricsCollector, MetricsSnapshot};
use crate::monitor::ResourceMonitor;
use crate::retry::{RetryCoordinator, RetryPolicy, Sleeper, ThreadSleeper};
use build::{discard_abandoned, BuildJob, BuiltArchive};
use futures_util::FutureExt;
use inflight::{InflightBuilds, SharedBuild, Slot};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};

/// Progress after each entry of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildProgress {
    pub entries_done: usize,
    pub entries_total: usize,
    /// Uncompressed bytes written so far
    pub bytes_done: u64,
}

/// Called from the build thread once per entry
pub type ProgressCallback = Arc<dyn Fn(BuildProgress) + Send + Sync>;

/// Builder-level settings; per-request options live in the request
#[derive(Debug, Clone)]
pub struct BuilderSettings {
    /// Entries above this size stream in chunks; also the in-memory archive limit
    pub streaming_threshold_bytes: u64,
    pub chunk_size_bytes: usize,
    pub build_timeout: Option<Duration>,
    /// Archives up to this size come back as bytes, larger ones as a path
    pub inline_result_max_bytes: u64,
    pub prepare_parallelism: usize,
    pub retry_policy: RetryPolicy,
    pub cache_ttl: Option<Duration>,
    pub cache_max_total_bytes: Option<u64>,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl BuilderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            streaming_threshold_bytes: config.archive.streaming_threshold_bytes,
            chunk_size_bytes: config.archive.chunk_size_bytes,
            build_timeout: config.archive.build_timeout(),
            inline_result_max_bytes: config.archive.inline_result_max_bytes,
            prepare_parallelism: config.archive.prepare_parallelism,
            retry_policy: config.retry.policy(),
            cache_ttl: config.cache.ttl(),
            cache_max_total_bytes: config.cache.max_total_bytes(),
        }
    }
}

/// The finished archive's bytes, or where to find them
#[derive(Debug, Clone)]
pub enum ArchiveData {
    Bytes(Arc<[u8]>),
    /// Path of the cached archive; it stays valid until evicted
    File(PathBuf),
}

impl ArchiveData {
    /// Full archive bytes, reading from disk if needed
    pub async fn read_all(&self) -> DocpackResult<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.to_vec()),
            Self::File(path) => fs::read(path)
                .await
                .map_err(|e| DocpackError::io(format!("reading {}", path.display()), e)),
        }
    }

    /// Write the archive to `dest`
    pub async fn write_to(&self, dest: &Path) -> DocpackResult<()> {
        let result = match self {
            Self::Bytes(bytes) => fs::write(dest, &bytes[..]).await,
            Self::File(path) => fs::copy(path, dest).await.map(|_| ()),
        };
        result.map_err(|e| DocpackError::io(format!("writing {}", dest.display()), e))
    }
}

/// What one call cost
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildMetrics {
    /// Entries written by this build; zero on a cache hit
    pub entries_written: usize,
    pub bytes_written: u64,
    pub archive_bytes: u64,
    pub buffered_entries: usize,
    pub chunked_entries: usize,
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub cache_hit: bool,
    /// The caller waited on a build started by someone else
    pub coalesced: bool,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone)]
pub struct ArchiveResult {
    pub key: CacheKey,
    pub data: ArchiveData,
    /// SHA-256 of the archive bytes
    pub integrity_hash: String,
    pub metrics: BuildMetrics,
    pub warnings: Vec<String>,
}

/// Builds archives through a shared cache
///
/// Cheap to clone; clones share the cache, metrics and in-flight table.
#[derive(Clone)]
pub struct ArchiveBuilder {
    cache: ContentCache,
    settings: BuilderSettings,
    monitor: Arc<ResourceMonitor>,
    metrics: Arc<MetricsCollector>,
    sleeper: Arc<dyn Sleeper>,
    progress: Option<ProgressCallback>,
    inflight: InflightBuilds,
}

impl ArchiveBuilder {
    /// Builder over `cache` with a system resource monitor and fresh metrics
    pub fn new(cache: ContentCache, settings: BuilderSettings) -> Self {
        Self {
            cache,
            settings,
            monitor: Arc::new(ResourceMonitor::system(Default::default())),
            metrics: Arc::new(MetricsCollector::new()),
            sleeper: Arc::new(ThreadSleeper),
            progress: None,
            inflight: InflightBuilds::default(),
        }
    }

    pub fn with_monitor(mut self, monitor: ResourceMonitor) -> Self {
        self.monitor = Arc::new(monitor);
        self
    }

    /// Report into an existing collector
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sleeper used between retry attempts
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_progress(
        mut self,
        callback: impl Fn(BuildProgress) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn settings(&self) -> &BuilderSettings {
        &self.settings
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    pub fn snapshot_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Return the archive for `request`, from the cache or by building it
    pub async fn build_or_fetch(&self, request: ArchiveRequest) -> DocpackResult<ArchiveResult> {
        let started = Instant::now();
        let hashes = content_hashes(&request, self.settings.prepare_parallelism).await?;
        let key = CacheKey::for_request(&request, &hashes);
        debug!("Computed cache key {} for {} entries", key.short(), request.len());

        if let Some(record) = self.cache.lookup(&key).await? {
            self.metrics.record(MetricEvent::CacheHit);
            return self.hit_result(record, started).await;
        }
        self.metrics.record(MetricEvent::CacheMiss);

        let (build, slot) = self
            .inflight
            .join_or_start(&key, || self.start_build(key.clone(), request, hashes));

        if slot == Slot::Follower {
            debug!("Joining in-flight build {}", key.short());
            self.metrics.record(MetricEvent::Coalesced);
        }

        let mut result = build.await?;
        if slot == Slot::Follower {
            result.metrics.coalesced = true;
        }
        Ok(result)
    }

    /// Spawn the build task and wrap it as a shared future
    ///
    /// The task runs to completion even if every caller goes away, and
    /// releases the in-flight slot itself once the result is stored.
    fn start_build(
        &self,
        key: CacheKey,
        request: ArchiveRequest,
        content_hashes: Vec<String>,
    ) -> SharedBuild {
        let builder = self.clone();
        let handle = tokio::spawn(async move {
            let result = builder.build_and_store(&key, request, content_hashes).await;
            builder.inflight.release(&key);
            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(DocpackError::Internal(format!("build task failed: {}", e))))
        }
        .boxed()
        .shared()
    }

    async fn build_and_store(
        &self,
        key: &CacheKey,
        request: ArchiveRequest,
        content_hashes: Vec<String>,
    ) -> DocpackResult<ArchiveResult> {
        let started = Instant::now();

        // A build for this key may have finished between our miss and taking the slot
        if let Some(record) = self.cache.lookup(key).await? {
            debug!("Archive {} appeared while waiting for the slot", key.short());
            return self.hit_result(record, started).await;
        }

        self.metrics.record(MetricEvent::BuildStarted);
        info!(
            "Building archive {} ({} entries)",
            key.short(),
            request.len()
        );

        let outcome = self.build_verified(key, request, content_hashes, started).await;
        match &outcome {
            Ok(result) => {
                self.metrics.record(MetricEvent::BuildSucceeded {
                    duration: result.metrics.duration,
                });
                info!(
                    "Built archive {} in {:?} ({} bytes)",
                    key.short(),
                    result.metrics.duration,
                    result.metrics.archive_bytes
                );
            }
            Err(e) => {
                self.metrics.record(MetricEvent::BuildFailed(e.kind()));
                warn!("Build {} failed: {}", key.short(), e);
            }
        }
        outcome
    }

    async fn build_verified(
        &self,
        key: &CacheKey,
        request: ArchiveRequest,
        content_hashes: Vec<String>,
        started: Instant,
    ) -> DocpackResult<ArchiveResult> {
        let staging_path = (request.total_declared_size() > self.settings.streaming_threshold_bytes)
            .then(|| self.cache.staging_path("zip"));
        let cancel = Arc::new(AtomicBool::new(false));

        let job = BuildJob {
            request,
            key: key.clone(),
            content_hashes,
            staging_path,
            base_threshold: self.settings.streaming_threshold_bytes,
            chunk_size: self.settings.chunk_size_bytes,
            monitor: Arc::clone(&self.monitor),
            retry: RetryCoordinator::with_sleeper(
                self.settings.retry_policy,
                Arc::clone(&self.sleeper),
            ),
            metrics: Arc::clone(&self.metrics),
            progress: self.progress.clone(),
            cancel: Arc::clone(&cancel),
        };

        let mut handle = tokio::task::spawn_blocking(move || job.run());
        let joined = match self.settings.build_timeout {
            Some(limit) => {
                let timed = tokio::time::timeout(limit, &mut handle).await;
                match timed {
                    Ok(joined) => joined,
                    Err(_) => {
                        // The job notices the flag between chunks and removes its staging file;
                        // one that already got past its last check is cleaned up on return
                        cancel.store(true, Ordering::Relaxed);
                        tokio::spawn(discard_abandoned(handle));
                        return Err(DocpackError::Timeout(limit));
                    }
                }
            }
            None => handle.await,
        };
        let built = joined
            .map_err(|e| DocpackError::Internal(format!("build thread failed: {}", e)))??;

        self.store_built(key, built, started).await
    }

    async fn store_built(
        &self,
        key: &CacheKey,
        built: BuiltArchive,
        started: Instant,
    ) -> DocpackResult<ArchiveResult> {
        let BuiltArchive {
            sealed,
            summary,
            integrity_hash,
            warnings,
        } = built;

        let (source, inline) = match sealed {
            SealedArchive::Memory(bytes) => {
                let bytes: Arc<[u8]> = bytes.into();
                (StoreSource::Bytes(Arc::clone(&bytes)), Some(bytes))
            }
            SealedArchive::Disk { path, .. } => (StoreSource::File(path), None),
        };

        let record = self.cache.store(key, source).await?;
        if record.integrity_hash != integrity_hash {
            if let Err(e) = self.cache.remove(key).await {
                warn!("Failed to remove mismatched archive {}: {}", key.short(), e);
            }
            return Err(DocpackError::Verification {
                reason: format!(
                    "stored archive hash {} differs from built hash {}",
                    record.integrity_hash, integrity_hash
                ),
            });
        }

        self.evict_after_store(key).await;

        let data = self.result_data(&record, inline).await?;
        Ok(ArchiveResult {
            key: key.clone(),
            data,
            integrity_hash,
            metrics: BuildMetrics {
                entries_written: summary.entries.len(),
                bytes_written: summary.bytes_written,
                archive_bytes: record.size_bytes,
                buffered_entries: summary.buffered_entries,
                chunked_entries: summary.chunked_entries,
                duration: started.elapsed(),
                cache_hit: false,
                coalesced: false,
            },
            warnings,
        })
    }

    async fn hit_result(&self, record: CacheRecord, started: Instant) -> DocpackResult<ArchiveResult> {
        let data = self.result_data(&record, None).await?;
        Ok(ArchiveResult {
            key: record.key.clone(),
            data,
            integrity_hash: record.integrity_hash.clone(),
            metrics: BuildMetrics {
                archive_bytes: record.size_bytes,
                duration: started.elapsed(),
                cache_hit: true,
                ..BuildMetrics::default()
            },
            warnings: Vec::new(),
        })
    }

    async fn result_data(
        &self,
        record: &CacheRecord,
        inline: Option<Arc<[u8]>>,
    ) -> DocpackResult<ArchiveData> {
        if record.size_bytes > self.settings.inline_result_max_bytes {
            return Ok(ArchiveData::File(record.archive_path.clone()));
        }
        if let Some(bytes) = inline {
            return Ok(ArchiveData::Bytes(bytes));
        }
        let bytes = fs::read(&record.archive_path).await.map_err(|e| {
            DocpackError::io(format!("reading {}", record.archive_path.display()), e)
        })?;
        Ok(ArchiveData::Bytes(bytes.into()))
    }

    /// Apply the age and size limits, sparing the record just stored
    async fn evict_after_store(&self, keep: &CacheKey) {
        if self.settings.cache_ttl.is_none() && self.settings.cache_max_total_bytes.is_none() {
            return;
        }

        let candidates = match self
            .cache
            .eviction_candidates(self.settings.cache_ttl, self.settings.cache_max_total_bytes)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Skipping cache eviction: {}", e);
                return;
            }
        };

        for record in candidates.iter().filter(|r| &r.key != keep) {
            match self.cache.remove(&record.key).await {
                Ok(_) => debug!("Evicted {}", record.key.short()),
                Err(e) => warn!("Failed to evict {}: {}", record.key.short(), e),
            }
        }
    }
}
