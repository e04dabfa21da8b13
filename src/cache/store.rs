//! On-disk archive store
//!
//! Layout:
//!
//! ```text
//! <dir>/<key>.zip     archive
//! <dir>/<key>.json    sidecar (key, integrity hash, created_at, size)
//! <dir>/.staging/     in-progress builds and sidecar temp files
//! ```
//!
//! An archive is visible only once its sidecar exists. Sidecars are written to
//! staging and renamed into place, so readers see either no record or a whole
//! one.

use crate::cache::key::{sha256_file, CacheKey};
use crate::cache::record::{CacheRecord, EvictionReport, RecordSidecar};
use crate::error::{DocpackError, DocpackResult};
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";

/// Staging leftovers older than this are swept when the cache is opened
const STALE_STAGING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// What to store under a key
#[derive(Debug, Clone)]
pub enum StoreSource {
    /// Finished archive bytes held in memory
    Bytes(Arc<[u8]>),
    /// Finished archive in a staging file; moved, not copied
    File(PathBuf),
}

/// Content-addressed archive cache rooted at one directory
#[derive(Debug, Clone)]
pub struct ContentCache {
    dir: PathBuf,
}

impl ContentCache {
    /// Open (creating if needed) a cache at `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> DocpackResult<Self> {
        let cache = Self { dir: dir.into() };
        fs::create_dir_all(cache.staging_dir()).await.map_err(|e| {
            DocpackError::io(format!("creating cache dir {}", cache.dir.display()), e)
        })?;
        cache.sweep_staging(STALE_STAGING_AGE).await;
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.join(STAGING_DIR)
    }

    /// Fresh, unique path inside the staging directory
    pub fn staging_path(&self, extension: &str) -> PathBuf {
        self.staging_dir()
            .join(format!("{}.{}", Uuid::new_v4(), extension))
    }

    pub fn archive_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.zip", key))
    }

    fn sidecar_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Find a verified record for `key`
    ///
    /// The archive is re-hashed on every lookup. A record that fails the check
    /// is logged, removed and reported as a miss.
    pub async fn lookup(&self, key: &CacheKey) -> DocpackResult<Option<CacheRecord>> {
        let sidecar_path = self.sidecar_path(key);
        let content = match fs::read_to_string(&sidecar_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DocpackError::io(
                    format!("reading {}", sidecar_path.display()),
                    e,
                ))
            }
        };

        let sidecar: RecordSidecar = match serde_json::from_str(&content) {
            Ok(sidecar) => sidecar,
            Err(e) => {
                self.discard_corrupt(key, &format!("unreadable sidecar: {}", e))
                    .await;
                return Ok(None);
            }
        };
        if &sidecar.key != key {
            self.discard_corrupt(key, "sidecar names a different key").await;
            return Ok(None);
        }

        let record = CacheRecord::from_sidecar(key.clone(), sidecar, self.archive_path(key));
        match hash_archive(&record.archive_path).await {
            Ok((hash, size)) if hash == record.integrity_hash && size == record.size_bytes => {
                debug!("Cache hit for {}", key.short());
                Ok(Some(record))
            }
            Ok((hash, _)) => {
                let err = DocpackError::ChecksumMismatch {
                    key: key.to_string(),
                    expected: record.integrity_hash.clone(),
                    actual: hash,
                };
                self.discard_corrupt(key, &err.to_string()).await;
                Ok(None)
            }
            Err(e) => {
                self.discard_corrupt(key, &format!("archive unreadable: {}", e))
                    .await;
                Ok(None)
            }
        }
    }

    /// Store an archive under `key`, replacing any previous record
    pub async fn store(&self, key: &CacheKey, source: StoreSource) -> DocpackResult<CacheRecord> {
        let staged = match source {
            StoreSource::File(path) => path,
            StoreSource::Bytes(bytes) => {
                let path = self.staging_path("zip");
                fs::write(&path, &bytes[..])
                    .await
                    .map_err(|e| DocpackError::io(format!("writing {}", path.display()), e))?;
                path
            }
        };

        let (integrity_hash, size_bytes) = match hash_archive(&staged).await {
            Ok(result) => result,
            Err(e) => {
                remove_quietly(&staged).await;
                return Err(e);
            }
        };

        let archive_path = self.archive_path(key);
        if let Err(e) = move_file(&staged, &archive_path).await {
            remove_quietly(&staged).await;
            return Err(e);
        }

        let record = CacheRecord {
            key: key.clone(),
            archive_path,
            integrity_hash,
            created_at: Utc::now(),
            size_bytes,
        };
        self.publish_sidecar(&record).await?;

        info!(
            "Cached archive {} ({} bytes)",
            key.short(),
            record.size_bytes
        );
        Ok(record)
    }

    /// Remove the record for `key`; returns whether one existed
    pub async fn remove(&self, key: &CacheKey) -> DocpackResult<bool> {
        // Unpublish first so a concurrent lookup sees a miss, not a torn record
        let had_sidecar = remove_if_exists(&self.sidecar_path(key)).await?;
        let had_archive = remove_if_exists(&self.archive_path(key)).await?;
        Ok(had_sidecar || had_archive)
    }

    /// All published records, oldest first
    ///
    /// Records are listed from their sidecars without re-hashing. A sidecar
    /// that cannot be parsed or names a different key is discarded together
    /// with its archive.
    pub async fn list(&self) -> DocpackResult<Vec<CacheRecord>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| DocpackError::io("reading cache directory", e))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DocpackError::io("reading cache entry", e))?
        {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(CacheKey::parse)
            else {
                continue;
            };

            match self.read_sidecar(&path).await {
                Ok(sidecar) if sidecar.key == key => {
                    let archive_path = self.archive_path(&key);
                    records.push(CacheRecord::from_sidecar(key, sidecar, archive_path));
                }
                Ok(_) => self.discard_corrupt(&key, "sidecar names a different key").await,
                // Removed between read_dir and the read
                Err(DocpackError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    self.discard_corrupt(&key, &format!("unreadable sidecar: {}", e))
                        .await
                }
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        Ok(records)
    }

    /// Total bytes of all published archives
    pub async fn total_size(&self) -> DocpackResult<u64> {
        Ok(self.list().await?.iter().map(|r| r.size_bytes).sum())
    }

    /// Records that an eviction with these limits would remove, oldest first
    pub async fn eviction_candidates(
        &self,
        max_age: Option<Duration>,
        max_total_bytes: Option<u64>,
    ) -> DocpackResult<Vec<CacheRecord>> {
        let records = self.list().await?;
        let (expired, kept): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| max_age.is_some_and(|age| r.is_older_than(age)));

        let mut candidates = expired;
        if let Some(limit) = max_total_bytes {
            let mut total: u64 = kept.iter().map(|r| r.size_bytes).sum();
            for record in kept {
                if total <= limit {
                    break;
                }
                total -= record.size_bytes;
                candidates.push(record);
            }
        }
        Ok(candidates)
    }

    /// Remove records older than `max_age`
    pub async fn evict_older_than(&self, max_age: Duration) -> DocpackResult<EvictionReport> {
        let candidates = self.eviction_candidates(Some(max_age), None).await?;
        self.remove_records(&candidates).await
    }

    /// Remove oldest records until the cache fits in `max_total_bytes`
    pub async fn evict_to_size(&self, max_total_bytes: u64) -> DocpackResult<EvictionReport> {
        let candidates = self.eviction_candidates(None, Some(max_total_bytes)).await?;
        self.remove_records(&candidates).await
    }

    /// Remove every record; in-progress staging files are left alone
    pub async fn clear(&self) -> DocpackResult<EvictionReport> {
        let records = self.list().await?;
        self.remove_records(&records).await
    }

    /// Remove the given records, reporting those that were still present
    pub async fn remove_records(&self, records: &[CacheRecord]) -> DocpackResult<EvictionReport> {
        let mut report = EvictionReport::default();
        for record in records {
            if self.remove(&record.key).await? {
                debug!("Evicted {}", record.key.short());
                report.push(record);
            }
        }
        if !report.is_empty() {
            info!(
                "Removed {} cached archive(s), {} bytes",
                report.count(),
                report.bytes_freed
            );
        }
        Ok(report)
    }

    async fn read_sidecar(&self, path: &Path) -> DocpackResult<RecordSidecar> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| DocpackError::io(format!("reading {}", path.display()), e))?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn publish_sidecar(&self, record: &CacheRecord) -> DocpackResult<()> {
        let content = serde_json::to_string_pretty(&record.sidecar())?;
        let temp = self.staging_path("json");
        fs::write(&temp, content)
            .await
            .map_err(|e| DocpackError::io(format!("writing {}", temp.display()), e))?;

        let target = self.sidecar_path(&record.key);
        if let Err(e) = fs::rename(&temp, &target).await {
            remove_quietly(&temp).await;
            return Err(DocpackError::io(
                format!("publishing {}", target.display()),
                e,
            ));
        }
        Ok(())
    }

    async fn discard_corrupt(&self, key: &CacheKey, reason: &str) {
        warn!("Discarding cached archive {}: {}", key.short(), reason);
        if let Err(e) = self.remove(key).await {
            warn!("Failed to remove corrupt record {}: {}", key.short(), e);
        }
    }

    /// Delete staging files left behind by crashed builds
    async fn sweep_staging(&self, max_age: Duration) {
        let Ok(mut entries) = fs::read_dir(self.staging_dir()).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let stale = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > max_age);
            if stale {
                debug!("Removing stale staging file {}", entry.path().display());
                remove_quietly(&entry.path()).await;
            }
        }
    }
}

/// SHA-256 and length of an archive file
async fn hash_archive(path: &Path) -> DocpackResult<(String, u64)> {
    let owned = path.to_path_buf();
    let hash = tokio::task::spawn_blocking(move || sha256_file(&owned))
        .await
        .map_err(|e| DocpackError::Internal(format!("hashing task failed: {}", e)))?
        .map_err(|e| DocpackError::io(format!("hashing {}", path.display()), e))?;
    let size = fs::metadata(path)
        .await
        .map_err(|e| DocpackError::io(format!("reading metadata of {}", path.display()), e))?
        .len();
    Ok((hash, size))
}

/// Rename, falling back to copy when source and target are on different filesystems
async fn move_file(from: &Path, to: &Path) -> DocpackResult<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .await
        .map_err(|e| DocpackError::io(format!("copying archive to {}", to.display()), e))?;
    remove_quietly(from).await;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> DocpackResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(DocpackError::io(format!("removing {}", path.display()), e)),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
