//! The blocking half of a build: write, seal and verify one archive

use crate::archive::sink::remove_staging;
use crate::archive::{
    ArchiveRequest, ArchiveSink, SealedArchive, StreamingArchiveWriter, WriterOptions,
    WriterSummary,
};
use crate::builder::{BuildProgress, ProgressCallback};
use crate::cache::CacheKey;
use crate::error::{DocpackError, DocpackResult};
use crate::metrics::{MetricEvent, MetricsCollector};
use crate::monitor::ResourceMonitor;
use crate::retry::{classify_error, RetryCoordinator};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Everything a build needs, owned so it can move to a blocking thread
pub(crate) struct BuildJob {
    pub request: ArchiveRequest,
    pub key: CacheKey,
    /// Entry content hashes the key was computed from, in request order
    pub content_hashes: Vec<String>,
    /// Staging file for the archive; `None` assembles in memory
    pub staging_path: Option<PathBuf>,
    pub base_threshold: u64,
    pub chunk_size: usize,
    pub monitor: Arc<ResourceMonitor>,
    pub retry: RetryCoordinator,
    pub metrics: Arc<MetricsCollector>,
    pub progress: Option<ProgressCallback>,
    pub cancel: Arc<AtomicBool>,
}

/// A sealed, self-verified archive ready to store
#[derive(Debug)]
pub(crate) struct BuiltArchive {
    pub sealed: SealedArchive,
    pub summary: WriterSummary,
    pub integrity_hash: String,
    pub warnings: Vec<String>,
}

impl BuiltArchive {
    /// Drop an archive nobody will store
    pub fn discard(self) {
        if let SealedArchive::Disk { path, .. } = &self.sealed {
            remove_staging(path);
        }
    }
}

/// Wait for a build whose caller gave up, removing whatever it staged
pub(crate) async fn discard_abandoned(handle: JoinHandle<DocpackResult<BuiltArchive>>) {
    if let Ok(Ok(built)) = handle.await {
        debug!("Discarding archive from abandoned build");
        built.discard();
    }
}

impl BuildJob {
    /// Run the build; on any failure the staging file is removed
    pub fn run(self) -> DocpackResult<BuiltArchive> {
        let staging = self.staging_path.clone();
        let sink = match &staging {
            Some(path) => ArchiveSink::disk(path.clone())?,
            None => ArchiveSink::memory(),
        };

        let result = self.assemble(sink);
        if let (Err(e), Some(path)) = (&result, &staging) {
            debug!("Build {} failed ({}), removing staging file", self.key.short(), e);
            remove_staging(path);
        }
        result
    }

    fn assemble(&self, sink: ArchiveSink) -> DocpackResult<BuiltArchive> {
        let config = self.request.config();
        let options = WriterOptions::from_config(config, self.chunk_size);
        let mut writer =
            StreamingArchiveWriter::new(sink, options)?.with_cancel_flag(Arc::clone(&self.cancel));

        let entries_total = self.request.len();
        let mut expected = Vec::with_capacity(entries_total);
        let mut warnings = Vec::new();

        for (index, entry) in self.request.entries().iter().enumerate() {
            let threshold = self.monitor.recommended_streaming_threshold(self.base_threshold);

            let written = self
                .retry
                .run_observed(
                    |_| writer.write_entry(entry, threshold),
                    classify_error,
                    |attempt, err, delay| {
                        self.metrics.record(MetricEvent::EntryRetried);
                        warn!(
                            "Writing {} failed (attempt {}): {}; retrying in {:?}",
                            entry.name,
                            attempt + 1,
                            err,
                            delay
                        );
                    },
                )
                .map_err(DocpackError::from);

            match written {
                Ok(outcome) if self.content_hashes.get(index) != Some(&outcome.content_hash) => {
                    return Err(DocpackError::Verification {
                        reason: format!("{} changed while the archive was being built", entry.name),
                    });
                }
                Ok(outcome) => expected.push(outcome.name),
                Err(e) if config.skip_oversized_entries && e.is_entry_size_violation() => {
                    self.metrics.record(MetricEvent::EntrySkipped);
                    warn!("Skipping {}: {}", entry.name, e);
                    warnings.push(format!("skipped {}: {}", entry.name, e));
                }
                Err(e) => return Err(e),
            }

            if let Some(progress) = &self.progress {
                progress(BuildProgress {
                    entries_done: index + 1,
                    entries_total,
                    bytes_done: writer.bytes_written(),
                });
            }
        }

        let (sink, summary) = writer.finish()?;
        let sealed = sink.seal()?;
        let integrity_hash = sealed.verify(&expected)?;

        // A build that finished after its deadline is abandoned
        if self.cancel.load(Ordering::Relaxed) {
            return Err(DocpackError::Cancelled);
        }

        debug!(
            "Built {} ({} entries, {} bytes, {} chunked)",
            self.key.short(),
            summary.entries.len(),
            sealed.len(),
            summary.chunked_entries
        );
        Ok(BuiltArchive {
            sealed,
            summary,
            integrity_hash,
            warnings,
        })
    }
}
