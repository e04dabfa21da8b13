//! Streaming ZIP writer
//!
//! Entries at or below the streaming threshold are read whole and written in
//! one call; larger entries are copied in fixed-size chunks so they never sit
//! in memory. A failure inside an entry aborts just that entry: it never
//! reaches the central directory and the entry can be written again.

use crate::archive::entry::{ArchiveConfig, ArchiveEntry};
use crate::cache::key::sha256_bytes;
use crate::error::{DocpackError, DocpackResult};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// How an entry's bytes travel into the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategy {
    /// Read fully into memory, written in one call
    Buffered,
    /// Copied in fixed-size chunks
    Chunked,
}

/// Pick a strategy for an entry of `declared_size` bytes
pub fn choose_strategy(declared_size: u64, threshold: u64) -> WriteStrategy {
    if declared_size <= threshold {
        WriteStrategy::Buffered
    } else {
        WriteStrategy::Chunked
    }
}

/// Limits and encoding options for one archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    pub compression_level: u32,
    pub max_entry_bytes: u64,
    pub max_total_bytes: u64,
    pub chunk_size: usize,
}

impl WriterOptions {
    pub fn from_config(config: &ArchiveConfig, chunk_size: usize) -> Self {
        Self {
            compression_level: config.compression_level,
            max_entry_bytes: config.max_entry_bytes,
            max_total_bytes: config.max_total_bytes,
            chunk_size: chunk_size.max(1),
        }
    }
}

/// Result of one successfully written entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryWriteOutcome {
    pub name: String,
    pub strategy: WriteStrategy,
    /// Uncompressed bytes copied into the archive
    pub bytes_written: u64,
    /// SHA-256 of the bytes actually copied
    pub content_hash: String,
}

/// What the writer produced, returned by [`StreamingArchiveWriter::finish`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterSummary {
    /// Entry names in the order they were committed
    pub entries: Vec<String>,
    pub bytes_written: u64,
    pub buffered_entries: usize,
    pub chunked_entries: usize,
}

pub struct StreamingArchiveWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    options: WriterOptions,
    cancel: Option<Arc<AtomicBool>>,
    summary: WriterSummary,
    entry_open: bool,
    poisoned: bool,
}

impl<W: Write + Seek> StreamingArchiveWriter<W> {
    pub fn new(sink: W, options: WriterOptions) -> DocpackResult<Self> {
        if options.compression_level > 9 {
            return Err(DocpackError::InvalidCompressionLevel(options.compression_level));
        }

        Ok(Self {
            zip: ZipWriter::new(sink),
            options,
            cancel: None,
            summary: WriterSummary::default(),
            entry_open: false,
            poisoned: false,
        })
    }

    /// Abort between chunks once `flag` is set
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn buffered_entries(&self) -> usize {
        self.summary.buffered_entries
    }

    pub fn chunked_entries(&self) -> usize {
        self.summary.chunked_entries
    }

    pub fn bytes_written(&self) -> u64 {
        self.summary.bytes_written
    }

    /// Write one entry, choosing buffered or chunked by `threshold`
    ///
    /// On error the entry is rolled back and the writer stays usable, so the
    /// same entry may be written again.
    pub fn write_entry(
        &mut self,
        entry: &ArchiveEntry,
        threshold: u64,
    ) -> DocpackResult<EntryWriteOutcome> {
        if self.poisoned {
            return Err(DocpackError::Archive(
                "writer is unusable after a failed rollback".to_string(),
            ));
        }
        self.check_cancelled()?;

        if entry.declared_size > self.options.max_entry_bytes {
            return Err(DocpackError::EntrySizeExceeded {
                name: entry.name.clone(),
                limit: self.options.max_entry_bytes,
                actual: entry.declared_size,
            });
        }

        let strategy = choose_strategy(entry.declared_size, threshold);
        let result = entry.source.open().and_then(|reader| match strategy {
            WriteStrategy::Buffered => self.write_buffered(&entry.name, entry.declared_size, reader),
            WriteStrategy::Chunked => self.write_chunked(&entry.name, reader),
        });

        match result {
            Ok((bytes_written, content_hash)) => {
                self.entry_open = false;
                self.summary.bytes_written += bytes_written;
                self.summary.entries.push(entry.name.clone());
                match strategy {
                    WriteStrategy::Buffered => self.summary.buffered_entries += 1,
                    WriteStrategy::Chunked => self.summary.chunked_entries += 1,
                }
                debug!(
                    "Wrote {} ({:?}, {} bytes)",
                    entry.name, strategy, bytes_written
                );
                Ok(EntryWriteOutcome {
                    name: entry.name.clone(),
                    strategy,
                    bytes_written,
                    content_hash,
                })
            }
            Err(e) => {
                self.rollback_entry(&entry.name);
                Err(e)
            }
        }
    }

    /// Finalize the central directory and hand back the sink
    pub fn finish(self) -> DocpackResult<(W, WriterSummary)> {
        if self.poisoned {
            return Err(DocpackError::Archive(
                "cannot finish an archive after a failed rollback".to_string(),
            ));
        }
        self.check_cancelled()?;

        let sink = self
            .zip
            .finish()
            .map_err(|e| DocpackError::zip("finalizing archive", e))?;
        Ok((sink, self.summary))
    }

    fn write_buffered(
        &mut self,
        name: &str,
        declared_size: u64,
        reader: Box<dyn Read + Send>,
    ) -> DocpackResult<(u64, String)> {
        let limit = self.options.max_entry_bytes;
        let capacity = declared_size.min(limit.saturating_add(1)) as usize;
        let mut buffer = Vec::with_capacity(capacity);
        reader
            .take(limit.saturating_add(1))
            .read_to_end(&mut buffer)
            .map_err(|e| DocpackError::io(format!("reading entry {}", name), e))?;

        let size = buffer.len() as u64;
        self.check_limits(name, size)?;

        self.start_entry(name)?;
        self.zip
            .write_all(&buffer)
            .map_err(|e| DocpackError::io(format!("writing entry {}", name), e))?;
        Ok((size, sha256_bytes(&buffer)))
    }

    fn write_chunked(
        &mut self,
        name: &str,
        mut reader: Box<dyn Read + Send>,
    ) -> DocpackResult<(u64, String)> {
        self.start_entry(name)?;

        let mut hasher = Sha256::new();
        let mut chunk = vec![0u8; self.options.chunk_size];
        let mut written = 0u64;
        loop {
            self.check_cancelled()?;

            let n = reader
                .read(&mut chunk)
                .map_err(|e| DocpackError::io(format!("reading entry {}", name), e))?;
            if n == 0 {
                break;
            }

            written += n as u64;
            self.check_limits(name, written)?;

            self.zip
                .write_all(&chunk[..n])
                .map_err(|e| DocpackError::io(format!("writing entry {}", name), e))?;
            hasher.update(&chunk[..n]);
        }
        Ok((written, hex::encode(hasher.finalize())))
    }

    fn start_entry(&mut self, name: &str) -> DocpackResult<()> {
        let options = self.file_options();
        match self.zip.start_file(name, options) {
            Ok(()) => {
                self.entry_open = true;
                Ok(())
            }
            Err(e) => {
                // Unknown whether the header made it into the file table
                self.poisoned = true;
                Err(DocpackError::zip(format!("starting entry {}", name), e))
            }
        }
    }

    fn rollback_entry(&mut self, name: &str) {
        if !self.entry_open {
            return;
        }
        self.entry_open = false;
        if let Err(e) = self.zip.abort_file() {
            warn!("Failed to roll back entry {}: {}", name, e);
            self.poisoned = true;
        }
    }

    fn check_limits(&self, name: &str, entry_bytes: u64) -> DocpackResult<()> {
        if entry_bytes > self.options.max_entry_bytes {
            return Err(DocpackError::EntrySizeExceeded {
                name: name.to_string(),
                limit: self.options.max_entry_bytes,
                actual: entry_bytes,
            });
        }

        let total = self.summary.bytes_written.saturating_add(entry_bytes);
        if total > self.options.max_total_bytes {
            return Err(DocpackError::TotalSizeExceeded {
                limit: self.options.max_total_bytes,
                actual: total,
            });
        }
        Ok(())
    }

    fn check_cancelled(&self) -> DocpackResult<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(DocpackError::Cancelled),
            _ => Ok(()),
        }
    }

    fn file_options(&self) -> SimpleFileOptions {
        // Fixed timestamp and mode keep rebuilds byte-identical
        let base = SimpleFileOptions::default()
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(0o644)
            .large_file(self.options.max_entry_bytes >= u64::from(u32::MAX));

        match self.options.compression_level {
            0 => base.compression_method(CompressionMethod::Stored),
            level => base
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(level))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::entry::ContentSource;
    use std::io::Cursor;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn options(level: u32) -> WriterOptions {
        WriterOptions {
            compression_level: level,
            max_entry_bytes: 1024 * 1024,
            max_total_bytes: 4 * 1024 * 1024,
            chunk_size: 4096,
        }
    }

    fn writer(level: u32) -> StreamingArchiveWriter<Cursor<Vec<u8>>> {
        StreamingArchiveWriter::new(Cursor::new(Vec::new()), options(level)).unwrap()
    }

    fn read_back(sink: Cursor<Vec<u8>>) -> Vec<(String, Vec<u8>)> {
        // Drop bytes past the end of the central directory, as sealing does
        let end = sink.position() as usize;
        let mut bytes = sink.into_inner();
        bytes.truncate(end);

        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut content = Vec::new();
                file.read_to_end(&mut content).unwrap();
                (file.name().to_string(), content)
            })
            .collect()
    }

    #[test]
    fn strategy_is_pure_threshold_comparison() {
        assert_eq!(choose_strategy(0, 0), WriteStrategy::Buffered);
        assert_eq!(choose_strategy(1024, 1024), WriteStrategy::Buffered);
        assert_eq!(choose_strategy(1025, 1024), WriteStrategy::Chunked);
    }

    #[test]
    fn writes_buffered_and_chunked_entries() {
        let mut w = writer(6);
        let small = ArchiveEntry::from_bytes("small.txt", vec![b'a'; 100]);
        let large = ArchiveEntry::from_bytes("docs/large.bin", vec![b'b'; 20_000]);

        let first = w.write_entry(&small, 1000).unwrap();
        let second = w.write_entry(&large, 1000).unwrap();
        assert_eq!(first.strategy, WriteStrategy::Buffered);
        assert_eq!(second.strategy, WriteStrategy::Chunked);
        assert_eq!(second.bytes_written, 20_000);
        assert_eq!(first.content_hash, sha256_bytes(&[b'a'; 100]));
        assert_eq!(second.content_hash, sha256_bytes(&[b'b'; 20_000]));

        let (sink, summary) = w.finish().unwrap();
        assert_eq!(summary.buffered_entries, 1);
        assert_eq!(summary.chunked_entries, 1);
        assert_eq!(summary.bytes_written, 20_100);

        let files = read_back(sink);
        assert_eq!(files[0].0, "small.txt");
        assert_eq!(files[1].0, "docs/large.bin");
        assert_eq!(files[1].1, vec![b'b'; 20_000]);
    }

    #[test]
    fn level_zero_stores() {
        let mut w = writer(0);
        w.write_entry(&ArchiveEntry::from_bytes("a.txt", vec![0u8; 500]), 1000)
            .unwrap();
        let (sink, _) = w.finish().unwrap();

        let mut archive = ZipArchive::new(Cursor::new(sink.into_inner())).unwrap();
        let file = archive.by_index(0).unwrap();
        assert_eq!(file.compression(), CompressionMethod::Stored);
    }

    #[test]
    fn identical_input_identical_bytes() {
        let build = || {
            let mut w = writer(6);
            w.write_entry(&ArchiveEntry::from_bytes("x.pdf", vec![3u8; 3000]), 1000)
                .unwrap();
            w.finish().unwrap().0.into_inner()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn declared_oversize_rejected_before_reading() {
        let mut w = writer(6);
        let entry = ArchiveEntry::new(
            "huge.bin",
            ContentSource::Path("/nonexistent/never-opened".into()),
            10 * 1024 * 1024,
        );
        let err = w.write_entry(&entry, 1000).unwrap_err();
        assert!(matches!(err, DocpackError::EntrySizeExceeded { .. }));
    }

    #[test]
    fn understated_size_caught_while_streaming() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grown.bin");
        std::fs::write(&path, vec![1u8; 2 * 1024 * 1024]).unwrap();

        let mut w = writer(6);
        let liar = ArchiveEntry::new("grown.bin", ContentSource::Path(path), 5000);
        let err = w.write_entry(&liar, 1000).unwrap_err();
        assert!(matches!(err, DocpackError::EntrySizeExceeded { .. }));

        // The aborted entry leaves no trace
        w.write_entry(&ArchiveEntry::from_bytes("ok.txt", b"fine".to_vec()), 1000)
            .unwrap();
        let (sink, summary) = w.finish().unwrap();
        assert_eq!(summary.entries, vec!["ok.txt"]);
        let files = read_back(sink);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].1, b"fine");
    }

    #[test]
    fn understated_size_caught_while_buffering() {
        let mut w = writer(6);
        let liar = ArchiveEntry::new(
            "grown.bin",
            ContentSource::Bytes(vec![1u8; 1024 * 1024 + 10].into()),
            10,
        );
        let err = w.write_entry(&liar, 1000).unwrap_err();
        assert!(matches!(
            err,
            DocpackError::EntrySizeExceeded { actual, .. } if actual == 1024 * 1024 + 1
        ));
        assert_eq!(w.buffered_entries(), 0);
    }

    #[test]
    fn total_limit_enforced() {
        let mut w = StreamingArchiveWriter::new(
            Cursor::new(Vec::new()),
            WriterOptions {
                max_total_bytes: 1500,
                ..options(6)
            },
        )
        .unwrap();

        w.write_entry(&ArchiveEntry::from_bytes("a", vec![0u8; 1000]), 4096)
            .unwrap();
        let err = w
            .write_entry(&ArchiveEntry::from_bytes("b", vec![0u8; 1000]), 4096)
            .unwrap_err();
        assert!(matches!(
            err,
            DocpackError::TotalSizeExceeded { limit: 1500, actual: 2000 }
        ));
        assert_eq!(w.bytes_written(), 1000);
    }

    #[test]
    fn cancellation_stops_writes() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut w = writer(6).with_cancel_flag(flag.clone());
        w.write_entry(&ArchiveEntry::from_bytes("a", vec![0u8; 10]), 100)
            .unwrap();

        flag.store(true, Ordering::Relaxed);
        let err = w
            .write_entry(&ArchiveEntry::from_bytes("b", vec![0u8; 10]), 100)
            .unwrap_err();
        assert!(matches!(err, DocpackError::Cancelled));
        assert!(matches!(w.finish(), Err(DocpackError::Cancelled)));
    }

    struct NoSleep;

    impl crate::retry::Sleeper for NoSleep {
        fn sleep(&self, _: std::time::Duration) {}
    }

    /// Refuses the first large write with `WouldBlock`
    struct FlakySink {
        inner: Cursor<Vec<u8>>,
        armed: bool,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.armed && buf.len() >= 1000 {
                self.armed = false;
                return Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "busy"));
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.inner.flush()
        }
    }

    impl Seek for FlakySink {
        fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn transient_failure_rolls_back_and_retries() {
        use crate::retry::{classify_error, RetryCoordinator, RetryPolicy};

        let sink = FlakySink {
            inner: Cursor::new(Vec::new()),
            armed: true,
        };
        let mut w = StreamingArchiveWriter::new(sink, options(0)).unwrap();
        w.write_entry(&ArchiveEntry::from_bytes("first.txt", b"one".to_vec()), 4096)
            .unwrap();

        let retry = RetryCoordinator::with_sleeper(RetryPolicy::default(), Arc::new(NoSleep));
        let entry = ArchiveEntry::from_bytes("second.bin", vec![5u8; 2000]);
        let mut attempts = Vec::new();
        let outcome = retry
            .run(
                |attempt| {
                    attempts.push(attempt);
                    w.write_entry(&entry, 4096)
                },
                classify_error,
            )
            .unwrap();

        assert_eq!(attempts, vec![0, 1]);
        assert_eq!(outcome.bytes_written, 2000);

        let (sink, summary) = w.finish().unwrap();
        assert_eq!(summary.entries, vec!["first.txt", "second.bin"]);
        let files = read_back(sink.inner);
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].1, vec![5u8; 2000]);
    }

    #[test]
    fn invalid_level_rejected() {
        let result = StreamingArchiveWriter::new(Cursor::new(Vec::new()), options(10));
        assert!(matches!(
            result,
            Err(DocpackError::InvalidCompressionLevel(10))
        ));
    }
}
