//! Archive output targets
//!
//! Small archives are assembled in memory, large ones in a staging file next
//! to the cache so the final store is a rename.

use crate::cache::key::sha256_reader;
use crate::error::{DocpackError, DocpackResult};
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

/// Where the writer puts archive bytes
#[derive(Debug)]
pub enum ArchiveSink {
    Memory(Cursor<Vec<u8>>),
    Disk { file: File, path: PathBuf },
}

impl ArchiveSink {
    pub fn memory() -> Self {
        Self::Memory(Cursor::new(Vec::new()))
    }

    /// Create a fresh staging file; fails if `path` already exists
    pub fn disk(path: impl Into<PathBuf>) -> DocpackResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| DocpackError::io(format!("creating {}", path.display()), e))?;
        Ok(Self::Disk { file, path })
    }

    /// Staging path, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Memory(_) => None,
            Self::Disk { path, .. } => Some(path),
        }
    }

    /// Cut the output at the current position and flush it
    ///
    /// Rolled-back entries can leave bytes past the end of the central
    /// directory; the finished archive ends exactly where the writer stopped.
    pub fn seal(mut self) -> DocpackResult<SealedArchive> {
        let end = self
            .stream_position()
            .map_err(|e| DocpackError::io("locating end of archive", e))?;

        match self {
            Self::Memory(cursor) => {
                let mut bytes = cursor.into_inner();
                bytes.truncate(end as usize);
                Ok(SealedArchive::Memory(bytes))
            }
            Self::Disk { file, path } => {
                file.set_len(end)
                    .and_then(|_| file.sync_all())
                    .map_err(|e| DocpackError::io(format!("sealing {}", path.display()), e))?;
                Ok(SealedArchive::Disk { path, len: end })
            }
        }
    }
}

impl Write for ArchiveSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Memory(cursor) => cursor.write(buf),
            Self::Disk { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Memory(cursor) => cursor.flush(),
            Self::Disk { file, .. } => file.flush(),
        }
    }
}

impl Seek for ArchiveSink {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Memory(cursor) => cursor.seek(pos),
            Self::Disk { file, .. } => file.seek(pos),
        }
    }
}

/// A finished archive, not yet stored
#[derive(Debug)]
pub enum SealedArchive {
    Memory(Vec<u8>),
    Disk { path: PathBuf, len: u64 },
}

impl SealedArchive {
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory(bytes) => bytes.len() as u64,
            Self::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check the archive parses and lists exactly `expected` names in order;
    /// returns its SHA-256
    pub fn verify(&self, expected: &[String]) -> DocpackResult<String> {
        if self.is_empty() {
            return Err(DocpackError::Verification {
                reason: "archive is empty".to_string(),
            });
        }

        match self {
            Self::Memory(bytes) => verify_reader(Cursor::new(bytes.as_slice()), expected),
            Self::Disk { path, .. } => {
                let file = File::open(path)
                    .map_err(|e| DocpackError::io(format!("opening {}", path.display()), e))?;
                verify_reader(file, expected)
            }
        }
    }
}

fn verify_reader<R: Read + Seek>(mut reader: R, expected: &[String]) -> DocpackResult<String> {
    {
        let mut archive = ZipArchive::new(&mut reader).map_err(|e| DocpackError::Verification {
            reason: format!("archive does not parse: {}", e),
        })?;

        if archive.len() != expected.len() {
            return Err(DocpackError::Verification {
                reason: format!(
                    "expected {} entries, found {}",
                    expected.len(),
                    archive.len()
                ),
            });
        }

        for (index, name) in expected.iter().enumerate() {
            let file = archive
                .by_index_raw(index)
                .map_err(|e| DocpackError::Verification {
                    reason: format!("entry {} unreadable: {}", index, e),
                })?;
            if file.name() != name {
                return Err(DocpackError::Verification {
                    reason: format!(
                        "entry {} is {:?}, expected {:?}",
                        index,
                        file.name(),
                        name
                    ),
                });
            }
        }
    }

    reader
        .seek(SeekFrom::Start(0))
        .map_err(|e| DocpackError::io("rewinding archive", e))?;
    sha256_reader(reader).map_err(|e| DocpackError::io("hashing archive", e))
}

/// Delete a staging file left by a failed or abandoned build
pub(crate) fn remove_staging(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove staging file {}: {}", path.display(), e);
        }
    }
}
