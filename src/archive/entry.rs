//! Archive requests and their entries
//!
//! A request is validated once, at construction: names are normalized and
//! must be unique, and the compression level must be in range. Nothing about
//! the request is re-validated during the build.

use crate::error::{DocpackError, DocpackResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where an entry's bytes come from
#[derive(Debug, Clone)]
pub enum ContentSource {
    /// Content already rendered in memory
    Bytes(Arc<[u8]>),
    /// Content in a file on local disk
    Path(PathBuf),
}

impl ContentSource {
    /// Open a fresh reader positioned at the start of the content
    pub fn open(&self) -> DocpackResult<Box<dyn Read + Send>> {
        match self {
            Self::Bytes(bytes) => Ok(Box::new(Cursor::new(Arc::clone(bytes)))),
            Self::Path(path) => {
                let file = File::open(path)
                    .map_err(|e| DocpackError::io(format!("opening {}", path.display()), e))?;
                Ok(Box::new(file))
            }
        }
    }

    /// Short description for log lines
    pub fn describe(&self) -> String {
        match self {
            Self::Bytes(bytes) => format!("{} in-memory bytes", bytes.len()),
            Self::Path(path) => path.display().to_string(),
        }
    }
}

/// One named artifact to place in the archive
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Entry name inside the archive (normalized once part of a request)
    pub name: String,
    /// Content location
    pub source: ContentSource,
    /// Size reported by the producer; used to pick buffering vs streaming
    pub declared_size: u64,
}

impl ArchiveEntry {
    pub fn new(name: impl Into<String>, source: ContentSource, declared_size: u64) -> Self {
        Self {
            name: name.into(),
            source,
            declared_size,
        }
    }

    /// Entry from an in-memory buffer, declared at its exact length
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        let declared_size = bytes.len() as u64;
        Self::new(name, ContentSource::Bytes(bytes), declared_size)
    }

    /// Entry from a file, declared at its current on-disk length
    pub fn from_path(name: impl Into<String>, path: impl AsRef<Path>) -> DocpackResult<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DocpackError::PathNotFound(path.to_path_buf())
            } else {
                DocpackError::io(format!("reading metadata of {}", path.display()), e)
            }
        })?;

        if !metadata.is_file() {
            return Err(DocpackError::InvalidEntryName {
                name: path.display().to_string(),
                reason: "not a regular file".to_string(),
            });
        }

        Ok(Self::new(
            name,
            ContentSource::Path(path.to_path_buf()),
            metadata.len(),
        ))
    }
}

/// Per-request archive options; all of them feed the cache key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// 0 stores entries uncompressed, 1-9 deflate at that level
    pub compression_level: u32,
    pub max_entry_bytes: u64,
    pub max_total_bytes: u64,
    pub preserve_directory_structure: bool,
    /// Drop entries over `max_entry_bytes` with a warning instead of failing
    pub skip_oversized_entries: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
            max_entry_bytes: 64 * 1024 * 1024,
            max_total_bytes: 512 * 1024 * 1024,
            preserve_directory_structure: true,
            skip_oversized_entries: false,
        }
    }
}

impl ArchiveConfig {
    /// Reject out-of-range settings
    pub fn validate(&self) -> DocpackResult<()> {
        if self.compression_level > 9 {
            return Err(DocpackError::InvalidCompressionLevel(self.compression_level));
        }
        Ok(())
    }
}

/// An ordered, validated set of entries plus their archive options
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    entries: Vec<ArchiveEntry>,
    config: ArchiveConfig,
}

impl ArchiveRequest {
    /// Validate and normalize a request
    ///
    /// Fails on an invalid compression level, on empty or escaping names, and
    /// on names that collide after normalization.
    pub fn new(entries: Vec<ArchiveEntry>, config: ArchiveConfig) -> DocpackResult<Self> {
        config.validate()?;

        let mut seen = HashSet::with_capacity(entries.len());
        let mut normalized = Vec::with_capacity(entries.len());

        for mut entry in entries {
            entry.name = normalize_entry_name(&entry.name, config.preserve_directory_structure)?;
            if !seen.insert(entry.name.clone()) {
                return Err(DocpackError::DuplicateEntry(entry.name));
            }
            normalized.push(entry);
        }

        Ok(Self {
            entries: normalized,
            config,
        })
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of declared entry sizes
    pub fn total_declared_size(&self) -> u64 {
        self.entries
            .iter()
            .fold(0u64, |acc, e| acc.saturating_add(e.declared_size))
    }

    /// Entry names in archive order
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }
}

/// Normalize an entry name to a relative, forward-slash archive path
///
/// Backslashes become separators, empty and `.` components are dropped, and
/// `..` is rejected. Without directory preservation only the last component
/// is kept.
pub fn normalize_entry_name(raw: &str, preserve_directories: bool) -> DocpackResult<String> {
    let unified = raw.replace('\\', "/");
    let parts: Vec<&str> = unified
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();

    if parts.iter().any(|part| *part == "..") {
        return Err(DocpackError::InvalidEntryName {
            name: raw.to_string(),
            reason: "parent directory components are not allowed".to_string(),
        });
    }

    let name = if preserve_directories {
        parts.join("/")
    } else {
        parts.last().map(|s| s.to_string()).unwrap_or_default()
    };

    if name.is_empty() {
        return Err(DocpackError::InvalidEntryName {
            name: raw.to_string(),
            reason: "name is empty".to_string(),
        });
    }

    Ok(name)
}
