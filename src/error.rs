//! Error types for docpack
//!
//! All modules use `DocpackResult<T>` as their return type. Errors are `Clone`
//! so a single build failure can be handed to every coalesced caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for docpack operations
pub type DocpackResult<T> = Result<T, DocpackError>;

/// Failure taxonomy used for metrics and for telling callers whether to resubmit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Temporary I/O failure, retried up to the attempt limit
    Transient,
    /// An entry or the aggregate exceeded configured limits
    SizeViolation,
    /// Cached or freshly built archive failed verification
    IntegrityFailure,
    /// Build exceeded its wall-clock budget
    Timeout,
    /// Invalid request or configuration
    Configuration,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transient => "transient",
            Self::SizeViolation => "size_violation",
            Self::IntegrityFailure => "integrity_failure",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
        };
        write!(f, "{}", name)
    }
}

/// All errors that can occur in docpack
#[derive(Error, Debug, Clone)]
pub enum DocpackError {
    // Request construction errors
    #[error("Duplicate entry name in request: {0}")]
    DuplicateEntry(String),

    #[error("Invalid compression level {0}, expected 0-9")]
    InvalidCompressionLevel(u32),

    #[error("Invalid entry name {name:?}: {reason}")]
    InvalidEntryName { name: String, reason: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    // Size limits
    #[error("Entry {name} exceeds size limit: {actual} bytes > {limit} bytes")]
    EntrySizeExceeded { name: String, limit: u64, actual: u64 },

    #[error("Archive exceeds total size limit: {actual} bytes > {limit} bytes")]
    TotalSizeExceeded { limit: u64, actual: u64 },

    // Integrity errors
    #[error("Archive failed verification: {reason}")]
    Verification { reason: String },

    #[error("Cache record {key} failed integrity check: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    // Build lifecycle
    #[error("Build timed out after {0:?}")]
    Timeout(Duration),

    #[error("Build cancelled")]
    Cancelled,

    #[error("Operation failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<DocpackError>,
    },

    // Archive container errors
    #[error("Archive container error: {0}")]
    Archive(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(String),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl DocpackError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Convert a zip error, keeping IO failures classifiable
    pub fn zip(context: impl Into<String>, err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(source) => Self::io(context, source),
            other => Self::Archive(format!("{}: {}", context.into(), other)),
        }
    }

    /// Failure category of this error
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::DuplicateEntry(_)
            | Self::InvalidCompressionLevel(_)
            | Self::InvalidEntryName { .. }
            | Self::ConfigInvalid { .. }
            | Self::ConfigDirCreate { .. }
            | Self::PathNotFound(_)
            | Self::User(_) => FailureKind::Configuration,
            Self::EntrySizeExceeded { .. } | Self::TotalSizeExceeded { .. } => {
                FailureKind::SizeViolation
            }
            Self::Verification { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Archive(_)
            | Self::Json(_)
            | Self::TomlSerialize(_)
            | Self::Internal(_) => FailureKind::IntegrityFailure,
            Self::Timeout(_) | Self::Cancelled => FailureKind::Timeout,
            Self::RetriesExhausted { source, .. } => source.kind(),
            Self::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound
                | std::io::ErrorKind::PermissionDenied
                | std::io::ErrorKind::InvalidInput => FailureKind::Configuration,
                _ => FailureKind::Transient,
            },
        }
    }

    /// Check if this error is a temporary I/O condition worth retrying in place
    pub fn is_transient_io(&self) -> bool {
        match self {
            Self::Io { source, .. } => is_transient_io(source),
            _ => false,
        }
    }

    /// Check if resubmitting the same request is advisable
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), FailureKind::Transient | FailureKind::Timeout)
    }

    /// Check if this error is a size-limit violation for a single entry
    pub fn is_entry_size_violation(&self) -> bool {
        match self {
            Self::EntrySizeExceeded { .. } => true,
            Self::RetriesExhausted { source, .. } => source.is_entry_size_violation(),
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::InvalidCompressionLevel(_) => Some("Use --level with a value between 0 and 9"),
            Self::DuplicateEntry(_) => {
                Some("Rename one of the inputs, or keep directory structure instead of --flatten")
            }
            Self::EntrySizeExceeded { .. } => {
                Some("Raise archive.max_entry_bytes, or pass --skip-oversized")
            }
            Self::TotalSizeExceeded { .. } => Some("Raise archive.max_total_bytes"),
            Self::Timeout(_) => Some("Raise archive.build_timeout_secs or retry later"),
            Self::ChecksumMismatch { .. } => Some("Run: docpack cache clear"),
            _ => None,
        }
    }
}

/// Temporary I/O conditions: interrupted calls, would-block, timeouts, busy resources
pub fn is_transient_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    ) {
        return true;
    }

    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EAGAIN || code == libc::EBUSY || code == libc::EINTR
    )
}

impl From<serde_json::Error> for DocpackError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<toml::ser::Error> for DocpackError {
    fn from(err: toml::ser::Error) -> Self {
        Self::TomlSerialize(err.to_string())
    }
}
