//! docpack - content-addressed document archives
//!
//! Packs ordered sets of documents into ZIP archives, keyed by a SHA-256 over
//! the entries and options. Verified archives are kept in an on-disk cache,
//! concurrent identical requests share one build, and large entries are
//! streamed in chunks when the machine is under memory or CPU pressure.

pub mod archive;
pub mod builder;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod retry;
pub mod ui;

pub use archive::{ArchiveConfig, ArchiveEntry, ArchiveRequest, ContentSource};
pub use builder::{ArchiveBuilder, ArchiveData, ArchiveResult, BuildProgress, BuilderSettings};
pub use cache::{CacheKey, ContentCache};
pub use error::{DocpackError, DocpackResult, FailureKind};
