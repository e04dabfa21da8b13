//! ZIP archive assembly
//!
//! [`ArchiveRequest`] describes what goes in, [`StreamingArchiveWriter`]
//! writes it, and [`ArchiveSink`] decides whether the bytes live in memory or
//! in a staging file.

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{normalize_entry_name, ArchiveConfig, ArchiveEntry, ArchiveRequest, ContentSource};
pub use sink::{ArchiveSink, SealedArchive};
pub use writer::{
    choose_strategy, EntryWriteOutcome, StreamingArchiveWriter, WriteStrategy, WriterOptions,
    WriterSummary,
};
