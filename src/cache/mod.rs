//! Content-addressed archive cache
//!
//! Finished archives are stored on the local filesystem under a key derived
//! from the request's entries and options. Same entries and options means the
//! same key, so a repeated request is answered without rebuilding.
//!
//! # Integrity Model
//!
//! - Every record carries the SHA-256 of its archive bytes
//! - Every lookup re-hashes the archive before returning it
//! - A record that fails the check is removed and treated as a miss
//! - Records are published by their sidecar, written last via rename
//!
//! # Record States
//!
//! | State | Files | Visible to lookup |
//! |-------|-------|-------------------|
//! | Staging | `.staging/<uuid>.zip` | no |
//! | Moved | `<key>.zip` | no |
//! | Published | `<key>.zip` + `<key>.json` | yes |

pub mod key;
pub mod record;
pub mod store;

pub use key::{content_hashes, request_key, CacheKey};
pub use record::{format_bytes, CacheRecord, CacheSizeStatus, EvictionReport};
pub use store::{ContentCache, StoreSource};
