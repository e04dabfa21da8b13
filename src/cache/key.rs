//! Content-addressed cache keys
//!
//! A key is the SHA-256 over the archive options and, for every entry in
//! order, its normalized name and the SHA-256 of its content. Same entries
//! and same options give the same key.

use crate::archive::{ArchiveConfig, ArchiveRequest, ContentSource};
use crate::error::{DocpackError, DocpackResult};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::debug;

/// Bumped whenever archive bytes for the same input could change
const KEY_FORMAT: &str = "docpack-archive-v1";

/// Hex SHA-256 identifying one archive
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CacheKey(String);

impl CacheKey {
    /// Accept a 64-character lowercase hex string
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == 64
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(value.to_string()))
    }

    /// Key for a request whose entry contents hash to `content_hashes`, in order
    pub fn for_request(request: &ArchiveRequest, content_hashes: &[String]) -> Self {
        Self::compute(
            request.config(),
            request
                .entries()
                .iter()
                .zip(content_hashes)
                .map(|(entry, hash)| (entry.name.as_str(), hash.as_str())),
        )
    }

    /// Key for the given options and `(name, content hash)` pairs
    pub fn compute<'a>(
        config: &ArchiveConfig,
        entries: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_FORMAT.as_bytes());
        hasher.update(config.compression_level.to_le_bytes());
        hasher.update(config.max_entry_bytes.to_le_bytes());
        hasher.update(config.max_total_bytes.to_le_bytes());
        hasher.update([
            u8::from(config.preserve_directory_structure),
            u8::from(config.skip_oversized_entries),
        ]);

        for (name, content_hash) in entries {
            // Length prefix keeps ("ab", "c") and ("a", "bc") apart
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(content_hash.as_bytes());
        }

        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for display
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

impl TryFrom<String> for CacheKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid cache key {:?}", value))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the key for a request, hashing entry contents concurrently
pub async fn request_key(request: &ArchiveRequest, parallelism: usize) -> DocpackResult<CacheKey> {
    let hashes = content_hashes(request, parallelism).await?;
    Ok(CacheKey::for_request(request, &hashes))
}

/// SHA-256 of every entry's content, in request order
///
/// At most `parallelism` entries are hashed at a time.
pub async fn content_hashes(
    request: &ArchiveRequest,
    parallelism: usize,
) -> DocpackResult<Vec<String>> {
    let sources: Vec<ContentSource> = request.entries().iter().map(|entry| entry.source.clone()).collect();
    let hashes: Vec<String> = stream::iter(sources.into_iter().map(|source| {
        async move {
            tokio::task::spawn_blocking(move || content_hash(&source))
                .await
                .unwrap_or_else(|e| Err(DocpackError::Internal(format!("hashing task failed: {}", e))))
        }
    }))
    .buffered(parallelism.max(1))
    .try_collect()
    .await?;

    debug!("Hashed {} entries", request.len());
    Ok(hashes)
}

/// SHA-256 of an entry's content
pub fn content_hash(source: &ContentSource) -> DocpackResult<String> {
    match source {
        ContentSource::Bytes(bytes) => Ok(sha256_bytes(bytes)),
        ContentSource::Path(path) => sha256_file(path)
            .map_err(|e| DocpackError::io(format!("hashing {}", path.display()), e)),
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash everything a reader yields
pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    sha256_reader(File::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveEntry;
    use tempfile::TempDir;

    fn request(entries: Vec<ArchiveEntry>) -> ArchiveRequest {
        ArchiveRequest::new(entries, ArchiveConfig::default()).unwrap()
    }

    #[test]
    fn sha256_known_value() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_reader(&b"abc"[..]).unwrap(), sha256_bytes(b"abc"));
    }

    #[test]
    fn parse_validates_shape() {
        let key = CacheKey::compute(&ArchiveConfig::default(), []);
        assert_eq!(CacheKey::parse(key.as_str()), Some(key.clone()));
        assert_eq!(key.short().len(), 12);
        assert!(CacheKey::parse("abc").is_none());
        assert!(CacheKey::parse(&key.as_str().to_uppercase()).is_none());
    }

    #[test]
    fn deserialize_rejects_malformed_keys() {
        let key = CacheKey::compute(&ArchiveConfig::default(), []);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key));
        assert_eq!(serde_json::from_str::<CacheKey>(&json).unwrap(), key);
        assert!(serde_json::from_str::<CacheKey>("\"abc\"").is_err());
    }

    #[test]
    fn name_boundaries_matter() {
        let config = ArchiveConfig::default();
        let a = CacheKey::compute(&config, [("ab", "x"), ("c", "y")]);
        let b = CacheKey::compute(&config, [("a", "x"), ("bc", "y")]);
        assert_ne!(a, b);
    }

    #[test]
    fn config_changes_key() {
        let base = ArchiveConfig::default();
        let level = ArchiveConfig {
            compression_level: 1,
            ..ArchiveConfig::default()
        };
        let skipping = ArchiveConfig {
            skip_oversized_entries: true,
            ..ArchiveConfig::default()
        };
        let key = |config: &ArchiveConfig| CacheKey::compute(config, [("a", "h")]);
        assert_ne!(key(&base), key(&level));
        assert_ne!(key(&base), key(&skipping));
    }

    #[tokio::test]
    async fn same_content_same_key_regardless_of_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"quarterly report").unwrap();

        let from_bytes = request(vec![ArchiveEntry::from_bytes(
            "report.pdf",
            b"quarterly report".to_vec(),
        )]);
        let from_path = request(vec![ArchiveEntry::from_path("report.pdf", &path).unwrap()]);

        assert_eq!(
            request_key(&from_bytes, 4).await.unwrap(),
            request_key(&from_path, 1).await.unwrap()
        );
    }

    #[tokio::test]
    async fn order_and_content_change_key() {
        let ab = request(vec![
            ArchiveEntry::from_bytes("a", b"1".to_vec()),
            ArchiveEntry::from_bytes("b", b"2".to_vec()),
        ]);
        let ba = request(vec![
            ArchiveEntry::from_bytes("b", b"2".to_vec()),
            ArchiveEntry::from_bytes("a", b"1".to_vec()),
        ]);
        let changed = request(vec![
            ArchiveEntry::from_bytes("a", b"1".to_vec()),
            ArchiveEntry::from_bytes("b", b"3".to_vec()),
        ]);

        let key_ab = request_key(&ab, 2).await.unwrap();
        assert_ne!(key_ab, request_key(&ba, 2).await.unwrap());
        assert_ne!(key_ab, request_key(&changed, 2).await.unwrap());
        assert_eq!(key_ab, request_key(&ab, 1).await.unwrap());
    }

    #[tokio::test]
    async fn missing_file_fails_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.pdf");
        std::fs::write(&path, b"x").unwrap();
        let req = request(vec![ArchiveEntry::from_path("gone.pdf", &path).unwrap()]);
        std::fs::remove_file(&path).unwrap();

        let err = request_key(&req, 4).await.unwrap_err();
        assert!(matches!(err, DocpackError::Io { .. }));
    }
}
