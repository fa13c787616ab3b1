//! Content-addressed on-disk cache for downloaded scripts and plugins.
//!
//! Layout: `<cache_root>/<sha256>/<filename>`. A single cache-wide lock
//! serializes directory creation against the TTL purge sweep.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;

/// Errors raised by [`ModuleCache`] operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache root (or an entry's intermediate directory) could not be
    /// created.
    #[error("could not create cache directory: {0}")]
    NoSuchDirectory(std::io::Error),
    /// A filesystem operation on a cache entry failed.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The download succeeded but the content's sha256 did not match the
    /// expected digest.
    #[error("checksum mismatch for {uri}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The URI the content was fetched from.
        uri: String,
        /// The digest the caller expected.
        expected: String,
        /// The digest actually computed over the downloaded bytes.
        actual: String,
    },
    /// Every candidate URI failed to fetch.
    #[error("failed to download {filename} from any of {attempted} URIs")]
    AllUrisFailed {
        /// The filename being fetched.
        filename: String,
        /// How many URIs were attempted.
        attempted: usize,
    },
    /// The underlying HTTP client reported an error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A single candidate location plus the expected digest and destination
/// filename for a cached download.
#[derive(Debug, Clone)]
pub struct UriSpec {
    /// Candidate URIs to try, in order, until one succeeds.
    pub uris: Vec<String>,
    /// Expected sha256 digest (hex) of the downloaded content.
    pub sha256: String,
    /// Filename the content is stored under within its cache entry.
    pub filename: String,
}

/// Content-addressed cache rooted at a single directory, guarded by one
/// cache-wide lock for the create-vs-purge race.
pub struct ModuleCache {
    root: PathBuf,
    http_client: reqwest::Client,
    lock: Mutex<()>,
}

impl ModuleCache {
    /// Build a [`ModuleCache`] rooted at `root`, using `http_client` for
    /// downloads.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, http_client: reqwest::Client) -> Self {
        Self { root: root.into(), http_client, lock: Mutex::new(()) }
    }

    fn entry_dir(&self, sha256: &str) -> PathBuf { self.root.join(sha256) }

    /// Idempotently create (or touch) the cache directory for `sha256`,
    /// bumping its mtime to now so it acts as an LRU proxy.
    ///
    /// # Errors
    /// Returns [`CacheError::NoSuchDirectory`] if the directory cannot be
    /// created.
    pub async fn create_cache_dir(&self, sha256: &str) -> Result<PathBuf, CacheError> {
        let dir = self.entry_dir(sha256);
        tokio::fs::create_dir_all(&dir).await.map_err(CacheError::NoSuchDirectory)?;
        touch(&dir).await?;
        Ok(dir)
    }

    /// Return the path to `uri_spec`'s file, downloading it first if it is
    /// not already cached.
    ///
    /// # Errors
    /// Returns [`CacheError::AllUrisFailed`] if every candidate URI fails,
    /// or [`CacheError::ChecksumMismatch`] if the downloaded content's
    /// digest does not match.
    pub async fn get_cached_file(&self, uri_spec: &UriSpec) -> Result<PathBuf, CacheError> {
        let dir = self.create_cache_dir(&uri_spec.sha256).await?;
        let destination = dir.join(&uri_spec.filename);
        if destination.is_file() {
            return Ok(destination);
        }
        self.download_to(&destination, uri_spec).await?;
        Ok(destination)
    }

    /// Unconditionally (re-)download `uri_spec` to `destination`, used by
    /// the `file` module whose job is the download itself.
    ///
    /// # Errors
    /// Returns [`CacheError::AllUrisFailed`] or [`CacheError::ChecksumMismatch`].
    pub async fn download_file_from_master(&self, destination: &Path, uri_spec: &UriSpec) -> Result<(), CacheError> {
        self.download_to(destination, uri_spec).await
    }

    async fn download_to(&self, destination: &Path, uri_spec: &UriSpec) -> Result<(), CacheError> {
        for uri in &uri_spec.uris {
            match self.try_fetch(uri).await {
                Ok(bytes) => {
                    let actual = hex_sha256(&bytes);
                    if actual != uri_spec.sha256.to_lowercase() {
                        return Err(CacheError::ChecksumMismatch {
                            uri: uri.clone(),
                            expected: uri_spec.sha256.clone(),
                            actual,
                        });
                    }
                    write_atomic(destination, &bytes).await?;
                    return Ok(());
                }
                Err(_source) => continue,
            }
        }
        Err(CacheError::AllUrisFailed { filename: uri_spec.filename.clone(), attempted: uri_spec.uris.len() })
    }

    async fn try_fetch(&self, uri: &str) -> Result<bytes::Bytes, CacheError> {
        let response = self.http_client.get(uri).send().await?.error_for_status()?;
        Ok(response.bytes().await?)
    }

    /// Walk top-level cache entries and delete any whose mtime predates
    /// `now - ttl` and whose name is not in `ongoing_transactions`.
    /// Returns how many entries were removed. Deletion errors on individual
    /// entries are logged but do not abort the sweep.
    ///
    /// # Errors
    /// Returns [`CacheError::Io`] if the cache root itself cannot be read.
    pub async fn purge_cache(&self, ttl: Duration, ongoing_transactions: &[String]) -> Result<usize, CacheError> {
        let _guard = self.lock.lock().await;
        let cutoff = SystemTime::now().checked_sub(ttl).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if ongoing_transactions.iter().any(|t| t == &name) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else { continue };
            let Ok(modified) = metadata.modified() else { continue };
            if modified >= cutoff {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(error) => tracing::warn!(entry = %name, %error, "failed to purge cache entry"),
            }
        }
        Ok(removed)
    }
}

async fn touch(dir: &Path) -> Result<(), CacheError> {
    let now = SystemTime::now();
    let file_times = std::fs::FileTimes::new().set_modified(now).set_accessed(now);
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&dir)?;
        file.set_times(file_times)
    })
    .await
    .map_err(|e| CacheError::Io(std::io::Error::other(e)))??;
    Ok(())
}

async fn write_atomic(destination: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp = destination.with_extension("tmp-download");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    tokio::fs::rename(&tmp, destination).await?;
    Ok(())
}

fn hex_sha256(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn create_cache_dir_is_idempotent() {
        let root = tempdir().unwrap();
        let cache = ModuleCache::new(root.path(), reqwest::Client::new());
        let first = cache.create_cache_dir("abc").await.unwrap();
        let second = cache.create_cache_dir("abc").await.unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
    }

    #[tokio::test]
    async fn purge_cache_skips_ongoing_and_fresh_entries() {
        let root = tempdir().unwrap();
        let cache = ModuleCache::new(root.path(), reqwest::Client::new());
        cache.create_cache_dir("old").await.unwrap();
        cache.create_cache_dir("active").await.unwrap();

        let old_dir = root.path().join("old");
        let stale = SystemTime::now() - Duration::from_secs(3600 * 2);
        let file_times = std::fs::FileTimes::new().set_modified(stale);
        std::fs::File::open(&old_dir).unwrap().set_times(file_times).unwrap();

        let removed = cache.purge_cache(Duration::from_secs(3600), &["active".to_owned()]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!old_dir.exists());
        assert!(root.path().join("active").exists());
    }

    #[test]
    fn hex_sha256_matches_known_digest() {
        let digest = hex_sha256(b"abc");
        assert_eq!(digest, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }
}
