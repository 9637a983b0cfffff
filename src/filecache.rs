//! Content-addressed cache for downloaded artifact files.
//!
//! Two variants share one trait: [`FullFileCache`] keeps a real copy of
//! every cached file under the cache directory and restores by copy;
//! [`HashOnlyFileCache`] keeps no file content at all and exists purely to
//! validate digests the downloader already wrote straight to the run's
//! files directory, skipping a redundant copy for large files.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

pub trait FileCache: Send + Sync {
    /// True if a file matching `digest` is already cached.
    fn contains(&self, digest: &str) -> bool;

    /// Copy the cached file for `digest` to `dest`, creating parent
    /// directories as needed. Returns `Ok(false)` if nothing is cached for
    /// that digest (not an error — the caller falls back to downloading).
    fn restore_to(&self, digest: &str, dest: &Path) -> Result<bool, CacheError>;

    /// Record that `source` (already downloaded, e.g. to the run's files
    /// directory) has the given digest, inserting it into the cache. Also
    /// verifies the digest against the file's actual contents.
    fn add_file_and_check_digest(&self, source: &Path, digest: &str) -> Result<(), CacheError>;
}

pub fn sha256_hex_digest(path: &Path) -> Result<String, CacheError> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn cache_path_for(root: &Path, digest: &str) -> PathBuf {
    // Two-level fan-out to avoid one enormous flat directory.
    let (prefix, rest) = digest.split_at(digest.len().min(2));
    root.join(prefix).join(rest)
}

/// Keeps a real copy of every cached file on disk.
pub struct FullFileCache {
    root: PathBuf,
}

impl FullFileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FullFileCache { root: root.into() }
    }
}

impl FileCache for FullFileCache {
    fn contains(&self, digest: &str) -> bool {
        cache_path_for(&self.root, digest).is_file()
    }

    fn restore_to(&self, digest: &str, dest: &Path) -> Result<bool, CacheError> {
        let cached = cache_path_for(&self.root, digest);
        if !cached.is_file() {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&cached, dest)?;
        Ok(true)
    }

    fn add_file_and_check_digest(&self, source: &Path, digest: &str) -> Result<(), CacheError> {
        let actual = sha256_hex_digest(source)?;
        if actual != digest {
            return Err(CacheError::DigestMismatch {
                expected: digest.to_owned(),
                actual,
            });
        }
        let cached = cache_path_for(&self.root, digest);
        if let Some(parent) = cached.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, &cached)?;
        Ok(())
    }
}

/// Validates digests without retaining file content. `restore_to` never has
/// a cached copy to hand back; instead it checks whatever is already sitting
/// at `dest` and reports a hit if that file's own digest already matches.
pub struct HashOnlyFileCache {
    known_digests: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl HashOnlyFileCache {
    pub fn new() -> Self {
        HashOnlyFileCache {
            known_digests: std::sync::Mutex::new(std::collections::HashSet::new()),
        }
    }
}

impl Default for HashOnlyFileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FileCache for HashOnlyFileCache {
    fn contains(&self, digest: &str) -> bool {
        self.known_digests.lock().unwrap().contains(digest)
    }

    fn restore_to(&self, digest: &str, dest: &Path) -> Result<bool, CacheError> {
        if !dest.is_file() {
            return Ok(false);
        }
        Ok(sha256_hex_digest(dest)? == digest)
    }

    fn add_file_and_check_digest(&self, source: &Path, digest: &str) -> Result<(), CacheError> {
        let actual = sha256_hex_digest(source)?;
        if actual != digest {
            return Err(CacheError::DigestMismatch {
                expected: digest.to_owned(),
                actual,
            });
        }
        self.known_digests.lock().unwrap().insert(digest.to_owned());
        Ok(())
    }
}
