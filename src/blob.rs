//! Filesystem blob store for captured images.
//!
//! Blobs live under four logical buckets so the retention sweep can target
//! non-baseline files safely. Keys are `{site_id}_{timestamp}` based.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid blob key: {0}")]
    InvalidKey(String),
}

/// Logical storage buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Current,
    Thumbnails,
    Baselines,
    Diffs,
}

impl Bucket {
    pub fn dir(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Thumbnails => "thumbnails",
            Self::Baselines => "baselines",
            Self::Diffs => "diffs",
        }
    }
}

/// Blob store rooted at a single directory.
#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open the store, creating the bucket directories if missing.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, BlobError> {
        let root = root.as_ref().to_path_buf();
        for bucket in [Bucket::Current, Bucket::Thumbnails, Bucket::Baselines, Bucket::Diffs] {
            fs::create_dir_all(root.join(bucket.dir()))?;
        }
        Ok(Self { root })
    }

    /// Build a `{site_id}_{timestamp}` key for a bucket.
    pub fn key_for(bucket: Bucket, site_id: i64, at: DateTime<Utc>) -> String {
        format!("{}/{}_{}.png", bucket.dir(), site_id, at.timestamp_millis())
    }

    /// Write a blob under the given key, returning its byte size.
    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<usize, BlobError> {
        let path = self.resolve(key)?;
        fs::write(path, bytes)?;
        Ok(bytes.len())
    }

    /// Read a blob by key.
    pub fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.resolve(key)?;
        Ok(fs::read(path)?)
    }

    /// Delete a blob; missing files are not an error (idempotent sweep).
    pub fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.resolve(key)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The thumbnail key paired with a `current/` snapshot key.
    pub fn thumbnail_key(snapshot_key: &str) -> String {
        snapshot_key.replacen(Bucket::Current.dir(), Bucket::Thumbnails.dir(), 1)
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, BlobError> {
        // Keys are internally generated; reject anything path-like anyway.
        if key.contains("..") || key.starts_with('/') {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}
