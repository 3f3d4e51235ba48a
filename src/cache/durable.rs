//! Durable Tier - on-disk cache layer
//!
//! One metadata record (`<hex>.json`) and one body record (`<hex>`) per key
//! in a flat directory. The directory may be shared by every worker on a
//! host; there is no cross-process lock, concurrent writers to the same key
//! race with last-write-wins semantics.
//!
//! The body is written before its metadata so a reader never sees metadata
//! that points at a body which was never started.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::Utc;

use super::entry::{CacheEntry, EntryMetadata};
use super::key::CacheKey;
use crate::error::{Error, Result};

/// Suffix of metadata records
pub const META_SUFFIX: &str = ".json";

/// Outcome of a durable-tier read
#[derive(Debug)]
pub enum DurableLookup {
    /// No metadata record for the key
    Missing,
    /// A valid, unexpired entry
    Fresh(CacheEntry),
    /// The record exists but `expires_at` has passed
    Expired,
    /// Metadata exists but is unreadable, or its body is gone
    Corrupt(String),
}

/// Flat-directory durable cache tier
#[derive(Debug, Clone)]
pub struct DurableTier {
    dir: PathBuf,
}

impl DurableTier {
    /// Open (and create if needed) the cache directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the body record for a key
    pub fn body_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.to_hex())
    }

    /// Path of the metadata record for a key
    pub fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}{}", key.to_hex(), META_SUFFIX))
    }

    /// Read the record for a key and classify it
    pub async fn read(&self, key: &CacheKey) -> Result<DurableLookup> {
        let raw = match tokio::fs::read(self.meta_path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DurableLookup::Missing),
            Err(e) => return Err(e.into()),
        };

        let metadata: EntryMetadata = match serde_json::from_slice(&raw) {
            Ok(m) => m,
            Err(e) => return Ok(DurableLookup::Corrupt(e.to_string())),
        };

        if metadata.is_expired_at(Utc::now()) {
            return Ok(DurableLookup::Expired);
        }

        let body = match tokio::fs::read(self.body_path(key)).await {
            Ok(body) => Bytes::from(body),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(DurableLookup::Corrupt("body record missing".into()))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(DurableLookup::Fresh(CacheEntry::from_parts(
            *key, metadata, body,
        )))
    }

    /// Write an entry (body first, then metadata)
    pub async fn write(&self, entry: &CacheEntry) -> Result<()> {
        let meta = serde_json::to_vec_pretty(&entry.metadata())?;
        tokio::fs::write(self.body_path(&entry.key), &entry.body).await?;
        tokio::fs::write(self.meta_path(&entry.key), meta).await?;
        Ok(())
    }

    /// Delete both records for a key, returning whether anything was removed
    pub async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let body = remove_if_exists(&self.body_path(key)).await?;
        let meta = remove_if_exists(&self.meta_path(key)).await?;
        Ok(body || meta)
    }

    /// Remove every record in the cache directory, returning the file count
    pub async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for name in self.list_files().await? {
            match remove_if_exists(&self.dir.join(&name)).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(file = %name, error = %e, "Failed to purge cache file"),
            }
        }
        Ok(removed)
    }

    /// Names of all regular files in the cache directory
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = item.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Read just the metadata record named `file_name`
    pub async fn read_metadata_file(&self, file_name: &str) -> Result<EntryMetadata> {
        let raw = tokio::fs::read(self.dir.join(file_name)).await?;
        serde_json::from_slice(&raw).map_err(|e| Error::CorruptCacheRecord {
            key: file_name.trim_end_matches(META_SUFFIX).to_string(),
            reason: e.to_string(),
        })
    }

    /// Remove the file named `file_name` if present
    pub async fn remove_file(&self, file_name: &str) -> Result<bool> {
        remove_if_exists(&self.dir.join(file_name)).await
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Tests
// =============================================================================
