//! Object-storage abstraction the orchestration layer depends on.
//!
//! The real deployment binds this to a cloud bucket client; the engine
//! only needs the five operations below. [`MemoryStorage`] backs tests
//! and local development.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {bucket}/{path}")]
    NotFound { bucket: String, path: String },
    #[error("object already exists: {bucket}/{path}")]
    AlreadyExists { bucket: String, path: String },
    #[error("storage backend: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result of a metadata probe.
#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub exists: bool,
    pub last_modified: Option<DateTime<Utc>>,
    /// False when the backend cannot answer metadata queries for this
    /// object (the caller then falls back to a fixed grace period).
    pub accessible: bool,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub path: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

pub trait ObjectStorage: Send + Sync {
    fn upload(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        bytes: &[u8],
        upsert: bool,
    ) -> Result<(), StorageError>;

    fn download_bytes(
        &self,
        bucket: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, StorageError>;

    fn head(&self, bucket: &str, path: &str) -> Result<ObjectHead, StorageError>;

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<StoredObject>, StorageError>;

    fn delete(&self, bucket: &str, paths: &[String]) -> Result<(), StorageError>;
}

#[derive(Clone)]
struct Blob {
    bytes: Vec<u8>,
    content_type: String,
    last_modified: DateTime<Utc>,
}

/// In-memory storage backend for tests and local development.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<(String, String), Blob>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared content type of a stored object, if present.
    pub fn content_type(&self, bucket: &str, path: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bucket.to_string(), path.to_string()))
            .map(|blob| blob.content_type.clone())
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(b, _)| b == bucket)
            .count()
    }
}

impl ObjectStorage for MemoryStorage {
    fn upload(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        bytes: &[u8],
        upsert: bool,
    ) -> Result<(), StorageError> {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (bucket.to_string(), path.to_string());
        if !upsert && objects.contains_key(&key) {
            return Err(StorageError::AlreadyExists {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }
        objects.insert(
            key,
            Blob {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    fn download_bytes(
        &self,
        bucket: &str,
        path: &str,
        _timeout: Duration,
    ) -> Result<Vec<u8>, StorageError> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects
            .get(&(bucket.to_string(), path.to_string()))
            .map(|blob| blob.bytes.clone())
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            })
    }

    fn head(&self, bucket: &str, path: &str) -> Result<ObjectHead, StorageError> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(match objects.get(&(bucket.to_string(), path.to_string())) {
            Some(blob) => ObjectHead {
                exists: true,
                last_modified: Some(blob.last_modified),
                accessible: true,
            },
            None => ObjectHead {
                exists: false,
                last_modified: None,
                accessible: true,
            },
        })
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<StoredObject>, StorageError> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<StoredObject> = objects
            .iter()
            .filter(|((b, p), _)| b == bucket && p.starts_with(prefix))
            .map(|((_, p), blob)| StoredObject {
                path: p.clone(),
                size: blob.bytes.len() as u64,
                last_modified: Some(blob.last_modified),
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn delete(&self, bucket: &str, paths: &[String]) -> Result<(), StorageError> {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        for path in paths {
            objects.remove(&(bucket.to_string(), path.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_download_roundtrip() {
        let storage = MemoryStorage::new();
        storage
            .upload("b", "a/x.bin", "application/octet-stream", b"hello", true)
            .unwrap();
        let bytes = storage
            .download_bytes("b", "a/x.bin", Duration::from_secs(1))
            .unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(
            storage.content_type("b", "a/x.bin").as_deref(),
            Some("application/octet-stream")
        );
    }

    #[test]
    fn test_upload_without_upsert_rejects_existing() {
        let storage = MemoryStorage::new();
        storage.upload("b", "x", "t", b"1", true).unwrap();
        let err = storage.upload("b", "x", "t", b"2", false).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[test]
    fn test_head_reports_existence_and_mtime() {
        let storage = MemoryStorage::new();
        let missing = storage.head("b", "nope").unwrap();
        assert!(!missing.exists && missing.accessible);

        storage.upload("b", "x", "t", b"1", true).unwrap();
        let head = storage.head("b", "x").unwrap();
        assert!(head.exists);
        assert!(head.last_modified.is_some());
    }

    #[test]
    fn test_list_and_delete_by_prefix() {
        let storage = MemoryStorage::new();
        storage.upload("b", "s1/current/a", "t", b"1", true).unwrap();
        storage.upload("b", "s1/current/b", "t", b"2", true).unwrap();
        storage.upload("b", "s2/current/a", "t", b"3", true).unwrap();

        let listed = storage.list("b", "s1/").unwrap();
        assert_eq!(listed.len(), 2);

        let paths: Vec<String> = listed.into_iter().map(|o| o.path).collect();
        storage.delete("b", &paths).unwrap();
        assert!(storage.list("b", "s1/").unwrap().is_empty());
        assert_eq!(storage.list("b", "s2/").unwrap().len(), 1);
    }
}
