//! Per-section recognizer cache.
//!
//! Each entry remembers the storage path it was loaded from; the service
//! compares that against the section's current pointer and reloads when
//! they diverge.

use rollcall_core::Recognizer;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone)]
pub struct ModelCacheEntry {
    pub recognizer: Arc<dyn Recognizer>,
    /// Remote object path this recognizer was loaded from.
    pub storage_path: String,
    /// Local directory holding the extracted artifact pair.
    pub local_dir: PathBuf,
}

#[derive(Default)]
pub struct RecognizerCache {
    entries: Mutex<HashMap<String, ModelCacheEntry>>,
}

impl RecognizerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, section_id: &str) -> Option<ModelCacheEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(section_id)
            .cloned()
    }

    pub fn insert(&self, section_id: &str, entry: ModelCacheEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(section_id.to_string(), entry);
    }

    pub fn remove(&self, section_id: &str) -> Option<ModelCacheEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(section_id)
    }
}
