//! Relational-persistence collaborator.
//!
//! Course/section/enrollment bookkeeping lives outside this engine; the
//! orchestration layer only needs the section-model pointer, the active
//! roster, and a way to ask for a dataset-archive rebuild.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("section not found: {0}")]
    SectionNotFound(String),
    #[error("persistence backend: {0}")]
    Backend(String),
}

pub trait SectionStore: Send + Sync {
    /// Remote storage path of the section's current model artifact.
    fn model_storage_path(&self, section_id: &str) -> Result<Option<String>, PersistenceError>;

    fn set_model_storage_path(
        &self,
        section_id: &str,
        path: Option<&str>,
    ) -> Result<(), PersistenceError>;

    /// Ids of actively enrolled students for the section.
    fn active_students(&self, section_id: &str) -> Result<Vec<String>, PersistenceError>;

    /// Ask the owning system to rebuild `<section>/faces.zip` in the
    /// dataset bucket from the current enrollment photos.
    fn refresh_dataset_archive(&self, section_id: &str) -> Result<(), PersistenceError>;
}

#[derive(Default, Clone)]
struct SectionRecord {
    storage_path: Option<String>,
    students: Vec<String>,
}

/// In-memory section store for tests and local development.
#[derive(Default)]
pub struct MemorySectionStore {
    sections: Mutex<HashMap<String, SectionRecord>>,
}

impl MemorySectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_section(&self, section_id: &str, students: &[&str]) {
        let mut sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        sections.insert(
            section_id.to_string(),
            SectionRecord {
                storage_path: None,
                students: students.iter().map(|s| s.to_string()).collect(),
            },
        );
    }
}

impl SectionStore for MemorySectionStore {
    fn model_storage_path(&self, section_id: &str) -> Result<Option<String>, PersistenceError> {
        let sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        sections
            .get(section_id)
            .map(|r| r.storage_path.clone())
            .ok_or_else(|| PersistenceError::SectionNotFound(section_id.to_string()))
    }

    fn set_model_storage_path(
        &self,
        section_id: &str,
        path: Option<&str>,
    ) -> Result<(), PersistenceError> {
        let mut sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        let record = sections
            .get_mut(section_id)
            .ok_or_else(|| PersistenceError::SectionNotFound(section_id.to_string()))?;
        record.storage_path = path.map(str::to_string);
        Ok(())
    }

    fn active_students(&self, section_id: &str) -> Result<Vec<String>, PersistenceError> {
        let sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        sections
            .get(section_id)
            .map(|r| r.students.clone())
            .ok_or_else(|| PersistenceError::SectionNotFound(section_id.to_string()))
    }

    fn refresh_dataset_archive(&self, _section_id: &str) -> Result<(), PersistenceError> {
        // The test backend has nothing to rebuild; the archive is whatever
        // the test uploaded.
        Ok(())
    }
}
