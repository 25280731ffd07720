//! rollcall-service — Model lifecycle for the classroom recognition engine.
//!
//! [`ModelManager`] owns the single process-wide recognizer behind one
//! dedicated worker thread. [`SectionModelService`] orchestrates
//! per-class-section models: dataset download from object storage, locked
//! retraining on a small worker pool, atomic artifact replacement and
//! cache invalidation.

pub mod archive;
pub mod cache;
pub mod config;
pub mod manager;
pub mod persistence;
pub mod service;
pub mod storage;
pub mod workers;

pub use cache::{ModelCacheEntry, RecognizerCache};
pub use config::{ConfigHandle, EngineConfig};
pub use manager::{ManagerError, ModelManager};
pub use persistence::{MemorySectionStore, PersistenceError, SectionStore};
pub use service::{RetrainTicket, SectionError, SectionModelService};
pub use storage::{MemoryStorage, ObjectHead, ObjectStorage, StorageError, StoredObject};
