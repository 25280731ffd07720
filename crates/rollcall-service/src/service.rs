//! Per-class-section model orchestration.
//!
//! Each section owns an independent LBPH model artifact in object storage
//! (`{section}/current/lbph.zip` in the models bucket) plus a pointer to
//! it in the section store. Retraining downloads the section's dataset
//! archive, trains into a staging directory, swaps the local artifact
//! atomically and republishes the remote one. A per-section lock keeps
//! concurrent retrains of the same section single-flight while leaving
//! other sections untouched.

use crate::archive::{
    count_images_per_student, extract_entry, extract_zip, locate_dataset_root, zip_dir,
    ArchiveError,
};
use crate::cache::{ModelCacheEntry, RecognizerCache};
use crate::config::ConfigHandle;
use crate::persistence::{PersistenceError, SectionStore};
use crate::storage::{ObjectStorage, StorageError};
use crate::workers::{KeyedLocks, TaskPool};
use chrono::Utc;
use image::DynamicImage;
use rollcall_core::{
    LbphRecognizer, Prediction, Recognizer, TrainingError, LABELS_FILE, MODEL_FILE,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::thread;
use thiserror::Error;
use tokio::sync::oneshot;

const RETRAIN_WORKERS: usize = 2;
const RETRAIN_QUEUE_DEPTH: usize = 16;
const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Artifact files that may be served to callers.
const SERVABLE_ARTIFACTS: [&str; 2] = [MODEL_FILE, LABELS_FILE];

#[derive(Debug, Error)]
pub enum SectionError {
    #[error("object storage is not configured")]
    StorageDisabled,
    #[error("section {0} has no active enrollments")]
    NoActiveEnrollments(String),
    #[error(
        "section dataset has too few images ({total}); students without images: {empty_students:?}"
    )]
    InsufficientData {
        total: usize,
        empty_students: Vec<String>,
    },
    #[error("artifact {0} is not servable")]
    ArtifactNotAllowed(String),
    #[error("artifact {0} missing from the model archive")]
    ArtifactMissing(String),
    #[error("section {0} has no trained model")]
    NoModel(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("retrain worker is gone")]
    WorkerGone,
}

/// Completion handle for a queued retrain.
pub struct RetrainTicket {
    rx: oneshot::Receiver<Result<(), SectionError>>,
}

impl RetrainTicket {
    pub async fn wait(self) -> Result<(), SectionError> {
        self.rx.await.map_err(|_| SectionError::WorkerGone)?
    }

    pub fn wait_sync(self) -> Result<(), SectionError> {
        self.rx.blocking_recv().map_err(|_| SectionError::WorkerGone)?
    }
}

struct ServiceInner {
    config: ConfigHandle,
    storage: Option<Arc<dyn ObjectStorage>>,
    store: Arc<dyn SectionStore>,
    cache: RecognizerCache,
    locks: KeyedLocks,
}

pub struct SectionModelService {
    inner: Arc<ServiceInner>,
    pool: TaskPool,
}

impl SectionModelService {
    pub fn new(
        config: ConfigHandle,
        storage: Option<Arc<dyn ObjectStorage>>,
        store: Arc<dyn SectionStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config,
                storage,
                store,
                cache: RecognizerCache::new(),
                locks: KeyedLocks::new(),
            }),
            pool: TaskPool::new("rollcall-section", RETRAIN_WORKERS, RETRAIN_QUEUE_DEPTH),
        }
    }

    /// Seed a brand-new section with an empty model artifact so later
    /// lookups have a well-formed archive to resolve. No-op when the
    /// section already has a model pointer, or when storage is disabled.
    pub fn ensure_section_model_initialized(&self, section_id: &str) -> Result<(), SectionError> {
        let inner = &self.inner;
        let Some(storage) = inner.storage.as_ref() else {
            tracing::debug!(section = section_id, "storage disabled, skipping model init");
            return Ok(());
        };

        let lock = inner.locks.lock_for(section_id);
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if inner.store.model_storage_path(section_id)?.is_some() {
            drop(guard);
            if let Err(e) = self.recognizer_for(section_id) {
                tracing::warn!(section = section_id, error = %e, "existing model not resolvable");
            }
            return Ok(());
        }

        let cfg = inner.config.snapshot();
        let recognizer = LbphRecognizer::new(cfg.lbph_params());

        fs::create_dir_all(&cfg.sections_dir)?;
        let staging = tempfile::tempdir_in(&cfg.sections_dir)?;
        recognizer.save_model(staging.path())?;

        let bytes = zip_dir(staging.path())?;
        let storage_path = model_object_path(section_id);
        storage.upload(&cfg.models_bucket, &storage_path, ZIP_CONTENT_TYPE, &bytes, true)?;
        inner
            .store
            .set_model_storage_path(section_id, Some(&storage_path))?;

        let local_dir = cfg.sections_dir.join(section_id);
        replace_dir(staging.keep(), &local_dir)?;
        inner.cache.insert(
            section_id,
            ModelCacheEntry {
                recognizer: Arc::new(recognizer),
                storage_path,
                local_dir,
            },
        );
        tracing::info!(section = section_id, "empty section model initialized");
        Ok(())
    }

    /// Queue a full retrain of the section's model. The returned ticket
    /// resolves when the retrain finishes.
    pub fn retrain_section(&self, section_id: &str) -> Result<RetrainTicket, SectionError> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let section_id = section_id.to_string();
        let submitted = self.pool.submit(move || {
            let result = run_retrain(&inner, &section_id);
            if let Err(e) = &result {
                tracing::error!(section = %section_id, error = %e, "section retrain failed");
            }
            let _ = tx.send(result);
        });
        if !submitted {
            return Err(SectionError::WorkerGone);
        }
        Ok(RetrainTicket { rx })
    }

    /// Retrain and block until done.
    pub fn retrain_section_sync(&self, section_id: &str) -> Result<(), SectionError> {
        self.retrain_section(section_id)?.wait_sync()
    }

    /// Recognize a face crop against the section's current model.
    pub fn recognize(
        &self,
        section_id: &str,
        image: &DynamicImage,
    ) -> Result<Prediction, SectionError> {
        let recognizer = self.recognizer_for(section_id)?;
        Ok(recognizer.recognize(image))
    }

    /// Resolve the section's recognizer, reloading from object storage
    /// when the stored pointer moved since the cached copy was taken.
    pub fn recognizer_for(&self, section_id: &str) -> Result<Arc<dyn Recognizer>, SectionError> {
        let inner = &self.inner;
        let pointer = match inner.storage.as_ref() {
            Some(_) => inner.store.model_storage_path(section_id)?,
            // Without storage the cache is all there is.
            None => {
                return inner
                    .cache
                    .get(section_id)
                    .map(|e| e.recognizer)
                    .ok_or_else(|| SectionError::NoModel(section_id.to_string()));
            }
        };
        let Some(pointer) = pointer else {
            return Err(SectionError::NoModel(section_id.to_string()));
        };

        if let Some(entry) = inner.cache.get(section_id) {
            if entry.storage_path == pointer {
                return Ok(entry.recognizer);
            }
            tracing::info!(
                section = section_id,
                old = %entry.storage_path,
                new = %pointer,
                "model pointer moved, reloading"
            );
        }

        let entry = load_remote_model(inner, section_id, &pointer)?;
        let recognizer = Arc::clone(&entry.recognizer);
        inner.cache.insert(section_id, entry);
        Ok(recognizer)
    }

    /// Serve one file out of the section's model archive. Only the
    /// classifier state and label table are exposed.
    pub fn fetch_model_artifact(
        &self,
        section_id: &str,
        name: &str,
    ) -> Result<Vec<u8>, SectionError> {
        if !SERVABLE_ARTIFACTS.contains(&name) {
            return Err(SectionError::ArtifactNotAllowed(name.to_string()));
        }
        let inner = &self.inner;
        let storage = inner.storage.as_ref().ok_or(SectionError::StorageDisabled)?;
        let pointer = inner
            .store
            .model_storage_path(section_id)?
            .ok_or_else(|| SectionError::NoModel(section_id.to_string()))?;

        let cfg = inner.config.snapshot();
        let bytes = storage.download_bytes(&cfg.models_bucket, &pointer, cfg.download_timeout())?;
        extract_entry(&bytes, name)?
            .ok_or_else(|| SectionError::ArtifactMissing(name.to_string()))
    }

    /// Drop the section's model everywhere and clear its pointer. Used
    /// when a section is deactivated but its record remains.
    pub fn deactivate_section(&self, section_id: &str) -> Result<(), SectionError> {
        self.purge(section_id, true)
    }

    /// Drop the section's model everywhere. The section record itself is
    /// assumed gone, so no pointer update is attempted.
    pub fn remove_section(&self, section_id: &str) -> Result<(), SectionError> {
        self.purge(section_id, false)
    }

    fn purge(&self, section_id: &str, clear_pointer: bool) -> Result<(), SectionError> {
        let inner = &self.inner;
        let lock = inner.locks.lock_for(section_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let cfg = inner.config.snapshot();
        if let Some(storage) = inner.storage.as_ref() {
            let prefix = format!("{section_id}/");
            let paths: Vec<String> = storage
                .list(&cfg.models_bucket, &prefix)?
                .into_iter()
                .map(|o| o.path)
                .collect();
            if !paths.is_empty() {
                storage.delete(&cfg.models_bucket, &paths)?;
            }
        }

        inner.cache.remove(section_id);
        let local_dir = cfg.sections_dir.join(section_id);
        if local_dir.is_dir() {
            fs::remove_dir_all(&local_dir)?;
        }
        if clear_pointer {
            inner.store.set_model_storage_path(section_id, None)?;
        }
        tracing::info!(section = section_id, "section model purged");
        Ok(())
    }
}

fn model_object_path(section_id: &str) -> String {
    format!("{section_id}/current/lbph.zip")
}

fn dataset_object_path(section_id: &str) -> String {
    format!("{section_id}/faces.zip")
}

/// Full retrain, executed on a pool worker under the section lock.
fn run_retrain(inner: &ServiceInner, section_id: &str) -> Result<(), SectionError> {
    let storage = inner.storage.as_ref().ok_or(SectionError::StorageDisabled)?;
    let lock = inner.locks.lock_for(section_id);
    let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
    let cfg = inner.config.snapshot();

    let students = inner.store.active_students(section_id)?;
    if students.is_empty() {
        return Err(SectionError::NoActiveEnrollments(section_id.to_string()));
    }

    // Ask the owning system to rebuild the dataset archive, then wait for
    // the object's mtime to pass our request time.
    let requested_at = Utc::now();
    inner.store.refresh_dataset_archive(section_id)?;
    let dataset_path = dataset_object_path(section_id);
    wait_for_fresh_dataset(storage.as_ref(), &cfg, &dataset_path, requested_at);

    let bytes = storage.download_bytes(&cfg.datasets_bucket, &dataset_path, cfg.download_timeout())?;

    let scratch = tempfile::tempdir()?;
    extract_zip(&bytes, scratch.path())?;
    let dataset_root = locate_dataset_root(scratch.path())?;

    let counts = count_images_per_student(&dataset_root)?;
    let total: usize = counts.values().sum();
    if total < 2 {
        let empty_students = students
            .iter()
            .filter(|s| counts.get(*s).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();
        return Err(SectionError::InsufficientData {
            total,
            empty_students,
        });
    }

    let mut recognizer = LbphRecognizer::new(cfg.lbph_params());
    recognizer.train(&dataset_root)?;

    fs::create_dir_all(&cfg.sections_dir)?;
    let staging = tempfile::tempdir_in(&cfg.sections_dir)?;
    recognizer.save_model(staging.path())?;
    if !staging.path().join(MODEL_FILE).is_file() {
        return Err(SectionError::ArtifactMissing(MODEL_FILE.to_string()));
    }

    let archive = zip_dir(staging.path())?;
    let storage_path = model_object_path(section_id);

    // Republish: clear whatever lives under current/, then upload.
    let stale: Vec<String> = storage
        .list(&cfg.models_bucket, &format!("{section_id}/current"))?
        .into_iter()
        .map(|o| o.path)
        .collect();
    if !stale.is_empty() {
        storage.delete(&cfg.models_bucket, &stale)?;
    }
    storage.upload(&cfg.models_bucket, &storage_path, ZIP_CONTENT_TYPE, &archive, true)?;
    inner
        .store
        .set_model_storage_path(section_id, Some(&storage_path))?;

    let local_dir = cfg.sections_dir.join(section_id);
    replace_dir(staging.keep(), &local_dir)?;

    // Cache a recognizer loaded from the artifact we just published, not
    // the in-memory one, so cached and served state cannot diverge.
    let mut fresh = LbphRecognizer::new(cfg.lbph_params());
    fresh.load_model(&local_dir)?;
    inner.cache.insert(
        section_id,
        ModelCacheEntry {
            recognizer: Arc::new(fresh),
            storage_path,
            local_dir,
        },
    );

    tracing::info!(
        section = section_id,
        images = total,
        students = students.len(),
        "section model retrained"
    );
    Ok(())
}

/// Poll the dataset archive's metadata until it is newer than
/// `requested_at`, up to the configured budget. Falls back to one grace
/// sleep when the backend cannot answer metadata queries, and proceeds
/// with whatever exists once the budget runs out.
fn wait_for_fresh_dataset(
    storage: &dyn ObjectStorage,
    cfg: &crate::config::EngineConfig,
    dataset_path: &str,
    requested_at: chrono::DateTime<Utc>,
) {
    let interval = cfg.refresh_poll_interval();
    let deadline = std::time::Instant::now() + cfg.refresh_poll_total();

    loop {
        match storage.head(&cfg.datasets_bucket, dataset_path) {
            Ok(head) if !head.accessible => {
                tracing::debug!(path = dataset_path, "metadata unavailable, single grace wait");
                thread::sleep(interval);
                return;
            }
            Ok(head) => {
                if head.exists && head.last_modified.map_or(false, |m| m >= requested_at) {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(path = dataset_path, error = %e, "metadata probe failed");
            }
        }
        if std::time::Instant::now() >= deadline {
            tracing::warn!(
                path = dataset_path,
                "dataset archive not refreshed within budget, proceeding"
            );
            return;
        }
        thread::sleep(interval);
    }
}

/// Download the model archive behind `pointer` and load it into a fresh
/// cache entry, swapping the section's local directory atomically.
fn load_remote_model(
    inner: &ServiceInner,
    section_id: &str,
    pointer: &str,
) -> Result<ModelCacheEntry, SectionError> {
    let storage = inner.storage.as_ref().ok_or(SectionError::StorageDisabled)?;
    let cfg = inner.config.snapshot();

    let bytes = storage.download_bytes(&cfg.models_bucket, pointer, cfg.download_timeout())?;

    fs::create_dir_all(&cfg.sections_dir)?;
    let staging = tempfile::tempdir_in(&cfg.sections_dir)?;
    extract_zip(&bytes, staging.path())?;

    let local_dir = cfg.sections_dir.join(section_id);
    replace_dir(staging.keep(), &local_dir)?;

    let mut recognizer = LbphRecognizer::new(cfg.lbph_params());
    recognizer.load_model(&local_dir)?;
    tracing::info!(section = section_id, pointer, "section model loaded from storage");
    Ok(ModelCacheEntry {
        recognizer: Arc::new(recognizer),
        storage_path: pointer.to_string(),
        local_dir,
    })
}

/// Swap `staging` into place at `target`, keeping the old tree until the
/// new one is in place. Staging must live on the same filesystem.
fn replace_dir(staging: PathBuf, target: &Path) -> io::Result<()> {
    let old = target.with_extension("old");
    if old.exists() {
        fs::remove_dir_all(&old)?;
    }
    if target.exists() {
        fs::rename(target, &old)?;
    }
    fs::rename(&staging, target)?;
    if old.exists() {
        if let Err(e) = fs::remove_dir_all(&old) {
            tracing::warn!(dir = %old.display(), error = %e, "could not remove previous model dir");
        }
    }
    Ok(())
}
