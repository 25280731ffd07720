//! End-to-end section model lifecycle against the in-memory backends.

use image::{DynamicImage, GrayImage, Luma};
use rollcall_core::{LABELS_FILE, MODEL_FILE};
use rollcall_service::archive::zip_dir;
use rollcall_service::persistence::PersistenceError;
use rollcall_service::{
    ConfigHandle, EngineConfig, MemorySectionStore, MemoryStorage, ObjectStorage, SectionError,
    SectionModelService, SectionStore,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;

const SECTION: &str = "section-7";

fn pattern(seed: u32, shift: u32) -> GrayImage {
    let period = 2 + seed % 5;
    GrayImage::from_fn(64, 64, |x, y| {
        let x = x + shift;
        let checker = ((x / period + y / period) % 2) * 150;
        let stripe = (x * (3 + seed) + y * (seed + 1)) % 80;
        Luma([((checker + stripe + seed * 7) % 256) as u8])
    })
}

fn probe(seed: u32, shift: u32) -> DynamicImage {
    DynamicImage::ImageLuma8(pattern(seed, shift))
}

/// Zip a dataset of `(student, images)` the way the archive rebuild does.
fn dataset_zip(students: &[(&str, Vec<GrayImage>)]) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    for (student, images) in students {
        let student_dir = dir.path().join(student);
        fs::create_dir_all(&student_dir).unwrap();
        for (i, img) in images.iter().enumerate() {
            img.save(student_dir.join(format!("{i:02}.png"))).unwrap();
        }
    }
    zip_dir(dir.path()).unwrap()
}

fn fast_config(base: &Path) -> ConfigHandle {
    let mut cfg = EngineConfig::default();
    cfg.sections_dir = base.join("sections");
    cfg.refresh_poll_interval_ms = 5;
    cfg.refresh_poll_total_ms = 20;
    ConfigHandle::new(cfg)
}

/// Section store that republishes the dataset archive on refresh, like
/// the production backend does from enrollment photos.
struct RefreshingStore {
    inner: MemorySectionStore,
    storage: Arc<MemoryStorage>,
    datasets_bucket: String,
    archive: std::sync::Mutex<Vec<u8>>,
}

impl RefreshingStore {
    fn set_archive(&self, bytes: Vec<u8>) {
        *self.archive.lock().unwrap() = bytes;
    }
}

impl SectionStore for RefreshingStore {
    fn model_storage_path(&self, section_id: &str) -> Result<Option<String>, PersistenceError> {
        self.inner.model_storage_path(section_id)
    }

    fn set_model_storage_path(
        &self,
        section_id: &str,
        path: Option<&str>,
    ) -> Result<(), PersistenceError> {
        self.inner.set_model_storage_path(section_id, path)
    }

    fn active_students(&self, section_id: &str) -> Result<Vec<String>, PersistenceError> {
        self.inner.active_students(section_id)
    }

    fn refresh_dataset_archive(&self, section_id: &str) -> Result<(), PersistenceError> {
        let archive = self.archive.lock().unwrap().clone();
        self.storage
            .upload(
                &self.datasets_bucket,
                &format!("{section_id}/faces.zip"),
                "application/zip",
                &archive,
                true,
            )
            .map_err(|e| PersistenceError::Backend(e.to_string()))
    }
}

fn build_service(
    base: &Path,
    roster: &[&str],
    archive: Vec<u8>,
) -> (SectionModelService, Arc<MemoryStorage>, Arc<RefreshingStore>) {
    let config = fast_config(base);
    let storage = Arc::new(MemoryStorage::new());
    let inner = MemorySectionStore::new();
    inner.add_section(SECTION, roster);
    let store = Arc::new(RefreshingStore {
        inner,
        storage: Arc::clone(&storage),
        datasets_bucket: config.snapshot().datasets_bucket.clone(),
        archive: std::sync::Mutex::new(archive),
    });
    let section_store: Arc<dyn SectionStore> = store.clone();
    let object_storage: Arc<dyn rollcall_service::ObjectStorage> = storage.clone();
    let service = SectionModelService::new(config, Some(object_storage), section_store);
    (service, storage, store)
}

#[test]
fn test_full_retrain_and_recognize_lifecycle() {
    let base = tempfile::tempdir().unwrap();
    let archive = dataset_zip(&[
        ("alice", vec![pattern(1, 0), pattern(1, 2), pattern(1, 4)]),
        ("bob", vec![pattern(9, 0), pattern(9, 2)]),
    ]);
    let (service, storage, store) = build_service(base.path(), &["alice", "bob"], archive);

    service.retrain_section_sync(SECTION).unwrap();

    // The pointer now names the published archive.
    assert_eq!(
        store.model_storage_path(SECTION).unwrap().as_deref(),
        Some("section-7/current/lbph.zip")
    );
    let config_snapshot = EngineConfig::default();
    assert_eq!(storage.object_count(&config_snapshot.models_bucket), 1);

    // The local artifact pair landed under the section directory.
    let local = base.path().join("sections").join(SECTION);
    assert!(local.join(MODEL_FILE).is_file());
    assert!(local.join(LABELS_FILE).is_file());

    // Recognition resolves the trained model and identifies enrollees.
    let hit = service.recognize(SECTION, &probe(1, 6)).unwrap();
    assert_eq!(hit.label, "alice");
    assert!(hit.distance.is_finite());
    assert_eq!(service.recognize(SECTION, &probe(9, 4)).unwrap().label, "bob");
}

#[test]
fn test_pointer_move_reloads_from_storage() {
    let base = tempfile::tempdir().unwrap();
    let archive = dataset_zip(&[
        ("alice", vec![pattern(1, 0), pattern(1, 2)]),
        ("bob", vec![pattern(9, 0), pattern(9, 2)]),
    ]);
    let (service, storage, store) = build_service(base.path(), &["alice", "bob"], archive);

    service.retrain_section_sync(SECTION).unwrap();
    assert_eq!(service.recognize(SECTION, &probe(1, 4)).unwrap().label, "alice");

    // Another node publishes a new artifact and moves the pointer; this
    // node must drop its cached model and reload.
    let cfg = EngineConfig::default();
    let current = storage
        .download_bytes(
            &cfg.models_bucket,
            "section-7/current/lbph.zip",
            std::time::Duration::from_secs(1),
        )
        .unwrap();
    storage
        .upload(&cfg.models_bucket, "section-7/v2/lbph.zip", "application/zip", &current, true)
        .unwrap();
    store
        .set_model_storage_path(SECTION, Some("section-7/v2/lbph.zip"))
        .unwrap();

    let hit = service.recognize(SECTION, &probe(1, 4)).unwrap();
    assert_eq!(hit.label, "alice");
}

#[test]
fn test_insufficient_dataset_reports_empty_students() {
    let base = tempfile::tempdir().unwrap();
    // carol is on the roster but has no images at all.
    let archive = dataset_zip(&[
        ("alice", vec![pattern(1, 0)]),
        ("carol", vec![]),
    ]);
    let (service, _storage, store) = build_service(base.path(), &["alice", "carol"], archive);

    let err = service.retrain_section_sync(SECTION).unwrap_err();
    match err {
        SectionError::InsufficientData {
            total,
            empty_students,
        } => {
            assert_eq!(total, 1);
            assert_eq!(empty_students, vec!["carol".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    // A failed retrain publishes nothing.
    assert_eq!(store.model_storage_path(SECTION).unwrap(), None);
}

#[test]
fn test_initialize_seeds_empty_model_once() {
    let base = tempfile::tempdir().unwrap();
    let (service, storage, store) =
        build_service(base.path(), &["alice"], dataset_zip(&[]));

    service.ensure_section_model_initialized(SECTION).unwrap();
    let pointer = store.model_storage_path(SECTION).unwrap();
    assert_eq!(pointer.as_deref(), Some("section-7/current/lbph.zip"));

    let cfg = EngineConfig::default();
    assert_eq!(storage.object_count(&cfg.models_bucket), 1);

    // Second call is a no-op.
    service.ensure_section_model_initialized(SECTION).unwrap();
    assert_eq!(storage.object_count(&cfg.models_bucket), 1);

    // The seeded model exists but is untrained, so probes come back
    // unknown rather than erroring.
    let miss = service.recognize(SECTION, &probe(1, 0)).unwrap();
    assert!(miss.is_unknown());
}

#[test]
fn test_fetch_model_artifacts_after_retrain() {
    let base = tempfile::tempdir().unwrap();
    let archive = dataset_zip(&[
        ("alice", vec![pattern(1, 0), pattern(1, 2)]),
        ("bob", vec![pattern(9, 0), pattern(9, 2)]),
    ]);
    let (service, _storage, _store) = build_service(base.path(), &["alice", "bob"], archive);
    service.retrain_section_sync(SECTION).unwrap();

    let model = service.fetch_model_artifact(SECTION, MODEL_FILE).unwrap();
    assert!(!model.is_empty());
    let labels = service.fetch_model_artifact(SECTION, LABELS_FILE).unwrap();
    let text = String::from_utf8(labels).unwrap();
    assert!(text.contains("alice"));
    assert!(text.contains("bob"));

    let err = service
        .fetch_model_artifact(SECTION, "weights.bin")
        .unwrap_err();
    assert!(matches!(err, SectionError::ArtifactNotAllowed(_)));
}

#[test]
fn test_deactivate_purges_everything() {
    let base = tempfile::tempdir().unwrap();
    let archive = dataset_zip(&[
        ("alice", vec![pattern(1, 0), pattern(1, 2)]),
        ("bob", vec![pattern(9, 0), pattern(9, 2)]),
    ]);
    let (service, storage, store) = build_service(base.path(), &["alice", "bob"], archive);
    service.retrain_section_sync(SECTION).unwrap();

    service.deactivate_section(SECTION).unwrap();

    let cfg = EngineConfig::default();
    assert_eq!(storage.object_count(&cfg.models_bucket), 0);
    assert_eq!(store.model_storage_path(SECTION).unwrap(), None);
    assert!(!base.path().join("sections").join(SECTION).exists());

    let err = service.recognize(SECTION, &probe(1, 0)).unwrap_err();
    assert!(matches!(err, SectionError::NoModel(_)));
}

#[test]
fn test_failed_retrain_keeps_previous_model_serving() {
    let base = tempfile::tempdir().unwrap();
    let archive = dataset_zip(&[
        ("alice", vec![pattern(1, 0), pattern(1, 2)]),
        ("bob", vec![pattern(9, 0), pattern(9, 2)]),
    ]);
    let (service, _storage, store) = build_service(base.path(), &["alice", "bob"], archive);
    service.retrain_section_sync(SECTION).unwrap();
    assert_eq!(service.recognize(SECTION, &probe(1, 4)).unwrap().label, "alice");

    // Next refresh produces a dataset that cannot train.
    store.set_archive(dataset_zip(&[("alice", vec![pattern(1, 0)])]));
    let err = service.retrain_section_sync(SECTION).unwrap_err();
    assert!(matches!(err, SectionError::InsufficientData { .. }));

    // Pointer, local artifacts and live recognition are untouched.
    assert_eq!(
        store.model_storage_path(SECTION).unwrap().as_deref(),
        Some("section-7/current/lbph.zip")
    );
    assert!(base
        .path()
        .join("sections")
        .join(SECTION)
        .join(MODEL_FILE)
        .is_file());
    assert_eq!(service.recognize(SECTION, &probe(1, 4)).unwrap().label, "alice");
}

#[test]
fn test_retrain_unwraps_wrapper_directory() {
    let base = tempfile::tempdir().unwrap();
    // Archive with an extra top-level export directory around the
    // per-student folders.
    let dir = tempfile::tempdir().unwrap();
    for (student, seed) in [("alice", 1u32), ("bob", 9u32)] {
        let sdir = dir.path().join("export").join(student);
        fs::create_dir_all(&sdir).unwrap();
        pattern(seed, 0).save(sdir.join("00.png")).unwrap();
        pattern(seed, 2).save(sdir.join("01.png")).unwrap();
    }
    let archive = zip_dir(dir.path()).unwrap();
    let (service, _storage, _store) = build_service(base.path(), &["alice", "bob"], archive);

    service.retrain_section_sync(SECTION).unwrap();
    assert_eq!(service.recognize(SECTION, &probe(9, 4)).unwrap().label, "bob");
}
