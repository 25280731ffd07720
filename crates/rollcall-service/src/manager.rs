//! Process-wide model manager.
//!
//! One dedicated OS thread owns the mutable recognizer and applies
//! lifecycle commands strictly in arrival order, so concurrent retrain and
//! update requests can never interleave. After every successful mutation
//! the artifact pair is persisted and an immutable snapshot is published
//! for lock-free recognition.

use crate::config::ConfigHandle;
use rollcall_core::{LbphRecognizer, Prediction, Recognizer, TrainingError};
use std::io;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("model worker is gone")]
    ChannelClosed,
}

type Reply = oneshot::Sender<Result<(), ManagerError>>;

enum Command {
    EnsureLoaded(Reply),
    RetrainAll(Reply),
    UpdateStudent { student_id: String, reply: Reply },
    RemoveStudent { student_id: String, reply: Reply },
}

/// Handle to the model worker thread. Cheap to clone.
#[derive(Clone)]
pub struct ModelManager {
    tx: mpsc::Sender<Command>,
    current: Arc<RwLock<Option<Arc<dyn Recognizer>>>>,
}

impl ModelManager {
    /// Spawn the worker thread and return the command handle.
    pub fn spawn(config: ConfigHandle) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let current: Arc<RwLock<Option<Arc<dyn Recognizer>>>> = Arc::new(RwLock::new(None));

        let slot = Arc::clone(&current);
        thread::Builder::new()
            .name("rollcall-model".to_string())
            .spawn(move || worker_loop(rx, config, slot))
            .unwrap_or_else(|e| panic!("failed to spawn model worker: {e}"));

        Self { tx, current }
    }

    /// Latest published recognizer snapshot, if any model has been loaded
    /// or trained yet.
    pub fn current(&self) -> Option<Arc<dyn Recognizer>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recognize against the published snapshot without touching the
    /// worker. `("unknown", +inf)` when no model is published.
    pub fn recognize(&self, image: &image::DynamicImage) -> Prediction {
        match self.current() {
            Some(rec) => rec.recognize(image),
            None => Prediction::unknown(),
        }
    }

    pub async fn ensure_loaded(&self) -> Result<(), ManagerError> {
        self.roundtrip(Command::EnsureLoaded).await
    }

    pub async fn retrain_all(&self) -> Result<(), ManagerError> {
        self.roundtrip(Command::RetrainAll).await
    }

    pub async fn update_student(&self, student_id: &str) -> Result<(), ManagerError> {
        let student_id = student_id.to_string();
        self.roundtrip(move |reply| Command::UpdateStudent { student_id, reply })
            .await
    }

    pub async fn remove_student(&self, student_id: &str) -> Result<(), ManagerError> {
        let student_id = student_id.to_string();
        self.roundtrip(move |reply| Command::RemoveStudent { student_id, reply })
            .await
    }

    pub fn retrain_all_sync(&self) -> Result<(), ManagerError> {
        self.roundtrip_sync(Command::RetrainAll)
    }

    pub fn ensure_loaded_sync(&self) -> Result<(), ManagerError> {
        self.roundtrip_sync(Command::EnsureLoaded)
    }

    pub fn update_student_sync(&self, student_id: &str) -> Result<(), ManagerError> {
        let student_id = student_id.to_string();
        self.roundtrip_sync(move |reply| Command::UpdateStudent { student_id, reply })
    }

    pub fn remove_student_sync(&self, student_id: &str) -> Result<(), ManagerError> {
        let student_id = student_id.to_string();
        self.roundtrip_sync(move |reply| Command::RemoveStudent { student_id, reply })
    }

    async fn roundtrip(&self, make: impl MakeCommand) -> Result<(), ManagerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make.into_command(reply_tx))
            .await
            .map_err(|_| ManagerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ManagerError::ChannelClosed)?
    }

    fn roundtrip_sync(&self, make: impl MakeCommand) -> Result<(), ManagerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(make.into_command(reply_tx))
            .map_err(|_| ManagerError::ChannelClosed)?;
        reply_rx
            .blocking_recv()
            .map_err(|_| ManagerError::ChannelClosed)?
    }
}

trait MakeCommand {
    fn into_command(self, reply: Reply) -> Command;
}

impl<F: FnOnce(Reply) -> Command> MakeCommand for F {
    fn into_command(self, reply: Reply) -> Command {
        self(reply)
    }
}

fn worker_loop(
    mut rx: mpsc::Receiver<Command>,
    config: ConfigHandle,
    slot: Arc<RwLock<Option<Arc<dyn Recognizer>>>>,
) {
    let mut recognizer: Box<dyn Recognizer> =
        Box::new(LbphRecognizer::new(config.snapshot().lbph_params()));
    tracing::info!("model worker started");

    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::EnsureLoaded(reply) => {
                let result = ensure_loaded(&mut recognizer, &config, &slot);
                let _ = reply.send(result);
            }
            Command::RetrainAll(reply) => {
                let result = retrain_all(&mut recognizer, &config, &slot);
                let _ = reply.send(result);
            }
            Command::UpdateStudent { student_id, reply } => {
                let result = update_student(&mut recognizer, &config, &slot, &student_id);
                let _ = reply.send(result);
            }
            Command::RemoveStudent { student_id, reply } => {
                let result = remove_student(&mut recognizer, &config, &slot, &student_id);
                let _ = reply.send(result);
            }
        }
    }
    tracing::info!("model worker stopped");
}

fn publish(recognizer: &dyn Recognizer, slot: &Arc<RwLock<Option<Arc<dyn Recognizer>>>>) {
    let snapshot: Arc<dyn Recognizer> = Arc::from(recognizer.clone_box());
    *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
}

fn ensure_loaded(
    recognizer: &mut Box<dyn Recognizer>,
    config: &ConfigHandle,
    slot: &Arc<RwLock<Option<Arc<dyn Recognizer>>>>,
) -> Result<(), ManagerError> {
    // A published recognizer is already at least as fresh as the artifact
    // pair on disk; only an unloaded manager goes to disk.
    if slot
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
    {
        return Ok(());
    }

    let cfg = config.snapshot();
    recognizer.load_model(&cfg.model_dir)?;
    if recognizer.is_trained() {
        publish(recognizer.as_ref(), slot);
        tracing::info!(dir = %cfg.model_dir.display(), "persisted model restored");
    }
    Ok(())
}

fn retrain_all(
    recognizer: &mut Box<dyn Recognizer>,
    config: &ConfigHandle,
    slot: &Arc<RwLock<Option<Arc<dyn Recognizer>>>>,
) -> Result<(), ManagerError> {
    let cfg = config.snapshot();

    // Stale artifacts must not outlive the dataset they were built from.
    if cfg.model_dir.is_dir() {
        std::fs::remove_dir_all(&cfg.model_dir)?;
    }

    let has_students = cfg.faces_dir.is_dir()
        && rollcall_core::recognizer::student_dirs(&cfg.faces_dir)
            .map(|dirs| !dirs.is_empty())
            .unwrap_or(false);

    if !has_students {
        // Nothing to learn from; publish an explicitly empty model so
        // stale predictions cannot survive a dataset wipe.
        tracing::warn!(dir = %cfg.faces_dir.display(), "no enrollment data, publishing empty model");
        *recognizer = Box::new(LbphRecognizer::new(cfg.lbph_params()));
        recognizer.save_model(&cfg.model_dir)?;
        publish(recognizer.as_ref(), slot);
        return Ok(());
    }

    recognizer.train(&cfg.faces_dir)?;
    recognizer.save_model(&cfg.model_dir)?;
    publish(recognizer.as_ref(), slot);
    Ok(())
}

fn update_student(
    recognizer: &mut Box<dyn Recognizer>,
    config: &ConfigHandle,
    slot: &Arc<RwLock<Option<Arc<dyn Recognizer>>>>,
    student_id: &str,
) -> Result<(), ManagerError> {
    let cfg = config.snapshot();
    let student_dir = cfg.faces_dir.join(student_id);

    if !recognizer.is_trained() {
        recognizer.load_model(&cfg.model_dir)?;
    }
    if recognizer.supports_incremental_update() {
        recognizer.update_incremental(&student_dir, student_id)?;
    } else {
        recognizer.train(&cfg.faces_dir)?;
    }
    recognizer.save_model(&cfg.model_dir)?;
    publish(recognizer.as_ref(), slot);
    tracing::info!(student = student_id, "student model updated");
    Ok(())
}

fn remove_student(
    recognizer: &mut Box<dyn Recognizer>,
    config: &ConfigHandle,
    slot: &Arc<RwLock<Option<Arc<dyn Recognizer>>>>,
    student_id: &str,
) -> Result<(), ManagerError> {
    let cfg = config.snapshot();

    if !recognizer.is_trained() {
        recognizer.load_model(&cfg.model_dir)?;
    }
    match recognizer.remove_student(student_id) {
        Ok(()) => {}
        Err(TrainingError::Unsupported) => {
            tracing::info!(student = student_id, "removal unsupported, full retrain");
            recognizer.train(&cfg.faces_dir)?;
        }
        Err(e) => return Err(e.into()),
    }
    recognizer.save_model(&cfg.model_dir)?;
    publish(recognizer.as_ref(), slot);
    tracing::info!(student = student_id, "student removed from model");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use image::{GrayImage, Luma};
    use std::fs;
    use std::path::Path;

    fn pattern(seed: u32, shift: u32) -> GrayImage {
        let period = 2 + seed % 5;
        GrayImage::from_fn(64, 64, |x, y| {
            let x = x + shift;
            let checker = ((x / period + y / period) % 2) * 150;
            let stripe = (x * (3 + seed) + y * (seed + 1)) % 80;
            Luma([((checker + stripe + seed * 7) % 256) as u8])
        })
    }

    fn write_student(root: &Path, id: &str, seeds: &[(u32, u32)]) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        for (i, (seed, shift)) in seeds.iter().enumerate() {
            pattern(*seed, *shift)
                .save(dir.join(format!("{i:02}.png")))
                .unwrap();
        }
    }

    fn test_config(base: &Path) -> ConfigHandle {
        let mut cfg = EngineConfig::default();
        cfg.faces_dir = base.join("faces");
        cfg.model_dir = base.join("model");
        cfg.sections_dir = base.join("sections");
        ConfigHandle::new(cfg)
    }

    #[test]
    fn test_retrain_publishes_and_persists() {
        let base = tempfile::tempdir().unwrap();
        let config = test_config(base.path());
        write_student(&config.snapshot().faces_dir, "A", &[(1, 0), (1, 2)]);
        write_student(&config.snapshot().faces_dir, "B", &[(9, 0), (9, 2)]);

        let manager = ModelManager::spawn(config.clone());
        assert!(manager.current().is_none());

        manager.retrain_all_sync().unwrap();
        let published = manager.current().expect("model published");
        assert!(published.is_trained());
        assert!(config
            .snapshot()
            .model_dir
            .join(rollcall_core::MODEL_FILE)
            .is_file());

        let hit = manager.recognize(&image::DynamicImage::ImageLuma8(pattern(1, 4)));
        assert_eq!(hit.label, "A");
    }

    #[test]
    fn test_retrain_with_empty_dataset_publishes_empty_model() {
        let base = tempfile::tempdir().unwrap();
        let config = test_config(base.path());
        fs::create_dir_all(config.snapshot().faces_dir).unwrap();

        let manager = ModelManager::spawn(config.clone());
        manager.retrain_all_sync().unwrap();

        let published = manager.current().expect("empty model still published");
        assert!(!published.is_trained());
        // The persisted artifact pair exists so a restart stays consistent.
        let model_dir = config.snapshot().model_dir;
        assert!(model_dir.join(rollcall_core::MODEL_FILE).is_file());
        assert!(model_dir.join(rollcall_core::LABELS_FILE).is_file());
    }

    #[test]
    fn test_ensure_loaded_restores_persisted_model() {
        let base = tempfile::tempdir().unwrap();
        let config = test_config(base.path());
        write_student(&config.snapshot().faces_dir, "A", &[(1, 0), (1, 2)]);

        let first = ModelManager::spawn(config.clone());
        first.retrain_all_sync().unwrap();

        let second = ModelManager::spawn(config.clone());
        assert!(second.current().is_none());
        second.ensure_loaded_sync().unwrap();
        let restored = second.current().expect("model restored from disk");
        assert!(restored.is_trained());
    }

    #[test]
    fn test_ensure_loaded_skips_disk_when_model_published() {
        let base = tempfile::tempdir().unwrap();
        let config = test_config(base.path());
        write_student(&config.snapshot().faces_dir, "A", &[(1, 0), (1, 2)]);

        let manager = ModelManager::spawn(config.clone());
        manager.retrain_all_sync().unwrap();

        // Corrupt the on-disk artifact; a manager with a published model
        // must not go back to disk, so this stays invisible.
        fs::write(
            config.snapshot().model_dir.join(rollcall_core::MODEL_FILE),
            b"not a model",
        )
        .unwrap();

        manager.ensure_loaded_sync().unwrap();
        assert!(manager.current().expect("model still published").is_trained());
    }

    #[test]
    fn test_ensure_loaded_without_artifacts_is_noop() {
        let base = tempfile::tempdir().unwrap();
        let manager = ModelManager::spawn(test_config(base.path()));
        manager.ensure_loaded_sync().unwrap();
        assert!(manager.current().is_none());
    }

    #[test]
    fn test_update_and_remove_student() {
        let base = tempfile::tempdir().unwrap();
        let config = test_config(base.path());
        let faces = config.snapshot().faces_dir;
        write_student(&faces, "A", &[(1, 0), (1, 2)]);
        write_student(&faces, "B", &[(9, 0), (9, 2)]);

        let manager = ModelManager::spawn(config);
        manager.retrain_all_sync().unwrap();

        write_student(&faces, "C", &[(17, 0), (17, 2)]);
        manager.update_student_sync("C").unwrap();
        let hit = manager.recognize(&image::DynamicImage::ImageLuma8(pattern(17, 4)));
        assert_eq!(hit.label, "C");

        fs::remove_dir_all(faces.join("B")).unwrap();
        manager.remove_student_sync("B").unwrap();
        let published = manager.current().unwrap();
        assert!(published.is_trained());
        assert_ne!(
            manager
                .recognize(&image::DynamicImage::ImageLuma8(pattern(9, 4)))
                .label,
            "B"
        );
    }
}
