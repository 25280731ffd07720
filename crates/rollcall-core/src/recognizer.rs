//! Trainable face recognizer.
//!
//! [`Recognizer`] is the capability managers program against;
//! [`LbphRecognizer`] is the histogram implementation: uniform-grid Local
//! Binary Pattern histograms compared with the chi-square distance,
//! nearest-neighbour over every stored sample. Lower distance = better
//! match.

use crate::augment::Augmenter;
use crate::labels::LabelTable;
use crate::preprocess::Preprocessor;
use crate::sharpness::is_sharp;
use crate::types::{Prediction, UNKNOWN_LABEL};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Serialized classifier state. The body is JSON (which is also valid
/// YAML); the historic file name is kept for artifact compatibility.
pub const MODEL_FILE: &str = "lbph.yml";
/// Label table, `index,studentId` per line.
pub const LABELS_FILE: &str = "labels.txt";

/// Processed images are accumulated into batches of this size before being
/// folded into the model, bounding peak memory on large datasets.
const TRAIN_BATCH_SIZE: usize = 30;
/// A dataset contributing fewer accepted source images than this cannot
/// train a usable model.
const MIN_TRAINING_IMAGES: usize = 2;
/// Augmented variants per source image, beyond the original.
const MAX_EXTRA_VARIANTS: usize = 2;
const HISTOGRAM_BINS: usize = 256;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(
        "not enough usable training images ({accepted} accepted); students with no usable images: {empty_students:?}"
    )]
    InsufficientData {
        accepted: usize,
        empty_students: Vec<String>,
    },
    #[error("dataset root is not a directory: {0}")]
    BadDatasetRoot(PathBuf),
    #[error("operation not supported by this recognizer")]
    Unsupported,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Trainable classifier capability.
pub trait Recognizer: Send + Sync {
    /// Full train over `root/{studentId}/*.jpg|png`. On failure the
    /// recognizer is left untrained.
    fn train(&mut self, dataset_root: &Path) -> Result<(), TrainingError>;

    /// Identify a face crop. `("unknown", +inf)` when untrained.
    fn recognize(&self, image: &DynamicImage) -> Prediction;

    fn supports_incremental_update(&self) -> bool;

    /// Add or refresh a single student without touching other students'
    /// data. Falls back to a full train when never trained.
    fn update_incremental(
        &mut self,
        student_dir: &Path,
        student_id: &str,
    ) -> Result<(), TrainingError>;

    /// Drop a student. Implementations may need a full retrain from the
    /// remembered dataset root; without one they degrade to untrained.
    fn remove_student(&mut self, student_id: &str) -> Result<(), TrainingError>;

    /// Persist classifier state + label table into `dir`.
    fn save_model(&self, dir: &Path) -> io::Result<()>;

    /// Load state from `dir`. Silent no-op unless both artifact files
    /// exist.
    fn load_model(&mut self, dir: &Path) -> io::Result<()>;

    fn is_trained(&self) -> bool;

    /// Owned copy for publishing an immutable snapshot.
    fn clone_box(&self) -> Box<dyn Recognizer>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphParams {
    /// Spatial histogram grid.
    pub grid_x: u32,
    pub grid_y: u32,
    /// Canonical face size fed to the histogram extractor.
    pub target_width: u32,
    pub target_height: u32,
    /// Laplacian-variance floor for training images (0 = gate off).
    pub blur_threshold: f64,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            grid_x: 8,
            grid_y: 8,
            target_width: 100,
            target_height: 100,
            blur_threshold: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LbphSample {
    label: u32,
    histogram: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    params: LbphParams,
    trained: bool,
    samples: Vec<LbphSample>,
}

/// Local-Binary-Pattern-Histogram face recognizer.
#[derive(Clone)]
pub struct LbphRecognizer {
    params: LbphParams,
    labels: LabelTable,
    samples: Vec<LbphSample>,
    trained: bool,
    dataset_root: Option<PathBuf>,
}

impl LbphRecognizer {
    pub fn new(params: LbphParams) -> Self {
        Self {
            params,
            labels: LabelTable::new(),
            samples: Vec::new(),
            trained: false,
            dataset_root: None,
        }
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    fn augmenter(&self) -> Augmenter {
        Augmenter::new(self.params.blur_threshold, MAX_EXTRA_VARIANTS)
    }

    fn preprocess_input(&self, image: &DynamicImage) -> GrayImage {
        let pipeline = Preprocessor::standard(
            (self.params.target_width, self.params.target_height),
            None,
            None,
        );
        pipeline.run(image.clone()).to_luma8()
    }

    /// Augment + preprocess one accepted source image into model samples.
    fn ingest(&mut self, label: u32, gray: &GrayImage, batch: &mut Vec<(u32, GrayImage)>) {
        for variant in self.augmenter().augment(gray) {
            let processed = self.preprocess_input(&DynamicImage::ImageLuma8(variant));
            batch.push((label, processed));
            if batch.len() >= TRAIN_BATCH_SIZE {
                self.absorb_batch(batch);
            }
        }
    }

    /// Fold a batch of processed images into the model. The first batch
    /// seeds the base model, later batches extend it incrementally.
    fn absorb_batch(&mut self, batch: &mut Vec<(u32, GrayImage)>) {
        if batch.is_empty() {
            return;
        }
        tracing::debug!(
            images = batch.len(),
            base = self.samples.is_empty(),
            "absorbing training batch"
        );
        for (label, face) in batch.drain(..) {
            let histogram = lbp_histogram(&self.params, &face);
            self.samples.push(LbphSample { label, histogram });
        }
    }

    fn reset_model(&mut self) {
        self.samples.clear();
        self.labels.clear();
        self.trained = false;
    }
}

impl Recognizer for LbphRecognizer {
    fn train(&mut self, dataset_root: &Path) -> Result<(), TrainingError> {
        if !dataset_root.is_dir() {
            return Err(TrainingError::BadDatasetRoot(dataset_root.to_path_buf()));
        }

        self.reset_model();
        let mut accepted = 0usize;
        let mut empty_students = Vec::new();
        let mut batch: Vec<(u32, GrayImage)> = Vec::with_capacity(TRAIN_BATCH_SIZE);

        for (student_id, dir) in student_dirs(dataset_root)? {
            let label = self.labels.assign(&student_id);
            let mut contributed = 0usize;

            for file in image_files(&dir)? {
                let image = match image::open(&file) {
                    Ok(img) => img,
                    Err(e) => {
                        tracing::debug!(file = %file.display(), error = %e, "skipping unreadable image");
                        continue;
                    }
                };
                let gray = image.to_luma8();
                if !is_sharp(&gray, self.params.blur_threshold) {
                    tracing::debug!(file = %file.display(), "skipping blurry image");
                    continue;
                }

                self.ingest(label, &gray, &mut batch);
                contributed += 1;
                accepted += 1;
            }

            if contributed == 0 {
                empty_students.push(student_id.clone());
            }
            tracing::debug!(student = %student_id, contributed, "student images collected");
        }
        self.absorb_batch(&mut batch);

        if accepted < MIN_TRAINING_IMAGES {
            self.reset_model();
            return Err(TrainingError::InsufficientData {
                accepted,
                empty_students,
            });
        }

        self.trained = true;
        self.dataset_root = Some(dataset_root.to_path_buf());
        tracing::info!(
            accepted,
            students = self.labels.len(),
            samples = self.samples.len(),
            "recognizer trained"
        );
        Ok(())
    }

    fn recognize(&self, image: &DynamicImage) -> Prediction {
        if !self.trained || self.samples.is_empty() {
            return Prediction::unknown();
        }

        let face = self.preprocess_input(image);
        let probe = lbp_histogram(&self.params, &face);

        let mut best: Option<(u32, f32)> = None;
        for sample in &self.samples {
            let d = chi_square(&probe, &sample.histogram);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((sample.label, d));
            }
        }

        match best {
            Some((label, distance)) => Prediction {
                label: self
                    .labels
                    .student_for(label)
                    .unwrap_or(UNKNOWN_LABEL)
                    .to_string(),
                distance: distance.max(0.0),
            },
            None => Prediction::unknown(),
        }
    }

    fn supports_incremental_update(&self) -> bool {
        true
    }

    fn update_incremental(
        &mut self,
        student_dir: &Path,
        student_id: &str,
    ) -> Result<(), TrainingError> {
        if !self.trained {
            // Never trained: a full pass over the whole dataset is required
            // to get a coherent model anyway.
            let parent = student_dir
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| TrainingError::BadDatasetRoot(student_dir.to_path_buf()))?;
            return self.train(&parent);
        }

        let label = self.labels.assign(student_id);
        let mut batch: Vec<(u32, GrayImage)> = Vec::with_capacity(TRAIN_BATCH_SIZE);
        let mut contributed = 0usize;

        for file in image_files(student_dir)? {
            let image = match image::open(&file) {
                Ok(img) => img,
                Err(e) => {
                    tracing::debug!(file = %file.display(), error = %e, "skipping unreadable image");
                    continue;
                }
            };
            let gray = image.to_luma8();
            if !is_sharp(&gray, self.params.blur_threshold) {
                continue;
            }
            self.ingest(label, &gray, &mut batch);
            contributed += 1;
        }
        self.absorb_batch(&mut batch);

        if contributed == 0 {
            return Err(TrainingError::InsufficientData {
                accepted: 0,
                empty_students: vec![student_id.to_string()],
            });
        }

        if self.dataset_root.is_none() {
            self.dataset_root = student_dir.parent().map(Path::to_path_buf);
        }
        tracing::info!(student = student_id, contributed, "incremental update applied");
        Ok(())
    }

    fn remove_student(&mut self, student_id: &str) -> Result<(), TrainingError> {
        self.labels.remove(student_id);

        // Label indices cannot be excised from the sample set in place;
        // retrain from the remembered root (the caller is expected to have
        // removed the student's images from it already).
        match self.dataset_root.clone() {
            Some(root) if root.is_dir() => {
                tracing::info!(student = student_id, root = %root.display(), "full retrain after removal");
                self.train(&root)
            }
            _ => {
                tracing::warn!(
                    student = student_id,
                    "no dataset root remembered, leaving recognizer untrained"
                );
                self.samples.clear();
                self.trained = false;
                Ok(())
            }
        }
    }

    fn save_model(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        let file = ModelFile {
            params: self.params.clone(),
            trained: self.trained,
            samples: self.samples.clone(),
        };
        let blob = serde_json::to_vec(&file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join(MODEL_FILE), blob)?;
        self.labels.save(&dir.join(LABELS_FILE))
    }

    fn load_model(&mut self, dir: &Path) -> io::Result<()> {
        let model_path = dir.join(MODEL_FILE);
        let labels_path = dir.join(LABELS_FILE);
        if !model_path.is_file() || !labels_path.is_file() {
            tracing::debug!(dir = %dir.display(), "model artifact pair incomplete, nothing loaded");
            return Ok(());
        }

        let blob = fs::read(&model_path)?;
        let file: ModelFile = serde_json::from_slice(&blob)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let labels = LabelTable::load(&labels_path)?;

        self.params = file.params;
        self.samples = file.samples;
        self.trained = file.trained && !self.samples.is_empty();
        self.labels = labels;
        tracing::info!(
            dir = %dir.display(),
            samples = self.samples.len(),
            students = self.labels.len(),
            "model loaded"
        );
        Ok(())
    }

    fn is_trained(&self) -> bool {
        self.trained
    }

    fn clone_box(&self) -> Box<dyn Recognizer> {
        Box::new(self.clone())
    }
}

/// Student subdirectories of a dataset root, in filename order.
pub fn student_dirs(root: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    dirs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(dirs)
}

/// Image files in a directory, in filename order.
pub fn image_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && is_image_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn is_image_file(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("jpg" | "jpeg" | "png")
    )
}

/// Concatenated per-cell LBP histograms, each cell normalized to sum 1.
fn lbp_histogram(params: &LbphParams, face: &GrayImage) -> Vec<f32> {
    let codes = lbp_codes(face);
    let (w, h) = (face.width() as usize, face.height() as usize);
    let gx = params.grid_x.max(1) as usize;
    let gy = params.grid_y.max(1) as usize;

    let mut hist = vec![0f32; gx * gy * HISTOGRAM_BINS];
    if w == 0 || h == 0 {
        return hist;
    }

    for y in 0..h {
        let cell_y = (y * gy / h).min(gy - 1);
        for x in 0..w {
            let cell_x = (x * gx / w).min(gx - 1);
            let code = codes[y * w + x] as usize;
            hist[(cell_y * gx + cell_x) * HISTOGRAM_BINS + code] += 1.0;
        }
    }

    // Normalize each cell independently so grid cells weigh equally.
    for cell in hist.chunks_mut(HISTOGRAM_BINS) {
        let sum: f32 = cell.iter().sum();
        if sum > 0.0 {
            for v in cell.iter_mut() {
                *v /= sum;
            }
        }
    }

    hist
}

/// 8-neighbour, radius-1 LBP code per pixel; border pixels use clamped
/// neighbours.
fn lbp_codes(face: &GrayImage) -> Vec<u8> {
    let (w, h) = (face.width() as i64, face.height() as i64);
    let src = face.as_raw();
    let at = |x: i64, y: i64| -> u8 {
        let xi = x.clamp(0, w - 1) as usize;
        let yi = y.clamp(0, h - 1) as usize;
        src[yi * w as usize + xi]
    };

    let offsets: [(i64, i64); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];

    let mut codes = Vec::with_capacity((w * h) as usize);
    for y in 0..h {
        for x in 0..w {
            let center = at(x, y);
            let mut code = 0u8;
            for (bit, (dx, dy)) in offsets.iter().enumerate() {
                if at(x + dx, y + dy) >= center {
                    code |= 1 << bit;
                }
            }
            codes.push(code);
        }
    }
    codes
}

/// Chi-square distance between two histograms; zero for identical inputs.
fn chi_square(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let diff = x - y;
            let sum = x + y;
            if sum > f32::EPSILON {
                diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}
