//! Face detection with a primary/fallback funnel cascade pair.
//!
//! Uses the SeetaFace engine from the `rustface` crate. The frame is
//! grayscaled, contrast-equalized and optionally downscaled before the
//! cascade runs; boxes are mapped back to source coordinates and
//! deduplicated with greedy non-maximum suppression.

use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use imageproc::contrast::equalize_histogram;
use std::fs;
use std::io::Cursor;
use std::path::Path;

/// Overlapping detections above this IoU are collapsed to the larger box.
const NMS_IOU_THRESHOLD: f32 = 0.35;
/// SeetaFace default confidence cut-off for the primary cascade.
const BASE_SCORE_THRESHOLD: f64 = 2.0;
const SLIDE_WINDOW_STEP: u32 = 4;
/// Detection min-size never drops below shorter-dim / MIN_SIZE_DIVISOR.
const MIN_SIZE_DIVISOR: u32 = 8;
/// SeetaFace rejects search windows smaller than this.
const CASCADE_FLOOR_SIZE: u32 = 20;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Smallest face edge to search for, in pixels of the detection frame.
    pub min_face_size: u32,
    /// Cascade pyramid growth per level (> 1.0, e.g. 1.1).
    pub scale_factor: f32,
    /// Neighbor agreement required by the primary cascade.
    pub min_neighbors: u32,
    /// Uniform scale applied to the frame before detection (1.0 = off).
    /// Values below 1.0 shrink large frames to bound cascade cost.
    pub downscale: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_face_size: 40,
            scale_factor: 1.1,
            min_neighbors: 5,
            downscale: 1.0,
        }
    }
}

/// Cascade face detector with an optional fallback model.
///
/// A detector with neither model loaded is valid and detects nothing;
/// classifier problems are logged, never propagated.
pub struct FaceDetector {
    primary: Option<rustface::Model>,
    fallback: Option<rustface::Model>,
    config: DetectorConfig,
}

impl FaceDetector {
    /// Load cascade models from disk. A missing or unreadable model file
    /// leaves that slot empty with a warning.
    pub fn open(
        primary: Option<&Path>,
        fallback: Option<&Path>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            primary: primary.and_then(|p| load_model(p, "primary")),
            fallback: fallback.and_then(|p| load_model(p, "fallback")),
            config,
        }
    }

    /// Build a detector from already-loaded models (tests, embedders).
    pub fn from_models(
        primary: Option<rustface::Model>,
        fallback: Option<rustface::Model>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            config,
        }
    }

    pub fn has_classifier(&self) -> bool {
        self.primary.is_some() || self.fallback.is_some()
    }

    /// Locate face regions in the image, in source-image coordinates.
    pub fn detect(&self, image: &DynamicImage) -> Vec<FaceBox> {
        let gray = equalize_histogram(&image.to_luma8());
        let (frame, scale) = downscale_frame(gray, self.config.downscale);

        let shorter = frame.width().min(frame.height());
        if shorter == 0 {
            return Vec::new();
        }
        let min_size = self
            .config
            .min_face_size
            .max(shorter / MIN_SIZE_DIVISOR)
            .max(CASCADE_FLOOR_SIZE);

        let mut boxes = match &self.primary {
            Some(model) => self.run_cascade(model, &frame, min_size, self.config.min_neighbors),
            None => {
                tracing::warn!("primary cascade not loaded, trying fallback");
                Vec::new()
            }
        };

        if boxes.is_empty() {
            // Relaxed neighbor agreement for the fallback pass.
            let relaxed = self.config.min_neighbors.saturating_sub(2).max(2);
            if let Some(model) = &self.fallback {
                boxes = self.run_cascade(model, &frame, min_size, relaxed);
            } else if self.primary.is_none() {
                tracing::warn!("no cascade classifier available, returning no detections");
            }
        }

        // Undo the detection-time downscale.
        if (scale - 1.0).abs() > f32::EPSILON {
            let inv = 1.0 / scale;
            for b in &mut boxes {
                *b = b.scaled(inv);
            }
        }

        non_maximum_suppression(boxes, NMS_IOU_THRESHOLD)
    }

    fn run_cascade(
        &self,
        model: &rustface::Model,
        frame: &GrayImage,
        min_size: u32,
        neighbors: u32,
    ) -> Vec<FaceBox> {
        let mut detector = rustface::create_detector_with_model(model.clone());
        detector.set_min_face_size(min_size);
        detector.set_score_thresh(score_threshold(neighbors, self.config.min_neighbors));
        detector.set_pyramid_scale_factor(pyramid_scale(self.config.scale_factor));
        detector.set_slide_window_step(SLIDE_WINDOW_STEP, SLIDE_WINDOW_STEP);

        let image_data = rustface::ImageData::new(frame.as_raw(), frame.width(), frame.height());
        detector
            .detect(&image_data)
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                FaceBox::new(bbox.x(), bbox.y(), bbox.width(), bbox.height())
            })
            .collect()
    }
}

fn load_model(path: &Path, role: &str) -> Option<rustface::Model> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(role, path = %path.display(), error = %e, "cascade model unavailable");
            return None;
        }
    };
    match rustface::read_model(Cursor::new(bytes)) {
        Ok(model) => {
            tracing::info!(role, path = %path.display(), "cascade model loaded");
            Some(model)
        }
        Err(e) => {
            tracing::warn!(role, path = %path.display(), error = %e, "cascade model unreadable");
            None
        }
    }
}

/// Resize the detection frame by `factor`. Shrinking uses area averaging,
/// enlarging uses linear interpolation.
fn downscale_frame(gray: GrayImage, factor: f32) -> (GrayImage, f32) {
    if !(factor.is_finite() && factor > 0.0) || (factor - 1.0).abs() < f32::EPSILON {
        return (gray, 1.0);
    }
    let w = ((gray.width() as f32 * factor).round() as u32).max(1);
    let h = ((gray.height() as f32 * factor).round() as u32).max(1);
    let resized = if factor < 1.0 {
        imageops::thumbnail(&gray, w, h)
    } else {
        imageops::resize(&gray, w, h, FilterType::Triangle)
    };
    (resized, factor)
}

/// Map a neighbor-agreement count onto the SeetaFace score threshold.
/// Fewer required neighbors lowers the cut-off proportionally.
fn score_threshold(neighbors: u32, configured: u32) -> f64 {
    let configured = configured.max(1);
    BASE_SCORE_THRESHOLD * neighbors.min(configured) as f64 / configured as f64
}

/// SeetaFace shrinks its pyramid by a factor in (0, 1); cascade configs
/// express growth as a factor > 1.
fn pyramid_scale(scale_factor: f32) -> f32 {
    if scale_factor > 1.0 {
        (1.0 / scale_factor).clamp(0.1, 0.99)
    } else {
        0.8
    }
}

/// Greedy NMS: sort by area descending, keep a box and drop any later box
/// overlapping it above `iou_threshold`.
fn non_maximum_suppression(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.area().cmp(&a.area()));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(boxes[i]);

        for j in (i + 1)..boxes.len() {
            if suppressed[j] {
                continue;
            }
            if boxes[i].iou(&boxes[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}
