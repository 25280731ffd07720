//! Face normalization pipeline.
//!
//! Fixed stage order: crop-to-face, grayscale, histogram equalization,
//! resize to the canonical training size. Stages are swappable behind
//! [`PreprocessStage`]; a failing stage is skipped and the pipeline
//! continues with the last good buffer.

use crate::detector::FaceDetector;
use crate::types::FaceBox;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use imageproc::contrast::equalize_histogram;
use std::sync::Arc;

/// Padding added around the detected face, per side, as a fraction of the
/// face edge.
const CROP_PADDING: f32 = 0.05;

/// A face box supplied by the caller, expressed against a reference frame
/// size (e.g. the preview resolution the box was drawn on).
#[derive(Debug, Clone)]
pub struct CropHint {
    pub bbox: FaceBox,
    pub reference: (u32, u32),
}

impl CropHint {
    /// Rescale the hint box from its reference frame to the actual image.
    fn for_image(&self, width: u32, height: u32) -> FaceBox {
        let (rw, rh) = self.reference;
        if rw == 0 || rh == 0 {
            return self.bbox;
        }
        let sx = width as f32 / rw as f32;
        let sy = height as f32 / rh as f32;
        FaceBox::new(
            (self.bbox.x as f32 * sx).round() as i32,
            (self.bbox.y as f32 * sy).round() as i32,
            (self.bbox.width as f32 * sx).round().max(1.0) as u32,
            (self.bbox.height as f32 * sy).round().max(1.0) as u32,
        )
    }
}

/// Single-input, single-output owned image transform.
///
/// `apply` takes ownership of its input; on failure the untouched buffer is
/// handed back so the pipeline can continue with it.
pub trait PreprocessStage: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, image: DynamicImage) -> Result<DynamicImage, (String, DynamicImage)>;
}

/// Ordered stage pipeline. Build with [`Preprocessor::standard`].
pub struct Preprocessor {
    stages: Vec<Box<dyn PreprocessStage>>,
}

impl Preprocessor {
    pub fn new(stages: Vec<Box<dyn PreprocessStage>>) -> Self {
        Self { stages }
    }

    /// The standard pipeline: crop, grayscale, equalize, resize.
    pub fn standard(
        target: (u32, u32),
        hint: Option<CropHint>,
        detector: Option<Arc<FaceDetector>>,
    ) -> Self {
        Self::new(vec![
            Box::new(CropToFace {
                target,
                hint,
                detector,
            }),
            Box::new(Grayscale),
            Box::new(Equalize),
            Box::new(Resize {
                width: target.0,
                height: target.1,
            }),
        ])
    }

    /// Run every stage in order. A failing stage logs and is skipped.
    pub fn run(&self, image: DynamicImage) -> DynamicImage {
        let mut buffer = image;
        for stage in &self.stages {
            match stage.apply(buffer) {
                Ok(next) => buffer = next,
                Err((reason, previous)) => {
                    tracing::warn!(stage = stage.name(), reason, "preprocess stage skipped");
                    buffer = previous;
                }
            }
        }
        buffer
    }
}

/// Square face crop with padding, clamped within the image. Skipped when
/// the image is already at the canonical size. With no hint and no
/// detection, falls back to a centered square crop.
struct CropToFace {
    target: (u32, u32),
    hint: Option<CropHint>,
    detector: Option<Arc<FaceDetector>>,
}

impl PreprocessStage for CropToFace {
    fn name(&self) -> &'static str {
        "crop"
    }

    fn apply(&self, image: DynamicImage) -> Result<DynamicImage, (String, DynamicImage)> {
        let (w, h) = image.dimensions();
        if (w, h) == self.target {
            return Ok(image);
        }
        if w == 0 || h == 0 {
            return Err(("empty image".into(), image));
        }

        let face = match &self.hint {
            Some(hint) => Some(hint.for_image(w, h)),
            None => self
                .detector
                .as_ref()
                .and_then(|d| d.detect(&image).into_iter().next()),
        };

        let crop = match face {
            Some(face) => square_crop_around(&face, w, h, self.target),
            None => centered_square(w, h),
        };

        Ok(image.crop_imm(crop.x.max(0) as u32, crop.y.max(0) as u32, crop.width, crop.height))
    }
}

struct Grayscale;

impl PreprocessStage for Grayscale {
    fn name(&self) -> &'static str {
        "grayscale"
    }

    fn apply(&self, image: DynamicImage) -> Result<DynamicImage, (String, DynamicImage)> {
        Ok(DynamicImage::ImageLuma8(image.to_luma8()))
    }
}

struct Equalize;

impl PreprocessStage for Equalize {
    fn name(&self) -> &'static str {
        "equalize"
    }

    fn apply(&self, image: DynamicImage) -> Result<DynamicImage, (String, DynamicImage)> {
        let eq = equalize_histogram(&image.to_luma8());
        Ok(DynamicImage::ImageLuma8(eq))
    }
}

struct Resize {
    width: u32,
    height: u32,
}

impl PreprocessStage for Resize {
    fn name(&self) -> &'static str {
        "resize"
    }

    fn apply(&self, image: DynamicImage) -> Result<DynamicImage, (String, DynamicImage)> {
        if self.width == 0 || self.height == 0 {
            return Err(("zero target size".into(), image));
        }
        Ok(image.resize_exact(self.width, self.height, FilterType::Triangle))
    }
}

/// Square crop centered on the face with `CROP_PADDING` per side, at least
/// the target edge, at most the smaller image dimension, clamped in bounds.
fn square_crop_around(face: &FaceBox, width: u32, height: u32, target: (u32, u32)) -> FaceBox {
    let shorter = width.min(height);
    let target_edge = target.0.max(target.1);

    let padded = face.width.max(face.height) as f32 * (1.0 + 2.0 * CROP_PADDING);
    let side = (padded.round() as u32)
        .max(target_edge)
        .min(shorter)
        .max(1);

    let (cx, cy) = face.center();
    let half = side as f32 / 2.0;
    let x = (cx - half)
        .round()
        .clamp(0.0, (width - side) as f32) as i32;
    let y = (cy - half)
        .round()
        .clamp(0.0, (height - side) as f32) as i32;

    FaceBox::new(x, y, side, side)
}

fn centered_square(width: u32, height: u32) -> FaceBox {
    let side = width.min(height).max(1);
    FaceBox::new(
        ((width - side) / 2) as i32,
        ((height - side) / 2) as i32,
        side,
        side,
    )
}
