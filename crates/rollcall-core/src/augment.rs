//! Training-image augmentation: flip and small rotations, each filtered
//! through the Laplacian-variance sharpness gate.

use crate::sharpness::is_sharp;
use image::{imageops, GrayImage};

/// Rotation applied to produce the two rotated variants, in degrees.
const ROTATION_DEGREES: f32 = 10.0;

#[derive(Debug, Clone)]
pub struct Augmenter {
    /// Laplacian-variance floor; variants below it are discarded.
    /// Zero disables the gate.
    pub blur_threshold: f64,
    /// Cap on variants beyond the original, to bound training memory.
    pub max_extra_variants: usize,
}

impl Augmenter {
    pub fn new(blur_threshold: f64, max_extra_variants: usize) -> Self {
        Self {
            blur_threshold,
            max_extra_variants,
        }
    }

    /// Produce the original plus flipped/rotated variants. Every variant is
    /// independently sharpness-gated; extras are capped at
    /// `max_extra_variants`.
    pub fn augment(&self, image: &GrayImage) -> Vec<GrayImage> {
        let mut out = Vec::with_capacity(1 + self.max_extra_variants);

        if is_sharp(image, self.blur_threshold) {
            out.push(image.clone());
        } else {
            tracing::debug!("source image failed the sharpness gate");
        }

        let mut extras = 0usize;
        let candidates: [GrayImage; 3] = [
            imageops::flip_horizontal(image),
            rotate_reflect(image, ROTATION_DEGREES.to_radians()),
            rotate_reflect(image, -ROTATION_DEGREES.to_radians()),
        ];

        for variant in candidates {
            if extras >= self.max_extra_variants {
                break;
            }
            if is_sharp(&variant, self.blur_threshold) {
                out.push(variant);
                extras += 1;
            }
        }

        out
    }
}

/// Rotate about the image center, preserving canvas size. Samples outside
/// the source are mirrored across the border instead of padded with black.
/// Bilinear interpolation.
pub fn rotate_reflect(image: &GrayImage, theta: f32) -> GrayImage {
    let (w, h) = (image.width() as usize, image.height() as usize);
    if w == 0 || h == 0 {
        return image.clone();
    }

    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;
    let (sin, cos) = theta.sin_cos();

    let src = image.as_raw();
    let mut out = vec![0u8; w * h];

    for oy in 0..h {
        for ox in 0..w {
            // Inverse-rotate the output coordinate back into the source.
            let dx = ox as f32 - cx;
            let dy = oy as f32 - cy;
            let sx = cx + cos * dx + sin * dy;
            let sy = cy - sin * dx + cos * dy;

            let x0 = sx.floor();
            let y0 = sy.floor();
            let fx = sx - x0;
            let fy = sy - y0;

            let sample = |x: i64, y: i64| -> f32 {
                let xi = reflect_index(x, w);
                let yi = reflect_index(y, h);
                src[yi * w + xi] as f32
            };

            let x0 = x0 as i64;
            let y0 = y0 as i64;
            let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0) * fx * (1.0 - fy)
                + sample(x0, y0 + 1) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1) * fx * fy;

            out[oy * w + ox] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayImage::from_raw(w as u32, h as u32, out)
        .unwrap_or_else(|| image.clone())
}

/// Mirror an index across the image border (a, b, c | b, a order).
fn reflect_index(mut i: i64, len: usize) -> usize {
    let n = len as i64;
    if n == 1 {
        return 0;
    }
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * n - 2 - i;
        } else {
            return i as usize;
        }
    }
}
