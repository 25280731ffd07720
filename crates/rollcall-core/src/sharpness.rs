//! Laplacian-variance sharpness gate for training images.

use image::GrayImage;
use imageproc::filter::laplacian_filter;

/// Variance of the Laplacian response. Blurry images score low because the
/// second derivative flattens out when edges are smeared.
pub fn laplacian_variance(image: &GrayImage) -> f64 {
    let response = laplacian_filter(image);
    let values = response.as_raw();
    if values.is_empty() {
        return 0.0;
    }

    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n
}

/// Sharpness gate: passes when the Laplacian variance meets the threshold.
/// A threshold of zero (or below) always passes.
pub fn is_sharp(image: &GrayImage, threshold: f64) -> bool {
    if threshold <= 0.0 {
        return true;
    }
    laplacian_variance(image) >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn checkerboard(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if (x + y) % 2 == 0 {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        })
    }

    #[test]
    fn test_uniform_image_has_zero_variance() {
        let img = GrayImage::from_pixel(32, 32, Luma([128u8]));
        assert!(laplacian_variance(&img) < 1e-9);
    }

    #[test]
    fn test_checkerboard_is_sharp() {
        let img = checkerboard(32);
        assert!(laplacian_variance(&img) > 100.0);
        assert!(is_sharp(&img, 50.0));
    }

    #[test]
    fn test_zero_threshold_always_passes() {
        let img = GrayImage::from_pixel(32, 32, Luma([128u8]));
        assert!(is_sharp(&img, 0.0));
        assert!(is_sharp(&img, -1.0));
    }

    #[test]
    fn test_blurry_image_rejected() {
        let img = GrayImage::from_pixel(32, 32, Luma([128u8]));
        assert!(!is_sharp(&img, 10.0));
    }
}
