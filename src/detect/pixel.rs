//! Pixel comparator: perceptual diff of two raster images.

use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;

use super::DetectError;

/// Per-channel difference below this is treated as anti-aliasing or minor
/// color drift, not a change.
const CHANNEL_TOLERANCE: u8 = 25;

/// Factor applied to unchanged pixels in the diff overlay.
const DARKEN_PERCENT: u32 = 45;

/// Result of a pixel comparison.
#[derive(Debug)]
pub struct PixelDiff {
    /// `100 * (1 - changed / total)`.
    pub score: f64,
    pub changed_pixels: u64,
    pub total_pixels: u64,
    /// PNG overlay rendered on the current image when any pixels differ:
    /// unchanged pixels darkened, changed pixels highlighted in place.
    pub overlay_png: Option<Vec<u8>>,
}

/// Compare two encoded images, resizing the current one to the baseline's
/// dimensions if they differ.
pub fn compare_images(baseline_png: &[u8], current_png: &[u8]) -> Result<PixelDiff, DetectError> {
    let baseline = image::load_from_memory(baseline_png)?.to_rgba8();
    let mut current = image::load_from_memory(current_png)?;

    let (bw, bh) = baseline.dimensions();
    if current.dimensions() != (bw, bh) {
        current = current.resize_exact(bw, bh, FilterType::Triangle);
    }
    let current = current.to_rgba8();

    let mut overlay = RgbaImage::new(bw, bh);
    let mut changed: u64 = 0;

    for (x, y, pixel) in current.enumerate_pixels() {
        let base = baseline.get_pixel(x, y);
        if pixels_differ(pixel, base) {
            changed += 1;
            overlay.put_pixel(x, y, highlight(pixel));
        } else {
            overlay.put_pixel(x, y, darken(pixel));
        }
    }

    let total = u64::from(bw) * u64::from(bh);
    let score = if total == 0 {
        100.0
    } else {
        100.0 * (1.0 - changed as f64 / total as f64)
    };

    let overlay_png = if changed > 0 {
        let mut buf = Vec::new();
        overlay
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(DetectError::Image)?;
        Some(buf)
    } else {
        None
    };

    Ok(PixelDiff {
        score,
        changed_pixels: changed,
        total_pixels: total,
        overlay_png,
    })
}

fn pixels_differ(a: &Rgba<u8>, b: &Rgba<u8>) -> bool {
    (0..3).any(|i| a.0[i].abs_diff(b.0[i]) > CHANNEL_TOLERANCE)
}

/// Translucent red over the changed pixel, keeping it recognizable.
fn highlight(p: &Rgba<u8>) -> Rgba<u8> {
    Rgba([
        ((u32::from(p.0[0]) + 255) / 2) as u8,
        (u32::from(p.0[1]) / 2) as u8,
        (u32::from(p.0[2]) / 2) as u8,
        255,
    ])
}

fn darken(p: &Rgba<u8>) -> Rgba<u8> {
    Rgba([
        (u32::from(p.0[0]) * DARKEN_PERCENT / 100) as u8,
        (u32::from(p.0[1]) * DARKEN_PERCENT / 100) as u8,
        (u32::from(p.0[2]) * DARKEN_PERCENT / 100) as u8,
        255,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_png(w: u32, h: u32, color: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(w, h, Rgba(color));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn test_identical_images_score_100() {
        let png = solid_png(8, 8, [10, 20, 30, 255]);
        let diff = compare_images(&png, &png).unwrap();
        assert_eq!(diff.score, 100.0);
        assert_eq!(diff.changed_pixels, 0);
        assert!(diff.overlay_png.is_none());
    }

    #[test]
    fn test_minor_drift_within_tolerance() {
        let a = solid_png(8, 8, [100, 100, 100, 255]);
        let b = solid_png(8, 8, [110, 95, 105, 255]);
        let diff = compare_images(&a, &b).unwrap();
        assert_eq!(diff.changed_pixels, 0);
        assert_eq!(diff.score, 100.0);
    }

    #[test]
    fn test_single_changed_pixel() {
        let a = solid_png(4, 4, [0, 0, 0, 255]);
        let mut img = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255]));
        img.put_pixel(2, 2, Rgba([255, 255, 255, 255]));
        let mut b = Vec::new();
        img.write_to(&mut Cursor::new(&mut b), ImageFormat::Png).unwrap();

        let diff = compare_images(&a, &b).unwrap();
        assert_eq!(diff.changed_pixels, 1);
        assert_eq!(diff.total_pixels, 16);
        assert!((diff.score - 100.0 * 15.0 / 16.0).abs() < 1e-9);
        assert!(diff.overlay_png.is_some());
    }

    #[test]
    fn test_dimension_mismatch_resizes_current() {
        let a = solid_png(8, 8, [50, 50, 50, 255]);
        let b = solid_png(16, 16, [50, 50, 50, 255]);
        let diff = compare_images(&a, &b).unwrap();
        assert_eq!(diff.total_pixels, 64);
        assert_eq!(diff.changed_pixels, 0);
    }

    #[test]
    fn test_overlay_decodes_to_baseline_dimensions() {
        let a = solid_png(6, 4, [0, 0, 0, 255]);
        let b = solid_png(6, 4, [255, 255, 255, 255]);
        let diff = compare_images(&a, &b).unwrap();
        let overlay = image::load_from_memory(&diff.overlay_png.unwrap()).unwrap();
        assert_eq!(overlay.dimensions(), (6, 4));
    }
}
