//! Pure image helpers: pixel-budget downscaling and the content check.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

/// Target size for an image of `width x height` under `max_pixels`.
/// Only ever shrinks; keeps the aspect ratio within one pixel of rounding.
pub fn fit_dimensions(width: u32, height: u32, max_pixels: u64) -> (u32, u32) {
    let area = u64::from(width) * u64::from(height);
    if area == 0 || area <= max_pixels || max_pixels == 0 {
        return (width, height);
    }

    let scale = (max_pixels as f64 / area as f64).sqrt();
    let mut w = ((f64::from(width) * scale).floor() as u32).max(1);
    let mut h = ((f64::from(height) * scale).floor() as u32).max(1);

    // Float error, or the 1px floor on a very thin image, can leave us over.
    if u64::from(w) * u64::from(h) > max_pixels {
        if w >= h {
            w = ((max_pixels / u64::from(h)) as u32).max(1);
        } else {
            h = ((max_pixels / u64::from(w)) as u32).max(1);
        }
    }
    (w, h)
}

pub fn fit_pixel_budget(image: &DynamicImage, max_pixels: u64) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (w, h) = fit_dimensions(width, height, max_pixels);
    if (w, h) == (width, height) {
        return image.clone();
    }
    log::debug!("[CAPTURE] Downscaling {}x{} -> {}x{}", width, height, w, h);
    image.resize_exact(w, h, FilterType::Lanczos3)
}

/// Whether the image has a non-empty bounding box: some pixel with non-zero
/// alpha (images with alpha) or a non-zero channel (images without).
pub fn has_content(image: &DynamicImage) -> bool {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return false;
    }
    if image.color().has_alpha() {
        image.to_rgba8().pixels().any(|p| p.0[3] != 0)
    } else {
        image.to_rgb8().pixels().any(|p| p.0.iter().any(|&c| c != 0))
    }
}
