//! Pre-processing before the first remote call.
//!
//! Two optional, local steps:
//!
//! 1. **Shadow reveal** — a brightness boost so background removal can tell
//!    dark clothing from a dark background. Only applied above 1.0.
//! 2. **Pixel ceiling** — hosted upscalers refuse inputs above a pixel
//!    budget. Oversized photos are shrunk with Lanczos3 to fit it, keeping
//!    the aspect ratio within rounding.

use crate::pipeline::finish;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::{debug, info};

/// Result of pre-processing.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub image: DynamicImage,
    /// False when the photo passed through untouched, in which case the
    /// original upload bytes can be sent as they are.
    pub changed: bool,
}

/// Run both pre-processing steps.
pub fn preprocess(img: DynamicImage, shadow_reveal: f32, max_pixels: u64) -> Preprocessed {
    let mut changed = false;
    let mut image = img;

    if shadow_reveal > 1.0 {
        info!("Revealing shadows (brightness x{:.2})", shadow_reveal);
        image = reveal_shadows(&image, shadow_reveal);
        changed = true;
    }

    if exceeds_ceiling(&image, max_pixels) {
        image = limit_pixels(&image, max_pixels);
        changed = true;
    }

    Preprocessed { image, changed }
}

/// Brightness boost, returned as RGB like the camera photo it came from.
pub fn reveal_shadows(img: &DynamicImage, factor: f32) -> DynamicImage {
    let bright = finish::brightness(img, factor);
    DynamicImage::ImageRgb8(bright.to_rgb8())
}

fn exceeds_ceiling(img: &DynamicImage, max_pixels: u64) -> bool {
    max_pixels > 0 && u64::from(img.width()) * u64::from(img.height()) > max_pixels
}

/// Target dimensions with `w * h <= max_pixels` and the same aspect ratio.
pub fn fit_dimensions(width: u32, height: u32, max_pixels: u64) -> (u32, u32) {
    let pixels = u64::from(width) * u64::from(height);
    if max_pixels == 0 || pixels <= max_pixels {
        return (width, height);
    }
    let scale = (max_pixels as f64 / pixels as f64).sqrt();
    let mut w = ((f64::from(width) * scale).floor() as u32).max(1);
    let mut h = ((f64::from(height) * scale).floor() as u32).max(1);
    while u64::from(w) * u64::from(h) > max_pixels && (w > 1 || h > 1) {
        if w >= h {
            w -= 1;
        } else {
            h -= 1;
        }
    }
    (w, h)
}

/// Shrink an image so its pixel count is at most `max_pixels`.
pub fn limit_pixels(img: &DynamicImage, max_pixels: u64) -> DynamicImage {
    let (w, h) = fit_dimensions(img.width(), img.height(), max_pixels);
    if (w, h) == (img.width(), img.height()) {
        return img.clone();
    }
    debug!(
        "Downsampling {}x{} → {}x{} (ceiling {} px)",
        img.width(),
        img.height(),
        w,
        h,
        max_pixels
    );
    img.resize_exact(w, h, FilterType::Lanczos3)
}
