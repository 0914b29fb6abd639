//! Local finishing filters: brightness, contrast, sharpness.
//!
//! Each filter blends the image with a "degenerate" version of itself using
//! a single factor: `out = degenerate + factor * (image - degenerate)`.
//!
//! | Filter     | Degenerate image                                   |
//! |------------|----------------------------------------------------|
//! | brightness | black                                              |
//! | contrast   | flat grey at the rounded mean luma                 |
//! | sharpness  | 3×3 smoothing (`1 1 1 / 1 5 1 / 1 1 1`, ÷13), border pixels unchanged |
//!
//! A factor of 1.0 returns the input untouched. Factors below 1.0 move
//! towards the degenerate image, above 1.0 away from it. Alpha is never
//! modified. Results are clamped to `0..=255` and truncated toward zero,
//! so half levels go down as they do in the usual imaging libraries.

use image::{DynamicImage, Rgba, RgbaImage};

/// Factors this close to 1.0 are treated as neutral.
const NEUTRAL_EPSILON: f32 = 1e-6;

fn is_neutral(factor: f32) -> bool {
    (factor - 1.0).abs() < NEUTRAL_EPSILON
}

/// Apply contrast then sharpness to a cutout, returning RGBA8.
pub fn finish(img: &DynamicImage, contrast_factor: f32, sharpness_factor: f32) -> DynamicImage {
    let rgba = img.to_rgba8();
    let rgba = contrast_rgba(&rgba, contrast_factor);
    let rgba = sharpness_rgba(&rgba, sharpness_factor);
    DynamicImage::ImageRgba8(rgba)
}

/// Brightness: blend with black.
pub fn brightness(img: &DynamicImage, factor: f32) -> DynamicImage {
    if is_neutral(factor) {
        return img.clone();
    }
    let src = img.to_rgba8();
    let out = blend_with(&src, factor, |_, _, _| 0.0);
    DynamicImage::ImageRgba8(out)
}

/// Contrast: blend with a flat grey at the mean luma.
pub fn contrast(img: &DynamicImage, factor: f32) -> DynamicImage {
    if is_neutral(factor) {
        return img.clone();
    }
    DynamicImage::ImageRgba8(contrast_rgba(&img.to_rgba8(), factor))
}

/// Sharpness: blend with a smoothed copy.
pub fn sharpness(img: &DynamicImage, factor: f32) -> DynamicImage {
    if is_neutral(factor) {
        return img.clone();
    }
    DynamicImage::ImageRgba8(sharpness_rgba(&img.to_rgba8(), factor))
}

fn contrast_rgba(src: &RgbaImage, factor: f32) -> RgbaImage {
    if is_neutral(factor) {
        return src.clone();
    }
    let mean = mean_luma(src) as f32;
    blend_with(src, factor, |_, _, _| mean)
}

fn sharpness_rgba(src: &RgbaImage, factor: f32) -> RgbaImage {
    if is_neutral(factor) {
        return src.clone();
    }
    let smooth = smooth3x3(src);
    blend_with(src, factor, |x, y, c| smooth.get_pixel(x, y).0[c] as f32)
}

/// Blend RGB channels against `degenerate(x, y, channel)`; alpha copied.
fn blend_with<F>(src: &RgbaImage, factor: f32, degenerate: F) -> RgbaImage
where
    F: Fn(u32, u32, usize) -> f32,
{
    let (w, h) = src.dimensions();
    let mut out = RgbaImage::new(w, h);
    for (x, y, px) in src.enumerate_pixels() {
        let s = px.0;
        let mut p = [0u8, 0, 0, s[3]];
        for (c, slot) in p.iter_mut().enumerate().take(3) {
            let d = degenerate(x, y, c);
            *slot = (d + factor * (s[c] as f32 - d)).clamp(0.0, 255.0) as u8;
        }
        out.put_pixel(x, y, Rgba(p));
    }
    out
}

/// Rounded mean of ITU-R 601 luma over all pixels.
fn mean_luma(src: &RgbaImage) -> u8 {
    let count = u64::from(src.width()) * u64::from(src.height());
    if count == 0 {
        return 0;
    }
    let sum: u64 = src
        .pixels()
        .map(|p| {
            let [r, g, b, _] = p.0;
            (u64::from(r) * 299 + u64::from(g) * 587 + u64::from(b) * 114 + 500) / 1000
        })
        .sum();
    ((sum as f64 / count as f64) + 0.5).floor().min(255.0) as u8
}

/// 3×3 smoothing with centre weight 5; the one-pixel border is copied as is.
fn smooth3x3(src: &RgbaImage) -> RgbaImage {
    let (w, h) = src.dimensions();
    let mut out = src.clone();
    if w < 3 || h < 3 {
        return out;
    }
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut acc = [0u32; 3];
            for dy in 0..3 {
                for dx in 0..3 {
                    let weight = if dx == 1 && dy == 1 { 5 } else { 1 };
                    let p = src.get_pixel(x + dx - 1, y + dy - 1).0;
                    for c in 0..3 {
                        acc[c] += weight * u32::from(p[c]);
                    }
                }
            }
            let alpha = src.get_pixel(x, y).0[3];
            let px = [
                ((acc[0] + 6) / 13) as u8,
                ((acc[1] + 6) / 13) as u8,
                ((acc[2] + 6) / 13) as u8,
                alpha,
            ];
            out.put_pixel(x, y, Rgba(px));
        }
    }
    out
}
