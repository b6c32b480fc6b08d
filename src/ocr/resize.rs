//! Resize images to the patch grid the vision encoder expects.

use anyhow::Result;
use image::{imageops::FilterType, DynamicImage};

/// Side lengths must be multiples of this (14 px patches merged 2x2).
pub const IMAGE_FACTOR: u32 = 28;
const MAX_ASPECT_RATIO: f64 = 200.0;

fn round_by_factor(n: f64, factor: u32) -> u32 {
    ((n / factor as f64).round() as u32) * factor
}

fn ceil_by_factor(n: f64, factor: u32) -> u32 {
    ((n / factor as f64).ceil() as u32) * factor
}

fn floor_by_factor(n: f64, factor: u32) -> u32 {
    ((n / factor as f64).floor() as u32) * factor
}

/// Compute `(height, width)` such that both are divisible by `factor`, the
/// pixel count lies within `[min_pixels, max_pixels]` and the aspect ratio is
/// kept as close as possible.
pub fn smart_resize(
    height: u32,
    width: u32,
    factor: u32,
    min_pixels: u32,
    max_pixels: u32,
) -> Result<(u32, u32)> {
    if height == 0 || width == 0 {
        anyhow::bail!("Image has zero size ({}x{})", width, height);
    }

    let (h, w) = (height as f64, width as f64);
    let ratio = h.max(w) / h.min(w);
    if ratio > MAX_ASPECT_RATIO {
        anyhow::bail!(
            "Absolute aspect ratio must be smaller than {}, got {:.1}",
            MAX_ASPECT_RATIO,
            ratio
        );
    }

    let mut h_bar = factor.max(round_by_factor(h, factor));
    let mut w_bar = factor.max(round_by_factor(w, factor));
    let area = h_bar as u64 * w_bar as u64;

    if area > max_pixels as u64 {
        let beta = ((h * w) / max_pixels as f64).sqrt();
        h_bar = factor.max(floor_by_factor(h / beta, factor));
        w_bar = factor.max(floor_by_factor(w / beta, factor));
    } else if area < min_pixels as u64 {
        let beta = (min_pixels as f64 / (h * w)).sqrt();
        h_bar = ceil_by_factor(h * beta, factor);
        w_bar = ceil_by_factor(w * beta, factor);
    }

    Ok((h_bar, w_bar))
}

/// Resize `image` onto the model's grid. Returns the image unchanged when it
/// already fits.
pub fn fit_to_grid(image: &DynamicImage, min_pixels: u32, max_pixels: u32) -> Result<DynamicImage> {
    let (height, width) = smart_resize(
        image.height(),
        image.width(),
        IMAGE_FACTOR,
        min_pixels,
        max_pixels,
    )?;

    if height == image.height() && width == image.width() {
        return Ok(image.clone());
    }
    Ok(image.resize_exact(width, height, FilterType::CatmullRom))
}
