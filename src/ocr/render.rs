//! PDF rasterisation via pdfium.
//!
//! pdfium is not async-aware, so rendering runs on the blocking pool.

use anyhow::{Context, Result};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Pages rendered wider or taller than this at the requested DPI are
/// re-rendered at 72 DPI.
const MAX_RENDER_EDGE: f32 = 4500.0;
const BASE_DPI: f32 = 72.0;

/// Render every page of the PDF at `pdf_path`, in page order.
pub async fn render_pdf(
    pdf_path: &Path,
    dpi: u32,
    pdfium_lib_path: Option<PathBuf>,
) -> Result<Vec<DynamicImage>> {
    let path = pdf_path.to_path_buf();
    tokio::task::spawn_blocking(move || render_pdf_blocking(&path, dpi, pdfium_lib_path.as_deref()))
        .await
        .context("Render task panicked")?
}

fn bind_pdfium(lib_path: Option<&Path>) -> Result<Pdfium> {
    let bindings = match lib_path {
        Some(path) if path.is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
        }
        Some(path) => Pdfium::bind_to_library(path),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to bind to pdfium library: {:?}", e))?;
    Ok(Pdfium::new(bindings))
}

/// Scale factor for a page so that `dpi` is honoured unless the result would
/// exceed [`MAX_RENDER_EDGE`].
fn scale_for_page(width_pt: f32, height_pt: f32, dpi: u32) -> f32 {
    let scale = dpi as f32 / BASE_DPI;
    if width_pt * scale > MAX_RENDER_EDGE || height_pt * scale > MAX_RENDER_EDGE {
        1.0
    } else {
        scale
    }
}

fn render_pdf_blocking(
    pdf_path: &Path,
    dpi: u32,
    lib_path: Option<&Path>,
) -> Result<Vec<DynamicImage>> {
    let pdfium = bind_pdfium(lib_path)?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| anyhow::anyhow!("Failed to open PDF {:?}: {:?}", pdf_path, e))?;

    let pages = document.pages();
    info!("PDF loaded: {} pages", pages.len());

    let mut images = Vec::with_capacity(pages.len() as usize);
    for (idx, page) in pages.iter().enumerate() {
        let scale = scale_for_page(page.width().value, page.height().value, dpi);
        let config = PdfRenderConfig::new().scale_page_by_factor(scale);

        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| anyhow::anyhow!("Rasterisation failed for page {}: {:?}", idx + 1, e))?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} -> {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        images.push(image);
    }

    Ok(images)
}
