//! Page Source: rasterise the first `max_pages` pages via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is not safe to drive from async contexts. Rendering runs on
//! the blocking pool so Tokio workers never stall on CPU-heavy work.
//!
//! Failure to open the document is fatal. A page that fails to render is
//! skipped with a warning; its siblings are still returned.

use crate::config::ExtractionConfig;
use crate::document::PageImage;
use crate::error::PipelineError;
use pdfium_render::prelude::*;
use tracing::{debug, info, warn};

/// Rasterise up to `config.max_pages` pages, in document order.
pub async fn render_pages(
    bytes: Vec<u8>,
    config: &ExtractionConfig,
) -> Result<Vec<PageImage>, PipelineError> {
    let dpi = config.dpi;
    let max_pixels = config.max_rendered_pixels;
    let max_pages = config.max_pages;
    let password = config.password.clone();

    tokio::task::spawn_blocking(move || {
        render_pages_blocking(bytes, dpi, max_pixels, max_pages, password.as_deref())
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Render task panicked: {}", e)))?
}

/// Blocking implementation of page rendering.
fn render_pages_blocking(
    bytes: Vec<u8>,
    dpi: u32,
    max_pixels: u32,
    max_pages: usize,
    password: Option<&str>,
) -> Result<Vec<PageImage>, PipelineError> {
    let pdfium = Pdfium::default();

    let document = pdfium
        .load_pdf_from_byte_vec(bytes, password)
        .map_err(|e| open_error(format!("{:?}", e), password.is_some()))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    let page_count = total_pages.min(max_pages);
    info!(
        "Document loaded: {} pages, rendering {}",
        total_pages, page_count
    );

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(page_count);

    for idx in 0..page_count {
        let page_num = idx + 1;
        let page = match pages.get(idx as u16) {
            Ok(p) => p,
            Err(e) => {
                warn!("Skipping page {}: failed to load: {:?}", page_num, e);
                continue;
            }
        };

        let rendered = page.render_with_config(&render_config);
        match rendered {
            Ok(bitmap) => {
                let image = bitmap.as_image();
                debug!(
                    "Rendered page {} → {}x{} px",
                    page_num,
                    image.width(),
                    image.height()
                );
                results.push(PageImage { page_num, image });
            }
            Err(e) => warn!("Skipping page {}: rasterisation failed: {:?}", page_num, e),
        };
    }

    Ok(results)
}

/// Classify a pdfium open failure.
fn open_error(detail: String, had_password: bool) -> PipelineError {
    if detail.contains("Password") || detail.contains("password") {
        if had_password {
            PipelineError::WrongPassword
        } else {
            PipelineError::PasswordRequired
        }
    } else {
        PipelineError::DocumentOpenFailed { detail }
    }
}
