//! Image encoding: [`PageImage`] → base64 PNG wrapped in `ImageData`.
//!
//! Vision APIs accept images as base64 data embedded in the JSON request
//! body. PNG keeps Arabic glyphs and small digits crisp; JPEG artefacts on
//! rendered text degrade extraction of amounts and PO numbers.

use crate::document::PageImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page as a base64 PNG ready for the vision model.
///
/// `detail: "high"` lets GPT-4-class models use the full tile budget so
/// line-item tables stay legible.
pub fn encode_page(page: &PageImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    page.image
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Page {}: encoded image → {} bytes base64", page.page_num, b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}
