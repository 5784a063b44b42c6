//! Image encoding: page bytes ⇄ PNG, base64, data URIs and `ImageData`.
//!
//! Vision APIs take images as base64 embedded in the JSON request body.
//! Resized images are re-encoded as PNG because it is lossless: small price
//! digits survive, where JPEG artefacts turn "8" into "6".

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use std::io::Cursor;
use tracing::debug;

use crate::model::PageAsset;

/// Width and height of an encoded image, read from its header only.
pub fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32), image::ImageError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()
}

/// Encode a decoded image as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Decode `bytes`, shrink so the longest edge is `max_edge` (aspect kept),
/// and return PNG bytes.
pub fn downscale_to_png(bytes: &[u8], max_edge: u32) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let resized = img.resize(max_edge, max_edge, FilterType::Lanczos3);
    debug!(
        "Downscaled {}x{} → {}x{}",
        img.width(),
        img.height(),
        resized.width(),
        resized.height()
    );
    encode_png(&resized)
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// `data:<content_type>;base64,<payload>`
pub fn data_uri(bytes: &[u8], content_type: &str) -> String {
    format!("data:{};base64,{}", content_type, to_base64(bytes))
}

/// Decode base64 that may carry a `data:...;base64,` prefix.
pub fn decode_base64_payload(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let body = match payload.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => payload,
    };
    STANDARD.decode(body.trim())
}

/// Wrap a page for an `edgequake_llm` vision message.
///
/// `detail: "high"` lets GPT-4-class models tile the image; with "low" the
/// page is squeezed into one 512 px tile and small print is lost.
pub fn page_image_data(page: &PageAsset) -> ImageData {
    ImageData::new(to_base64(&page.bytes), page.content_type.as_str()).with_detail("high")
}
