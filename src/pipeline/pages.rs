//! Page conversion: stored document → ordered page images.
//!
//! Uploaded photos become a single page; PDFs go through the configured
//! [`PdfRasterizer`]. Either way every page leaving this module is decodable
//! and no longer than `max_image_edge` on its longest side, and there are at
//! most `max_pages` of them, sorted by page number.

use crate::config::PipelineConfig;
use crate::error::IngestError;
use crate::model::{DocumentKind, Ingestion, PageAsset};
use crate::pipeline::encode::{downscale_to_png, image_dimensions};
use crate::pipeline::rasterize::{PdfRasterizer, RasterizeRequest};
use crate::store::ObjectStorage;
use tracing::{debug, info, warn};

/// Produce the page images for an ingestion's stored document.
pub async fn convert_document(
    ingestion: &Ingestion,
    objects: &dyn ObjectStorage,
    rasterizer: Option<&dyn PdfRasterizer>,
    config: &PipelineConfig,
) -> Result<Vec<PageAsset>, IngestError> {
    let kind = DocumentKind::from_mime(&ingestion.file_mime).ok_or_else(|| {
        IngestError::Conversion(format!(
            "document type '{}' cannot be converted",
            ingestion.file_mime
        ))
    })?;

    let raw_pages = if kind.is_image() {
        let bytes = objects.get(&ingestion.storage_path).await?;
        vec![PageAsset::new(1, bytes, kind.mime())]
    } else {
        let rasterizer = rasterizer
            .ok_or_else(|| IngestError::Conversion("no PDF rasterizer configured".into()))?;
        let download = objects
            .signed_download_url(&ingestion.storage_path, config.download_ttl())
            .await?;
        let request = RasterizeRequest {
            download_url: download.url,
            storage_path: ingestion.storage_path.clone(),
            max_pages: config.max_pages,
            max_edge: config.max_image_edge,
        };
        rasterizer.rasterize(&request).await?
    };

    let pages = order_pages(raw_pages, config.max_pages)?;
    let max_edge = config.max_image_edge;

    let mut fitted = Vec::with_capacity(pages.len());
    for page in pages {
        let fitted_page = tokio::task::spawn_blocking(move || fit_page(page, max_edge))
            .await
            .map_err(|e| IngestError::Internal(format!("Resize task panicked: {e}")))??;
        fitted.push(fitted_page);
    }

    info!("Converted {} into {} page(s)", ingestion.storage_path, fitted.len());
    Ok(fitted)
}

/// Sort by page number, drop duplicate numbers, and cap at `max_pages`.
pub fn order_pages(mut pages: Vec<PageAsset>, max_pages: usize) -> Result<Vec<PageAsset>, IngestError> {
    pages.sort_by_key(|p| p.page);
    pages.dedup_by_key(|p| p.page);
    if pages.len() > max_pages {
        warn!(
            "Document has {} pages; keeping the first {}",
            pages.len(),
            max_pages
        );
        pages.truncate(max_pages);
    }
    if pages.is_empty() {
        return Err(IngestError::Conversion("document produced no pages".into()));
    }
    Ok(pages)
}

/// Pass a page through if it fits `max_edge`, else downscale it to PNG.
pub fn fit_page(page: PageAsset, max_edge: u32) -> Result<PageAsset, IngestError> {
    let (w, h) = image_dimensions(&page.bytes).map_err(|e| {
        IngestError::Conversion(format!("page {} is not a decodable image: {e}", page.page))
    })?;

    if w.max(h) <= max_edge {
        debug!("Page {}: {}x{} within limit", page.page, w, h);
        return Ok(page);
    }

    let png = downscale_to_png(&page.bytes, max_edge).map_err(|e| {
        IngestError::Conversion(format!("page {} could not be resized: {e}", page.page))
    })?;
    Ok(PageAsset::new(page.page, png, "image/png"))
}
