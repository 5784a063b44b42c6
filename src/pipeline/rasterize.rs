//! PDF rasterisation backends.
//!
//! ## Why a trait?
//!
//! Production deployments run rasterisation as a separate service (pdfium
//! with its C++ dependencies does not belong in every worker image), while a
//! developer laptop can render in-process. [`PdfRasterizer`] hides which one
//! is in use; the page converter only sees ordered [`PageAsset`]s.
//!
//! | Backend | When |
//! |---|---|
//! | [`HttpRasterizer`] | external service reachable over HTTP |
//! | `PdfiumRasterizer` | `pdfium` feature, libpdfium on this host |

use crate::error::IngestError;
use crate::model::PageAsset;
use crate::pipeline::encode::decode_base64_payload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Everything a rasteriser needs to locate and bound one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterizeRequest {
    /// Time-boxed URL the rasteriser may fetch the document from.
    pub download_url: String,
    /// Object-storage path of the same document.
    pub storage_path: String,
    pub max_pages: usize,
    pub max_edge: u32,
}

/// Turns a stored PDF into page images.
#[async_trait]
pub trait PdfRasterizer: Send + Sync {
    async fn rasterize(&self, request: &RasterizeRequest) -> Result<Vec<PageAsset>, IngestError>;
}

// ── HTTP rasteriser ───────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    url: &'a str,
    max_pages: usize,
    max_edge: u32,
}

#[derive(Deserialize)]
struct WireResponse {
    pages: Vec<WirePage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePage {
    page: u32,
    image_data: String,
    #[serde(default)]
    content_type: Option<String>,
}

/// Client for an external rasterisation service.
///
/// POSTs `{url, maxPages, maxEdge}` and expects
/// `{pages: [{page, imageData, contentType}]}` with base64 image data.
#[derive(Debug, Clone)]
pub struct HttpRasterizer {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpRasterizer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl PdfRasterizer for HttpRasterizer {
    async fn rasterize(&self, request: &RasterizeRequest) -> Result<Vec<PageAsset>, IngestError> {
        let body = WireRequest {
            url: &request.download_url,
            max_pages: request.max_pages,
            max_edge: request.max_edge,
        };
        let mut call = self.client.post(&self.endpoint).json(&body);
        if let Some(ref token) = self.bearer_token {
            call = call.bearer_auth(token);
        }

        let response = call
            .send()
            .await
            .map_err(|e| IngestError::Conversion(format!("rasterizer request failed: {e}")))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| IngestError::Conversion(format!("rasterizer response unreadable: {e}")))?;

        if !status.is_success() {
            let snippet: String = String::from_utf8_lossy(&bytes).chars().take(200).collect();
            return Err(IngestError::Conversion(format!(
                "rasterizer returned HTTP {}: {}",
                status.as_u16(),
                snippet
            )));
        }

        let pages = parse_rasterizer_response(&bytes)?;
        debug!("Rasterizer returned {} pages", pages.len());
        Ok(pages)
    }
}

/// Decode the rasteriser's JSON body into page assets.
pub fn parse_rasterizer_response(body: &[u8]) -> Result<Vec<PageAsset>, IngestError> {
    let wire: WireResponse = serde_json::from_slice(body)
        .map_err(|e| IngestError::Conversion(format!("malformed rasterizer response: {e}")))?;

    wire.pages
        .into_iter()
        .map(|p| {
            if p.page == 0 {
                return Err(IngestError::Conversion(
                    "rasterizer returned page number 0; pages are 1-indexed".into(),
                ));
            }
            let bytes = decode_base64_payload(&p.image_data).map_err(|e| {
                IngestError::Conversion(format!("page {}: invalid image data: {e}", p.page))
            })?;
            if bytes.is_empty() {
                return Err(IngestError::Conversion(format!("page {}: empty image", p.page)));
            }
            let content_type = p.content_type.unwrap_or_else(|| "image/png".to_string());
            Ok(PageAsset::new(p.page, bytes, content_type))
        })
        .collect()
}

// ── Local pdfium rasteriser ───────────────────────────────────────────────

#[cfg(feature = "pdfium")]
pub use local_pdfium::PdfiumRasterizer;

#[cfg(feature = "pdfium")]
mod local_pdfium {
    //! ## Why spawn_blocking?
    //!
    //! pdfium is a C++ library with thread-local state and CPU-heavy
    //! rendering. Running it on a Tokio worker would stall every other task on
    //! that worker, so rendering moves to the blocking pool.

    use super::{PdfRasterizer, RasterizeRequest};
    use crate::error::IngestError;
    use crate::model::PageAsset;
    use crate::pipeline::encode::encode_png;
    use crate::store::ObjectStorage;
    use async_trait::async_trait;
    use pdfium_render::prelude::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tracing::{debug, info};

    /// Renders PDFs in-process with libpdfium.
    ///
    /// The library is taken from `library_path`, else `PDFIUM_LIB_PATH`, else
    /// the system search path.
    pub struct PdfiumRasterizer {
        objects: Arc<dyn ObjectStorage>,
        library_path: Option<PathBuf>,
    }

    impl PdfiumRasterizer {
        pub fn new(objects: Arc<dyn ObjectStorage>) -> Self {
            Self {
                objects,
                library_path: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
            }
        }

        pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
            self.library_path = Some(path.into());
            self
        }
    }

    #[async_trait]
    impl PdfRasterizer for PdfiumRasterizer {
        async fn rasterize(
            &self,
            request: &RasterizeRequest,
        ) -> Result<Vec<PageAsset>, IngestError> {
            let bytes = self.objects.get(&request.storage_path).await?;
            let library_path = self.library_path.clone();
            let max_pages = request.max_pages;
            let max_edge = request.max_edge;

            tokio::task::spawn_blocking(move || {
                render_blocking(&bytes, library_path, max_pages, max_edge)
            })
            .await
            .map_err(|e| IngestError::Internal(format!("Render task panicked: {e}")))?
        }
    }

    fn render_blocking(
        pdf: &[u8],
        library_path: Option<PathBuf>,
        max_pages: usize,
        max_edge: u32,
    ) -> Result<Vec<PageAsset>, IngestError> {
        let bindings = match library_path {
            Some(ref path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| IngestError::Conversion(format!("pdfium unavailable: {e}")))?;
        let pdfium = Pdfium::new(bindings);

        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| IngestError::Conversion(format!("unreadable PDF: {e:?}")))?;
        let pages = document.pages();
        info!("PDF loaded: {} pages", pages.len());

        let render_config = PdfRenderConfig::new()
            .set_target_width(max_edge as i32)
            .set_maximum_height(max_edge as i32);

        let mut out = Vec::new();
        for (idx, page) in pages.iter().take(max_pages).enumerate() {
            let page_num = idx as u32 + 1;
            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                IngestError::Conversion(format!("page {page_num}: render failed: {e:?}"))
            })?;
            let image = bitmap.as_image();
            debug!("Rendered page {} → {}x{} px", page_num, image.width(), image.height());
            let png = encode_png(&image).map_err(|e| {
                IngestError::Conversion(format!("page {page_num}: PNG encode failed: {e}"))
            })?;
            out.push(PageAsset::new(page_num, png, "image/png"));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::encode::{data_uri, to_base64};
    use crate::pipeline::stub_http;
    use std::sync::atomic::Ordering;

    #[test]
    fn wire_request_is_camel_case() {
        let body = serde_json::to_value(WireRequest {
            url: "https://signed/doc.pdf",
            max_pages: 25,
            max_edge: 1200,
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"url": "https://signed/doc.pdf", "maxPages": 25, "maxEdge": 1200})
        );
    }

    #[test]
    fn parses_pages_with_and_without_data_uri() {
        let body = serde_json::json!({
            "pages": [
                {"page": 2, "imageData": data_uri(b"two", "image/jpeg"), "contentType": "image/jpeg"},
                {"page": 1, "imageData": to_base64(b"one")}
            ]
        });
        let pages = parse_rasterizer_response(body.to_string().as_bytes()).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].page, 2);
        assert_eq!(pages[0].bytes, b"two");
        assert_eq!(pages[0].content_type, "image/jpeg");
        assert_eq!(pages[1].content_type, "image/png");
    }

    #[test]
    fn malformed_payloads_are_conversion_failures() {
        for body in [
            r#"{"nope": []}"#,
            r#"not json"#,
            r#"{"pages": [{"page": 1, "imageData": "%%%"}]}"#,
            r#"{"pages": [{"page": 0, "imageData": "AAAA"}]}"#,
            r#"{"pages": [{"page": 1, "imageData": ""}]}"#,
        ] {
            let err = parse_rasterizer_response(body.as_bytes()).unwrap_err();
            assert_eq!(err.code(), "conversion_failure", "body: {body}");
        }
    }

    fn request() -> RasterizeRequest {
        RasterizeRequest {
            download_url: "https://signed/doc.pdf".into(),
            storage_path: "t/i/doc.pdf".into(),
            max_pages: 25,
            max_edge: 1200,
        }
    }

    #[tokio::test]
    async fn server_error_is_conversion_failure() {
        let (url, hits) = stub_http::serve(500, "renderer crashed").await;
        let rasterizer = HttpRasterizer::new(format!("{url}/rasterize"));

        let err = rasterizer.rasterize(&request()).await.unwrap_err();
        assert_eq!(err.code(), "conversion_failure");
        let message = err.to_string();
        assert!(message.contains("HTTP 500"), "{message}");
        assert!(message.contains("renderer crashed"), "{message}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pages_come_back_over_http() {
        let body = serde_json::json!({
            "pages": [{"page": 1, "imageData": to_base64(b"one"), "contentType": "image/png"}]
        });
        let (url, _) = stub_http::serve(200, body.to_string()).await;
        let rasterizer = HttpRasterizer::new(format!("{url}/rasterize")).with_bearer_token("secret");

        let pages = rasterizer.rasterize(&request()).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].bytes, b"one");
    }
}
