//! # menu-ingest
//!
//! Turn an uploaded restaurant menu (a PDF or a photo) into structured,
//! priced, categorised catalog rows using a Vision Language Model, stage
//! them for human review, and publish the reviewed rows into a live menu.
//!
//! ## Why this crate?
//!
//! Menus are designed to be looked at, not parsed: multi-column layouts,
//! decorative fonts, prices floating beside dish names, sections spread over
//! several pages. OCR followed by heuristics gets the words but loses which
//! price belongs to which dish. Instead each page is rendered to an image and
//! a vision model is asked for JSON matching a strict schema. Everything the
//! model returns is treated as untrusted and normalised before staging.
//!
//! ## Lifecycle
//!
//! ```text
//! intake ──▶ uploaded ──▶ processing ──▶ awaiting_review ──▶ published
//!                              │  ▲              │
//!                              ▼  └── rerun ─────┘
//!                            failed ──── rerun ──▶ processing
//! ```
//!
//! 1. [`IntakeService`]: create (or resume) an ingestion and hand out a
//!    signed upload URL
//! 2. [`Processor`]: pages → vision extraction → merge → staged rows
//! 3. [`PublishService`]: atomically promote staged rows into a menu
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use menu_ingest::{
//!     Actor, IntakeRequest, IntakeService, MemoryBackend, PipelineConfig, ProcessRequest,
//!     Processor, ResponsesExtractor,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(MemoryBackend::new());
//!     let location = backend.add_location(uuid::Uuid::new_v4());
//!     let actor = Actor::new(uuid::Uuid::new_v4());
//!     backend.grant_staff(&actor, &location);
//!
//!     let config = PipelineConfig::default();
//!     let intake = IntakeService::new(config.clone(), backend.backends());
//!     let started = intake
//!         .start(&actor, IntakeRequest {
//!             location_id: location.id,
//!             file_mime: Some("image/jpeg".into()),
//!             original_filename: Some("dinner.jpg".into()),
//!             ..Default::default()
//!         })
//!         .await?;
//!     // ... upload the photo to `started.upload_url` ...
//!
//!     let extractor = Arc::new(ResponsesExtractor::from_env(&config)?);
//!     let processor = Processor::new(config, backend.backends(), extractor);
//!     let outcome = processor
//!         .process(&actor, ProcessRequest { ingestion_id: started.ingestion_id, rerun: false })
//!         .await?;
//!     println!("{} items staged", outcome.response().items_count);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `cli`    | on      | Enables the `menu-ingest` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `pdfium` | off     | In-process PDF rasterisation via pdfium-render instead of an HTTP rasteriser |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod intake;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompts;
pub mod publish;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{ErrorBody, IngestError};
pub use intake::IntakeService;
pub use merge::{merge_pages, MergeOptions};
pub use model::{
    Actor, DocumentKind, Ingestion, IngestionMetadata, IngestionStatus, IntakeRequest,
    IntakeResponse, LifecycleEvent, MergeResult, PageResult, ProcessRequest, ProcessResponse,
    PublishRequest, PublishResponse, StagingRow,
};
pub use pipeline::extract::{LlmExtractor, ResponsesExtractor, VisionExtractor};
pub use pipeline::rasterize::{HttpRasterizer, PdfRasterizer};
#[cfg(feature = "pdfium")]
pub use pipeline::rasterize::PdfiumRasterizer;
pub use process::{Processor, RunOutcome};
pub use progress::{NoopProgressCallback, ProgressCallback, RunProgressCallback};
pub use publish::PublishService;
pub use store::local::LocalDirStorage;
pub use store::memory::MemoryBackend;
pub use store::Backends;
