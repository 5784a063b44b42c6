//! External-facing stages of a processing run.
//!
//! Each submodule implements one transformation step, so stages can be
//! tested alone and backends (HTTP vs in-process rasteriser, Responses API
//! vs chat provider) swapped without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! stored document ──▶ pages ──▶ encode ──▶ extract ──▶ merge (crate::merge)
//!                     (rasterize / resize) (base64)    (vision service)
//! ```
//!
//! 1. [`pages`]: one image per page, capped in count and edge length;
//!    PDFs go through [`rasterize`]
//! 2. [`encode`]: PNG / base64 / data-URI helpers for request bodies
//! 3. [`extract`]: vision call with retry/backoff and defensive parsing;
//!    the only stage whose output is model-generated

pub mod encode;
pub mod extract;
pub mod pages;
pub mod rasterize;
