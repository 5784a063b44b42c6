//! Processing orchestrator: drive one ingestion to `awaiting_review` or `failed`.
//!
//! ```text
//! load + authorize ──▶ claim run ──▶ status=processing
//!        │
//!        ▼
//! convert pages ──▶ store previews ──▶ extract (bounded) ──▶ merge
//!                                                              │
//!     status=awaiting_review ◀── replace staged rows ◀─────────┘
//! ```
//!
//! Errors before the record enters `processing` (missing record, no access,
//! wrong status, a run already in flight) are returned as `Err` and leave
//! the record untouched. Once it is `processing`, every failure is caught
//! here: the message is appended to `errors`, the status becomes `failed`, a
//! `failed` event is emitted, and the caller receives
//! [`RunOutcome::Failed`]. Staged rows are replaced only after extraction
//! and merging succeed, so a failed rerun leaves the previous rows in place.

use crate::config::PipelineConfig;
use crate::error::IngestError;
use crate::merge::{merge_pages, MergeOptions};
use crate::model::{
    Actor, DocumentKind, EventKind, Ingestion, IngestionStatus, LifecycleEvent, MergeResult,
    PageAsset, PagePreview, PageResult, ProcessRequest, ProcessResponse, UNKNOWN_CURRENCY,
};
use crate::pipeline::extract::VisionExtractor;
use crate::pipeline::pages::convert_document;
use crate::pipeline::rasterize::PdfRasterizer;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::store::{emit_best_effort, Backends};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How a run that got as far as `processing` ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        response: ProcessResponse,
        merge: MergeResult,
    },
    /// The ingestion is now `failed`; `response.errors` is its error list.
    Failed {
        error: IngestError,
        response: ProcessResponse,
    },
}

impl RunOutcome {
    pub fn response(&self) -> &ProcessResponse {
        match self {
            RunOutcome::Completed { response, .. } | RunOutcome::Failed { response, .. } => response,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    pub fn into_result(self) -> Result<(ProcessResponse, MergeResult), IngestError> {
        match self {
            RunOutcome::Completed { response, merge } => Ok((response, merge)),
            RunOutcome::Failed { error, .. } => Err(error),
        }
    }
}

/// Ingestion ids with a run in flight in this process.
type ActiveRuns = Arc<Mutex<HashSet<Uuid>>>;

/// Releases its claim on drop, including on panic or early return.
struct RunGuard {
    active: ActiveRuns,
    id: Uuid,
}

impl RunGuard {
    fn acquire(active: &ActiveRuns, id: Uuid) -> Option<Self> {
        let mut set = active.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(id) {
            return None;
        }
        Some(Self {
            active: Arc::clone(active),
            id,
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

struct RunSuccess {
    merge: MergeResult,
    pages_processed: usize,
}

/// Runs the processing pipeline for ingestions.
pub struct Processor {
    config: PipelineConfig,
    backends: Backends,
    extractor: Arc<dyn VisionExtractor>,
    rasterizer: Option<Arc<dyn PdfRasterizer>>,
    progress: ProgressCallback,
    active: ActiveRuns,
}

impl Processor {
    pub fn new(config: PipelineConfig, backends: Backends, extractor: Arc<dyn VisionExtractor>) -> Self {
        Self {
            config,
            backends,
            extractor,
            rasterizer: None,
            progress: Arc::new(NoopProgressCallback),
            active: Arc::default(),
        }
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn PdfRasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process (or, with `rerun`, reprocess) one ingestion.
    pub async fn process(
        &self,
        actor: &Actor,
        request: ProcessRequest,
    ) -> Result<RunOutcome, IngestError> {
        self.config.validate()?;
        let mut ingestion = self.backends.load_authorized(actor, request.ingestion_id).await?;

        let _guard = RunGuard::acquire(&self.active, ingestion.id).ok_or(IngestError::Conflict)?;
        check_startable(ingestion.status, request.rerun)?;

        self.emit(&ingestion, EventKind::Processing, actor, json!({ "rerun": request.rerun }))
            .await;
        if ingestion.status != IngestionStatus::Processing {
            ingestion.transition(IngestionStatus::Processing)?;
        }
        let now = Utc::now();
        ingestion.updated_at = now;
        ingestion.metadata.processed_by = Some(actor.user_id);
        ingestion.metadata.processing_started_at = Some(now);
        ingestion.metadata.processing_finished_at = None;
        self.backends.ingestions.save_ingestion(&ingestion).await?;
        info!("Ingestion {}: processing started (rerun={})", ingestion.id, request.rerun);

        let pages_done = AtomicUsize::new(0);
        match self.run(&mut ingestion, actor, &pages_done).await {
            Ok(success) => {
                info!(
                    "Ingestion {}: {} items from {} pages, awaiting review",
                    ingestion.id, success.merge.items_count, success.pages_processed
                );
                Ok(RunOutcome::Completed {
                    response: ProcessResponse {
                        ok: true,
                        items_count: success.merge.items_count,
                        pages_processed: success.pages_processed,
                        errors: Vec::new(),
                    },
                    merge: success.merge,
                })
            }
            Err(e) => Ok(self
                .fail(&mut ingestion, actor, e, pages_done.load(Ordering::SeqCst))
                .await),
        }
    }

    async fn run(
        &self,
        ingestion: &mut Ingestion,
        actor: &Actor,
        pages_done: &AtomicUsize,
    ) -> Result<RunSuccess, IngestError> {
        // ── Convert ──
        let conversion = convert_document(
            ingestion,
            self.backends.objects.as_ref(),
            self.rasterizer.as_deref(),
            &self.config,
        );
        let mut pages = timeout(self.config.conversion_timeout(), conversion)
            .await
            .map_err(|_| IngestError::Transient {
                operation: "Page conversion".into(),
                secs: self.config.conversion_timeout_secs,
            })??;

        // ── Previews ──
        let previews = self.store_previews(ingestion, &mut pages).await?;

        // ── Extract ──
        let results = self.extract_all(&pages, pages_done).await?;
        let parse_misses: Vec<u32> = results.iter().filter(|r| r.parse_miss).map(|r| r.page).collect();
        if !parse_misses.is_empty() {
            warn!(
                "Ingestion {}: {} of {} pages could not be parsed: {:?}",
                ingestion.id,
                parse_misses.len(),
                results.len(),
                parse_misses
            );
        }

        // ── Merge + stage ──
        let options = MergeOptions::new(&self.config, ingestion.currency.as_deref());
        let merge = merge_pages(&results, &options);
        self.backends
            .ingestions
            .replace_staging_rows(ingestion.id, &merge.rows)
            .await?;

        // ── Record ──
        let mut updated = ingestion.clone();
        updated.transition(IngestionStatus::AwaitingReview)?;
        updated.items_count = merge.items_count;
        updated.raw_text = Some(merge.raw_text.clone());
        updated.structured = Some(merge.structured.clone());
        if merge.currency != UNKNOWN_CURRENCY {
            updated.currency = Some(merge.currency.clone());
        }
        updated.errors.clear();
        let meta = &mut updated.metadata;
        meta.confidence = Some(merge.confidence);
        meta.pages = previews;
        meta.parse_misses = parse_misses.clone();
        meta.max_price_cents = merge.max_price_cents;
        meta.price_threshold_cents = merge.price_threshold_cents;
        meta.processing_finished_at = Some(Utc::now());
        self.backends.ingestions.save_ingestion(&updated).await?;
        *ingestion = updated;

        let pages_processed = results.len();
        self.emit(
            ingestion,
            EventKind::AwaitingReview,
            actor,
            json!({
                "items_count": merge.items_count,
                "pages": pages_processed,
                "confidence": merge.confidence,
                "parse_misses": parse_misses,
            }),
        )
        .await;
        self.progress.on_run_complete(merge.items_count, pages_processed);

        Ok(RunSuccess {
            merge,
            pages_processed,
        })
    }

    /// Write each page image to `{tenant}/{ingestion}/pages/page-NNN.ext`.
    async fn store_previews(
        &self,
        ingestion: &Ingestion,
        pages: &mut [PageAsset],
    ) -> Result<Vec<PagePreview>, IngestError> {
        let mut previews = Vec::with_capacity(pages.len());
        for page in pages.iter_mut() {
            let path = preview_path(ingestion, page);
            self.backends
                .objects
                .put(&path, &page.bytes, &page.content_type)
                .await?;
            previews.push(PagePreview {
                page: page.page,
                path: path.clone(),
                content_type: page.content_type.clone(),
                bytes: page.bytes.len(),
            });
            page.preview_path = Some(path);
        }
        Ok(previews)
    }

    /// Extract every page with at most `extraction_concurrency` in flight.
    /// The first failure aborts the remaining pages.
    async fn extract_all(
        &self,
        pages: &[PageAsset],
        pages_done: &AtomicUsize,
    ) -> Result<Vec<PageResult>, IngestError> {
        let total = pages.len();
        let deadline = self.config.extraction_timeout();
        let secs = self.config.extraction_timeout_secs;
        let extractor = &self.extractor;
        let progress = &self.progress;

        progress.on_run_start(total);
        let mut results: Vec<PageResult> = stream::iter(pages.iter().map(|page| async move {
            progress.on_page_start(page.page, total);
            let outcome = match timeout(deadline, extractor.extract(page)).await {
                Ok(result) => result,
                Err(_) => Err(IngestError::Transient {
                    operation: format!("Extraction of page {}", page.page),
                    secs,
                }),
            };
            match outcome {
                Ok(result) => {
                    pages_done.fetch_add(1, Ordering::SeqCst);
                    progress.on_page_complete(page.page, total, result.payload.item_count());
                    Ok(result)
                }
                Err(e) => {
                    progress.on_page_error(page.page, total, &e.to_string());
                    Err(e)
                }
            }
        }))
        .buffer_unordered(self.config.extraction_concurrency)
        .try_collect()
        .await?;

        results.sort_by_key(|r| r.page);
        Ok(results)
    }

    async fn fail(
        &self,
        ingestion: &mut Ingestion,
        actor: &Actor,
        error: IngestError,
        pages_processed: usize,
    ) -> RunOutcome {
        error!("Ingestion {}: run failed: {}", ingestion.id, error);

        ingestion.errors.push(error.to_string());
        if let Err(e) = ingestion.transition(IngestionStatus::Failed) {
            warn!("Ingestion {}: {}", ingestion.id, e);
        }
        ingestion.metadata.failed_at = Some(Utc::now());
        if let Err(e) = self.backends.ingestions.save_ingestion(ingestion).await {
            error!("Ingestion {}: could not record failure: {}", ingestion.id, e);
        }

        self.emit(
            ingestion,
            EventKind::Failed,
            actor,
            serde_json::to_value(error.to_body()).unwrap_or(Value::Null),
        )
        .await;

        RunOutcome::Failed {
            response: ProcessResponse {
                ok: false,
                items_count: 0,
                pages_processed,
                errors: ingestion.errors.clone(),
            },
            error,
        }
    }

    async fn emit(&self, ingestion: &Ingestion, kind: EventKind, actor: &Actor, detail: Value) {
        emit_best_effort(
            self.backends.events.as_ref(),
            LifecycleEvent::new(ingestion, kind, Some(actor), detail),
        )
        .await;
    }
}

/// Whether a run may start from `status`.
fn check_startable(status: IngestionStatus, rerun: bool) -> Result<(), IngestError> {
    match status {
        IngestionStatus::Uploaded => Ok(()),
        IngestionStatus::Published => Err(IngestError::Validation(
            "Published ingestions cannot be processed again; start a new ingestion".into(),
        )),
        // A persisted `processing` with no live run here is a run that died.
        IngestionStatus::Processing | IngestionStatus::AwaitingReview | IngestionStatus::Failed
            if rerun =>
        {
            Ok(())
        }
        other => Err(IngestError::Validation(format!(
            "Ingestion is '{other}'; pass rerun=true to process it again"
        ))),
    }
}

fn preview_path(ingestion: &Ingestion, page: &PageAsset) -> String {
    let ext = DocumentKind::from_mime(&page.content_type)
        .filter(|k| k.is_image())
        .map(|k| k.extension())
        .unwrap_or("png");
    format!(
        "{}/{}/pages/page-{:03}.{}",
        ingestion.tenant_id, ingestion.id, page.page, ext
    )
}
