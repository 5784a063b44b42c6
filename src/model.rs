//! Data types flowing through the ingestion pipeline.
//!
//! ```text
//! Ingestion ──▶ PageAsset ──▶ ExtractionPayload ──▶ StagingRow ──▶ MergeResult
//!  (record)     (per page)    (per page, raw)       (candidate)    (per run)
//! ```
//!
//! Only [`Ingestion`] and [`StagingRow`] are persisted. [`PageAsset`] lives for
//! one orchestrator run and [`MergeResult`] is derived fresh on every run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ── Identity & access ─────────────────────────────────────────────────────

/// The authenticated user issuing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
}

impl Actor {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id }
    }
}

/// A restaurant location and the tenant that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub tenant_id: Uuid,
}

// ── Document kinds ────────────────────────────────────────────────────────

/// Document types accepted at intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Png,
    Jpeg,
    Webp,
}

impl DocumentKind {
    /// Parse a declared MIME type. `image/jpg` is accepted as an alias.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "application/pdf" => Some(DocumentKind::Pdf),
            "image/png" => Some(DocumentKind::Png),
            "image/jpeg" | "image/jpg" => Some(DocumentKind::Jpeg),
            "image/webp" => Some(DocumentKind::Webp),
            _ => None,
        }
    }

    /// Canonical MIME type.
    pub fn mime(self) -> &'static str {
        match self {
            DocumentKind::Pdf => "application/pdf",
            DocumentKind::Png => "image/png",
            DocumentKind::Jpeg => "image/jpeg",
            DocumentKind::Webp => "image/webp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Png => "png",
            DocumentKind::Jpeg => "jpg",
            DocumentKind::Webp => "webp",
        }
    }

    pub fn is_image(self) -> bool {
        !matches!(self, DocumentKind::Pdf)
    }
}

// ── Ingestion lifecycle ───────────────────────────────────────────────────

/// Lifecycle status of an ingestion.
///
/// ```text
/// uploaded ──▶ processing ──▶ awaiting_review ──▶ published
///                 │   ▲             │    │
///                 ▼   └── rerun ────┘    │
///               failed ◀─────────────────┘
///                 └──── rerun ──▶ processing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Uploaded,
    Processing,
    AwaitingReview,
    Published,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Uploaded => "uploaded",
            IngestionStatus::Processing => "processing",
            IngestionStatus::AwaitingReview => "awaiting_review",
            IngestionStatus::Published => "published",
            IngestionStatus::Failed => "failed",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Re-entering `processing` from `awaiting_review` or `failed` is only
    /// legal for an explicit rerun; callers check that separately.
    pub fn can_transition_to(self, next: IngestionStatus) -> bool {
        use IngestionStatus::*;
        matches!(
            (self, next),
            (Uploaded, Processing)
                | (Processing, AwaitingReview)
                | (Processing, Failed)
                | (AwaitingReview, Processing)
                | (AwaitingReview, Published)
                | (AwaitingReview, Failed)
                | (Failed, Processing)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == IngestionStatus::Published
    }
}

impl std::fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a page preview image was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePreview {
    pub page: u32,
    pub path: String,
    pub content_type: String,
    pub bytes: usize,
}

/// Bookkeeping attached to an ingestion. Unknown keys written by other
/// systems survive a load/save round trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceBuckets>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pages: Vec<PagePreview>,
    /// Pages whose extraction response could not be parsed and were
    /// counted as empty.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parse_misses: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_price_cents: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_threshold_cents: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_by: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_menu_id: Option<Uuid>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One tracked attempt to digitise a single uploaded menu document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingestion {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub storage_path: String,
    pub file_mime: String,
    pub status: IngestionStatus,
    pub currency: Option<String>,
    pub metadata: IngestionMetadata,
    /// Failure descriptions, oldest first.
    pub errors: Vec<String>,
    pub items_count: usize,
    pub raw_text: Option<String>,
    pub structured: Option<StructuredMenu>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ingestion {
    pub fn new(
        id: Uuid,
        location: &Location,
        storage_path: String,
        kind: DocumentKind,
        currency: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            tenant_id: location.tenant_id,
            location_id: location.id,
            storage_path,
            file_mime: kind.mime().to_string(),
            status: IngestionStatus::Uploaded,
            currency,
            metadata: IngestionMetadata::default(),
            errors: Vec::new(),
            items_count: 0,
            raw_text: None,
            structured: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, enforcing the lifecycle.
    pub fn transition(&mut self, next: IngestionStatus) -> Result<(), crate::error::IngestError> {
        if !self.status.can_transition_to(next) {
            return Err(crate::error::IngestError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn belongs_to(&self, location: &Location) -> bool {
        self.location_id == location.id && self.tenant_id == location.tenant_id
    }
}

// ── Pages ─────────────────────────────────────────────────────────────────

/// One raster image of one document page. Owned by a single run.
#[derive(Clone, PartialEq, Eq)]
pub struct PageAsset {
    /// 1-indexed page number.
    pub page: u32,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub preview_path: Option<String>,
}

impl PageAsset {
    pub fn new(page: u32, bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            page,
            bytes,
            content_type: content_type.into(),
            preview_path: None,
        }
    }
}

impl std::fmt::Debug for PageAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageAsset")
            .field("page", &self.page)
            .field("bytes", &self.bytes.len())
            .field("content_type", &self.content_type)
            .field("preview_path", &self.preview_path)
            .finish()
    }
}

// ── Extraction payload (as returned by the vision service) ────────────────

/// Structured output requested from the extraction service for one page.
///
/// Deserialisation is lenient about everything except the presence of
/// `categories`: prices may arrive as strings and lists as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionPayload {
    #[serde(default = "unknown_currency")]
    pub currency: String,
    pub categories: Vec<ExtractedCategory>,
}

impl ExtractionPayload {
    /// The payload a page degrades to when its response cannot be parsed.
    pub fn empty() -> Self {
        Self {
            currency: unknown_currency(),
            categories: Vec::new(),
        }
    }

    pub fn item_count(&self) -> usize {
        self.categories.iter().map(|c| c.items.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedCategory {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub items: Vec<ExtractedItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItem {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub allergens: Vec<String>,
    #[serde(default)]
    pub is_alcohol: Option<bool>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub confidence: Option<f64>,
}

/// ISO 4217 "no currency" code.
pub const UNKNOWN_CURRENCY: &str = "XXX";

fn unknown_currency() -> String {
    UNKNOWN_CURRENCY.to_string()
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accept `12.5`, `"12.50"`, `"$12.50"` and `null`. Anything else is `None`.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    };
    Ok(parsed.filter(|v| v.is_finite()))
}

/// Extraction output for one page, tagged with its page number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub page: u32,
    pub payload: ExtractionPayload,
    /// True when the response could not be parsed and `payload` is the
    /// empty fallback.
    #[serde(default)]
    pub parse_miss: bool,
}

impl PageResult {
    pub fn parsed(page: u32, payload: ExtractionPayload) -> Self {
        Self {
            page,
            payload,
            parse_miss: false,
        }
    }

    pub fn degraded(page: u32) -> Self {
        Self {
            page,
            payload: ExtractionPayload::empty(),
            parse_miss: true,
        }
    }
}

// ── Staging rows ──────────────────────────────────────────────────────────

/// Review markers attached to a staged row.
///
/// Flags only accumulate: merging two rows takes the union of both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RowFlags {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub low_confidence: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub missing_price: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub high_price: bool,
    /// Threshold the price was compared against when `high_price` was set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_threshold_cents: Option<f64>,
}

impl RowFlags {
    pub fn union(&mut self, other: &RowFlags) {
        self.low_confidence |= other.low_confidence;
        self.missing_price |= other.missing_price;
        self.high_price |= other.high_price;
        self.price_threshold_cents = match (self.price_threshold_cents, other.price_threshold_cents) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn is_empty(&self) -> bool {
        *self == RowFlags::default()
    }
}

/// One candidate menu item pending human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRow {
    pub category: Option<String>,
    pub name: String,
    pub description: Option<String>,
    /// Price in minor currency units; `None` when extraction gave no price.
    pub price_cents: Option<i64>,
    pub currency: String,
    #[serde(default)]
    pub allergens: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_alcohol: bool,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub flags: RowFlags,
    /// Pages this item was seen on.
    #[serde(default)]
    pub source_pages: Vec<u32>,
}

// ── Merge output ──────────────────────────────────────────────────────────

/// Histogram of staged rows by extraction confidence.
///
/// The `ge_*` bins are cumulative: a 0.92 row counts in all three of them.
/// `lt_55` is the complement of `ge_55`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceBuckets {
    pub ge_90: usize,
    pub ge_75: usize,
    pub ge_55: usize,
    pub lt_55: usize,
}

impl ConfidenceBuckets {
    /// Count one row; a missing confidence counts as 0.
    pub fn record(&mut self, confidence: Option<f64>) {
        let c = confidence.unwrap_or(0.0);
        if c >= 0.90 {
            self.ge_90 += 1;
        }
        if c >= 0.75 {
            self.ge_75 += 1;
        }
        if c >= 0.55 {
            self.ge_55 += 1;
        } else {
            self.lt_55 += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.ge_55 + self.lt_55
    }
}

/// Category → items projection of the merged rows, prices in major units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredMenu {
    pub currency: String,
    pub categories: Vec<StructuredCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredCategory {
    pub name: String,
    pub items: Vec<StructuredItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredItem {
    pub name: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: String,
    pub allergens: Vec<String>,
    pub tags: Vec<String>,
    pub is_alcohol: bool,
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "RowFlags::is_empty", default)]
    pub flags: RowFlags,
}

/// Deduplicated, flagged, sorted result of merging every page of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub rows: Vec<StagingRow>,
    pub items_count: usize,
    /// One `category :: name :: price currency` line per row.
    pub raw_text: String,
    pub structured: StructuredMenu,
    pub confidence: ConfidenceBuckets,
    pub max_price_cents: Option<i64>,
    /// Threshold used for high-price flagging; `None` when no row had a price.
    pub price_threshold_cents: Option<f64>,
    /// Document-level currency after resolution.
    pub currency: String,
}

// ── Lifecycle events ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Processing,
    AwaitingReview,
    Failed,
    Published,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Processing => "processing",
            EventKind::AwaitingReview => "awaiting_review",
            EventKind::Failed => "failed",
            EventKind::Published => "published",
        }
    }
}

/// Audit record emitted at each major state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub ingestion_id: Uuid,
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub kind: EventKind,
    pub actor: Option<Uuid>,
    pub detail: Value,
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(ingestion: &Ingestion, kind: EventKind, actor: Option<&Actor>, detail: Value) -> Self {
        Self {
            ingestion_id: ingestion.id,
            tenant_id: ingestion.tenant_id,
            location_id: ingestion.location_id,
            kind,
            actor: actor.map(|a| a.user_id),
            detail,
            at: Utc::now(),
        }
    }
}

// ── Request / response shapes ─────────────────────────────────────────────

/// Start a new ingestion or resume an existing one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeRequest {
    #[serde(default)]
    pub ingestion_id: Option<Uuid>,
    pub location_id: Uuid,
    #[serde(default)]
    pub original_filename: Option<String>,
    #[serde(default)]
    pub file_mime: Option<String>,
    /// Defaults to `true` for a new ingestion and `false` on resume.
    #[serde(default)]
    pub request_signed_upload: Option<bool>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeResponse {
    pub ingestion_id: Uuid,
    pub status: IngestionStatus,
    pub upload_url: Option<String>,
    pub upload_expires_at: Option<DateTime<Utc>>,
    pub storage_path: String,
    pub file_mime: Option<String>,
    pub currency: Option<String>,
    pub metadata: Option<IngestionMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub ingestion_id: Uuid,
    #[serde(default)]
    pub rerun: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub ok: bool,
    pub items_count: usize,
    pub pages_processed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub ingestion_id: Uuid,
    pub menu_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub published: bool,
    pub items_upserted: usize,
    pub categories_created: usize,
    pub version: u32,
}

/// A time-boxed URL for uploading or downloading one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}
