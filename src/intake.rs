//! Intake: create an ingestion record or resume an existing one.
//!
//! A fresh intake validates the declared document type, allocates the
//! storage path `{tenant}/{ingestion}/{sanitised-filename}`, signs the upload
//! URL, then persists the record as `uploaded` and emits `started`.
//! Resuming only re-reads the record and, while it is still `uploaded`, can
//! reissue an upload URL for the same path.

use crate::config::PipelineConfig;
use crate::error::IngestError;
use crate::merge::normalize_currency;
use crate::model::{
    Actor, DocumentKind, EventKind, Ingestion, IngestionStatus, IntakeRequest, IntakeResponse,
    LifecycleEvent, Location, SignedUrl,
};
use crate::store::{authorize, emit_best_effort, Backends};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

const MAX_STEM_LEN: usize = 80;

pub struct IntakeService {
    config: PipelineConfig,
    backends: Backends,
}

impl IntakeService {
    pub fn new(config: PipelineConfig, backends: Backends) -> Self {
        Self { config, backends }
    }

    /// Start or resume an ingestion for `request.location_id`.
    pub async fn start(
        &self,
        actor: &Actor,
        request: IntakeRequest,
    ) -> Result<IntakeResponse, IngestError> {
        let location = authorize(self.backends.access.as_ref(), actor, request.location_id).await?;

        match request.ingestion_id {
            Some(id) => self.resume(id, &location, &request).await,
            None => self.create(actor, &location, &request).await,
        }
    }

    async fn resume(
        &self,
        id: Uuid,
        location: &Location,
        request: &IntakeRequest,
    ) -> Result<IntakeResponse, IngestError> {
        let ingestion = self
            .backends
            .ingestions
            .load_ingestion(id)
            .await?
            .ok_or(IngestError::NotFound { entity: "Ingestion" })?;
        // Another location's ingestion is indistinguishable from a missing one.
        if !ingestion.belongs_to(location) {
            return Err(IngestError::NotFound { entity: "Ingestion" });
        }

        let upload = if request.request_signed_upload.unwrap_or(false)
            && ingestion.status == IngestionStatus::Uploaded
        {
            Some(self.upload_url(&ingestion.storage_path).await?)
        } else {
            None
        };

        debug!("Resumed ingestion {} ({})", ingestion.id, ingestion.status);
        Ok(response(&ingestion, upload))
    }

    async fn create(
        &self,
        actor: &Actor,
        location: &Location,
        request: &IntakeRequest,
    ) -> Result<IntakeResponse, IngestError> {
        let declared = request
            .file_mime
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| IngestError::Validation("file_mime is required".into()))?;
        let kind = DocumentKind::from_mime(declared).ok_or_else(|| IngestError::UnsupportedMime {
            mime: declared.to_string(),
        })?;

        let currency = match request.currency.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(code) => Some(normalize_currency(code).ok_or_else(|| {
                IngestError::Validation(format!("currency must be a three-letter code, got '{code}'"))
            })?),
        };

        let id = Uuid::new_v4();
        let filename = sanitize_filename(
            request.original_filename.as_deref(),
            kind,
            Utc::now().timestamp_millis(),
        );
        let storage_path = format!("{}/{}/{}", location.tenant_id, id, filename);

        // Sign before persisting so a storage outage leaves no orphan record.
        let upload = if request.request_signed_upload.unwrap_or(true) {
            Some(self.upload_url(&storage_path).await?)
        } else {
            None
        };

        let mut ingestion = Ingestion::new(id, location, storage_path, kind, currency);
        ingestion.metadata.original_filename = request.original_filename.clone();
        self.backends.ingestions.insert_ingestion(&ingestion).await?;

        info!("Ingestion {} started at {}", ingestion.id, ingestion.storage_path);
        emit_best_effort(
            self.backends.events.as_ref(),
            LifecycleEvent::new(
                &ingestion,
                EventKind::Started,
                Some(actor),
                json!({ "storage_path": ingestion.storage_path, "file_mime": ingestion.file_mime }),
            ),
        )
        .await;

        Ok(response(&ingestion, upload))
    }

    async fn upload_url(&self, path: &str) -> Result<SignedUrl, IngestError> {
        self.backends
            .objects
            .signed_upload_url(path, self.config.upload_ttl())
            .await
    }
}

fn response(ingestion: &Ingestion, upload: Option<SignedUrl>) -> IntakeResponse {
    let (upload_url, upload_expires_at) = match upload {
        Some(u) => (Some(u.url), Some(u.expires_at)),
        None => (None, None),
    };
    IntakeResponse {
        ingestion_id: ingestion.id,
        status: ingestion.status,
        upload_url,
        upload_expires_at,
        storage_path: ingestion.storage_path.clone(),
        file_mime: Some(ingestion.file_mime.clone()),
        currency: ingestion.currency.clone(),
        metadata: Some(ingestion.metadata.clone()),
    }
}

/// Storage-safe filename: the lower-cased stem with runs of anything other
/// than `a-z0-9` collapsed to `-`, plus the canonical extension for `kind`.
/// An empty stem becomes `menu-{timestamp_ms}`.
pub fn sanitize_filename(original: Option<&str>, kind: DocumentKind, timestamp_ms: i64) -> String {
    let base = original
        .unwrap_or("")
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("");
    let stem = match base.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => base,
    };

    let lowered = stem.to_lowercase();
    let collapsed = NON_ALNUM.replace_all(&lowered, "-");
    let mut cleaned: String = collapsed.trim_matches('-').chars().take(MAX_STEM_LEN).collect();
    cleaned = cleaned.trim_end_matches('-').to_string();

    if cleaned.is_empty() {
        cleaned = format!("menu-{timestamp_ms}");
    }
    format!("{}.{}", cleaned, kind.extension())
}
