//! Error types for the menu ingestion pipeline.
//!
//! Every failure the pipeline can report is an [`IngestError`] variant, and
//! every variant maps to one stable machine-readable code via
//! [`IngestError::code`]. Callers at an HTTP or CLI boundary render errors
//! through [`ErrorBody`], which carries only the code and the human message.
//!
//! Two propagation regimes exist:
//!
//! * **Before a run starts** (validation, access, missing records) the error is
//!   returned directly and the ingestion record is not touched.
//! * **Once an ingestion is `processing`** the orchestrator catches the error,
//!   records it on the ingestion, marks it `failed`, and hands it back inside
//!   [`crate::process::RunOutcome::Failed`].
//!
//! A page whose extraction response cannot be parsed is *not* an error at all;
//! it degrades to an empty page (see [`crate::model::PageResult::parse_miss`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors returned by the menu ingestion pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    // ── Caller errors ─────────────────────────────────────────────────────
    /// A request field is missing or malformed.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The declared document type is not one we can digitise.
    #[error("Unsupported document type '{mime}'. Allowed: application/pdf, image/png, image/jpeg, image/webp")]
    UnsupportedMime { mime: String },

    /// The requested status change is not allowed by the ingestion lifecycle.
    #[error("Ingestion cannot move from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    /// Ingestion, menu or location does not exist.
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    /// Caller lacks a staff role on the location.
    #[error("You do not have permission to manage menus for this location")]
    Forbidden,

    /// Target menu belongs to a different tenant or location than the ingestion.
    #[error("Menu and ingestion belong to different locations")]
    TenantMismatch,

    /// Another run for the same ingestion is still in flight.
    #[error("Ingestion is already being processed")]
    Conflict,

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// Rasterisation failed, returned garbage, or no rasteriser is configured.
    #[error("Page conversion failed: {0}")]
    Conversion(String),

    /// The extraction service answered with a non-success status or the
    /// request never completed.
    #[error("Extraction failed for page {page}{}: {detail}", http_suffix(.status))]
    ExtractionTransport {
        page: u32,
        status: Option<u16>,
        detail: String,
    },

    /// An external call exceeded its deadline. The caller may retry.
    #[error("{operation} timed out after {secs}s")]
    Transient { operation: String, secs: u64 },

    /// Object storage or the ingestion store rejected a read or write.
    #[error("Storage operation '{op}' failed: {detail}")]
    Storage { op: &'static str, detail: String },

    /// The atomic catalog promotion failed; nothing was published.
    #[error("Publish failed: {0}")]
    Publish(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Validation(_)
            | IngestError::UnsupportedMime { .. }
            | IngestError::InvalidTransition { .. } => "validation",
            IngestError::NotFound { .. } => "not_found",
            IngestError::Forbidden => "forbidden",
            IngestError::TenantMismatch => "tenant_mismatch",
            IngestError::Conflict => "conflict",
            IngestError::Conversion(_) => "conversion_failure",
            IngestError::ExtractionTransport { .. } => "extraction_transport_failure",
            IngestError::Transient { .. } => "transient",
            IngestError::Storage { .. } => "storage_failure",
            IngestError::Publish(_) => "publish_failure",
            IngestError::Internal(_) => "unhandled",
        }
    }

    /// Whether repeating the same call has a reasonable chance of success.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Transient { .. } | IngestError::Conflict => true,
            IngestError::ExtractionTransport { status, .. } => {
                matches!(status, None | Some(408) | Some(429) | Some(500..=599))
            }
            _ => false,
        }
    }

    /// Caller errors are returned without touching ingestion state.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self.code(),
            "validation" | "not_found" | "forbidden" | "tenant_mismatch" | "conflict"
        )
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }

    pub(crate) fn storage(op: &'static str, detail: impl std::fmt::Display) -> Self {
        IngestError::Storage {
            op,
            detail: detail.to_string(),
        }
    }
}

fn http_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

/// User-visible error rendering: a stable code plus a human message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&IngestError> for ErrorBody {
    fn from(e: &IngestError) -> Self {
        e.to_body()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(IngestError::Validation("x".into()).code(), "validation");
        assert_eq!(
            IngestError::UnsupportedMime {
                mime: "text/plain".into()
            }
            .code(),
            "validation"
        );
        assert_eq!(IngestError::NotFound { entity: "Menu" }.code(), "not_found");
        assert_eq!(IngestError::Forbidden.code(), "forbidden");
        assert_eq!(IngestError::Conversion("x".into()).code(), "conversion_failure");
        assert_eq!(IngestError::TenantMismatch.code(), "tenant_mismatch");
        assert_eq!(IngestError::Publish("x".into()).code(), "publish_failure");
        assert_eq!(IngestError::Internal("x".into()).code(), "unhandled");
        assert_eq!(IngestError::storage("put_object", "disk full").code(), "storage_failure");
    }

    #[test]
    fn transport_display_with_status() {
        let e = IngestError::ExtractionTransport {
            page: 3,
            status: Some(502),
            detail: "bad gateway".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("page 3"), "got: {msg}");
        assert!(msg.contains("HTTP 502"), "got: {msg}");
        assert!(e.is_retryable());
    }

    #[test]
    fn transport_display_without_status() {
        let e = IngestError::ExtractionTransport {
            page: 1,
            status: None,
            detail: "connection reset".into(),
        };
        assert!(!e.to_string().contains("HTTP"));
        assert_eq!(e.code(), "extraction_transport_failure");
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let e = IngestError::ExtractionTransport {
            page: 1,
            status: Some(400),
            detail: "bad schema".into(),
        };
        assert!(!e.is_retryable());
        assert!(!IngestError::Forbidden.is_retryable());
    }

    #[test]
    fn body_carries_code_and_message() {
        let body = IngestError::Transient {
            operation: "extraction of page 2".into(),
            secs: 120,
        }
        .to_body();
        assert_eq!(body.code, "transient");
        assert!(body.message.contains("120s"));
    }

    #[test]
    fn caller_errors_are_classified() {
        assert!(IngestError::Forbidden.is_caller_error());
        assert!(IngestError::Conflict.is_caller_error());
        assert!(!IngestError::Conversion("x".into()).is_caller_error());
    }
}
