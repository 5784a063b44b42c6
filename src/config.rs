//! Configuration for the menu ingestion pipeline.
//!
//! Every tunable lives in [`PipelineConfig`], which is passed explicitly to
//! each service at construction. Nothing is read from process-wide settings
//! after that point, so two services built from two configs never interfere.
//!
//! Build one via [`PipelineConfig::builder()`] or take
//! [`PipelineConfig::default()`]; setters clamp obviously bad values and
//! [`PipelineConfigBuilder::build`] rejects the rest. Deserialised configs go
//! through the same [`PipelineConfig::validate`] check.

use crate::error::IngestError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Configuration shared by intake, processing and publishing.
///
/// # Example
/// ```rust
/// use menu_ingest::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .max_pages(10)
///     .min_confidence(0.6)
///     .default_currency("EUR")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_image_edge, 1200);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, remote = "Self")]
pub struct PipelineConfig {
    /// Maximum number of pages converted per document. Default: 25.
    ///
    /// Menus longer than this are almost always catalogs or scans of the same
    /// page many times over; extra pages are dropped with a warning.
    pub max_pages: usize,

    /// Longest edge of a page image in pixels. Default: 1200.
    ///
    /// Rasterised PDF pages are rendered at this size and uploaded photos
    /// larger than this are downscaled before extraction.
    pub max_image_edge: u32,

    /// Items extracted with a confidence below this are flagged
    /// `low_confidence`. Default: 0.55.
    pub min_confidence: f64,

    /// Lifetime of a signed upload URL in seconds. Default: 900.
    pub upload_ttl_secs: u64,

    /// Lifetime of a signed download URL handed to the rasteriser. Default: 600.
    pub download_ttl_secs: u64,

    /// Upper bound for the statistical price-anomaly threshold, in minor
    /// currency units. Default: 150 000.
    ///
    /// Small menus have a tiny sample; mean + 3σ over four prices can land
    /// far above anything plausible, so the threshold never exceeds this.
    pub price_ceiling_cents: i64,

    /// Number of pages sent to the extraction service at once. Default: 1.
    ///
    /// One keeps load on the extraction service flat and makes the first
    /// failure abort the run immediately. Raising it is safe: page results are
    /// re-sorted before merging.
    pub extraction_concurrency: usize,

    /// Per-page extraction deadline in seconds. Default: 120.
    pub extraction_timeout_secs: u64,

    /// Deadline for rasterising a whole document in seconds. Default: 180.
    pub conversion_timeout_secs: u64,

    /// Retries per page on a retryable extraction failure. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Currency applied when neither the item nor the ingestion declares one.
    /// Default: None (fall back to what the page itself reports).
    pub default_currency: Option<String>,

    /// Vision model identifier sent to the extraction service.
    /// Default: "gpt-4.1-mini".
    pub model: String,

    /// Sampling temperature for extraction. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the extraction service may generate per page. Default: 4096.
    ///
    /// A dense drinks list can exceed 2 000 output tokens of JSON; truncated
    /// JSON degrades the whole page to zero items.
    pub max_output_tokens: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pages: 25,
            max_image_edge: 1200,
            min_confidence: 0.55,
            upload_ttl_secs: 900,
            download_ttl_secs: 600,
            price_ceiling_cents: 150_000,
            extraction_concurrency: 1,
            extraction_timeout_secs: 120,
            conversion_timeout_secs: 180,
            max_retries: 2,
            retry_backoff_ms: 500,
            default_currency: None,
            model: "gpt-4.1-mini".to_string(),
            temperature: 0.0,
            max_output_tokens: 4096,
        }
    }
}

impl Serialize for PipelineConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        PipelineConfig::serialize(self, serializer)
    }
}

impl<'de> Deserialize<'de> for PipelineConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let config = PipelineConfig::deserialize(deserializer)?;
        config.validate().map_err(serde::de::Error::custom)?;
        Ok(config)
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl_secs)
    }

    pub fn download_ttl(&self) -> Duration {
        Duration::from_secs(self.download_ttl_secs)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_secs)
    }

    /// Reject values no run can work with.
    pub fn validate(&self) -> Result<(), IngestError> {
        let invalid = |msg: String| -> Result<(), IngestError> { Err(IngestError::Validation(msg)) };
        if self.max_pages == 0 {
            return invalid("max_pages must be at least 1".into());
        }
        if self.max_image_edge < 64 {
            return invalid(format!(
                "max_image_edge must be at least 64, got {}",
                self.max_image_edge
            ));
        }
        if self.extraction_concurrency == 0 {
            return invalid("extraction_concurrency must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return invalid(format!(
                "min_confidence must be within 0–1, got {}",
                self.min_confidence
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return invalid(format!(
                "temperature must be within 0–2, got {}",
                self.temperature
            ));
        }
        if self.price_ceiling_cents <= 0 {
            return invalid(format!(
                "price_ceiling_cents must be positive, got {}",
                self.price_ceiling_cents
            ));
        }
        if self.upload_ttl_secs == 0 || self.download_ttl_secs == 0 {
            return invalid("signed URL lifetimes must be at least one second".into());
        }
        if self.extraction_timeout_secs == 0 || self.conversion_timeout_secs == 0 {
            return invalid("timeouts must be at least one second".into());
        }
        if let Some(ref code) = self.default_currency {
            if crate::merge::normalize_currency(code).is_none() {
                return invalid(format!(
                    "default_currency must be a three-letter code, got '{code}'"
                ));
            }
        }
        if self.model.trim().is_empty() {
            return invalid("model must not be empty".into());
        }
        if self.max_output_tokens == 0 {
            return invalid("max_output_tokens must be at least 1".into());
        }
        Ok(())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = n.max(1);
        self
    }

    pub fn max_image_edge(mut self, px: u32) -> Self {
        self.config.max_image_edge = px.max(64);
        self
    }

    pub fn min_confidence(mut self, c: f64) -> Self {
        self.config.min_confidence = c;
        self
    }

    pub fn upload_ttl_secs(mut self, secs: u64) -> Self {
        self.config.upload_ttl_secs = secs;
        self
    }

    pub fn download_ttl_secs(mut self, secs: u64) -> Self {
        self.config.download_ttl_secs = secs;
        self
    }

    pub fn price_ceiling_cents(mut self, cents: i64) -> Self {
        self.config.price_ceiling_cents = cents;
        self
    }

    pub fn extraction_concurrency(mut self, n: usize) -> Self {
        self.config.extraction_concurrency = n.max(1);
        self
    }

    pub fn extraction_timeout_secs(mut self, secs: u64) -> Self {
        self.config.extraction_timeout_secs = secs;
        self
    }

    pub fn conversion_timeout_secs(mut self, secs: u64) -> Self {
        self.config.conversion_timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn default_currency(mut self, code: impl Into<String>) -> Self {
        self.config.default_currency = Some(code.into().trim().to_ascii_uppercase());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_output_tokens(mut self, n: usize) -> Self {
        self.config.max_output_tokens = n;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, IngestError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.max_pages, 25);
        assert_eq!(c.max_image_edge, 1200);
        assert_eq!(c.min_confidence, 0.55);
        assert_eq!(c.upload_ttl(), Duration::from_secs(900));
        assert_eq!(c.download_ttl(), Duration::from_secs(600));
        assert_eq!(c.price_ceiling_cents, 150_000);
        assert_eq!(c.extraction_concurrency, 1);
    }

    #[test]
    fn setters_clamp() {
        let c = PipelineConfig::builder()
            .max_pages(0)
            .extraction_concurrency(0)
            .temperature(9.0)
            .build()
            .unwrap();
        assert_eq!(c.max_pages, 1);
        assert_eq!(c.extraction_concurrency, 1);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let err = PipelineConfig::builder().min_confidence(1.5).build().unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn rejects_bad_currency() {
        assert!(PipelineConfig::builder().default_currency("euro").build().is_err());
        let c = PipelineConfig::builder().default_currency(" eur ").build().unwrap();
        assert_eq!(c.default_currency.as_deref(), Some("EUR"));
    }

    #[test]
    fn deserialises_partial_json() {
        let c: PipelineConfig = serde_json::from_str(r#"{"max_pages": 4}"#).unwrap();
        assert_eq!(c.max_pages, 4);
        assert_eq!(c.min_confidence, 0.55);
    }

    #[test]
    fn deserialised_config_is_validated() {
        for json in [
            r#"{"extraction_concurrency": 0}"#,
            r#"{"max_pages": 0}"#,
            r#"{"min_confidence": 5}"#,
            r#"{"upload_ttl_secs": 0}"#,
            r#"{"default_currency": "euro"}"#,
            r#"{"model": " "}"#,
        ] {
            let err = serde_json::from_str::<PipelineConfig>(json).unwrap_err();
            assert!(err.to_string().contains("Invalid request"), "{json}: {err}");
        }
    }

    #[test]
    fn serialises_and_reads_back() {
        let c = PipelineConfig::builder().max_pages(3).default_currency("gbp").build().unwrap();
        let json = serde_json::to_string(&c).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_pages, 3);
        assert_eq!(back.default_currency.as_deref(), Some("GBP"));
    }

    #[test]
    fn hand_built_config_can_be_checked() {
        let c = PipelineConfig {
            extraction_concurrency: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(c.validate().unwrap_err().code(), "validation");
        assert!(PipelineConfig::default().validate().is_ok());
    }
}
