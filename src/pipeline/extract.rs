//! Extraction adapter: one page image in, one structured payload out.
//!
//! Two clients implement [`VisionExtractor`]:
//!
//! * [`ResponsesExtractor`] talks to an OpenAI-compatible `/responses`
//!   endpoint with a strict JSON schema (`text.format = json_schema`).
//! * [`LlmExtractor`] goes through any `edgequake_llm` vision provider, with
//!   the schema embedded in the system prompt.
//!
//! ## Failure classes
//!
//! A transport failure (non-2xx, connection error) is an error: it is
//! retried with exponential backoff and then fails the run. A response that
//! arrives but cannot be parsed is *not* an error: the page degrades to an
//! empty payload with `parse_miss = true`, so one garbled page cannot sink an
//! otherwise good multi-page menu.
//!
//! ## Retry Strategy
//!
//! 429 and 5xx responses are frequent under load and usually clear within
//! seconds. Backoff is `retry_backoff_ms * 2^(attempt-1)`: with the default
//! 500 ms and 2 retries the waits are 500 ms then 1 s.

use crate::config::PipelineConfig;
use crate::error::IngestError;
use crate::model::{ExtractionPayload, PageAsset, PageResult};
use crate::pipeline::encode::{data_uri, page_image_data};
use crate::prompts::{chat_system_prompt, extraction_schema, EXTRACTION_PROMPT, SCHEMA_NAME};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Sends one page to a vision extraction service.
#[async_trait]
pub trait VisionExtractor: Send + Sync {
    /// Extract the menu items on `page`.
    ///
    /// `Err` only for transport-level failures; unparsable responses come
    /// back as `Ok(PageResult { parse_miss: true, .. })`.
    async fn extract(&self, page: &PageAsset) -> Result<PageResult, IngestError>;
}

// ── Retry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_ms: config.retry_backoff_ms,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(2u64.saturating_pow(attempt - 1)))
    }
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent.
pub async fn with_retries<T, F, Fut>(page: u32, policy: RetryPolicy, mut call: F) -> Result<T, IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IngestError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let backoff = policy.delay(attempt);
                warn!(
                    "Page {}: retry {}/{} after {}ms: {}",
                    page,
                    attempt,
                    policy.max_retries,
                    backoff.as_millis(),
                    e
                );
                sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Response parsing ──────────────────────────────────────────────────────

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").unwrap());

/// Find the extraction payload in a Responses-API body.
///
/// Tries the flat `output_text` field first, then every
/// `output[*].content[*]` entry of type `output_text`. `None` when neither
/// yields a valid payload.
pub fn parse_response(body: &Value) -> Option<ExtractionPayload> {
    if let Some(payload) = body
        .get("output_text")
        .and_then(Value::as_str)
        .and_then(parse_payload_text)
    {
        return Some(payload);
    }

    body.get("output")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|entry| entry.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("output_text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .find_map(parse_payload_text)
}

/// Parse a payload out of free text: bare JSON, a fenced block, or the
/// outermost `{ ... }` span.
pub fn parse_payload_text(text: &str) -> Option<ExtractionPayload> {
    let trimmed = text.trim();
    if let Ok(payload) = serde_json::from_str::<ExtractionPayload>(trimmed) {
        return Some(payload);
    }

    if let Some(payload) = FENCED_JSON
        .captures_iter(trimmed)
        .filter_map(|c| c.get(1))
        .find_map(|m| serde_json::from_str::<ExtractionPayload>(m.as_str().trim()).ok())
    {
        return Some(payload);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

fn page_result(page: u32, payload: Option<ExtractionPayload>) -> PageResult {
    match payload {
        Some(payload) => {
            debug!("Page {}: {} items extracted", page, payload.item_count());
            PageResult::parsed(page, payload)
        }
        None => {
            warn!("Page {}: extraction response could not be parsed; treating page as empty", page);
            PageResult::degraded(page)
        }
    }
}

// ── Responses-API client ──────────────────────────────────────────────────

/// Client for an OpenAI-compatible `/responses` endpoint.
#[derive(Clone)]
pub struct ResponsesExtractor {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_output_tokens: usize,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ResponsesExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponsesExtractor")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ResponsesExtractor {
    pub fn new(api_key: impl Into<String>, config: &PipelineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Build from `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`.
    pub fn from_env(config: &PipelineConfig) -> Result<Self, IngestError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| IngestError::Validation("OPENAI_API_KEY is not set".into()))?;
        let mut extractor = Self::new(api_key, config);
        if let Ok(base) = std::env::var("OPENAI_BASE_URL") {
            if !base.trim().is_empty() {
                extractor = extractor.with_base_url(base);
            }
        }
        Ok(extractor)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/responses", self.base_url)
    }

    /// Request body for one page.
    pub fn request_body(&self, page: &PageAsset) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_output_tokens": self.max_output_tokens,
            "input": [
                {
                    "role": "system",
                    "content": [{ "type": "input_text", "text": EXTRACTION_PROMPT }]
                },
                {
                    "role": "user",
                    "content": [{
                        "type": "input_image",
                        "image_url": data_uri(&page.bytes, &page.content_type),
                        "detail": "high"
                    }]
                }
            ],
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": SCHEMA_NAME,
                    "schema": extraction_schema(),
                    "strict": true
                }
            }
        })
    }

    async fn attempt(&self, page: &PageAsset, body: &Value) -> Result<PageResult, IngestError> {
        let transport = |status: Option<u16>, detail: String| IngestError::ExtractionTransport {
            page: page.page,
            status,
            detail,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| transport(e.status().map(|s| s.as_u16()), e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport(Some(status.as_u16()), e.to_string()))?;

        if !status.is_success() {
            let snippet: String = text.chars().take(300).collect();
            return Err(transport(Some(status.as_u16()), snippet));
        }

        let payload = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| parse_response(&v));
        Ok(page_result(page.page, payload))
    }
}

#[async_trait]
impl VisionExtractor for ResponsesExtractor {
    async fn extract(&self, page: &PageAsset) -> Result<PageResult, IngestError> {
        let start = Instant::now();
        let body = self.request_body(page);
        let result = with_retries(page.page, self.retry, || self.attempt(page, &body)).await;
        debug!("Page {}: extraction finished in {:?}", page.page, start.elapsed());
        result
    }
}

// ── edgequake-llm client ──────────────────────────────────────────────────

/// Extraction through an `edgequake_llm` vision-capable chat provider.
pub struct LlmExtractor {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    retry: RetryPolicy,
}

impl LlmExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.max_output_tokens),
                ..Default::default()
            },
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Resolve a provider, from most-specific to least-specific:
    ///
    /// 1. `provider_name` with `config.model`
    /// 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, both set
    /// 3. `openai` with `config.model` when `OPENAI_API_KEY` is set
    /// 4. [`ProviderFactory::from_env`] auto-detection
    pub fn resolve(provider_name: Option<&str>, config: &PipelineConfig) -> Result<Self, IngestError> {
        let provider = resolve_provider(provider_name, &config.model)?;
        Ok(Self::new(provider, config))
    }

    async fn attempt(&self, page: u32, messages: &[ChatMessage]) -> Result<String, IngestError> {
        let response = self
            .provider
            .chat(messages, Some(&self.options))
            .await
            .map_err(|e| IngestError::ExtractionTransport {
                page,
                status: None,
                detail: e.to_string(),
            })?;
        debug!(
            "Page {}: {} input tokens, {} output tokens",
            page, response.prompt_tokens, response.completion_tokens
        );
        Ok(response.content)
    }
}

#[async_trait]
impl VisionExtractor for LlmExtractor {
    async fn extract(&self, page: &PageAsset) -> Result<PageResult, IngestError> {
        let messages = vec![
            ChatMessage::system(chat_system_prompt()),
            ChatMessage::user_with_images(
                "Extract the menu items on this page.",
                vec![page_image_data(page)],
            ),
        ];
        let content = with_retries(page.page, self.retry, || self.attempt(page.page, &messages)).await?;
        Ok(page_result(page.page, parse_payload_text(&content)))
    }
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, IngestError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        IngestError::Validation(format!("LLM provider '{name}' is not configured: {e}"))
    })
}

fn resolve_provider(name: Option<&str>, model: &str) -> Result<Arc<dyn LLMProvider>, IngestError> {
    if let Some(name) = name {
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").map(|k| !k.is_empty()).unwrap_or(false) {
        return create_provider("openai", model);
    }

    let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| {
        IngestError::Validation(format!(
            "No LLM provider could be auto-detected. Set OPENAI_API_KEY or ANTHROPIC_API_KEY, or name a provider. ({e})"
        ))
    })?;
    Ok(llm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stub_http;
    use std::sync::atomic::{AtomicU32, Ordering};

    const PAYLOAD: &str = r#"{"currency":"USD","categories":[{"name":"Pizza","items":[{"name":"Margherita","price":10,"currency":"USD","confidence":0.9}]}]}"#;

    #[test]
    fn parses_flat_output_text() {
        let body = json!({ "output_text": PAYLOAD });
        let payload = parse_response(&body).unwrap();
        assert_eq!(payload.item_count(), 1);
        assert_eq!(payload.currency, "USD");
    }

    #[test]
    fn falls_back_to_nested_content() {
        let body = json!({
            "output": [
                { "type": "reasoning", "content": [] },
                { "type": "message", "content": [
                    { "type": "refusal", "text": "{}" },
                    { "type": "output_text", "text": PAYLOAD }
                ]}
            ]
        });
        assert_eq!(parse_response(&body).unwrap().item_count(), 1);
    }

    #[test]
    fn unparsable_flat_text_still_checks_nested() {
        let body = json!({
            "output_text": "sorry, no",
            "output": [{ "content": [{ "type": "output_text", "text": PAYLOAD }] }]
        });
        assert!(parse_response(&body).is_some());
    }

    #[test]
    fn nothing_usable_is_none() {
        assert!(parse_response(&json!({ "output": "weird" })).is_none());
        assert!(parse_response(&json!({ "output_text": "{\"currency\":\"USD\"}" })).is_none());
        assert!(parse_response(&json!(null)).is_none());
    }

    #[test]
    fn parses_fenced_and_embedded_json() {
        let fenced = format!("Here you go:\n```json\n{PAYLOAD}\n```");
        assert!(parse_payload_text(&fenced).is_some());
        let embedded = format!("Sure! {PAYLOAD} Let me know.");
        assert!(parse_payload_text(&embedded).is_some());
        assert!(parse_payload_text("} nope {").is_none());
    }

    #[test]
    fn degraded_page_is_marked() {
        let result = page_result(4, None);
        assert!(result.parse_miss);
        assert_eq!(result.page, 4);
        assert_eq!(result.payload, ExtractionPayload::empty());
    }

    #[test]
    fn request_body_asks_for_strict_schema() {
        let extractor = ResponsesExtractor::new("sk-test", &PipelineConfig::default())
            .with_base_url("http://localhost:9999/v1/");
        assert_eq!(extractor.endpoint(), "http://localhost:9999/v1/responses");

        let page = PageAsset::new(1, b"png".to_vec(), "image/png");
        let body = extractor.request_body(&page);
        assert_eq!(body["model"], "gpt-4.1-mini");
        assert_eq!(body["text"]["format"]["name"], SCHEMA_NAME);
        assert_eq!(body["text"]["format"]["strict"], true);
        let image = body["input"][1]["content"][0]["image_url"].as_str().unwrap();
        assert!(image.starts_with("data:image/png;base64,"));
    }

    fn transport(status: Option<u16>) -> IngestError {
        IngestError::ExtractionTransport {
            page: 1,
            status,
            detail: "boom".into(),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            backoff_ms: 1,
        };
        let result = with_retries(1, policy, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transport(Some(503)))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 1,
            backoff_ms: 1,
        };
        let result: Result<(), _> = with_retries(1, policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(transport(Some(429)))
        })
        .await;
        assert_eq!(result.unwrap_err().code(), "extraction_transport_failure");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_ms: 1,
        };
        let result: Result<(), _> = with_retries(1, policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(transport(Some(401)))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ── HTTP behaviour ──

    fn fast_retry_config() -> PipelineConfig {
        PipelineConfig::builder()
            .max_retries(1)
            .retry_backoff_ms(1)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn bad_gateway_is_retried_then_reported_with_status() {
        let (url, hits) = stub_http::serve(502, r#"{"error":"upstream"}"#).await;
        let extractor = ResponsesExtractor::new("sk-test", &fast_retry_config()).with_base_url(url);
        let page = PageAsset::new(3, b"png".to_vec(), "image/png");

        match extractor.extract(&page).await.unwrap_err() {
            IngestError::ExtractionTransport { page, status, detail } => {
                assert_eq!(page, 3);
                assert_eq!(status, Some(502));
                assert!(detail.contains("upstream"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let (url, hits) = stub_http::serve(401, r#"{"error":"bad key"}"#).await;
        let extractor = ResponsesExtractor::new("sk-test", &fast_retry_config()).with_base_url(url);
        let page = PageAsset::new(1, b"png".to_vec(), "image/png");

        let err = extractor.extract(&page).await.unwrap_err();
        assert_eq!(err.code(), "extraction_transport_failure");
        assert!(!err.is_retryable());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn garbled_success_body_degrades_the_page() {
        let (url, _) = stub_http::serve(200, "<html>definitely not json</html>").await;
        let extractor = ResponsesExtractor::new("sk-test", &fast_retry_config()).with_base_url(url);
        let page = PageAsset::new(2, b"png".to_vec(), "image/png");

        let result = extractor.extract(&page).await.unwrap();
        assert!(result.parse_miss);
        assert_eq!(result.page, 2);
        assert_eq!(result.payload, ExtractionPayload::empty());
    }

    #[tokio::test]
    async fn well_formed_response_is_parsed() {
        let body = json!({ "output_text": PAYLOAD }).to_string();
        let (url, _) = stub_http::serve(200, body).await;
        let extractor = ResponsesExtractor::new("sk-test", &fast_retry_config()).with_base_url(url);
        let page = PageAsset::new(1, b"png".to_vec(), "image/png");

        let result = extractor.extract(&page).await.unwrap();
        assert!(!result.parse_miss);
        assert_eq!(result.payload.item_count(), 1);
    }
}
