//! LLM boundary: a request/response oracle with retries and a schema
//! contract. Prompt construction lives with the callers; nothing in here
//! knows what the prompts mean.

use async_trait::async_trait;
use jsonschema::Draft;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM provider error: {0}")]
    Provider(String),

    #[error("LLM response error: {0}")]
    Response(String),

    #[error("LLM request timed out")]
    Timeout,
}

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    /// When set, the response body must parse as JSON and conform; the
    /// validated value lands in [`LlmResponse::parsed`].
    pub response_schema: Option<Value>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            response_schema: None,
            max_tokens: 1024,
            temperature: 0.0,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    /// Present iff the request carried a response schema.
    pub parsed: Option<Value>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
}

/// The oracle contract every LLM-touching component depends on.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> LlmResult<LlmResponse>;
}

/// Configuration for the HTTP provider, loadable from environment variables.
#[derive(Debug, Clone)]
pub struct LlmProviderConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("TWINRAVEN_LLM_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:8000/v1".to_string()),
            model: std::env::var("TWINRAVEN_LLM_MODEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_default(),
            api_key: std::env::var("TWINRAVEN_LLM_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            request_timeout_ms: 120_000,
            max_attempts: 3,
            backoff_base_ms: 500,
        }
    }
}

/// OpenAI-compatible chat completions client with bounded retries.
pub struct HttpLlmProvider {
    http: Client,
    cfg: LlmProviderConfig,
}

impl HttpLlmProvider {
    pub fn new(cfg: LlmProviderConfig) -> LlmResult<Self> {
        if cfg.model.is_empty() {
            return Err(LlmError::Provider(
                "no model configured (TWINRAVEN_LLM_MODEL)".into(),
            ));
        }
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| LlmError::Provider(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    pub fn from_env() -> LlmResult<Self> {
        Self::new(LlmProviderConfig::default())
    }

    async fn post_once(&self, request: &GenerateRequest) -> LlmResult<reqwest::Response> {
        let url = format!(
            "{}/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        let mut body = json!({
            "model": self.cfg.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if let Some(schema) = &request.response_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {"name": "response", "schema": schema, "strict": true},
            });
        }

        debug!(target: "llm", %url, model = %self.cfg.model, "POST chat completions");
        let mut req = self.http.post(&url).header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }
        req.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Provider(format!("request failed: {e}"))
            }
        })
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn generate(&self, request: GenerateRequest) -> LlmResult<LlmResponse> {
        let start = Instant::now();
        let mut attempt = 0u32;
        let resp = loop {
            attempt += 1;
            match self.post_once(&request).await {
                Ok(resp) if retryable(resp.status()) && attempt < self.cfg.max_attempts => {
                    let delay = retry_delay(&resp, attempt, self.cfg.backoff_base_ms);
                    warn!(
                        target: "llm",
                        status = %resp.status(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient provider status, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(resp) => break resp,
                Err(LlmError::Timeout) if attempt < self.cfg.max_attempts => {
                    let delay =
                        Duration::from_millis(self.cfg.backoff_base_ms << (attempt - 1).min(8));
                    warn!(target: "llm", attempt, "request timed out, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Provider(format!(
                "status={status} body={body}"
            )));
        }

        let val: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::Response(format!("body is not JSON: {e}")))?;
        let content = extract_chat_content(&val)
            .ok_or_else(|| LlmError::Response("missing choices[0].message.content".into()))?;

        let parsed = match &request.response_schema {
            Some(schema) => Some(validate_against_schema(&content, schema)?),
            None => None,
        };

        let usage = val.get("usage");
        Ok(LlmResponse {
            content,
            parsed,
            model: val
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or(&self.cfg.model)
                .to_string(),
            input_tokens: usage
                .and_then(|u| u.get("prompt_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            output_tokens: usage
                .and_then(|u| u.get("completion_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn retryable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503)
}

/// Server-advertised delay wins; otherwise exponential from the base.
fn retry_delay(resp: &reqwest::Response, attempt: u32, base_ms: u64) -> Duration {
    let advertised = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);
    advertised.unwrap_or_else(|| Duration::from_millis(base_ms << (attempt - 1).min(8)))
}

fn extract_chat_content(v: &Value) -> Option<String> {
    v.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

/// Parse `content` as JSON and check it against `schema`
/// (JSON Schema Draft 2020-12). Returns the parsed value.
pub fn validate_against_schema(content: &str, schema: &Value) -> LlmResult<Value> {
    let instance: Value = serde_json::from_str(content)
        .map_err(|e| LlmError::Response(format!("content is not JSON: {e}")))?;
    let validator = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|e| LlmError::Response(format!("schema does not compile: {e}")))?;
    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| format!("{}: {}", e.instance_path, e))
        .collect();
    if !errors.is_empty() {
        return Err(LlmError::Response(format!(
            "response violates schema: {}",
            errors.join("; ")
        )));
    }
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_validation_accepts_conforming_json() {
        let schema = json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"],
        });
        let parsed = validate_against_schema(r#"{"name": "x"}"#, &schema).unwrap();
        assert_eq!(parsed["name"], "x");
    }

    #[test]
    fn schema_validation_rejects_violations() {
        let schema = json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"],
        });
        let err = validate_against_schema(r#"{"name": 3}"#, &schema).unwrap_err();
        assert!(matches!(err, LlmError::Response(_)));
    }

    #[test]
    fn non_json_content_is_a_response_error() {
        let schema = json!({"type": "object"});
        let err = validate_against_schema("not json", &schema).unwrap_err();
        assert!(matches!(err, LlmError::Response(_)));
    }
}
