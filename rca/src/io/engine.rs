//! Reasoning-engine abstraction and the OpenAI-compatible HTTP backend.
//!
//! The [`ReasoningEngine`] trait decouples the control loop from the model
//! provider. Failures are classified at this boundary into [`EngineError`] so
//! callers never inspect error text to detect a context overflow.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::Message;
use crate::io::config::EngineConfig;

const CONTEXT_OVERFLOW_CODE: &str = "context_length_exceeded";
const MAX_RETRIES: u32 = 2;
const MAX_ERROR_CONTENT_LEN: usize = 300;

/// Classified reasoning-engine failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The request no longer fits the model's context window.
    #[error("context_length_exceeded: {0}")]
    ContextOverflow(String),
    /// Any other failure; the caller may continue with a corrective turn.
    #[error("{0}")]
    Transient(String),
}

impl EngineError {
    pub fn is_context_overflow(&self) -> bool {
        matches!(self, EngineError::ContextOverflow(_))
    }
}

/// Chat-completion backend used by the loop and the code executor.
pub trait ReasoningEngine {
    fn complete(&self, messages: &[Message], temperature: f32) -> Result<String, EngineError>;
}

impl<T: ReasoningEngine + ?Sized> ReasoningEngine for &T {
    fn complete(&self, messages: &[Message], temperature: f32) -> Result<String, EngineError> {
        (**self).complete(messages, temperature)
    }
}

/// Blocking client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiEngine {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl OpenAiEngine {
    /// Build a client from config, reading the API key from `api_key_env`.
    pub fn from_config(cfg: &EngineConfig) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env)
            .with_context(|| format!("read API key from ${}", cfg.api_key_env))?;
        if api_key.trim().is_empty() {
            return Err(anyhow!("${} is empty", cfg.api_key_env));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            model: cfg.model.clone(),
            api_key,
        })
    }

    fn send_once(&self, body: &ChatRequest<'_>) -> Result<(StatusCode, String), EngineError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .map_err(|err| EngineError::Transient(format!("request failed: {err}")))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|err| EngineError::Transient(format!("read response body: {err}")))?;
        Ok((status, text))
    }
}

impl ReasoningEngine for OpenAiEngine {
    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    fn complete(&self, messages: &[Message], temperature: f32) -> Result<String, EngineError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature,
        };

        let mut retry_count = 0;
        loop {
            let (status, text) = self.send_once(&body)?;
            if status.is_success() {
                return parse_completion(&text);
            }

            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if retryable && retry_count < MAX_RETRIES {
                retry_count += 1;
                let backoff = backoff_secs(retry_count);
                warn!(%status, retry_count, backoff, "engine request failed, retrying");
                thread::sleep(Duration::from_secs(backoff));
                continue;
            }
            return Err(classify_failure(status, &text));
        }
    }
}

fn backoff_secs(retry_count: u32) -> u64 {
    2u64.saturating_pow(retry_count)
}

/// Extract the first choice's content, treating an embedded error object as a failure.
fn parse_completion(text: &str) -> Result<String, EngineError> {
    if let Ok(err) = serde_json::from_str::<ApiErrorBody>(text) {
        return Err(classify_api_error(StatusCode::OK, &err.error));
    }
    let response: ChatResponse = serde_json::from_str(text).map_err(|err| {
        EngineError::Transient(format!(
            "malformed completion response: {err}: {}",
            truncate(text, MAX_ERROR_CONTENT_LEN)
        ))
    })?;
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| EngineError::Transient("completion has no content".to_string()))?;
    debug!(bytes = content.len(), "received completion");
    Ok(content)
}

/// Classify a non-success response by status and provider error code.
fn classify_failure(status: StatusCode, text: &str) -> EngineError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return EngineError::ContextOverflow(format!("API error {status}"));
    }
    match serde_json::from_str::<ApiErrorBody>(text) {
        Ok(body) => classify_api_error(status, &body.error),
        Err(_) => EngineError::Transient(format!(
            "API error {status}: {}",
            truncate(text, MAX_ERROR_CONTENT_LEN)
        )),
    }
}

fn classify_api_error(status: StatusCode, error: &ApiError) -> EngineError {
    let code = error.code.as_ref().and_then(Value::as_str);
    let overflow = code == Some(CONTEXT_OVERFLOW_CODE)
        || error.kind.as_deref() == Some(CONTEXT_OVERFLOW_CODE);
    let message = truncate(&error.message, MAX_ERROR_CONTENT_LEN).to_string();
    if overflow {
        EngineError::ContextOverflow(message)
    } else {
        EngineError::Transient(format!("API error {status}: {message}"))
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
