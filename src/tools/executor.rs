//! External task executor boundary.
//!
//! The model's `execute` tool forwards a free-form task description to an
//! HTTP gateway that performs it and answers with a short result text.

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Performs one task and returns the text handed back to the model.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute_task(&self, task: &str) -> Result<String, ExecutorError>;
}

/// Build the executor described by `config`.
///
/// A missing URL yields [`UnconfiguredExecutor`], which fails every call so
/// the model still receives an error response.
///
/// # Errors
///
/// Returns [`ExecutorError::Request`] if the HTTP client cannot be built.
pub fn executor_from_config(
    config: &ExecutorConfig,
) -> Result<std::sync::Arc<dyn TaskExecutor>, ExecutorError> {
    match HttpTaskExecutor::new(config) {
        Ok(http) => Ok(std::sync::Arc::new(http)),
        Err(ExecutorError::NotConfigured) => Ok(std::sync::Arc::new(UnconfiguredExecutor)),
        Err(e) => Err(e),
    }
}

/// Executor used when no gateway is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredExecutor;

#[async_trait]
impl TaskExecutor for UnconfiguredExecutor {
    async fn execute_task(&self, _task: &str) -> Result<String, ExecutorError> {
        Err(ExecutorError::NotConfigured)
    }
}

// ── HTTP gateway ──────────────────────────────────────────────────

#[derive(Serialize)]
struct TaskRequest<'a> {
    task: &'a str,
}

#[derive(Deserialize)]
struct TaskResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Gateway client: `POST {url}` with `{"task": "..."}`.
pub struct HttpTaskExecutor {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpTaskExecutor {
    /// # Errors
    ///
    /// Returns [`ExecutorError::NotConfigured`] when `config.url` is unset.
    pub fn new(config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        let url = config
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(ExecutorError::NotConfigured)?
            .to_owned();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ExecutorError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }
}

#[async_trait]
impl TaskExecutor for HttpTaskExecutor {
    async fn execute_task(&self, task: &str) -> Result<String, ExecutorError> {
        let mut request = self.client.post(&self.url).json(&TaskRequest { task });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExecutorError::Request(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExecutorError::Request(e.to_string()))?;
        debug!(status = status.as_u16(), bytes = body.len(), "executor responded");

        if !status.is_success() {
            return Err(ExecutorError::Status {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }
        parse_task_response(&body)
    }
}

/// Interpret a 2xx gateway body.
///
/// JSON objects use `content` (or `result`) for the answer, with
/// `success: false` or a lone `error` marking a rejected task. Any other
/// non-empty body is taken verbatim.
fn parse_task_response(body: &str) -> Result<String, ExecutorError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(ExecutorError::InvalidResponse("empty response body".into()));
    }
    if !trimmed.starts_with('{') {
        return Ok(trimmed.to_owned());
    }

    let parsed: TaskResponse = serde_json::from_str(trimmed)
        .map_err(|e| ExecutorError::InvalidResponse(e.to_string()))?;
    let content = parsed.content.or(parsed.result);

    if parsed.success == Some(false) {
        return Err(ExecutorError::Rejected(
            parsed
                .error
                .or(content)
                .unwrap_or_else(|| "task failed".to_owned()),
        ));
    }
    match (content, parsed.error) {
        (Some(content), _) => Ok(content),
        (None, Some(error)) => Err(ExecutorError::Rejected(error)),
        (None, None) => Err(ExecutorError::InvalidResponse(
            "response has no content".into(),
        )),
    }
}

fn truncate(body: &str) -> String {
    if body.is_empty() {
        "no response body".to_owned()
    } else {
        body.chars().take(500).collect()
    }
}
