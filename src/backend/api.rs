//! Model API back-end: one non-streaming round-trip per task.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::{ProgressUpdate, TaskBackend};
use crate::error::LlmError;
use crate::task::{ExecutionResult, TaskDescriptor, TokenUsage};

const DEFAULT_API_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Executes tasks by calling the model vendor's messages endpoint.
pub struct ModelApiBackend {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
}

impl ModelApiBackend {
    pub fn new(api_key: SecretString, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: DEFAULT_API_URL.to_string(),
            api_key,
            model: model.into(),
            max_tokens,
        }
    }

    /// Point the back-end at a different endpoint (mock servers in tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Startup connectivity check: a tiny synthetic call. Used by the
    /// executor before it launches any workers.
    pub async fn probe(&self) -> Result<(), LlmError> {
        self.send_message("Hello", 10).await.map(|_| ())
    }

    async fn send_message(
        &self,
        content: &str,
        max_tokens: u32,
    ) -> Result<MessagesResponse, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let request = MessagesRequest {
            model: &self.model,
            max_tokens,
            messages: vec![Message {
                role: "user",
                content,
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(LlmError::AuthFailed);
        }
        if !status.is_success() {
            // Vendor errors carry a message in {"error": {"message": ...}}.
            let message = serde_json::from_str::<VendorError>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
            reason: format!("JSON parse error: {e}"),
        })
    }

    /// Assemble the single user message sent to the model.
    fn build_prompt(task: &TaskDescriptor) -> String {
        let mut parts = vec![
            "You are an autonomous task executor that completes coding and development tasks."
                .to_string(),
            String::new(),
            "TASK:".to_string(),
            task.description.clone(),
        ];

        if !task.context.is_empty() {
            parts.push(String::new());
            parts.push("CONTEXT:".to_string());
            for (key, value) in &task.context {
                parts.push(format!("{key}: {}", render_value(value)));
            }
        }

        parts.extend(
            [
                "",
                "Please complete this task and provide detailed output including:",
                "1. Your approach and reasoning",
                "2. Any code or artifacts generated",
                "3. Next steps or recommendations",
            ]
            .map(String::from),
        );

        parts.join("\n")
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl TaskBackend for ModelApiBackend {
    async fn execute(
        &self,
        task: &TaskDescriptor,
        _progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> ExecutionResult {
        let prompt = Self::build_prompt(task);
        let started = Instant::now();

        tracing::info!(task_id = %task.id, model = %self.model, "sending task to model API");

        match self.send_message(&prompt, self.max_tokens).await {
            Ok(response) => {
                let text: String = response
                    .content
                    .iter()
                    .filter_map(|block| block.text.as_deref())
                    .collect();

                let usage = TokenUsage {
                    input_tokens: response.usage.input_tokens,
                    output_tokens: response.usage.output_tokens,
                    total_tokens: response.usage.input_tokens + response.usage.output_tokens,
                };
                tracing::info!(
                    task_id = %task.id,
                    tokens = usage.total_tokens,
                    "model call finished"
                );

                ExecutionResult {
                    success: true,
                    response: text,
                    usage: Some(usage),
                    artifacts: Vec::new(),
                    execution_time_seconds: started.elapsed().as_secs_f64(),
                    exit_code: None,
                    error: None,
                    model: Some(self.model.clone()),
                }
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, "model call failed: {e}");
                ExecutionResult::failure(e.to_string(), started.elapsed().as_secs_f64())
            }
        }
    }
}

// Vendor wire types.

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct VendorError {
    error: VendorErrorBody,
}

#[derive(Debug, Deserialize)]
struct VendorErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn task(description: &str, context: serde_json::Value) -> TaskDescriptor {
        serde_json::from_value(serde_json::json!({
            "id": "t1",
            "description": description,
            "context": context,
        }))
        .unwrap()
    }

    async fn spawn_vendor(response: serde_json::Value, status: u16) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/v1/messages",
            axum::routing::post(move || {
                let response = response.clone();
                async move {
                    (
                        axum::http::StatusCode::from_u16(status).unwrap(),
                        axum::Json(response),
                    )
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn backend(url: &str) -> ModelApiBackend {
        ModelApiBackend::new(SecretString::from("key"), "claude-sonnet-4", 4096).with_base_url(url)
    }

    #[test]
    fn prompt_contains_description_and_context() {
        let task = task("Say hi", serde_json::json!({"lang": "en", "tries": 3}));
        let prompt = ModelApiBackend::build_prompt(&task);

        assert!(prompt.contains("TASK:\nSay hi"));
        assert!(prompt.contains("CONTEXT:"));
        assert!(prompt.contains("lang: en"));
        assert!(prompt.contains("tries: 3"));
        assert!(prompt.contains("Next steps or recommendations"));
    }

    #[test]
    fn prompt_omits_context_heading_when_empty() {
        let prompt = ModelApiBackend::build_prompt(&task("Say hi", serde_json::json!({})));
        assert!(!prompt.contains("CONTEXT:"));
    }

    #[tokio::test]
    async fn successful_call_collects_text_and_usage() {
        let url = spawn_vendor(
            serde_json::json!({
                "content": [{"type": "text", "text": "hi"}],
                "usage": {"input_tokens": 1, "output_tokens": 1}
            }),
            200,
        )
        .await;

        let result = backend(&url).execute(&task("Say hi", serde_json::json!({})), None).await;
        assert!(result.success);
        assert_eq!(result.response, "hi");
        assert_eq!(result.usage.as_ref().unwrap().total_tokens, 2);
        assert_eq!(result.model.as_deref(), Some("claude-sonnet-4"));
    }

    #[tokio::test]
    async fn empty_reply_is_still_success() {
        let url = spawn_vendor(
            serde_json::json!({
                "content": [],
                "usage": {"input_tokens": 5, "output_tokens": 0}
            }),
            200,
        )
        .await;

        let result = backend(&url).execute(&task("noop", serde_json::json!({})), None).await;
        assert!(result.success);
        assert_eq!(result.response, "");
    }

    #[tokio::test]
    async fn vendor_error_becomes_failed_result() {
        let url = spawn_vendor(
            serde_json::json!({"error": {"type": "overloaded_error", "message": "overloaded"}}),
            529,
        )
        .await;

        let result = backend(&url).execute(&task("Say hi", serde_json::json!({})), None).await;
        assert!(!result.success);
        assert_eq!(result.response, "");
        assert!(result.error.as_deref().unwrap().contains("overloaded"));
    }

    #[tokio::test]
    async fn probe_fails_against_unreachable_endpoint() {
        let backend = backend("http://127.0.0.1:1");
        assert!(backend.probe().await.is_err());
    }
}
