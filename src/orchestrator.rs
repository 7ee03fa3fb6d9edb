//! Typed client for the orchestrator's HTTP surface.
//!
//! Every request carries `Content-Type: application/json` and the current
//! auth header from [`AuthTokenStore`]. Transport errors and non-2xx
//! statuses collapse to `false` (or an empty task list); the distinction is
//! visible only in the logs. No transport retries happen here — `accept`
//! and `complete` are not idempotent, and the poll is retried by its caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;

use crate::auth::AuthTokenStore;
use crate::error::OrchestratorError;
use crate::task::{ExecutionResult, TaskDescriptor};

/// Deadline for orchestrator operations.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OrchestratorClient {
    base_url: String,
    client: Client,
    auth: Arc<AuthTokenStore>,
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>, auth: Arc<AuthTokenStore>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            auth,
        }
    }

    /// `GET /health`. True iff the orchestrator answered 2xx.
    pub async fn health(&self) -> bool {
        match self.send(Method::GET, "/health", None).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("orchestrator health check failed: {e}");
                false
            }
        }
    }

    /// `GET /tasks/pending?agent=<name>`. Empty on any failure; a 401 looks
    /// exactly like "no tasks" apart from the log line.
    pub async fn pending_tasks(&self, agent_name: &str) -> Vec<TaskDescriptor> {
        let path = format!("/tasks/pending?agent={agent_name}");
        match self.send(Method::GET, &path, None).await {
            Ok(body) => match serde_json::from_str::<PendingResponse>(&body) {
                Ok(response) => response.tasks,
                Err(e) => {
                    tracing::error!("invalid pending-tasks response: {e}");
                    Vec::new()
                }
            },
            Err(e) => {
                tracing::error!("failed to fetch pending tasks: {e}");
                Vec::new()
            }
        }
    }

    /// `POST /tasks/{id}/accept`. False when another agent won the lease
    /// (400), the id is unknown (404), or transport failed.
    pub async fn accept_task(&self, task_id: &str, agent_name: &str) -> bool {
        let body = serde_json::json!({ "agent": agent_name });
        match self
            .send(Method::POST, &format!("/tasks/{task_id}/accept"), Some(body))
            .await
        {
            Ok(_) => {
                tracing::info!(task_id, "task accepted");
                true
            }
            Err(e) => {
                tracing::warn!(task_id, "failed to accept task: {e}");
                false
            }
        }
    }

    /// `PATCH /tasks/{id}/status` with `{status, progress?}`.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: &str,
        progress: Option<u8>,
    ) -> bool {
        let mut body = serde_json::json!({ "status": status });
        if let Some(progress) = progress {
            body["progress"] = serde_json::json!(progress);
        }
        match self
            .send(Method::PATCH, &format!("/tasks/{task_id}/status"), Some(body))
            .await
        {
            Ok(_) => {
                tracing::debug!(task_id, status, "task status updated");
                true
            }
            Err(e) => {
                tracing::error!(task_id, "failed to update task status: {e}");
                false
            }
        }
    }

    /// `POST /tasks/{id}/complete` with the result payload.
    pub async fn complete_task(&self, task_id: &str, result: &ExecutionResult) -> bool {
        let body = serde_json::json!({
            "result": result,
            "completed_at": Utc::now().to_rfc3339(),
        });
        match self
            .send(Method::POST, &format!("/tasks/{task_id}/complete"), Some(body))
            .await
        {
            Ok(_) => {
                tracing::info!(task_id, "task completed");
                true
            }
            Err(e) => {
                tracing::error!(task_id, "failed to complete task: {e}");
                false
            }
        }
    }

    /// `POST /tasks/{id}/fail` with the error string.
    pub async fn fail_task(&self, task_id: &str, error: &str) -> bool {
        let body = serde_json::json!({
            "error": error,
            "failed_at": Utc::now().to_rfc3339(),
        });
        match self
            .send(Method::POST, &format!("/tasks/{task_id}/fail"), Some(body))
            .await
        {
            Ok(_) => {
                tracing::warn!(task_id, error, "task marked as failed");
                true
            }
            Err(e) => {
                tracing::error!(task_id, "failed to mark task as failed: {e}");
                false
            }
        }
    }

    /// `POST /tasks/{id}/artifacts` with `{name, content}`.
    pub async fn upload_artifact(&self, task_id: &str, name: &str, content: &str) -> bool {
        let body = serde_json::json!({ "name": name, "content": content });
        match self
            .send(
                Method::POST,
                &format!("/tasks/{task_id}/artifacts"),
                Some(body),
            )
            .await
        {
            Ok(_) => {
                tracing::info!(task_id, name, "artifact uploaded");
                true
            }
            Err(e) => {
                tracing::error!(task_id, name, "failed to upload artifact: {e}");
                false
            }
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<String, OrchestratorError> {
        let url = format!("{}{path}", self.base_url);
        let headers = self.auth.auth_headers().await;

        let mut request = self.client.request(method, &url).headers(headers);
        request = match body {
            Some(body) => request.json(&body),
            None => request.header(reqwest::header::CONTENT_TYPE, "application/json"),
        };

        let response = request
            .send()
            .await
            .map_err(|e| OrchestratorError::Transport {
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!("orchestrator rejected request as unauthenticated");
        }
        if !status.is_success() {
            return Err(OrchestratorError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

#[derive(Debug, Deserialize)]
struct PendingResponse {
    #[serde(default)]
    tasks: Vec<TaskDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use tempfile::tempdir;

    use crate::auth::AuthConfig;

    fn unauthenticated_client(base_url: &str, dir: &std::path::Path) -> OrchestratorClient {
        let auth = Arc::new(AuthTokenStore::new(
            AuthConfig::new("http://127.0.0.1:1", SecretString::from("anon"))
                .with_cache_path(dir.join("auth.json")),
        ));
        OrchestratorClient::new(base_url, auth)
    }

    async fn spawn_stub(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn health_true_on_200_false_on_unreachable() {
        let dir = tempdir().unwrap();
        let url = spawn_stub(
            axum::Router::new().route("/health", axum::routing::get(|| async { "ok" })),
        )
        .await;

        assert!(unauthenticated_client(&url, dir.path()).health().await);
        assert!(
            !unauthenticated_client("http://127.0.0.1:1", dir.path())
                .health()
                .await
        );
    }

    #[tokio::test]
    async fn pending_parses_tasks_and_collapses_errors_to_empty() {
        let dir = tempdir().unwrap();
        let url = spawn_stub(axum::Router::new().route(
            "/tasks/pending",
            axum::routing::get(|| async {
                axum::Json(serde_json::json!({
                    "tasks": [{"id": "t1", "description": "Say hi"}]
                }))
            }),
        ))
        .await;

        let client = unauthenticated_client(&url, dir.path());
        let tasks = client.pending_tasks("agent-a").await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "t1");

        let unreachable = unauthenticated_client("http://127.0.0.1:1", dir.path());
        assert!(unreachable.pending_tasks("agent-a").await.is_empty());
    }

    #[tokio::test]
    async fn accept_false_on_400() {
        let dir = tempdir().unwrap();
        let url = spawn_stub(axum::Router::new().route(
            "/tasks/{id}/accept",
            axum::routing::post(|| async {
                (axum::http::StatusCode::BAD_REQUEST, "already leased")
            }),
        ))
        .await;

        let client = unauthenticated_client(&url, dir.path());
        assert!(!client.accept_task("t1", "agent-a").await);
    }

    #[tokio::test]
    async fn unauthorized_pending_behaves_as_no_tasks() {
        let dir = tempdir().unwrap();
        let url = spawn_stub(axum::Router::new().route(
            "/tasks/pending",
            axum::routing::get(|| async { axum::http::StatusCode::UNAUTHORIZED }),
        ))
        .await;

        let client = unauthenticated_client(&url, dir.path());
        assert!(client.pending_tasks("agent-a").await.is_empty());
    }
}
