//! Mock orchestrator for local testing.
//!
//! Serves the task-lease HTTP surface with an in-memory store. Run this in
//! one terminal, point `ORCHESTRATOR_URL` at it, and run the agent in
//! another. `POST /tasks/seed` injects a task; `GET /tasks` dumps the
//! store.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Default)]
struct Store {
    tasks: Arc<Mutex<HashMap<String, Value>>>,
}

#[derive(Deserialize)]
struct AgentQuery {
    #[serde(default)]
    agent: String,
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "timestamp": Utc::now().to_rfc3339()}))
}

async fn pending(
    State(store): State<Store>,
    Query(query): Query<AgentQuery>,
) -> Json<Value> {
    let tasks = store.tasks.lock().await;
    let pending: Vec<Value> = tasks
        .values()
        .filter(|t| t["status"] == "pending")
        .cloned()
        .collect();
    tracing::info!(agent = %query.agent, count = pending.len(), "pending tasks requested");
    Json(json!({"tasks": pending}))
}

async fn seed(State(store): State<Store>, Json(mut body): Json<Value>) -> Json<Value> {
    let id = body["id"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..8].to_string());
    body["id"] = json!(id);
    body["status"] = json!("pending");
    body["created_at"] = json!(Utc::now().to_rfc3339());

    store.tasks.lock().await.insert(id.clone(), body);
    tracing::info!(task_id = %id, "task seeded");
    Json(json!({"success": true, "id": id}))
}

async fn accept(
    State(store): State<Store>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut tasks = store.tasks.lock().await;
    let task = tasks.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;

    if task["status"] != "pending" {
        return Err(StatusCode::BAD_REQUEST);
    }
    let agent = body["agent"].as_str().unwrap_or("unknown").to_string();
    task["status"] = json!("accepted");
    task["agent"] = json!(agent);
    task["accepted_at"] = json!(Utc::now().to_rfc3339());

    tracing::info!(task_id = %id, agent, "task accepted");
    Ok(Json(json!({"success": true, "task": task})))
}

async fn update_status(
    State(store): State<Store>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut tasks = store.tasks.lock().await;
    let task = tasks.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;

    if let Some(status) = body.get("status") {
        task["status"] = status.clone();
    }
    if let Some(progress) = body.get("progress") {
        task["progress"] = progress.clone();
    }
    task["updated_at"] = json!(Utc::now().to_rfc3339());

    tracing::info!(task_id = %id, status = %body["status"], "status updated");
    Ok(Json(json!({"success": true, "task": task})))
}

async fn complete(
    State(store): State<Store>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut tasks = store.tasks.lock().await;
    let task = tasks.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;

    task["status"] = json!("completed");
    task["result"] = body.get("result").cloned().unwrap_or(Value::Null);
    task["completed_at"] = json!(Utc::now().to_rfc3339());

    let tokens = task["result"]["usage"]["total_tokens"].as_u64().unwrap_or(0);
    tracing::info!(task_id = %id, tokens, "task completed");
    Ok(Json(json!({"success": true, "task": task})))
}

async fn fail(
    State(store): State<Store>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut tasks = store.tasks.lock().await;
    let task = tasks.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;

    task["status"] = json!("failed");
    task["error"] = body.get("error").cloned().unwrap_or(Value::Null);
    task["failed_at"] = json!(Utc::now().to_rfc3339());

    tracing::warn!(task_id = %id, error = %task["error"], "task failed");
    Ok(Json(json!({"success": true, "task": task})))
}

async fn upload_artifact(
    State(store): State<Store>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut tasks = store.tasks.lock().await;
    let task = tasks.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;

    let entry = json!({
        "name": body["name"],
        "size": body["content"].as_str().map(|c| c.len()).unwrap_or(0),
        "uploaded_at": Utc::now().to_rfc3339(),
    });
    match task.get_mut("artifacts").and_then(Value::as_array_mut) {
        Some(artifacts) => artifacts.push(entry),
        None => task["artifacts"] = json!([entry]),
    }

    tracing::info!(task_id = %id, name = %body["name"], "artifact uploaded");
    Ok(Json(json!({"success": true})))
}

async fn list_tasks(State(store): State<Store>) -> Json<Value> {
    let tasks = store.tasks.lock().await;
    Json(json!({"tasks": tasks.values().cloned().collect::<Vec<_>>()}))
}

fn router(store: Store) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks/pending", get(pending))
        .route("/tasks/seed", post(seed))
        .route("/tasks/{id}/accept", post(accept))
        .route("/tasks/{id}/status", patch(update_status))
        .route("/tasks/{id}/complete", post(complete))
        .route("/tasks/{id}/fail", post(fail))
        .route("/tasks/{id}/artifacts", post(upload_artifact))
        .route("/tasks", get(list_tasks))
        .with_state(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("MOCK_ORCHESTRATOR_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5000);

    let app = router(Store::default());
    let listener =
        tokio::net::TcpListener::bind(std::net::SocketAddr::from(([0, 0, 0, 0], port))).await?;

    println!("Mock orchestrator listening on http://localhost:{port}");
    println!("Seed a task with:");
    println!(
        "  curl -X POST http://localhost:{port}/tasks/seed \
         -H 'Content-Type: application/json' \
         -d '{{\"description\": \"Say hi\"}}'"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
