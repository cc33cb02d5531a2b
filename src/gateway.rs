//! Thin HTTP surface: submit and read tasks, summarize text, health.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::llm::Summarizer;
use crate::llm::summarize::{MAX_SUMMARY_INPUT_CHARS, SummarizeRequest, SummarizeResponse};
use crate::store::{QueueName, SharedStore};
use crate::task::{TaskField, TaskStatus, timestamp};
use crate::text::truncate_chars;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub store: Arc<dyn SharedStore>,
    /// Backs `POST /summarize`; the route answers 503 without one.
    pub summarizer: Option<Arc<dyn Summarizer>>,
}

/// Build the Axum router.
pub fn routes(store: Arc<dyn SharedStore>, summarizer: Option<Arc<dyn Summarizer>>) -> Router {
    let state = GatewayState { store, summarizer };

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/summarize", post(summarize))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

/// Store a new task and queue it for decomposition. Returns the task id.
pub async fn submit_task(store: &dyn SharedStore, input: &str) -> Result<String, StoreError> {
    let task_id = Uuid::new_v4().to_string();
    let now = timestamp();

    store
        .set_fields(
            &task_id,
            &[
                (TaskField::Input, input.to_string()),
                (TaskField::Status, TaskStatus::Submitted.as_str().to_string()),
                (TaskField::CreatedAt, now.clone()),
                (TaskField::UpdatedAt, now),
            ],
        )
        .await?;

    let payload = serde_json::to_string(&task_id)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.push(QueueName::Decompose, &payload).await?;

    info!(task_id = %task_id, "Task submitted");
    Ok(task_id)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

// ── Tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    #[serde(default)]
    input: String,
}

async fn create_task(
    State(state): State<GatewayState>,
    Json(body): Json<CreateTaskRequest>,
) -> impl IntoResponse {
    let input = body.input.trim();
    if input.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "input must not be empty"})),
        );
    }

    match submit_task(state.store.as_ref(), input).await {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "task_id": task_id,
                "status": TaskStatus::Submitted,
            })),
        ),
        Err(e) => {
            error!(error = %e, "Failed to submit task");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "failed to submit task"})),
            )
        }
    }
}

async fn get_task(State(state): State<GatewayState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_task(&id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(serde_json::json!(record))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Task not found"})),
        ),
        Err(e) => {
            error!(task_id = %id, error = %e, "Failed to read task");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "failed to read task"})),
            )
        }
    }
}

// ── Summarize ───────────────────────────────────────────────────────────

async fn summarize(
    State(state): State<GatewayState>,
    Json(body): Json<SummarizeRequest>,
) -> impl IntoResponse {
    let Some(summarizer) = state.summarizer.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "summarization is not configured"})),
        );
    };

    let text = truncate_chars(&body.text, MAX_SUMMARY_INPUT_CHARS);
    match summarizer.summarize(text).await {
        Ok(summary) => (
            StatusCode::OK,
            Json(serde_json::json!(SummarizeResponse { summary })),
        ),
        Err(e) => {
            warn!(error = %e, "Summarization failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::error::LlmError;
    use crate::store::InMemoryStore;

    struct LengthSummarizer {
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Summarizer for LengthSummarizer {
        async fn summarize(&self, text: &str) -> Result<String, LlmError> {
            let len = text.chars().count();
            self.seen.lock().unwrap().push(len);
            Ok(format!("- {len} chars"))
        }
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = routes(Arc::new(InMemoryStore::new()), None);
        let (status, body) = call(app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn submit_then_read_task() {
        let store = Arc::new(InMemoryStore::new());
        let app = routes(store.clone(), None);

        let (status, body) = call(
            app.clone(),
            post_json("/api/tasks", serde_json::json!({"input": "List today's weather"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "SUBMITTED");
        let task_id = body["task_id"].as_str().unwrap().to_string();

        let queued = store
            .pop(QueueName::Decompose, std::time::Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued, format!("\"{task_id}\""));

        let (status, body) = call(app, get_request(&format!("/api/tasks/{task_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["input"], "List today's weather");
        assert_eq!(body["status"], "SUBMITTED");
        assert!(body["result"].is_null());
    }

    #[tokio::test]
    async fn empty_input_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let app = routes(store.clone(), None);
        let (status, _) = call(app, post_json("/api/tasks", serde_json::json!({"input": "   "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(store.queue_len(QueueName::Decompose).await, 0);
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let app = routes(Arc::new(InMemoryStore::new()), None);
        let (status, _) = call(app, get_request("/api/tasks/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn summarize_caps_input() {
        let summarizer = Arc::new(LengthSummarizer {
            seen: Mutex::new(Vec::new()),
        });
        let app = routes(Arc::new(InMemoryStore::new()), Some(summarizer.clone()));

        let (status, body) = call(
            app,
            post_json("/summarize", serde_json::json!({"text": "w".repeat(4000)})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"], "- 3000 chars");
        assert_eq!(summarizer.seen.lock().unwrap().as_slice(), [3000]);
    }

    #[tokio::test]
    async fn summarize_without_backend_is_unavailable() {
        let app = routes(Arc::new(InMemoryStore::new()), None);
        let (status, _) = call(app, post_json("/summarize", serde_json::json!({"text": "hi"}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
