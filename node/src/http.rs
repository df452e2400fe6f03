use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;

use crate::commands::Command;
use crate::roles::{EventSender, NodeEvent};
use crate::storage::{ObjectStore, StorageError, PRESIGN_TTL};

/// Shared state of the control surface. Commands go through the role's
/// event queue; the object-store endpoints talk to the adapter directly,
/// because it is stateless.
pub struct ControlState {
    pub events: EventSender,
    pub store: Option<Arc<ObjectStore>>,
    pub chunk_bytes: usize,
}

pub fn create_router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/command", post(command_handler))
        .route("/generate-presigned-url", post(presign_handler))
        .route("/upload-dataset", post(upload_dataset_handler))
        .route("/objects", get(list_objects_handler))
        .route("/objects/{hash}", get(fetch_object_handler))
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn status_handler() -> Json<Value> {
    Json(json!({ "status": "running" }))
}

async fn command_handler(
    State(state): State<Arc<ControlState>>,
    Json(request): Json<crate::commands::CommandRequest>,
) -> (StatusCode, Json<Value>) {
    let cmd = match Command::parse(&request) {
        Ok(cmd) => cmd,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "error": e.to_string() })),
            );
        }
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if state
        .events
        .send(NodeEvent::Command { cmd, reply: reply_tx })
        .is_err()
    {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": "node is shutting down" })),
        );
    }

    match reply_rx.await {
        Ok(Ok(result)) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "result": result })),
        ),
        Ok(Err(error)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": error })),
        ),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": "command dropped during shutdown" })),
        ),
    }
}

/// Chunk a local CSV dataset into the object store and hand back the
/// signed manifest URL the UI needs for `createTask` and `train`.
#[derive(Debug, Deserialize)]
struct UploadDatasetRequest {
    path: String,
    chunk_bytes: Option<usize>,
}

async fn upload_dataset_handler(
    State(state): State<Arc<ControlState>>,
    Json(request): Json<UploadDatasetRequest>,
) -> (StatusCode, Json<Value>) {
    let Some(store) = &state.store else {
        return no_store();
    };
    let budget = request.chunk_bytes.unwrap_or(state.chunk_bytes);
    match store
        .upload_dataset_as_chunks(std::path::Path::new(&request.path), budget)
        .await
    {
        Ok((manifest_url, chunks)) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "manifestUrl": manifest_url,
                "chunks": chunks,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": e.to_string() })),
        ),
    }
}

async fn list_objects_handler(
    State(state): State<Arc<ControlState>>,
) -> (StatusCode, Json<Value>) {
    let Some(store) = &state.store else {
        return no_store();
    };
    match store.list().await {
        Ok(objects) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "objects": objects })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": e.to_string() })),
        ),
    }
}

async fn fetch_object_handler(
    State(state): State<Arc<ControlState>>,
    axum::extract::Path(hash): axum::extract::Path<String>,
) -> axum::response::Response {
    use axum::response::IntoResponse;

    let Some(store) = &state.store else {
        return no_store().into_response();
    };
    match store.fetch(&hash).await {
        Ok(bytes) => (
            StatusCode::OK,
            [("content-type", "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "error", "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn no_store() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "error": "no object store configured" })),
    )
}

#[derive(Debug, Deserialize)]
struct PresignRequest {
    hash: String,
}

async fn presign_handler(
    State(state): State<Arc<ControlState>>,
    Json(request): Json<PresignRequest>,
) -> (StatusCode, Json<Value>) {
    let Some(store) = &state.store else {
        return no_store();
    };

    match store.presign_get(&request.hash, PRESIGN_TTL) {
        Ok(url) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "presignedUrl": url,
                "hash": request.hash,
            })),
        ),
        Err(e @ StorageError::BadHash(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "error": e.to_string() })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": e.to_string() })),
        ),
    }
}
