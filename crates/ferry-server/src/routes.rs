use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
};
use bytes::Bytes;
use ferry_engine::UploadService;
use ferry_types::{
    ChunkAck, ChunkQuery, CompleteResponse, ResumeSessionResponse, SessionStatus,
    StartSessionRequest, StartSessionResponse,
};
use tracing::info;

use crate::error::{ApiError, ApiResult};

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<UploadService>,
}

// ── Extractor helpers ───────────────────────────────────────────────────

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(v)| v)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

fn chunk_path(path: Result<Path<(String, u32)>, PathRejection>) -> ApiResult<(String, u32)> {
    path.map(|Path(v)| v)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

// ── Handlers ────────────────────────────────────────────────────────────

/// POST /sessions — declare a new upload.
pub async fn start_session(
    State(state): State<AppState>,
    body: Result<Json<StartSessionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let req = json_body(body)?;
    let session_id = state.service.start_session(&req).await?;
    Ok((StatusCode::CREATED, Json(StartSessionResponse { session_id })))
}

/// POST /sessions/{id}/resume — reattach with the original declaration.
pub async fn resume_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<StartSessionRequest>, JsonRejection>,
) -> ApiResult<Json<ResumeSessionResponse>> {
    let req = json_body(body)?;
    let received_chunks = state.service.resume_session(&session_id, &req).await?;
    Ok(Json(ResumeSessionResponse {
        session_id,
        received_chunks,
    }))
}

/// PUT /sessions/{id}/chunks/{index}?total_chunks=N[&sha256=HEX] — store one
/// chunk. Re-sending a stored chunk is acknowledged without rewriting it.
pub async fn upload_chunk(
    State(state): State<AppState>,
    path: Result<Path<(String, u32)>, PathRejection>,
    query: Result<Query<ChunkQuery>, QueryRejection>,
    body: Bytes,
) -> ApiResult<Json<ChunkAck>> {
    let (session_id, index) = chunk_path(path)?;
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let ack = state
        .service
        .upload_chunk(
            &session_id,
            index,
            query.total_chunks,
            &body,
            query.sha256.as_deref(),
        )
        .await?;
    Ok(Json(ack))
}

/// GET /sessions/{id}
pub async fn get_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionStatus>> {
    Ok(Json(state.service.get_status(&session_id).await?))
}

/// GET /sessions
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<SessionStatus>>> {
    Ok(Json(state.service.list_sessions().await?))
}

/// POST /sessions/{id}/complete — merge, publish, and drop the session.
pub async fn complete(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<CompleteResponse>> {
    let done = state.service.complete(&session_id).await?;
    info!("Upload {} complete: {}", session_id, done.final_path);
    Ok(Json(done))
}

/// DELETE /sessions/{id}
pub async fn cancel(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.cancel(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /health
pub async fn health() -> &'static str {
    "ok"
}
