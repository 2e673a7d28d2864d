//! Admin maintenance endpoint. Runs the same cleanup pass as the periodic
//! loop, synchronously, and reports what it removed.

use crate::errors::ApiError;
use crate::routes::routes::RequestMeta;
use crate::services::maintenance::cleanup_once;
use crate::state::AppState;
use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::time::Duration;

/// `POST /v1/admin/cleanup`
pub async fn run_cleanup(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .auth
        .authenticate_admin(&headers)
        .map_err(|err| err.with_request(&meta.request_id))?;

    let stats = cleanup_once(
        &state.metadata,
        &state.storage,
        Duration::from_secs(state.config.stale_upload_ttl_seconds),
        Duration::from_secs(state.config.idempotency_ttl_seconds),
    )
    .await
    .map_err(|err| ApiError::from(err).with_request(&meta.request_id))?;

    Ok(Json(json!({
        "status": "ok",
        "requested_by": user.user_id,
        "stale_uploads_aborted": stats.stale_uploads_aborted,
        "chunk_rows_deleted": stats.chunk_rows_deleted,
        "idempotency_rows_deleted": stats.idempotency_rows_deleted,
        "storage_keys_deleted": stats.storage_keys_deleted,
    })))
}
