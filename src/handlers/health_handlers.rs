//! Operational endpoints.
//!
//! - GET /health   -> cheap liveness, never performs I/O
//! - GET /version  -> build and backend selection info
//! - GET /readyz   -> readiness that checks DB connectivity and storage I/O
//! - GET /metrics  -> Prometheus text exposition

use crate::metrics;
use crate::state::AppState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// `GET /version`
pub async fn version(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "app_name": state.config.app_name,
        "app_version": state.config.app_version,
        "queue_backend": state.config.queue_backend,
        "storage_backend": state.config.storage_backend,
    }))
}

/// `GET /readyz`
///
/// Runs a lightweight query against the metadata database and a
/// write/read/delete probe against the storage backend. 200 when both
/// pass, 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let db_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.metadata.db)
        .await
    {
        Ok(1) => (true, None),
        Ok(other) => (false, Some(format!("unexpected result: {}", other))),
        Err(err) => (false, Some(format!("error: {}", err))),
    };

    let probe_key = format!(".readyz/{}", Uuid::new_v4());
    let storage_check = match state
        .storage
        .put(&probe_key, Bytes::from_static(b"readyz"))
        .await
    {
        Ok(_) => match state.storage.get(&probe_key, None, None).await {
            Ok(data) if &data[..] == b"readyz" => {
                let _ = state.storage.delete(&probe_key).await;
                (true, None)
            }
            Ok(_) => {
                let _ = state.storage.delete(&probe_key).await;
                (false, Some("probe content mismatch".to_string()))
            }
            Err(err) => (false, Some(format!("probe read failed: {}", err))),
        },
        Err(err) => (false, Some(format!("probe write failed: {}", err))),
    };

    let overall_ok = db_check.0 && storage_check.0;
    let body = json!({
        "status": if overall_ok { "ok" } else { "error" },
        "checks": {
            "database": CheckStatus { ok: db_check.0, error: db_check.1 },
            "storage": CheckStatus { ok: storage_check.0, error: storage_check.1 },
        },
    });
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// `GET /metrics`
pub async fn prometheus_metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
        .into_response()
}
