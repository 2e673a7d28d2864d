//! Route table and request-context middleware.
//!
//! ## Structure
//! - **Operational endpoints** (mounted at root)
//!   - `GET  /health`, `GET /version`, `GET /readyz`, `GET /metrics`
//!
//! - **Upload lifecycle (`/v1`)**
//!   - `POST /v1/uploads/init`
//!   - `PUT  /v1/uploads/{upload_id}/chunks/{chunk_index}`
//!   - `POST /v1/uploads/{upload_id}/complete`
//!   - `GET  /v1/uploads/{upload_id}/missing-chunks`
//!   - `GET  /v1/uploads/{upload_id}/download`
//!
//! - **Admin (`/v1/admin`)**
//!   - `POST /v1/admin/cleanup`
//!
//! The middleware stamps every request with an `X-Request-ID` (honouring an
//! inbound one), records the latency histogram, and logs a completion event.

use crate::handlers::{
    admin_handlers::run_cleanup,
    health_handlers::{health, prometheus_metrics, readyz, version},
    upload_handlers::{complete_upload, download, init_upload, missing_chunks, upload_chunk},
};
use crate::metrics::HTTP_REQUEST_DURATION_SECONDS;
use crate::state::AppState;
use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Request, State},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Router,
};
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Per-request context inserted by the middleware and read by handlers
/// when they build error envelopes.
#[derive(Clone, Debug)]
pub struct RequestMeta {
    pub request_id: String,
}

async fn request_context(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get("X-Request-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    request.extensions_mut().insert(RequestMeta {
        request_id: request_id.clone(),
    });

    let started = Instant::now();
    let mut response = next.run(request).await;
    let duration = started.elapsed();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    if let Ok(value) = HeaderValue::from_str(&state.config.app_version) {
        response.headers_mut().insert("X-App-Version", value);
    }
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method.as_str(), route.as_str(), response.status().as_str()])
        .observe(duration.as_secs_f64());

    info!(
        event = "request_completed",
        request_id = %request_id,
        method = %method,
        path = %path,
        status_code = response.status().as_u16(),
        duration_ms = duration.as_millis() as u64,
    );
    response
}

/// Build the router for the full HTTP surface.
pub fn routes(state: AppState) -> Router {
    // Chunk bodies may reach the negotiable chunk-size ceiling (init
    // rejects anything larger); leave headroom over axum's default cap.
    let body_limit = (state.config.max_chunk_size_bytes as usize).saturating_add(64 * 1024);

    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/readyz", get(readyz))
        .route("/metrics", get(prometheus_metrics))
        .route("/v1/uploads/init", post(init_upload))
        .route(
            "/v1/uploads/{upload_id}/chunks/{chunk_index}",
            put(upload_chunk),
        )
        .route("/v1/uploads/{upload_id}/complete", post(complete_upload))
        .route(
            "/v1/uploads/{upload_id}/missing-chunks",
            get(missing_chunks),
        )
        .route("/v1/uploads/{upload_id}/download", get(download))
        .route("/v1/admin/cleanup", post(run_cleanup))
        .layer(DefaultBodyLimit::max(body_limit))
        // Added last so it wraps everything: every response, including
        // rejections from inner layers, carries X-Request-ID and is
        // observed in the latency histogram.
        .layer(middleware::from_fn_with_state(state.clone(), request_context))
        .with_state(state)
}
