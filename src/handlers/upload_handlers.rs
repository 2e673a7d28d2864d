//! HTTP handlers for the upload lifecycle: init, chunk upload, complete,
//! missing-chunks and download. Validation, idempotency and admission run
//! here; chunk persistence is delegated to the worker pipeline.

use crate::errors::{ApiError, ErrorKind};
use crate::models::{
    chunk::ChunkStatus,
    idempotency::{fingerprint, IdempotencyKind},
    upload::{Upload, UploadStatus},
};
use crate::routes::routes::RequestMeta;
use crate::services::assembler::{
    parse_range, plan_reads, stream_reads, ByteRange, ChunkRead, RangeError,
};
use crate::services::metadata::{CompleteOutcome, Reservation};
use crate::services::queue::{ChunkWriteTask, TaskOutcome};
use crate::state::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{Extension, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Multipart only pays off for parts a backend would accept; smaller
/// chunks always go through per-chunk objects.
const MIN_MULTIPART_PART_SIZE: i64 = 5 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct InitUploadRequest {
    pub file_name: String,
    pub file_size: i64,
    pub chunk_size: Option<i64>,
    pub total_chunks: Option<i64>,
    pub file_checksum_sha256: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitUploadResponse {
    pub upload_id: String,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub status: UploadStatus,
}

#[derive(Debug, Serialize)]
pub struct UploadChunkResponse {
    pub upload_id: String,
    pub chunk_index: i64,
    pub status: ChunkStatus,
}

#[derive(Debug, Deserialize, Default)]
pub struct CompleteUploadRequest {
    pub file_checksum_sha256: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CompleteUploadResponse {
    pub upload_id: String,
    pub status: UploadStatus,
}

#[derive(Debug, Serialize)]
pub struct MissingChunksResponse {
    pub upload_id: String,
    pub missing: Vec<i64>,
    pub status: UploadStatus,
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn normalized_checksum(raw: &Option<String>) -> Result<Option<String>, ApiError> {
    match raw {
        None => Ok(None),
        Some(value) => {
            let value = value.to_ascii_lowercase();
            if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ApiError::validation(
                    "file_checksum_sha256 must be 64 hex characters",
                ));
            }
            Ok(Some(value))
        }
    }
}

async fn owned_upload(
    state: &AppState,
    upload_id: &str,
    user_id: &str,
) -> Result<Upload, ApiError> {
    let upload = state
        .metadata
        .get_upload(upload_id)
        .await?
        .ok_or_else(|| ApiError::not_found("upload not found"))?;
    if upload.owner_id != user_id {
        return Err(ApiError::forbidden("forbidden for this upload owner"));
    }
    Ok(upload)
}

/// `POST /v1/uploads/init`
pub async fn init_upload(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    Json(payload): Json<InitUploadRequest>,
) -> Result<Response, ApiError> {
    init_upload_inner(&state, &meta, &headers, payload)
        .await
        .map_err(|err| err.with_request(&meta.request_id))
}

async fn init_upload_inner(
    state: &AppState,
    meta: &RequestMeta,
    headers: &HeaderMap,
    payload: InitUploadRequest,
) -> Result<Response, ApiError> {
    let user = state.auth.authenticate(headers)?;

    if payload.file_size < 0 {
        return Err(ApiError::validation("file_size must be nonnegative"));
    }
    let chunk_size = payload.chunk_size.unwrap_or(state.config.chunk_size_bytes);
    if chunk_size <= 0 {
        return Err(ApiError::validation("chunk_size must be positive"));
    }
    // The ceiling also sizes the HTTP body limit, so a chunk of any
    // accepted upload fits through the transport layer.
    if chunk_size > state.config.max_chunk_size_bytes {
        return Err(ApiError::validation(format!(
            "chunk_size exceeds the maximum of {} bytes",
            state.config.max_chunk_size_bytes
        )));
    }
    let total_chunks = (payload.file_size + chunk_size - 1) / chunk_size;
    if let Some(declared) = payload.total_chunks {
        if declared != total_chunks {
            return Err(ApiError::validation("total_chunks does not match file_size"));
        }
    }
    let file_checksum = normalized_checksum(&payload.file_checksum_sha256)?;

    let request_fingerprint = fingerprint(&json!({
        "owner_id": user.user_id,
        "file_name": payload.file_name,
        "file_size": payload.file_size,
        "chunk_size": chunk_size,
        "file_checksum_sha256": file_checksum,
    }));

    let key = idempotency_key(headers);
    let mut reserved = false;
    if let Some(key) = &key {
        match state
            .metadata
            .reserve_idempotency(IdempotencyKind::Init, key, &request_fingerprint)
            .await?
        {
            Reservation::Fresh => reserved = true,
            Reservation::Replay(Some(prior)) => {
                // Replays must not leak uploads across principals.
                if let Some(upload_id) = prior.get("upload_id").and_then(|v| v.as_str()) {
                    owned_upload(state, upload_id, &user.user_id).await?;
                }
                return Ok((StatusCode::CREATED, Json(prior)).into_response());
            }
            Reservation::Replay(None) => {
                return Err(ApiError::conflict("init request is still in progress"));
            }
            Reservation::Conflict => {
                return Err(ApiError::conflict(
                    "idempotency key reused with different init payload",
                ));
            }
        }
    }

    let result = create_upload(state, &user.user_id, &payload, chunk_size, total_chunks, file_checksum).await;
    match result {
        Ok(response_body) => {
            if let (true, Some(key)) = (reserved, &key) {
                state
                    .metadata
                    .store_idempotency_result(IdempotencyKind::Init, key, &response_body)
                    .await?;
            }
            info!(
                target: "audit",
                action = "upload_init",
                request_id = %meta.request_id,
                upload_id = %response_body["upload_id"].as_str().unwrap_or(""),
                user_id = %user.user_id,
                file_size = payload.file_size,
                total_chunks,
            );
            Ok((StatusCode::CREATED, Json(response_body)).into_response())
        }
        Err(err) => {
            if let (true, Some(key)) = (reserved, &key) {
                let _ = state
                    .metadata
                    .release_idempotency(IdempotencyKind::Init, key)
                    .await;
            }
            Err(err)
        }
    }
}

async fn create_upload(
    state: &AppState,
    owner_id: &str,
    payload: &InitUploadRequest,
    chunk_size: i64,
    total_chunks: i64,
    file_checksum: Option<String>,
) -> Result<serde_json::Value, ApiError> {
    let upload_id = Uuid::new_v4().to_string();

    let use_multipart = state.storage.supports_multipart()
        && total_chunks > 1
        && chunk_size >= MIN_MULTIPART_PART_SIZE;
    let multipart_upload_id = if use_multipart {
        state.storage.begin_multipart(&upload_id).await?
    } else {
        None
    };

    let now = Utc::now();
    let upload = Upload {
        id: upload_id,
        owner_id: owner_id.to_string(),
        file_name: payload.file_name.clone(),
        file_size: payload.file_size,
        chunk_size,
        total_chunks,
        file_checksum_sha256: file_checksum,
        status: UploadStatus::Initiated,
        multipart_upload_id,
        created_at: now,
        updated_at: now,
    };
    state.metadata.insert_upload(&upload).await?;

    Ok(json!({
        "upload_id": upload.id,
        "chunk_size": upload.chunk_size,
        "total_chunks": upload.total_chunks,
        "status": upload.status,
    }))
}

/// `PUT /v1/uploads/{upload_id}/chunks/{chunk_index}`
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((upload_id, chunk_index)): Path<(String, i64)>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    upload_chunk_inner(&state, &upload_id, chunk_index, &headers, body)
        .await
        .map_err(|err| err.with_request(&meta.request_id).with_upload(&upload_id))
}

async fn upload_chunk_inner(
    state: &AppState,
    upload_id: &str,
    chunk_index: i64,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let user = state.auth.authenticate(headers)?;
    let upload = owned_upload(state, upload_id, &user.user_id).await?;

    if !upload.status.accepts_chunks() {
        return Err(ApiError::conflict("upload is not accepting chunks"));
    }
    if chunk_index < 0 || chunk_index >= upload.total_chunks {
        return Err(ApiError::validation("chunk index out of bounds"));
    }
    if body.is_empty() {
        return Err(ApiError::validation("chunk payload is empty"));
    }
    if body.len() as i64 > upload.chunk_size {
        return Err(ApiError::new(
            ErrorKind::PayloadTooLarge,
            "chunk payload exceeds chunk_size",
        ));
    }
    if body.len() as i64 != upload.expected_chunk_size(chunk_index) {
        return Err(ApiError::validation("chunk payload has unexpected size"));
    }

    let body_checksum = format!("{:x}", Sha256::digest(&body));
    if let Some(declared) = headers.get("X-Chunk-SHA256").and_then(|v| v.to_str().ok()) {
        if !declared.eq_ignore_ascii_case(&body_checksum) {
            return Err(ApiError::checksum("chunk checksum mismatch"));
        }
    }

    // A chunk that already landed with the same bytes is acknowledged
    // without a second storage write.
    if let Some(existing) = state.metadata.get_chunk(upload_id, chunk_index).await? {
        if existing.status == ChunkStatus::Uploaded {
            if existing.chunk_checksum_sha256.as_deref() == Some(body_checksum.as_str()) {
                return Ok(chunk_accepted(upload_id, chunk_index));
            }
            return Err(ApiError::conflict(
                "chunk already uploaded with different payload",
            ));
        }
    }

    let request_fingerprint = fingerprint(&json!({
        "upload_id": upload_id,
        "chunk_index": chunk_index,
        "body_sha256": body_checksum,
    }));
    let key = idempotency_key(headers);
    let mut reserved = false;
    if let Some(key) = &key {
        match state
            .metadata
            .reserve_idempotency(IdempotencyKind::Chunk, key, &request_fingerprint)
            .await?
        {
            Reservation::Fresh => reserved = true,
            Reservation::Replay(Some(_)) => {
                return Ok(chunk_accepted(upload_id, chunk_index));
            }
            Reservation::Replay(None) => {
                return Err(ApiError::conflict("chunk request is still in progress"));
            }
            Reservation::Conflict => {
                return Err(ApiError::conflict(
                    "idempotency key reused with different chunk payload",
                ));
            }
        }
    }

    let result = persist_chunk(state, &upload, chunk_index, body).await;
    match result {
        Ok(()) => {
            if let (true, Some(key)) = (reserved, &key) {
                state
                    .metadata
                    .store_idempotency_result(
                        IdempotencyKind::Chunk,
                        key,
                        &json!({"upload_id": upload_id, "chunk_index": chunk_index}),
                    )
                    .await?;
            }
            Ok(chunk_accepted(upload_id, chunk_index))
        }
        Err(err) => {
            if let (true, Some(key)) = (reserved, &key) {
                let _ = state
                    .metadata
                    .release_idempotency(IdempotencyKind::Chunk, key)
                    .await;
            }
            Err(err)
        }
    }
}

fn chunk_accepted(upload_id: &str, chunk_index: i64) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(UploadChunkResponse {
            upload_id: upload_id.to_string(),
            chunk_index,
            status: ChunkStatus::Uploaded,
        }),
    )
        .into_response()
}

/// Admit the write, hand it to the executor (direct pool or durable
/// queue), and gate the response on the task's completion signal.
async fn persist_chunk(
    state: &AppState,
    upload: &Upload,
    chunk_index: i64,
    body: Bytes,
) -> Result<(), ApiError> {
    let permit = state
        .limiters
        .acquire(&upload.id)
        .map_err(ApiError::backpressure)?;

    let task =
        ChunkWriteTask::from_bytes(&upload.id, chunk_index, &body, upload.multipart_upload_id.clone());
    let task_id = task.task_id.clone();
    let receiver = state.results.register(&task_id);
    let wait_timeout = Duration::from_secs(state.config.queue_task_timeout_seconds.max(1));

    // In durable mode the permit stays on the acceptance path and is
    // released when this scope ends, whatever the outcome. In direct mode
    // it travels with the task.
    let _held_permit;
    if state.durable_route {
        state.queue.enqueue(task).await?;
        _held_permit = Some(permit);
    } else {
        state.pool.submit(task, permit).await;
        _held_permit = None;
    }

    match tokio::time::timeout(wait_timeout, receiver).await {
        Ok(Ok(TaskOutcome::Uploaded { .. })) => Ok(()),
        Ok(Ok(TaskOutcome::Failed { detail })) => Err(ApiError::new(
            ErrorKind::Storage,
            format!("chunk upload failed: {}", detail),
        )),
        Ok(Err(_)) => Err(ApiError::internal("chunk task was dropped")),
        Err(_) => {
            state.results.forget(&task_id);
            Err(ApiError::new(
                ErrorKind::QueueTimeout,
                "timed out waiting for chunk task result",
            ))
        }
    }
}

/// `POST /v1/uploads/{upload_id}/complete`
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    payload: Option<Json<CompleteUploadRequest>>,
) -> Result<Response, ApiError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    complete_upload_inner(&state, &upload_id, &meta, &headers, payload)
        .await
        .map_err(|err| err.with_request(&meta.request_id).with_upload(&upload_id))
}

async fn complete_upload_inner(
    state: &AppState,
    upload_id: &str,
    meta: &RequestMeta,
    headers: &HeaderMap,
    payload: CompleteUploadRequest,
) -> Result<Response, ApiError> {
    let user = state.auth.authenticate(headers)?;
    let upload = owned_upload(state, upload_id, &user.user_id).await?;
    let request_checksum = normalized_checksum(&payload.file_checksum_sha256)?;

    let request_fingerprint = fingerprint(&json!({
        "upload_id": upload_id,
        "file_checksum_sha256": request_checksum,
    }));
    let key = idempotency_key(headers);
    let mut reserved = false;
    if let Some(key) = &key {
        match state
            .metadata
            .reserve_idempotency(IdempotencyKind::Complete, key, &request_fingerprint)
            .await?
        {
            Reservation::Fresh => reserved = true,
            Reservation::Replay(Some(prior)) => {
                return Ok((StatusCode::OK, Json(prior)).into_response());
            }
            Reservation::Replay(None) => {
                return Err(ApiError::conflict("complete request is still in progress"));
            }
            Reservation::Conflict => {
                return Err(ApiError::conflict(
                    "idempotency key reused with different complete payload",
                ));
            }
        }
    }

    let result = finalize_upload(state, &upload, request_checksum).await;
    match result {
        Ok(response_body) => {
            if let (true, Some(key)) = (reserved, &key) {
                state
                    .metadata
                    .store_idempotency_result(IdempotencyKind::Complete, key, &response_body)
                    .await?;
            }
            info!(
                target: "audit",
                action = "upload_complete",
                request_id = %meta.request_id,
                upload_id = %upload.id,
                user_id = %user.user_id,
            );
            Ok((StatusCode::OK, Json(response_body)).into_response())
        }
        Err(err) => {
            if let (true, Some(key)) = (reserved, &key) {
                let _ = state
                    .metadata
                    .release_idempotency(IdempotencyKind::Complete, key)
                    .await;
            }
            Err(err)
        }
    }
}

async fn finalize_upload(
    state: &AppState,
    upload: &Upload,
    request_checksum: Option<String>,
) -> Result<serde_json::Value, ApiError> {
    if upload.status.is_terminal() {
        return Err(ApiError::new(
            ErrorKind::Terminal,
            format!("upload already in terminal state {}", upload.status),
        ));
    }

    let chunks = state.metadata.list_chunks_ordered(&upload.id).await?;
    let uploaded: Vec<_> = chunks
        .iter()
        .filter(|c| c.status == ChunkStatus::Uploaded)
        .collect();
    if (uploaded.len() as i64) < upload.total_chunks {
        return Err(ApiError::conflict(format!(
            "cannot complete upload, {} of {} chunks uploaded",
            uploaded.len(),
            upload.total_chunks
        )));
    }

    // Whole-file verification reads chunks in index order and recomputes a
    // rolling hash. A mismatch fails the upload rather than completing it.
    let expected_checksum = request_checksum.or_else(|| upload.file_checksum_sha256.clone());
    if let Some(expected) = expected_checksum {
        let mut hasher = Sha256::new();
        for chunk in &uploaded {
            let data = state.storage.get(&chunk.storage_key, None, None).await?;
            hasher.update(&data);
        }
        let actual = format!("{:x}", hasher.finalize());
        if actual != expected {
            state
                .metadata
                .cas_upload_status(
                    &upload.id,
                    &[UploadStatus::Initiated, UploadStatus::InProgress],
                    UploadStatus::Failed,
                )
                .await?;
            return Err(ApiError::checksum("file checksum mismatch"));
        }
    }

    if let Some(handle) = &upload.multipart_upload_id {
        let parts: Option<Vec<(i64, String)>> = uploaded
            .iter()
            .map(|c| c.storage_etag.clone().map(|etag| (c.chunk_index, etag)))
            .collect();
        match parts {
            // Missing part etags fall back to the per-chunk objects, which
            // remain a complete representation of the file. Clearing the
            // handle steers downloads onto the per-chunk path.
            None => {
                let _ = state.storage.abort_multipart(&upload.id, handle).await;
                state.metadata.set_multipart_handle(&upload.id, None).await?;
            }
            Some(parts) => {
                state.storage.commit_multipart(&upload.id, handle, &parts).await?;
            }
        }
    }

    match state.metadata.finalize_complete(upload).await? {
        CompleteOutcome::Completed => Ok(json!({
            "upload_id": upload.id,
            "status": UploadStatus::Completed,
        })),
        CompleteOutcome::MissingChunks { uploaded } => Err(ApiError::conflict(format!(
            "cannot complete upload, {} of {} chunks uploaded",
            uploaded, upload.total_chunks
        ))),
        CompleteOutcome::LostRace => Err(ApiError::new(
            ErrorKind::Terminal,
            "upload already reached a terminal state",
        )),
    }
}

/// `GET /v1/uploads/{upload_id}/missing-chunks`
pub async fn missing_chunks(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    missing_chunks_inner(&state, &upload_id, &headers)
        .await
        .map_err(|err| err.with_request(&meta.request_id).with_upload(&upload_id))
}

async fn missing_chunks_inner(
    state: &AppState,
    upload_id: &str,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let user = state.auth.authenticate(headers)?;
    let upload = owned_upload(state, upload_id, &user.user_id).await?;
    let missing = state
        .metadata
        .missing_indices(upload_id, upload.total_chunks)
        .await?;
    Ok(Json(MissingChunksResponse {
        upload_id: upload_id.to_string(),
        missing,
        status: upload.status,
    })
    .into_response())
}

/// `GET /v1/uploads/{upload_id}/download`
pub async fn download(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    download_inner(&state, &upload_id, &meta, &headers)
        .await
        .map_err(|err| err.with_request(&meta.request_id).with_upload(&upload_id))
}

async fn download_inner(
    state: &AppState,
    upload_id: &str,
    meta: &RequestMeta,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let user = state.auth.authenticate(headers)?;
    let upload = owned_upload(state, upload_id, &user.user_id).await?;
    if upload.status != UploadStatus::Completed {
        return Err(ApiError::conflict("upload is not completed"));
    }

    let chunks = state.metadata.list_chunks_ordered(upload_id).await?;
    if chunks.len() as i64 != upload.total_chunks {
        return Err(ApiError::internal("upload metadata is inconsistent"));
    }

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(raw) => Some(parse_range(raw, upload.file_size).map_err(|err| match err {
            RangeError::Malformed => ApiError::range("invalid range header"),
            RangeError::Unsatisfiable => ApiError::range("range out of bounds"),
        })?),
        None => None,
    };

    info!(
        target: "audit",
        action = "download",
        request_id = %meta.request_id,
        upload_id = %upload.id,
        user_id = %user.user_id,
        range_requested = range.is_some(),
    );

    let full = ByteRange {
        start: 0,
        end: (upload.file_size - 1).max(0),
    };
    let effective = range.unwrap_or(full);
    // A COMPLETED upload only keeps its multipart handle when the commit
    // produced the assembled object, so the range can be served from that
    // single blob; otherwise assemble from the per-chunk objects.
    let plan = if upload.multipart_upload_id.is_some() {
        vec![ChunkRead {
            storage_key: state.storage.assembled_key(upload_id),
            offset: Some(effective.start as u64),
            length: Some((effective.end - effective.start + 1) as u64),
        }]
    } else {
        plan_reads(&chunks, effective)
    };
    let body = Body::from_stream(stream_reads(Arc::clone(&state.storage), plan));

    let mut response = Response::new(body);
    let response_len = if upload.file_size == 0 {
        0
    } else {
        effective.end - effective.start + 1
    };
    let headers_mut = response.headers_mut();
    headers_mut.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers_mut.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers_mut.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&response_len.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    if let Ok(value) = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        upload.file_name.replace('"', "")
    )) {
        headers_mut.insert(header::CONTENT_DISPOSITION, value);
    }

    if range.is_some() {
        headers_mut.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!(
                "bytes {}-{}/{}",
                effective.start, effective.end, upload.file_size
            ))
            .unwrap_or_else(|_| HeaderValue::from_static("")),
        );
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    }

    Ok(response)
}
