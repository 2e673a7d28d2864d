//! Core data models for the chunked file transfer service.
//!
//! These entities represent uploads, their chunks, and idempotency records.
//! They map cleanly to database tables via `sqlx::FromRow` and serialize
//! naturally as JSON via `serde`.

pub mod chunk;
pub mod idempotency;
pub mod upload;
