//! Idempotency records, one row per (operation kind, key).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;

/// Operation families tracked by the idempotency registry.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyKind {
    Init,
    Chunk,
    Complete,
}

impl IdempotencyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdempotencyKind::Init => "init",
            IdempotencyKind::Chunk => "chunk",
            IdempotencyKind::Complete => "complete",
        }
    }
}

/// A reserved idempotency key with the fingerprint of the request that
/// reserved it and, once the operation finished, its stored result.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct IdempotencyRecord {
    pub kind: IdempotencyKind,
    pub idempotency_key: String,

    /// Stable hash of the semantically significant request fields.
    pub request_fingerprint: String,

    /// JSON-serialized prior result, absent while the operation is still
    /// in flight.
    pub result: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Canonical fingerprint over the semantically significant request surface.
///
/// The value must be stable across replays, so callers pass fields in a
/// fixed order and the JSON is rendered compactly with sorted keys.
pub fn fingerprint(fields: &serde_json::Value) -> String {
    let canonical = canonical_json(fields);
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{:x}", digest)
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys
                .iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonical_json(&map[*k])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        serde_json::Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{}]", body)
        }
        other => other.to_string(),
    }
}
