//! Download assembly: ordered chunk streaming with HTTP range translation
//! across chunk boundaries.

use crate::models::chunk::Chunk;
use crate::services::storage::ChunkStorage;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid range header")]
    Malformed,
    #[error("range out of bounds")]
    Unsatisfiable,
}

/// Inclusive byte range within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: i64,
    pub end: i64,
}

/// Parse a `Range: bytes=a-b` header against the file size. An omitted
/// start means 0; an omitted end means the last byte.
pub fn parse_range(header: &str, file_size: i64) -> Result<ByteRange, RangeError> {
    let spec = header.strip_prefix("bytes=").ok_or(RangeError::Malformed)?;
    let (raw_start, raw_end) = spec.split_once('-').ok_or(RangeError::Malformed)?;

    let start = if raw_start.is_empty() {
        0
    } else {
        raw_start.parse::<i64>().map_err(|_| RangeError::Malformed)?
    };
    let end = if raw_end.is_empty() {
        file_size - 1
    } else {
        raw_end.parse::<i64>().map_err(|_| RangeError::Malformed)?
    };

    if start < 0 || end < start || end >= file_size {
        return Err(RangeError::Unsatisfiable);
    }
    Ok(ByteRange { start, end })
}

/// One storage read in the assembly plan: a chunk key plus the sub-range
/// of it that belongs to the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRead {
    pub storage_key: String,
    pub offset: Option<u64>,
    pub length: Option<u64>,
}

/// Translate a byte range into per-chunk reads. Chunks are walked in index
/// order with a running cursor, so a short final chunk needs no special
/// case: the first chunk is skipped into, the last is cut short, and
/// intermediate chunks are read whole.
pub fn plan_reads(chunks: &[Chunk], range: ByteRange) -> Vec<ChunkRead> {
    let mut plan = Vec::new();
    let mut cursor: i64 = 0;
    for chunk in chunks {
        let next_cursor = cursor + chunk.size_bytes;
        if next_cursor <= range.start {
            cursor = next_cursor;
            continue;
        }
        if cursor > range.end {
            break;
        }

        let read_start = (range.start - cursor).max(0);
        let read_end = (range.end - cursor).min(chunk.size_bytes - 1);
        if read_start <= read_end {
            let whole = read_start == 0 && read_end == chunk.size_bytes - 1;
            plan.push(ChunkRead {
                storage_key: chunk.storage_key.clone(),
                offset: if whole { None } else { Some(read_start as u64) },
                length: if whole {
                    None
                } else {
                    Some((read_end - read_start + 1) as u64)
                },
            });
        }
        cursor = next_cursor;
    }
    plan
}

/// Execute a plan as a byte stream suitable for a streaming response body.
pub fn stream_reads(
    storage: Arc<dyn ChunkStorage>,
    plan: Vec<ChunkRead>,
) -> impl Stream<Item = io::Result<Bytes>> {
    futures::stream::iter(plan).then(move |read| {
        let storage = Arc::clone(&storage);
        async move {
            storage
                .get(&read.storage_key, read.offset, read.length)
                .await
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chunk::ChunkStatus;
    use chrono::Utc;

    fn chunk(index: i64, size: i64) -> Chunk {
        Chunk {
            id: index,
            upload_id: "u1".into(),
            chunk_index: index,
            size_bytes: size,
            chunk_checksum_sha256: None,
            storage_key: format!("uploads/u1/chunk_{}", index),
            storage_etag: None,
            status: ChunkStatus::Uploaded,
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    // chunk_size=4, file 10 bytes: sizes 4, 4, 2.
    fn three_chunks() -> Vec<Chunk> {
        vec![chunk(0, 4), chunk(1, 4), chunk(2, 2)]
    }

    #[test]
    fn parse_rejects_malformed_headers() {
        assert_eq!(parse_range("0-5", 10), Err(RangeError::Malformed));
        assert_eq!(parse_range("bytes=a-b", 10), Err(RangeError::Malformed));
        assert_eq!(parse_range("bytes=5", 10), Err(RangeError::Malformed));
    }

    #[test]
    fn parse_rejects_unsatisfiable_ranges() {
        assert_eq!(parse_range("bytes=7-2", 10), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=0-10", 10), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=10-12", 10), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn parse_fills_in_open_ends() {
        assert_eq!(parse_range("bytes=2-", 10), Ok(ByteRange { start: 2, end: 9 }));
        assert_eq!(parse_range("bytes=-7", 10), Ok(ByteRange { start: 0, end: 7 }));
    }

    #[test]
    fn plan_crosses_chunk_boundaries() {
        // bytes 2-7 of "0123456789": tail of chunk 0, whole chunk 1.
        let plan = plan_reads(&three_chunks(), ByteRange { start: 2, end: 7 });
        assert_eq!(
            plan,
            vec![
                ChunkRead {
                    storage_key: "uploads/u1/chunk_0".into(),
                    offset: Some(2),
                    length: Some(2),
                },
                ChunkRead {
                    storage_key: "uploads/u1/chunk_1".into(),
                    offset: None,
                    length: None,
                },
            ]
        );
    }

    #[test]
    fn plan_for_full_file_reads_all_chunks_whole() {
        let plan = plan_reads(&three_chunks(), ByteRange { start: 0, end: 9 });
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|r| r.offset.is_none() && r.length.is_none()));
    }

    #[test]
    fn plan_within_single_chunk() {
        let plan = plan_reads(&three_chunks(), ByteRange { start: 5, end: 6 });
        assert_eq!(
            plan,
            vec![ChunkRead {
                storage_key: "uploads/u1/chunk_1".into(),
                offset: Some(1),
                length: Some(2),
            }]
        );
    }

    #[test]
    fn plan_covers_short_final_chunk() {
        let plan = plan_reads(&three_chunks(), ByteRange { start: 8, end: 9 });
        assert_eq!(
            plan,
            vec![ChunkRead {
                storage_key: "uploads/u1/chunk_2".into(),
                offset: None,
                length: None,
            }]
        );
    }
}
