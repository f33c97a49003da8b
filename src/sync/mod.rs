//! The sync protocol proper: incremental collection sync, the media-change
//! protocol, and full-collection replacement.

pub mod collection;
pub mod full;
pub mod media;

use crate::collection::ChunkTable;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde_json::Value;

/// Rows streamed per `chunk` response.
pub const CHUNK_ROWS: usize = 250;

/// Caps on one media download archive, from the collection library.
pub const SYNC_MAX_BYTES: u64 = 2_621_440;
pub const SYNC_MAX_FILES: usize = 25;

/// Caps on one uploaded media archive.
pub const MAX_ZIP_BYTES: u64 = 100 * 1024 * 1024;
pub const MAX_META_BYTES: u64 = 100_000;

/// What a handler hands back to the HTTP layer: structured payloads are
/// JSON-encoded, archives and database files go out as raw bytes.
#[derive(Debug)]
pub enum SyncOutput {
    Json(Value),
    Bytes(Vec<u8>),
    Text(String),
}

impl IntoResponse for SyncOutput {
    fn into_response(self) -> Response {
        match self {
            SyncOutput::Json(value) => (
                [(header::CONTENT_TYPE, "application/json")],
                value.to_string(),
            )
                .into_response(),
            SyncOutput::Bytes(bytes) => (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                bytes,
            )
                .into_response(),
            SyncOutput::Text(text) => text.into_response(),
        }
    }
}

/// Per-sync handler state. Captured at `start`, shared by every later step
/// of the same sync, and discarded by `finish`. Lives on the session so it
/// survives across the HTTP requests of one sync; the collection worker
/// serializes all access.
#[derive(Debug)]
pub struct SyncState {
    /// The client's last-seen server USN; the dirty window is `usn >= min_usn`.
    pub min_usn: i64,
    /// The server USN captured at `start`; outgoing rows are stamped with it.
    pub max_usn: i64,
    /// Which side's non-versioned structures win on merge. Stored inverted
    /// from the client's flag: each side evaluates "mine is newer" from its
    /// own point of view.
    pub lnewer: bool,
    pub chunk: Option<ChunkCursor>,
}

impl SyncState {
    pub fn new(min_usn: i64, max_usn: i64, client_lnewer: bool) -> Self {
        Self {
            min_usn,
            max_usn,
            lnewer: !client_lnewer,
            chunk: None,
        }
    }
}

/// Walks the chunked tables in protocol order, paging within the current
/// table by offset. Rows are not restamped until a table drains, so the
/// paging is stable across calls.
#[derive(Debug, Default)]
pub struct ChunkCursor {
    table_idx: usize,
    pub offset: u64,
}

impl ChunkCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<ChunkTable> {
        ChunkTable::ORDER.get(self.table_idx).copied()
    }

    pub fn advance(&mut self) {
        self.table_idx += 1;
        self.offset = 0;
    }

    pub fn done(&self) -> bool {
        self.table_idx >= ChunkTable::ORDER.len()
    }
}
