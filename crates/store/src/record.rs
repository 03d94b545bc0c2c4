use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::key::{SPAN_ID_LEN, TRACE_ID_LEN};

/// Span status as stored: the closed set of OTLP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    /// Map a raw OTLP status code; unknown values collapse to `Unset`.
    pub fn from_raw(code: i32) -> Self {
        match code {
            1 => StatusCode::Ok,
            2 => StatusCode::Error,
            _ => StatusCode::Unset,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            StatusCode::Unset => 0,
            StatusCode::Ok => 1,
            StatusCode::Error => 2,
        }
    }
}

/// One decoded span record as returned by every read path.
///
/// Identifiers are lowercase hex; `parent_span_id` is empty when the span
/// has no parent. `raw` is the span's original protobuf encoding, suitable
/// for handing to any downstream OTLP consumer.
#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub name: String,
    pub month: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: StatusCode,
    pub raw: Vec<u8>,
}

/// Per-service summary returned by service enumeration.
#[derive(Debug, Clone)]
pub struct ServiceSummary {
    pub name: String,
    pub span_count: u64,
    pub trace_count: u64,
    pub last_updated: DateTime<Utc>,
}

/// Decode a hex trace id, enforcing the 16-byte length.
pub fn parse_trace_id(s: &str) -> Result<[u8; TRACE_ID_LEN], StoreError> {
    let bytes = hex::decode(s).map_err(|e| StoreError::InvalidId(format!("trace id: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| StoreError::InvalidId(format!("trace id must be {} bytes", TRACE_ID_LEN)))
}

/// Decode a hex span id, enforcing the 8-byte length.
pub fn parse_span_id(s: &str) -> Result<[u8; SPAN_ID_LEN], StoreError> {
    let bytes = hex::decode(s).map_err(|e| StoreError::InvalidId(format!("span id: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| StoreError::InvalidId(format!("span id must be {} bytes", SPAN_ID_LEN)))
}
