//! Embedded storage engine for OpenTelemetry trace spans.
//!
//! One span per record, compressed at the record level, keyed by a
//! time-ordered 24-byte key inside (service, month) partitions. See
//! [`TraceDb`] for the operation surface.

pub mod codec;
pub mod db;
pub mod error;
pub mod key;
pub mod record;

pub use codec::UNKNOWN_SERVICE;
pub use db::{TraceDb, DEFAULT_RETENTION_DAYS, DEFAULT_SPAN_LIMIT, DEFAULT_TRACE_ID_LIMIT};
pub use error::StoreError;
pub use record::{ServiceSummary, SpanRecord, StatusCode};

// Re-exported so ingest front-ends and the store agree on one proto version.
pub use opentelemetry_proto;
