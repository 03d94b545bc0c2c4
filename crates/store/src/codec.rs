//! Record values: a single span wrapped with its original resource and
//! instrumentation scope, protobuf-encoded and DEFLATE-compressed per record.

use std::io::{Read, Write};

use chrono::DateTime;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use opentelemetry_proto::tonic::common::v1::any_value;
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use prost::Message;

use crate::error::StoreError;
use crate::record::{SpanRecord, StatusCode};

/// Partition name used when the resource carries no `service.name`.
pub const UNKNOWN_SERVICE: &str = "unknown";

/// The `service.name` resource attribute, or [`UNKNOWN_SERVICE`].
pub fn service_name(resource: Option<&Resource>) -> String {
    resource
        .and_then(|r| r.attributes.iter().find(|kv| kv.key == "service.name"))
        .and_then(|kv| kv.value.as_ref())
        .and_then(|v| match &v.value {
            Some(any_value::Value::StringValue(s)) => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_else(|| UNKNOWN_SERVICE.to_string())
}

/// Re-wrap one span of a batch as a self-contained `ResourceSpans`, keeping
/// the original resource and scope so the record decodes without siblings.
pub fn wrap_span(batch: &ResourceSpans, scope: &ScopeSpans, span: &Span) -> ResourceSpans {
    ResourceSpans {
        resource: batch.resource.clone(),
        scope_spans: vec![ScopeSpans {
            scope: scope.scope.clone(),
            spans: vec![span.clone()],
            schema_url: scope.schema_url.clone(),
        }],
        schema_url: batch.schema_url.clone(),
    }
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes)?;
    Ok(enc.finish()?)
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(out)
}

/// Serialize and compress a single-span wrapper record.
pub fn encode_record(record: &ResourceSpans) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::with_capacity(record.encoded_len());
    record.encode(&mut buf)?;
    compress(&buf)
}

/// Decompress and decode a stored value into a [`SpanRecord`].
///
/// `month` is the name of the partition the value was read from; it is not
/// part of the value itself. Any malformed value is a [`StoreError::Corrupt`],
/// which scans treat as skip-this-record.
pub fn decode_record(bytes: &[u8], month: &str) -> Result<SpanRecord, StoreError> {
    let plain = decompress(bytes)?;
    let wrapper =
        ResourceSpans::decode(plain.as_slice()).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let scope = wrapper
        .scope_spans
        .first()
        .ok_or_else(|| StoreError::Corrupt("record has no scope".into()))?;
    let span = scope
        .spans
        .first()
        .ok_or_else(|| StoreError::Corrupt("record has no span".into()))?;

    Ok(SpanRecord {
        trace_id: hex::encode(&span.trace_id),
        span_id: hex::encode(&span.span_id),
        parent_span_id: hex::encode(&span.parent_span_id),
        name: span.name.clone(),
        month: month.to_string(),
        start: DateTime::from_timestamp_nanos(span.start_time_unix_nano as i64),
        end: DateTime::from_timestamp_nanos(span.end_time_unix_nano as i64),
        status: StatusCode::from_raw(span.status.as_ref().map(|s| s.code).unwrap_or(0)),
        raw: span.encode_to_vec(),
    })
}
