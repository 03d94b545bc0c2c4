//! The trace store: a single-file database holding one record per span,
//! partitioned by service and calendar month.
//!
//! Partitions are the leading columns of the primary key; within one
//! (service, month) pair records sort bytewise by their 24-byte key, which
//! is chronological order by span start. SQLite in WAL mode provides the
//! transaction contract: one writer at a time, any number of snapshot
//! readers alongside it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};

use crate::codec;
use crate::error::StoreError;
use crate::key;
use crate::record::{parse_span_id, parse_trace_id, ServiceSummary, SpanRecord};

pub const DEFAULT_RETENTION_DAYS: i64 = 60;
pub const DEFAULT_SPAN_LIMIT: usize = 50;
pub const DEFAULT_TRACE_ID_LIMIT: usize = 100;

/// Half-width of the window scanned around an anchor span when
/// reconstructing a trace. Bounds clock skew across services; a policy
/// constant, not a query parameter.
const TREE_WINDOW_MINUTES: i64 = 2;

const BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS spans (
    service TEXT NOT NULL,
    month   TEXT NOT NULL,
    key     BLOB NOT NULL,
    value   BLOB NOT NULL,
    PRIMARY KEY (service, month, key)
) WITHOUT ROWID;
"#;

pub struct TraceDb {
    path: PathBuf,
    writer: Mutex<Option<Connection>>,
    closed: AtomicBool,
    retention_days: i64,
}

impl TraceDb {
    /// Open or create the database at `path`.
    ///
    /// Non-positive `retention_days` falls back to the 60-day default.
    /// Fails if the file cannot be created or the write lock cannot be
    /// taken.
    pub fn open(path: impl AsRef<Path>, retention_days: i64) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        // Take and release the write lock once so a competing writer fails
        // here rather than on its first insert.
        conn.transaction_with_behavior(TransactionBehavior::Immediate)?
            .commit()?;

        let retention_days = if retention_days <= 0 {
            DEFAULT_RETENTION_DAYS
        } else {
            retention_days
        };
        tracing::info!(path = %path.display(), retention_days, "opened trace store");

        Ok(Self {
            path,
            writer: Mutex::new(Some(conn)),
            closed: AtomicBool::new(false),
            retention_days,
        })
    }

    /// Release the file handle. Every subsequent operation fails with
    /// [`StoreError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retention_days(&self) -> i64 {
        self.retention_days
    }

    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    }

    /// A fresh read-only connection. In WAL mode its deferred transaction
    /// is a consistent snapshot concurrent with the single writer.
    fn read_conn(&self) -> Result<Connection, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Store one batch of resource spans, fanned out to one record per span.
    ///
    /// All spans in the batch land in one transaction under the service
    /// named by the resource's `service.name` attribute (or `unknown`).
    /// Returns the number of records written.
    pub fn write_resource_spans(&self, batch: &ResourceSpans) -> Result<usize, StoreError> {
        let service = codec::service_name(batch.resource.as_ref());
        self.with_writer(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut written = 0usize;
            {
                let mut insert = tx.prepare_cached(
                    "INSERT INTO spans (service, month, key, value) VALUES (?1, ?2, ?3, ?4)",
                )?;
                let mut rng = rand::thread_rng();
                for scope in &batch.scope_spans {
                    for span in &scope.spans {
                        let start = if span.start_time_unix_nano > 0 {
                            DateTime::from_timestamp_nanos(span.start_time_unix_nano as i64)
                        } else {
                            Utc::now()
                        };
                        let month = key::month_name(start);
                        let record_key = key::span_key(start, &span.span_id, &mut rng)?;
                        let value = codec::encode_record(&codec::wrap_span(batch, scope, span))?;
                        insert.execute(params![service, month, &record_key[..], value])?;
                        written += 1;
                    }
                }
            }
            tx.commit()?;
            Ok(written)
        })
    }

    /// Up to `limit` span records for `service`, newest first by stored key.
    ///
    /// `limit == 0` means the default of 50. An unknown service is an empty
    /// result. Records that fail to decode are skipped.
    pub fn get_spans(&self, service: &str, limit: usize) -> Result<Vec<SpanRecord>, StoreError> {
        let limit = if limit == 0 { DEFAULT_SPAN_LIMIT } else { limit };
        let conn = self.read_conn()?;
        let tx = conn.unchecked_transaction()?;

        let months = service_months_desc(&tx, service)?;
        let mut out = Vec::new();
        'months: for month in &months {
            let mut stmt = tx.prepare_cached(
                "SELECT value FROM spans WHERE service = ?1 AND month = ?2 ORDER BY key DESC",
            )?;
            let mut rows = stmt.query(params![service, month])?;
            while let Some(row) = rows.next()? {
                let value: Vec<u8> = row.get(0)?;
                if let Ok(rec) = codec::decode_record(&value, month) {
                    out.push(rec);
                    if out.len() >= limit {
                        break 'months;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Up to `limit` distinct trace ids for `service`, ordered by the start
    /// time of each trace's newest span. `limit == 0` means the default of
    /// 100.
    pub fn get_trace_ids(&self, service: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let limit = if limit == 0 { DEFAULT_TRACE_ID_LIMIT } else { limit };
        let conn = self.read_conn()?;
        let tx = conn.unchecked_transaction()?;

        let months = service_months_desc(&tx, service)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        'months: for month in &months {
            let mut stmt = tx.prepare_cached(
                "SELECT value FROM spans WHERE service = ?1 AND month = ?2 ORDER BY key DESC",
            )?;
            let mut rows = stmt.query(params![service, month])?;
            while let Some(row) = rows.next()? {
                let value: Vec<u8> = row.get(0)?;
                if let Ok(rec) = codec::decode_record(&value, month) {
                    if seen.insert(rec.trace_id.clone()) {
                        out.push(rec.trace_id);
                        if out.len() >= limit {
                            break 'months;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Summarise every service partition.
    ///
    /// The last-updated time comes from the newest key of the most recent
    /// month, decoded from the key bytes alone; span and trace counts walk
    /// every record of the service.
    pub fn list_services(&self) -> Result<Vec<ServiceSummary>, StoreError> {
        let conn = self.read_conn()?;
        let tx = conn.unchecked_transaction()?;

        let services = all_services(&tx)?;
        let mut out = Vec::with_capacity(services.len());
        for service in &services {
            let span_count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM spans WHERE service = ?1",
                [service],
                |r| r.get(0),
            )?;
            let newest: Option<Vec<u8>> = tx
                .query_row(
                    "SELECT key FROM spans WHERE service = ?1 ORDER BY month DESC, key DESC LIMIT 1",
                    [service],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(newest) = newest else { continue };
            let last_updated = DateTime::from_timestamp_millis(key::key_millis(&newest))
                .unwrap_or(DateTime::UNIX_EPOCH);

            let mut seen = HashSet::new();
            let mut stmt =
                tx.prepare_cached("SELECT month, value FROM spans WHERE service = ?1")?;
            let mut rows = stmt.query([service])?;
            while let Some(row) = rows.next()? {
                let month: String = row.get(0)?;
                let value: Vec<u8> = row.get(1)?;
                if let Ok(rec) = codec::decode_record(&value, &month) {
                    seen.insert(rec.trace_id);
                }
            }

            out.push(ServiceSummary {
                name: service.clone(),
                span_count: span_count as u64,
                trace_count: seen.len() as u64,
                last_updated,
            });
        }
        Ok(out)
    }

    /// Every span whose trace id equals `trace_id` (hex, 32 chars), across
    /// all services. Full scan; result order is unspecified.
    pub fn get_trace_by_id(&self, trace_id: &str) -> Result<Vec<SpanRecord>, StoreError> {
        let want = hex::encode(parse_trace_id(trace_id)?);
        let conn = self.read_conn()?;
        let tx = conn.unchecked_transaction()?;

        let mut out = Vec::new();
        let mut stmt = tx.prepare("SELECT month, value FROM spans")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let month: String = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            if let Ok(rec) = codec::decode_record(&value, &month) {
                if rec.trace_id == want {
                    out.push(rec);
                }
            }
        }
        Ok(out)
    }

    /// Reconstruct the trace around the span with id `span_id` (hex,
    /// 16 chars).
    ///
    /// Phase one finds the anchor by key suffix alone; phase two scans a
    /// ±2-minute window around the anchor's start across every service and
    /// keeps the spans sharing its trace id, both window edges inclusive.
    /// No anchor means an empty result.
    pub fn get_span_tree(&self, span_id: &str) -> Result<Vec<SpanRecord>, StoreError> {
        let want = parse_span_id(span_id)?;
        let conn = self.read_conn()?;
        let tx = conn.unchecked_transaction()?;

        let anchor = {
            let mut stmt =
                tx.prepare("SELECT service, month, key FROM spans ORDER BY service, month, key")?;
            let mut rows = stmt.query([])?;
            let mut found = None;
            while let Some(row) = rows.next()? {
                let record_key: Vec<u8> = row.get(2)?;
                if key::key_suffix(&record_key) != Some(&want[..]) {
                    continue;
                }
                let service: String = row.get(0)?;
                let month: String = row.get(1)?;
                let value: Vec<u8> = tx.query_row(
                    "SELECT value FROM spans WHERE service = ?1 AND month = ?2 AND key = ?3",
                    params![service, month, record_key],
                    |r| r.get(0),
                )?;
                if let Ok(rec) = codec::decode_record(&value, &month) {
                    found = Some(rec);
                    break;
                }
                // suffix matched but the record is corrupt: keep searching
            }
            found
        };
        let Some(anchor) = anchor else {
            return Ok(Vec::new());
        };

        let lower = anchor.start - chrono::Duration::minutes(TREE_WINDOW_MINUTES);
        let upper = anchor.start + chrono::Duration::minutes(TREE_WINDOW_MINUTES);
        let lower_key = key::lower_bound(lower);
        let upper_key = key::upper_bound(upper);
        let months = key::month_range(lower, upper);

        let mut out = Vec::new();
        for service in &all_services(&tx)? {
            for month in &months {
                let mut stmt = tx.prepare_cached(
                    "SELECT value FROM spans
                     WHERE service = ?1 AND month = ?2 AND key >= ?3 AND key <= ?4
                     ORDER BY key",
                )?;
                let mut rows =
                    stmt.query(params![service, month, &lower_key[..], &upper_key[..]])?;
                while let Some(row) = rows.next()? {
                    let value: Vec<u8> = row.get(0)?;
                    if let Ok(rec) = codec::decode_record(&value, month) {
                        if rec.trace_id == anchor.trace_id {
                            out.push(rec);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Drop every month partition that ended before `now − retention`, in
    /// one transaction. Month names that do not parse are preserved.
    /// Returns the number of partitions dropped.
    pub fn cleanup(&self) -> Result<usize, StoreError> {
        self.cleanup_at(Utc::now())
    }

    fn cleanup_at(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = now - chrono::Duration::days(self.retention_days);
        self.with_writer(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let pairs: Vec<(String, String)> = {
                let mut stmt = tx.prepare("SELECT DISTINCT service, month FROM spans")?;
                let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
                let mut v = Vec::new();
                for pair in rows {
                    v.push(pair?);
                }
                v
            };
            let mut dropped = 0usize;
            {
                let mut delete =
                    tx.prepare_cached("DELETE FROM spans WHERE service = ?1 AND month = ?2")?;
                for (service, month) in &pairs {
                    let Some(end) = key::end_of_month(month) else {
                        continue;
                    };
                    if end < cutoff {
                        delete.execute(params![service, month])?;
                        dropped += 1;
                    }
                }
            }
            tx.commit()?;
            if dropped > 0 {
                tracing::debug!(dropped, "retention cleanup dropped month partitions");
            }
            Ok(dropped)
        })
    }

    /// Atomically drop a whole service partition. A missing service is a
    /// successful no-op.
    pub fn delete_service(&self, service: &str) -> Result<(), StoreError> {
        self.with_writer(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM spans WHERE service = ?1", [service])?;
            tx.commit()?;
            Ok(())
        })
    }
}

fn service_months_desc(conn: &Connection, service: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt =
        conn.prepare_cached("SELECT DISTINCT month FROM spans WHERE service = ?1 ORDER BY month DESC")?;
    let rows = stmt.query_map([service], |r| r.get(0))?;
    let mut months = Vec::new();
    for month in rows {
        months.push(month?);
    }
    Ok(months)
}

fn all_services(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT DISTINCT service FROM spans ORDER BY service")?;
    let rows = stmt.query_map([], |r| r.get(0))?;
    let mut services = Vec::new();
    for service in rows {
        services.push(service?);
    }
    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::month_name;
    use chrono::Duration;
    use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
    use opentelemetry_proto::tonic::trace::v1::{ScopeSpans, Span, Status};
    use rand::rngs::mock::StepRng;
    use tempfile::TempDir;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("timestamp")
    }

    fn open_db(dir: &TempDir) -> TraceDb {
        TraceDb::open(dir.path().join("traces.db"), 60).expect("open")
    }

    fn proto_span(
        trace: &[u8],
        span: &[u8],
        parent: Option<&[u8]>,
        name: &str,
        start: DateTime<Utc>,
        status_code: i32,
    ) -> Span {
        let start_nanos = start.timestamp_nanos_opt().expect("in range") as u64;
        Span {
            trace_id: trace.to_vec(),
            span_id: span.to_vec(),
            parent_span_id: parent.map(|p| p.to_vec()).unwrap_or_default(),
            name: name.to_string(),
            start_time_unix_nano: start_nanos,
            end_time_unix_nano: start_nanos + 5_000_000,
            status: Some(Status {
                code: status_code,
                message: String::new(),
            }),
            ..Default::default()
        }
    }

    fn batch(service: &str, spans: Vec<Span>) -> ResourceSpans {
        ResourceSpans {
            resource: Some(opentelemetry_proto::tonic::resource::v1::Resource {
                attributes: vec![KeyValue {
                    key: "service.name".to_string(),
                    value: Some(AnyValue {
                        value: Some(any_value::Value::StringValue(service.to_string())),
                    }),
                }],
                ..Default::default()
            }),
            scope_spans: vec![ScopeSpans {
                scope: Some(InstrumentationScope {
                    name: "spanvault-tests".to_string(),
                    ..Default::default()
                }),
                spans,
                schema_url: String::new(),
            }],
            schema_url: String::new(),
        }
    }

    #[test]
    fn newest_first_single_service() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let t = at("2024-03-10T12:00:00Z");

        let spans = (1u8..=5)
            .map(|i| {
                proto_span(
                    &[0x01; 16],
                    &[0, 0, 0, 0, 0, 0, 0, i],
                    None,
                    &format!("op-{}", i),
                    t + Duration::seconds(10 * (i as i64 - 1)),
                    1,
                )
            })
            .collect();
        assert_eq!(db.write_resource_spans(&batch("ord-svc", spans)).unwrap(), 5);

        let got = db.get_spans("ord-svc", 10).unwrap();
        assert_eq!(got.len(), 5);
        assert_eq!(got[0].span_id, "0000000000000005");
        assert_eq!(got[4].span_id, "0000000000000001");
        for pair in got.windows(2) {
            assert!(pair[0].start > pair[1].start);
        }
    }

    #[test]
    fn cross_month_reads_newest_month_only_up_to_limit() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        for (base, month_tag) in [
            (at("2024-01-15T08:00:00Z"), 1u8),
            (at("2024-02-15T08:00:00Z"), 2u8),
        ] {
            let spans = (1u8..=5)
                .map(|i| {
                    proto_span(
                        &[month_tag; 16],
                        &[month_tag, 0, 0, 0, 0, 0, 0, i],
                        None,
                        "op",
                        base + Duration::minutes(i as i64),
                        0,
                    )
                })
                .collect();
            db.write_resource_spans(&batch("mix", spans)).unwrap();
        }

        let got = db.get_spans("mix", 3).unwrap();
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|r| r.month == "2024-02"));
    }

    #[test]
    fn span_tree_window_is_inclusive_at_two_minutes() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let t = at("2024-03-10T12:00:00Z");
        let trace = [0xAB; 16];

        let anchor = proto_span(&trace, &[1; 8], None, "anchor", t, 0);
        let at_edge = proto_span(&trace, &[2; 8], Some(&[1; 8]), "edge", t + Duration::minutes(2), 0);
        let past_edge = proto_span(
            &trace,
            &[3; 8],
            Some(&[1; 8]),
            "late",
            t + Duration::minutes(2) + Duration::milliseconds(1),
            0,
        );
        db.write_resource_spans(&batch("svc", vec![anchor, at_edge, past_edge]))
            .unwrap();

        let tree = db.get_span_tree(&"01".repeat(8)).unwrap();
        let ids: HashSet<_> = tree.iter().map(|r| r.span_id.as_str()).collect();
        assert_eq!(tree.len(), 2);
        assert!(ids.contains("01".repeat(8).as_str()));
        assert!(ids.contains("02".repeat(8).as_str()));
    }

    #[test]
    fn span_tree_crosses_services_and_filters_foreign_traces() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let t = at("2024-03-10T12:00:00Z");

        let front = proto_span(&[0xDD; 16], &[0x0A; 8], None, "GET /", t, 1);
        db.write_resource_spans(&batch("frontend", vec![front]))
            .unwrap();

        let back = proto_span(
            &[0xDD; 16],
            &[0x0B; 8],
            Some(&[0x0A; 8]),
            "SELECT",
            t + Duration::seconds(10),
            1,
        );
        let bystander = proto_span(&[0xEE; 16], &[0x0C; 8], None, "cron", t + Duration::seconds(5), 0);
        db.write_resource_spans(&batch("backend", vec![back, bystander]))
            .unwrap();

        let tree = db.get_span_tree(&"0a".repeat(8)).unwrap();
        let ids: HashSet<_> = tree.iter().map(|r| r.span_id.as_str()).collect();
        assert_eq!(tree.len(), 2);
        assert!(ids.contains("0a".repeat(8).as_str()));
        assert!(ids.contains("0b".repeat(8).as_str()));
    }

    #[test]
    fn span_tree_unknown_anchor_is_empty() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.write_resource_spans(&batch(
            "svc",
            vec![proto_span(&[1; 16], &[1; 8], None, "op", at("2024-03-10T12:00:00Z"), 0)],
        ))
        .unwrap();

        assert!(db.get_span_tree(&"ff".repeat(8)).unwrap().is_empty());
        assert!(matches!(
            db.get_span_tree("not-hex"),
            Err(StoreError::InvalidId(_))
        ));
    }

    #[test]
    fn span_tree_skips_corrupt_suffix_match_and_keeps_searching() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let t = at("2024-03-10T12:00:00Z");

        // A corrupt value under service "aaa" whose key suffix matches the
        // queried span id; the partition sorts before the real service.
        let mut rng = StepRng::new(1, 1);
        let bad_key = key::span_key(t, &[0x42; 8], &mut rng).unwrap();
        let raw = Connection::open(dir.path().join("traces.db")).unwrap();
        raw.execute(
            "INSERT INTO spans (service, month, key, value) VALUES (?1, ?2, ?3, ?4)",
            params!["aaa", month_name(t), &bad_key[..], b"garbage".to_vec()],
        )
        .unwrap();

        db.write_resource_spans(&batch(
            "zzz",
            vec![proto_span(&[0x77; 16], &[0x42; 8], None, "real", t, 0)],
        ))
        .unwrap();

        let tree = db.get_span_tree(&"42".repeat(8)).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].name, "real");
    }

    #[test]
    fn retention_drops_old_months_and_keeps_the_service() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        db.write_resource_spans(&batch(
            "mix-svc",
            vec![proto_span(&[1; 16], &[1; 8], None, "old", at("2020-01-15T00:00:00Z"), 0)],
        ))
        .unwrap();
        db.write_resource_spans(&batch(
            "mix-svc",
            vec![proto_span(&[2; 16], &[2; 8], None, "recent", Utc::now(), 0)],
        ))
        .unwrap();

        db.cleanup().unwrap();

        let got = db.get_spans("mix-svc", 10).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "recent");
        assert_ne!(got[0].month, "2020-01");

        let services = db.list_services().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "mix-svc");
    }

    #[test]
    fn retention_boundary_is_strict() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.write_resource_spans(&batch(
            "svc",
            vec![proto_span(&[1; 16], &[1; 8], None, "op", at("2024-01-15T00:00:00Z"), 0)],
        ))
        .unwrap();

        // end of 2024-01 is 2024-02-01; with 60 days retention the cutoff
        // equals it exactly at 2024-04-01 (a leap year February).
        let exact = at("2024-04-01T00:00:00Z");
        assert_eq!(db.cleanup_at(exact).unwrap(), 0);
        assert_eq!(db.get_spans("svc", 10).unwrap().len(), 1);

        assert_eq!(db.cleanup_at(exact + Duration::milliseconds(1)).unwrap(), 1);
        assert!(db.get_spans("svc", 10).unwrap().is_empty());
        assert!(db.list_services().unwrap().is_empty());
    }

    #[test]
    fn cleanup_preserves_unparseable_month_partitions() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let raw = Connection::open(dir.path().join("traces.db")).unwrap();
        raw.execute(
            "INSERT INTO spans (service, month, key, value) VALUES (?1, ?2, ?3, ?4)",
            params!["svc", "not-a-month", &[0u8; key::KEY_LEN][..], b"x".to_vec()],
        )
        .unwrap();

        assert_eq!(db.cleanup_at(at("2199-01-01T00:00:00Z")).unwrap(), 0);
        assert_eq!(db.list_services().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_records_are_skipped_not_surfaced() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let t = at("2024-03-10T12:00:00Z");

        let mut rng = StepRng::new(7, 3);
        let bad_key = key::span_key(t, &[9; 8], &mut rng).unwrap();
        let raw = Connection::open(dir.path().join("traces.db")).unwrap();
        raw.execute(
            "INSERT INTO spans (service, month, key, value) VALUES (?1, ?2, ?3, ?4)",
            params!["fresh", month_name(t), &bad_key[..], b"not a compressed record".to_vec()],
        )
        .unwrap();

        db.write_resource_spans(&batch(
            "fresh",
            vec![proto_span(&[5; 16], &[5; 8], None, "real", t, 0)],
        ))
        .unwrap();

        let got = db.get_spans("fresh", 10).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "real");

        // counts still see both records; trace count only the decodable one
        let services = db.list_services().unwrap();
        assert_eq!(services[0].span_count, 2);
        assert_eq!(services[0].trace_count, 1);
    }

    #[test]
    fn limit_zero_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let t = at("2024-03-01T00:00:00Z");

        let spans = (0u8..110)
            .map(|i| {
                proto_span(
                    &[i, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
                    &[i, 0, 0, 0, 0, 0, 0, 1],
                    None,
                    "op",
                    t + Duration::seconds(i as i64),
                    0,
                )
            })
            .collect();
        db.write_resource_spans(&batch("busy", spans)).unwrap();

        assert_eq!(db.get_spans("busy", 0).unwrap().len(), DEFAULT_SPAN_LIMIT);
        assert_eq!(
            db.get_trace_ids("busy", 0).unwrap().len(),
            DEFAULT_TRACE_ID_LIMIT
        );
    }

    #[test]
    fn trace_ids_are_unique_and_newest_first() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let t = at("2024-03-10T12:00:00Z");

        // traces 1..3, two spans each, interleaved so trace 1 has the newest span
        let mut spans = Vec::new();
        for (offset, trace) in [(0i64, 1u8), (1, 2), (2, 3), (3, 2), (4, 3), (5, 1)] {
            spans.push(proto_span(
                &[trace; 16],
                &[trace, 0, 0, 0, 0, 0, 0, offset as u8],
                None,
                "op",
                t + Duration::seconds(offset),
                0,
            ));
        }
        db.write_resource_spans(&batch("svc", spans)).unwrap();

        let ids = db.get_trace_ids("svc", 10).unwrap();
        assert_eq!(
            ids,
            vec!["01".repeat(16), "03".repeat(16), "02".repeat(16)]
        );
    }

    #[test]
    fn unknown_service_reads_empty() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        assert!(db.get_spans("nobody", 10).unwrap().is_empty());
        assert!(db.get_trace_ids("nobody", 10).unwrap().is_empty());
        assert!(db.list_services().unwrap().is_empty());
    }

    #[test]
    fn get_trace_by_id_spans_services_and_validates_input() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let t = at("2024-03-10T12:00:00Z");

        db.write_resource_spans(&batch(
            "a",
            vec![proto_span(&[9; 16], &[1; 8], None, "one", t, 0)],
        ))
        .unwrap();
        db.write_resource_spans(&batch(
            "b",
            vec![proto_span(&[9; 16], &[2; 8], None, "two", t + Duration::hours(30), 0)],
        ))
        .unwrap();

        let got = db.get_trace_by_id(&"09".repeat(16)).unwrap();
        assert_eq!(got.len(), 2);

        assert!(db.get_trace_by_id(&"00".repeat(16)).unwrap().is_empty());
        assert!(matches!(
            db.get_trace_by_id("xyz"),
            Err(StoreError::InvalidId(_))
        ));
    }

    #[test]
    fn batch_fans_out_across_scopes_and_missing_resource_is_unknown() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let t = at("2024-03-10T12:00:00Z");

        let mut b = batch("ignored", vec![]);
        b.resource = None;
        b.scope_spans = vec![
            ScopeSpans {
                scope: None,
                spans: vec![
                    proto_span(&[1; 16], &[1; 8], None, "a", t, 0),
                    proto_span(&[1; 16], &[2; 8], None, "b", t, 0),
                ],
                schema_url: String::new(),
            },
            ScopeSpans {
                scope: None,
                spans: vec![proto_span(&[1; 16], &[3; 8], None, "c", t, 0)],
                schema_url: String::new(),
            },
        ];

        assert_eq!(db.write_resource_spans(&b).unwrap(), 3);
        assert_eq!(db.get_spans("unknown", 10).unwrap().len(), 3);
    }

    #[test]
    fn zero_start_time_lands_in_the_current_month() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let before = month_name(Utc::now());
        let mut span = proto_span(&[1; 16], &[1; 8], None, "now", Utc::now(), 0);
        span.start_time_unix_nano = 0;
        span.end_time_unix_nano = 0;
        db.write_resource_spans(&batch("svc", vec![span])).unwrap();
        let after = month_name(Utc::now());

        let got = db.get_spans("svc", 10).unwrap();
        assert_eq!(got.len(), 1);
        assert!(got[0].month == before || got[0].month == after);
    }

    #[test]
    fn delete_service_drops_only_that_partition() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let t = at("2024-03-10T12:00:00Z");

        db.write_resource_spans(&batch("keep", vec![proto_span(&[1; 16], &[1; 8], None, "k", t, 0)]))
            .unwrap();
        db.write_resource_spans(&batch("drop", vec![proto_span(&[2; 16], &[2; 8], None, "d", t, 0)]))
            .unwrap();

        db.delete_service("drop").unwrap();
        assert!(db.get_spans("drop", 10).unwrap().is_empty());
        assert_eq!(db.list_services().unwrap().len(), 1);

        // absent service: success without change
        db.delete_service("never-existed").unwrap();
    }

    #[test]
    fn list_services_summarises_counts_and_last_updated() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let t = at("2024-03-10T12:00:00Z");
        let newest = t + Duration::days(40); // lands in 2024-04

        db.write_resource_spans(&batch(
            "svc",
            vec![
                proto_span(&[1; 16], &[1; 8], None, "a", t, 0),
                proto_span(&[1; 16], &[2; 8], None, "b", t + Duration::seconds(1), 0),
                proto_span(&[2; 16], &[3; 8], None, "c", newest, 0),
            ],
        ))
        .unwrap();

        let services = db.list_services().unwrap();
        assert_eq!(services.len(), 1);
        let s = &services[0];
        assert_eq!(s.span_count, 3);
        assert_eq!(s.trace_count, 2);
        assert_eq!(s.last_updated, newest);
    }

    #[test]
    fn closed_handle_fails_every_operation() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.close();

        assert!(matches!(
            db.write_resource_spans(&batch("svc", vec![])),
            Err(StoreError::Closed)
        ));
        assert!(matches!(db.get_spans("svc", 1), Err(StoreError::Closed)));
        assert!(matches!(db.get_trace_ids("svc", 1), Err(StoreError::Closed)));
        assert!(matches!(db.list_services(), Err(StoreError::Closed)));
        assert!(matches!(
            db.get_trace_by_id(&"00".repeat(16)),
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            db.get_span_tree(&"00".repeat(8)),
            Err(StoreError::Closed)
        ));
        assert!(matches!(db.cleanup(), Err(StoreError::Closed)));
        assert!(matches!(db.delete_service("svc"), Err(StoreError::Closed)));

        // close is idempotent
        db.close();
    }

    #[test]
    fn open_replaces_non_positive_retention_with_default() {
        let dir = TempDir::new().unwrap();
        let db = TraceDb::open(dir.path().join("traces.db"), 0).unwrap();
        assert_eq!(db.retention_days(), DEFAULT_RETENTION_DAYS);
        db.close();

        let db = TraceDb::open(dir.path().join("traces.db"), -5).unwrap();
        assert_eq!(db.retention_days(), DEFAULT_RETENTION_DAYS);
    }
}
