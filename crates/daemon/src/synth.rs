//! Synthetic trace ingest loop for development and smoke-testing.
//!
//! When the daemon is started with `--dev-ingest`, this module generates
//! small multi-service traces at a configurable interval. Each burst mints a
//! trace with a root span and a handful of children spread across services,
//! then pushes the batches through the same store write path the OTLP
//! front-ends use.
//!
//! This is NOT enabled in normal operation; it exists to verify that
//! storage, cleanup, and the query API serve live data before a real
//! collector is pointed at the daemon.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use spanvault_store::opentelemetry_proto::tonic::common::v1::{
    any_value, AnyValue, InstrumentationScope, KeyValue,
};
use spanvault_store::opentelemetry_proto::tonic::resource::v1::Resource;
use spanvault_store::opentelemetry_proto::tonic::trace::v1::{
    ResourceSpans, ScopeSpans, Span, Status,
};
use spanvault_store::{StoreError, TraceDb};

const SERVICES: &[&str] = &["frontend", "checkout", "payments", "inventory"];

const OPERATIONS: &[&str] = &[
    "GET /cart",
    "POST /checkout",
    "SELECT orders",
    "UPDATE stock",
    "charge-card",
    "publish-event",
];

/// Run the synthetic ingest loop until shutdown is signalled.
pub async fn run_synthetic_ingest(
    db: Arc<TraceDb>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut rng = StdRng::from_entropy();
    let mut burst: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {
                info!("synthetic ingest loop shutting down");
                return;
            }
        }

        burst += 1;
        match generate_trace(&db, &mut rng).await {
            Ok(written) => debug!(burst, spans = written, "generated synthetic trace"),
            Err(e) => warn!(burst, "synthetic ingest error: {}", e),
        }
    }
}

async fn generate_trace(db: &Arc<TraceDb>, rng: &mut StdRng) -> Result<usize, StoreError> {
    let mut trace_id = [0u8; 16];
    rng.fill_bytes(&mut trace_id);
    let mut root_id = [0u8; 8];
    rng.fill_bytes(&mut root_id);

    let start_nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64;

    let mut by_service: HashMap<&str, Vec<Span>> = HashMap::new();
    let root_duration = rng.gen_range(50_000_000..200_000_000);
    by_service.entry("frontend").or_default().push(make_span(
        rng,
        &trace_id,
        &root_id,
        None,
        "GET /",
        start_nanos,
        root_duration,
    ));

    let children = rng.gen_range(1..=5);
    for _ in 0..children {
        let mut span_id = [0u8; 8];
        rng.fill_bytes(&mut span_id);
        let service = SERVICES[rng.gen_range(0..SERVICES.len())];
        let name = OPERATIONS[rng.gen_range(0..OPERATIONS.len())];
        let offset = rng.gen_range(1_000_000u64..150_000_000);
        let duration = rng.gen_range(500_000u64..40_000_000);
        by_service.entry(service).or_default().push(make_span(
            rng,
            &trace_id,
            &span_id,
            Some(&root_id),
            name,
            start_nanos + offset,
            duration,
        ));
    }

    let mut written = 0usize;
    for (service, spans) in by_service {
        let batch = resource_spans(service, spans);
        let db = db.clone();
        written += tokio::task::spawn_blocking(move || db.write_resource_spans(&batch))
            .await
            .map_err(|e| StoreError::Database(format!("synthetic write failed: {}", e)))??;
    }
    Ok(written)
}

fn make_span(
    rng: &mut StdRng,
    trace_id: &[u8; 16],
    span_id: &[u8; 8],
    parent: Option<&[u8; 8]>,
    name: &str,
    start_nanos: u64,
    duration_nanos: u64,
) -> Span {
    // 10% failure rate
    let failed = rng.gen_range(0..100) < 10;
    Span {
        trace_id: trace_id.to_vec(),
        span_id: span_id.to_vec(),
        parent_span_id: parent.map(|p| p.to_vec()).unwrap_or_default(),
        name: name.to_string(),
        start_time_unix_nano: start_nanos,
        end_time_unix_nano: start_nanos + duration_nanos,
        status: Some(Status {
            code: if failed { 2 } else { 1 },
            message: if failed {
                "synthetic error: something went wrong".to_string()
            } else {
                String::new()
            },
        }),
        ..Default::default()
    }
}

fn resource_spans(service: &str, spans: Vec<Span>) -> ResourceSpans {
    ResourceSpans {
        resource: Some(Resource {
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
                name: "spanvault-synth".to_string(),
                ..Default::default()
            }),
            spans,
            schema_url: String::new(),
        }],
        schema_url: String::new(),
    }
}
