//! OTLP ingestion front-ends.
//!
//! Both the gRPC and HTTP handlers are thin wire adapters: decode the
//! export request, hand each resource-spans batch to the store, report the
//! outcome. No queueing, no retries, no payload transformation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use prost::Message;
use tokio::sync::watch;
use tonic::transport::Server;
use tonic::{Request, Response as TonicResponse, Status};
use tracing::{debug, warn};

use spanvault_store::opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_server::{TraceService, TraceServiceServer},
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use spanvault_store::{StoreError, TraceDb};

pub struct TraceIngest {
    db: Arc<TraceDb>,
}

impl TraceIngest {
    pub fn new(db: Arc<TraceDb>) -> Self {
        Self { db }
    }
}

async fn store_export(
    db: Arc<TraceDb>,
    req: ExportTraceServiceRequest,
) -> Result<usize, StoreError> {
    tokio::task::spawn_blocking(move || {
        let mut written = 0usize;
        for resource_spans in &req.resource_spans {
            written += db.write_resource_spans(resource_spans)?;
        }
        Ok(written)
    })
    .await
    .map_err(|e| StoreError::Database(format!("ingest task failed: {}", e)))?
}

#[tonic::async_trait]
impl TraceService for TraceIngest {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<TonicResponse<ExportTraceServiceResponse>, Status> {
        match store_export(self.db.clone(), request.into_inner()).await {
            Ok(written) => {
                debug!(spans = written, "stored OTLP/gRPC export");
                Ok(TonicResponse::new(ExportTraceServiceResponse::default()))
            }
            Err(e) => {
                warn!("failed to store OTLP/gRPC export: {}", e);
                Err(Status::internal(e.to_string()))
            }
        }
    }
}

pub async fn serve_grpc(
    db: Arc<TraceDb>,
    addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), tonic::transport::Error> {
    Server::builder()
        .add_service(TraceServiceServer::new(TraceIngest::new(db)))
        .serve_with_shutdown(addr, async move {
            shutdown_rx.changed().await.ok();
        })
        .await
}

/// Router for the OTLP/HTTP listener: `POST /v1/traces`, binary protobuf.
pub fn http_router(db: Arc<TraceDb>) -> Router {
    Router::new()
        .route("/v1/traces", post(export_http))
        .with_state(db)
}

async fn export_http(State(db): State<Arc<TraceDb>>, body: Bytes) -> Response {
    let req = match ExportTraceServiceRequest::decode(body) {
        Ok(req) => req,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid protobuf: {}", e)).into_response()
        }
    };
    match store_export(db, req).await {
        Ok(written) => {
            debug!(spans = written, "stored OTLP/HTTP export");
            (
                [(header::CONTENT_TYPE, "application/x-protobuf")],
                ExportTraceServiceResponse::default().encode_to_vec(),
            )
                .into_response()
        }
        Err(e) => {
            warn!("failed to store OTLP/HTTP export: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
