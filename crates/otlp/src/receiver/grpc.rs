// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! OTLP/gRPC receiver (TCP 4317).

use crate::receiver::{Ingress, IngressDecision};
use nrdot_pdata::split;
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::{
    LogsService, LogsServiceServer,
};
use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::{
    TraceService, TraceServiceServer,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use std::net::SocketAddr;
use tonic::codec::CompressionEncoding;
use tonic::{Request, Response, Status};
use tokio_util::sync::CancellationToken;
use tracing::info;

fn backpressure_status(retry_after: std::time::Duration) -> Status {
    let mut status = Status::resource_exhausted("pipeline backpressure; retry later");
    if let Ok(value) = retry_after.as_millis().to_string().parse() {
        let _ = status
            .metadata_mut()
            .insert("retry-after-ms", value);
    }
    status
}

#[derive(Clone)]
struct MetricsSvc {
    ingress: Ingress,
}

#[tonic::async_trait]
impl MetricsService for MetricsSvc {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let items = split::split_metrics(request.into_inner());
        match self.ingress.admit(items) {
            IngressDecision::Accepted => Ok(Response::new(ExportMetricsServiceResponse::default())),
            IngressDecision::Backpressure { retry_after } => {
                Err(backpressure_status(retry_after))
            }
        }
    }
}

#[derive(Clone)]
struct TraceSvc {
    ingress: Ingress,
}

#[tonic::async_trait]
impl TraceService for TraceSvc {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let items = split::split_traces(request.into_inner());
        match self.ingress.admit(items) {
            IngressDecision::Accepted => Ok(Response::new(ExportTraceServiceResponse::default())),
            IngressDecision::Backpressure { retry_after } => {
                Err(backpressure_status(retry_after))
            }
        }
    }
}

#[derive(Clone)]
struct LogsSvc {
    ingress: Ingress,
}

#[tonic::async_trait]
impl LogsService for LogsSvc {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let items = split::split_logs(request.into_inner());
        match self.ingress.admit(items) {
            IngressDecision::Accepted => Ok(Response::new(ExportLogsServiceResponse::default())),
            IngressDecision::Backpressure { retry_after } => {
                Err(backpressure_status(retry_after))
            }
        }
    }
}

/// Serves the three OTLP export services until cancellation.
pub async fn serve(
    addr: SocketAddr,
    ingress: Ingress,
    cancel: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    info!(%addr, "otlp/grpc receiver listening");
    tonic::transport::Server::builder()
        .add_service(
            MetricsServiceServer::new(MetricsSvc {
                ingress: ingress.clone(),
            })
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip),
        )
        .add_service(
            TraceServiceServer::new(TraceSvc {
                ingress: ingress.clone(),
            })
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip),
        )
        .add_service(
            LogsServiceServer::new(LogsSvc { ingress })
                .accept_compressed(CompressionEncoding::Gzip)
                .send_compressed(CompressionEncoding::Gzip),
        )
        .serve_with_shutdown(addr, cancel.cancelled())
        .await
}
