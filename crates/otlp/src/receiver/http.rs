// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! OTLP/HTTP receiver (TCP 4318).
//!
//! Accepts binary-protobuf export requests on the standard `/v1/*` paths,
//! with optional gzip request bodies. Backpressure answers 429 with a
//! `Retry-After` header derived from the degradation level.

use crate::receiver::{Ingress, IngressDecision};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use flate2::read::GzDecoder;
use nrdot_pdata::split;
use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use prost::Message;
use std::io::Read;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

fn decode_body(headers: &HeaderMap, body: &Bytes) -> Result<Vec<u8>, Response> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("gzip"));
    if !gzipped {
        return Ok(body.to_vec());
    }
    let mut decoder = GzDecoder::new(body.as_ref());
    let mut out = Vec::new();
    let _ = decoder.read_to_end(&mut out).map_err(|_| {
        (StatusCode::BAD_REQUEST, "invalid gzip body").into_response()
    })?;
    Ok(out)
}

fn protobuf_response<M: Message>(message: M) -> Response {
    (
        [(header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)],
        message.encode_to_vec(),
    )
        .into_response()
}

fn backpressure_response(retry_after: std::time::Duration) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.as_secs().max(1).to_string())],
        "pipeline backpressure; retry later",
    )
        .into_response()
}

async fn export_metrics(
    State(ingress): State<Ingress>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let raw = match decode_body(&headers, &body) {
        Ok(raw) => raw,
        Err(response) => return response,
    };
    let Ok(request) = ExportMetricsServiceRequest::decode(raw.as_slice()) else {
        return (StatusCode::BAD_REQUEST, "invalid protobuf payload").into_response();
    };
    match ingress.admit(split::split_metrics(request)) {
        IngressDecision::Accepted => protobuf_response(ExportMetricsServiceResponse::default()),
        IngressDecision::Backpressure { retry_after } => backpressure_response(retry_after),
    }
}

async fn export_traces(
    State(ingress): State<Ingress>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let raw = match decode_body(&headers, &body) {
        Ok(raw) => raw,
        Err(response) => return response,
    };
    let Ok(request) = ExportTraceServiceRequest::decode(raw.as_slice()) else {
        return (StatusCode::BAD_REQUEST, "invalid protobuf payload").into_response();
    };
    match ingress.admit(split::split_traces(request)) {
        IngressDecision::Accepted => protobuf_response(ExportTraceServiceResponse::default()),
        IngressDecision::Backpressure { retry_after } => backpressure_response(retry_after),
    }
}

async fn export_logs(State(ingress): State<Ingress>, headers: HeaderMap, body: Bytes) -> Response {
    let raw = match decode_body(&headers, &body) {
        Ok(raw) => raw,
        Err(response) => return response,
    };
    let Ok(request) = ExportLogsServiceRequest::decode(raw.as_slice()) else {
        return (StatusCode::BAD_REQUEST, "invalid protobuf payload").into_response();
    };
    match ingress.admit(split::split_logs(request)) {
        IngressDecision::Accepted => protobuf_response(ExportLogsServiceResponse::default()),
        IngressDecision::Backpressure { retry_after } => backpressure_response(retry_after),
    }
}

/// The OTLP/HTTP router over the shared ingress state.
#[must_use]
pub fn router(ingress: Ingress) -> Router {
    Router::new()
        .route("/v1/metrics", post(export_metrics))
        .route("/v1/traces", post(export_traces))
        .route("/v1/logs", post(export_logs))
        .with_state(ingress)
}

/// Serves the OTLP/HTTP receiver until cancellation.
pub async fn serve(
    addr: SocketAddr,
    ingress: Ingress,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "otlp/http receiver listening");
    axum::serve(listener, router(ingress))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn gzip_bodies_are_transparently_decoded() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"payload").expect("write");
        let compressed = encoder.finish().expect("finish");

        let mut headers = HeaderMap::new();
        let _ = headers.insert(header::CONTENT_ENCODING, "gzip".parse().expect("value"));
        let decoded =
            decode_body(&headers, &Bytes::from(compressed)).expect("decode");
        assert_eq!(decoded, b"payload");
    }

    #[test]
    fn plain_bodies_pass_through() {
        let headers = HeaderMap::new();
        let decoded = decode_body(&headers, &Bytes::from_static(b"raw")).expect("decode");
        assert_eq!(decoded, b"raw");
    }

    #[test]
    fn corrupt_gzip_is_a_bad_request() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(header::CONTENT_ENCODING, "gzip".parse().expect("value"));
        assert!(decode_body(&headers, &Bytes::from_static(b"not gzip")).is_err());
    }
}
