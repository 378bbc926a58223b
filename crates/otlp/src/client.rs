// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! OTLP/gRPC export clients.
//!
//! One lazily-connected channel shared by the three signal services.
//! Requests are gzip-compressed and carry the configured headers
//! (bearer token / api key) as metadata.

use crate::error::ExportError;
use nrdot_config::OtlpConfig;
use nrdot_pdata::ExportRequest;
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_client::LogsServiceClient;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use std::time::Duration;
use tonic::codec::CompressionEncoding;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, Endpoint};

/// The gRPC clients for the three OTLP export services.
#[derive(Clone)]
pub struct OtlpClients {
    metrics: MetricsServiceClient<Channel>,
    traces: TraceServiceClient<Channel>,
    logs: LogsServiceClient<Channel>,
    headers: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
}

impl OtlpClients {
    /// Builds the clients against the configured endpoint. The channel
    /// connects lazily, so this never touches the network.
    pub fn new(cfg: &OtlpConfig) -> Result<Self, nrdot_config::Error> {
        let endpoint = Endpoint::from_shared(cfg.endpoint.clone())
            .map_err(|e| nrdot_config::Error::InvalidSetting {
                field: "otlp.endpoint".to_string(),
                details: e.to_string(),
            })?
            .timeout(cfg.request_timeout)
            .connect_timeout(Duration::from_secs(5));
        let channel = endpoint.connect_lazy();

        let mut headers = Vec::with_capacity(cfg.headers.len());
        for (key, value) in &cfg.headers {
            let key = key.to_ascii_lowercase().parse::<AsciiMetadataKey>().map_err(|e| {
                nrdot_config::Error::InvalidSetting {
                    field: format!("otlp.headers.{key}"),
                    details: e.to_string(),
                }
            })?;
            let value =
                value
                    .parse::<AsciiMetadataValue>()
                    .map_err(|e| nrdot_config::Error::InvalidSetting {
                        field: format!("otlp.headers.{key}"),
                        details: e.to_string(),
                    })?;
            headers.push((key, value));
        }

        let metrics = MetricsServiceClient::new(channel.clone())
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip);
        let traces = TraceServiceClient::new(channel.clone())
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip);
        let logs = LogsServiceClient::new(channel)
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip);

        Ok(Self {
            metrics,
            traces,
            logs,
            headers,
        })
    }

    fn request_with_headers<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        for (key, value) in &self.headers {
            let _ = request.metadata_mut().insert(key.clone(), value.clone());
        }
        request
    }

    /// Transmits one export request; classification of failures follows
    /// the sender's retry policy.
    pub async fn export(&self, request: ExportRequest) -> Result<(), ExportError> {
        let result = match request {
            ExportRequest::Metrics(message) => {
                let mut client = self.metrics.clone();
                client
                    .export(self.request_with_headers(message))
                    .await
                    .map(|_| ())
            }
            ExportRequest::Traces(message) => {
                let mut client = self.traces.clone();
                client
                    .export(self.request_with_headers(message))
                    .await
                    .map(|_| ())
            }
            ExportRequest::Logs(message) => {
                let mut client = self.logs.clone();
                client
                    .export(self.request_with_headers(message))
                    .await
                    .map(|_| ())
            }
        };
        result.map_err(|status| ExportError::classify(&status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn bad_endpoint_is_a_config_error() {
        let cfg = OtlpConfig {
            endpoint: "not a uri".to_string(),
            headers: BTreeMap::new(),
            request_timeout: Duration::from_secs(10),
        };
        assert!(OtlpClients::new(&cfg).is_err());
    }

    #[tokio::test]
    async fn headers_are_validated_at_build_time() {
        let mut headers = BTreeMap::new();
        let _ = headers.insert("Authorization".to_string(), "Bearer token".to_string());
        let cfg = OtlpConfig {
            endpoint: "http://localhost:4317".to_string(),
            headers,
            request_timeout: Duration::from_secs(10),
        };
        let clients = OtlpClients::new(&cfg).expect("valid config");
        assert_eq!(clients.headers.len(), 1);
        assert_eq!(clients.headers[0].0.as_str(), "authorization");

        let mut bad = BTreeMap::new();
        let _ = bad.insert("bad header name".to_string(), "v".to_string());
        let cfg = OtlpConfig {
            endpoint: "http://localhost:4317".to_string(),
            headers: bad,
            request_timeout: Duration::from_secs(10),
        };
        assert!(OtlpClients::new(&cfg).is_err());
    }
}
