// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline tests against a counting mock collector:
//! admission → queue → sender → backend, plus outage spill and replay.

use nrdot_config::AgentConfig;
use nrdot_engine::pipeline::{AdmitOutcome, Core};
use nrdot_otlp::{OtlpClients, Sender};
use nrdot_pdata::TelemetryItem;
use nrdot_telemetry::Metrics;
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
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::codec::CompressionEncoding;
use tonic::{Request, Response, Status};

/// Counts export requests and items across all three services.
#[derive(Clone, Default)]
struct CountingCollector {
    requests: Arc<AtomicUsize>,
    metric_items: Arc<AtomicUsize>,
}

#[tonic::async_trait]
impl MetricsService for CountingCollector {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let _ = self.requests.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .metric_items
            .fetch_add(request.into_inner().resource_metrics.len(), Ordering::SeqCst);
        Ok(Response::new(ExportMetricsServiceResponse::default()))
    }
}

#[tonic::async_trait]
impl TraceService for CountingCollector {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let _ = self.requests.fetch_add(1, Ordering::SeqCst);
        let _ = request;
        Ok(Response::new(ExportTraceServiceResponse::default()))
    }
}

#[tonic::async_trait]
impl LogsService for CountingCollector {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let _ = self.requests.fetch_add(1, Ordering::SeqCst);
        let _ = request;
        Ok(Response::new(ExportLogsServiceResponse::default()))
    }
}

async fn start_collector(cancel: CancellationToken) -> (CountingCollector, u16) {
    let port = portpicker::pick_unused_port().expect("free port");
    let addr = format!("127.0.0.1:{port}").parse().expect("addr");
    let collector = CountingCollector::default();
    let service = collector.clone();
    let _ = tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(
                MetricsServiceServer::new(service.clone())
                    .accept_compressed(CompressionEncoding::Gzip)
                    .send_compressed(CompressionEncoding::Gzip),
            )
            .add_service(
                TraceServiceServer::new(service.clone())
                    .accept_compressed(CompressionEncoding::Gzip)
                    .send_compressed(CompressionEncoding::Gzip),
            )
            .add_service(
                LogsServiceServer::new(service)
                    .accept_compressed(CompressionEncoding::Gzip)
                    .send_compressed(CompressionEncoding::Gzip),
            )
            .serve_with_shutdown(addr, cancel.cancelled())
            .await;
    });
    // give the listener a moment to come up
    tokio::time::sleep(Duration::from_millis(100)).await;
    (collector, port)
}

fn fast_config(dir: &std::path::Path, port: u16) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.otlp.endpoint = format!("http://127.0.0.1:{port}");
    config.otlp.request_timeout = Duration::from_secs(2);
    config.dlq.dir = dir.to_path_buf();
    config.sender.batch_max_age = Duration::from_millis(100);
    config.sender.backoff_min = Duration::from_millis(10);
    config.sender.backoff_max = Duration::from_millis(50);
    config.sender.parallelism = 1;
    config.sender.replay_parallelism = 1;
    config
}

fn build_sender(core: &Core, config: &AgentConfig, metrics: Metrics) -> Arc<Sender> {
    let clients = OtlpClients::new(&config.otlp).expect("clients");
    Arc::new(Sender::new(
        config.sender.clone(),
        clients,
        core.apq.clone(),
        core.dlq.clone(),
        metrics,
        core.controls.clone(),
        core.fail_window.clone(),
        core.live_rate.clone(),
        core.health.clone(),
        core.outage.clone(),
        core.level.clone(),
    ))
}

fn item(service: &str) -> TelemetryItem {
    let mut attributes = BTreeMap::new();
    let _ = attributes.insert("service".to_string(), service.to_string());
    TelemetryItem::synthesized_gauge("pipeline_test_metric", 1.0, attributes)
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn steady_state_items_are_acked() {
    let _ = tracing_subscriber::fmt::try_init();
    let tmp = tempfile::tempdir().expect("tempdir");
    let cancel = CancellationToken::new();
    let (collector, port) = start_collector(cancel.clone()).await;
    let config = fast_config(tmp.path(), port);
    let metrics = Metrics::new();
    let core = Core::build(&config, metrics.clone(), None, cancel.child_token()).expect("core");
    let sender = build_sender(&core, &config, metrics.clone());
    let tasks = sender.clone().spawn(&cancel);

    for i in 0..10 {
        assert_eq!(
            core.admitter.offer(item(&format!("svc-{i}"))),
            AdmitOutcome::Accepted
        );
    }

    wait_until("all items delivered", Duration::from_secs(10), || {
        collector.metric_items.load(Ordering::SeqCst) >= 10
    })
    .await;
    assert!(
        metrics
            .sender_export_attempts_total
            .with_label_values(&["ack"])
            .get()
            >= 1
    );
    assert_eq!(core.dlq.total_bytes(), 0);
    assert!(core.health.is_healthy(Duration::from_secs(300)));

    sender.shutdown(tasks, Duration::from_secs(2)).await;
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn outage_spills_then_replay_drains() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let cancel = CancellationToken::new();
    let (collector, port) = start_collector(cancel.clone()).await;
    let mut config = fast_config(tmp.path(), port);
    // first failure goes straight to the DLQ
    config.sender.retry_max = 0;
    let metrics = Metrics::new();
    let core = Core::build(&config, metrics.clone(), None, cancel.child_token()).expect("core");
    let sender = build_sender(&core, &config, metrics.clone());
    let tasks = sender.clone().spawn(&cancel);

    // outage: everything offered now must spill durably, not drop
    core.outage.start(None);
    for i in 0..5 {
        assert_eq!(
            core.admitter.offer(item(&format!("down-{i}"))),
            AdmitOutcome::Accepted
        );
    }
    wait_until("outage spill", Duration::from_secs(10), || {
        core.dlq.total_bytes() > 0
    })
    .await;
    assert_eq!(collector.requests.load(Ordering::SeqCst), 0);

    // recovery: live traffic acks, which opens the replay gate
    core.outage.stop();
    for i in 0..10 {
        assert_eq!(
            core.admitter.offer(item(&format!("up-{i}"))),
            AdmitOutcome::Accepted
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    wait_until("replay drains the backlog", Duration::from_secs(30), || {
        !core.dlq.has_backlog()
    })
    .await;
    // both the live items and the replayed outage items arrived
    assert!(collector.metric_items.load(Ordering::SeqCst) >= 15);
    assert!(metrics.dlq_replay_batches_total.get() >= 1);

    sender.shutdown(tasks, Duration::from_secs(2)).await;
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_spills_undeliverable_remainder() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let cancel = CancellationToken::new();
    // no backend at all: pick a port nobody listens on
    let port = portpicker::pick_unused_port().expect("free port");
    let mut config = fast_config(tmp.path(), port);
    config.sender.retry_max = 1;
    let metrics = Metrics::new();
    let core = Core::build(&config, metrics.clone(), None, cancel.child_token()).expect("core");
    let sender = build_sender(&core, &config, metrics.clone());
    let tasks = sender.clone().spawn(&cancel);

    for i in 0..5 {
        assert_eq!(
            core.admitter.offer(item(&format!("stuck-{i}"))),
            AdmitOutcome::Accepted
        );
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    sender.shutdown(tasks, Duration::from_secs(3)).await;
    // nothing may be lost: every item is on disk, none in memory
    assert!(core.apq.is_empty());
    assert!(core.dlq.total_bytes() > 0);
    cancel.cancel();
}
