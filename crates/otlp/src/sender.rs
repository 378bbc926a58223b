// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! The exporting sender.
//!
//! Worker tasks drain the priority queue in batched dequeues, compose
//! per-signal-kind batches (closed on bytes, count or age) and transmit
//! them with exponential full-jitter backoff. Retry exhaustion and
//! permanent failures spill the batch to the dead-letter queue; auth
//! failures additionally raise a sticky gauge. Replay workers feed
//! spilled batches back at a throttled rate once the backend looks
//! healthy, marking repeat offenders as poison.
//!
//! The sender never blocks admission: the priority queue is the only
//! backpressure point.

use crate::client::OtlpClients;
use crate::error::ExportError;
use nrdot_config::SenderConfig;
use nrdot_dlq::DeadLetterStore;
use nrdot_engine::control::{ByteRate, HealthState, LevelCell, OutageSwitch, RateWindow, SenderControls};
use nrdot_engine::degradation::DegradationLevel;
use nrdot_engine::PriorityQueue;
use nrdot_pdata::{
    Batch, ExportRequest, Priority, ReplayBatch, SignalKind, TelemetryItem, encode_request_payload,
};
use nrdot_telemetry::Metrics;
use rand::RngExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Replay gate: minimum export success rate over the last 60 s.
const REPLAY_HEALTH_THRESHOLD: f64 = 0.8;
/// Floor for the replay throttle when there is little live traffic, so
/// recovery is not starved by its own gate.
const REPLAY_RATE_FLOOR: f64 = 64.0 * 1024.0;
/// Idle sleep between replay polls.
const REPLAY_IDLE: Duration = Duration::from_millis(500);

/// A batch turned into its wire request, with its accounting retained.
struct Outbound {
    kind: SignalKind,
    priority: Priority,
    bytes: u64,
    items: usize,
    attempts: u32,
    request: ExportRequest,
}

impl Outbound {
    fn from_batch(batch: Batch) -> Self {
        Self {
            kind: batch.kind,
            priority: batch.priority(),
            bytes: batch.bytes,
            items: batch.len(),
            attempts: 0,
            request: batch.into_export_request(),
        }
    }
}

/// Handles of the spawned sender tasks.
pub struct SenderTasks {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// The exporting sender and its DLQ replay side.
pub struct Sender {
    cfg: SenderConfig,
    clients: OtlpClients,
    apq: Arc<PriorityQueue>,
    dlq: Arc<DeadLetterStore>,
    metrics: Metrics,
    controls: Arc<SenderControls>,
    fail_window: Arc<RateWindow>,
    live_rate: Arc<ByteRate>,
    replay_rate: ByteRate,
    health: Arc<HealthState>,
    outage: Arc<OutageSwitch>,
    level: Arc<LevelCell>,
    inflight: Semaphore,
}

impl Sender {
    /// Wires the sender to the core's components.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        cfg: SenderConfig,
        clients: OtlpClients,
        apq: Arc<PriorityQueue>,
        dlq: Arc<DeadLetterStore>,
        metrics: Metrics,
        controls: Arc<SenderControls>,
        fail_window: Arc<RateWindow>,
        live_rate: Arc<ByteRate>,
        health: Arc<HealthState>,
        outage: Arc<OutageSwitch>,
        level: Arc<LevelCell>,
    ) -> Self {
        let inflight = Semaphore::new(cfg.inflight_max);
        Self {
            cfg,
            clients,
            apq,
            dlq,
            metrics,
            controls,
            fail_window,
            live_rate,
            replay_rate: ByteRate::new(),
            health,
            outage,
            level,
            inflight,
        }
    }

    /// Spawns the drain workers and replay workers under a child token of
    /// `parent`.
    #[must_use]
    pub fn spawn(self: Arc<Self>, parent: &CancellationToken) -> SenderTasks {
        let cancel = parent.child_token();
        let mut tasks = Vec::new();
        for worker in 0..self.cfg.parallelism {
            let sender = self.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                sender.worker_loop(worker, cancel).await;
            }));
        }
        for worker in 0..self.cfg.replay_parallelism {
            let sender = self.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                sender.replay_loop(worker, cancel).await;
            }));
        }
        info!(
            workers = self.cfg.parallelism,
            replay_workers = self.cfg.replay_parallelism,
            "sender started"
        );
        SenderTasks { cancel, tasks }
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        debug!(worker, "sender worker running");
        loop {
            let batch_age = self.controls.batch_max_age();
            let items = self
                .apq
                .dequeue_batch(self.cfg.batch_items, self.cfg.batch_bytes, batch_age, &cancel)
                .await;
            if items.is_empty() {
                if cancel.is_cancelled() {
                    break;
                }
                continue;
            }
            let mut outbound = compose_batches(items);
            // Higher-priority batches are offered to the exporter first.
            outbound.sort_by(|a, b| b.priority.cmp(&a.priority));
            for batch in outbound {
                self.send_with_retry(batch, &cancel).await;
            }
            if cancel.is_cancelled() && self.apq.is_empty() {
                break;
            }
        }
        debug!(worker, "sender worker stopped");
    }

    /// The per-batch transmission state machine:
    /// Pending → InFlight → {Acked, Retry(n), Spilled}.
    async fn send_with_retry(&self, mut batch: Outbound, cancel: &CancellationToken) {
        loop {
            batch.attempts += 1;
            let result = self.transport(&batch).await;
            match result {
                Ok(()) => {
                    self.metrics
                        .sender_export_attempts_total
                        .with_label_values(&["ack"])
                        .inc();
                    self.metrics.sender_auth_errors.set(0);
                    self.fail_window.record_ok();
                    self.live_rate.add(batch.bytes);
                    self.health.mark_delivery();
                    return;
                }
                Err(error) => {
                    self.fail_window.record_fail();
                    if error.is_auth() {
                        self.metrics.sender_auth_errors.set(1);
                        warn!(error = %error, "credentials rejected; spilling batch");
                        self.spill(&batch);
                        return;
                    }
                    if !error.is_retryable() {
                        debug!(error = %error, "permanent export failure; spilling batch");
                        self.spill(&batch);
                        return;
                    }
                    if batch.attempts > self.cfg.retry_max {
                        debug!(
                            attempts = batch.attempts,
                            "retry budget exhausted; spilling batch"
                        );
                        self.spill(&batch);
                        return;
                    }
                    self.metrics
                        .sender_export_attempts_total
                        .with_label_values(&["retry"])
                        .inc();
                    let delay = self.backoff(batch.attempts);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            // Shutdown overrides the backoff: persist now.
                            self.spill(&batch);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One transport attempt, counted against the in-flight cap.
    async fn transport(&self, batch: &Outbound) -> Result<(), ExportError> {
        let permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| ExportError::Retryable {
                details: "sender closed".to_string(),
            })?;
        self.metrics
            .sender_inflight
            .set((self.cfg.inflight_max - self.inflight.available_permits()) as i64);
        let result = if self.outage.is_active() {
            Err(ExportError::Retryable {
                details: "simulated outage".to_string(),
            })
        } else {
            self.clients.export(batch.request.clone()).await
        };
        drop(permit);
        self.metrics
            .sender_inflight
            .set((self.cfg.inflight_max - self.inflight.available_permits()) as i64);
        result
    }

    /// Exponential backoff, base 2, with full jitter, honoring the
    /// ceiling published by the degradation manager.
    fn backoff(&self, attempt: u32) -> Duration {
        let max = self.controls.backoff_max();
        let exp = self
            .cfg
            .backoff_min
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(max);
        let jittered = capped.mul_f64(rand::rng().random_range(0.0..=1.0));
        jittered.max(Duration::from_millis(1))
    }

    fn spill(&self, batch: &Outbound) {
        self.metrics
            .sender_export_attempts_total
            .with_label_values(&["spill"])
            .inc();
        let payload = encode_request_payload(&batch.request);
        match self.dlq.append(&payload) {
            Ok(_) => {
                // Durable spill counts as delivery for liveness purposes.
                self.health.mark_delivery();
                debug!(kind = %batch.kind, items = batch.items, "batch spilled to dlq");
            }
            Err(e) => {
                self.metrics.dlq_dropped_on_write_total.inc();
                self.metrics
                    .sender_export_attempts_total
                    .with_label_values(&["drop"])
                    .inc();
                warn!(error = %e, "durable spill failed; batch dropped");
            }
        }
    }

    // ── Replay ──────────────────────────────────────────────────────────

    fn replay_allowed(&self) -> bool {
        if self.controls.is_replay_paused() {
            return false;
        }
        if self.level.load() > DegradationLevel::L3 {
            return false;
        }
        if self.fail_window.success_rate() < REPLAY_HEALTH_THRESHOLD {
            return false;
        }
        // Throttle: replay stays below the configured fraction of live
        // throughput (with a floor so an idle agent still recovers).
        let live = self.live_rate.rate();
        let budget = (live * self.cfg.replay_throttle_ratio).max(REPLAY_RATE_FLOOR);
        self.replay_rate.rate() < budget
    }

    async fn replay_loop(&self, worker: usize, cancel: CancellationToken) {
        debug!(worker, "replay worker running");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.metrics
                .dlq_replay_rate_bytes
                .set(self.replay_rate.rate());
            if !self.dlq.has_backlog() || !self.replay_allowed() {
                tokio::select! {
                    _ = tokio::time::sleep(REPLAY_IDLE) => continue,
                    _ = cancel.cancelled() => break,
                }
            }
            let next = match self.dlq.next_replay() {
                Ok(Some(next)) => next,
                Ok(None) => {
                    // Backlog exists but is fully handed out to the other
                    // replay workers; wait for their acks.
                    tokio::select! {
                        _ = tokio::time::sleep(REPLAY_IDLE) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "replay read failed");
                    tokio::select! {
                        _ = tokio::time::sleep(REPLAY_IDLE) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            };
            let (reference, payload) = next;
            let replay = match ReplayBatch::decode(&payload) {
                Ok(replay) => replay,
                Err(e) => {
                    // The frame passed its crc but does not decode:
                    // integrity failure, never emitted to the backend.
                    self.metrics.dlq_integrity_drops_total.inc();
                    warn!(error = %e, "undecodable replay batch dropped");
                    self.dlq.ack(reference);
                    continue;
                }
            };
            let bytes = replay.bytes;
            self.replay_rate.add(bytes);
            self.send_replay(replay.into_export_request(), reference, &cancel)
                .await;
        }
        debug!(worker, "replay worker stopped");
    }

    /// Replay shares the live state machine, but on retry exhaustion the
    /// batch is marked poison instead of being re-appended.
    async fn send_replay(
        &self,
        request: ExportRequest,
        reference: nrdot_dlq::BatchRef,
        cancel: &CancellationToken,
    ) {
        let mut batch = Outbound {
            kind: SignalKind::Metric,
            priority: Priority::Normal,
            bytes: 0,
            items: 0,
            attempts: 0,
            request,
        };
        loop {
            batch.attempts += 1;
            match self.transport(&batch).await {
                Ok(()) => {
                    self.metrics
                        .sender_export_attempts_total
                        .with_label_values(&["ack"])
                        .inc();
                    self.fail_window.record_ok();
                    self.health.mark_delivery();
                    self.dlq.ack(reference);
                    return;
                }
                Err(error) => {
                    self.fail_window.record_fail();
                    if error.is_auth() {
                        self.metrics.sender_auth_errors.set(1);
                    }
                    let exhausted = batch.attempts > self.cfg.retry_max;
                    if !error.is_retryable() || exhausted {
                        warn!(error = %error, attempts = batch.attempts, "replay batch poisoned");
                        self.dlq.poison(reference);
                        return;
                    }
                    self.metrics
                        .sender_export_attempts_total
                        .with_label_values(&["retry"])
                        .inc();
                    let delay = self.backoff(batch.attempts);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            // Leave the record unresolved: it stays in the
                            // store and replays on the next run.
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Controlled shutdown: stop the workers, close the queue, then
    /// persist whatever is still queued as final batches in the DLQ.
    pub async fn shutdown(&self, tasks: SenderTasks, deadline: Duration) {
        info!(?deadline, "sender shutting down");
        tasks.cancel.cancel();
        let join_all = async {
            for task in tasks.tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("sender workers exceeded the shutdown deadline");
        }

        self.apq.close();
        let remainder = self.apq.drain_remaining();
        if remainder.is_empty() {
            return;
        }
        let count = remainder.len();
        for batch in compose_batches(remainder) {
            self.spill(&batch);
        }
        info!(items = count, "remaining queue spilled to dlq at shutdown");
    }
}

/// Groups dequeued items into per-signal-kind batches, preserving
/// ingestion order within each kind.
fn compose_batches(items: Vec<TelemetryItem>) -> Vec<Outbound> {
    let mut per_kind: [Option<Batch>; 3] = [None, None, None];
    let mut order = Vec::new();
    for item in items {
        let slot = match item.kind {
            SignalKind::Metric => 0,
            SignalKind::Span => 1,
            SignalKind::Log => 2,
        };
        let batch = per_kind[slot].get_or_insert_with(|| {
            order.push(slot);
            Batch::new(item.kind)
        });
        batch.push(item);
    }
    order
        .into_iter()
        .filter_map(|slot| per_kind[slot].take())
        .map(Outbound::from_batch)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn item(kind_name: &str, priority: Priority) -> TelemetryItem {
        let mut attributes = BTreeMap::new();
        let _ = attributes.insert("k".to_string(), kind_name.to_string());
        let mut item = TelemetryItem::synthesized_gauge("m", 1.0, attributes);
        item.priority = priority;
        item
    }

    #[test]
    fn batches_preserve_kind_and_order() {
        let a = item("a", Priority::Normal);
        let b = item("b", Priority::Normal);
        let (seq_a, seq_b) = (a.seq, b.seq);
        let batches = compose_batches(vec![a, b]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].kind, SignalKind::Metric);
        assert_eq!(batches[0].items, 2);
        match &batches[0].request {
            ExportRequest::Metrics(req) => assert_eq!(req.resource_metrics.len(), 2),
            other => panic!("unexpected request {other:?}"),
        }
        assert!(seq_b > seq_a);
    }

    #[test]
    fn batch_priority_is_max_of_members() {
        let batches = compose_batches(vec![
            item("a", Priority::Low),
            item("b", Priority::Critical),
            item("c", Priority::Normal),
        ]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].priority, Priority::Critical);
    }

    #[tokio::test]
    async fn backoff_is_bounded_and_jittered() {
        let config = nrdot_config::AgentConfig::default();
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut dlq_cfg = config.dlq.clone();
        dlq_cfg.dir = tmp.path().to_path_buf();
        let metrics = Metrics::new();
        let sender = Sender::new(
            config.sender.clone(),
            OtlpClients::new(&config.otlp).expect("clients"),
            Arc::new(PriorityQueue::new(&config.apq, metrics.clone())),
            Arc::new(DeadLetterStore::open(dlq_cfg, metrics.clone()).expect("dlq")),
            metrics,
            Arc::new(SenderControls::new(&config.sender)),
            Arc::new(RateWindow::new()),
            Arc::new(ByteRate::new()),
            Arc::new(HealthState::new()),
            Arc::new(OutageSwitch::new()),
            Arc::new(LevelCell::new()),
        );
        for attempt in 1..=10 {
            let delay = sender.backoff(attempt);
            assert!(delay <= config.sender.backoff_max);
            assert!(delay >= Duration::from_millis(1));
        }
    }
}
