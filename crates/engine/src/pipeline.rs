// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Pipeline core: admission entry, component wiring and lifecycle.
//!
//! [`Core::build`] constructs the data-plane components in dependency
//! order (registry → DLQ recovery → CL → APQ → ADM); [`Core::start`]
//! spawns the control tasks; the binary wires receivers, sender and the
//! admin surface around the core and drives [`Core::shutdown`] in reverse
//! order on exit.
//!
//! [`Admitter::offer`] is the single admission entry used by both
//! receivers and the loop-break republisher: transform hook → cardinality
//! limiter → priority queue, with refused items spilled to the DLQ or
//! dropped according to the published degradation level.

use crate::apq::{Enqueue, PriorityQueue};
use crate::cardinality::{Admission, CardinalityLimiter};
use crate::control::{ByteRate, HealthState, LevelCell, OutageSwitch, RateWindow, SenderControls};
use crate::degradation::{DegradationLevel, DegradationManager, RunExit};
use crate::error::CoreError;
use nrdot_config::AgentConfig;
use nrdot_dlq::DeadLetterStore;
use nrdot_pdata::{Batch, Priority, TelemetryItem};
use nrdot_telemetry::Metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pre-admission transform hook, run before fingerprinting. Returning
/// `None` discards the item. The stable extension point for attribute
/// scrubbing and future processors.
pub type TransformHook = Box<dyn Fn(TelemetryItem) -> Option<TelemetryItem> + Send + Sync>;

/// Outcome of offering one item to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Queued for transmission.
    Accepted,
    /// Folded into a cardinality overflow aggregate.
    Aggregated,
    /// Routed to the DLQ (queue overflow spill).
    Spilled,
    /// Dropped by the transform hook.
    DroppedTransform,
    /// Dropped by the cardinality limiter.
    DroppedCardinality,
    /// Dropped by degradation policy or shutdown.
    DroppedPolicy,
    /// Dropped because the durable spill failed.
    DroppedSpillFailed,
}

/// The single admission entry for telemetry items.
pub struct Admitter {
    transform: Option<TransformHook>,
    cl: Arc<Mutex<CardinalityLimiter>>,
    apq: Arc<PriorityQueue>,
    dlq: Arc<DeadLetterStore>,
    level: Arc<LevelCell>,
    metrics: Metrics,
}

impl Admitter {
    /// Offers one item to the pipeline. Non-blocking; refusals become
    /// counters, never errors.
    pub fn offer(&self, item: TelemetryItem) -> AdmitOutcome {
        let start = Instant::now();
        let outcome = self.offer_inner(item);
        self.metrics
            .admit_latency_seconds
            .observe(start.elapsed().as_secs_f64());
        outcome
    }

    fn offer_inner(&self, item: TelemetryItem) -> AdmitOutcome {
        let mut item = match &self.transform {
            Some(transform) => match transform(item) {
                Some(item) => item,
                None => return AdmitOutcome::DroppedTransform,
            },
            None => item,
        };

        match self.cl.lock().admit(&mut item) {
            Admission::Pass => {}
            Admission::Aggregated => return AdmitOutcome::Aggregated,
            Admission::Dropped => return AdmitOutcome::DroppedCardinality,
        }
        self.enqueue_admitted(item)
    }

    /// Enqueues an item that already passed (or legitimately bypasses)
    /// the cardinality limiter: synthesized aggregates and loop-break
    /// republications.
    pub fn enqueue_direct(&self, item: TelemetryItem) -> AdmitOutcome {
        self.enqueue_admitted(item)
    }

    fn enqueue_admitted(&self, item: TelemetryItem) -> AdmitOutcome {
        match self.apq.enqueue(item) {
            Enqueue::Accepted => AdmitOutcome::Accepted,
            Enqueue::Spilled { evicted } => {
                let _ = self.route_overflow(evicted);
                AdmitOutcome::Accepted
            }
            Enqueue::RejectedFull(item) => self.route_overflow(item),
            Enqueue::RejectedPolicy(_) | Enqueue::RejectedShutdown(_) => {
                AdmitOutcome::DroppedPolicy
            }
        }
    }

    /// Routes a queue-overflow item: durable spill by default; at L2+ a
    /// low-priority overflow is dropped instead of spilled.
    fn route_overflow(&self, item: TelemetryItem) -> AdmitOutcome {
        let level = self.level.load();
        if level >= DegradationLevel::L2 && item.priority == Priority::Low {
            self.metrics
                .apq_dropped_total
                .with_label_values(&[item.priority.as_str(), "overflow"])
                .inc();
            return AdmitOutcome::DroppedPolicy;
        }
        let mut batch = Batch::new(item.kind);
        batch.push(item);
        match self.dlq.append(&batch.encode_payload()) {
            Ok(_) => AdmitOutcome::Spilled,
            Err(e) => {
                self.metrics.dlq_dropped_on_write_total.inc();
                let priority = batch.priority();
                self.metrics
                    .apq_dropped_total
                    .with_label_values(&[priority.as_str(), "overflow"])
                    .inc();
                warn!(error = %e, "overflow spill failed; item dropped");
                AdmitOutcome::DroppedSpillFailed
            }
        }
    }
}

/// The assembled data-plane core and its control tasks.
pub struct Core {
    /// Self-telemetry handle.
    pub metrics: Metrics,
    /// Admission entry shared with receivers and the republisher.
    pub admitter: Arc<Admitter>,
    /// The priority queue (the sender drains it).
    pub apq: Arc<PriorityQueue>,
    /// The durable store (the sender spills to and replays from it).
    pub dlq: Arc<DeadLetterStore>,
    /// The cardinality limiter (flushed at shutdown).
    pub cl: Arc<Mutex<CardinalityLimiter>>,
    /// Published degradation level.
    pub level: Arc<LevelCell>,
    /// Sender knobs steered by the degradation manager.
    pub controls: Arc<SenderControls>,
    /// Sender outcome window feeding the degradation manager.
    pub fail_window: Arc<RateWindow>,
    /// Live egress byte rate, for the replay throttle.
    pub live_rate: Arc<ByteRate>,
    /// Health state behind `/healthz`.
    pub health: Arc<HealthState>,
    /// Simulated outage switch behind `POST /outage`.
    pub outage: Arc<OutageSwitch>,
    /// Set when the degradation watchdog forced the shutdown; maps to the
    /// unrecoverable-error exit code.
    pub degraded_panic: Arc<AtomicBool>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Core {
    /// Builds the components in dependency order. Opening the durable
    /// store performs its recovery scan here; a failure is fatal.
    pub fn build(
        config: &AgentConfig,
        metrics: Metrics,
        transform: Option<TransformHook>,
        cancel: CancellationToken,
    ) -> Result<Self, CoreError> {
        let dlq = Arc::new(DeadLetterStore::open(config.dlq.clone(), metrics.clone())?);
        let cl = Arc::new(Mutex::new(CardinalityLimiter::new(
            &config.cl,
            metrics.clone(),
        )));
        let apq = Arc::new(PriorityQueue::new(&config.apq, metrics.clone()));
        let level = Arc::new(LevelCell::new());
        let controls = Arc::new(SenderControls::new(&config.sender));
        let fail_window = Arc::new(RateWindow::new());
        let admitter = Arc::new(Admitter {
            transform,
            cl: cl.clone(),
            apq: apq.clone(),
            dlq: dlq.clone(),
            level: level.clone(),
            metrics: metrics.clone(),
        });
        Ok(Self {
            metrics,
            admitter,
            apq,
            dlq,
            cl,
            level,
            controls,
            fail_window,
            live_rate: Arc::new(ByteRate::new()),
            health: Arc::new(HealthState::new()),
            outage: Arc::new(OutageSwitch::new()),
            degraded_panic: Arc::new(AtomicBool::new(false)),
            cancel,
            tasks: Vec::new(),
        })
    }

    /// Spawns the control tasks: the degradation loop, the cardinality
    /// reconciler and DLQ maintenance.
    pub fn start(&mut self, config: &AgentConfig) {
        self.health.set_running(true);

        let adm = DegradationManager::new(
            config.adm.clone(),
            &config.sender,
            config.cl.budget,
            config.dlq.max_bytes,
            self.apq.clone(),
            self.cl.clone(),
            self.dlq.clone(),
            self.controls.clone(),
            self.fail_window.clone(),
            self.level.clone(),
            self.metrics.clone(),
        );
        let cancel = self.cancel.clone();
        let panic_flag = self.degraded_panic.clone();
        let panic_cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            if adm.run(cancel).await == RunExit::DegradedPanic {
                panic_flag.store(true, Ordering::Relaxed);
                panic_cancel.cancel();
            }
        }));

        // Cardinality reconciler: window rolls and overflow flushes are
        // owned by this single task; synthesized aggregates re-enter the
        // queue directly (they are already admitted).
        let cl = self.cl.clone();
        let admitter = self.admitter.clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let synthesized = cl.lock().tick(Instant::now());
                        for item in synthesized {
                            let _ = admitter.enqueue_direct(item);
                        }
                    }
                }
            }
        }));

        let dlq = self.dlq.clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => dlq.maintain(),
                }
            }
        }));

        info!("pipeline core started");
    }

    /// The core's cancellation token; child tokens of it drive receivers
    /// and the sender.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Flushes pending cardinality aggregates into the queue. Called
    /// after receivers stop and before the sender drains, so aggregates
    /// ride the final batches out.
    pub fn flush_aggregates(&self) {
        let synthesized = self.cl.lock().flush_overflow();
        for item in synthesized {
            let _ = self.admitter.enqueue_direct(item);
        }
    }

    /// Shuts the core down: flushes pending cardinality aggregates into
    /// the queue, joins control tasks and fsyncs the durable store. The
    /// sender must have been drained first.
    pub async fn shutdown(mut self, deadline: Duration) {
        self.health.set_running(false);
        self.cancel.cancel();
        self.flush_aggregates();

        let join_all = async {
            for task in self.tasks.drain(..) {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("control tasks did not stop within the shutdown deadline");
        }

        if let Err(e) = self.dlq.flush() {
            warn!(error = %e, "final durable flush failed");
        }
        info!("pipeline core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrdot_config::AgentConfig;
    use std::collections::BTreeMap;

    fn test_config(dir: &std::path::Path) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.dlq.dir = dir.to_path_buf();
        config
    }

    fn item_with(service: &str) -> TelemetryItem {
        let mut attributes = BTreeMap::new();
        let _ = attributes.insert("service".to_string(), service.to_string());
        TelemetryItem::synthesized_gauge("m", 1.0, attributes)
    }

    #[tokio::test]
    async fn offer_admits_and_assigns_fingerprint() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = test_config(tmp.path());
        let core = Core::build(
            &config,
            Metrics::new(),
            None,
            CancellationToken::new(),
        )
        .expect("build");

        assert_eq!(core.admitter.offer(item_with("svc")), AdmitOutcome::Accepted);
        assert_eq!(core.apq.len(), 1);
        let drained = core.apq.drain_remaining();
        assert_ne!(drained[0].fingerprint, 0);
    }

    #[tokio::test]
    async fn transform_hook_can_discard() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = test_config(tmp.path());
        let transform: TransformHook =
            Box::new(|item| (!item.attributes.contains_key("drop_me")).then_some(item));
        let core = Core::build(
            &config,
            Metrics::new(),
            Some(transform),
            CancellationToken::new(),
        )
        .expect("build");

        let mut attributes = BTreeMap::new();
        let _ = attributes.insert("drop_me".to_string(), "1".to_string());
        let dropped = TelemetryItem::synthesized_gauge("m", 1.0, attributes);
        assert_eq!(core.admitter.offer(dropped), AdmitOutcome::DroppedTransform);
        assert_eq!(core.admitter.offer(item_with("keep")), AdmitOutcome::Accepted);
    }

    #[tokio::test]
    async fn queue_overflow_spills_to_dlq() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(tmp.path());
        config.apq.items_cap = 2;
        let core = Core::build(
            &config,
            Metrics::new(),
            None,
            CancellationToken::new(),
        )
        .expect("build");

        assert_eq!(core.admitter.offer(item_with("a")), AdmitOutcome::Accepted);
        assert_eq!(core.admitter.offer(item_with("b")), AdmitOutcome::Accepted);
        // same priority: the new arrival is the one spilled
        assert_eq!(core.admitter.offer(item_with("c")), AdmitOutcome::Spilled);
        assert!(core.dlq.total_bytes() > 0);
    }

    #[tokio::test]
    async fn l2_drops_low_priority_overflow_instead_of_spilling() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(tmp.path());
        config.apq.items_cap = 1;
        let core = Core::build(
            &config,
            Metrics::new(),
            None,
            CancellationToken::new(),
        )
        .expect("build");
        core.level.store(DegradationLevel::L2);

        assert_eq!(core.admitter.offer(item_with("a")), AdmitOutcome::Accepted);
        let mut attributes = BTreeMap::new();
        let _ = attributes.insert("service".to_string(), "b".to_string());
        let _ = attributes.insert("nrdot.priority".to_string(), "low".to_string());
        let low = TelemetryItem::synthesized_gauge("m", 1.0, attributes);
        assert_eq!(core.admitter.offer(low), AdmitOutcome::DroppedPolicy);
        assert_eq!(core.dlq.total_bytes(), 0);
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_aggregates() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(tmp.path());
        config.cl.budget = 1;
        let mut core = Core::build(
            &config,
            Metrics::new(),
            None,
            CancellationToken::new(),
        )
        .expect("build");
        core.start(&config);

        assert_eq!(core.admitter.offer(item_with("a")), AdmitOutcome::Accepted);
        assert_eq!(core.admitter.offer(item_with("b")), AdmitOutcome::Aggregated);

        let apq = core.apq.clone();
        core.shutdown(Duration::from_secs(2)).await;
        // the aggregate was flushed into the queue at shutdown
        let drained = apq.drain_remaining();
        assert!(
            drained
                .iter()
                .any(|i| i.attributes.get("reason").map(String::as_str)
                    == Some("cardinality_overflow"))
        );
    }
}
