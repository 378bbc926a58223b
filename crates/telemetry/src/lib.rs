// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Self-telemetry registry for the NRDOT+ agent.
//!
//! Every component records into one process-wide [`Metrics`] handle backed
//! by a private Prometheus registry. The stable series names defined here
//! are a public contract: dashboards and the test suite key off them.
//!
//! Registry operations never fail from the caller's perspective; all
//! series are pre-registered at construction with pre-sized label sets.

pub mod loopbreak;

pub use loopbreak::LoopbreakPublisher;

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

/// Process-wide metrics handle. Cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

/// The registered series. Field names mirror the exposed series names.
pub struct Inner {
    registry: Registry,
    started_at: Instant,

    /// APQ accounted bytes over its byte cap.
    pub apq_fill_ratio: Gauge,
    /// Items accepted into the APQ, by priority.
    pub apq_enqueued_total: IntCounterVec,
    /// Items the APQ refused or shed, by priority and reason.
    pub apq_dropped_total: IntCounterVec,
    /// Current queue depth, by priority.
    pub apq_depth: IntGaugeVec,

    /// Distinct fingerprints observed in the current window.
    pub cl_unique_keysets: IntGauge,
    /// Items dropped by the cardinality limiter.
    pub cl_dropped_total: IntCounter,
    /// Items rolled into overflow aggregates.
    pub cl_aggregated_total: IntCounter,
    /// Synthesized aggregate items emitted on flush.
    pub cl_flushed_aggregates_total: IntCounter,
    /// Limiter internal failures (fell back to pass-all).
    pub cl_failures_total: IntCounter,

    /// Total bytes on disk in the dead-letter queue.
    pub dlq_size_bytes: IntGauge,
    /// Number of segment files on disk.
    pub dlq_files_count: IntGauge,
    /// Smoothed replay read rate, bytes per second.
    pub dlq_replay_rate_bytes: Gauge,
    /// Whole sealed segments discarded by cap enforcement.
    pub dlq_dropped_segments_total: IntCounter,
    /// Batches dropped because a durable write failed.
    pub dlq_dropped_on_write_total: IntCounter,
    /// Records dropped by the startup integrity scan or replay crc checks.
    pub dlq_integrity_drops_total: IntCounter,
    /// Replay batches marked poison after retry exhaustion.
    pub dlq_poison_total: IntCounter,
    /// Batches handed to the sender by the replay iterator.
    pub dlq_replay_batches_total: IntCounter,

    /// Current degradation level (0..4).
    pub adm_current_level: IntGauge,
    /// Level transitions, labeled from/to/reason.
    pub adm_transitions_total: IntCounterVec,

    /// Export attempts by outcome (ack, retry, spill, drop).
    pub sender_export_attempts_total: IntCounterVec,
    /// Transports currently in flight.
    pub sender_inflight: IntGauge,
    /// Set while the destination rejects our credentials.
    pub sender_auth_errors: IntGauge,

    /// Items accepted at ingress, by signal.
    pub receiver_accepted_total: IntCounterVec,
    /// Items refused at ingress, by signal and reason.
    pub receiver_refused_total: IntCounterVec,

    /// Latency of the CL admit + APQ enqueue hot path.
    pub admit_latency_seconds: Histogram,
    /// Seconds since agent start.
    pub uptime_seconds: Gauge,
    /// Effective configuration fingerprint, value fixed at 1.
    pub config_info: IntGaugeVec,
}

impl Deref for Metrics {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        &self.inner
    }
}

macro_rules! register {
    ($registry:expr, $metric:expr) => {{
        let metric = $metric;
        $registry
            .register(Box::new(metric.clone()))
            .expect("metric registration is static and must not collide");
        metric
    }};
}

impl Metrics {
    /// Builds the registry with every series pre-registered.
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let apq_fill_ratio = register!(
            registry,
            Gauge::new("nrdot_apq_fill_ratio", "APQ accounted bytes / byte cap")
                .expect("valid metric")
        );
        let apq_enqueued_total = register!(
            registry,
            IntCounterVec::new(
                Opts::new("nrdot_apq_enqueued_total", "Items accepted into the APQ"),
                &["priority"],
            )
            .expect("valid metric")
        );
        let apq_dropped_total = register!(
            registry,
            IntCounterVec::new(
                Opts::new("nrdot_apq_dropped_total", "Items refused or shed by the APQ"),
                &["priority", "reason"],
            )
            .expect("valid metric")
        );
        let apq_depth = register!(
            registry,
            IntGaugeVec::new(
                Opts::new("nrdot_apq_depth", "Current APQ depth"),
                &["priority"],
            )
            .expect("valid metric")
        );

        let cl_unique_keysets = register!(
            registry,
            IntGauge::new(
                "nrdot_cl_unique_keysets",
                "Distinct fingerprints in the current window",
            )
            .expect("valid metric")
        );
        let cl_dropped_total = register!(
            registry,
            IntCounter::new(
                "nrdot_cl_dropped_total",
                "Items dropped by the cardinality limiter",
            )
            .expect("valid metric")
        );
        let cl_aggregated_total = register!(
            registry,
            IntCounter::new(
                "nrdot_cl_aggregated_total",
                "Items rolled into overflow aggregates",
            )
            .expect("valid metric")
        );
        let cl_flushed_aggregates_total = register!(
            registry,
            IntCounter::new(
                "nrdot_cl_flushed_aggregates_total",
                "Synthesized aggregate items emitted",
            )
            .expect("valid metric")
        );
        let cl_failures_total = register!(
            registry,
            IntCounter::new(
                "nrdot_cl_failures_total",
                "Limiter internal failures (pass-all fallback)",
            )
            .expect("valid metric")
        );

        let dlq_size_bytes = register!(
            registry,
            IntGauge::new("nrdot_dlq_size_bytes", "Total DLQ bytes on disk").expect("valid metric")
        );
        let dlq_files_count = register!(
            registry,
            IntGauge::new("nrdot_dlq_files_count", "DLQ segment files on disk")
                .expect("valid metric")
        );
        let dlq_replay_rate_bytes = register!(
            registry,
            Gauge::new(
                "nrdot_dlq_replay_rate_bytes",
                "Smoothed replay rate, bytes/s",
            )
            .expect("valid metric")
        );
        let dlq_dropped_segments_total = register!(
            registry,
            IntCounter::new(
                "nrdot_dlq_dropped_segments_total",
                "Sealed segments discarded by cap enforcement",
            )
            .expect("valid metric")
        );
        let dlq_dropped_on_write_total = register!(
            registry,
            IntCounter::new(
                "nrdot_dlq_dropped_on_write_total",
                "Batches dropped after a durable write failure",
            )
            .expect("valid metric")
        );
        let dlq_integrity_drops_total = register!(
            registry,
            IntCounter::new(
                "nrdot_dlq_integrity_drops_total",
                "Records dropped by integrity checks",
            )
            .expect("valid metric")
        );
        let dlq_poison_total = register!(
            registry,
            IntCounter::new(
                "nrdot_dlq_poison_total",
                "Replay batches marked poison after retry exhaustion",
            )
            .expect("valid metric")
        );
        let dlq_replay_batches_total = register!(
            registry,
            IntCounter::new(
                "nrdot_dlq_replay_batches_total",
                "Batches yielded to the sender by replay",
            )
            .expect("valid metric")
        );

        let adm_current_level = register!(
            registry,
            IntGauge::new("nrdot_adm_current_level", "Current degradation level")
                .expect("valid metric")
        );
        let adm_transitions_total = register!(
            registry,
            IntCounterVec::new(
                Opts::new("nrdot_adm_transitions_total", "Degradation transitions"),
                &["from", "to", "reason"],
            )
            .expect("valid metric")
        );

        let sender_export_attempts_total = register!(
            registry,
            IntCounterVec::new(
                Opts::new(
                    "nrdot_sender_export_attempts_total",
                    "Export attempts by outcome",
                ),
                &["outcome"],
            )
            .expect("valid metric")
        );
        let sender_inflight = register!(
            registry,
            IntGauge::new("nrdot_sender_inflight", "Transports currently in flight")
                .expect("valid metric")
        );
        let sender_auth_errors = register!(
            registry,
            IntGauge::new(
                "nrdot_sender_auth_errors",
                "Set while the destination rejects credentials",
            )
            .expect("valid metric")
        );

        let receiver_accepted_total = register!(
            registry,
            IntCounterVec::new(
                Opts::new("nrdot_receiver_accepted_total", "Items accepted at ingress"),
                &["signal"],
            )
            .expect("valid metric")
        );
        let receiver_refused_total = register!(
            registry,
            IntCounterVec::new(
                Opts::new("nrdot_receiver_refused_total", "Items refused at ingress"),
                &["signal", "reason"],
            )
            .expect("valid metric")
        );

        let admit_latency_seconds = register!(
            registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "nrdot_admit_latency_seconds",
                    "CL admit + APQ enqueue latency",
                )
                .buckets(vec![
                    0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05,
                ]),
            )
            .expect("valid metric")
        );
        let uptime_seconds = register!(
            registry,
            Gauge::new("nrdot_uptime_seconds", "Seconds since agent start").expect("valid metric")
        );
        let config_info = register!(
            registry,
            IntGaugeVec::new(
                Opts::new("nrdot_config_info", "Effective configuration fingerprint"),
                &["fingerprint"],
            )
            .expect("valid metric")
        );

        Self {
            inner: Arc::new(Inner {
                registry,
                started_at: Instant::now(),
                apq_fill_ratio,
                apq_enqueued_total,
                apq_dropped_total,
                apq_depth,
                cl_unique_keysets,
                cl_dropped_total,
                cl_aggregated_total,
                cl_flushed_aggregates_total,
                cl_failures_total,
                dlq_size_bytes,
                dlq_files_count,
                dlq_replay_rate_bytes,
                dlq_dropped_segments_total,
                dlq_dropped_on_write_total,
                dlq_integrity_drops_total,
                dlq_poison_total,
                dlq_replay_batches_total,
                adm_current_level,
                adm_transitions_total,
                sender_export_attempts_total,
                sender_inflight,
                sender_auth_errors,
                receiver_accepted_total,
                receiver_refused_total,
                admit_latency_seconds,
                uptime_seconds,
                config_info,
            }),
        }
    }

    /// Renders the whole registry in Prometheus text format.
    ///
    /// `gather()` copies each family out under its own lock, so the scrape
    /// observes a consistent generation and holds no long locks.
    #[must_use]
    pub fn encode_text(&self) -> String {
        self.inner
            .uptime_seconds
            .set(self.inner.started_at.elapsed().as_secs_f64());
        let families = self.inner.registry.gather();
        let mut out = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8(out).unwrap_or_default()
    }

    /// Records the effective configuration fingerprint.
    pub fn set_config_fingerprint(&self, fingerprint: u64) {
        self.inner
            .config_info
            .with_label_values(&[&format!("{fingerprint:016x}")])
            .set(1);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_names_are_exposed() {
        let metrics = Metrics::new();
        metrics.apq_enqueued_total.with_label_values(&["normal"]).inc();
        metrics
            .apq_dropped_total
            .with_label_values(&["low", "overflow"])
            .inc_by(3);
        metrics.dlq_size_bytes.set(1024);
        metrics.adm_current_level.set(2);
        metrics
            .sender_export_attempts_total
            .with_label_values(&["ack"])
            .inc();

        let text = metrics.encode_text();
        assert!(text.contains("nrdot_apq_enqueued_total{priority=\"normal\"} 1"));
        assert!(text.contains("nrdot_apq_dropped_total{priority=\"low\",reason=\"overflow\"} 3"));
        assert!(text.contains("nrdot_dlq_size_bytes 1024"));
        assert!(text.contains("nrdot_adm_current_level 2"));
        assert!(text.contains("nrdot_sender_export_attempts_total{outcome=\"ack\"} 1"));
        assert!(text.contains("nrdot_uptime_seconds"));
    }

    #[test]
    fn counters_never_fail_on_repeat_labels() {
        let metrics = Metrics::new();
        for _ in 0..1000 {
            metrics
                .receiver_refused_total
                .with_label_values(&["metric", "loopbreak"])
                .inc();
        }
        assert_eq!(
            metrics
                .receiver_refused_total
                .with_label_values(&["metric", "loopbreak"])
                .get(),
            1000
        );
    }

    #[test]
    fn config_fingerprint_is_labeled() {
        let metrics = Metrics::new();
        metrics.set_config_fingerprint(0xdead_beef);
        let text = metrics.encode_text();
        assert!(text.contains("nrdot_config_info{fingerprint=\"00000000deadbeef\"} 1"));
    }
}
