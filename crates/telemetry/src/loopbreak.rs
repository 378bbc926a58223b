// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Loop-break republisher.
//!
//! Republishes the most important self-telemetry values as OTLP metric
//! items on the agent's own pipeline. Every synthesized item carries
//! `nrdot.loopbreak=true`; ingress refuses to re-admit such items, which
//! breaks the cycle of the agent exporting its own metrics through itself.

use crate::Metrics;
use nrdot_pdata::{LOOPBREAK_KEY, TelemetryItem};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Injects synthesized items into the pipeline admission entry.
pub type Inject = Box<dyn Fn(TelemetryItem) + Send + Sync>;

/// Periodic task republishing self-metrics as OTLP items.
pub struct LoopbreakPublisher {
    metrics: Metrics,
    interval: Duration,
    inject: Inject,
}

impl LoopbreakPublisher {
    /// Creates the publisher. `inject` is the pipeline admission entry.
    #[must_use]
    pub fn new(metrics: Metrics, interval: Duration, inject: Inject) -> Self {
        Self {
            metrics,
            interval,
            inject,
        }
    }

    /// Runs until cancelled, publishing one snapshot per interval.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.publish_once(),
            }
        }
    }

    /// Publishes one snapshot of the headline series.
    pub fn publish_once(&self) {
        for (name, value) in self.snapshot() {
            let mut attributes = BTreeMap::new();
            let _ = attributes.insert(LOOPBREAK_KEY.to_string(), "true".to_string());
            let _ = attributes.insert("nrdot.priority".to_string(), "low".to_string());
            (self.inject)(TelemetryItem::synthesized_gauge(name, value, attributes));
        }
    }

    /// The headline values worth exporting alongside the scrape endpoint.
    fn snapshot(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("nrdot_apq_fill_ratio", self.metrics.apq_fill_ratio.get()),
            (
                "nrdot_dlq_size_bytes",
                self.metrics.dlq_size_bytes.get() as f64,
            ),
            (
                "nrdot_adm_current_level",
                self.metrics.adm_current_level.get() as f64,
            ),
            (
                "nrdot_cl_unique_keysets",
                self.metrics.cl_unique_keysets.get() as f64,
            ),
            (
                "nrdot_sender_inflight",
                self.metrics.sender_inflight.get() as f64,
            ),
        ]
    }
}
