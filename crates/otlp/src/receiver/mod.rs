// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! OTLP ingress: the shared admission path of both receivers.

pub mod grpc;
pub mod http;

use nrdot_engine::control::LevelCell;
use nrdot_engine::degradation::DegradationLevel;
use nrdot_engine::pipeline::{AdmitOutcome, Admitter};
use nrdot_pdata::TelemetryItem;
use nrdot_telemetry::Metrics;
use std::sync::Arc;
use std::time::Duration;

/// State shared by both ingress surfaces.
#[derive(Clone)]
pub struct Ingress {
    admitter: Arc<Admitter>,
    metrics: Metrics,
    level: Arc<LevelCell>,
}

/// Result of admitting one export request's items.
#[derive(Debug, PartialEq, Eq)]
pub enum IngressDecision {
    /// At least part of the request was taken; answer success.
    Accepted,
    /// Every admissible item was refused by backpressure policy; answer a
    /// retryable error with this suggested delay.
    Backpressure {
        /// Suggested client retry delay, derived from the degradation level.
        retry_after: Duration,
    },
}

impl Ingress {
    /// Creates the shared ingress state.
    #[must_use]
    pub fn new(admitter: Arc<Admitter>, metrics: Metrics, level: Arc<LevelCell>) -> Self {
        Self {
            admitter,
            metrics,
            level,
        }
    }

    /// Offers split items to the pipeline, tracking acceptance counters.
    ///
    /// Items carrying the loop-break marker are refused outright: the
    /// agent's own republished metrics must not re-enter through ingress.
    pub fn admit(&self, items: Vec<TelemetryItem>) -> IngressDecision {
        let mut offered = 0usize;
        let mut policy_refused = 0usize;
        for item in items {
            let signal = item.kind.as_str();
            if item.is_loopbreak() {
                self.metrics
                    .receiver_refused_total
                    .with_label_values(&[signal, "loopbreak"])
                    .inc();
                continue;
            }
            offered += 1;
            match self.admitter.offer(item) {
                AdmitOutcome::Accepted | AdmitOutcome::Aggregated | AdmitOutcome::Spilled => {
                    self.metrics
                        .receiver_accepted_total
                        .with_label_values(&[signal])
                        .inc();
                }
                AdmitOutcome::DroppedPolicy => {
                    policy_refused += 1;
                    self.metrics
                        .receiver_refused_total
                        .with_label_values(&[signal, "backpressure"])
                        .inc();
                }
                AdmitOutcome::DroppedTransform => {
                    self.metrics
                        .receiver_refused_total
                        .with_label_values(&[signal, "transform"])
                        .inc();
                }
                AdmitOutcome::DroppedCardinality => {
                    self.metrics
                        .receiver_refused_total
                        .with_label_values(&[signal, "cardinality"])
                        .inc();
                }
                AdmitOutcome::DroppedSpillFailed => {
                    self.metrics
                        .receiver_refused_total
                        .with_label_values(&[signal, "spill_failed"])
                        .inc();
                }
            }
        }
        if offered > 0 && policy_refused == offered {
            IngressDecision::Backpressure {
                retry_after: suggested_delay(self.level.load()),
            }
        } else {
            IngressDecision::Accepted
        }
    }
}

/// Client retry delay per degradation level.
fn suggested_delay(level: DegradationLevel) -> Duration {
    match level {
        DegradationLevel::L0 | DegradationLevel::L1 => Duration::from_secs(1),
        DegradationLevel::L2 => Duration::from_secs(2),
        DegradationLevel::L3 => Duration::from_secs(5),
        DegradationLevel::L4 => Duration::from_secs(30),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrdot_config::AgentConfig;
    use nrdot_engine::pipeline::Core;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;

    fn ingress_with(items_cap: usize) -> (Ingress, Core, tempfile::TempDir) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = AgentConfig::default();
        config.dlq.dir = tmp.path().to_path_buf();
        config.apq.items_cap = items_cap;
        let metrics = Metrics::new();
        let core = Core::build(&config, metrics.clone(), None, CancellationToken::new())
            .expect("core");
        let ingress = Ingress::new(core.admitter.clone(), metrics, core.level.clone());
        (ingress, core, tmp)
    }

    fn plain_item(name: &str) -> TelemetryItem {
        let mut attributes = BTreeMap::new();
        let _ = attributes.insert("service".to_string(), name.to_string());
        TelemetryItem::synthesized_gauge("m", 1.0, attributes)
    }

    fn loopbreak_item() -> TelemetryItem {
        let mut attributes = BTreeMap::new();
        let _ = attributes.insert("nrdot.loopbreak".to_string(), "true".to_string());
        TelemetryItem::synthesized_gauge("m", 1.0, attributes)
    }

    #[tokio::test]
    async fn loopbreak_items_never_re_enter() {
        let (ingress, core, _tmp) = ingress_with(100);
        let decision = ingress.admit(vec![loopbreak_item(), plain_item("a")]);
        assert_eq!(decision, IngressDecision::Accepted);
        assert_eq!(core.apq.len(), 1);
        assert_eq!(
            ingress
                .metrics
                .receiver_refused_total
                .with_label_values(&["metric", "loopbreak"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn total_policy_refusal_reports_backpressure_with_level_delay() {
        let (ingress, core, _tmp) = ingress_with(100);
        core.apq.set_arrival_floor(Some(nrdot_pdata::Priority::Critical));
        core.level.store(DegradationLevel::L4);
        let decision = ingress.admit(vec![plain_item("a"), plain_item("b")]);
        assert_eq!(
            decision,
            IngressDecision::Backpressure {
                retry_after: Duration::from_secs(30)
            }
        );
    }
}
