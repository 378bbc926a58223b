// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Cardinality limiter.
//!
//! Bounds the number of distinct key-set fingerprints observed per
//! sliding window. Membership uses two rotating exact hash sets covering
//! half a window each, so the effective window slides in half-window
//! steps: zero false positives, bounded false negatives at the rotation
//! boundary, memory O(budget).
//!
//! Items beyond the ceiling are rolled into a per-signal-kind overflow
//! bucket that a periodic flush turns into one synthesized metric item;
//! under degradation (L3+) overflow items are dropped outright.

use ahash::AHashSet;
use nrdot_pdata::{Fingerprinter, SignalKind, TelemetryItem, fingerprint::kind_constant};
use nrdot_telemetry::Metrics;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Decision for one admitted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The item passes downstream unchanged.
    Pass,
    /// The item was folded into the overflow bucket; the caller discards
    /// it (a synthesized aggregate is emitted by the periodic flush).
    Aggregated,
    /// The item was dropped by degradation policy.
    Dropped,
}

#[derive(Debug, Default, Clone, Copy)]
struct OverflowBucket {
    count: u64,
    bytes: u64,
}

/// Hard multiple of the budget at which the limiter assumes its own
/// bookkeeping is broken and falls back to pass-all.
const FAILSAFE_FACTOR: usize = 4;

/// The windowed fingerprint limiter.
pub struct CardinalityLimiter {
    fingerprinter: Fingerprinter,
    budget: usize,
    /// Budget change requested by the degradation manager, applied at the
    /// next window roll so observed cardinality stays monotonic within a
    /// window.
    pending_budget: Option<usize>,
    current: AHashSet<u64>,
    previous: AHashSet<u64>,
    /// Fingerprints present in both sets, for O(1) distinct counting.
    overlap: usize,
    half_window: Duration,
    last_roll: Instant,
    last_flush: Instant,
    flush_interval: Duration,
    drop_on_overflow: bool,
    drop_noncritical: bool,
    overflow: [OverflowBucket; 3],
    metrics: Metrics,
}

impl CardinalityLimiter {
    /// Creates a limiter from configuration.
    #[must_use]
    pub fn new(cfg: &nrdot_config::CardinalityConfig, metrics: Metrics) -> Self {
        let now = Instant::now();
        Self {
            fingerprinter: Fingerprinter::new(cfg.exclude_keys.clone()),
            budget: cfg.budget,
            pending_budget: None,
            current: AHashSet::with_capacity(cfg.budget.min(1 << 20)),
            previous: AHashSet::new(),
            overlap: 0,
            half_window: Duration::from_secs(cfg.window_seconds.max(2) / 2),
            last_roll: now,
            last_flush: now,
            flush_interval: cfg.flush_interval,
            drop_on_overflow: false,
            drop_noncritical: false,
            overflow: [OverflowBucket::default(); 3],
            metrics: metrics.clone(),
        }
    }

    /// Distinct fingerprints currently inside the window.
    #[must_use]
    pub fn unique_keysets(&self) -> usize {
        self.current.len() + self.previous.len() - self.overlap
    }

    /// Admits one item, assigning its fingerprint.
    ///
    /// Non-blocking and infallible: bookkeeping anomalies degrade to
    /// pass-all with a failure counter rather than surfacing an error.
    pub fn admit(&mut self, item: &mut TelemetryItem) -> Admission {
        let fingerprint = self.fingerprinter.fingerprint(item);
        item.fingerprint = fingerprint;

        // Loop-break self-metrics and items with no identifying
        // attributes always pass; they never charge the budget.
        if item.is_loopbreak() || fingerprint == kind_constant(item.kind) {
            return Admission::Pass;
        }

        if self.drop_noncritical && item.priority != nrdot_pdata::Priority::Critical {
            self.metrics.cl_dropped_total.inc();
            return Admission::Dropped;
        }

        if self.current.len() > self.budget.saturating_mul(FAILSAFE_FACTOR) {
            // Failsafe: something is off with rotation; never stall the
            // hot path over limiter bookkeeping.
            self.metrics.cl_failures_total.inc();
            return Admission::Pass;
        }

        if self.current.contains(&fingerprint) {
            return Admission::Pass;
        }
        if self.previous.contains(&fingerprint) {
            // Refresh into the current half so the series survives the
            // next rotation.
            if self.current.insert(fingerprint) {
                self.overlap += 1;
            }
            return Admission::Pass;
        }

        if self.unique_keysets() < self.budget {
            let _ = self.current.insert(fingerprint);
            return Admission::Pass;
        }

        // At the ceiling.
        if self.drop_on_overflow {
            self.metrics.cl_dropped_total.inc();
            return Admission::Dropped;
        }
        let bucket = &mut self.overflow[bucket_index(item.kind)];
        bucket.count += 1;
        bucket.bytes += item.encoded_size as u64;
        self.metrics.cl_aggregated_total.inc();
        Admission::Aggregated
    }

    /// Rolls the window and flushes overflow aggregates when due. Called
    /// by the reconciler tick; returns synthesized items to enqueue.
    pub fn tick(&mut self, now: Instant) -> Vec<TelemetryItem> {
        let mut out = Vec::new();
        if now.duration_since(self.last_roll) >= self.half_window {
            self.roll(now);
            out.extend(self.flush_overflow());
        } else if now.duration_since(self.last_flush) >= self.flush_interval {
            out.extend(self.flush_overflow());
        }
        self.metrics
            .cl_unique_keysets
            .set(self.unique_keysets() as i64);
        out
    }

    fn roll(&mut self, now: Instant) {
        debug!(
            unique = self.unique_keysets(),
            budget = self.budget,
            "cardinality window roll"
        );
        self.previous = std::mem::take(&mut self.current);
        self.overlap = 0;
        self.last_roll = now;
        if let Some(budget) = self.pending_budget.take() {
            info!(from = self.budget, to = budget, "cardinality budget applied at window roll");
            self.budget = budget;
        }
    }

    /// Emits one synthesized aggregate item per signal kind with pending
    /// overflow, and resets the buckets.
    pub fn flush_overflow(&mut self) -> Vec<TelemetryItem> {
        self.last_flush = Instant::now();
        let mut out = Vec::new();
        for kind in [SignalKind::Metric, SignalKind::Span, SignalKind::Log] {
            let bucket = std::mem::take(&mut self.overflow[bucket_index(kind)]);
            if bucket.count == 0 {
                continue;
            }
            let mut attributes = BTreeMap::new();
            let _ = attributes.insert("signal_kind".to_string(), kind.as_str().to_string());
            let _ = attributes.insert("reason".to_string(), "cardinality_overflow".to_string());
            let _ = attributes.insert(
                "nrdot.overflow_bytes".to_string(),
                bucket.bytes.to_string(),
            );
            out.push(TelemetryItem::synthesized_gauge(
                "nrdot_cl_overflow_items",
                bucket.count as f64,
                attributes,
            ));
            self.metrics.cl_flushed_aggregates_total.inc();
        }
        out
    }

    /// Requests a new budget; takes effect at the next window roll, never
    /// mid-window.
    pub fn set_budget(&mut self, budget: usize) {
        if budget == self.budget {
            self.pending_budget = None;
        } else {
            self.pending_budget = Some(budget.max(1));
        }
    }

    /// L3+ policy: drop at the ceiling instead of aggregating.
    pub fn set_drop_on_overflow(&mut self, drop: bool) {
        self.drop_on_overflow = drop;
    }

    /// L4 policy: drop every non-critical item.
    pub fn set_drop_noncritical(&mut self, drop: bool) {
        self.drop_noncritical = drop;
    }

    /// The currently effective budget.
    #[must_use]
    pub fn budget(&self) -> usize {
        self.budget
    }
}

const fn bucket_index(kind: SignalKind) -> usize {
    match kind {
        SignalKind::Metric => 0,
        SignalKind::Span => 1,
        SignalKind::Log => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrdot_config::CardinalityConfig;
    use nrdot_pdata::Priority;

    fn limiter(budget: usize) -> (CardinalityLimiter, Metrics) {
        let metrics = Metrics::new();
        let cfg = CardinalityConfig {
            budget,
            window_seconds: 600,
            exclude_keys: vec!["trace_id".to_string()],
            flush_interval: Duration::from_secs(30),
        };
        (CardinalityLimiter::new(&cfg, metrics.clone()), metrics)
    }

    fn item_with(service: &str) -> TelemetryItem {
        let mut attributes = BTreeMap::new();
        let _ = attributes.insert("service".to_string(), service.to_string());
        TelemetryItem::synthesized_gauge("m", 1.0, attributes)
    }

    #[test]
    fn admits_below_budget_and_aggregates_above() {
        let (mut cl, metrics) = limiter(3);
        for i in 0..3 {
            let mut item = item_with(&format!("svc-{i}"));
            assert_eq!(cl.admit(&mut item), Admission::Pass);
            assert_ne!(item.fingerprint, 0);
        }
        assert_eq!(cl.unique_keysets(), 3);

        // the 4th distinct fingerprint overflows into the bucket
        let mut item = item_with("svc-overflow");
        assert_eq!(cl.admit(&mut item), Admission::Aggregated);
        assert_eq!(metrics.cl_aggregated_total.get(), 1);
        // repeats of an admitted fingerprint still pass
        let mut repeat = item_with("svc-1");
        assert_eq!(cl.admit(&mut repeat), Admission::Pass);
        assert_eq!(cl.unique_keysets(), 3);
    }

    #[test]
    fn overflow_flush_synthesizes_one_item_per_kind() {
        let (mut cl, metrics) = limiter(1);
        let mut a = item_with("a");
        let _ = cl.admit(&mut a);
        for name in ["b", "c", "d"] {
            let mut item = item_with(name);
            assert_eq!(cl.admit(&mut item), Admission::Aggregated);
        }
        let flushed = cl.flush_overflow();
        assert_eq!(flushed.len(), 1);
        assert_eq!(
            flushed[0].attributes.get("reason").map(String::as_str),
            Some("cardinality_overflow")
        );
        assert_eq!(
            flushed[0].attributes.get("signal_kind").map(String::as_str),
            Some("metric")
        );
        assert_eq!(metrics.cl_flushed_aggregates_total.get(), 1);
        // bucket resets after flush
        assert!(cl.flush_overflow().is_empty());
    }

    #[test]
    fn excluded_keys_collapse_to_one_fingerprint() {
        let (mut cl, _metrics) = limiter(2);
        for i in 0..10 {
            let mut attributes = BTreeMap::new();
            let _ = attributes.insert("service".to_string(), "api".to_string());
            let _ = attributes.insert("trace_id".to_string(), format!("id-{i}"));
            let mut item = TelemetryItem::synthesized_gauge("m", 1.0, attributes);
            assert_eq!(cl.admit(&mut item), Admission::Pass);
        }
        assert_eq!(cl.unique_keysets(), 1);
    }

    #[test]
    fn items_without_attributes_always_pass() {
        let (mut cl, _metrics) = limiter(1);
        let mut a = item_with("a");
        let _ = cl.admit(&mut a);
        for _ in 0..10 {
            let mut bare = TelemetryItem::synthesized_gauge("m", 1.0, BTreeMap::new());
            assert_eq!(cl.admit(&mut bare), Admission::Pass);
        }
        assert_eq!(cl.unique_keysets(), 1);
    }

    #[test]
    fn budget_shrink_applies_at_roll_only() {
        let (mut cl, _metrics) = limiter(4);
        cl.set_budget(2);
        assert_eq!(cl.budget(), 4);
        // force a roll by pretending the half-window elapsed
        cl.roll(Instant::now());
        assert_eq!(cl.budget(), 2);
    }

    #[test]
    fn window_roll_forgets_stale_fingerprints_after_two_halves() {
        let (mut cl, _metrics) = limiter(10);
        let mut item = item_with("old");
        let _ = cl.admit(&mut item);
        assert_eq!(cl.unique_keysets(), 1);
        cl.roll(Instant::now());
        // still within the window (previous half)
        assert_eq!(cl.unique_keysets(), 1);
        cl.roll(Instant::now());
        assert_eq!(cl.unique_keysets(), 0);
    }

    #[test]
    fn refresh_keeps_live_series_across_rolls() {
        let (mut cl, _metrics) = limiter(10);
        let mut item = item_with("live");
        let _ = cl.admit(&mut item);
        cl.roll(Instant::now());
        let mut again = item_with("live");
        assert_eq!(cl.admit(&mut again), Admission::Pass);
        // refreshed into the current half: survives the next roll
        cl.roll(Instant::now());
        assert_eq!(cl.unique_keysets(), 1);
    }

    #[test]
    fn l3_drops_instead_of_aggregating() {
        let (mut cl, metrics) = limiter(1);
        let mut a = item_with("a");
        let _ = cl.admit(&mut a);
        cl.set_drop_on_overflow(true);
        let mut b = item_with("b");
        assert_eq!(cl.admit(&mut b), Admission::Dropped);
        assert_eq!(metrics.cl_dropped_total.get(), 1);
        assert_eq!(metrics.cl_aggregated_total.get(), 0);
    }

    #[test]
    fn l4_drops_all_noncritical() {
        let (mut cl, metrics) = limiter(100);
        cl.set_drop_noncritical(true);
        let mut normal = item_with("a");
        assert_eq!(cl.admit(&mut normal), Admission::Dropped);
        let mut critical = item_with("b");
        critical.priority = Priority::Critical;
        assert_eq!(cl.admit(&mut critical), Admission::Pass);
        assert_eq!(metrics.cl_dropped_total.get(), 1);
    }

    #[test]
    fn loopbreak_items_bypass_the_budget() {
        let (mut cl, _metrics) = limiter(1);
        let mut a = item_with("a");
        let _ = cl.admit(&mut a);
        let mut attributes = BTreeMap::new();
        let _ = attributes.insert("nrdot.loopbreak".to_string(), "true".to_string());
        let _ = attributes.insert("series".to_string(), "x".to_string());
        let mut lb = TelemetryItem::synthesized_gauge("nrdot_apq_fill_ratio", 0.5, attributes);
        assert_eq!(cl.admit(&mut lb), Admission::Pass);
        assert_eq!(cl.unique_keysets(), 1);
    }
}
