// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Adaptive degradation manager.
//!
//! A 1 s control loop samples resource pressure (queue fill, RSS, DLQ
//! size, sender failure rate) and moves the pipeline through discrete
//! levels L0..L4. Entry requires a trigger to hold for `enter_seconds`;
//! exit requires the current level's triggers to stay clear for
//! `exit_seconds` (longer, to damp oscillation). At most one transition
//! happens per tick, and level actions are applied as absolute settings
//! so re-applying a level is idempotent.

use crate::apq::PriorityQueue;
use crate::cardinality::CardinalityLimiter;
use crate::control::{LevelCell, RateWindow, SenderControls};
use nrdot_config::{AdmConfig, LevelThresholds, SenderConfig};
use nrdot_dlq::DeadLetterStore;
use nrdot_pdata::Priority;
use nrdot_telemetry::Metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Discrete degradation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DegradationLevel {
    /// Normal operation.
    L0 = 0,
    /// Mild pressure: faster flushing, no data-loss changes.
    L1 = 1,
    /// Moderate: halved cardinality budget, low-priority spill becomes drop.
    L2 = 2,
    /// Severe: drop on cardinality overflow, reject low on arrival.
    L3 = 3,
    /// Emergency: reject normal on arrival, pause replay.
    L4 = 4,
}

impl DegradationLevel {
    /// Numeric form, 0..=4.
    #[must_use]
    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Clamped inverse of [`as_u8`](Self::as_u8).
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => DegradationLevel::L0,
            1 => DegradationLevel::L1,
            2 => DegradationLevel::L2,
            3 => DegradationLevel::L3,
            _ => DegradationLevel::L4,
        }
    }

    /// Stable label ("L0".."L4").
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::L0 => "L0",
            DegradationLevel::L1 => "L1",
            DegradationLevel::L2 => "L2",
            DegradationLevel::L3 => "L3",
            DegradationLevel::L4 => "L4",
        }
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pressure sample, all values as fractions of their caps.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sample {
    /// APQ byte fill ratio.
    pub fill_ratio: f64,
    /// Process RSS over the memory soft cap.
    pub rss: f64,
    /// DLQ size over its cap.
    pub dlq: f64,
    /// Sender failure rate over the last 60 s.
    pub fail_rate: f64,
}

/// Why the manager exited its run loop.
#[derive(Debug, PartialEq, Eq)]
pub enum RunExit {
    /// Cancellation was requested.
    Cancelled,
    /// Pinned at L4 beyond `degraded_panic_seconds`; the caller performs
    /// a controlled shutdown with spill.
    DegradedPanic,
}

/// The degradation control loop and its applied policy.
pub struct DegradationManager {
    cfg: AdmConfig,
    dlq_max_bytes: u64,
    apq: Arc<PriorityQueue>,
    cl: Arc<Mutex<CardinalityLimiter>>,
    dlq: Arc<DeadLetterStore>,
    controls: Arc<SenderControls>,
    fail_window: Arc<RateWindow>,
    level_cell: Arc<LevelCell>,
    metrics: Metrics,
    base_cl_budget: usize,
    base_backoff_max: Duration,
    base_batch_age: Duration,

    current: DegradationLevel,
    triggered_since: [Option<Instant>; 5],
    exit_clear_since: Option<Instant>,
    l4_since: Option<Instant>,
}

impl DegradationManager {
    /// Wires the manager to the components it steers.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        cfg: AdmConfig,
        sender_cfg: &SenderConfig,
        cl_budget: usize,
        dlq_max_bytes: u64,
        apq: Arc<PriorityQueue>,
        cl: Arc<Mutex<CardinalityLimiter>>,
        dlq: Arc<DeadLetterStore>,
        controls: Arc<SenderControls>,
        fail_window: Arc<RateWindow>,
        level_cell: Arc<LevelCell>,
        metrics: Metrics,
    ) -> Self {
        Self {
            cfg,
            dlq_max_bytes,
            apq,
            cl,
            dlq,
            controls,
            fail_window,
            level_cell,
            metrics,
            base_cl_budget: cl_budget,
            base_backoff_max: sender_cfg.backoff_max,
            base_batch_age: sender_cfg.batch_max_age,
            current: DegradationLevel::L0,
            triggered_since: [None; 5],
            exit_clear_since: None,
            l4_since: None,
        }
    }

    /// Runs the sampling loop until cancellation or a degraded panic.
    pub async fn run(mut self, cancel: CancellationToken) -> RunExit {
        let mut ticker = tokio::time::interval(self.cfg.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return RunExit::Cancelled,
                _ = ticker.tick() => {
                    let sample = self.collect();
                    if self.step(Instant::now(), sample) == RunExit::DegradedPanic {
                        return RunExit::DegradedPanic;
                    }
                }
            }
        }
    }

    fn collect(&self) -> Sample {
        let soft_cap_bytes = self.cfg.memory_soft_cap_mib * 1024 * 1024;
        let rss_bytes = memory_stats::memory_stats()
            .map(|s| s.physical_mem as u64)
            .unwrap_or(0);
        Sample {
            fill_ratio: self.apq.fill_ratio(),
            rss: rss_bytes as f64 / soft_cap_bytes as f64,
            dlq: self.dlq.total_bytes() as f64 / self.dlq_max_bytes as f64,
            fail_rate: self.fail_window.failure_rate(),
        }
    }

    fn thresholds(&self, level: DegradationLevel) -> &LevelThresholds {
        match level {
            DegradationLevel::L1 => &self.cfg.l1,
            DegradationLevel::L2 => &self.cfg.l2,
            DegradationLevel::L3 => &self.cfg.l3,
            _ => &self.cfg.l4,
        }
    }

    fn triggered(&self, level: DegradationLevel, sample: Sample) -> Option<&'static str> {
        let thresholds = self.thresholds(level);
        if thresholds.fill_ratio.is_some_and(|t| sample.fill_ratio >= t) {
            return Some("fill_ratio");
        }
        if thresholds.rss.is_some_and(|t| sample.rss >= t) {
            return Some("rss");
        }
        if thresholds.fail_rate.is_some_and(|t| sample.fail_rate >= t) {
            return Some("fail_rate");
        }
        if thresholds.dlq.is_some_and(|t| sample.dlq >= t) {
            return Some("dlq");
        }
        None
    }

    /// One control tick: updates hysteresis timers and performs at most
    /// one transition. Exposed for deterministic tests.
    pub fn step(&mut self, now: Instant, sample: Sample) -> RunExit {
        let enter_hold = Duration::from_secs(self.cfg.enter_seconds);
        let exit_hold = Duration::from_secs(self.cfg.exit_seconds);

        for level in [
            DegradationLevel::L1,
            DegradationLevel::L2,
            DegradationLevel::L3,
            DegradationLevel::L4,
        ] {
            let index = level.as_u8() as usize;
            if self.triggered(level, sample).is_some() {
                let _ = self.triggered_since[index].get_or_insert(now);
            } else {
                self.triggered_since[index] = None;
            }
        }

        // Upshift: the highest level whose trigger has held long enough.
        let target_up = [
            DegradationLevel::L4,
            DegradationLevel::L3,
            DegradationLevel::L2,
            DegradationLevel::L1,
        ]
        .into_iter()
        .find(|level| {
            *level > self.current
                && self.triggered_since[level.as_u8() as usize]
                    .is_some_and(|since| now.duration_since(since) >= enter_hold)
        });

        if let Some(target) = target_up {
            let next = DegradationLevel::from_u8(self.current.as_u8() + 1);
            let reason = self
                .triggered(target, sample)
                .or_else(|| self.triggered(next, sample))
                .unwrap_or("pressure");
            self.transition(next, reason);
            self.exit_clear_since = None;
        } else if self.current > DegradationLevel::L0 {
            // Downshift only when the current level's own triggers stay
            // clear for the (longer) exit hold.
            if self.triggered(self.current, sample).is_none() {
                let since = *self.exit_clear_since.get_or_insert(now);
                if now.duration_since(since) >= exit_hold {
                    let next = DegradationLevel::from_u8(self.current.as_u8() - 1);
                    self.transition(next, "recovered");
                    self.exit_clear_since = None;
                }
            } else {
                self.exit_clear_since = None;
            }
        }

        // L4 watchdog: pinned at emergency too long means the pipeline
        // cannot recover on its own.
        if self.current == DegradationLevel::L4 {
            let since = *self.l4_since.get_or_insert(now);
            if now.duration_since(since) >= Duration::from_secs(self.cfg.degraded_panic_seconds) {
                warn!(
                    seconds = self.cfg.degraded_panic_seconds,
                    "pinned at L4 beyond the panic budget; requesting controlled shutdown"
                );
                return RunExit::DegradedPanic;
            }
        } else {
            self.l4_since = None;
        }
        RunExit::Cancelled
    }

    fn transition(&mut self, to: DegradationLevel, reason: &'static str) {
        let from = self.current;
        self.current = to;
        self.apply_level(to);
        self.level_cell.store(to);
        self.metrics.adm_current_level.set(i64::from(to.as_u8()));
        self.metrics
            .adm_transitions_total
            .with_label_values(&[from.as_str(), to.as_str(), reason])
            .inc();
        // Entry timers restart after a transition so the next step also
        // has to earn its hold time.
        self.triggered_since = [None; 5];
        info!(from = %from, to = %to, reason, "degradation level transition");
    }

    /// Applies one level's policy to CL, APQ and the sender controls.
    /// Settings are absolute, so this is idempotent per level.
    fn apply_level(&self, level: DegradationLevel) {
        // APQ arrival policy.
        let floor = match level {
            DegradationLevel::L3 => Some(Priority::Normal),
            DegradationLevel::L4 => Some(Priority::Critical),
            _ => None,
        };
        self.apq.set_arrival_floor(floor);

        // Cardinality limiter policy.
        {
            let mut cl = self.cl.lock();
            let budget = if level >= DegradationLevel::L2 {
                (self.base_cl_budget / 2).max(1)
            } else {
                self.base_cl_budget
            };
            cl.set_budget(budget);
            cl.set_drop_on_overflow(level >= DegradationLevel::L3);
            cl.set_drop_noncritical(level >= DegradationLevel::L4);
        }

        // Sender controls.
        let batch_age = if level >= DegradationLevel::L1 {
            self.base_batch_age.mul_f64(0.75)
        } else {
            self.base_batch_age
        };
        self.controls
            .batch_max_age_ms
            .store(batch_age.as_millis() as u64, Ordering::Relaxed);
        let backoff_max = if level >= DegradationLevel::L3 {
            self.base_backoff_max * 2
        } else {
            self.base_backoff_max
        };
        self.controls
            .backoff_max_ms
            .store(backoff_max.as_millis() as u64, Ordering::Relaxed);
        self.controls
            .replay_paused
            .store(level >= DegradationLevel::L4, Ordering::Relaxed);
    }

    /// The current level (for tests and introspection).
    #[must_use]
    pub fn level(&self) -> DegradationLevel {
        self.current
    }
}
