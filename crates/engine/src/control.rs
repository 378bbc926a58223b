// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared control cells between the data-plane components.
//!
//! The degradation manager publishes its decisions through these cells;
//! the sender and admission path read them with plain atomic loads so no
//! component ever blocks on another's lock.

use crate::degradation::DegradationLevel;
use nrdot_config::SenderConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// The published degradation level, readable by every component.
#[derive(Debug)]
pub struct LevelCell(AtomicU8);

impl LevelCell {
    /// Starts at L0.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Current level.
    #[must_use]
    pub fn load(&self) -> DegradationLevel {
        DegradationLevel::from_u8(self.0.load(Ordering::Relaxed))
    }

    /// Publishes a new level. Only the degradation manager writes here.
    pub fn store(&self, level: DegradationLevel) {
        self.0.store(level.as_u8(), Ordering::Relaxed);
    }
}

impl Default for LevelCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Sender knobs the degradation manager adjusts per level.
///
/// All values are absolute (not deltas) so applying a level twice is
/// idempotent.
#[derive(Debug)]
pub struct SenderControls {
    /// Backoff ceiling, milliseconds.
    pub backoff_max_ms: AtomicU64,
    /// Batch age limit (flush interval), milliseconds.
    pub batch_max_age_ms: AtomicU64,
    /// True while replay from the DLQ is paused.
    pub replay_paused: AtomicBool,
}

impl SenderControls {
    /// Initializes from the configured defaults.
    #[must_use]
    pub fn new(cfg: &SenderConfig) -> Self {
        Self {
            backoff_max_ms: AtomicU64::new(cfg.backoff_max.as_millis() as u64),
            batch_max_age_ms: AtomicU64::new(cfg.batch_max_age.as_millis() as u64),
            replay_paused: AtomicBool::new(false),
        }
    }

    /// Current backoff ceiling.
    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.load(Ordering::Relaxed))
    }

    /// Current batch age limit.
    #[must_use]
    pub fn batch_max_age(&self) -> Duration {
        Duration::from_millis(self.batch_max_age_ms.load(Ordering::Relaxed))
    }

    /// Whether DLQ replay is paused.
    #[must_use]
    pub fn is_replay_paused(&self) -> bool {
        self.replay_paused.load(Ordering::Relaxed)
    }
}

const WINDOW_SLOTS: usize = 60;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    second: u64,
    ok: u64,
    fail: u64,
}

/// Sliding 60-second success/failure window, fed by the sender and read
/// by the degradation manager and the replay gate.
#[derive(Debug)]
pub struct RateWindow {
    started: Instant,
    slots: Mutex<[Slot; WINDOW_SLOTS]>,
}

impl RateWindow {
    /// Creates an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            slots: Mutex::new([Slot::default(); WINDOW_SLOTS]),
        }
    }

    fn slot_index(&self) -> (usize, u64) {
        let second = self.started.elapsed().as_secs();
        ((second as usize) % WINDOW_SLOTS, second)
    }

    fn record(&self, ok: bool) {
        let (index, second) = self.slot_index();
        let mut slots = self.slots.lock();
        let slot = &mut slots[index];
        if slot.second != second {
            *slot = Slot {
                second,
                ok: 0,
                fail: 0,
            };
        }
        if ok {
            slot.ok += 1;
        } else {
            slot.fail += 1;
        }
    }

    /// Records one successful export.
    pub fn record_ok(&self) {
        self.record(true);
    }

    /// Records one failed export attempt.
    pub fn record_fail(&self) {
        self.record(false);
    }

    fn totals(&self) -> (u64, u64) {
        let (_, now_second) = self.slot_index();
        let floor = now_second.saturating_sub(WINDOW_SLOTS as u64 - 1);
        let slots = self.slots.lock();
        let mut ok = 0;
        let mut fail = 0;
        for slot in slots.iter() {
            if slot.second >= floor && slot.second <= now_second {
                ok += slot.ok;
                fail += slot.fail;
            }
        }
        (ok, fail)
    }

    /// Failure fraction over the window; 0 when idle.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let (ok, fail) = self.totals();
        let total = ok + fail;
        if total == 0 {
            0.0
        } else {
            fail as f64 / total as f64
        }
    }

    /// Success fraction over the window; 1 when idle.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        1.0 - self.failure_rate()
    }
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding 60-second byte-rate window, used to throttle replay relative
/// to live throughput.
#[derive(Debug)]
pub struct ByteRate {
    started: Instant,
    slots: Mutex<[(u64, u64); WINDOW_SLOTS]>,
}

impl ByteRate {
    /// Creates an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            slots: Mutex::new([(0, 0); WINDOW_SLOTS]),
        }
    }

    /// Adds transmitted bytes at the current second.
    pub fn add(&self, bytes: u64) {
        let second = self.started.elapsed().as_secs();
        let index = (second as usize) % WINDOW_SLOTS;
        let mut slots = self.slots.lock();
        if slots[index].0 != second {
            slots[index] = (second, 0);
        }
        slots[index].1 += bytes;
    }

    /// Smoothed rate in bytes per second over the window.
    #[must_use]
    pub fn rate(&self) -> f64 {
        let now_second = self.started.elapsed().as_secs();
        let floor = now_second.saturating_sub(WINDOW_SLOTS as u64 - 1);
        let slots = self.slots.lock();
        let total: u64 = slots
            .iter()
            .filter(|(second, _)| *second >= floor && *second <= now_second)
            .map(|(_, bytes)| *bytes)
            .sum();
        let span = (now_second - floor + 1).max(1);
        total as f64 / span as f64
    }
}

impl Default for ByteRate {
    fn default() -> Self {
        Self::new()
    }
}

/// Liveness state consumed by the `/healthz` probe.
#[derive(Debug)]
pub struct HealthState {
    running: AtomicBool,
    last_delivery: Mutex<Option<Instant>>,
}

impl HealthState {
    /// Starts in the not-running state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            last_delivery: Mutex::new(None),
        }
    }

    /// Marks the orchestrator running (or stopped).
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    /// Records a delivery: an export ack or a durable spill.
    pub fn mark_delivery(&self) {
        *self.last_delivery.lock() = Some(Instant::now());
    }

    /// Healthy when running and at least one delivery happened within the
    /// window (or nothing was ever attempted yet and the process is young).
    #[must_use]
    pub fn is_healthy(&self, window: Duration) -> bool {
        if !self.running.load(Ordering::Relaxed) {
            return false;
        }
        self.last_delivery
            .lock()
            .is_some_and(|at| at.elapsed() <= window)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Test-only switch simulating a backend outage: while active, the
/// sender classifies every transport as a retryable failure without
/// touching the network.
#[derive(Debug)]
pub struct OutageSwitch {
    active: AtomicBool,
    until: Mutex<Option<Instant>>,
}

impl OutageSwitch {
    /// Starts inactive.
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            until: Mutex::new(None),
        }
    }

    /// Starts an outage, optionally self-expiring after `duration`.
    pub fn start(&self, duration: Option<Duration>) {
        *self.until.lock() = duration.map(|d| Instant::now() + d);
        self.active.store(true, Ordering::Relaxed);
    }

    /// Stops the outage.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
        *self.until.lock() = None;
    }

    /// Whether an outage is currently simulated.
    #[must_use]
    pub fn is_active(&self) -> bool {
        if !self.active.load(Ordering::Relaxed) {
            return false;
        }
        let mut until = self.until.lock();
        if let Some(deadline) = *until {
            if Instant::now() >= deadline {
                *until = None;
                self.active.store(false, Ordering::Relaxed);
                return false;
            }
        }
        true
    }
}

impl Default for OutageSwitch {
    fn default() -> Self {
        Self::new()
    }
}
