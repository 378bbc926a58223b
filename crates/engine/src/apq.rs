// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Adaptive priority queue.
//!
//! Bounded in bytes and items, strict priority with FIFO inside each
//! priority, and a starvation guard so lower priorities keep moving under
//! sustained high-priority load. Enqueue is non-blocking; dequeue is the
//! single consumer side and supports batched, deadline-bounded draining.

use nrdot_pdata::{Priority, TelemetryItem};
use nrdot_telemetry::Metrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Outcome of a non-blocking enqueue.
#[derive(Debug)]
pub enum Enqueue {
    /// The item was queued.
    Accepted,
    /// The queue was full; a lower-priority item was evicted to make room
    /// and must be routed to the DLQ (or dropped, per degradation level).
    Spilled {
        /// The evicted lower-priority item.
        evicted: TelemetryItem,
    },
    /// The queue was full and the new item does not outrank the queue's
    /// lowest occupant; route it to the DLQ (or drop, per level).
    RejectedFull(TelemetryItem),
    /// The degradation policy refuses this priority on arrival; drop it.
    RejectedPolicy(TelemetryItem),
    /// The queue is closed for shutdown; drop and count.
    RejectedShutdown(TelemetryItem),
}

struct Inner {
    /// One FIFO per priority, indexed by `Priority as usize`.
    queues: [VecDeque<TelemetryItem>; 3],
    bytes: u64,
    items: usize,
    /// Consecutive dequeues that skipped over a waiting lower priority.
    high_streak: u32,
    /// Lowest priority accepted on arrival, when degradation demands it.
    arrival_floor: Option<Priority>,
    closed: bool,
}

/// The bounded multi-priority queue between admission and the sender.
pub struct PriorityQueue {
    bytes_cap: u64,
    items_cap: usize,
    starvation_k: u32,
    metrics: Metrics,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl PriorityQueue {
    /// Creates a queue with the configured bounds.
    #[must_use]
    pub fn new(cfg: &nrdot_config::ApqConfig, metrics: Metrics) -> Self {
        Self {
            bytes_cap: cfg.bytes_cap,
            items_cap: cfg.items_cap,
            starvation_k: cfg.starvation_k,
            metrics,
            inner: Mutex::new(Inner {
                queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                bytes: 0,
                items: 0,
                high_streak: 0,
                arrival_floor: None,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Non-blocking enqueue. Never returns an error; every refusal hands
    /// the affected item back so the caller can spill or count it.
    pub fn enqueue(&self, item: TelemetryItem) -> Enqueue {
        let mut inner = self.inner.lock();
        if inner.closed {
            self.metrics
                .apq_dropped_total
                .with_label_values(&[item.priority.as_str(), "shutdown"])
                .inc();
            return Enqueue::RejectedShutdown(item);
        }
        if let Some(floor) = inner.arrival_floor {
            if item.priority < floor {
                self.metrics
                    .apq_dropped_total
                    .with_label_values(&[item.priority.as_str(), "adm_drop"])
                    .inc();
                return Enqueue::RejectedPolicy(item);
            }
        }

        if inner.items < self.items_cap && inner.bytes < self.bytes_cap {
            self.push(&mut inner, item);
            self.publish_gauges(&inner);
            drop(inner);
            self.notify.notify_one();
            return Enqueue::Accepted;
        }

        // Full: spill-lowest. Evict the head of the lowest non-empty
        // priority only if the new item outranks it.
        let lowest = Priority::HIGHEST_FIRST
            .iter()
            .rev()
            .copied()
            .find(|p| !inner.queues[*p as usize].is_empty());
        match lowest {
            Some(lowest) if item.priority > lowest => {
                let evicted = inner.queues[lowest as usize]
                    .pop_front()
                    .expect("non-empty by construction");
                inner.bytes -= evicted.encoded_size as u64;
                inner.items -= 1;
                self.push(&mut inner, item);
                self.publish_gauges(&inner);
                drop(inner);
                self.notify.notify_one();
                Enqueue::Spilled { evicted }
            }
            _ => {
                self.publish_gauges(&inner);
                Enqueue::RejectedFull(item)
            }
        }
    }

    fn push(&self, inner: &mut Inner, item: TelemetryItem) {
        self.metrics
            .apq_enqueued_total
            .with_label_values(&[item.priority.as_str()])
            .inc();
        inner.bytes += item.encoded_size as u64;
        inner.items += 1;
        inner.queues[item.priority as usize].push_back(item);
    }

    fn publish_gauges(&self, inner: &Inner) {
        self.metrics
            .apq_fill_ratio
            .set(inner.bytes as f64 / self.bytes_cap as f64);
        for priority in Priority::HIGHEST_FIRST {
            self.metrics
                .apq_depth
                .with_label_values(&[priority.as_str()])
                .set(inner.queues[priority as usize].len() as i64);
        }
    }

    /// Dequeues one item under the lock, honoring strict priority and the
    /// starvation guard.
    fn pop_one(&self, inner: &mut Inner) -> Option<TelemetryItem> {
        let top = Priority::HIGHEST_FIRST
            .into_iter()
            .find(|p| !inner.queues[*p as usize].is_empty())?;
        let waiting_lower = Priority::HIGHEST_FIRST
            .into_iter()
            .filter(|p| *p < top)
            .find(|p| !inner.queues[*p as usize].is_empty());

        let pick = match waiting_lower {
            Some(lower) if inner.high_streak >= self.starvation_k => {
                inner.high_streak = 0;
                lower
            }
            Some(_) => {
                inner.high_streak += 1;
                top
            }
            None => {
                inner.high_streak = 0;
                top
            }
        };
        let item = inner.queues[pick as usize].pop_front()?;
        inner.bytes -= item.encoded_size as u64;
        inner.items -= 1;
        Some(item)
    }

    /// Batched dequeue: gathers until `max_count`, `max_bytes` or
    /// `max_wait` is hit, or until cancellation. Returns whatever was
    /// gathered (possibly empty) as soon as any limit fires.
    pub async fn dequeue_batch(
        &self,
        max_count: usize,
        max_bytes: u64,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Vec<TelemetryItem> {
        let deadline = Instant::now() + max_wait;
        let mut out = Vec::new();
        let mut gathered_bytes: u64 = 0;

        loop {
            // Arm the notification before inspecting the queue so a
            // concurrent enqueue cannot slip between check and wait.
            let notified = self.notify.notified();
            let closed = {
                let mut inner = self.inner.lock();
                while out.len() < max_count && gathered_bytes < max_bytes {
                    match self.pop_one(&mut inner) {
                        Some(item) => {
                            gathered_bytes += item.encoded_size as u64;
                            out.push(item);
                        }
                        None => break,
                    }
                }
                self.publish_gauges(&inner);
                inner.closed
            };
            if out.len() >= max_count || gathered_bytes >= max_bytes || closed {
                return out;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return out,
            };
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return out,
                _ = cancel.cancelled() => return out,
            }
        }
    }

    /// Current accounted-bytes fill ratio.
    #[must_use]
    pub fn fill_ratio(&self) -> f64 {
        let inner = self.inner.lock();
        inner.bytes as f64 / self.bytes_cap as f64
    }

    /// Items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sets the arrival floor: items below it are rejected on arrival.
    pub fn set_arrival_floor(&self, floor: Option<Priority>) {
        self.inner.lock().arrival_floor = floor;
    }

    /// Closes the queue for shutdown: new items are refused and blocked
    /// dequeuers wake promptly.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Removes and returns everything still queued, in priority order.
    /// Used by the shutdown path to spill the remainder to the DLQ.
    #[must_use]
    pub fn drain_remaining(&self) -> Vec<TelemetryItem> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.items);
        while let Some(item) = self.pop_one(&mut inner) {
            out.push(item);
        }
        self.publish_gauges(&inner);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrdot_config::ApqConfig;
    use std::collections::BTreeMap;

    fn queue(bytes_cap: u64, items_cap: usize, k: u32) -> PriorityQueue {
        PriorityQueue::new(
            &ApqConfig {
                bytes_cap,
                items_cap,
                starvation_k: k,
            },
            Metrics::new(),
        )
    }

    fn item(priority: Priority) -> TelemetryItem {
        let mut item = TelemetryItem::synthesized_gauge("t", 1.0, BTreeMap::new());
        item.priority = priority;
        item
    }

    fn assert_accepted(outcome: Enqueue) {
        assert!(matches!(outcome, Enqueue::Accepted), "got {outcome:?}");
    }

    #[tokio::test]
    async fn strict_priority_and_fifo() {
        let q = queue(1 << 20, 100, 256);
        let normal_a = item(Priority::Normal);
        let normal_b = item(Priority::Normal);
        let critical = item(Priority::Critical);
        let (seq_a, seq_b, seq_c) = (normal_a.seq, normal_b.seq, critical.seq);
        assert_accepted(q.enqueue(normal_a));
        assert_accepted(q.enqueue(normal_b));
        assert_accepted(q.enqueue(critical));

        let cancel = CancellationToken::new();
        let got = q
            .dequeue_batch(3, u64::MAX, Duration::from_millis(10), &cancel)
            .await;
        assert_eq!(got.len(), 3);
        // critical first, then normals in ingestion order
        assert_eq!(got[0].seq, seq_c);
        assert_eq!(got[1].seq, seq_a);
        assert_eq!(got[2].seq, seq_b);
    }

    #[tokio::test]
    async fn spill_lowest_on_full() {
        let q = queue(1 << 20, 2, 256);
        let low = item(Priority::Low);
        let low_seq = low.seq;
        assert_accepted(q.enqueue(low));
        assert_accepted(q.enqueue(item(Priority::Normal)));

        // a critical arrival evicts the queued low item
        match q.enqueue(item(Priority::Critical)) {
            Enqueue::Spilled { evicted } => assert_eq!(evicted.seq, low_seq),
            other => panic!("expected spill, got {other:?}"),
        }
        // a low arrival into a full queue of higher-priority items is refused
        match q.enqueue(item(Priority::Low)) {
            Enqueue::RejectedFull(_) => {}
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn arrival_floor_rejects_by_policy() {
        let q = queue(1 << 20, 10, 256);
        q.set_arrival_floor(Some(Priority::Normal));
        assert!(matches!(
            q.enqueue(item(Priority::Low)),
            Enqueue::RejectedPolicy(_)
        ));
        assert_accepted(q.enqueue(item(Priority::Normal)));
    }

    #[tokio::test]
    async fn starvation_guard_lets_lower_priority_through() {
        let k = 4;
        let q = queue(1 << 24, 1000, k);
        let normal = item(Priority::Normal);
        let normal_seq = normal.seq;
        assert_accepted(q.enqueue(normal));
        for _ in 0..20 {
            assert_accepted(q.enqueue(item(Priority::Critical)));
        }

        let cancel = CancellationToken::new();
        let got = q
            .dequeue_batch(k as usize + 1, u64::MAX, Duration::from_millis(10), &cancel)
            .await;
        // after K criticals, the (K+1)-th dequeue must be the normal item
        assert_eq!(got.len(), k as usize + 1);
        assert!(got[..k as usize].iter().all(|i| i.priority == Priority::Critical));
        assert_eq!(got[k as usize].seq, normal_seq);
    }

    #[tokio::test]
    async fn byte_cap_is_respected_within_one_item() {
        let probe = item(Priority::Normal);
        let item_size = probe.encoded_size as u64;
        let q = queue(item_size * 3, 1000, 256);
        assert_accepted(q.enqueue(probe));
        assert_accepted(q.enqueue(item(Priority::Normal)));
        assert_accepted(q.enqueue(item(Priority::Normal)));
        // bytes == cap now; the next enqueue sees a full queue
        assert!(matches!(
            q.enqueue(item(Priority::Normal)),
            Enqueue::RejectedFull(_)
        ));
        assert!(q.fill_ratio() >= 1.0 - 1e-9);
    }

    #[tokio::test]
    async fn dequeue_returns_on_cancellation() {
        let q = queue(1 << 20, 10, 256);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let got = q
            .dequeue_batch(10, u64::MAX, Duration::from_secs(60), &cancel)
            .await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn close_wakes_blocked_dequeuer() {
        let q = std::sync::Arc::new(queue(1 << 20, 10, 256));
        let q2 = q.clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move {
            q2.dequeue_batch(10, u64::MAX, Duration::from_secs(60), &CancellationToken::new())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dequeuer must wake")
            .expect("join");
        assert!(got.is_empty());
        drop(cancel);
    }

    #[tokio::test]
    async fn drain_remaining_empties_queue() {
        let q = queue(1 << 20, 10, 256);
        assert_accepted(q.enqueue(item(Priority::Low)));
        assert_accepted(q.enqueue(item(Priority::Critical)));
        let drained = q.drain_remaining();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].priority, Priority::Critical);
        assert!(q.is_empty());
    }
}
