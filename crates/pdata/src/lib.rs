// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Pipeline data model for the NRDOT+ agent.
//!
//! A [`TelemetryItem`] is the unit that flows through admission, the
//! priority queue and the sender; a [`Batch`] is the unit of transmission
//! and of durable spill. Items are created by splitting OTLP export
//! requests into per-record items so that priority and fingerprinting are
//! well-defined for every record; batches are reassembled into export
//! requests at the egress boundary.

pub mod batch;
pub mod error;
pub mod fingerprint;
pub mod item;
pub mod split;

pub use batch::{Batch, ExportRequest, ReplayBatch, encode_request_payload};
pub use error::DecodeError;
pub use fingerprint::Fingerprinter;
pub use item::{ItemPayload, Priority, SignalKind, TelemetryItem};

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);
static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next per-process ingestion sequence number.
pub(crate) fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Allocates the next batch id.
pub(crate) fn next_batch_id() -> u64 {
    NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed)
}

/// Attribute marking items synthesized from the agent's own telemetry.
/// Receivers refuse to re-admit items carrying it.
pub const LOOPBREAK_KEY: &str = "nrdot.loopbreak";

/// Attribute that lets producers pin an explicit priority.
pub const PRIORITY_KEY: &str = "nrdot.priority";
