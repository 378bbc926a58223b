// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Durable dead-letter queue.
//!
//! Batches that cannot be transmitted (sender retry exhaustion, queue
//! spill) are appended to an on-disk ring of immutable segment files and
//! replayed once the backend recovers.
//!
//! # On-disk layout
//!
//! A single directory holds numbered segment files (`0000000017.seg`) and
//! a JSON manifest. Within a segment, records are framed as
//! `{u32 len, u8 kind, payload[len], u32 crc32}`; a sealed segment ends
//! with a footer record carrying the record count and an overall crc.
//! Segments are immutable once sealed; at most one segment is active.
//!
//! # Guarantees
//!
//! - Replay preserves append order across and within segments.
//! - Total disk use stays within `dlq.max_bytes + segment_max_bytes`;
//!   beyond the cap the oldest sealed segment is discarded whole. The
//!   active segment is never discarded while it is being written.
//! - On startup, a trailing partial record is truncated and records
//!   failing crc are skipped and counted; earlier records are never lost.
//! - A record is re-deliverable until its ack (or poison mark) is
//!   recorded; the replay cursor only advances over contiguous outcomes.

pub mod error;
pub mod record;
pub mod store;

pub use error::Error;
pub use store::{BatchRef, DeadLetterStore};
