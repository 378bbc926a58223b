// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! OTLP boundary for the NRDOT+ agent.
//!
//! Ingress: OTLP/gRPC (4317) and OTLP/HTTP (4318) receivers split export
//! requests into per-record items and push them through the pipeline's
//! admission entry. On policy refusal the servers answer with a
//! retryable error carrying a suggested delay derived from the current
//! degradation level.
//!
//! Egress: the [`sender::Sender`] drains the priority queue, composes
//! per-signal batches, transmits them gzip-compressed over OTLP/gRPC and
//! integrates with the dead-letter queue for spill and replay.

pub mod client;
pub mod error;
pub mod receiver;
pub mod sender;

pub use client::OtlpClients;
pub use error::ExportError;
pub use sender::{Sender, SenderTasks};
