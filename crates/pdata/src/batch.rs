// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Batches: the unit of transmission and of durable spill.

use crate::error::DecodeError;
use crate::item::{ItemPayload, Priority, SignalKind, TelemetryItem};
use crate::next_batch_id;
use bytes::{Buf, BufMut};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use std::time::Instant;

/// Version tag of the framed batch payload written to the DLQ.
const FRAMING_VERSION: u8 = 1;

/// An ordered sequence of items of one signal kind, bounded by
/// (count, bytes, age) at the sender.
#[derive(Debug)]
pub struct Batch {
    /// Batch id, unique per process.
    pub id: u64,
    /// Signal kind shared by every member.
    pub kind: SignalKind,
    /// The member items, in ingestion order.
    pub items: Vec<TelemetryItem>,
    /// Sum of member encoded sizes.
    pub bytes: u64,
    /// Transmission attempts so far.
    pub attempts: u32,
    /// When the batch was opened.
    pub opened_at: Instant,
}

impl Batch {
    /// Opens an empty batch for the given signal kind.
    #[must_use]
    pub fn new(kind: SignalKind) -> Self {
        Self {
            id: next_batch_id(),
            kind,
            items: Vec::new(),
            bytes: 0,
            attempts: 0,
            opened_at: Instant::now(),
        }
    }

    /// Appends an item. The caller guarantees matching signal kind.
    pub fn push(&mut self, item: TelemetryItem) {
        debug_assert_eq!(item.kind, self.kind);
        self.bytes += item.encoded_size as u64;
        self.items.push(item);
    }

    /// Number of member items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the batch holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Batch priority: the maximum priority among member items.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.items
            .iter()
            .map(|i| i.priority)
            .max()
            .unwrap_or(Priority::Normal)
    }

    /// Age of the batch since it was opened.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }

    /// Reassembles the batch into an OTLP export request, consuming it.
    #[must_use]
    pub fn into_export_request(self) -> ExportRequest {
        payloads_into_request(self.kind, self.items.into_iter().map(|i| i.payload))
    }

    /// Encodes the batch into the framed payload stored in the DLQ.
    ///
    /// Layout: `[version u8][kind u8][count u32][count x (len u32, protobuf)]`,
    /// all integers little-endian.
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes as usize + 6 + self.items.len() * 4);
        out.put_u8(FRAMING_VERSION);
        out.put_u8(self.kind.wire_tag());
        out.put_u32_le(self.items.len() as u32);
        for item in &self.items {
            let encoded = item.payload.encode_to_vec();
            out.put_u32_le(encoded.len() as u32);
            out.put_slice(&encoded);
        }
        out
    }
}

/// A batch decoded back from its framed DLQ payload, ready for replay.
#[derive(Debug)]
pub struct ReplayBatch {
    /// Signal kind shared by every member.
    pub kind: SignalKind,
    /// Decoded member payloads, in stored order.
    pub payloads: Vec<ItemPayload>,
    /// Sum of encoded payload sizes, the replay throughput accounting basis.
    pub bytes: u64,
}

impl ReplayBatch {
    /// Decodes a framed DLQ payload.
    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.remaining() < 6 {
            return Err(DecodeError::Truncated {
                needed: 6 - buf.remaining(),
            });
        }
        let version = buf.get_u8();
        if version != FRAMING_VERSION {
            return Err(DecodeError::UnsupportedFraming {
                details: format!("unknown version {version}"),
            });
        }
        let kind_tag = buf.get_u8();
        let kind = SignalKind::from_wire_tag(kind_tag).ok_or_else(|| {
            DecodeError::UnsupportedFraming {
                details: format!("unknown signal kind tag {kind_tag}"),
            }
        })?;
        let count = buf.get_u32_le() as usize;
        let mut payloads = Vec::with_capacity(count);
        let mut bytes = 0u64;
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(DecodeError::Truncated {
                    needed: 4 - buf.remaining(),
                });
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(DecodeError::Truncated {
                    needed: len - buf.remaining(),
                });
            }
            let payload = ItemPayload::decode(kind, &buf[..len])?;
            buf.advance(len);
            bytes += len as u64;
            payloads.push(payload);
        }
        Ok(Self {
            kind,
            payloads,
            bytes,
        })
    }

    /// Number of member payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// True when the batch holds no payloads.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Reassembles the replay batch into an OTLP export request.
    #[must_use]
    pub fn into_export_request(self) -> ExportRequest {
        payloads_into_request(self.kind, self.payloads.into_iter())
    }
}

/// Encodes an assembled export request into the same framed payload
/// [`Batch::encode_payload`] produces, for spilling a batch whose items
/// have already been consumed into the request.
#[must_use]
pub fn encode_request_payload(request: &ExportRequest) -> Vec<u8> {
    fn frame<M: prost::Message>(kind: SignalKind, members: &[M]) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(FRAMING_VERSION);
        out.put_u8(kind.wire_tag());
        out.put_u32_le(members.len() as u32);
        for member in members {
            let encoded = member.encode_to_vec();
            out.put_u32_le(encoded.len() as u32);
            out.put_slice(&encoded);
        }
        out
    }
    match request {
        ExportRequest::Metrics(req) => frame(SignalKind::Metric, &req.resource_metrics),
        ExportRequest::Traces(req) => frame(SignalKind::Span, &req.resource_spans),
        ExportRequest::Logs(req) => frame(SignalKind::Log, &req.resource_logs),
    }
}

/// An OTLP export request of one of the three signal kinds.
#[derive(Debug, Clone)]
pub enum ExportRequest {
    /// A metrics export request.
    Metrics(ExportMetricsServiceRequest),
    /// A trace export request.
    Traces(ExportTraceServiceRequest),
    /// A logs export request.
    Logs(ExportLogsServiceRequest),
}

fn payloads_into_request<I>(kind: SignalKind, payloads: I) -> ExportRequest
where
    I: Iterator<Item = ItemPayload>,
{
    match kind {
        SignalKind::Metric => {
            let resource_metrics = payloads
                .filter_map(|p| match p {
                    ItemPayload::Metrics(rm) => Some(rm),
                    _ => None,
                })
                .collect();
            ExportRequest::Metrics(ExportMetricsServiceRequest { resource_metrics })
        }
        SignalKind::Span => {
            let resource_spans = payloads
                .filter_map(|p| match p {
                    ItemPayload::Spans(rs) => Some(rs),
                    _ => None,
                })
                .collect();
            ExportRequest::Traces(ExportTraceServiceRequest { resource_spans })
        }
        SignalKind::Log => {
            let resource_logs = payloads
                .filter_map(|p| match p {
                    ItemPayload::Logs(rl) => Some(rl),
                    _ => None,
                })
                .collect();
            ExportRequest::Logs(ExportLogsServiceRequest { resource_logs })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn gauge_item(name: &str) -> TelemetryItem {
        TelemetryItem::synthesized_gauge(name, 1.0, BTreeMap::new())
    }

    #[test]
    fn priority_is_max_of_members() {
        let mut batch = Batch::new(SignalKind::Metric);
        let mut low = gauge_item("a");
        low.priority = Priority::Low;
        let mut critical = gauge_item("b");
        critical.priority = Priority::Critical;
        batch.push(low);
        batch.push(critical);
        assert_eq!(batch.priority(), Priority::Critical);
    }

    #[test]
    fn framing_roundtrip() {
        let mut batch = Batch::new(SignalKind::Metric);
        batch.push(gauge_item("one"));
        batch.push(gauge_item("two"));
        let payload = batch.encode_payload();

        let replay = ReplayBatch::decode(&payload).expect("decode");
        assert_eq!(replay.kind, SignalKind::Metric);
        assert_eq!(replay.len(), 2);
        match replay.into_export_request() {
            ExportRequest::Metrics(req) => {
                assert_eq!(req.resource_metrics.len(), 2);
                assert_eq!(
                    req.resource_metrics[0].scope_metrics[0].metrics[0].name,
                    "one"
                );
                assert_eq!(
                    req.resource_metrics[1].scope_metrics[0].metrics[0].name,
                    "two"
                );
            }
            other => panic!("expected metrics request, got {other:?}"),
        }
    }

    #[test]
    fn request_payload_matches_batch_payload() {
        let mut batch = Batch::new(SignalKind::Metric);
        batch.push(gauge_item("one"));
        batch.push(gauge_item("two"));
        let direct = batch.encode_payload();
        let via_request = encode_request_payload(&batch.into_export_request());
        assert_eq!(direct, via_request);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut batch = Batch::new(SignalKind::Metric);
        batch.push(gauge_item("one"));
        let payload = batch.encode_payload();
        let err = ReplayBatch::decode(&payload[..payload.len() - 3]).expect_err("must fail");
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut payload = Batch::new(SignalKind::Log).encode_payload();
        payload[1] = 9;
        let err = ReplayBatch::decode(&payload).expect_err("must fail");
        assert!(matches!(err, DecodeError::UnsupportedFraming { .. }));
    }
}
