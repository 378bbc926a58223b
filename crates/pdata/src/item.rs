// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! The telemetry item: the unit flowing through the pipeline.

use crate::{PRIORITY_KEY, next_seq};
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};
use opentelemetry_proto::tonic::logs::v1::ResourceLogs;
use opentelemetry_proto::tonic::metrics::v1::metric::Data;
use opentelemetry_proto::tonic::metrics::v1::{
    Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics, number_data_point,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use prost::Message;
use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// The kind of signal an item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// A metric record.
    Metric,
    /// A trace span.
    Span,
    /// A log record.
    Log,
}

impl SignalKind {
    /// Stable label used in metric series and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Metric => "metric",
            SignalKind::Span => "trace_span",
            SignalKind::Log => "log_record",
        }
    }

    /// Wire tag used by the DLQ batch framing.
    #[must_use]
    pub const fn wire_tag(&self) -> u8 {
        match self {
            SignalKind::Metric => 1,
            SignalKind::Span => 2,
            SignalKind::Log => 3,
        }
    }

    /// Inverse of [`wire_tag`](Self::wire_tag).
    #[must_use]
    pub const fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(SignalKind::Metric),
            2 => Some(SignalKind::Span),
            3 => Some(SignalKind::Log),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item priority. Ordering is significant: higher sorts later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Best-effort data, first to be shed.
    Low = 0,
    /// The default class.
    Normal = 1,
    /// Error-grade data that survives degradation the longest.
    Critical = 2,
}

impl Priority {
    /// Stable label used in metric series.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Critical => "critical",
        }
    }

    /// All priorities, highest first (dequeue order).
    pub const HIGHEST_FIRST: [Priority; 3] = [Priority::Critical, Priority::Normal, Priority::Low];
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded OTLP payload of one item: a single record wrapped in its
/// resource and scope context so the item can be re-exported standalone.
#[derive(Debug, Clone)]
pub enum ItemPayload {
    /// One metric with its resource/scope context.
    Metrics(ResourceMetrics),
    /// One span with its resource/scope context.
    Spans(ResourceSpans),
    /// One log record with its resource/scope context.
    Logs(ResourceLogs),
}

impl ItemPayload {
    /// The signal kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        match self {
            ItemPayload::Metrics(_) => SignalKind::Metric,
            ItemPayload::Spans(_) => SignalKind::Span,
            ItemPayload::Logs(_) => SignalKind::Log,
        }
    }

    /// Encoded protobuf size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            ItemPayload::Metrics(m) => m.encoded_len(),
            ItemPayload::Spans(s) => s.encoded_len(),
            ItemPayload::Logs(l) => l.encoded_len(),
        }
    }

    /// Encodes the payload to protobuf bytes.
    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        match self {
            ItemPayload::Metrics(m) => m.encode_to_vec(),
            ItemPayload::Spans(s) => s.encode_to_vec(),
            ItemPayload::Logs(l) => l.encode_to_vec(),
        }
    }

    /// Decodes a payload of the given kind from protobuf bytes.
    pub fn decode(kind: SignalKind, bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Ok(match kind {
            SignalKind::Metric => ItemPayload::Metrics(ResourceMetrics::decode(bytes)?),
            SignalKind::Span => ItemPayload::Spans(ResourceSpans::decode(bytes)?),
            SignalKind::Log => ItemPayload::Logs(ResourceLogs::decode(bytes)?),
        })
    }
}

/// The unit flowing through the pipeline.
///
/// Priority and fingerprint are assigned once at admission and never
/// mutated downstream; the encoded size computed here is the accounting
/// basis for queue and DLQ budgets.
#[derive(Debug, Clone)]
pub struct TelemetryItem {
    /// Signal kind.
    pub kind: SignalKind,
    /// Monotonic receive time.
    pub received_at: Instant,
    /// Event time from the record, unix nanoseconds (0 if absent).
    pub event_time_unix_nano: u64,
    /// Flattened identifying attributes (resource + record level),
    /// deterministically ordered.
    pub attributes: BTreeMap<String, String>,
    /// The decoded OTLP payload.
    pub payload: ItemPayload,
    /// Priority derived from attributes and signal kind at admission.
    pub priority: Priority,
    /// Key-set fingerprint, assigned by the cardinality limiter at
    /// admission (zero until then).
    pub fingerprint: u64,
    /// Approximate encoded size in bytes, computed at admission.
    pub encoded_size: usize,
    /// Per-process monotonic ingestion sequence number.
    pub seq: u64,
}

impl TelemetryItem {
    /// Builds an item from a payload and its flattened attributes.
    /// Priority, encoded size and sequence number are assigned here.
    #[must_use]
    pub fn new(
        payload: ItemPayload,
        attributes: BTreeMap<String, String>,
        event_time_unix_nano: u64,
    ) -> Self {
        let kind = payload.kind();
        let priority = derive_priority(kind, &attributes);
        let encoded_size = payload.encoded_len();
        Self {
            kind,
            received_at: Instant::now(),
            event_time_unix_nano,
            attributes,
            payload,
            priority,
            fingerprint: 0,
            encoded_size,
            seq: next_seq(),
        }
    }

    /// Builds a synthesized gauge metric item, used for cardinality
    /// overflow aggregates and the loop-break republisher.
    #[must_use]
    pub fn synthesized_gauge(
        name: &str,
        value: f64,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let point_attributes: Vec<KeyValue> = attributes
            .iter()
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: Some(AnyValue {
                    value: Some(any_value::Value::StringValue(v.clone())),
                }),
            })
            .collect();
        let metric = Metric {
            name: name.to_string(),
            data: Some(Data::Gauge(Gauge {
                data_points: vec![NumberDataPoint {
                    attributes: point_attributes,
                    time_unix_nano: now_nanos,
                    value: Some(number_data_point::Value::AsDouble(value)),
                    ..Default::default()
                }],
            })),
            ..Default::default()
        };
        let payload = ItemPayload::Metrics(ResourceMetrics {
            resource: Some(Resource::default()),
            scope_metrics: vec![ScopeMetrics {
                metrics: vec![metric],
                ..Default::default()
            }],
            schema_url: String::new(),
        });
        Self::new(payload, attributes, now_nanos)
    }

    /// True when the item was synthesized from the agent's own telemetry.
    #[must_use]
    pub fn is_loopbreak(&self) -> bool {
        self.attributes
            .get(crate::LOOPBREAK_KEY)
            .is_some_and(|v| v == "true")
    }
}

/// Derives the item priority from its attributes and signal kind.
///
/// Rules, in order: explicit `nrdot.priority` pin wins; error-grade
/// severity or span status makes an item critical; debug-grade logs are
/// low; everything else is normal.
#[must_use]
pub fn derive_priority(kind: SignalKind, attributes: &BTreeMap<String, String>) -> Priority {
    match attributes.get(PRIORITY_KEY).map(String::as_str) {
        Some("critical") => return Priority::Critical,
        Some("low") => return Priority::Low,
        _ => {}
    }
    if let Some(severity) = attributes.get("severity") {
        let upper = severity.to_ascii_uppercase();
        if upper.starts_with("ERROR") || upper.starts_with("FATAL") {
            return Priority::Critical;
        }
        if kind == SignalKind::Log && (upper.starts_with("DEBUG") || upper.starts_with("TRACE")) {
            return Priority::Low;
        }
    }
    if kind == SignalKind::Span && attributes.get("status").map(String::as_str) == Some("ERROR") {
        return Priority::Critical;
    }
    Priority::Normal
}

/// Canonicalizes an OTLP `AnyValue` into the string form used for
/// attribute maps and fingerprinting.
#[must_use]
pub fn any_value_to_string(value: &AnyValue) -> String {
    match &value.value {
        Some(any_value::Value::StringValue(s)) => s.clone(),
        Some(any_value::Value::BoolValue(b)) => b.to_string(),
        Some(any_value::Value::IntValue(i)) => i.to_string(),
        Some(any_value::Value::DoubleValue(d)) => d.to_string(),
        Some(any_value::Value::ArrayValue(array)) => {
            let parts: Vec<String> = array.values.iter().map(any_value_to_string).collect();
            format!("[{}]", parts.join(","))
        }
        Some(any_value::Value::KvlistValue(kvs)) => {
            let parts: Vec<String> = kvs
                .values
                .iter()
                .map(|kv| {
                    let v = kv
                        .value
                        .as_ref()
                        .map(any_value_to_string)
                        .unwrap_or_default();
                    format!("{}={}", kv.key, v)
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Some(any_value::Value::BytesValue(bytes)) => format!("bytes:{}", bytes.len()),
        None => String::new(),
    }
}
