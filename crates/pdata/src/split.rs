// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Splits OTLP export requests into per-record telemetry items.
//!
//! Each innermost record (metric, span, log record) becomes one item
//! carrying its resource and scope context, so every record gets its own
//! priority and fingerprint. The inverse operation lives in
//! [`crate::batch`].

use crate::item::{ItemPayload, TelemetryItem, any_value_to_string};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::KeyValue;
use opentelemetry_proto::tonic::logs::v1::{ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::metrics::v1::metric::Data;
use opentelemetry_proto::tonic::metrics::v1::{Metric, ResourceMetrics, ScopeMetrics};
use opentelemetry_proto::tonic::trace::v1::status::StatusCode;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans};
use std::collections::BTreeMap;

fn flatten_into(attributes: &mut BTreeMap<String, String>, kvs: &[KeyValue]) {
    for kv in kvs {
        let value = kv
            .value
            .as_ref()
            .map(any_value_to_string)
            .unwrap_or_default();
        let _ = attributes.insert(kv.key.clone(), value);
    }
}

/// First data point attributes and event time of a metric, per data shape.
fn metric_point_info(metric: &Metric) -> (Option<&[KeyValue]>, u64) {
    match &metric.data {
        Some(Data::Gauge(g)) => g
            .data_points
            .first()
            .map(|p| (Some(p.attributes.as_slice()), p.time_unix_nano))
            .unwrap_or((None, 0)),
        Some(Data::Sum(s)) => s
            .data_points
            .first()
            .map(|p| (Some(p.attributes.as_slice()), p.time_unix_nano))
            .unwrap_or((None, 0)),
        Some(Data::Histogram(h)) => h
            .data_points
            .first()
            .map(|p| (Some(p.attributes.as_slice()), p.time_unix_nano))
            .unwrap_or((None, 0)),
        Some(Data::ExponentialHistogram(h)) => h
            .data_points
            .first()
            .map(|p| (Some(p.attributes.as_slice()), p.time_unix_nano))
            .unwrap_or((None, 0)),
        Some(Data::Summary(s)) => s
            .data_points
            .first()
            .map(|p| (Some(p.attributes.as_slice()), p.time_unix_nano))
            .unwrap_or((None, 0)),
        None => (None, 0),
    }
}

/// Splits a metrics export request into one item per metric.
#[must_use]
pub fn split_metrics(request: ExportMetricsServiceRequest) -> Vec<TelemetryItem> {
    let mut items = Vec::new();
    for rm in request.resource_metrics {
        let mut resource_attrs = BTreeMap::new();
        if let Some(resource) = &rm.resource {
            flatten_into(&mut resource_attrs, &resource.attributes);
        }
        for sm in rm.scope_metrics {
            for metric in sm.metrics {
                let mut attributes = resource_attrs.clone();
                let (point_attrs, event_time) = metric_point_info(&metric);
                if let Some(point_attrs) = point_attrs {
                    flatten_into(&mut attributes, point_attrs);
                }
                let _ = attributes.insert("metric.name".to_string(), metric.name.clone());
                let payload = ItemPayload::Metrics(ResourceMetrics {
                    resource: rm.resource.clone(),
                    scope_metrics: vec![ScopeMetrics {
                        scope: sm.scope.clone(),
                        metrics: vec![metric],
                        schema_url: sm.schema_url.clone(),
                    }],
                    schema_url: rm.schema_url.clone(),
                });
                items.push(TelemetryItem::new(payload, attributes, event_time));
            }
        }
    }
    items
}

/// Splits a trace export request into one item per span.
#[must_use]
pub fn split_traces(request: ExportTraceServiceRequest) -> Vec<TelemetryItem> {
    let mut items = Vec::new();
    for rs in request.resource_spans {
        let mut resource_attrs = BTreeMap::new();
        if let Some(resource) = &rs.resource {
            flatten_into(&mut resource_attrs, &resource.attributes);
        }
        for ss in rs.scope_spans {
            for span in ss.spans {
                let mut attributes = resource_attrs.clone();
                flatten_into(&mut attributes, &span.attributes);
                let _ = attributes.insert("span.name".to_string(), span.name.clone());
                let status = match span.status.as_ref().map(|s| s.code()) {
                    Some(StatusCode::Error) => "ERROR",
                    Some(StatusCode::Ok) => "OK",
                    _ => "UNSET",
                };
                let _ = attributes.insert("status".to_string(), status.to_string());
                let event_time = span.start_time_unix_nano;
                let payload = ItemPayload::Spans(ResourceSpans {
                    resource: rs.resource.clone(),
                    scope_spans: vec![ScopeSpans {
                        scope: ss.scope.clone(),
                        spans: vec![span],
                        schema_url: ss.schema_url.clone(),
                    }],
                    schema_url: rs.schema_url.clone(),
                });
                items.push(TelemetryItem::new(payload, attributes, event_time));
            }
        }
    }
    items
}

/// Maps an OTLP severity number to its text class.
fn severity_class(severity_number: i32) -> Option<&'static str> {
    match severity_number {
        1..=4 => Some("TRACE"),
        5..=8 => Some("DEBUG"),
        9..=12 => Some("INFO"),
        13..=16 => Some("WARN"),
        17..=20 => Some("ERROR"),
        21..=24 => Some("FATAL"),
        _ => None,
    }
}

/// Splits a logs export request into one item per log record.
#[must_use]
pub fn split_logs(request: ExportLogsServiceRequest) -> Vec<TelemetryItem> {
    let mut items = Vec::new();
    for rl in request.resource_logs {
        let mut resource_attrs = BTreeMap::new();
        if let Some(resource) = &rl.resource {
            flatten_into(&mut resource_attrs, &resource.attributes);
        }
        for sl in rl.scope_logs {
            for record in sl.log_records {
                let mut attributes = resource_attrs.clone();
                flatten_into(&mut attributes, &record.attributes);
                let severity = if record.severity_text.is_empty() {
                    severity_class(record.severity_number).map(str::to_string)
                } else {
                    Some(record.severity_text.clone())
                };
                if let Some(severity) = severity {
                    let _ = attributes.insert("severity".to_string(), severity);
                }
                let event_time = if record.time_unix_nano != 0 {
                    record.time_unix_nano
                } else {
                    record.observed_time_unix_nano
                };
                let payload = ItemPayload::Logs(ResourceLogs {
                    resource: rl.resource.clone(),
                    scope_logs: vec![ScopeLogs {
                        scope: sl.scope.clone(),
                        log_records: vec![record],
                        schema_url: sl.schema_url.clone(),
                    }],
                    schema_url: rl.schema_url.clone(),
                });
                items.push(TelemetryItem::new(payload, attributes, event_time));
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Priority, SignalKind};
    use opentelemetry_proto::tonic::common::v1::{AnyValue, any_value};
    use opentelemetry_proto::tonic::logs::v1::LogRecord;
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use opentelemetry_proto::tonic::trace::v1::{Span, Status};

    fn kv(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.to_string())),
            }),
        }
    }

    fn resource(pairs: &[(&str, &str)]) -> Option<Resource> {
        Some(Resource {
            attributes: pairs.iter().map(|(k, v)| kv(k, v)).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn spans_split_per_record_with_status() {
        let request = ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: resource(&[("service.name", "api")]),
                scope_spans: vec![ScopeSpans {
                    spans: vec![
                        Span {
                            name: "ok-span".to_string(),
                            ..Default::default()
                        },
                        Span {
                            name: "bad-span".to_string(),
                            status: Some(Status {
                                code: StatusCode::Error as i32,
                                message: "boom".to_string(),
                            }),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                schema_url: String::new(),
            }],
        };
        let items = split_traces(request);
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.kind == SignalKind::Span));
        assert_eq!(items[0].priority, Priority::Normal);
        assert_eq!(items[1].priority, Priority::Critical);
        assert_eq!(
            items[1].attributes.get("service.name").map(String::as_str),
            Some("api")
        );
        assert!(items[1].seq > items[0].seq);
    }

    #[test]
    fn logs_severity_falls_back_to_number() {
        let request = ExportLogsServiceRequest {
            resource_logs: vec![ResourceLogs {
                resource: resource(&[]),
                scope_logs: vec![ScopeLogs {
                    log_records: vec![LogRecord {
                        severity_number: 5, // DEBUG
                        time_unix_nano: 7,
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                schema_url: String::new(),
            }],
        };
        let items = split_logs(request);
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].attributes.get("severity").map(String::as_str),
            Some("DEBUG")
        );
        assert_eq!(items[0].priority, Priority::Low);
        assert_eq!(items[0].event_time_unix_nano, 7);
    }

    #[test]
    fn metrics_carry_point_attributes() {
        use opentelemetry_proto::tonic::metrics::v1::{Gauge, Metric, NumberDataPoint};
        let request = ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: resource(&[("host", "a")]),
                scope_metrics: vec![ScopeMetrics {
                    metrics: vec![Metric {
                        name: "requests".to_string(),
                        data: Some(Data::Gauge(Gauge {
                            data_points: vec![NumberDataPoint {
                                attributes: vec![kv("route", "/v1")],
                                time_unix_nano: 99,
                                ..Default::default()
                            }],
                        })),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                schema_url: String::new(),
            }],
        };
        let items = split_metrics(request);
        assert_eq!(items.len(), 1);
        let attributes = &items[0].attributes;
        assert_eq!(attributes.get("host").map(String::as_str), Some("a"));
        assert_eq!(attributes.get("route").map(String::as_str), Some("/v1"));
        assert_eq!(
            attributes.get("metric.name").map(String::as_str),
            Some("requests")
        );
        assert_eq!(items[0].event_time_unix_nano, 99);
        assert!(items[0].encoded_size > 0);
    }
}
