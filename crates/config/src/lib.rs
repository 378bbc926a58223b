// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the NRDOT+ agent.
//!
//! Configuration is loaded from an optional YAML file, then overlaid with
//! `NRDOT_*` environment variables, then validated. Every load produces an
//! effective-config fingerprint that is logged at startup/shutdown and
//! exposed as a self-metric, so operators can tell two running
//! configurations apart.

pub mod byte_units;
pub mod error;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

pub use error::Error;

/// Prefix for all environment overrides.
pub const ENV_PREFIX: &str = "NRDOT_";

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentConfig {
    /// Egress destination.
    pub otlp: OtlpConfig,
    /// Ingress listeners.
    pub receivers: ReceiverConfig,
    /// Adaptive priority queue bounds and fairness.
    pub apq: ApqConfig,
    /// Cardinality limiter budget and windowing.
    pub cl: CardinalityConfig,
    /// Dead-letter queue durability settings.
    pub dlq: DlqConfig,
    /// Sender batching, retry and replay settings.
    pub sender: SenderConfig,
    /// Adaptive degradation manager thresholds.
    pub adm: AdmConfig,
    /// Self-telemetry surface.
    #[serde(rename = "self")]
    pub self_telemetry: SelfConfig,
    /// Process runtime knobs.
    pub runtime: RuntimeConfig,
}

/// Egress (OTLP exporter) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OtlpConfig {
    /// Destination endpoint, e.g. `http://collector:4317`.
    pub endpoint: String,
    /// Headers attached to every export request (bearer token, api key).
    pub headers: BTreeMap<String, String>,
    /// Per-request deadline.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

/// Ingress (OTLP receiver) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReceiverConfig {
    /// OTLP/gRPC listen address.
    pub grpc_listen: SocketAddr,
    /// OTLP/HTTP listen address.
    pub http_listen: SocketAddr,
}

/// Adaptive priority queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ApqConfig {
    /// Queue capacity in accounted bytes.
    #[serde(deserialize_with = "byte_units::deserialize")]
    pub bytes_cap: u64,
    /// Queue capacity in items.
    pub items_cap: usize,
    /// After this many consecutive higher-priority dequeues, one dequeue
    /// draws from the highest non-empty lower priority.
    pub starvation_k: u32,
}

/// Cardinality limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CardinalityConfig {
    /// Ceiling on distinct fingerprints per window.
    pub budget: usize,
    /// Sliding window length in seconds.
    pub window_seconds: u64,
    /// Attribute key patterns excluded from fingerprinting (substring match).
    pub exclude_keys: Vec<String>,
    /// Interval at which overflow aggregates are flushed as synthesized items.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// Dead-letter queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DlqConfig {
    /// Directory holding segment files and the manifest.
    pub dir: PathBuf,
    /// Total on-disk cap; the oldest sealed segment is discarded beyond it.
    #[serde(deserialize_with = "byte_units::deserialize")]
    pub max_bytes: u64,
    /// Active segment is sealed when it reaches this size.
    #[serde(deserialize_with = "byte_units::deserialize")]
    pub segment_max_bytes: u64,
    /// Active segment is sealed when it reaches this age.
    #[serde(with = "humantime_serde")]
    pub segment_max_age: Duration,
    /// When appended records are synced to disk.
    pub fsync_policy: FsyncPolicy,
}

/// When the DLQ fsyncs its active segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Sync after every record.
    EveryWrite,
    /// Sync after every `n` records.
    EveryN {
        /// Number of appends between syncs.
        n: u32,
    },
    /// Sync at most this often.
    EveryInterval {
        /// Interval between syncs.
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
    /// Sync after `n` records or after `interval`, whichever comes first.
    Hybrid {
        /// Number of appends between syncs.
        n: u32,
        /// Interval between syncs.
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
}

/// Sender settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SenderConfig {
    /// A batch closes when its encoded size reaches this many bytes.
    #[serde(deserialize_with = "byte_units::deserialize")]
    pub batch_bytes: u64,
    /// A batch closes when it holds this many items.
    pub batch_items: usize,
    /// A batch closes when its oldest item reaches this age.
    #[serde(with = "humantime_serde")]
    pub batch_max_age: Duration,
    /// Number of workers draining the queue.
    pub parallelism: usize,
    /// Number of workers replaying from the DLQ.
    pub replay_parallelism: usize,
    /// In-memory retry budget per batch before spilling to the DLQ.
    pub retry_max: u32,
    /// Cap on transports pending at once across all workers.
    pub inflight_max: usize,
    /// Minimum retry backoff.
    #[serde(with = "humantime_serde")]
    pub backoff_min: Duration,
    /// Maximum retry backoff.
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    /// Replay byte-rate cap as a fraction of smoothed live throughput.
    pub replay_throttle_ratio: f64,
}

/// Thresholds that trigger entry into one degradation level.
///
/// A level is triggered when any present threshold holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LevelThresholds {
    /// APQ fill ratio (accounted bytes / bytes cap).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_ratio: Option<f64>,
    /// Process RSS as a fraction of the memory soft cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss: Option<f64>,
    /// DLQ size as a fraction of its cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlq: Option<f64>,
    /// Sender failure rate over the last 60 s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_rate: Option<f64>,
}

/// Adaptive degradation manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AdmConfig {
    /// Trigger thresholds for L1.
    pub l1: LevelThresholds,
    /// Trigger thresholds for L2.
    pub l2: LevelThresholds,
    /// Trigger thresholds for L3.
    pub l3: LevelThresholds,
    /// Trigger thresholds for L4.
    pub l4: LevelThresholds,
    /// A level is entered when its trigger holds for this long.
    pub enter_seconds: u64,
    /// A level is left when its exit condition holds for this long.
    pub exit_seconds: u64,
    /// Sampling cadence.
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// Process RSS soft cap in MiB; the denominator for `rss` thresholds.
    pub memory_soft_cap_mib: u64,
    /// Time spent pinned at L4 before the agent performs a controlled
    /// shutdown with spill.
    pub degraded_panic_seconds: u64,
}

/// Self-telemetry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SelfConfig {
    /// Listen address of the admin surface (/metrics, /healthz, /outage).
    pub listen_addr: SocketAddr,
    /// Whether the POST /outage test endpoint is served.
    pub enable_outage_endpoint: bool,
    /// Cadence of the loop-break OTLP republisher.
    #[serde(with = "humantime_serde")]
    pub publish_interval: Duration,
}

/// Process runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    /// Size of the pre-allocated allocator ballast, in MiB. Zero disables it.
    pub memory_ballast_mib: u64,
    /// Deadline for flush-then-spill on controlled shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            otlp: OtlpConfig::default(),
            receivers: ReceiverConfig::default(),
            apq: ApqConfig::default(),
            cl: CardinalityConfig::default(),
            dlq: DlqConfig::default(),
            sender: SenderConfig::default(),
            adm: AdmConfig::default(),
            self_telemetry: SelfConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for OtlpConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4317".to_string(),
            headers: BTreeMap::new(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            grpc_listen: "0.0.0.0:4317".parse().expect("static addr"),
            http_listen: "0.0.0.0:4318".parse().expect("static addr"),
        }
    }
}

impl Default for ApqConfig {
    fn default() -> Self {
        Self {
            bytes_cap: 32 * 1024 * 1024,
            items_cap: 200_000,
            starvation_k: 256,
        }
    }
}

impl CardinalityConfig {
    /// Default key patterns excluded from fingerprinting: known
    /// high-entropy keys that would explode cardinality.
    pub fn default_exclude_keys() -> Vec<String> {
        [
            "trace_id",
            "span_id",
            "request_id",
            "request.id",
            "pod_uid",
            "k8s.pod.uid",
            "container_id",
            "container.id",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
    }
}

impl Default for CardinalityConfig {
    fn default() -> Self {
        Self {
            budget: 65_536,
            window_seconds: 600,
            exclude_keys: Self::default_exclude_keys(),
            flush_interval: Duration::from_secs(30),
        }
    }
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/nrdot/dlq"),
            max_bytes: 512 * 1024 * 1024,
            segment_max_bytes: 8 * 1024 * 1024,
            segment_max_age: Duration::from_secs(300),
            fsync_policy: FsyncPolicy::default(),
        }
    }
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::Hybrid {
            n: 64,
            interval: Duration::from_millis(500),
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            batch_bytes: 1024 * 1024,
            batch_items: 8192,
            batch_max_age: Duration::from_secs(5),
            parallelism: 4,
            replay_parallelism: 2,
            retry_max: 5,
            inflight_max: 16,
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            replay_throttle_ratio: 0.25,
        }
    }
}

impl Default for AdmConfig {
    fn default() -> Self {
        Self {
            l1: LevelThresholds {
                fill_ratio: Some(0.5),
                rss: Some(0.7),
                ..Default::default()
            },
            l2: LevelThresholds {
                fill_ratio: Some(0.75),
                rss: Some(0.85),
                fail_rate: Some(0.2),
                ..Default::default()
            },
            l3: LevelThresholds {
                fill_ratio: Some(0.9),
                rss: Some(0.95),
                fail_rate: Some(0.5),
                dlq: Some(0.75),
            },
            l4: LevelThresholds {
                fill_ratio: Some(1.0),
                rss: Some(0.99),
                dlq: Some(0.95),
                ..Default::default()
            },
            enter_seconds: 5,
            exit_seconds: 30,
            tick: Duration::from_secs(1),
            memory_soft_cap_mib: 150,
            degraded_panic_seconds: 600,
        }
    }
}

impl Default for SelfConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8888".parse().expect("static addr"),
            enable_outage_endpoint: false,
            publish_interval: Duration::from_secs(10),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_ballast_mib: 64,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from an optional YAML file, applies `NRDOT_*`
    /// environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| Error::FileReadError {
                    path: path.display().to_string(),
                    details: e.to_string(),
                })?;
                serde_yaml::from_str::<AgentConfig>(&text).map_err(|e| {
                    Error::DeserializationError {
                        details: e.to_string(),
                    }
                })?
            }
            None => AgentConfig::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `NRDOT_*` overrides from the given variable iterator.
    ///
    /// Unknown `NRDOT_*` variables are rejected so a typo fails loudly
    /// instead of silently running with the file value.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(suffix) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            self.apply_one_env(&key, suffix, &value)?;
        }
        Ok(())
    }

    fn apply_one_env(&mut self, var: &str, suffix: &str, value: &str) -> Result<(), Error> {
        let invalid = |details: String| Error::InvalidEnvOverride {
            var: var.to_string(),
            details,
        };
        match suffix {
            "OTLP_ENDPOINT" => self.otlp.endpoint = value.to_string(),
            "OTLP_HEADERS" => {
                // comma-separated key=value pairs
                for pair in value.split(',').filter(|p| !p.is_empty()) {
                    let (k, v) = pair
                        .split_once('=')
                        .ok_or_else(|| invalid(format!("expected key=value, got `{pair}`")))?;
                    let _ = self
                        .otlp
                        .headers
                        .insert(k.trim().to_string(), v.trim().to_string());
                }
            }
            "RECEIVER_GRPC_LISTEN" => {
                self.receivers.grpc_listen = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "RECEIVER_HTTP_LISTEN" => {
                self.receivers.http_listen = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "APQ_BYTES_CAP" => self.apq.bytes_cap = byte_units::parse(value).map_err(invalid)?,
            "APQ_ITEMS_CAP" => {
                self.apq.items_cap = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "APQ_STARVATION_K" => {
                self.apq.starvation_k = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "CL_BUDGET" => self.cl.budget = value.parse().map_err(|e| invalid(format!("{e}")))?,
            "CL_WINDOW_SECONDS" => {
                self.cl.window_seconds = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "CL_EXCLUDE_KEYS" => {
                self.cl.exclude_keys = value
                    .split(',')
                    .filter(|p| !p.is_empty())
                    .map(|p| p.trim().to_string())
                    .collect();
            }
            "DLQ_DIR" => self.dlq.dir = PathBuf::from(value),
            "DLQ_MAX_BYTES" => self.dlq.max_bytes = byte_units::parse(value).map_err(invalid)?,
            "DLQ_SEGMENT_MAX_BYTES" => {
                self.dlq.segment_max_bytes = byte_units::parse(value).map_err(invalid)?;
            }
            "DLQ_FSYNC_POLICY" => {
                self.dlq.fsync_policy = match value {
                    "every_write" => FsyncPolicy::EveryWrite,
                    other => {
                        if let Some(n) = other.strip_prefix("every_n=") {
                            FsyncPolicy::EveryN {
                                n: n.parse().map_err(|e| invalid(format!("{e}")))?,
                            }
                        } else if let Some(t) = other.strip_prefix("every_interval=") {
                            FsyncPolicy::EveryInterval {
                                interval: humantime::parse_duration(t)
                                    .map_err(|e| invalid(format!("{e}")))?,
                            }
                        } else {
                            return Err(invalid(format!("unknown fsync policy `{other}`")));
                        }
                    }
                };
            }
            "SENDER_BATCH_BYTES" => {
                self.sender.batch_bytes = byte_units::parse(value).map_err(invalid)?;
            }
            "SENDER_BATCH_ITEMS" => {
                self.sender.batch_items = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "SENDER_BATCH_MAX_AGE" => {
                self.sender.batch_max_age =
                    humantime::parse_duration(value).map_err(|e| invalid(format!("{e}")))?;
            }
            "SENDER_PARALLELISM" => {
                self.sender.parallelism = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "SENDER_REPLAY_PARALLELISM" => {
                self.sender.replay_parallelism =
                    value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "SENDER_RETRY_MAX" => {
                self.sender.retry_max = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "ADM_ENTER_SECONDS" => {
                self.adm.enter_seconds = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "ADM_EXIT_SECONDS" => {
                self.adm.exit_seconds = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "SELF_LISTEN_ADDR" => {
                self.self_telemetry.listen_addr =
                    value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "SELF_ENABLE_OUTAGE_ENDPOINT" => {
                self.self_telemetry.enable_outage_endpoint =
                    value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "RUNTIME_MEMORY_BALLAST_MIB" => {
                self.runtime.memory_ballast_mib =
                    value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            other => {
                return Err(Error::InvalidEnvOverride {
                    var: var.to_string(),
                    details: format!("unrecognized override `{other}`"),
                });
            }
        }
        Ok(())
    }

    /// Validates cross-field constraints. All failures are collected so an
    /// operator sees every problem in one pass.
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &str, details: String| {
            if !ok {
                errors.push(Error::InvalidSetting {
                    field: field.to_string(),
                    details,
                });
            }
        };

        check(
            !self.otlp.endpoint.is_empty(),
            "otlp.endpoint",
            "must not be empty".to_string(),
        );
        check(
            self.apq.bytes_cap > 0,
            "apq.bytes_cap",
            "must be positive".to_string(),
        );
        check(
            self.apq.items_cap > 0,
            "apq.items_cap",
            "must be positive".to_string(),
        );
        check(
            self.apq.starvation_k > 0,
            "apq.starvation_k",
            "must be positive".to_string(),
        );
        check(
            self.cl.budget > 0,
            "cl.budget",
            "must be positive".to_string(),
        );
        check(
            self.cl.window_seconds > 0,
            "cl.window_seconds",
            "must be positive".to_string(),
        );
        check(
            self.dlq.segment_max_bytes > 0 && self.dlq.segment_max_bytes <= self.dlq.max_bytes,
            "dlq.segment_max_bytes",
            format!(
                "must be in 1..=dlq.max_bytes ({})",
                self.dlq.max_bytes
            ),
        );
        check(
            self.sender.parallelism > 0,
            "sender.parallelism",
            "must be positive".to_string(),
        );
        check(
            self.sender.inflight_max >= self.sender.parallelism,
            "sender.inflight_max",
            "must be >= sender.parallelism".to_string(),
        );
        check(
            self.sender.backoff_min <= self.sender.backoff_max,
            "sender.backoff_min",
            "must be <= sender.backoff_max".to_string(),
        );
        check(
            (0.0..=1.0).contains(&self.sender.replay_throttle_ratio),
            "sender.replay_throttle_ratio",
            "must be in [0, 1]".to_string(),
        );
        check(
            self.adm.enter_seconds < self.adm.exit_seconds,
            "adm.exit_seconds",
            "must be greater than adm.enter_seconds to damp oscillation".to_string(),
        );
        check(
            self.adm.memory_soft_cap_mib > 0,
            "adm.memory_soft_cap_mib",
            "must be positive".to_string(),
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfiguration { errors })
        }
    }

    /// 64-bit fingerprint of the effective configuration.
    pub fn fingerprint(&self) -> u64 {
        // serde_json gives a stable field order for structs; BTreeMap keeps
        // header order stable.
        let canonical = serde_json::to_string(self).unwrap_or_default();
        xxh3_64(canonical.as_bytes())
    }
}
