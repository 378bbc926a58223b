// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! NRDOT+ agent binary.
//!
//! Wires the pipeline core to the OTLP boundary and the admin surface:
//! registry → DLQ recovery → CL → APQ → ADM → sender → receivers, with
//! the reverse order on shutdown. Exit codes: 0 clean shutdown, 64
//! configuration error, 70 unrecoverable internal error, 74 durable
//! store I/O error at startup.

use clap::Parser;
use nrdot_admin::AppState;
use nrdot_config::AgentConfig;
use nrdot_engine::pipeline::Core;
use nrdot_engine::CoreError;
use nrdot_otlp::receiver::Ingress;
use nrdot_otlp::{OtlpClients, Sender};
use nrdot_telemetry::{LoopbreakPublisher, Metrics};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: i32 = 64;
const EXIT_INTERNAL: i32 = 70;
const EXIT_DURABLE_IO: i32 = 74;

/// NRDOT+ telemetry collection agent.
#[derive(Debug, Parser)]
#[command(name = "nrdot", version, about)]
struct Cli {
    /// Path to the YAML configuration file. Environment variables with
    /// the NRDOT_ prefix override file settings.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = match AgentConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            std::process::exit(EXIT_CONFIG);
        }
    };

    // Pre-allocated inert block to stabilize allocator behavior; held
    // until process exit.
    let _ballast = allocate_ballast(config.runtime.memory_ballast_mib);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            std::process::exit(EXIT_INTERNAL);
        }
    };
    let code = runtime.block_on(run(config));
    std::process::exit(code);
}

fn allocate_ballast(mib: u64) -> Vec<u8> {
    let len = (mib as usize) * 1024 * 1024;
    let mut ballast = vec![0u8; len];
    // Touch one byte per page so the block is actually resident.
    let mut offset = 0;
    while offset < len {
        ballast[offset] = 0xa5;
        offset += 4096;
    }
    info!(mib, "memory ballast allocated");
    ballast
}

async fn run(config: AgentConfig) -> i32 {
    let fingerprint = config.fingerprint();
    let metrics = Metrics::new();
    metrics.set_config_fingerprint(fingerprint);
    info!(config_fingerprint = format!("{fingerprint:016x}"), "agent starting");

    let root = CancellationToken::new();
    let startup_failed = Arc::new(AtomicBool::new(false));

    // Core: registry → DLQ recovery → CL → APQ → ADM.
    let core_cancel = root.child_token();
    let mut core = match Core::build(&config, metrics.clone(), None, core_cancel.clone()) {
        Ok(core) => core,
        Err(CoreError::DurableStore(e)) => {
            error!(error = %e, "durable store unusable");
            return EXIT_DURABLE_IO;
        }
        Err(e) => {
            error!(error = %e, "core construction failed");
            return EXIT_INTERNAL;
        }
    };
    core.start(&config);

    // Sender.
    let clients = match OtlpClients::new(&config.otlp) {
        Ok(clients) => clients,
        Err(e) => {
            error!(error = %e, "exporter configuration rejected");
            return EXIT_CONFIG;
        }
    };
    let sender = Arc::new(Sender::new(
        config.sender.clone(),
        clients,
        core.apq.clone(),
        core.dlq.clone(),
        metrics.clone(),
        core.controls.clone(),
        core.fail_window.clone(),
        core.live_rate.clone(),
        core.health.clone(),
        core.outage.clone(),
        core.level.clone(),
    ));
    let sender_cancel = root.child_token();
    let sender_tasks = sender.clone().spawn(&sender_cancel);

    // Receivers.
    let ingress = Ingress::new(core.admitter.clone(), metrics.clone(), core.level.clone());
    let receivers_cancel = root.child_token();
    {
        let ingress = ingress.clone();
        let cancel = receivers_cancel.clone();
        let failed = startup_failed.clone();
        let root = root.clone();
        let addr = config.receivers.grpc_listen;
        let _ = tokio::spawn(async move {
            if let Err(e) = nrdot_otlp::receiver::grpc::serve(addr, ingress, cancel).await {
                error!(error = %e, "otlp/grpc receiver failed");
                failed.store(true, Ordering::Relaxed);
                root.cancel();
            }
        });
    }
    {
        let cancel = receivers_cancel.clone();
        let failed = startup_failed.clone();
        let root = root.clone();
        let addr = config.receivers.http_listen;
        let _ = tokio::spawn(async move {
            if let Err(e) = nrdot_otlp::receiver::http::serve(addr, ingress, cancel).await {
                error!(error = %e, "otlp/http receiver failed");
                failed.store(true, Ordering::Relaxed);
                root.cancel();
            }
        });
    }

    // Admin surface.
    let admin_cancel = root.child_token();
    {
        let state = AppState {
            metrics: metrics.clone(),
            health: core.health.clone(),
            outage: core.outage.clone(),
        };
        let cancel = admin_cancel.clone();
        let failed = startup_failed.clone();
        let root = root.clone();
        let addr = config.self_telemetry.listen_addr;
        let enable_outage = config.self_telemetry.enable_outage_endpoint;
        let _ = tokio::spawn(async move {
            if let Err(e) = nrdot_admin::serve(addr, state, enable_outage, cancel).await {
                error!(error = %e, "admin surface failed");
                failed.store(true, Ordering::Relaxed);
                root.cancel();
            }
        });
    }

    // Loop-break republisher.
    {
        let admitter = core.admitter.clone();
        let publisher = LoopbreakPublisher::new(
            metrics.clone(),
            config.self_telemetry.publish_interval,
            Box::new(move |item| {
                let _ = admitter.enqueue_direct(item);
            }),
        );
        let cancel = root.child_token();
        let _ = tokio::spawn(publisher.run(cancel));
    }

    info!("agent running");
    wait_for_shutdown(&core_cancel).await;

    // Reverse-order shutdown: receivers → CL flush → sender drain/spill →
    // admin → core (control tasks + durable fsync).
    let deadline = config.runtime.shutdown_timeout;
    info!(?deadline, "agent stopping");
    receivers_cancel.cancel();
    core.flush_aggregates();
    sender.shutdown(sender_tasks, deadline).await;
    admin_cancel.cancel();

    let degraded_panic = core.degraded_panic.load(Ordering::Relaxed);
    core.shutdown(std::time::Duration::from_secs(2)).await;
    root.cancel();

    info!(config_fingerprint = format!("{fingerprint:016x}"), "agent stopped");
    if degraded_panic || startup_failed.load(Ordering::Relaxed) {
        EXIT_INTERNAL
    } else {
        0
    }
}

/// Resolves on SIGINT, SIGTERM or internal cancellation (degradation
/// watchdog, failed boundary task).
async fn wait_for_shutdown(core_cancel: &CancellationToken) {
    let terminate = async {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(_) => return std::future::pending::<()>().await,
            };
            let _ = sigterm.recv().await;
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = terminate => info!("termination signal received"),
        _ = core_cancel.cancelled() => info!("internal shutdown requested"),
    }
}
