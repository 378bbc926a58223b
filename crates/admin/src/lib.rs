// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Admin surface of the agent.
//!
//! - GET `/metrics`: Prometheus text exposition of the self-telemetry
//!   registry, no auth.
//! - GET `/healthz`: 200 while the orchestrator is running and the
//!   sender produced at least one ack or durable spill in the last five
//!   minutes; 503 otherwise.
//! - POST `/outage`: test/ops only: toggles a simulated drop of
//!   outbound sends. Served only when enabled in configuration.

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use nrdot_engine::control::{HealthState, OutageSwitch};
use nrdot_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Window in which a delivery must have happened for `/healthz` to pass.
const HEALTH_WINDOW: Duration = Duration::from_secs(300);

/// Shared state behind the admin routes.
#[derive(Clone)]
pub struct AppState {
    /// Self-telemetry registry.
    pub metrics: Metrics,
    /// Orchestrator liveness.
    pub health: Arc<HealthState>,
    /// Simulated outage switch.
    pub outage: Arc<OutageSwitch>,
}

/// All the admin routes. The outage endpoint is mounted only when
/// `enable_outage` is set.
#[must_use]
pub fn routes(state: AppState, enable_outage: bool) -> Router {
    let mut router = Router::new()
        .route("/metrics", get(scrape))
        .route("/healthz", get(healthz));
    if enable_outage {
        router = router.route("/outage", post(outage));
    }
    router.with_state(state)
}

async fn scrape(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode_text(),
    )
        .into_response()
}

#[derive(Serialize)]
struct ProbeResponse {
    status: &'static str,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    if state.health.is_healthy(HEALTH_WINDOW) {
        (StatusCode::OK, Json(ProbeResponse { status: "ok" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse { status: "unavailable" }),
        )
    }
}

#[derive(Debug, Deserialize)]
struct OutageRequest {
    action: String,
    duration_seconds: Option<u64>,
}

#[derive(Serialize)]
struct OutageResponse {
    outage_active: bool,
}

async fn outage(
    State(state): State<AppState>,
    Json(request): Json<OutageRequest>,
) -> Response {
    match request.action.as_str() {
        "start" => {
            state
                .outage
                .start(request.duration_seconds.map(Duration::from_secs));
            info!(duration = ?request.duration_seconds, "simulated outage started");
            Json(OutageResponse {
                outage_active: true,
            })
            .into_response()
        }
        "stop" => {
            state.outage.stop();
            info!("simulated outage stopped");
            Json(OutageResponse {
                outage_active: false,
            })
            .into_response()
        }
        other => (
            StatusCode::BAD_REQUEST,
            format!("unknown action `{other}`"),
        )
            .into_response(),
    }
}

/// Serves the admin surface until cancellation.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    enable_outage: bool,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, outage_endpoint = enable_outage, "admin surface listening");
    axum::serve(listener, routes(state, enable_outage))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt as _;

    fn state() -> AppState {
        AppState {
            metrics: Metrics::new(),
            health: Arc::new(HealthState::new()),
            outage: Arc::new(OutageSwitch::new()),
        }
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text() {
        let state = state();
        state.metrics.adm_current_level.set(1);
        let response = routes(state, false)
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert!(String::from_utf8_lossy(&body).contains("nrdot_adm_current_level 1"));
    }

    #[tokio::test]
    async fn healthz_reflects_delivery_state() {
        let state = state();
        let app = routes(state.clone(), false);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.health.set_running(true);
        state.health.mark_delivery();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn outage_endpoint_is_gated_by_config() {
        let state = state();
        let disabled = routes(state.clone(), false);
        let response = disabled
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/outage")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"action":"start"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let enabled = routes(state.clone(), true);
        let response = enabled
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/outage")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"action":"start","duration_seconds":60}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.outage.is_active());
    }
}
