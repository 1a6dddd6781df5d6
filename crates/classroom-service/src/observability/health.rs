//! Health and metrics endpoints.
//!
//! Served on the health listener, separate from the signaling socket:
//! - `GET /health` - Liveness probe, plain text `OK`
//! - `GET /ready` - Readiness probe, JSON status; 503 until the coordination
//!   backend is connected and again once shutdown starts
//! - `GET /metrics` - Prometheus text exposition

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags for this node.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
    node_id: String,
    backend: &'static str,
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new(node_id: impl Into<String>, backend: &'static str) -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            node_id: node_id.into(),
            backend,
        }
    }

    /// Mark the node as ready to accept signaling connections.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the node as not ready (e.g., during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Serialize)]
struct ReadinessBody<'a> {
    status: &'static str,
    node_id: &'a str,
    coordination_backend: &'static str,
}

/// Create the health router. `/metrics` is only mounted when a Prometheus
/// handle is supplied.
pub fn health_router(health_state: Arc<HealthState>, prometheus: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state);

    match prometheus {
        Some(handle) => router.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        ),
        None => router,
    }
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if state.is_live() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT LIVE")
    }
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let ready = state.is_ready();
    let body = ReadinessBody {
        status: if ready { "ready" } else { "not_ready" },
        node_id: &state.node_id,
        coordination_backend: state.backend,
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::to_value(&body).unwrap_or_default()),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state() -> Arc<HealthState> {
        Arc::new(HealthState::new("cs-test-1", "memory"))
    }

    #[test]
    fn test_health_state_default() {
        let state = state();
        assert!(state.is_live());
        assert!(!state.is_ready());

        state.set_ready();
        assert!(state.is_ready());
        state.set_not_ready();
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_liveness_returns_ok_text() {
        let app = health_router(state(), None);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_readiness_reports_node_and_backend() {
        let state = state();
        let app = health_router(Arc::clone(&state), None);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready();
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ready");
        assert_eq!(json["node_id"], "cs-test-1");
        assert_eq!(json["coordination_backend"], "memory");
    }

    #[tokio::test]
    async fn test_metrics_route_absent_without_handle() {
        let app = health_router(state(), None);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
