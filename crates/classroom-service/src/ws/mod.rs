//! WebSocket signaling endpoint.
//!
//! `GET /ws` upgrades to a signaling connection. Each connection gets a fresh
//! [`ConnectionId`](common::types::ConnectionId) and runs its own task (see
//! [`connection`]); the task ends when the client closes the socket or the
//! service shuts down.

mod connection;

use crate::gateway::SessionGateway;
use crate::observability::metrics::set_connections_active;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Largest accepted inbound frame. SDP offers with many candidates stay well
/// below this.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Shared state of the signaling listener.
pub struct SignalingState {
    gateway: Arc<SessionGateway>,
    /// Parent of every connection's cancellation token.
    shutdown: CancellationToken,
    active_connections: AtomicU64,
}

impl SignalingState {
    #[must_use]
    pub fn new(gateway: Arc<SessionGateway>, shutdown: CancellationToken) -> Self {
        Self {
            gateway,
            shutdown,
            active_connections: AtomicU64::new(0),
        }
    }

    /// Number of open signaling connections.
    #[must_use]
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    fn connection_opened(&self) {
        let count = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        set_connections_active(count);
    }

    fn connection_closed(&self) {
        let count = self
            .active_connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        set_connections_active(count);
    }
}

/// Build the signaling router.
pub fn signaling_router(state: Arc<SignalingState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<SignalingState>>) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_failed_upgrade(|error| {
            warn!(target: "cs.ws", error = %error, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| connection::run_connection(socket, state))
}
