//! Classroom Service
//!
//! Live session coordinator for virtual classrooms.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3000)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the coordination backend (presence store + event bus)
//! 4. Build the media registry, backend client and session gateway
//! 5. Start the idle room sweeper
//! 6. Start health and signaling servers
//! 7. Mark ready and wait for shutdown signal

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use classroom_service::bus::{EventBus, LocalEventBus, RedisEventBus};
use classroom_service::collaborators::{Collaborators, HttpBackendClient};
use classroom_service::config::{Config, CoordinationBackend, LogFormat};
use classroom_service::gateway::SessionGateway;
use classroom_service::media::{
    spawn_room_sweeper, LoopbackMediaEngine, MediaRouterRegistry, WorkerPool,
};
use classroom_service::observability::{
    health_router, init_metrics_recorder, init_tracing, HealthState,
};
use classroom_service::presence::{InMemoryPresenceStore, PresenceStore, RedisPresenceStore};
use classroom_service::ws::{signaling_router, SignalingState};
use common::secret::ExposeSecret;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::parse(std::env::var("CS_LOG_FORMAT").ok().as_deref()));

    info!("Starting Classroom Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        node_id = %config.node_id,
        coordination_backend = config.coordination_backend.as_str(),
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        media_workers = config.media_workers,
        call_timeout_ms = config.call_timeout.as_millis(),
        room_idle_timeout_secs = config.room_idle_timeout.as_secs(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!(e)
    })?;

    let health_state = Arc::new(HealthState::new(
        config.node_id.clone(),
        config.coordination_backend.as_str(),
    ));

    // Every background task and connection hangs off this token
    let shutdown_token = CancellationToken::new();

    let local_bus = Arc::new(LocalEventBus::new());
    let (presence, bus): (Arc<dyn PresenceStore>, Arc<dyn EventBus>) =
        match config.coordination_backend {
            CoordinationBackend::Redis => {
                let redis_url = config
                    .redis_url
                    .as_ref()
                    .context("REDIS_URL is required for the redis backend")?;

                info!("Connecting to Redis...");
                let store =
                    RedisPresenceStore::connect(redis_url.expose_secret(), config.call_timeout)
                        .await
                        .map_err(|e| {
                            error!(error = %e, "Failed to connect to Redis");
                            e
                        })?;
                let bus = RedisEventBus::start(
                    redis_url.expose_secret(),
                    config.node_id.clone(),
                    Arc::clone(&local_bus),
                    shutdown_token.child_token(),
                )?;
                info!("Redis connection established");
                (Arc::new(store), Arc::new(bus))
            }
            CoordinationBackend::Memory => {
                warn!("Using in-memory coordination backend, rooms will not span nodes");
                (Arc::new(InMemoryPresenceStore::new()), local_bus)
            }
        };

    let engine = Arc::new(LoopbackMediaEngine::new(config.media_announced_ip.clone()));
    let media = Arc::new(MediaRouterRegistry::new(
        engine,
        WorkerPool::new(config.media_workers),
        config.call_timeout,
    ));

    let backend = Arc::new(HttpBackendClient::new(
        config.backend_api_url.clone(),
        config.backend_service_token.clone(),
        config.call_timeout,
    )?);

    let gateway = Arc::new(SessionGateway::new(
        presence,
        Arc::clone(&media),
        bus,
        Collaborators::from_backend(backend),
        config.call_timeout,
    ));

    let sweeper = spawn_room_sweeper(
        Arc::clone(&media),
        config.room_sweep_interval,
        config.room_idle_timeout,
        shutdown_token.child_token(),
    );

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        anyhow::anyhow!("Invalid health bind address: {e}")
    })?;
    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("Failed to bind health server to {health_addr}"))?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        anyhow::anyhow!("Invalid signaling bind address: {e}")
    })?;
    let signaling_state = Arc::new(SignalingState::new(
        Arc::clone(&gateway),
        shutdown_token.child_token(),
    ));
    let signaling_app = signaling_router(signaling_state);

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .with_context(|| format!("Failed to bind signaling server to {signaling_addr}"))?;

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("Classroom Service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so the load balancer stops sending traffic
    health_state.set_not_ready();

    // Closes every signaling connection; each runs its disconnect cleanup
    shutdown_token.cancel();

    // Give tasks time to shut down
    tokio::time::sleep(Duration::from_secs(2)).await;

    if let Err(e) = sweeper.await {
        warn!(error = %e, "Room sweeper ended abnormally");
    }

    info!("Classroom Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
