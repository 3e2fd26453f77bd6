//! Server lifecycle management
//!
//! Owns the HTTP listener (signaling WebSocket, health and stats routes), the
//! session sweeper and the graceful shutdown sequence.

use std::sync::Arc;
use std::time::Duration;

use axum::{response::IntoResponse, routing::get, Json, Router};
use proxima_sfu::{RegistryStats, SessionBroker, SignalingService};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::websocket;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SignalingService>,
    pub broker: Arc<SessionBroker>,
    /// Flips to true when the server starts shutting down
    pub shutdown: watch::Receiver<bool>,
}

/// Build the HTTP router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct ServerStats {
    #[serde(flatten)]
    pub rooms: RegistryStats,
    pub connected_peers: usize,
    pub sessions: usize,
}

impl ServerStats {
    fn collect(state: &AppState) -> Self {
        Self {
            rooms: state.service.registry().get_stats(),
            connected_peers: state.service.hub().peer_count(),
            sessions: state.broker.session_count(),
        }
    }
}

async fn stats(axum::extract::State(state): axum::extract::State<AppState>) -> Json<ServerStats> {
    Json(ServerStats::collect(&state))
}

/// Proxima server - HTTP listener plus background tasks
pub struct ProximaServer {
    config: Config,
    service: Arc<SignalingService>,
    broker: Arc<SessionBroker>,
}

impl ProximaServer {
    pub const fn new(
        config: Config,
        service: Arc<SignalingService>,
        broker: Arc<SessionBroker>,
    ) -> Self {
        Self {
            config,
            service,
            broker,
        }
    }

    /// Serve until a shutdown signal arrives, then shut down gracefully
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting Proxima server...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = AppState {
            service: Arc::clone(&self.service),
            broker: Arc::clone(&self.broker),
            shutdown: shutdown_rx.clone(),
        };

        let sweeper = self.broker.spawn_sweeper(
            self.config.sfu.session_sweep_interval(),
            self.config.sfu.session_ttl(),
        );

        let http_addr: std::net::SocketAddr = self
            .config
            .http_address()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{}': {e}", self.config.http_address()))?;
        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let mut rx = shutdown_rx;
        let graceful = async move {
            let _ = rx.changed().await;
        };
        let mut http_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, create_router(state))
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }
            info!("HTTP server shut down gracefully");
        });

        let http_stopped = tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                true
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                false
            }
        };

        // Signal open connections and the listener to shut down
        let _ = shutdown_tx.send(true);
        if !http_stopped {
            if let Err(e) = http_handle.await {
                error!("HTTP server task failed: {}", e);
            }
        }
        sweeper.abort();
        self.shutdown().await;
        Ok(())
    }

    /// Wait for connections to drain, then close every room
    async fn shutdown(&self) {
        info!("Shutting down Proxima server...");

        let drain_timeout = Duration::from_secs(self.config.server.shutdown_grace_secs);
        let drain_poll_interval = Duration::from_millis(100);
        let hub = self.service.hub();
        let deadline = tokio::time::Instant::now() + drain_timeout;
        while hub.peer_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(drain_poll_interval).await;
        }
        let remaining = hub.peer_count();
        if remaining > 0 {
            warn!(remaining, "Connections still open after drain timeout");
        }

        self.service.registry().shutdown().await;
        info!("Proxima server shut down complete");
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
