mod api;
mod auth;
mod config;
mod control;
mod domain;
mod error;
mod events;
mod mesh;
mod metrics;
mod quality;
mod reliability;
mod sfu;
mod signal;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderName, HeaderValue, Method};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::control::StreamService;
use crate::events::EventBus;
use crate::mesh::MeshEngine;
use crate::metrics::MetricsRegistry;
use crate::quality::AbrController;
use crate::sfu::SfuServer;
use crate::signal::SignalServer;
use crate::store::Store;

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub service: Arc<StreamService>,
    pub sfu: Arc<SfuServer>,
    pub mesh: Arc<MeshEngine>,
    pub metrics: Arc<MetricsRegistry>,
    pub started_at: Instant,
}

// ─── CORS configuration ────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins) — not suitable for production");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<HeaderValue>().expect("invalid origin header value"))
            .collect();

        info!("CORS: restricted to {} origin(s)", origins.len());

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([
                HeaderName::from_static("content-type"),
                HeaderName::from_static("authorization"),
            ])
    }
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Load .env before anything else so MESHCAST_LOG_LEVEL is available.
    let _ = dotenvy::dotenv();

    let log_level = std::env::var("MESHCAST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let config = Arc::new(Config::from_env());

    // ── Core wiring ─────────────────────────────────────────────────────

    let store = Arc::new(Store::connect(&config).await);
    let bus = EventBus::new();
    let registry = Arc::new(MetricsRegistry::new());

    let mesh = MeshEngine::new(store.clone(), config.mesh.clone(), bus.clone());
    let abr = Arc::new(AbrController::new(config.abr.clone(), bus.clone()));
    let sfu = SfuServer::new(config.clone(), store.clone(), bus.clone(), registry.clone());
    let service = StreamService::new(
        config.clone(),
        store.clone(),
        mesh.clone(),
        abr.clone(),
        sfu.clone(),
        registry.clone(),
        bus.clone(),
    );
    let signal_server = SignalServer::new(
        config.clone(),
        store.clone(),
        mesh.clone(),
        abr.clone(),
        registry.clone(),
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        store: store.clone(),
        service,
        sfu: sfu.clone(),
        mesh: mesh.clone(),
        metrics: registry,
        started_at: Instant::now(),
    });

    // ── Background tasks ────────────────────────────────────────────────

    let rebalance_cancel = CancellationToken::new();
    let rebalance_task = mesh.spawn_periodic_rebalance(rebalance_cancel.clone());

    // ── Routers ─────────────────────────────────────────────────────────

    let cors = build_cors_layer(&config.allowed_origins);
    let api_app = api::router(state.clone()).layer(cors.clone());
    let signal_app = signal_server.router().layer(cors);

    // ── Listeners ───────────────────────────────────────────────────────

    let api_listener = match tokio::net::TcpListener::bind(&config.server_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.server_addr, error = %e, "control listener bind failed");
            std::process::exit(1);
        }
    };
    let signal_listener = match tokio::net::TcpListener::bind(&config.signal_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.signal_addr, error = %e, "signal listener bind failed");
            std::process::exit(1);
        }
    };

    info!("meshcast control plane listening on http://{}", config.server_addr);
    info!("meshcast signaling listening on ws://{}/ws", config.signal_addr);

    let shutdown = CancellationToken::new();

    let api_shutdown = shutdown.clone();
    let api_task = tokio::spawn(async move {
        let server = axum::serve(api_listener, api_app)
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await });
        if let Err(e) = server.await {
            error!(error = %e, "control server terminated");
        }
    });

    let signal_shutdown = shutdown.clone();
    let signal_task = tokio::spawn(async move {
        let server = axum::serve(
            signal_listener,
            signal_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { signal_shutdown.cancelled().await });
        if let Err(e) = server.await {
            error!(error = %e, "signal server terminated");
        }
    });

    // ── Shutdown flow ───────────────────────────────────────────────────

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => warn!(error = %e, "signal handler failed, shutting down"),
    }

    rebalance_cancel.cancel();
    let _ = rebalance_task.await;

    signal_server.shutdown().await;
    sfu.shutdown().await;
    abr.shutdown();
    store.shutdown_cleanup().await;

    shutdown.cancel();
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(config.signal.shutdown_grace_secs),
        async {
            let _ = api_task.await;
            let _ = signal_task.await;
        },
    )
    .await;

    info!("meshcast stopped");
}
