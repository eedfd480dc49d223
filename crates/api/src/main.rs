use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use crackq_api::config::AppConfig;
use crackq_api::engine;
use crackq_api::router::build_app_router;
use crackq_api::state::AppState;
use crackq_api::ws::{self, Severity, SystemMessage};
use crackq_db::queue::PgJobQueue;
use crackq_db::store::PgStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "crackq_api=debug,tower_http=debug".into());
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = AppConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        engine = %config.engine.engine_bin.display(),
        "Loaded configuration",
    );

    // --- Database ---
    let pool = crackq_db::create_pool(&config.server.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    crackq_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");

    crackq_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // --- App state ---
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    let server_config = config.server.clone();
    let ws_config = config.ws;
    let state = AppState::new(
        config,
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(PgJobQueue::new(pool.clone())),
        Some(pool.clone()),
    );
    let ws_manager = Arc::clone(&state.ws_manager);
    let event_bus = Arc::clone(&state.event_bus);

    // --- Heartbeat ---
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&ws_manager), ws_config);

    // Spawn event persistence (writes all events to the database).
    let persistence_handle = tokio::spawn(crackq_events::EventPersistence::run(
        pool.clone(),
        event_bus.subscribe(),
    ));

    // --- Lanes ---
    let lanes_cancel = CancellationToken::new();
    let lane_router = engine::lane_router(&state, None);
    let lanes_handle = tokio::spawn(lane_router.run(lanes_cancel.clone()));

    // --- Start server ---
    let app = build_app_router(state, &server_config);
    let addr = SocketAddr::new(
        server_config.host.parse().context("Invalid HOST address")?,
        server_config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Stop the lanes first; a running engine is terminated and its job failed.
    lanes_cancel.cancel();
    if tokio::time::timeout(shutdown_timeout, lanes_handle).await.is_err() {
        tracing::warn!("Lanes did not stop within the shutdown timeout");
    }

    ws_manager
        .broadcast_system(&SystemMessage::new(Severity::Warning, "Server shutting down"))
        .await;

    // Drop the last event bus handle to close the broadcast channel.
    drop(event_bus);
    let _ = tokio::time::timeout(Duration::from_secs(5), persistence_handle).await;
    tracing::info!("Event persistence shut down");

    let ws_count = ws_manager.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    ws_manager.shutdown_all().await;

    heartbeat_handle.abort();
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Listens for SIGINT (Ctrl-C) and, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
