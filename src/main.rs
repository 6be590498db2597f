use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use roomcast::config::Settings;
use roomcast::server::{create_app, AppState};
use roomcast::shutdown::GracefulShutdown;
use roomcast::tasks::HeartbeatTask;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    // Create application state
    let state = AppState::new(settings);
    tracing::info!("Application state initialized");

    // Shutdown signal for background tasks
    let (shutdown_tx, _) = broadcast::channel(1);

    // Start heartbeat task in background, unless disabled
    let heartbeat_handle = state.settings.heartbeat.interval().map(|interval| {
        let task = HeartbeatTask::new(interval, state.hub.clone(), shutdown_tx.subscribe());
        tokio::spawn(async move {
            task.run().await;
        })
    });
    if heartbeat_handle.is_none() {
        tracing::info!("Heartbeat disabled");
    }

    // Create Axum app
    let app = create_app(state.clone());

    // Start server
    let addr = state.settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        "Server listening on {} (ws path {})",
        addr,
        state.settings.server.ws_path
    );

    // Run server until a termination signal arrives
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler())
        .await?;

    // Stop the heartbeat and close remaining connections
    let shutdown = GracefulShutdown::new(state.hub.clone(), shutdown_tx);
    shutdown.execute("server shutting down").await;

    if let Some(handle) = heartbeat_handle {
        let _ = handle.await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
