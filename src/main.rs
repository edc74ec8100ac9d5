//! OpenFirm binary entry point

use std::time::Duration;

use openfirm::{AppState, config};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired public keys are dropped from memory
const KEY_CACHE_PRUNE_INTERVAL: Duration = Duration::from_secs(600);

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Initialize AppState
/// 5. Start background tasks (delivery scheduler, key cache pruning)
/// 6. Serve HTTP until Ctrl-C, then drain the scheduler
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    let default_filter = format!("openfirm={},tower_http=debug", config.logging.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Starting OpenFirm..."
    );

    // 3. Initialize metrics
    openfirm::metrics::init_metrics();

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;
    let app = openfirm::build_router(state.clone());

    // 5. Start background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(state.delivery.clone().run(shutdown_rx));
    spawn_key_cache_pruning(state.clone());

    // 6. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, waiting for delivery scheduler");
    let _ = shutdown_tx.send(true);
    if let Err(error) = scheduler.await {
        tracing::error!(%error, "Delivery scheduler task failed");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Spawn background key cache pruning
fn spawn_key_cache_pruning(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(KEY_CACHE_PRUNE_INTERVAL);
        // Consume the immediate first tick
        interval.tick().await;

        loop {
            interval.tick().await;
            state.key_cache.prune_expired().await;

            let keys = state.key_cache.stats().await;
            match state.delivery.stats().await {
                Ok(queue) => tracing::debug!(
                    cached_keys = keys.valid_entries,
                    pending = queue.pending,
                    delivered = queue.delivered,
                    abandoned = queue.abandoned,
                    "Periodic maintenance"
                ),
                Err(error) => tracing::warn!(%error, "Failed to read delivery stats"),
            }
        }
    });

    tracing::info!("Key cache pruning task spawned");
}
