//! OpenFirm - an ActivityPub federation engine for a job network
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actors, inbox, outbox, objects)    │
//! │  - WebFinger / NodeInfo discovery                            │
//! │  - Health and Prometheus metrics                             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - HTTP Signatures, actor directory, activity model          │
//! │  - Inbox/outbox processing, delivery queue, paging           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx), atomic commit of activity effects          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation handling
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use federation::{
    ActorDirectory, CollectionPaginator, DeliveryEngine, EntityLocks, HttpTransport,
    InboxProcessor, OutboxProcessor, PublicKeyCache, Transport,
};

/// RSA modulus size for provisioned actor keys
pub const ACTOR_KEY_BITS: usize = 2048;

/// Application state shared across all handlers
///
/// This struct is cloned for each request; every field is a shared handle.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Local and remote actors, discovery documents
    pub directory: Arc<ActorDirectory>,

    /// Inbound activity processing
    pub inbox: Arc<InboxProcessor>,

    /// Local submissions and fan-out
    pub outbox: Arc<OutboxProcessor>,

    /// Durable outbound delivery
    pub delivery: DeliveryEngine,

    /// Paged collection rendering
    pub collections: Arc<CollectionPaginator>,

    /// Remote public keys
    pub key_cache: Arc<PublicKeyCache>,
}

impl AppState {
    /// Initialize application state with the production HTTP transport
    ///
    /// # Errors
    /// Returns error if the HTTP client, database or actor provisioning fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        let transport = HttpTransport::new(
            &config.federation.user_agent,
            config.federation.request_timeout(),
            config.federation.allow_private_addresses,
        )?;

        Self::build(config, Arc::new(transport), ACTOR_KEY_BITS).await
    }

    /// Initialize application state over any transport
    ///
    /// # Steps
    /// 1. Connect to SQLite database (migrations run on connect)
    /// 2. Wire the federation components
    /// 3. Provision configured local actors
    pub async fn build(
        config: config::AppConfig,
        transport: Arc<dyn Transport>,
        key_bits: usize,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        if let Some(parent) = config.database.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    error::AppError::Config(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        // 2. Federation components
        let key_cache = Arc::new(PublicKeyCache::new(Some(config.federation.key_cache_ttl())));
        let directory = Arc::new(ActorDirectory::new(
            &config,
            db.clone(),
            transport.clone(),
            key_cache.clone(),
        ));
        let locks = Arc::new(EntityLocks::new());
        let delivery = DeliveryEngine::new(
            db.clone(),
            directory.clone(),
            transport,
            config.delivery.clone(),
        );
        let inbox = Arc::new(InboxProcessor::new(
            &config,
            db.clone(),
            directory.clone(),
            locks.clone(),
            delivery.clone(),
        ));
        let outbox = Arc::new(OutboxProcessor::new(
            db.clone(),
            directory.clone(),
            locks,
            delivery.clone(),
            inbox.clone(),
        ));
        let collections = Arc::new(CollectionPaginator::new(db.clone(), directory.clone()));

        // 3. Local actors
        for actor in &config.actors {
            directory.provision_local_actor(actor, key_bits).await?;
        }
        tracing::info!(actors = config.actors.len(), "Local actors provisioned");

        Ok(Self {
            config: Arc::new(config),
            db,
            directory,
            inbox,
            outbox,
            delivery,
            collections,
            key_cache,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(axum::middleware::from_fn(api::track_http_metrics))
        // Applied innermost-first; outermost is CORS, as with a ServiceBuilder
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
