//! camstate - Observable Camera State Server
//!
//! Main entry point for the camstate server.

use anyhow::Context;
use camstate::{
    auth::TokenAuthenticator,
    catalog::{self, keys},
    permission::PermissionEngine,
    persistence::{MemoryRepository, PersistenceBackend, PersistenceLayer, SqliteRepository},
    realtime_hub::BroadcastDispatcher,
    state::{AppConfig, AppState},
    state_store::StateStore,
    subscription::SubscriptionRegistry,
    value::Value,
    web_api,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camstate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting camstate v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        host = %config.host,
        port = config.port,
        database_url = ?config.database_url,
        catalog_path = ?config.catalog_path,
        overflow_policy = ?config.overflow_policy,
        queue_capacity = config.outbound_queue_capacity,
        "Configuration loaded"
    );

    // Register cells (any failure here aborts startup)
    let specs = match &config.catalog_path {
        Some(path) => catalog::load_file(path)
            .await
            .with_context(|| format!("failed to load catalog {}", path.display()))?,
        None => catalog::builtin(),
    };
    let mut builder = StateStore::builder();
    builder
        .register_all(specs)
        .context("cell registration failed")?;
    let store = Arc::new(builder.build());

    // Hardware collaborators
    if store.spec(keys::LIGHT_ENABLED).is_some() {
        store.register_change_observer(
            keys::LIGHT_ENABLED,
            Arc::new(|_key: &str, _old: &Value, new: &Value| {
                tracing::info!(light_enabled = %new, "Illuminator output switched");
            }),
        )?;
    }
    if store.spec(keys::REBOOT_REQUESTED).is_some() {
        store.register_change_observer(
            keys::REBOOT_REQUESTED,
            Arc::new(|_key: &str, _old: &Value, new: &Value| {
                if *new == Value::Bool(true) {
                    tracing::warn!("Reboot requested");
                }
            }),
        )?;
    }

    // Persistence
    let backend: Arc<dyn PersistenceBackend> = match &config.database_url {
        Some(url) => Arc::new(
            SqliteRepository::connect(url)
                .await
                .with_context(|| format!("failed to open database {}", url))?,
        ),
        None => {
            tracing::warn!("DATABASE_URL not set, persistent cells are kept in memory only");
            Arc::new(MemoryRepository::new())
        }
    };
    let persistence = Arc::new(PersistenceLayer::new(backend, config.persistence()));
    persistence.load_into(&store).await;

    // Authentication
    let permissions = Arc::new(PermissionEngine::new());
    let auth = TokenAuthenticator::from_config(&config.auth_tokens, &permissions)
        .context("invalid AUTH_TOKENS")?;
    if auth.is_empty() {
        tracing::warn!("AUTH_TOKENS is empty, no client can authenticate");
    }

    // Broadcast
    let registry = Arc::new(SubscriptionRegistry::new());
    let dispatcher = Arc::new(BroadcastDispatcher::new(
        store.clone(),
        registry,
        config.dispatcher(),
    ));

    persistence.clone().spawn(store.clone());
    let dispatcher_task = dispatcher.clone().spawn();

    let state = AppState {
        config: config.clone(),
        store,
        permissions,
        persistence: persistence.clone(),
        dispatcher,
        auth: Arc::new(auth),
        started_at: Instant::now(),
    };

    let app = web_api::create_router(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the change feed and flush what the debounce window still holds
    dispatcher_task.abort();
    persistence.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
