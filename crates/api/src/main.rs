//! Feedback notification API server binary entrypoint.

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use feedback_common::config::AppConfig;
use feedback_common::db::{create_pool, run_migrations};
use feedback_common::redis_pool::create_redis_pool;

use feedback_api::routes::create_router;
use feedback_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("feedback_api=debug,feedback_notifier=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting feedback notification API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Create database connection pool
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    // Create Redis connection
    let redis = create_redis_pool(&config.redis_url).await?;

    // Build application state
    let addr = config.api_bind_addr.clone();
    let state = AppState::new(pool, redis, config)?;

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
