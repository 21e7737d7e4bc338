use std::sync::Arc;

use promo_pricing::{
    clock::SystemClock,
    config::AppConfig,
    create_router, db,
    promotions::{Cache, PgPromotionStore, PgShippingStore, PromotionEngine, RedisCache},
    AppState,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize tracing subscriber for logging; RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    tracing::info!("Pricing API - Starting...");

    let config = AppConfig::from_env().expect("Invalid configuration");

    // Create database connection pool
    tracing::info!("Connecting to database...");
    let db_pool = db::create_pool(&config.database_url)
        .await
        .expect("Failed to create database pool");

    // Run SQLx migrations on startup
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Migrations completed successfully");

    // The cache is optional; pricing falls back to the stores without it
    let cache: Option<Arc<dyn Cache>> = match &config.redis_url {
        Some(url) => match RedisCache::connect(url).await {
            Ok(cache) => Some(Arc::new(cache) as Arc<dyn Cache>),
            Err(e) => {
                tracing::warn!("Redis unavailable, running without cache: {}", e);
                None
            }
        },
        None => None,
    };

    let engine = PromotionEngine::new(
        Arc::new(PgPromotionStore::new(db_pool.clone())),
        Arc::new(PgShippingStore::new(db_pool)),
        cache,
        Arc::new(SystemClock),
        config.engine_settings(),
    );
    if let Err(e) = engine.warm_cache().await {
        tracing::warn!("Cache warm-up failed: {}", e);
    }

    // Periodic metrics summary in the logs
    if let Some(period) = config.metrics_log_interval() {
        let metrics = engine.metrics().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                metrics.log_summary();
            }
        });
    }

    // Create the application router
    let app = create_router(AppState {
        engine: Arc::new(engine),
    });

    // Start the Axum server
    let addr = config.bind_address();
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Pricing API is running on http://{}", addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
