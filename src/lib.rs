// Promotion & Pricing Resolution Engine
//
// Library surface: the pricing engine, its collaborators and a thin axum router.

pub mod clock;
pub mod config;
pub mod db;
pub mod promotions;

use axum::{
    routing::post,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use promotions::handlers::{
    apply_promo_code_handler, confirm_usage_handler, invalidate_cache_handler, price_cart_handler,
    product_price_handler, reverse_usage_handler, shipping_quote_handler,
};
use promotions::PromotionEngine;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PromotionEngine>,
}

/// Creates and configures the application router
/// Maps all pricing endpoints to their handlers and adds CORS middleware
pub fn create_router(state: AppState) -> Router {
    // Configure CORS to allow all origins, methods, and headers
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/pricing/products/price", post(product_price_handler))
        .route("/api/pricing/cart", post(price_cart_handler))
        .route("/api/pricing/promo-codes/apply", post(apply_promo_code_handler))
        .route("/api/pricing/shipping", post(shipping_quote_handler))
        .route(
            "/api/pricing/orders/:order_id/usage",
            post(confirm_usage_handler).delete(reverse_usage_handler),
        )
        .route("/api/pricing/cache/invalidate", post(invalidate_cache_handler))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}
