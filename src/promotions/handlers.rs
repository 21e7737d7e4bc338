// HTTP handlers for the pricing API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::clock;
use crate::promotions::{
    CartPricing, CartRequest, Coordinates, PriceBreakdown, PricingMode, ProductRef,
    PromoApplicationResult, PromotionError, RecordOutcome, ReversalOutcome, ShippingResult,
};

/// Request DTO for pricing a single product
#[derive(Debug, Deserialize, Validate)]
pub struct ProductPriceRequest {
    pub product_id: i32,
    pub category_id: Option<i32>,
    pub subcategory_id: Option<i32>,
    pub unit_price: Decimal,
    #[validate(range(min = 1, max = 10000, message = "Quantity must be between 1 and 10000"))]
    pub quantity: u32,

    /// Nepal civil time ("YYYY-MM-DDTHH:mm:ss"); defaults to now
    pub at: Option<String>,
}

/// Request DTO for pricing a cart
#[derive(Debug, Deserialize)]
pub struct CartPricingRequest {
    #[serde(flatten)]
    pub cart: CartRequest,
    #[serde(default)]
    pub mode: PricingMode,
}

/// Request DTO for applying a promo code to a cart
#[derive(Debug, Deserialize, Validate)]
pub struct ApplyPromoCodeRequest {
    #[validate(length(min = 1, max = 50, message = "Promo code is required"))]
    pub code: String,
    pub user_id: i32,
    #[serde(flatten)]
    pub cart: CartRequest,
}

/// Request DTO for a shipping quote
#[derive(Debug, Deserialize)]
pub struct ShippingQuoteRequest {
    pub subtotal: Decimal,
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub rush: bool,
}

/// Request DTO for confirming an order's promotion usage
#[derive(Debug, Deserialize)]
pub struct ConfirmUsageRequest {
    pub user_id: i32,

    /// The order's cart; re-priced at checkout before usage is recorded
    pub cart: CartRequest,
}

/// Response DTO for a confirmed order
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmUsageResponse {
    pub order_id: Uuid,
    pub pricing: CartPricing,
    pub usage: Vec<RecordOutcome>,
}

/// Handler for POST /api/pricing/products/price
pub async fn product_price_handler(
    State(state): State<crate::AppState>,
    Json(request): Json<ProductPriceRequest>,
) -> Result<Json<PriceBreakdown>, PromotionError> {
    request.validate()?;

    let instant = request.at.as_deref().map(clock::parse_local).transpose()?;
    let mut product = ProductRef::new(request.product_id);
    product.category_id = request.category_id;
    product.subcategory_id = request.subcategory_id;

    let breakdown = state
        .engine
        .resolve_product_price(&product, request.unit_price, request.quantity, instant)
        .await?;

    Ok(Json(breakdown))
}

/// Handler for POST /api/pricing/cart
pub async fn price_cart_handler(
    State(state): State<crate::AppState>,
    Json(request): Json<CartPricingRequest>,
) -> Result<Json<CartPricing>, PromotionError> {
    let pricing = state.engine.price_cart(&request.cart, request.mode).await?;
    Ok(Json(pricing))
}

/// Handler for POST /api/pricing/promo-codes/apply
pub async fn apply_promo_code_handler(
    State(state): State<crate::AppState>,
    Json(request): Json<ApplyPromoCodeRequest>,
) -> Result<Json<PromoApplicationResult>, PromotionError> {
    request.validate()?;

    let result = state
        .engine
        .apply_promo_code(&request.code, request.user_id, &request.cart)
        .await?;

    Ok(Json(result))
}

/// Handler for POST /api/pricing/shipping
pub async fn shipping_quote_handler(
    State(state): State<crate::AppState>,
    Json(request): Json<ShippingQuoteRequest>,
) -> Result<Json<ShippingResult>, PromotionError> {
    let result = state
        .engine
        .calculate_shipping(request.subtotal, request.coordinates, request.rush)
        .await?;

    Ok(Json(result))
}

/// Handler for POST /api/pricing/orders/:order_id/usage
/// Re-prices the cart at checkout and records the promotions it used; safe to retry
pub async fn confirm_usage_handler(
    State(state): State<crate::AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<ConfirmUsageRequest>,
) -> Result<(StatusCode, Json<ConfirmUsageResponse>), PromotionError> {
    let (pricing, usage) = state
        .engine
        .checkout_order(order_id, request.user_id, &request.cart)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ConfirmUsageResponse {
            order_id,
            pricing,
            usage,
        }),
    ))
}

/// Handler for DELETE /api/pricing/orders/:order_id/usage
/// Always succeeds; failed reversals are flagged for reconciliation
pub async fn reverse_usage_handler(
    State(state): State<crate::AppState>,
    Path(order_id): Path<Uuid>,
) -> Json<ReversalOutcome> {
    Json(state.engine.reverse_order_usage(order_id).await)
}

/// Handler for POST /api/pricing/cache/invalidate
/// Called after promotions or shipping configuration change
pub async fn invalidate_cache_handler(State(state): State<crate::AppState>) -> StatusCode {
    state.engine.invalidate_caches().await;
    StatusCode::NO_CONTENT
}
