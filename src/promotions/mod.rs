// Promotion & Pricing Resolution Engine
//
// Given a product or cart and a point in time, determines the chargeable price, the
// applicable promotion event, whether a promo code applies, how discounts stack, how
// usage limits are enforced and reversed, and what shipping costs.
//
// Flow per cart: event resolution and the shipping configuration load run together,
// then event discounts, then promo validation (stacking depends on event discounts),
// then aggregation. Usage is accounted only at order confirmation and cancellation.

pub mod cache;
pub mod eligibility;
pub mod error;
pub mod event_discount;
pub mod handlers;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod postgres;
pub mod pricing;
pub mod promo_code;
pub mod shipping;
pub mod store;
pub mod types;
pub mod usage;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{Cache, InMemoryCache, RedisCache};
pub use eligibility::{EventEligibilityResolver, EventMatch, MatchSource, Resolution};
pub use error::{PResult, PromotionError};
pub use event_discount::{EventDiscount, EventDiscountCalculator};
pub use memory::{InMemoryPromotionStore, InMemoryShippingStore};
pub use metrics::PerformanceMetrics;
pub use models::{
    Coordinates, EventProduct, EventRule, NewPromoCode, ProductRef, PromoCode, PromotionEvent,
    ShippingConfiguration, UsageRecord,
};
pub use postgres::{PgPromotionStore, PgShippingStore};
pub use pricing::{CartLine, CartPricing, PriceBreakdown, PricedLine, PricingAggregator, PricingMode};
pub use promo_code::{PromoApplicationResult, PromoCodeValidator, PromoOrderContext};
pub use shipping::{ShippingCalculator, ShippingRequest, ShippingResult};
pub use store::{NewUsage, OrderScope, PromotionStore, RecordOutcome, ReversalResult, ShippingStore};
pub use types::{Discount, EventStatus, MatchKind, PromoCodeType, PromotionRef, PromotionType};
pub use usage::{OrderUsage, ReversalOutcome, UsageAccountant, UsageEntry, UsageStatus};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use metrics::Operation;
use promo_code::PromoLine;

/// Timeouts, TTLs and retry policy of the engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Deadline for preview lookups before falling back to base prices
    pub preview_timeout: Duration,

    /// Deadline for any single store call
    pub store_timeout: Duration,

    /// Cart reservation window; also the age after which checkout re-prices
    pub cart_reservation_ttl: Duration,
    pub shipping_cache_ttl: Duration,
    pub events_cache_ttl: Duration,
    pub usage_reversal_retries: u32,
    pub reversal_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            preview_timeout: Duration::from_millis(800),
            store_timeout: Duration::from_secs(3),
            cart_reservation_ttl: Duration::from_secs(15 * 60),
            shipping_cache_ttl: Duration::from_secs(15 * 60),
            events_cache_ttl: Duration::from_secs(60),
            usage_reversal_retries: 3,
            reversal_backoff: Duration::from_millis(100),
        }
    }
}

impl EngineSettings {
    fn reservation_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.cart_reservation_ttl).unwrap_or_else(|_| chrono::Duration::minutes(15))
    }
}

/// Delivery options of a cart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShippingOptions {
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub rush: bool,
}

/// A cart to price
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CartRequest {
    pub user_id: Option<i32>,
    pub lines: Vec<CartLine>,
    pub promo_code: Option<String>,
    pub customer_tier: Option<String>,

    /// Shipping is computed only when present
    pub shipping: Option<ShippingOptions>,
}

/// Orchestrates the pricing components behind one interface
pub struct PromotionEngine {
    eligibility: EventEligibilityResolver,
    promo_codes: PromoCodeValidator,
    usage: UsageAccountant,
    shipping: ShippingCalculator,
    cache: Option<Arc<dyn Cache>>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    metrics: PerformanceMetrics,
}

impl PromotionEngine {
    pub fn new(
        store: Arc<dyn PromotionStore>,
        shipping_store: Arc<dyn ShippingStore>,
        cache: Option<Arc<dyn Cache>>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let metrics = PerformanceMetrics::new();

        Self {
            eligibility: EventEligibilityResolver::new(
                store.clone(),
                cache.clone(),
                metrics.clone(),
                settings.events_cache_ttl,
                settings.store_timeout,
            ),
            promo_codes: PromoCodeValidator::new(store.clone(), metrics.clone(), settings.store_timeout),
            usage: UsageAccountant::new(
                store,
                metrics.clone(),
                settings.store_timeout,
                settings.usage_reversal_retries,
                settings.reversal_backoff,
            ),
            shipping: ShippingCalculator::new(
                shipping_store,
                cache.clone(),
                metrics.clone(),
                settings.shipping_cache_ttl,
                settings.store_timeout,
            ),
            cache,
            clock,
            settings,
            metrics,
        }
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Load the shipping configuration into the cache ahead of the first request
    pub async fn warm_cache(&self) -> PResult<()> {
        tracing::info!("Warming pricing cache...");
        match self.shipping.active_configuration(true).await? {
            Some(config) => {
                tracing::info!("Cached shipping configuration {}", config.id);
                Ok(())
            }
            None => Err(PromotionError::ConfigurationNotFound(
                "No active shipping configuration to cache".to_string(),
            )),
        }
    }

    /// Drop cached events and shipping configuration after an admin change
    ///
    /// Until then previews may keep serving the cached data for up to its TTL.
    pub async fn invalidate_caches(&self) {
        tracing::info!("Invalidating pricing caches");
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate("events:*").await {
                tracing::warn!("Failed to invalidate event cache: {}", e);
            }
        }
        self.shipping.invalidate().await;
    }

    /// Price `quantity` units of one product at `instant` (default now)
    ///
    /// Never fails for promotion reasons; an unreachable store yields the base price
    /// flagged as degraded.
    pub async fn resolve_product_price(
        &self,
        product: &ProductRef,
        unit_price: Decimal,
        quantity: u32,
        instant: Option<DateTime<Utc>>,
    ) -> PResult<PriceBreakdown> {
        let mut line = CartLine::new(product.product_id, unit_price, quantity);
        line.category_id = product.category_id;
        line.subcategory_id = product.subcategory_id;
        line.check()?;

        let now = self.clock.now();
        let instant = instant.unwrap_or(now);
        let resolution = self
            .resolve_events(std::slice::from_ref(product), instant, PricingMode::Preview, &OrderScope::default())
            .await;

        let original_total = line.line_subtotal();
        let matched = resolution.get(product.product_id);
        let discount = matched.map(|m| EventDiscountCalculator::calculate(m, unit_price, quantity, original_total));
        let event_discount = discount.as_ref().map_or(Decimal::ZERO, |d| d.amount);
        let applied = matched.filter(|_| event_discount > Decimal::ZERO);

        if resolution.degraded {
            self.metrics.record_degraded();
        }
        let ends_soon = applied.map_or(false, |m| m.event.end_date < now + self.settings.reservation_window());

        Ok(PriceBreakdown {
            product_id: product.product_id,
            quantity,
            unit_price,
            original_total,
            event_discount,
            final_price: (original_total - event_discount).max(Decimal::ZERO),
            applied_event_id: applied.map(|m| m.event.id),
            applied_event_name: applied.map(|m| m.event.name.clone()),
            match_kind: applied.map(|m| m.kind),
            notice: discount.and_then(|d| d.blocked_reason),
            is_price_stable: !resolution.degraded && !resolution.from_cache && !ends_soon,
            degraded: resolution.degraded,
            computed_at: now,
        })
    }

    /// Price a cart
    ///
    /// Only malformed input is an error. Collaborator faults degrade the result:
    /// events are dropped, promo codes are reported unverifiable and shipping is
    /// reported unavailable.
    pub async fn price_cart(&self, request: &CartRequest, mode: PricingMode) -> PResult<CartPricing> {
        self.price_scoped(request, mode, OrderScope::for_user(request.user_id)).await
    }

    /// Checkout pricing for an order about to be confirmed
    ///
    /// Usage the order already recorded does not count against the limits it was
    /// admitted under, so a retried confirmation prices the same as the first one.
    /// The ledger read is not degraded: a confirmation that cannot see it must fail.
    pub async fn price_order(&self, order_id: Uuid, request: &CartRequest) -> PResult<CartPricing> {
        let recorded = self.usage.recorded_for(order_id).await?;
        if !recorded.is_empty() {
            tracing::debug!("Order {} already holds {} usage record(s)", order_id, recorded.len());
        }
        let scope = OrderScope::from_records(request.user_id, &recorded);
        self.price_scoped(request, PricingMode::Checkout, scope).await
    }

    /// Re-price the order at checkout and record the promotions it used
    ///
    /// Safe to retry: a confirmed order re-prices to the same breakdown and its
    /// ledger rows come back as already recorded.
    pub async fn checkout_order(
        &self,
        order_id: Uuid,
        user_id: i32,
        cart: &CartRequest,
    ) -> PResult<(CartPricing, Vec<RecordOutcome>)> {
        let request = CartRequest {
            user_id: Some(user_id),
            ..cart.clone()
        };

        let pricing = self.price_order(order_id, &request).await?;
        if !pricing.can_checkout {
            return Err(PromotionError::ValidationError(format!(
                "Cart cannot be checked out: {}",
                pricing.warnings.join("; ")
            )));
        }

        let order = OrderUsage::from_pricing(order_id, user_id, &pricing);
        let outcomes = self.confirm_order_usage(&order).await?;
        Ok((pricing, outcomes))
    }

    async fn price_scoped(&self, request: &CartRequest, mode: PricingMode, scope: OrderScope) -> PResult<CartPricing> {
        let _timer = self.metrics.start(Operation::CartPricing);

        if request.lines.is_empty() {
            return Err(PromotionError::ValidationError("Cart is empty".to_string()));
        }
        for line in &request.lines {
            line.check()?;
        }

        let now = self.clock.now();
        let use_cache = mode == PricingMode::Preview;
        let products: Vec<ProductRef> = request.lines.iter().map(CartLine::product).collect();

        let shipping_config = async {
            match &request.shipping {
                Some(_) => Some(self.shipping.active_configuration(use_cache).await),
                None => None,
            }
        };
        let (resolution, shipping_config) =
            tokio::join!(self.resolve_events(&products, now, mode, &scope), shipping_config);

        let mut warnings = Vec::new();
        let mut degraded = resolution.degraded;
        if resolution.degraded {
            warnings.push("Promotions are temporarily unavailable; showing regular prices".to_string());
        }

        // Event discounts against the subtotal after regular discounts
        let order_subtotal: Decimal = request.lines.iter().map(CartLine::discountable_amount).sum();
        let event_discounts: Vec<Option<EventDiscount>> = request
            .lines
            .iter()
            .map(|line| {
                resolution.get(line.product_id).map(|matched| {
                    let mut discount =
                        EventDiscountCalculator::calculate(matched, line.unit_price, line.quantity, order_subtotal);
                    discount.amount = discount.amount.min(line.discountable_amount());
                    discount
                })
            })
            .collect();

        let promo_lines: Vec<PromoLine> = request
            .lines
            .iter()
            .zip(&event_discounts)
            .enumerate()
            .map(|(index, (line, event))| {
                let event_amount = event.as_ref().map_or(Decimal::ZERO, |e| e.amount);
                PromoLine {
                    line_index: index,
                    product_id: line.product_id,
                    amount: line.discountable_amount() - event_amount,
                    has_event_discount: event_amount > Decimal::ZERO,
                }
            })
            .collect();
        let post_event_subtotal: Decimal = promo_lines.iter().map(|line| line.amount).sum();

        let shipping = match (&request.shipping, shipping_config) {
            (Some(options), Some(config)) => {
                let shipping_request = ShippingRequest {
                    subtotal: post_event_subtotal,
                    coordinates: options.coordinates,
                    rush: options.rush,
                };
                let result = self.shipping.calculate_with(config, &shipping_request, now);
                if result.degraded {
                    degraded = true;
                    warnings.push("Shipping cost is temporarily unavailable".to_string());
                }
                Some(result)
            }
            _ => None,
        };

        let code = request.promo_code.as_deref().map(str::trim).filter(|code| !code.is_empty());
        let promo = match code {
            Some(code) => {
                let context = PromoOrderContext {
                    subtotal: post_event_subtotal,
                    shipping_cost: shipping
                        .as_ref()
                        .filter(|s| s.available)
                        .map_or(Decimal::ZERO, |s| s.shipping_cost),
                    customer_tier: request.customer_tier.clone(),
                    lines: promo_lines,
                    recorded: scope.recorded.clone(),
                };
                let (result, promo_degraded) = self.validate_promo(code, request.user_id, &context, now, mode).await?;
                if promo_degraded {
                    degraded = true;
                    warnings.push("Promo code could not be verified right now".to_string());
                }
                Some(result)
            }
            None => None,
        };

        let applied_event_end = request
            .lines
            .iter()
            .zip(&event_discounts)
            .filter(|(_, event)| event.as_ref().map_or(false, EventDiscount::is_applied))
            .filter_map(|(line, _)| resolution.get(line.product_id).map(|m| m.event.end_date))
            .min();
        let promo_end = promo.as_ref().filter(|p| p.is_valid).and_then(|p| p.valid_until);
        let earliest_promotion_end = match (applied_event_end, promo_end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        if degraded {
            self.metrics.record_degraded();
        }

        let pricing = PricingAggregator::aggregate(
            pricing::PricingInputs {
                mode,
                lines: request.lines.clone(),
                event_discounts,
                promo,
                shipping,
                degraded,
                from_cache: resolution.from_cache,
                warnings,
                earliest_promotion_end,
            },
            now,
            self.settings.reservation_window(),
        );

        tracing::debug!(
            "Priced cart of {} line(s) ({:?}): {} -> {}",
            pricing.lines.len(),
            mode,
            pricing.original_subtotal,
            pricing.grand_total
        );
        Ok(pricing)
    }

    /// Validate a code against a cart and report what it is worth
    pub async fn apply_promo_code(
        &self,
        code: &str,
        user_id: i32,
        cart: &CartRequest,
    ) -> PResult<PromoApplicationResult> {
        if code.trim().is_empty() {
            return Err(PromotionError::ValidationError("Promo code is required".to_string()));
        }

        let request = CartRequest {
            user_id: Some(user_id),
            promo_code: Some(code.to_string()),
            ..cart.clone()
        };
        let pricing = self.price_cart(&request, PricingMode::Preview).await?;

        Ok(pricing.promo.unwrap_or_else(|| {
            PromoApplicationResult::rejected(code, None, vec![promo_code::REASON_NOT_FOUND.to_string()])
        }))
    }

    /// Shipping for an order subtotal; never fails for collaborator faults
    pub async fn calculate_shipping(
        &self,
        subtotal: Decimal,
        coordinates: Option<Coordinates>,
        rush: bool,
    ) -> PResult<ShippingResult> {
        if subtotal < Decimal::ZERO {
            return Err(PromotionError::ValidationError("Subtotal cannot be negative".to_string()));
        }

        let request = ShippingRequest {
            subtotal,
            coordinates,
            rush,
        };
        Ok(self.shipping.calculate(&request, self.clock.now(), true).await)
    }

    /// Record the order's usage; failures propagate and the caller retries
    pub async fn confirm_order_usage(&self, order: &OrderUsage) -> PResult<Vec<RecordOutcome>> {
        self.usage.confirm(order).await
    }

    pub async fn usage_status(&self, order: &OrderUsage) -> PResult<UsageStatus> {
        self.usage.status(order).await
    }

    /// Reverse the order's usage; the cancellation always proceeds
    pub async fn reverse_order_usage(&self, order_id: Uuid) -> ReversalOutcome {
        self.usage.reverse(order_id).await
    }

    /// Event resolution with the preview deadline applied
    async fn resolve_events(
        &self,
        products: &[ProductRef],
        instant: DateTime<Utc>,
        mode: PricingMode,
        scope: &OrderScope,
    ) -> Resolution {
        let use_cache = mode == PricingMode::Preview;
        let resolve = self.eligibility.resolve_products(products, instant, use_cache, scope);

        match mode {
            PricingMode::Checkout => resolve.await,
            PricingMode::Preview => match tokio::time::timeout(self.settings.preview_timeout, resolve).await {
                Ok(resolution) => resolution,
                Err(_) => {
                    tracing::warn!(
                        "Event resolution exceeded {}ms, pricing without events",
                        self.settings.preview_timeout.as_millis()
                    );
                    Resolution {
                        degraded: true,
                        ..Default::default()
                    }
                }
            },
        }
    }

    /// Promo validation with degradation; returns (result, degraded)
    async fn validate_promo(
        &self,
        code: &str,
        user_id: Option<i32>,
        context: &PromoOrderContext,
        now: DateTime<Utc>,
        mode: PricingMode,
    ) -> PResult<(PromoApplicationResult, bool)> {
        let validate = self.promo_codes.apply(code, user_id, context, now, mode);
        let outcome = match mode {
            PricingMode::Checkout => validate.await,
            PricingMode::Preview => match tokio::time::timeout(self.settings.preview_timeout, validate).await {
                Ok(outcome) => outcome,
                Err(_) => Err(PromotionError::UpstreamUnavailable(format!(
                    "Promo validation exceeded {}ms",
                    self.settings.preview_timeout.as_millis()
                ))),
            },
        };

        match outcome {
            Ok(result) => Ok((result, false)),
            Err(e) if e.is_upstream() => {
                tracing::warn!("Promo code {} could not be verified: {}", code, e);
                let result = PromoApplicationResult::rejected(
                    code,
                    None,
                    vec!["Promo code could not be verified right now".to_string()],
                );
                Ok((result, true))
            }
            Err(e) => Err(e),
        }
    }
}
