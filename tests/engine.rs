// End-to-end pricing flows over the in-memory collaborators

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use promo_pricing::clock::FixedClock;
use promo_pricing::promotions::{
    CartLine, CartRequest, EngineSettings, EventProduct, EventRule, EventStatus, InMemoryCache,
    InMemoryPromotionStore, InMemoryShippingStore, OrderUsage, PricingMode, PromoCode, PromoCodeType,
    PromotionEngine, PromotionError, PromotionEvent, PromotionRef, PromotionType,
    ShippingConfiguration, ShippingOptions, UsageStatus,
};
use promo_pricing::promotions::types::RuleTargetType;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

/// Saturday 2024-10-12 12:00 Nepal time
fn saturday_noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, 12, 6, 15, 0).unwrap()
}

fn festival(id: i32, priority: i32, products: &[(i32, Option<Decimal>)]) -> PromotionEvent {
    let now = saturday_noon();
    PromotionEvent {
        id,
        name: format!("Festival {}", id),
        description: None,
        tagline: Some("Celebrate with savings".to_string()),
        promotion_type: PromotionType::Percentage,
        discount_value: dec!(20),
        max_discount_amount: None,
        min_order_value: None,
        start_date: now - chrono::Duration::days(3),
        end_date: now + chrono::Duration::days(10),
        time_slot_start: None,
        time_slot_end: None,
        priority,
        max_usage_count: None,
        max_usage_per_user: None,
        current_usage_count: 0,
        status: EventStatus::Active,
        is_active: true,
        is_deleted: false,
        created_at: now - chrono::Duration::days(7),
        rules: Vec::new(),
        products: products
            .iter()
            .map(|(product_id, specific_discount)| EventProduct {
                event_id: id,
                product_id: *product_id,
                specific_discount: *specific_discount,
            })
            .collect(),
    }
}

fn code(id: i32, text: &str, stackable: bool) -> PromoCode {
    let now = saturday_noon();
    PromoCode {
        id,
        code: text.to_string(),
        description: None,
        promo_type: PromoCodeType::FixedAmount,
        discount_value: dec!(100),
        max_discount_amount: None,
        min_order_amount: None,
        max_total_usage: None,
        max_usage_per_user: None,
        current_usage_count: 0,
        start_date: now - chrono::Duration::days(1),
        end_date: now + chrono::Duration::days(30),
        is_active: true,
        is_deleted: false,
        apply_to_shipping: false,
        stackable_with_events: stackable,
        customer_tier: None,
        created_at: now - chrono::Duration::days(2),
    }
}

fn shipping() -> ShippingConfiguration {
    ShippingConfiguration {
        id: 1,
        name: "Standard".to_string(),
        is_active: true,
        is_default: true,
        low_order_threshold: dec!(500),
        low_order_shipping_cost: dec!(100),
        high_order_shipping_cost: dec!(60),
        free_shipping_threshold: Some(dec!(2000)),
        is_free_shipping_active: false,
        free_shipping_start_date: None,
        free_shipping_end_date: None,
        weekend_surcharge: dec!(25),
        holiday_surcharge: dec!(0),
        rush_delivery_surcharge: dec!(40),
        estimated_delivery_days: 3,
        max_delivery_distance_km: None,
        require_location_validation: false,
        service_center_latitude: None,
        service_center_longitude: None,
        updated_at: saturday_noon(),
    }
}

struct Harness {
    engine: Arc<PromotionEngine>,
    store: Arc<InMemoryPromotionStore>,
}

async fn harness(settings: EngineSettings) -> Harness {
    let store = Arc::new(InMemoryPromotionStore::new());
    let shipping_store = Arc::new(InMemoryShippingStore::new());
    shipping_store.insert(shipping()).await;

    let engine = PromotionEngine::new(
        store.clone(),
        shipping_store,
        Some(Arc::new(InMemoryCache::new())),
        Arc::new(FixedClock(saturday_noon())),
        settings,
    );

    Harness {
        engine: Arc::new(engine),
        store,
    }
}

fn cart(lines: Vec<CartLine>, promo_code: Option<&str>) -> CartRequest {
    CartRequest {
        user_id: Some(42),
        lines,
        promo_code: promo_code.map(str::to_string),
        customer_tier: None,
        shipping: Some(ShippingOptions::default()),
    }
}

#[tokio::test]
async fn test_full_checkout_flow() {
    let h = harness(EngineSettings::default()).await;
    h.store.insert_event(festival(1, 10, &[(1, None), (2, Some(dec!(50)))])).await;
    h.store.insert_promo_code(code(1, "FEST100", true)).await;

    let request = cart(
        vec![
            CartLine::new(1, dec!(400), 1),
            CartLine::new(2, dec!(200), 2),
            CartLine::new(3, dec!(300), 1),
        ],
        Some("fest100"),
    );

    let preview = h.engine.price_cart(&request, PricingMode::Preview).await.unwrap();
    let checkout = h.engine.price_cart(&request, PricingMode::Checkout).await.unwrap();
    assert_eq!(preview.grand_total, checkout.grand_total);

    // Product 1: 20% of 400 = 80. Product 2: 50% specific of 200 x2 = 200.
    assert_eq!(checkout.original_subtotal, dec!(1100));
    assert_eq!(checkout.event_discount_total, dec!(280));
    assert_eq!(checkout.promo_discount_total, dec!(100));
    assert_eq!(checkout.final_subtotal, dec!(720));

    // 820 after events is a high order; Saturday adds the weekend surcharge
    let shipping = checkout.shipping.as_ref().unwrap();
    assert_eq!(shipping.shipping_cost, dec!(85));
    assert_eq!(checkout.grand_total, dec!(805));

    // Line-level sums match the totals
    let promo_sum: Decimal = checkout.lines.iter().map(|l| l.promo_code_discount_amount).sum();
    assert_eq!(promo_sum, checkout.promo_discount_total);
    for line in &checkout.lines {
        assert!(line.reserved_price >= Decimal::ZERO);
    }

    let order_id = Uuid::new_v4();
    let usage = OrderUsage::from_pricing(order_id, 42, &checkout);
    assert_eq!(usage.entries.len(), 2);

    h.engine.confirm_order_usage(&usage).await.unwrap();
    // Retried confirmation is idempotent
    let outcomes = h.engine.confirm_order_usage(&usage).await.unwrap();
    assert!(outcomes.iter().all(|o| !o.is_new()));
    assert_eq!(h.store.event(1).await.unwrap().current_usage_count, 1);
    assert_eq!(h.engine.usage_status(&usage).await.unwrap(), UsageStatus::Complete);

    let reversal = h.engine.reverse_order_usage(order_id).await;
    assert_eq!(reversal.reversed.len(), 2);
    assert_eq!(h.engine.usage_status(&usage).await.unwrap(), UsageStatus::Absent);

    // Reversing twice is a no-op
    assert!(h.engine.reverse_order_usage(order_id).await.reversed.is_empty());
    assert_eq!(h.store.promo_code(1).await.unwrap().current_usage_count, 0);
}

#[tokio::test]
async fn test_retried_confirmation_prices_like_the_first() {
    let h = harness(EngineSettings::default()).await;
    let mut event = festival(1, 10, &[(1, None)]);
    event.max_usage_count = Some(1);
    event.max_usage_per_user = Some(1);
    h.store.insert_event(event).await;
    let mut single_use = code(1, "ONCE", true);
    single_use.max_total_usage = Some(1);
    single_use.max_usage_per_user = Some(1);
    h.store.insert_promo_code(single_use).await;

    let request = cart(vec![CartLine::new(1, dec!(1000), 1)], Some("ONCE"));
    let order_id = Uuid::new_v4();

    let (first, recorded) = h.engine.checkout_order(order_id, 42, &request).await.unwrap();
    assert_eq!(recorded.len(), 2);
    // 1000 - 200 event - 100 code, plus 60 shipping and 25 weekend
    assert_eq!(first.grand_total, dec!(785));

    let (retry, again) = h.engine.checkout_order(order_id, 42, &request).await.unwrap();
    assert_eq!(retry.grand_total, first.grand_total);
    assert!(retry.promo.as_ref().unwrap().is_valid);
    assert_eq!(retry.lines[0].applied_event_id, Some(1));
    assert!(again.iter().all(|o| !o.is_new()));
    assert_eq!(h.store.event(1).await.unwrap().current_usage_count, 1);
    assert_eq!(h.store.promo_code(1).await.unwrap().current_usage_count, 1);
}

#[tokio::test]
async fn test_user_past_event_limit_buys_at_base_price() {
    let h = harness(EngineSettings::default()).await;
    let mut event = festival(1, 10, &[(1, None)]);
    event.max_usage_per_user = Some(1);
    h.store.insert_event(event).await;

    let request = cart(vec![CartLine::new(1, dec!(1000), 1)], None);
    let (first, _) = h.engine.checkout_order(Uuid::new_v4(), 42, &request).await.unwrap();
    assert_eq!(first.event_discount_total, dec!(200));

    let preview = h.engine.price_cart(&request, PricingMode::Preview).await.unwrap();
    assert_eq!(preview.event_discount_total, Decimal::ZERO);

    let (second, recorded) = h.engine.checkout_order(Uuid::new_v4(), 42, &request).await.unwrap();
    assert_eq!(second.lines[0].applied_event_id, None);
    assert_eq!(second.final_subtotal, dec!(1000));
    assert!(recorded.is_empty());
    assert_eq!(h.store.event(1).await.unwrap().current_usage_count, 1);
}

#[tokio::test]
async fn test_non_stackable_code_skips_event_items() {
    let h = harness(EngineSettings::default()).await;
    h.store.insert_event(festival(1, 10, &[(1, None)])).await;
    h.store.insert_promo_code(code(1, "SOLO", false)).await;

    let request = cart(
        vec![CartLine::new(1, dec!(500), 1), CartLine::new(2, dec!(500), 1)],
        Some("SOLO"),
    );
    let pricing = h.engine.price_cart(&request, PricingMode::Checkout).await.unwrap();

    let promo = pricing.promo.as_ref().unwrap();
    assert!(promo.is_valid);
    assert_eq!(pricing.lines[0].promo_code_discount_amount, Decimal::ZERO);
    assert_eq!(pricing.lines[1].promo_code_discount_amount, dec!(100));
    assert_eq!(pricing.event_discount_total, dec!(100));
}

#[tokio::test]
async fn test_concurrent_confirmations_exhaust_once() {
    let h = harness(EngineSettings::default()).await;
    let mut last_one = code(1, "LASTONE", true);
    last_one.max_total_usage = Some(1);
    h.store.insert_promo_code(last_one).await;

    let request = cart(vec![CartLine::new(9, dec!(1000), 1)], Some("LASTONE"));
    let pricing = h.engine.price_cart(&request, PricingMode::Checkout).await.unwrap();
    assert!(pricing.promo.as_ref().unwrap().is_valid);

    let first = OrderUsage::from_pricing(Uuid::new_v4(), 1, &pricing);
    let second = OrderUsage::from_pricing(Uuid::new_v4(), 2, &pricing);

    let (a, b) = tokio::join!(
        h.engine.confirm_order_usage(&first),
        h.engine.confirm_order_usage(&second)
    );

    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1);
    let conflict = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(
        conflict,
        PromotionError::ConcurrencyConflict {
            promotion: PromotionRef::PromoCode(1),
            ..
        }
    ));
    assert_eq!(h.store.promo_code(1).await.unwrap().current_usage_count, 1);
}

#[tokio::test]
async fn test_conflict_rolls_back_earlier_entries() {
    let h = harness(EngineSettings::default()).await;
    h.store.insert_event(festival(1, 10, &[(1, None)])).await;
    let mut last_one = code(1, "LASTONE", true);
    last_one.max_total_usage = Some(1);
    h.store.insert_promo_code(last_one).await;

    let request = cart(vec![CartLine::new(1, dec!(1000), 1)], Some("LASTONE"));
    let pricing = h.engine.price_cart(&request, PricingMode::Checkout).await.unwrap();

    let winner = OrderUsage::from_pricing(Uuid::new_v4(), 1, &pricing);
    let loser = OrderUsage::from_pricing(Uuid::new_v4(), 2, &pricing);
    h.engine.confirm_order_usage(&winner).await.unwrap();

    let result = h.engine.confirm_order_usage(&loser).await;
    assert!(matches!(result, Err(PromotionError::ConcurrencyConflict { .. })));

    // The loser's event entry was recorded then rolled back
    assert_eq!(h.store.event(1).await.unwrap().current_usage_count, 1);
    assert_eq!(h.engine.usage_status(&loser).await.unwrap(), UsageStatus::Absent);
}

#[tokio::test]
async fn test_rule_targeting_and_priority() {
    let h = harness(EngineSettings::default()).await;

    let mut category_sale = festival(1, 1, &[]);
    category_sale.rules = vec![EventRule {
        id: 1,
        event_id: 1,
        target_type: RuleTargetType::Category,
        target_value: Some("7".to_string()),
        promotion_type: PromotionType::FixedAmount,
        discount_value: dec!(30),
        max_discount_amount: None,
        min_order_value: None,
        priority: 0,
    }];
    let mut storewide = festival(2, 5, &[]);
    storewide.discount_value = dec!(5);
    storewide.rules = vec![EventRule {
        id: 2,
        event_id: 2,
        target_type: RuleTargetType::Global,
        target_value: None,
        promotion_type: PromotionType::Percentage,
        discount_value: dec!(5),
        max_discount_amount: None,
        min_order_value: None,
        priority: 0,
    }];
    h.store.insert_event(category_sale).await;
    h.store.insert_event(storewide).await;

    let mut line = CartLine::new(11, dec!(200), 1);
    line.category_id = Some(7);
    let pricing = h
        .engine
        .price_cart(&cart(vec![line], None), PricingMode::Checkout)
        .await
        .unwrap();

    // Higher event priority wins over the more specific category match
    assert_eq!(pricing.lines[0].applied_event_id, Some(2));
    assert_eq!(pricing.lines[0].event_discount_amount, dec!(10));
}

#[tokio::test]
async fn test_slow_store_degrades_preview_but_not_checkout() {
    let settings = EngineSettings {
        preview_timeout: Duration::from_millis(50),
        ..EngineSettings::default()
    };
    let h = harness(settings).await;
    h.store.insert_event(festival(1, 10, &[(1, None)])).await;
    h.store.set_latency(Duration::from_millis(200));

    let request = cart(vec![CartLine::new(1, dec!(100), 1)], None);

    let preview = h.engine.price_cart(&request, PricingMode::Preview).await.unwrap();
    assert!(preview.degraded);
    assert!(!preview.is_price_stable);
    assert_eq!(preview.final_subtotal, dec!(100));

    let checkout = h.engine.price_cart(&request, PricingMode::Checkout).await.unwrap();
    assert!(!checkout.degraded);
    assert_eq!(checkout.final_subtotal, dec!(80));
}

#[tokio::test]
async fn test_rush_shipping_quote() {
    let h = harness(EngineSettings::default()).await;

    let quote = h.engine.calculate_shipping(dec!(300), None, true).await.unwrap();
    assert!(quote.available);
    // 100 base, 25 weekend, 40 rush
    assert_eq!(quote.shipping_cost, dec!(165));
    assert_eq!(quote.estimated_delivery_days, Some(2));

    assert!(matches!(
        h.engine.calculate_shipping(dec!(-1), None, false).await,
        Err(PromotionError::ValidationError(_))
    ));
}
