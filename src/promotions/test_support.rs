// Fixtures shared by unit tests

use chrono::{Duration, Utc};
use rust_decimal_macros::dec;

use crate::promotions::{
    models::{EventProduct, EventRule, PromoCode, PromotionEvent, ShippingConfiguration},
    types::{EventStatus, PromoCodeType, PromotionType, RuleTargetType},
};

/// Product every fixture event links to directly
pub const LINKED_PRODUCT: i32 = 100;

/// Enabled 10% event, live for a day either side of now, linked to `LINKED_PRODUCT`
pub fn event(id: i32, priority: i32) -> PromotionEvent {
    let now = Utc::now();
    PromotionEvent {
        id,
        name: format!("Event {}", id),
        description: None,
        tagline: None,
        promotion_type: PromotionType::Percentage,
        discount_value: dec!(10),
        max_discount_amount: None,
        min_order_value: None,
        start_date: now - Duration::days(1),
        end_date: now + Duration::days(1),
        time_slot_start: None,
        time_slot_end: None,
        priority,
        max_usage_count: None,
        max_usage_per_user: None,
        current_usage_count: 0,
        status: EventStatus::Active,
        is_active: true,
        is_deleted: false,
        created_at: now - Duration::days(2),
        rules: Vec::new(),
        products: vec![EventProduct {
            event_id: id,
            product_id: LINKED_PRODUCT,
            specific_discount: None,
        }],
    }
}

/// Same as `event` but reached only through `rules`
pub fn rule_event(id: i32, priority: i32, rules: Vec<EventRule>) -> PromotionEvent {
    let mut event = event(id, priority);
    event.products.clear();
    event.rules = rules;
    event
}

pub fn rule(id: i32, event_id: i32, target_type: RuleTargetType, target: Option<&str>) -> EventRule {
    EventRule {
        id,
        event_id,
        target_type,
        target_value: target.map(str::to_string),
        promotion_type: PromotionType::Percentage,
        discount_value: dec!(10),
        max_discount_amount: None,
        min_order_value: None,
        priority: 0,
    }
}

/// Active, unlimited 10% code live around now
pub fn promo_code(id: i32, code: &str) -> PromoCode {
    let now = Utc::now();
    PromoCode {
        id,
        code: code.to_string(),
        description: None,
        promo_type: PromoCodeType::Percentage,
        discount_value: dec!(10),
        max_discount_amount: None,
        min_order_amount: None,
        max_total_usage: None,
        max_usage_per_user: None,
        current_usage_count: 0,
        start_date: now - Duration::days(1),
        end_date: now + Duration::days(1),
        is_active: true,
        is_deleted: false,
        apply_to_shipping: false,
        stackable_with_events: true,
        customer_tier: None,
        created_at: now - Duration::days(2),
    }
}

/// Active, non-default tiered configuration: 100 below 500, 50 above, free from 800
pub fn shipping_config(id: i32) -> ShippingConfiguration {
    ShippingConfiguration {
        id,
        name: format!("Shipping {}", id),
        is_active: true,
        is_default: false,
        low_order_threshold: dec!(500),
        low_order_shipping_cost: dec!(100),
        high_order_shipping_cost: dec!(50),
        free_shipping_threshold: Some(dec!(800)),
        is_free_shipping_active: false,
        free_shipping_start_date: None,
        free_shipping_end_date: None,
        weekend_surcharge: dec!(0),
        holiday_surcharge: dec!(0),
        rush_delivery_surcharge: dec!(0),
        estimated_delivery_days: 3,
        max_delivery_distance_km: None,
        require_location_validation: false,
        service_center_latitude: None,
        service_center_longitude: None,
        updated_at: Utc::now(),
    }
}
