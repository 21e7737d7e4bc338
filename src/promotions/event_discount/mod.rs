// Event Discount Calculator
//
// Turns a resolved event match into a discount for one line item.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::promotions::{
    eligibility::{EventMatch, MatchSource},
    types::{format_rupees, Discount},
};

/// Event discount applied to one line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDiscount {
    pub event_id: i32,
    pub rule_id: Option<i32>,

    /// Discount per unit, already clamped to the unit price
    pub per_unit: Decimal,

    /// Line total discount (`per_unit × quantity`)
    pub amount: Decimal,

    /// Set when the event matched but the order did not meet its minimum
    pub blocked_reason: Option<String>,
}

impl EventDiscount {
    pub fn is_applied(&self) -> bool {
        self.amount > Decimal::ZERO
    }
}

/// Stateless calculator for event discounts
pub struct EventDiscountCalculator;

impl EventDiscountCalculator {
    /// Discount terms for the match
    ///
    /// A direct product link with a specific discount overrides the event's value but
    /// keeps its type and cap. Rules carry their own terms.
    pub fn discount_for(matched: &EventMatch) -> Discount {
        match &matched.source {
            MatchSource::Product(link) => match link.specific_discount {
                Some(value) => Discount::from_promotion(
                    matched.event.promotion_type,
                    value,
                    matched.event.max_discount_amount,
                ),
                None => matched.event.discount(),
            },
            MatchSource::Rule(rule) => rule.discount(),
        }
    }

    /// Minimum order value gating the match; a rule without one inherits the event's
    pub fn min_order_for(matched: &EventMatch) -> Option<Decimal> {
        match &matched.source {
            MatchSource::Product(_) => matched.event.min_order_value,
            MatchSource::Rule(rule) => rule.min_order_value.or(matched.event.min_order_value),
        }
    }

    /// Discount for `quantity` units at `unit_price` within an order of `order_subtotal`
    ///
    /// The result never exceeds `unit_price × quantity` and is zero when the order is
    /// below the minimum.
    pub fn calculate(
        matched: &EventMatch,
        unit_price: Decimal,
        quantity: u32,
        order_subtotal: Decimal,
    ) -> EventDiscount {
        let mut result = EventDiscount {
            event_id: matched.event_id(),
            rule_id: matched.rule_id(),
            per_unit: Decimal::ZERO,
            amount: Decimal::ZERO,
            blocked_reason: None,
        };

        if let Some(min_order) = Self::min_order_for(matched) {
            if order_subtotal < min_order {
                tracing::debug!(
                    "Event {} inactive for order of {}: minimum {}",
                    matched.event.id,
                    order_subtotal,
                    min_order
                );
                result.blocked_reason = Some(format!(
                    "{} requires a minimum order of {}",
                    matched.event.name,
                    format_rupees(min_order)
                ));
                return result;
            }
        }

        let per_unit = Self::discount_for(matched).amount_off(unit_price);
        result.per_unit = per_unit;
        result.amount = per_unit * Decimal::from(quantity);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promotions::models::EventProduct;
    use crate::promotions::test_support::{event, rule};
    use crate::promotions::types::{MatchKind, PromotionType, RuleTargetType};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn direct_match(specific_discount: Option<Decimal>) -> EventMatch {
        let event = event(1, 0);
        EventMatch {
            event,
            kind: MatchKind::DirectProduct,
            source: MatchSource::Product(EventProduct {
                event_id: 1,
                product_id: 100,
                specific_discount,
            }),
        }
    }

    #[test]
    fn test_percentage_event_discount() {
        let matched = direct_match(None);
        let discount = EventDiscountCalculator::calculate(&matched, dec!(250), 2, dec!(500));
        assert_eq!(discount.per_unit, dec!(25));
        assert_eq!(discount.amount, dec!(50));
        assert!(discount.is_applied());
    }

    #[test]
    fn test_specific_discount_overrides_value_only() {
        let mut matched = direct_match(Some(dec!(40)));
        matched.event.max_discount_amount = Some(dec!(30));

        let discount = EventDiscountCalculator::calculate(&matched, dec!(100), 1, dec!(100));
        // 40% of 100 capped at the event's 30
        assert_eq!(discount.amount, dec!(30));
    }

    #[test]
    fn test_fixed_discount_clamped_to_price() {
        let mut matched = direct_match(None);
        matched.event.promotion_type = PromotionType::FixedAmount;
        matched.event.discount_value = dec!(500);

        let discount = EventDiscountCalculator::calculate(&matched, dec!(120), 3, dec!(360));
        assert_eq!(discount.per_unit, dec!(120));
        assert_eq!(discount.amount, dec!(360));
    }

    #[test]
    fn test_min_order_gates_discount() {
        let mut matched = direct_match(None);
        matched.event.min_order_value = Some(dec!(1000));

        let discount = EventDiscountCalculator::calculate(&matched, dec!(200), 1, dec!(999.99));
        assert_eq!(discount.amount, Decimal::ZERO);
        assert!(discount.blocked_reason.unwrap().contains("Rs.1000"));

        let discount = EventDiscountCalculator::calculate(&matched, dec!(200), 1, dec!(1000));
        assert_eq!(discount.amount, dec!(20));
    }

    #[test]
    fn test_rule_terms_and_inherited_minimum() {
        let mut event = event(1, 0);
        event.min_order_value = Some(dec!(300));
        let mut matched_rule = rule(5, 1, RuleTargetType::Category, Some("7"));
        matched_rule.promotion_type = PromotionType::FixedAmount;
        matched_rule.discount_value = dec!(15);
        let matched = EventMatch {
            event,
            kind: MatchKind::Category,
            source: MatchSource::Rule(matched_rule.clone()),
        };

        let blocked = EventDiscountCalculator::calculate(&matched, dec!(100), 2, dec!(200));
        assert_eq!(blocked.amount, Decimal::ZERO);

        let applied = EventDiscountCalculator::calculate(&matched, dec!(100), 2, dec!(300));
        assert_eq!(applied.amount, dec!(30));
        assert_eq!(applied.rule_id, Some(5));
    }

    #[test]
    fn test_discount_never_exceeds_line_total() {
        proptest!(|(price_cents in 0i64..1_000_000, quantity in 1u32..50, value in 0i64..20_000)| {
            let unit_price = Decimal::new(price_cents, 2);
            let mut matched = direct_match(None);
            matched.event.promotion_type = if value % 2 == 0 {
                PromotionType::Percentage
            } else {
                PromotionType::FixedAmount
            };
            matched.event.discount_value = Decimal::new(value, 2);

            let discount = EventDiscountCalculator::calculate(&matched, unit_price, quantity, unit_price);
            let line_total = unit_price * Decimal::from(quantity);
            prop_assert!(discount.amount >= Decimal::ZERO);
            prop_assert!(discount.amount <= line_total);
        });
    }
}
