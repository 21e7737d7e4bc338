// Pricing Aggregator
//
// Composes base price, regular discount, event discount and the promo share of every
// line into one cart breakdown. Final prices are never negative, and a cart-level promo
// discount is split across lines without losing or gaining a cent.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::promotions::{
    error::{PResult, PromotionError},
    event_discount::EventDiscount,
    models::ProductRef,
    promo_code::PromoApplicationResult,
    shipping::ShippingResult,
    types::{round_currency, MatchKind},
};

/// Whether a computation is for display or for committing an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    /// Cart display: cache allowed, short timeout with base-price fallback,
    /// all promo failures collected
    Preview,

    /// Order placement: cache bypassed, promo validation stops at the first failure
    Checkout,
}

impl Default for PricingMode {
    fn default() -> Self {
        PricingMode::Preview
    }
}

fn default_true() -> bool {
    true
}

/// One cart or order line as priced by the caller's catalog
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CartLine {
    pub product_id: i32,
    pub category_id: Option<i32>,
    pub subcategory_id: Option<i32>,

    /// Market price per unit at snapshot time
    pub unit_price: Decimal,

    #[validate(range(min = 1, max = 10000, message = "Quantity must be between 1 and 10000"))]
    pub quantity: u32,

    /// Regular (non-promotional) discount for the whole line
    #[serde(default)]
    pub regular_discount: Decimal,

    /// End of the cart reservation for this line
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default = "default_true")]
    pub in_stock: bool,
}

impl CartLine {
    pub fn new(product_id: i32, unit_price: Decimal, quantity: u32) -> Self {
        Self {
            product_id,
            category_id: None,
            subcategory_id: None,
            unit_price,
            quantity,
            regular_discount: Decimal::ZERO,
            expires_at: None,
            in_stock: true,
        }
    }

    pub fn product(&self) -> ProductRef {
        ProductRef {
            product_id: self.product_id,
            category_id: self.category_id,
            subcategory_id: self.subcategory_id,
        }
    }

    pub fn line_subtotal(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }

    /// Regular discount clamped to the line subtotal
    pub fn effective_regular_discount(&self) -> Decimal {
        self.regular_discount.max(Decimal::ZERO).min(self.line_subtotal())
    }

    /// Line subtotal after the regular discount
    pub fn discountable_amount(&self) -> Decimal {
        self.line_subtotal() - self.effective_regular_discount()
    }

    /// Reject shapes that cannot be priced
    pub fn check(&self) -> PResult<()> {
        self.validate()?;
        if self.unit_price < Decimal::ZERO {
            return Err(PromotionError::ValidationError(format!(
                "Product {} has a negative unit price",
                self.product_id
            )));
        }
        if self.regular_discount < Decimal::ZERO {
            return Err(PromotionError::ValidationError(format!(
                "Product {} has a negative regular discount",
                self.product_id
            )));
        }
        Ok(())
    }
}

/// Pricing fields of one line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedLine {
    pub product_id: i32,
    pub quantity: u32,
    pub original_price: Decimal,
    pub line_subtotal: Decimal,
    pub regular_discount_amount: Decimal,
    pub event_discount_amount: Decimal,
    pub promo_code_discount_amount: Decimal,

    /// Amount actually charged for the line
    pub reserved_price: Decimal,
    pub applied_event_id: Option<i32>,
    pub applied_event_rule_id: Option<i32>,
    pub applied_promo_code_id: Option<i32>,
    pub is_expired: bool,
    pub is_out_of_stock: bool,
    pub notices: Vec<String>,
}

/// Full cart breakdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartPricing {
    pub mode: PricingMode,
    pub lines: Vec<PricedLine>,
    pub original_subtotal: Decimal,
    pub regular_discount_total: Decimal,
    pub event_discount_total: Decimal,
    pub promo_discount_total: Decimal,
    pub total_discounts: Decimal,
    pub final_subtotal: Decimal,
    pub shipping: Option<ShippingResult>,
    pub shipping_discount: Decimal,
    pub grand_total: Decimal,
    pub promo: Option<PromoApplicationResult>,
    pub can_checkout: bool,
    pub is_price_stable: bool,

    /// Some collaborator was unreachable and prices fell back to base prices
    pub degraded: bool,

    /// Shipping was requested but its configuration could not be loaded; the
    /// shipping cost in the totals is a placeholder zero
    pub shipping_unavailable: bool,
    pub warnings: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl CartPricing {
    /// Checkout must re-price rather than trust this breakdown
    pub fn needs_repricing(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        !self.is_price_stable || now - self.computed_at > ttl
    }
}

/// Price of a single product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub product_id: i32,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub original_total: Decimal,
    pub event_discount: Decimal,
    pub final_price: Decimal,
    pub applied_event_id: Option<i32>,
    pub applied_event_name: Option<String>,
    pub match_kind: Option<MatchKind>,
    pub notice: Option<String>,
    pub is_price_stable: bool,
    pub degraded: bool,
    pub computed_at: DateTime<Utc>,
}

/// Split `total` across `weights` in proportion, exact to the cent
///
/// Largest-remainder method: every share gets the floor of its exact cent amount, and
/// the cents left over go to the largest fractional remainders (lowest index first on
/// ties). When all weights are zero the split is equal.
pub fn apportion(total: Decimal, weights: &[Decimal]) -> Vec<Decimal> {
    if weights.is_empty() {
        return Vec::new();
    }

    let total_cents = (round_currency(total.max(Decimal::ZERO)) * Decimal::ONE_HUNDRED).trunc();
    let mut effective: Vec<Decimal> = weights.iter().map(|w| (*w).max(Decimal::ZERO)).collect();
    let mut weight_sum: Decimal = effective.iter().sum();
    if weight_sum.is_zero() {
        effective = vec![Decimal::ONE; weights.len()];
        weight_sum = Decimal::from(weights.len());
    }

    let mut cents = Vec::with_capacity(effective.len());
    let mut remainders = Vec::with_capacity(effective.len());
    for (index, weight) in effective.iter().enumerate() {
        let exact = total_cents * *weight / weight_sum;
        let floor = exact.floor();
        cents.push(floor);
        remainders.push((exact - floor, index));
    }

    let allocated: Decimal = cents.iter().sum();
    let mut leftover = (total_cents - allocated).to_i64().unwrap_or(0);

    // Largest remainder first, lowest index on ties
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    let mut order = remainders.iter().map(|(_, index)| *index).cycle();
    while leftover > 0 {
        if let Some(index) = order.next() {
            cents[index] += Decimal::ONE;
        }
        leftover -= 1;
    }

    // Division rounding can overshoot by a cent; take it back from the smallest remainders
    let mut reverse_order = remainders.iter().rev().map(|(_, index)| *index).cycle();
    let mut guard = cents.len() * 2;
    while leftover < 0 && guard > 0 {
        if let Some(index) = reverse_order.next() {
            if cents[index] > Decimal::ZERO {
                cents[index] -= Decimal::ONE;
                leftover += 1;
            }
        }
        guard -= 1;
    }

    cents
        .into_iter()
        .map(|c| (c / Decimal::ONE_HUNDRED).round_dp(2))
        .collect()
}

/// Everything the aggregator needs for one cart
#[derive(Debug, Clone, Default)]
pub struct PricingInputs {
    pub mode: PricingMode,
    pub lines: Vec<CartLine>,

    /// One entry per line
    pub event_discounts: Vec<Option<EventDiscount>>,
    pub promo: Option<PromoApplicationResult>,
    pub shipping: Option<ShippingResult>,
    pub degraded: bool,
    pub from_cache: bool,
    pub warnings: Vec<String>,

    /// Earliest end among the applied event and promo code
    pub earliest_promotion_end: Option<DateTime<Utc>>,
}

/// Stateless cart aggregator
pub struct PricingAggregator;

impl PricingAggregator {
    pub fn aggregate(inputs: PricingInputs, now: DateTime<Utc>, reservation_ttl: Duration) -> CartPricing {
        let PricingInputs {
            mode,
            lines,
            event_discounts,
            promo,
            shipping,
            degraded,
            from_cache,
            mut warnings,
            earliest_promotion_end,
        } = inputs;

        let promo_id = promo.as_ref().filter(|p| p.is_valid).and_then(|p| p.promo_code_id);

        let mut priced = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            let line_subtotal = line.line_subtotal();
            let regular = line.effective_regular_discount();
            let mut remaining = line_subtotal - regular;
            let mut notices = Vec::new();

            let event = event_discounts.get(index).and_then(|e| e.as_ref());
            let event_amount = event.map_or(Decimal::ZERO, |e| e.amount.max(Decimal::ZERO).min(remaining));
            remaining -= event_amount;
            if let Some(reason) = event.and_then(|e| e.blocked_reason.clone()) {
                notices.push(reason);
            }

            let promo_share = promo
                .as_ref()
                .filter(|p| p.is_valid)
                .and_then(|p| p.item_discounts.iter().find(|d| d.line_index == index));
            let promo_amount =
                promo_share.map_or(Decimal::ZERO, |d| d.amount.max(Decimal::ZERO).min(remaining));
            if let Some(reason) = promo_share.and_then(|d| d.excluded_reason.clone()) {
                notices.push(reason);
            }

            let reserved_price = (remaining - promo_amount).max(Decimal::ZERO);
            let is_expired = line.expires_at.map_or(false, |expires| expires <= now);

            priced.push(PricedLine {
                product_id: line.product_id,
                quantity: line.quantity,
                original_price: line.unit_price,
                line_subtotal,
                regular_discount_amount: regular,
                event_discount_amount: event_amount,
                promo_code_discount_amount: promo_amount,
                reserved_price,
                applied_event_id: event.filter(|e| e.is_applied()).map(|e| e.event_id),
                applied_event_rule_id: event.filter(|e| e.is_applied()).and_then(|e| e.rule_id),
                applied_promo_code_id: promo_id.filter(|_| promo_amount > Decimal::ZERO),
                is_expired,
                is_out_of_stock: !line.in_stock,
                notices,
            });
        }

        let original_subtotal: Decimal = priced.iter().map(|l| l.line_subtotal).sum();
        let regular_discount_total: Decimal = priced.iter().map(|l| l.regular_discount_amount).sum();
        let event_discount_total: Decimal = priced.iter().map(|l| l.event_discount_amount).sum();
        let promo_discount_total: Decimal = priced.iter().map(|l| l.promo_code_discount_amount).sum();
        let final_subtotal: Decimal = priced.iter().map(|l| l.reserved_price).sum();

        let shipping_cost = shipping
            .as_ref()
            .filter(|s| s.available)
            .map_or(Decimal::ZERO, |s| s.shipping_cost);
        let shipping_discount = promo
            .as_ref()
            .filter(|p| p.is_valid)
            .map_or(Decimal::ZERO, |p| p.shipping_discount.max(Decimal::ZERO).min(shipping_cost));

        let expired = priced.iter().filter(|l| l.is_expired).count();
        let out_of_stock = priced.iter().filter(|l| l.is_out_of_stock).count();
        if expired > 0 {
            warnings.push(format!("{} item(s) in the cart have expired", expired));
        }
        if out_of_stock > 0 {
            warnings.push(format!("{} item(s) in the cart are out of stock", out_of_stock));
        }
        // An unreachable configuration degrades; only a refused location blocks checkout
        let shipping_blocked = shipping.as_ref().map_or(false, |s| !s.available && !s.degraded);
        let shipping_unavailable = shipping.as_ref().map_or(false, |s| s.degraded);
        let degraded = degraded || shipping_unavailable;
        let can_checkout = !priced.is_empty() && expired == 0 && out_of_stock == 0 && !shipping_blocked;

        let ends_inside_window = earliest_promotion_end.map_or(false, |end| end < now + reservation_ttl);
        let is_price_stable = !degraded && !from_cache && !ends_inside_window;

        CartPricing {
            mode,
            lines: priced,
            original_subtotal,
            regular_discount_total,
            event_discount_total,
            promo_discount_total,
            total_discounts: regular_discount_total + event_discount_total + promo_discount_total,
            final_subtotal,
            grand_total: final_subtotal + shipping_cost - shipping_discount,
            shipping,
            shipping_discount,
            promo,
            can_checkout,
            is_price_stable,
            degraded,
            shipping_unavailable,
            warnings,
            computed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promotions::promo_code::ItemPromoDiscount;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn event_discount(amount: Decimal) -> Option<EventDiscount> {
        Some(EventDiscount {
            event_id: 1,
            rule_id: None,
            per_unit: amount,
            amount,
            blocked_reason: None,
        })
    }

    fn promo(shares: &[(usize, Decimal)]) -> PromoApplicationResult {
        let item_discounts: Vec<ItemPromoDiscount> = shares
            .iter()
            .map(|(line_index, amount)| ItemPromoDiscount {
                line_index: *line_index,
                product_id: *line_index as i32,
                amount: *amount,
                excluded_reason: None,
            })
            .collect();
        PromoApplicationResult {
            code: "SAVE".to_string(),
            promo_code_id: Some(9),
            promo_type: None,
            is_valid: true,
            item_discount_total: item_discounts.iter().map(|d| d.amount).sum(),
            item_discounts,
            shipping_discount: Decimal::ZERO,
            reasons: Vec::new(),
            valid_until: None,
        }
    }

    #[test]
    fn test_apportion_is_exact_for_small_carts() {
        for n in [1usize, 2, 3, 7] {
            let weights = vec![dec!(33.33); n];
            let shares = apportion(dec!(100), &weights);
            assert_eq!(shares.len(), n);
            assert_eq!(shares.iter().sum::<Decimal>(), dec!(100), "n = {}", n);
        }
    }

    #[test]
    fn test_apportion_largest_remainder() {
        // 10.00 over 1:1:1 is 3.33 each with one cent left for the first
        let shares = apportion(dec!(10), &[dec!(1), dec!(1), dec!(1)]);
        assert_eq!(shares, vec![dec!(3.34), dec!(3.33), dec!(3.33)]);

        let shares = apportion(dec!(10), &[dec!(100), dec!(300)]);
        assert_eq!(shares, vec![dec!(2.50), dec!(7.50)]);
    }

    #[test]
    fn test_apportion_zero_weights_split_equally() {
        let shares = apportion(dec!(1), &[Decimal::ZERO, Decimal::ZERO]);
        assert_eq!(shares, vec![dec!(0.50), dec!(0.50)]);
        assert!(apportion(dec!(5), &[]).is_empty());
    }

    #[test]
    fn test_aggregate_line_invariant() {
        let mut line = CartLine::new(1, dec!(500), 2);
        line.regular_discount = dec!(100);
        let inputs = PricingInputs {
            lines: vec![line],
            event_discounts: vec![event_discount(dec!(90))],
            promo: Some(promo(&[(0, dec!(81))])),
            ..Default::default()
        };

        let pricing = PricingAggregator::aggregate(inputs, Utc::now(), Duration::minutes(15));
        let line = &pricing.lines[0];
        assert_eq!(line.line_subtotal, dec!(1000));
        assert_eq!(line.reserved_price, dec!(729));
        assert_eq!(line.applied_event_id, Some(1));
        assert_eq!(line.applied_promo_code_id, Some(9));
        assert_eq!(pricing.total_discounts, dec!(271));
        assert_eq!(pricing.final_subtotal, dec!(729));
        assert!(pricing.can_checkout);
        assert!(pricing.is_price_stable);
    }

    #[test]
    fn test_unreadable_shipping_is_flagged_not_free() {
        let now = Utc::now();
        let inputs = PricingInputs {
            lines: vec![CartLine::new(1, dec!(400), 1)],
            event_discounts: vec![None],
            shipping: Some(ShippingResult::unavailable("Shipping cost is temporarily unavailable", None, true)),
            ..Default::default()
        };

        let pricing = PricingAggregator::aggregate(inputs, now, Duration::minutes(15));
        assert!(pricing.shipping_unavailable);
        assert!(pricing.degraded);
        assert!(!pricing.is_price_stable);
        assert!(pricing.can_checkout);
        assert_eq!(pricing.grand_total, dec!(400));

        // A location outside the service area is a refusal, not an outage
        let refused = PricingInputs {
            lines: vec![CartLine::new(1, dec!(400), 1)],
            event_discounts: vec![None],
            shipping: Some(ShippingResult::unavailable("Delivery location is invalid", Some(1), false)),
            ..Default::default()
        };
        let pricing = PricingAggregator::aggregate(refused, now, Duration::minutes(15));
        assert!(!pricing.shipping_unavailable);
        assert!(!pricing.can_checkout);
    }

    #[test]
    fn test_expired_or_out_of_stock_blocks_checkout() {
        let now = Utc::now();
        let mut expired = CartLine::new(1, dec!(100), 1);
        expired.expires_at = Some(now);
        let mut missing = CartLine::new(2, dec!(100), 1);
        missing.in_stock = false;

        let inputs = PricingInputs {
            lines: vec![expired, missing],
            event_discounts: vec![None, None],
            ..Default::default()
        };
        let pricing = PricingAggregator::aggregate(inputs, now, Duration::minutes(15));
        assert!(!pricing.can_checkout);
        assert_eq!(pricing.warnings.len(), 2);
    }

    #[test]
    fn test_stability_flags() {
        let now = Utc::now();
        let base = PricingInputs {
            lines: vec![CartLine::new(1, dec!(100), 1)],
            event_discounts: vec![None],
            ..Default::default()
        };

        let ending = PricingInputs {
            earliest_promotion_end: Some(now + Duration::minutes(5)),
            ..base.clone()
        };
        assert!(!PricingAggregator::aggregate(ending, now, Duration::minutes(15)).is_price_stable);

        let degraded = PricingInputs { degraded: true, ..base.clone() };
        assert!(!PricingAggregator::aggregate(degraded, now, Duration::minutes(15)).is_price_stable);

        let stable = PricingAggregator::aggregate(base, now, Duration::minutes(15));
        assert!(!stable.needs_repricing(now + Duration::minutes(10), Duration::minutes(15)));
        assert!(stable.needs_repricing(now + Duration::minutes(16), Duration::minutes(15)));
    }

    #[test]
    fn test_apportion_sums_exactly() {
        proptest!(|(weights in prop::collection::vec(0i64..10_000_000, 1..9), ratio in 0u32..=100)| {
            let weights: Vec<Decimal> = weights.into_iter().map(|c| Decimal::new(c, 2)).collect();
            let weight_sum: Decimal = weights.iter().sum();
            let total = round_currency(weight_sum * Decimal::from(ratio) / Decimal::ONE_HUNDRED);

            let shares = apportion(total, &weights);
            prop_assert_eq!(shares.iter().sum::<Decimal>(), total);
            if !weight_sum.is_zero() {
                for (share, weight) in shares.iter().zip(&weights) {
                    prop_assert!(share <= weight);
                }
            }
        });
    }

    #[test]
    fn test_final_price_never_negative() {
        proptest!(|(
            price_cents in 0i64..1_000_000,
            quantity in 1u32..20,
            regular in 0i64..2_000_000,
            event in 0i64..2_000_000,
            promo_amount in 0i64..2_000_000,
        )| {
            let mut line = CartLine::new(1, Decimal::new(price_cents, 2), quantity);
            line.regular_discount = Decimal::new(regular, 2);
            let inputs = PricingInputs {
                lines: vec![line],
                event_discounts: vec![event_discount(Decimal::new(event, 2))],
                promo: Some(promo(&[(0, Decimal::new(promo_amount, 2))])),
                ..Default::default()
            };

            let pricing = PricingAggregator::aggregate(inputs, Utc::now(), Duration::minutes(15));
            let line = &pricing.lines[0];
            prop_assert!(line.reserved_price >= Decimal::ZERO);
            prop_assert_eq!(
                line.reserved_price,
                line.line_subtotal
                    - line.regular_discount_amount
                    - line.event_discount_amount
                    - line.promo_code_discount_amount
            );
        });
    }
}
