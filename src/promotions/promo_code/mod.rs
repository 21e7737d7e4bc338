// Promo Code Validator/Applier
//
// A code that does not apply is a normal negative result carrying display-ready
// reasons. Only a missing code string is an error; store faults propagate so the
// caller can decide how to degrade.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::promotions::{
    error::{PResult, PromotionError},
    metrics::{Operation, PerformanceMetrics},
    models::{normalize_code, PromoCode},
    pricing::{apportion, PricingMode},
    store::{bounded, PromotionStore},
    types::{format_rupees, Discount, PromoCodeType, PromotionRef},
};

pub const REASON_NOT_FOUND: &str = "Promo code not found";
pub const REASON_INACTIVE: &str = "Promo code is not active";
pub const REASON_NOT_STARTED: &str = "Promo code is not valid yet";
pub const REASON_EXPIRED: &str = "Promo code expired";
pub const REASON_EXHAUSTED: &str = "Promo code usage limit reached";
pub const REASON_USER_LIMIT: &str = "You have already used this promo code the maximum number of times";
pub const REASON_SIGN_IN: &str = "Sign in to use this promo code";
pub const REASON_NOT_STACKABLE: &str = "Promo code is not stackable with active event";

/// A line the code may discount, valued after regular and event discounts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoLine {
    pub line_index: usize,
    pub product_id: i32,
    pub amount: Decimal,
    pub has_event_discount: bool,
}

/// Order facts the code is validated against
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromoOrderContext {
    /// Subtotal after regular and event discounts
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub customer_tier: Option<String>,
    pub lines: Vec<PromoLine>,

    /// Promotions already in the ledger for this order; their rows do not count
    /// against the code's limits
    #[serde(default)]
    pub recorded: Vec<PromotionRef>,
}

impl PromoOrderContext {
    fn own_usage(&self, promo: &PromoCode) -> i64 {
        let promotion = PromotionRef::PromoCode(promo.id);
        self.recorded.iter().filter(|p| **p == promotion).count() as i64
    }
}

/// A line's share of the code's discount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPromoDiscount {
    pub line_index: usize,
    pub product_id: i32,
    pub amount: Decimal,
    pub excluded_reason: Option<String>,
}

/// Outcome of applying a promo code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoApplicationResult {
    pub code: String,
    pub promo_code_id: Option<i32>,
    pub promo_type: Option<PromoCodeType>,
    pub is_valid: bool,
    pub item_discounts: Vec<ItemPromoDiscount>,
    pub item_discount_total: Decimal,
    pub shipping_discount: Decimal,

    /// Display-ready failures, or notices when the code is valid
    pub reasons: Vec<String>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl PromoApplicationResult {
    /// Negative result with the given reasons
    pub fn rejected(code: &str, promo: Option<&PromoCode>, reasons: Vec<String>) -> Self {
        Self {
            code: normalize_code(code),
            promo_code_id: promo.map(|p| p.id),
            promo_type: promo.map(|p| p.promo_type),
            is_valid: false,
            item_discounts: Vec::new(),
            item_discount_total: Decimal::ZERO,
            shipping_discount: Decimal::ZERO,
            reasons,
            valid_until: promo.map(|p| p.end_date),
        }
    }

    pub fn total_discount(&self) -> Decimal {
        self.item_discount_total + self.shipping_discount
    }

    pub fn promotion(&self) -> Option<PromotionRef> {
        self.promo_code_id.filter(|_| self.is_valid).map(PromotionRef::PromoCode)
    }
}

/// Split of a valid code's discount between items and shipping
#[derive(Debug, Clone, PartialEq)]
pub struct PromoDiscountSplit {
    pub item_discounts: Vec<ItemPromoDiscount>,
    pub item_discount_total: Decimal,
    pub shipping_discount: Decimal,
    pub notices: Vec<String>,
}

/// Compute what a code is worth against the order
///
/// Free-shipping codes waive the shipping cost. Codes flagged for shipping discount the
/// shipping cost and never touch items. Otherwise the discount is taken from the lines
/// the code may stack with and split across them in proportion to their value.
pub fn split_discount(promo: &PromoCode, discount: Discount, context: &PromoOrderContext) -> PromoDiscountSplit {
    let mut split = PromoDiscountSplit {
        item_discounts: Vec::new(),
        item_discount_total: Decimal::ZERO,
        shipping_discount: Decimal::ZERO,
        notices: Vec::new(),
    };

    if discount == Discount::FreeShipping {
        split.shipping_discount = context.shipping_cost.max(Decimal::ZERO);
        return split;
    }
    if promo.apply_to_shipping {
        split.shipping_discount = discount.amount_off(context.shipping_cost);
        return split;
    }

    let (qualifying, excluded): (Vec<&PromoLine>, Vec<&PromoLine>) = context
        .lines
        .iter()
        .partition(|line| promo.stackable_with_events || !line.has_event_discount);

    let base: Decimal = qualifying.iter().map(|line| line.amount.max(Decimal::ZERO)).sum();
    let total = discount.amount_off(base);
    let weights: Vec<Decimal> = qualifying.iter().map(|line| line.amount).collect();
    let shares = if total.is_zero() {
        vec![Decimal::ZERO; qualifying.len()]
    } else {
        apportion(total, &weights)
    };

    for (line, amount) in qualifying.iter().zip(shares) {
        split.item_discounts.push(ItemPromoDiscount {
            line_index: line.line_index,
            product_id: line.product_id,
            amount,
            excluded_reason: None,
        });
    }
    for line in &excluded {
        split.item_discounts.push(ItemPromoDiscount {
            line_index: line.line_index,
            product_id: line.product_id,
            amount: Decimal::ZERO,
            excluded_reason: Some(REASON_NOT_STACKABLE.to_string()),
        });
    }
    split.item_discounts.sort_by_key(|item| item.line_index);
    split.item_discount_total = total;

    if !excluded.is_empty() {
        split.notices.push(format!("{} on {} item(s)", REASON_NOT_STACKABLE, excluded.len()));
    }
    split
}

/// Validates codes against the store and the order
pub struct PromoCodeValidator {
    store: Arc<dyn PromotionStore>,
    metrics: PerformanceMetrics,
    store_timeout: Duration,
}

impl PromoCodeValidator {
    pub fn new(store: Arc<dyn PromotionStore>, metrics: PerformanceMetrics, store_timeout: Duration) -> Self {
        Self {
            store,
            metrics,
            store_timeout,
        }
    }

    /// Validate `code` for the order and compute its discount
    ///
    /// Existence, activity and date checks always stop at the first failure. The
    /// remaining checks are all collected in preview and stop at the first failure
    /// at checkout.
    pub async fn apply(
        &self,
        code: &str,
        user_id: Option<i32>,
        context: &PromoOrderContext,
        now: DateTime<Utc>,
        mode: PricingMode,
    ) -> PResult<PromoApplicationResult> {
        let _timer = self.metrics.start(Operation::PromoValidation);

        let normalized = normalize_code(code);
        if normalized.is_empty() {
            return Err(PromotionError::ValidationError("Promo code is required".to_string()));
        }

        let found = bounded(
            self.store_timeout,
            "find_promo_code_by_code",
            self.store.find_promo_code_by_code(&normalized),
        )
        .await?;

        let mut promo = match found {
            Some(promo) if !promo.is_deleted && promo.matches_code(&normalized) => promo,
            _ => {
                tracing::debug!("Promo code {} not found", normalized);
                return Ok(PromoApplicationResult::rejected(
                    &normalized,
                    None,
                    vec![REASON_NOT_FOUND.to_string()],
                ));
            }
        };

        if let Some(reason) = Self::unrecoverable_failure(&promo, now) {
            return Ok(PromoApplicationResult::rejected(&normalized, Some(&promo), vec![reason]));
        }

        let discount = match promo.discount() {
            Ok(discount) => discount,
            Err(e) => {
                return Ok(PromoApplicationResult::rejected(&normalized, Some(&promo), vec![e.to_string()]));
            }
        };

        let own = context.own_usage(&promo);
        promo.current_usage_count -= i32::try_from(own).unwrap_or(i32::MAX);

        let stop_early = mode == PricingMode::Checkout;
        let mut failures = Self::order_failures(&promo, context, stop_early);

        if failures.is_empty() || !stop_early {
            if let Some(reason) = self.user_limit_failure(&promo, user_id, own, mode).await? {
                failures.push(reason);
            }
        }

        if !failures.is_empty() {
            tracing::debug!("Promo code {} rejected: {:?}", normalized, failures);
            return Ok(PromoApplicationResult::rejected(&normalized, Some(&promo), failures));
        }

        let split = split_discount(&promo, discount, context);
        tracing::debug!(
            "Promo code {} applied: items {}, shipping {}",
            normalized,
            split.item_discount_total,
            split.shipping_discount
        );

        Ok(PromoApplicationResult {
            code: normalized,
            promo_code_id: Some(promo.id),
            promo_type: Some(promo.promo_type),
            is_valid: true,
            item_discounts: split.item_discounts,
            item_discount_total: split.item_discount_total,
            shipping_discount: split.shipping_discount,
            reasons: split.notices,
            valid_until: Some(promo.end_date),
        })
    }

    /// Activity and date checks, which no other input can fix
    fn unrecoverable_failure(promo: &PromoCode, now: DateTime<Utc>) -> Option<String> {
        if !promo.is_active {
            return Some(REASON_INACTIVE.to_string());
        }
        if now < promo.start_date {
            return Some(REASON_NOT_STARTED.to_string());
        }
        if now > promo.end_date {
            return Some(REASON_EXPIRED.to_string());
        }
        None
    }

    /// Minimum order, tier and global usage checks
    fn order_failures(promo: &PromoCode, context: &PromoOrderContext, stop_early: bool) -> Vec<String> {
        let mut failures = Vec::new();

        if let Some(min) = promo.min_order_amount {
            if context.subtotal < min {
                failures.push(format!("Minimum order {} not met", format_rupees(min)));
                if stop_early {
                    return failures;
                }
            }
        }

        if let Some(required) = promo.customer_tier.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let matches = context
                .customer_tier
                .as_deref()
                .map_or(false, |tier| tier.trim().eq_ignore_ascii_case(required));
            if !matches {
                failures.push(format!("Promo code is only available to {} customers", required));
                if stop_early {
                    return failures;
                }
            }
        }

        if promo.is_globally_exhausted() {
            failures.push(REASON_EXHAUSTED.to_string());
        }

        failures
    }

    /// Per-user limit, read from the ledger rather than any cache
    async fn user_limit_failure(
        &self,
        promo: &PromoCode,
        user_id: Option<i32>,
        own: i64,
        mode: PricingMode,
    ) -> PResult<Option<String>> {
        let Some(max) = promo.max_usage_per_user else {
            return Ok(None);
        };
        let Some(user_id) = user_id else {
            return Ok(match mode {
                PricingMode::Checkout => Some(REASON_SIGN_IN.to_string()),
                PricingMode::Preview => None,
            });
        };

        let used = bounded(
            self.store_timeout,
            "count_user_usage",
            self.store.count_user_usage(PromotionRef::PromoCode(promo.id), user_id),
        )
        .await?;

        Ok((used - own >= i64::from(max)).then(|| REASON_USER_LIMIT.to_string()))
    }
}
