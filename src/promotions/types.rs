// Domain type definitions for the Promotion & Pricing engine
// Provides shared enums and the discount tagged union used across components

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::promotions::error::{PResult, PromotionError};

/// Discount shape of a promotion event or event rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PromotionType {
    /// Discount is a percentage of the price (e.g., 10 = 10% off)
    Percentage,

    /// Discount is a fixed amount subtracted from the price
    FixedAmount,
}

impl fmt::Display for PromotionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromotionType::Percentage => write!(f, "percentage"),
            PromotionType::FixedAmount => write!(f, "fixed_amount"),
        }
    }
}

/// Lifecycle status of a promotion event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Draft,
    Active,
    Paused,
    Expired,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Draft => write!(f, "draft"),
            EventStatus::Active => write!(f, "active"),
            EventStatus::Paused => write!(f, "paused"),
            EventStatus::Expired => write!(f, "expired"),
        }
    }
}

impl Default for EventStatus {
    fn default() -> Self {
        EventStatus::Draft
    }
}

/// What an event rule targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuleTargetType {
    Product,
    Category,
    Subcategory,
    Global,
}

impl fmt::Display for RuleTargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleTargetType::Product => write!(f, "product"),
            RuleTargetType::Category => write!(f, "category"),
            RuleTargetType::Subcategory => write!(f, "subcategory"),
            RuleTargetType::Global => write!(f, "global"),
        }
    }
}

/// Discount shape of a promo code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PromoCodeType {
    Percentage,
    FixedAmount,
    FreeShipping,

    /// Reserved in the data model; rejected at validation
    BuyXGetY,
}

impl fmt::Display for PromoCodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromoCodeType::Percentage => write!(f, "percentage"),
            PromoCodeType::FixedAmount => write!(f, "fixed_amount"),
            PromoCodeType::FreeShipping => write!(f, "free_shipping"),
            PromoCodeType::BuyXGetY => write!(f, "buy_x_get_y"),
        }
    }
}

/// How a product matched an event
///
/// Ordered from least to most specific; the derived `Ord` is used for tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Global,
    Category,
    Subcategory,
    ProductRule,
    DirectProduct,
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchKind::Global => write!(f, "global"),
            MatchKind::Category => write!(f, "category"),
            MatchKind::Subcategory => write!(f, "subcategory"),
            MatchKind::ProductRule => write!(f, "product_rule"),
            MatchKind::DirectProduct => write!(f, "direct_product"),
        }
    }
}

impl From<RuleTargetType> for MatchKind {
    fn from(target: RuleTargetType) -> Self {
        match target {
            RuleTargetType::Product => MatchKind::ProductRule,
            RuleTargetType::Category => MatchKind::Category,
            RuleTargetType::Subcategory => MatchKind::Subcategory,
            RuleTargetType::Global => MatchKind::Global,
        }
    }
}

/// Which ledger a usage record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PromotionKind {
    Event,
    PromoCode,
}

/// Reference to a promotion whose usage is accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PromotionRef {
    Event(i32),
    PromoCode(i32),
}

impl PromotionRef {
    pub fn kind(&self) -> PromotionKind {
        match self {
            PromotionRef::Event(_) => PromotionKind::Event,
            PromotionRef::PromoCode(_) => PromotionKind::PromoCode,
        }
    }

    pub fn id(&self) -> i32 {
        match self {
            PromotionRef::Event(id) | PromotionRef::PromoCode(id) => *id,
        }
    }

    pub fn from_parts(kind: PromotionKind, id: i32) -> Self {
        match kind {
            PromotionKind::Event => PromotionRef::Event(id),
            PromotionKind::PromoCode => PromotionRef::PromoCode(id),
        }
    }
}

impl fmt::Display for PromotionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromotionRef::Event(id) => write!(f, "event:{}", id),
            PromotionRef::PromoCode(id) => write!(f, "promo_code:{}", id),
        }
    }
}

/// A discount with exactly the fields its kind needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Discount {
    Percentage {
        percent: Decimal,
        max_discount: Option<Decimal>,
    },
    FixedAmount {
        amount: Decimal,
    },
    FreeShipping,
}

impl Discount {
    /// Build an event-side discount from its stored columns
    pub fn from_promotion(
        promotion_type: PromotionType,
        value: Decimal,
        max_discount: Option<Decimal>,
    ) -> Self {
        match promotion_type {
            PromotionType::Percentage => Discount::Percentage {
                percent: value,
                max_discount,
            },
            PromotionType::FixedAmount => Discount::FixedAmount { amount: value },
        }
    }

    /// Build a promo-code discount from its stored columns
    pub fn from_promo_code(
        promo_type: PromoCodeType,
        value: Decimal,
        max_discount: Option<Decimal>,
    ) -> PResult<Self> {
        match promo_type {
            PromoCodeType::Percentage => Ok(Discount::Percentage {
                percent: value,
                max_discount,
            }),
            PromoCodeType::FixedAmount => Ok(Discount::FixedAmount { amount: value }),
            PromoCodeType::FreeShipping => Ok(Discount::FreeShipping),
            PromoCodeType::BuyXGetY => Err(PromotionError::UnsupportedPromotionType(
                PromoCodeType::BuyXGetY.to_string(),
            )),
        }
    }

    /// Discount amount against `amount`
    ///
    /// Result is rounded to currency precision and clamped to `[0, amount]`.
    /// `FreeShipping` yields nothing against item amounts.
    pub fn amount_off(&self, amount: Decimal) -> Decimal {
        if amount <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let raw = match self {
            Discount::Percentage { percent, max_discount } => {
                let computed = round_currency(amount * *percent / Decimal::ONE_HUNDRED);
                match max_discount {
                    Some(cap) if *cap >= Decimal::ZERO => computed.min(*cap),
                    _ => computed,
                }
            }
            Discount::FixedAmount { amount: fixed } => *fixed,
            Discount::FreeShipping => Decimal::ZERO,
        };

        raw.max(Decimal::ZERO).min(amount)
    }
}

/// Round to two decimal places, midpoint away from zero
pub fn round_currency(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Format an amount the way customer-facing messages show it
pub fn format_rupees(amount: Decimal) -> String {
    format!("Rs.{}", amount.normalize())
}
