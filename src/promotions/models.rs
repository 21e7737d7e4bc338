// Promotion data model
//
// Events own their rules and direct product associations by value; the rows refer back
// to the event only through `event_id`, never through pointers.

use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use crate::clock;
use crate::promotions::{
    error::{PResult, PromotionError},
    types::{
        Discount, EventStatus, MatchKind, PromoCodeType, PromotionKind, PromotionRef,
        PromotionType, RuleTargetType,
    },
};

/// Product identity plus the taxonomy used for rule matching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRef {
    pub product_id: i32,
    pub category_id: Option<i32>,
    pub subcategory_id: Option<i32>,
}

impl ProductRef {
    pub fn new(product_id: i32) -> Self {
        Self {
            product_id,
            category_id: None,
            subcategory_id: None,
        }
    }

    pub fn with_category(mut self, category_id: i32) -> Self {
        self.category_id = Some(category_id);
        self
    }

    pub fn with_subcategory(mut self, subcategory_id: i32) -> Self {
        self.subcategory_id = Some(subcategory_id);
        self
    }

    /// Category and subcategory ids, in that order
    pub fn category_ids(&self) -> Vec<i32> {
        self.category_id.into_iter().chain(self.subcategory_id).collect()
    }
}

/// Daily civil-time window during which an event is live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    /// Whether `time` falls inside the slot
    ///
    /// A slot whose end is before its start wraps past midnight (22:00-02:00).
    /// The start is inclusive and the end exclusive.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Time-bounded marketing discount, scoped by rules and direct product links
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromotionEvent {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub tagline: Option<String>,
    pub promotion_type: PromotionType,
    pub discount_value: Decimal,
    pub max_discount_amount: Option<Decimal>,
    pub min_order_value: Option<Decimal>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub time_slot_start: Option<NaiveTime>,
    pub time_slot_end: Option<NaiveTime>,
    pub priority: i32,
    pub max_usage_count: Option<i32>,
    pub max_usage_per_user: Option<i32>,
    pub current_usage_count: i32,
    pub status: EventStatus,
    pub is_active: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    #[sqlx(skip)]
    #[serde(default)]
    pub rules: Vec<EventRule>,
    #[sqlx(skip)]
    #[serde(default)]
    pub products: Vec<EventProduct>,
}

impl PromotionEvent {
    /// Daily window, present only when both ends are configured
    pub fn active_time_slot(&self) -> Option<TimeSlot> {
        match (self.time_slot_start, self.time_slot_end) {
            (Some(start), Some(end)) => Some(TimeSlot { start, end }),
            _ => None,
        }
    }

    /// `IsActive`, `Status` and `IsDeleted` all agree the event may run
    pub fn is_enabled(&self) -> bool {
        self.is_active && self.status == EventStatus::Active && !self.is_deleted
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.max_usage_count, Some(max) if self.current_usage_count >= max)
    }

    pub fn discount(&self) -> Discount {
        Discount::from_promotion(self.promotion_type, self.discount_value, self.max_discount_amount)
    }

    /// Move a draft or paused event to active after checking its dates
    pub fn activate(&mut self, now: DateTime<Utc>) -> PResult<()> {
        if self.is_deleted {
            return Err(PromotionError::ValidationError(format!(
                "Event {} has been deleted",
                self.id
            )));
        }
        if self.end_date <= self.start_date {
            return Err(PromotionError::ValidationError(
                "Event end date must be after its start date".to_string(),
            ));
        }
        if self.end_date < now {
            return Err(PromotionError::ValidationError(
                "Event end date is already in the past".to_string(),
            ));
        }

        self.status = EventStatus::Active;
        self.is_active = true;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.status = EventStatus::Paused;
        self.is_active = false;
    }

    /// Turn the event off; events past their end date are marked expired
    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        self.status = if self.end_date < now {
            EventStatus::Expired
        } else {
            EventStatus::Paused
        };
    }

    /// Events referenced by usage records are never removed, only hidden
    pub fn soft_delete(&mut self) {
        self.is_deleted = true;
        self.is_active = false;
    }
}

/// Targeting rule inside an event, with its own discount terms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct EventRule {
    pub id: i32,
    pub event_id: i32,
    pub target_type: RuleTargetType,
    pub target_value: Option<String>,
    pub promotion_type: PromotionType,
    pub discount_value: Decimal,
    pub max_discount_amount: Option<Decimal>,
    pub min_order_value: Option<Decimal>,
    pub priority: i32,
}

impl EventRule {
    /// How this rule matches `product`, if at all
    ///
    /// Returns an error when the target value cannot be interpreted.
    pub fn match_kind(&self, product: &ProductRef) -> PResult<Option<MatchKind>> {
        let target = match self.target_type {
            RuleTargetType::Global => return Ok(Some(MatchKind::Global)),
            RuleTargetType::Product => Some(product.product_id),
            RuleTargetType::Category => product.category_id,
            RuleTargetType::Subcategory => product.subcategory_id,
        };

        let wanted = self.target_id()?;
        Ok(match target {
            Some(id) if id == wanted => Some(self.target_type.into()),
            _ => None,
        })
    }

    fn target_id(&self) -> PResult<i32> {
        let raw = self.target_value.as_deref().map(str::trim).unwrap_or_default();
        raw.parse::<i32>().map_err(|_| {
            PromotionError::InvalidConfiguration(format!(
                "Rule {} has invalid {} target '{}'",
                self.id, self.target_type, raw
            ))
        })
    }

    pub fn discount(&self) -> Discount {
        Discount::from_promotion(self.promotion_type, self.discount_value, self.max_discount_amount)
    }
}

/// Direct product association that bypasses rule matching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct EventProduct {
    pub event_id: i32,
    pub product_id: i32,
    pub specific_discount: Option<Decimal>,
}

/// User-entered discount code
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromoCode {
    pub id: i32,
    pub code: String,
    pub description: Option<String>,
    pub promo_type: PromoCodeType,
    pub discount_value: Decimal,
    pub max_discount_amount: Option<Decimal>,
    pub min_order_amount: Option<Decimal>,
    pub max_total_usage: Option<i32>,
    pub max_usage_per_user: Option<i32>,
    pub current_usage_count: i32,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_active: bool,
    pub is_deleted: bool,
    pub apply_to_shipping: bool,
    pub stackable_with_events: bool,
    pub customer_tier: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PromoCode {
    /// Case-insensitive comparison after trimming
    pub fn matches_code(&self, candidate: &str) -> bool {
        self.code.trim().eq_ignore_ascii_case(candidate.trim())
    }

    pub fn discount(&self) -> PResult<Discount> {
        Discount::from_promo_code(self.promo_type, self.discount_value, self.max_discount_amount)
    }

    pub fn is_globally_exhausted(&self) -> bool {
        matches!(self.max_total_usage, Some(max) if self.current_usage_count >= max)
    }
}

/// Canonical form of a code for storage and lookup
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Admin input for creating a promo code; dates are Nepal civil time
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewPromoCode {
    #[validate(length(min = 3, max = 50, message = "Code must be 3-50 characters"))]
    pub code: String,
    pub description: Option<String>,
    pub promo_type: PromoCodeType,
    #[validate(range(min = 0.0, message = "Discount value must be non-negative"))]
    pub discount_value: f64,
    pub max_discount_amount: Option<Decimal>,
    pub min_order_amount: Option<Decimal>,
    #[validate(range(min = 1, message = "Total usage limit must be at least 1"))]
    pub max_total_usage: Option<i32>,
    #[validate(range(min = 1, message = "Per-user usage limit must be at least 1"))]
    pub max_usage_per_user: Option<i32>,
    pub start_date: String,
    pub end_date: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub apply_to_shipping: bool,
    #[serde(default)]
    pub stackable_with_events: bool,
    pub customer_tier: Option<String>,
}

fn default_true() -> bool {
    true
}

impl NewPromoCode {
    /// Validate the input and convert civil dates to UTC
    pub fn into_promo_code(self, id: i32, now: DateTime<Utc>) -> PResult<PromoCode> {
        self.validate()?;

        let start_date = clock::parse_local(&self.start_date)?;
        let end_date = clock::parse_local(&self.end_date)?;
        if end_date <= start_date {
            return Err(PromotionError::ValidationError(
                "Promo code end date must be after its start date".to_string(),
            ));
        }

        let discount_value = Decimal::try_from(self.discount_value).map_err(|_| {
            PromotionError::ValidationError(format!(
                "Invalid discount value: {}",
                self.discount_value
            ))
        })?;
        if self.promo_type == PromoCodeType::Percentage && discount_value > Decimal::ONE_HUNDRED {
            return Err(PromotionError::ValidationError(
                "Percentage discount cannot exceed 100%".to_string(),
            ));
        }

        Ok(PromoCode {
            id,
            code: normalize_code(&self.code),
            description: self.description,
            promo_type: self.promo_type,
            discount_value,
            max_discount_amount: self.max_discount_amount,
            min_order_amount: self.min_order_amount,
            max_total_usage: self.max_total_usage,
            max_usage_per_user: self.max_usage_per_user,
            current_usage_count: 0,
            start_date,
            end_date,
            is_active: self.is_active,
            is_deleted: false,
            apply_to_shipping: self.apply_to_shipping,
            stackable_with_events: self.stackable_with_events,
            customer_tier: self.customer_tier.map(|tier| tier.trim().to_string()),
            created_at: now,
        })
    }
}

/// One ledger row: a promotion applied to an order by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub id: Uuid,
    pub promotion_kind: PromotionKind,
    pub promotion_id: i32,
    pub user_id: i32,
    pub order_id: Uuid,
    pub discount_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn promotion(&self) -> PromotionRef {
        PromotionRef::from_parts(self.promotion_kind, self.promotion_id)
    }
}

/// Delivery location in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance in kilometres
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;

        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Default service centre (Kathmandu)
pub const DEFAULT_SERVICE_CENTER: Coordinates = Coordinates {
    latitude: 27.7172,
    longitude: 85.3240,
};

/// Shipping cost configuration; one active+default row is used at a time
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ShippingConfiguration {
    pub id: i32,
    pub name: String,
    pub is_active: bool,
    pub is_default: bool,
    pub low_order_threshold: Decimal,
    pub low_order_shipping_cost: Decimal,
    pub high_order_shipping_cost: Decimal,
    pub free_shipping_threshold: Option<Decimal>,
    pub is_free_shipping_active: bool,
    pub free_shipping_start_date: Option<DateTime<Utc>>,
    pub free_shipping_end_date: Option<DateTime<Utc>>,
    pub weekend_surcharge: Decimal,
    pub holiday_surcharge: Decimal,
    pub rush_delivery_surcharge: Decimal,
    pub estimated_delivery_days: i32,
    pub max_delivery_distance_km: Option<f64>,
    pub require_location_validation: bool,
    pub service_center_latitude: Option<f64>,
    pub service_center_longitude: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl ShippingConfiguration {
    pub fn service_center(&self) -> Coordinates {
        match (self.service_center_latitude, self.service_center_longitude) {
            (Some(latitude), Some(longitude)) => Coordinates { latitude, longitude },
            _ => DEFAULT_SERVICE_CENTER,
        }
    }

    /// Whether the time-bound free-shipping promotion covers `now`
    pub fn is_free_shipping_promotion_live(&self, now: DateTime<Utc>) -> bool {
        if !self.is_free_shipping_active {
            return false;
        }
        let started = self.free_shipping_start_date.map_or(true, |start| start <= now);
        let not_ended = self.free_shipping_end_date.map_or(true, |end| now <= end);
        started && not_ended
    }
}
