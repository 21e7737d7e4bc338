// Shipping Cost Calculator
//
// Derives base cost, free-shipping eligibility and surcharges from the active
// configuration. Surcharges are added even when the base cost is waived.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock;
use crate::promotions::{
    cache::{self, Cache, SHIPPING_CONFIG_KEY},
    error::PResult,
    metrics::{Operation, PerformanceMetrics},
    models::{Coordinates, ShippingConfiguration},
    store::{bounded, ShippingStore},
};

/// Fixed civil holidays as (month, day)
const HOLIDAYS: [(u32, u32); 7] = [
    (1, 11),  // Prithvi Jayanti
    (2, 19),  // Democracy Day
    (3, 8),   // Women's Day
    (5, 1),   // Labour Day
    (5, 28),  // Republic Day
    (9, 19),  // Constitution Day
    (12, 25), // Christmas
];

pub fn is_holiday(date: NaiveDate) -> bool {
    HOLIDAYS.contains(&(date.month(), date.day()))
}

/// Why the base cost was waived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreeShippingReason {
    Promotion,
    Threshold,
}

/// Shipping inputs for one order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShippingRequest {
    pub subtotal: Decimal,
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub rush: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingResult {
    pub available: bool,
    pub unavailable_reason: Option<String>,
    pub configuration_id: Option<i32>,
    pub base_cost: Decimal,
    pub is_free_shipping: bool,
    pub free_shipping_reason: Option<FreeShippingReason>,
    pub weekend_surcharge: Decimal,
    pub holiday_surcharge: Decimal,
    pub rush_surcharge: Decimal,
    pub total_surcharge: Decimal,
    pub shipping_cost: Decimal,
    pub estimated_delivery_days: Option<i32>,
    pub estimated_delivery_date: Option<NaiveDate>,
    pub distance_km: Option<f64>,

    /// The configuration could not be read
    pub degraded: bool,
}

impl ShippingResult {
    pub fn unavailable(reason: impl Into<String>, configuration_id: Option<i32>, degraded: bool) -> Self {
        Self {
            available: false,
            unavailable_reason: Some(reason.into()),
            configuration_id,
            base_cost: Decimal::ZERO,
            is_free_shipping: false,
            free_shipping_reason: None,
            weekend_surcharge: Decimal::ZERO,
            holiday_surcharge: Decimal::ZERO,
            rush_surcharge: Decimal::ZERO,
            total_surcharge: Decimal::ZERO,
            shipping_cost: Decimal::ZERO,
            estimated_delivery_days: None,
            estimated_delivery_date: None,
            distance_km: None,
            degraded,
        }
    }
}

/// Pure shipping computation against one configuration
pub fn compute_shipping(
    config: &ShippingConfiguration,
    request: &ShippingRequest,
    now: DateTime<Utc>,
) -> ShippingResult {
    let distance_km = request
        .coordinates
        .filter(Coordinates::is_valid)
        .map(|c| config.service_center().distance_km(&c));

    if config.require_location_validation {
        let Some(coordinates) = request.coordinates else {
            return ShippingResult::unavailable("Delivery location is required", Some(config.id), false);
        };
        if !coordinates.is_valid() {
            return ShippingResult::unavailable("Delivery location is invalid", Some(config.id), false);
        }
        if let (Some(max), Some(distance)) = (config.max_delivery_distance_km, distance_km) {
            if distance > max {
                return ShippingResult::unavailable(
                    format!("Delivery location is {:.1} km away, beyond the {:.0} km service area", distance, max),
                    Some(config.id),
                    false,
                );
            }
        }
    }

    let free_shipping_reason = if config.is_free_shipping_promotion_live(now) {
        Some(FreeShippingReason::Promotion)
    } else if matches!(config.free_shipping_threshold, Some(threshold) if request.subtotal >= threshold) {
        Some(FreeShippingReason::Threshold)
    } else {
        None
    };

    let base_cost = match free_shipping_reason {
        Some(_) => Decimal::ZERO,
        None if request.subtotal < config.low_order_threshold => config.low_order_shipping_cost,
        None => config.high_order_shipping_cost,
    };

    let weekend_surcharge = if clock::is_local_weekend(now) {
        config.weekend_surcharge
    } else {
        Decimal::ZERO
    };
    let holiday_surcharge = if is_holiday(clock::local_date(now)) {
        config.holiday_surcharge
    } else {
        Decimal::ZERO
    };
    let rush_surcharge = if request.rush {
        config.rush_delivery_surcharge
    } else {
        Decimal::ZERO
    };
    let total_surcharge = weekend_surcharge + holiday_surcharge + rush_surcharge;

    let days = if request.rush {
        (config.estimated_delivery_days - 1).max(1)
    } else {
        config.estimated_delivery_days.max(1)
    };

    ShippingResult {
        available: true,
        unavailable_reason: None,
        configuration_id: Some(config.id),
        base_cost,
        is_free_shipping: free_shipping_reason.is_some(),
        free_shipping_reason,
        weekend_surcharge,
        holiday_surcharge,
        rush_surcharge,
        total_surcharge,
        shipping_cost: (base_cost + total_surcharge).max(Decimal::ZERO),
        estimated_delivery_days: Some(days),
        estimated_delivery_date: Some(clock::local_date(now) + ChronoDuration::days(i64::from(days))),
        distance_km,
        degraded: false,
    }
}

/// Loads the active configuration (cached) and computes shipping
pub struct ShippingCalculator {
    store: Arc<dyn ShippingStore>,
    cache: Option<Arc<dyn Cache>>,
    metrics: PerformanceMetrics,
    cache_ttl: Duration,
    store_timeout: Duration,
}

impl ShippingCalculator {
    pub fn new(
        store: Arc<dyn ShippingStore>,
        cache: Option<Arc<dyn Cache>>,
        metrics: PerformanceMetrics,
        cache_ttl: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            metrics,
            cache_ttl,
            store_timeout,
        }
    }

    /// Active configuration, served from the cache when allowed
    pub async fn active_configuration(&self, use_cache: bool) -> PResult<Option<ShippingConfiguration>> {
        let cache = if use_cache { self.cache.as_deref() } else { None };

        if let Some(config) =
            cache::get_json::<ShippingConfiguration>(cache, SHIPPING_CONFIG_KEY, &self.metrics).await
        {
            return Ok(Some(config));
        }

        let config = bounded(
            self.store_timeout,
            "get_active_configuration",
            self.store.get_active_configuration(),
        )
        .await?;
        if let Some(config) = &config {
            cache::put_json(cache, SHIPPING_CONFIG_KEY, config, self.cache_ttl).await;
        }
        Ok(config)
    }

    /// Drop the cached configuration after an admin change
    pub async fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate(SHIPPING_CONFIG_KEY).await {
                tracing::warn!("Failed to invalidate shipping cache: {}", e);
            }
        }
    }

    /// Shipping for an already-loaded configuration lookup
    pub fn calculate_with(
        &self,
        config: PResult<Option<ShippingConfiguration>>,
        request: &ShippingRequest,
        now: DateTime<Utc>,
    ) -> ShippingResult {
        let _timer = self.metrics.start(Operation::ShippingCalculation);

        match config {
            Ok(Some(config)) => compute_shipping(&config, request, now),
            Ok(None) => {
                tracing::warn!("No active shipping configuration");
                self.metrics.record_degraded();
                ShippingResult::unavailable("Shipping is not configured", None, true)
            }
            Err(e) => {
                tracing::warn!("Shipping configuration unavailable: {}", e);
                self.metrics.record_degraded();
                ShippingResult::unavailable("Shipping cost is temporarily unavailable", None, true)
            }
        }
    }

    /// Load the configuration and compute shipping; never fails
    pub async fn calculate(&self, request: &ShippingRequest, now: DateTime<Utc>, use_cache: bool) -> ShippingResult {
        let config = self.active_configuration(use_cache).await;
        self.calculate_with(config, request, now)
    }
}
