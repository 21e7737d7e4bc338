// Service configuration loaded from the environment

use std::str::FromStr;
use std::time::Duration;

use crate::promotions::{EngineSettings, PResult, PromotionError};

/// Everything the binary needs to start
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,

    /// No cache is used when absent
    pub redis_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub preview_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub cart_reservation_ttl_secs: u64,
    pub shipping_cache_ttl_secs: u64,
    pub events_cache_ttl_secs: u64,
    pub usage_reversal_retries: u32,

    /// Period of the metrics summary log; 0 disables it
    pub metrics_log_interval_secs: u64,
}

impl AppConfig {
    /// Read the configuration from process environment variables
    pub fn from_env() -> PResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, so tests need not touch the process environment
    pub fn from_lookup<F>(lookup: F) -> PResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| PromotionError::InvalidConfiguration("DATABASE_URL must be set".to_string()))?;

        Ok(Self {
            database_url,
            redis_url: lookup("REDIS_URL").filter(|url| !url.trim().is_empty()),
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&lookup, "PORT", 8080)?,
            preview_timeout_ms: parse_or(&lookup, "PRICING_PREVIEW_TIMEOUT_MS", 800)?,
            store_timeout_ms: parse_or(&lookup, "STORE_TIMEOUT_MS", 3000)?,
            cart_reservation_ttl_secs: parse_or(&lookup, "CART_RESERVATION_TTL_SECS", 900)?,
            shipping_cache_ttl_secs: parse_or(&lookup, "SHIPPING_CACHE_TTL_SECS", 900)?,
            events_cache_ttl_secs: parse_or(&lookup, "EVENTS_CACHE_TTL_SECS", 60)?,
            usage_reversal_retries: parse_or(&lookup, "USAGE_REVERSAL_RETRIES", 3)?,
            metrics_log_interval_secs: parse_or(&lookup, "METRICS_LOG_INTERVAL_SECS", 300)?,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_log_interval(&self) -> Option<Duration> {
        (self.metrics_log_interval_secs > 0).then(|| Duration::from_secs(self.metrics_log_interval_secs))
    }

    /// Engine-facing subset
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            preview_timeout: Duration::from_millis(self.preview_timeout_ms),
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            cart_reservation_ttl: Duration::from_secs(self.cart_reservation_ttl_secs),
            shipping_cache_ttl: Duration::from_secs(self.shipping_cache_ttl_secs),
            events_cache_ttl: Duration::from_secs(self.events_cache_ttl_secs),
            usage_reversal_retries: self.usage_reversal_retries,
            ..EngineSettings::default()
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> PResult<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            PromotionError::InvalidConfiguration(format!("{} has an invalid value '{}'", key, raw))
        }),
        None => Ok(default),
    }
}
