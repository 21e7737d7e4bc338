// Collaborator contracts consumed by the engine
//
// Implementations must make `record_usage` atomic: the ledger insert and the conditional
// counter increment either both happen or neither does. The engine never holds counter
// state of its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::promotions::{
    error::{PResult, PromotionError},
    models::{EventRule, PromoCode, PromotionEvent, ShippingConfiguration, UsageRecord},
    types::PromotionRef,
};

/// Usage to be written to the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUsage {
    pub promotion: PromotionRef,
    pub user_id: i32,
    pub order_id: Uuid,
    pub discount_amount: Decimal,
}

/// Outcome of a ledger write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Ledger row inserted and counters incremented
    Recorded(UsageRecord),

    /// A row for this (promotion, order) already existed; nothing changed
    AlreadyRecorded(UsageRecord),
}

impl RecordOutcome {
    pub fn record(&self) -> &UsageRecord {
        match self {
            RecordOutcome::Recorded(record) | RecordOutcome::AlreadyRecorded(record) => record,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, RecordOutcome::Recorded(_))
    }
}

/// Whose limits apply to a pricing run, and what the order has already recorded
///
/// Re-pricing a confirmed order must not count the order's own ledger rows against
/// the limits they were admitted under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderScope {
    pub user_id: Option<i32>,

    /// Promotions in the ledger for the order being priced
    pub recorded: Vec<PromotionRef>,
}

impl OrderScope {
    pub fn for_user(user_id: Option<i32>) -> Self {
        Self {
            user_id,
            recorded: Vec::new(),
        }
    }

    pub fn from_records(user_id: Option<i32>, records: &[UsageRecord]) -> Self {
        Self {
            user_id,
            recorded: records.iter().map(UsageRecord::promotion).collect(),
        }
    }

    /// Ledger rows of this order for `promotion`
    pub fn own_usage(&self, promotion: PromotionRef) -> i64 {
        self.recorded.iter().filter(|p| **p == promotion).count() as i64
    }
}

/// Ledger rows removed when an order's usage was reversed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversalResult {
    pub order_id: Uuid,
    pub reversed: Vec<UsageRecord>,
}

impl ReversalResult {
    pub fn is_noop(&self) -> bool {
        self.reversed.is_empty()
    }
}

/// Source of truth for promotions and the usage ledger
#[async_trait]
pub trait PromotionStore: Send + Sync {
    /// Enabled, non-deleted events whose date range covers `instant` and that may
    /// apply to one of the products or categories. Direct product links are loaded;
    /// rules are fetched separately through `find_event_rules`.
    async fn find_active_events(
        &self,
        product_ids: &[i32],
        category_ids: &[i32],
        instant: DateTime<Utc>,
    ) -> PResult<Vec<PromotionEvent>>;

    async fn find_event_rules(&self, event_id: i32) -> PResult<Vec<EventRule>>;

    /// Lookup by normalized code; soft-deleted codes are still returned
    async fn find_promo_code_by_code(&self, code: &str) -> PResult<Option<PromoCode>>;

    /// Ledger rows for (promotion, user)
    async fn count_user_usage(&self, promotion: PromotionRef, user_id: i32) -> PResult<i64>;

    /// Idempotent per (promotion, order); fails with `ConcurrencyConflict` when a
    /// global or per-user limit would be exceeded
    async fn record_usage(&self, usage: &NewUsage) -> PResult<RecordOutcome>;

    /// Remove every ledger row for the order and decrement the counters they added
    async fn reverse_usage(&self, order_id: Uuid) -> PResult<ReversalResult>;

    async fn find_usage_by_order(&self, order_id: Uuid) -> PResult<Vec<UsageRecord>>;
}

/// Source of truth for shipping configuration
#[async_trait]
pub trait ShippingStore: Send + Sync {
    /// Active+default configuration, else the most recently updated active one
    async fn get_active_configuration(&self) -> PResult<Option<ShippingConfiguration>>;
}

/// Run a store call with a deadline; an elapsed deadline drops the call and
/// reports the store as unavailable
pub async fn bounded<T, F>(limit: Duration, operation: &str, call: F) -> PResult<T>
where
    F: Future<Output = PResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(PromotionError::UpstreamUnavailable(format!(
            "{} timed out after {}ms",
            operation,
            limit.as_millis()
        ))),
    }
}
