// Usage Accountant
//
// Records and reverses promotion usage at order confirmation and cancellation.
// Counter atomicity lives in the store; this layer holds no counters of its own.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::promotions::{
    error::{PResult, PromotionError},
    metrics::{Operation, PerformanceMetrics},
    models::UsageRecord,
    pricing::CartPricing,
    store::{bounded, NewUsage, PromotionStore, RecordOutcome},
    types::PromotionRef,
};

/// One promotion applied to an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub promotion: PromotionRef,
    pub discount_amount: Decimal,
}

/// Every promotion an order used
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUsage {
    pub order_id: Uuid,
    pub user_id: i32,
    pub entries: Vec<UsageEntry>,
}

impl OrderUsage {
    /// Usage implied by a checkout breakdown: one entry per applied event (summed
    /// over its lines) and one for a valid promo code
    pub fn from_pricing(order_id: Uuid, user_id: i32, pricing: &CartPricing) -> Self {
        let mut by_event: BTreeMap<i32, Decimal> = BTreeMap::new();
        for line in &pricing.lines {
            if let Some(event_id) = line.applied_event_id {
                *by_event.entry(event_id).or_default() += line.event_discount_amount;
            }
        }

        let mut entries: Vec<UsageEntry> = by_event
            .into_iter()
            .map(|(event_id, discount_amount)| UsageEntry {
                promotion: PromotionRef::Event(event_id),
                discount_amount,
            })
            .collect();

        if let Some(promotion) = pricing.promo.as_ref().and_then(|p| p.promotion()) {
            let discount_amount = pricing.promo_discount_total + pricing.shipping_discount;
            if discount_amount > Decimal::ZERO {
                entries.push(UsageEntry {
                    promotion,
                    discount_amount,
                });
            }
        }

        Self {
            order_id,
            user_id,
            entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn new_usage(&self, entry: &UsageEntry) -> NewUsage {
        NewUsage {
            promotion: entry.promotion,
            user_id: self.user_id,
            order_id: self.order_id,
            discount_amount: entry.discount_amount,
        }
    }
}

/// How much of an order's expected usage the ledger holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UsageStatus {
    Complete,
    Partial { missing: Vec<PromotionRef> },
    Absent,
}

/// Result of reversing an order's usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversalOutcome {
    pub order_id: Uuid,
    pub reversed: Vec<UsageRecord>,

    /// Every attempt failed; the ledger must be reconciled later
    pub needs_reconciliation: bool,
}

/// Records and reverses ledger entries through the store
pub struct UsageAccountant {
    store: Arc<dyn PromotionStore>,
    metrics: PerformanceMetrics,
    store_timeout: Duration,
    reversal_retries: u32,
    retry_backoff: Duration,
}

impl UsageAccountant {
    pub fn new(
        store: Arc<dyn PromotionStore>,
        metrics: PerformanceMetrics,
        store_timeout: Duration,
        reversal_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            store_timeout,
            reversal_retries,
            retry_backoff,
        }
    }

    /// Record one usage; idempotent per (promotion, order)
    pub async fn record_usage(&self, usage: &NewUsage) -> PResult<RecordOutcome> {
        if usage.discount_amount < Decimal::ZERO {
            return Err(PromotionError::ValidationError(
                "Usage discount amount cannot be negative".to_string(),
            ));
        }

        let outcome = bounded(self.store_timeout, "record_usage", self.store.record_usage(usage)).await?;
        if outcome.is_new() {
            tracing::info!(
                "Recorded usage of {} for order {} by user {}",
                usage.promotion,
                usage.order_id,
                usage.user_id
            );
        } else {
            tracing::debug!("Usage of {} for order {} already recorded", usage.promotion, usage.order_id);
        }
        Ok(outcome)
    }

    /// Record every entry of the order
    ///
    /// Store faults propagate and leave whatever was recorded in place; the caller
    /// retries and idempotency fills the gap. A limit conflict reverses the order's
    /// earlier entries so the order ends up with all of its usage or none.
    pub async fn confirm(&self, order: &OrderUsage) -> PResult<Vec<RecordOutcome>> {
        let _timer = self.metrics.start(Operation::UsageAccounting);
        let mut outcomes = Vec::with_capacity(order.entries.len());

        for entry in &order.entries {
            match self.record_usage(&order.new_usage(entry)).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e @ PromotionError::ConcurrencyConflict { .. }) => {
                    tracing::warn!("Order {} lost a usage race: {}", order.order_id, e);
                    if !outcomes.is_empty() {
                        let rollback = self.reverse(order.order_id).await;
                        if rollback.needs_reconciliation {
                            tracing::error!(
                                "Order {} holds partial usage after a conflict",
                                order.order_id
                            );
                        }
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "Usage for order {} recorded {} of {} entries before failing: {}",
                        order.order_id,
                        outcomes.len(),
                        order.entries.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }

        Ok(outcomes)
    }

    /// Ledger rows the order holds
    pub async fn recorded_for(&self, order_id: Uuid) -> PResult<Vec<UsageRecord>> {
        bounded(
            self.store_timeout,
            "find_usage_by_order",
            self.store.find_usage_by_order(order_id),
        )
        .await
    }

    /// Compare the ledger against the order's expected usage
    pub async fn status(&self, order: &OrderUsage) -> PResult<UsageStatus> {
        let records = self.recorded_for(order.order_id).await?;

        let missing: Vec<PromotionRef> = order
            .entries
            .iter()
            .map(|entry| entry.promotion)
            .filter(|promotion| !records.iter().any(|r| r.promotion() == *promotion))
            .collect();

        Ok(if missing.is_empty() {
            UsageStatus::Complete
        } else if missing.len() == order.entries.len() {
            UsageStatus::Absent
        } else {
            UsageStatus::Partial { missing }
        })
    }

    /// Reverse every ledger row of the order; never fails
    ///
    /// Retries with doubling backoff. When every attempt fails the outcome is marked
    /// for reconciliation and the cancellation proceeds.
    pub async fn reverse(&self, order_id: Uuid) -> ReversalOutcome {
        let _timer = self.metrics.start(Operation::UsageAccounting);
        let attempts = self.reversal_retries.max(1);
        let mut backoff = self.retry_backoff;

        for attempt in 1..=attempts {
            match bounded(self.store_timeout, "reverse_usage", self.store.reverse_usage(order_id)).await {
                Ok(result) => {
                    if result.is_noop() {
                        tracing::debug!("No usage to reverse for order {}", order_id);
                    } else {
                        tracing::info!("Reversed {} usage record(s) for order {}", result.reversed.len(), order_id);
                    }
                    return ReversalOutcome {
                        order_id,
                        reversed: result.reversed,
                        needs_reconciliation: false,
                    };
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        "Usage reversal for order {} failed (attempt {}/{}): {}",
                        order_id,
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    tracing::error!(
                        "Usage reversal for order {} failed after {} attempts, needs reconciliation: {}",
                        order_id,
                        attempts,
                        e
                    );
                }
            }
        }

        ReversalOutcome {
            order_id,
            reversed: Vec::new(),
            needs_reconciliation: true,
        }
    }
}
