// In-process store implementations
//
// Every mutation runs under a single lock, which gives the same all-or-nothing behavior
// as the conditional UPDATE used by the PostgreSQL store. Used for tests and for running
// the service without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::promotions::{
    error::{PResult, PromotionError},
    models::{normalize_code, EventRule, PromoCode, PromotionEvent, ShippingConfiguration, UsageRecord},
    store::{NewUsage, PromotionStore, RecordOutcome, ReversalResult, ShippingStore},
    types::{PromotionRef, RuleTargetType},
};

#[derive(Debug, Default)]
struct MemoryState {
    events: BTreeMap<i32, PromotionEvent>,
    rules: BTreeMap<i32, Vec<EventRule>>,
    promo_codes: BTreeMap<i32, PromoCode>,
    usages: Vec<UsageRecord>,
}

impl MemoryState {
    /// (current count, global limit, per-user limit) for a promotion
    fn limits(&self, promotion: PromotionRef) -> Option<(i32, Option<i32>, Option<i32>)> {
        match promotion {
            PromotionRef::Event(id) => self
                .events
                .get(&id)
                .map(|e| (e.current_usage_count, e.max_usage_count, e.max_usage_per_user)),
            PromotionRef::PromoCode(id) => self
                .promo_codes
                .get(&id)
                .map(|p| (p.current_usage_count, p.max_total_usage, p.max_usage_per_user)),
        }
    }

    fn adjust_counter(&mut self, promotion: PromotionRef, delta: i32) {
        let counter = match promotion {
            PromotionRef::Event(id) => self.events.get_mut(&id).map(|e| &mut e.current_usage_count),
            PromotionRef::PromoCode(id) => {
                self.promo_codes.get_mut(&id).map(|p| &mut p.current_usage_count)
            }
        };
        if let Some(counter) = counter {
            *counter = (*counter + delta).max(0);
        }
    }
}

/// Simulated collaborator faults
#[derive(Debug, Default)]
struct FaultInjection {
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl FaultInjection {
    async fn check(&self) -> PResult<()> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(PromotionError::UpstreamUnavailable(
                "In-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

/// Promotion store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryPromotionStore {
    state: Mutex<MemoryState>,
    faults: FaultInjection,
}

impl InMemoryPromotionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an event; its `rules` are moved to the rule table
    pub async fn insert_event(&self, mut event: PromotionEvent) {
        let rules = std::mem::take(&mut event.rules);
        let mut state = self.state.lock().await;
        state.rules.insert(event.id, rules);
        state.events.insert(event.id, event);
    }

    pub async fn insert_promo_code(&self, promo_code: PromoCode) {
        let mut state = self.state.lock().await;
        state.promo_codes.insert(promo_code.id, promo_code);
    }

    pub async fn event(&self, id: i32) -> Option<PromotionEvent> {
        self.state.lock().await.events.get(&id).cloned()
    }

    pub async fn promo_code(&self, id: i32) -> Option<PromoCode> {
        self.state.lock().await.promo_codes.get(&id).cloned()
    }

    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.state.lock().await.usages.clone()
    }

    /// Make every call fail with `UpstreamUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }
}

fn rule_may_apply(rule: &EventRule, product_ids: &[i32], category_ids: &[i32]) -> bool {
    let target = rule.target_value.as_deref().and_then(|v| v.trim().parse::<i32>().ok());
    match rule.target_type {
        RuleTargetType::Global => true,
        RuleTargetType::Product => target.map_or(false, |id| product_ids.contains(&id)),
        RuleTargetType::Category | RuleTargetType::Subcategory => {
            target.map_or(false, |id| category_ids.contains(&id))
        }
    }
}

#[async_trait]
impl PromotionStore for InMemoryPromotionStore {
    async fn find_active_events(
        &self,
        product_ids: &[i32],
        category_ids: &[i32],
        instant: DateTime<Utc>,
    ) -> PResult<Vec<PromotionEvent>> {
        self.faults.check().await?;
        let state = self.state.lock().await;

        let events = state
            .events
            .values()
            .filter(|event| event.is_active && !event.is_deleted)
            .filter(|event| event.start_date <= instant && instant <= event.end_date)
            .filter(|event| {
                let direct = event
                    .products
                    .iter()
                    .any(|link| product_ids.contains(&link.product_id));
                let by_rule = state.rules.get(&event.id).map_or(false, |rules| {
                    rules.iter().any(|rule| rule_may_apply(rule, product_ids, category_ids))
                });
                direct || by_rule
            })
            .cloned()
            .collect();

        Ok(events)
    }

    async fn find_event_rules(&self, event_id: i32) -> PResult<Vec<EventRule>> {
        self.faults.check().await?;
        let state = self.state.lock().await;
        Ok(state.rules.get(&event_id).cloned().unwrap_or_default())
    }

    async fn find_promo_code_by_code(&self, code: &str) -> PResult<Option<PromoCode>> {
        self.faults.check().await?;
        let wanted = normalize_code(code);
        let state = self.state.lock().await;
        Ok(state
            .promo_codes
            .values()
            .find(|promo| promo.matches_code(&wanted))
            .cloned())
    }

    async fn count_user_usage(&self, promotion: PromotionRef, user_id: i32) -> PResult<i64> {
        self.faults.check().await?;
        let state = self.state.lock().await;
        Ok(state
            .usages
            .iter()
            .filter(|u| u.promotion() == promotion && u.user_id == user_id)
            .count() as i64)
    }

    async fn record_usage(&self, usage: &NewUsage) -> PResult<RecordOutcome> {
        self.faults.check().await?;
        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .usages
            .iter()
            .find(|u| u.promotion() == usage.promotion && u.order_id == usage.order_id)
        {
            return Ok(RecordOutcome::AlreadyRecorded(existing.clone()));
        }

        let (current, max_total, max_per_user) = state.limits(usage.promotion).ok_or_else(|| {
            PromotionError::ValidationError(format!("Unknown promotion {}", usage.promotion))
        })?;

        if let Some(max) = max_per_user {
            let used = state
                .usages
                .iter()
                .filter(|u| u.promotion() == usage.promotion && u.user_id == usage.user_id)
                .count();
            if used >= max.max(0) as usize {
                return Err(PromotionError::ConcurrencyConflict {
                    promotion: usage.promotion,
                    reason: "per-user usage limit reached".to_string(),
                });
            }
        }

        if matches!(max_total, Some(max) if current >= max) {
            return Err(PromotionError::ConcurrencyConflict {
                promotion: usage.promotion,
                reason: "usage limit reached".to_string(),
            });
        }

        let record = UsageRecord {
            id: Uuid::new_v4(),
            promotion_kind: usage.promotion.kind(),
            promotion_id: usage.promotion.id(),
            user_id: usage.user_id,
            order_id: usage.order_id,
            discount_amount: usage.discount_amount,
            created_at: Utc::now(),
        };
        state.adjust_counter(usage.promotion, 1);
        state.usages.push(record.clone());

        Ok(RecordOutcome::Recorded(record))
    }

    async fn reverse_usage(&self, order_id: Uuid) -> PResult<ReversalResult> {
        self.faults.check().await?;
        let mut state = self.state.lock().await;

        let (reversed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.usages)
            .into_iter()
            .partition(|u| u.order_id == order_id);
        state.usages = kept;

        for record in &reversed {
            state.adjust_counter(record.promotion(), -1);
        }

        Ok(ReversalResult { order_id, reversed })
    }

    async fn find_usage_by_order(&self, order_id: Uuid) -> PResult<Vec<UsageRecord>> {
        self.faults.check().await?;
        let state = self.state.lock().await;
        Ok(state
            .usages
            .iter()
            .filter(|u| u.order_id == order_id)
            .cloned()
            .collect())
    }
}

/// Shipping configuration kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryShippingStore {
    configurations: RwLock<Vec<ShippingConfiguration>>,
    faults: FaultInjection,
}

impl InMemoryShippingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, configuration: ShippingConfiguration) {
        let mut configurations = self.configurations.write().await;
        configurations.retain(|c| c.id != configuration.id);
        configurations.push(configuration);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::Relaxed);
    }
}

#[async_trait]
impl ShippingStore for InMemoryShippingStore {
    async fn get_active_configuration(&self) -> PResult<Option<ShippingConfiguration>> {
        self.faults.check().await?;
        let configurations = self.configurations.read().await;

        Ok(configurations
            .iter()
            .filter(|c| c.is_active)
            .max_by(|a, b| {
                a.is_default
                    .cmp(&b.is_default)
                    .then_with(|| a.updated_at.cmp(&b.updated_at))
            })
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promotions::test_support::{event, promo_code, shipping_config};
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_record_usage_is_idempotent_per_order() {
        let store = InMemoryPromotionStore::new();
        store.insert_promo_code(promo_code(1, "SAVE10")).await;

        let usage = NewUsage {
            promotion: PromotionRef::PromoCode(1),
            user_id: 5,
            order_id: Uuid::new_v4(),
            discount_amount: dec!(50),
        };

        let first = store.record_usage(&usage).await.unwrap();
        let second = store.record_usage(&usage).await.unwrap();

        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.record().id, second.record().id);
        assert_eq!(store.promo_code(1).await.unwrap().current_usage_count, 1);
    }

    #[tokio::test]
    async fn test_record_usage_enforces_per_user_limit() {
        let store = InMemoryPromotionStore::new();
        let mut promo = promo_code(1, "ONCE");
        promo.max_usage_per_user = Some(1);
        store.insert_promo_code(promo).await;

        let first = NewUsage {
            promotion: PromotionRef::PromoCode(1),
            user_id: 5,
            order_id: Uuid::new_v4(),
            discount_amount: dec!(10),
        };
        store.record_usage(&first).await.unwrap();

        let second = NewUsage { order_id: Uuid::new_v4(), ..first.clone() };
        let result = store.record_usage(&second).await;
        assert!(matches!(result, Err(PromotionError::ConcurrencyConflict { .. })));

        let other_user = NewUsage { user_id: 6, order_id: Uuid::new_v4(), ..first };
        assert!(store.record_usage(&other_user).await.is_ok());
    }

    #[tokio::test]
    async fn test_reverse_usage_restores_counters() {
        let store = InMemoryPromotionStore::new();
        store.insert_promo_code(promo_code(1, "SAVE10")).await;
        store.insert_event(event(2, 5)).await;
        let order_id = Uuid::new_v4();

        for promotion in [PromotionRef::PromoCode(1), PromotionRef::Event(2)] {
            store
                .record_usage(&NewUsage {
                    promotion,
                    user_id: 1,
                    order_id,
                    discount_amount: dec!(20),
                })
                .await
                .unwrap();
        }

        let result = store.reverse_usage(order_id).await.unwrap();
        assert_eq!(result.reversed.len(), 2);
        assert_eq!(store.promo_code(1).await.unwrap().current_usage_count, 0);
        assert_eq!(store.event(2).await.unwrap().current_usage_count, 0);

        let again = store.reverse_usage(order_id).await.unwrap();
        assert!(again.is_noop());
    }

    #[tokio::test]
    async fn test_find_active_events_filters_by_window_and_target() {
        let store = InMemoryPromotionStore::new();
        let now = Utc::now();

        let mut live = event(1, 5);
        live.start_date = now - ChronoDuration::hours(1);
        live.end_date = now + ChronoDuration::hours(1);
        store.insert_event(live).await;

        let mut future = event(2, 5);
        future.start_date = now + ChronoDuration::hours(1);
        future.end_date = now + ChronoDuration::hours(2);
        store.insert_event(future).await;

        let found = store.find_active_events(&[100], &[], now).await.unwrap();
        assert_eq!(found.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1]);

        let none = store.find_active_events(&[999], &[], now).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_reports_upstream_error() {
        let store = InMemoryPromotionStore::new();
        store.set_unavailable(true);
        let result = store.find_promo_code_by_code("ANY").await;
        assert!(matches!(result, Err(PromotionError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn test_shipping_store_prefers_default_then_most_recent() {
        let store = InMemoryShippingStore::new();
        let now = Utc::now();

        let mut older_default = shipping_config(1);
        older_default.is_default = true;
        older_default.updated_at = now - ChronoDuration::days(3);
        let mut newer = shipping_config(2);
        newer.updated_at = now;
        store.insert(older_default).await;
        store.insert(newer).await;

        let active = store.get_active_configuration().await.unwrap().unwrap();
        assert_eq!(active.id, 1);

        let mut retired = shipping_config(1);
        retired.is_active = false;
        store.insert(retired).await;
        let active = store.get_active_configuration().await.unwrap().unwrap();
        assert_eq!(active.id, 2);
    }
}
