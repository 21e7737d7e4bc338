// Event Eligibility Resolver
//
// Finds the single promotion event that applies to a product at an instant.
// Store faults and bad rule data never escape: the product simply gets no event,
// and store faults mark the resolution as degraded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock;
use crate::promotions::{
    cache::{self, Cache},
    error::{PResult, PromotionError},
    metrics::{Operation, PerformanceMetrics},
    models::{EventProduct, EventRule, ProductRef, PromotionEvent},
    store::{bounded, OrderScope, PromotionStore},
    types::{MatchKind, PromotionRef},
};

/// What made an event apply to a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MatchSource {
    Product(EventProduct),
    Rule(EventRule),
}

/// The event chosen for a product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMatch {
    pub event: PromotionEvent,
    pub kind: MatchKind,
    pub source: MatchSource,
}

impl EventMatch {
    pub fn event_id(&self) -> i32 {
        self.event.id
    }

    pub fn rule_id(&self) -> Option<i32> {
        match &self.source {
            MatchSource::Rule(rule) => Some(rule.id),
            MatchSource::Product(_) => None,
        }
    }
}

/// Outcome of resolving a set of products
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Chosen event per product id
    pub matches: HashMap<i32, EventMatch>,

    /// A store fault prevented resolution for at least one product
    pub degraded: bool,

    /// At least one candidate list came from the cache
    pub from_cache: bool,
}

impl Resolution {
    pub fn get(&self, product_id: i32) -> Option<&EventMatch> {
        self.matches.get(&product_id)
    }
}

/// Whether an event may run at `instant`, ignoring product targeting
///
/// Date range is inclusive at both ends; the daily slot is evaluated in Nepal civil time.
pub fn is_live(event: &PromotionEvent, instant: DateTime<Utc>) -> bool {
    if !event.is_enabled() || event.is_exhausted() {
        return false;
    }
    if instant < event.start_date || instant > event.end_date {
        return false;
    }
    match event.active_time_slot() {
        Some(slot) => slot.contains(clock::local_time_of_day(instant)),
        None => true,
    }
}

/// Most specific way `event` applies to `product`
///
/// A direct product link always wins. Otherwise the rule with the highest priority,
/// then the most specific target, then the lowest id is chosen.
fn best_match(event: &PromotionEvent, product: &ProductRef) -> PResult<Option<(MatchKind, MatchSource)>> {
    if let Some(link) = event
        .products
        .iter()
        .find(|link| link.product_id == product.product_id)
    {
        return Ok(Some((MatchKind::DirectProduct, MatchSource::Product(link.clone()))));
    }

    let mut best: Option<(MatchKind, &EventRule)> = None;
    for rule in &event.rules {
        let Some(kind) = rule.match_kind(product)? else {
            continue;
        };
        let better = match best {
            None => true,
            Some((best_kind, best_rule)) => {
                (rule.priority, kind, Reverse(rule.id))
                    > (best_rule.priority, best_kind, Reverse(best_rule.id))
            }
        };
        if better {
            best = Some((kind, rule));
        }
    }

    Ok(best.map(|(kind, rule)| (kind, MatchSource::Rule(rule.clone()))))
}

/// Pure selection over already-loaded candidates (rules attached)
///
/// Highest event priority wins, then the most specific match, then the lowest id.
/// Bad rule data or an event listed twice fails the whole selection.
pub fn select_event(
    product: &ProductRef,
    events: &[PromotionEvent],
    instant: DateTime<Utc>,
) -> PResult<Option<EventMatch>> {
    let mut candidates = Vec::new();
    for event in events.iter().filter(|event| is_live(event, instant)) {
        if let Some((kind, source)) = best_match(event, product)? {
            candidates.push((event, kind, source));
        }
    }

    candidates.sort_by_key(|(event, kind, _)| Reverse((event.priority, *kind, Reverse(event.id))));

    let mut ranked = candidates.into_iter();
    let Some((winner, kind, source)) = ranked.next() else {
        return Ok(None);
    };
    if let Some((runner_up, runner_kind, _)) = ranked.next() {
        if runner_up.id == winner.id {
            return Err(PromotionError::InvalidConfiguration(format!(
                "Event {} is listed twice for product {}",
                winner.id, product.product_id
            )));
        }
        if (runner_up.priority, runner_kind) == (winner.priority, kind) {
            tracing::debug!(
                "Events {} and {} tie for product {} at priority {} ({}); lowest id wins",
                winner.id,
                runner_up.id,
                product.product_id,
                winner.priority,
                kind
            );
        }
    }

    Ok(Some(EventMatch {
        event: winner.clone(),
        kind,
        source,
    }))
}

/// Resolves applicable events through the store, optionally via the cache
pub struct EventEligibilityResolver {
    store: Arc<dyn PromotionStore>,
    cache: Option<Arc<dyn Cache>>,
    metrics: PerformanceMetrics,
    events_ttl: Duration,
    store_timeout: Duration,
}

impl EventEligibilityResolver {
    pub fn new(
        store: Arc<dyn PromotionStore>,
        cache: Option<Arc<dyn Cache>>,
        metrics: PerformanceMetrics,
        events_ttl: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            metrics,
            events_ttl,
            store_timeout,
        }
    }

    /// Event for a single product, or none
    pub async fn resolve(&self, product: &ProductRef, instant: DateTime<Utc>, use_cache: bool) -> Resolution {
        self.resolve_products(std::slice::from_ref(product), instant, use_cache, &OrderScope::default())
            .await
    }

    /// Events for every product; never fails
    ///
    /// Events the scope's user has used up are skipped, so the next-ranked event or
    /// the base price applies. The first store fault stops further lookups, since the
    /// remaining ones would hit the same fault.
    pub async fn resolve_products(
        &self,
        products: &[ProductRef],
        instant: DateTime<Utc>,
        use_cache: bool,
        scope: &OrderScope,
    ) -> Resolution {
        let _timer = self.metrics.start(Operation::EventResolution);
        let mut resolution = Resolution::default();
        let mut user_counts: HashMap<i32, i64> = HashMap::new();

        for product in products {
            if resolution.matches.contains_key(&product.product_id) {
                continue;
            }

            let found = match self.candidates(product, instant, use_cache).await {
                Ok((events, cached)) => self
                    .within_limits(events, instant, scope, &mut user_counts)
                    .await
                    .map(|events| (events, cached)),
                Err(e) => Err(e),
            };
            let (events, cached) = match found {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(
                        "Event lookup failed for product {}, pricing without events: {}",
                        product.product_id,
                        e
                    );
                    resolution.degraded = true;
                    break;
                }
            };
            resolution.from_cache |= cached;

            match select_event(product, &events, instant) {
                Ok(Some(matched)) => {
                    tracing::debug!(
                        "Product {} matched event {} ({})",
                        product.product_id,
                        matched.event.id,
                        matched.kind
                    );
                    resolution.matches.insert(product.product_id, matched);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("No event applied to product {}: {}", product.product_id, e);
                }
            }
        }

        resolution
    }

    /// Live candidate events for one product, with rules attached
    async fn candidates(
        &self,
        product: &ProductRef,
        instant: DateTime<Utc>,
        use_cache: bool,
    ) -> PResult<(Vec<PromotionEvent>, bool)> {
        let cache = if use_cache { self.cache.as_deref() } else { None };
        let key = cache::product_events_key(product.product_id, instant.timestamp().div_euclid(60));

        if let Some(events) = cache::get_json::<Vec<PromotionEvent>>(cache, &key, &self.metrics).await {
            return Ok((events, true));
        }

        let mut events = bounded(
            self.store_timeout,
            "find_active_events",
            self.store
                .find_active_events(&[product.product_id], &product.category_ids(), instant),
        )
        .await?;

        for event in &mut events {
            event.rules = self.rules_for(event.id, cache).await?;
        }

        cache::put_json(cache, &key, &events, self.events_ttl).await;
        Ok((events, false))
    }

    /// Drop events the scope's user may no longer use
    ///
    /// Counters are adjusted to exclude the order's own ledger rows, so re-pricing a
    /// confirmed order keeps the events it was admitted under. Per-user counts come
    /// from the ledger, never from the cache.
    async fn within_limits(
        &self,
        events: Vec<PromotionEvent>,
        instant: DateTime<Utc>,
        scope: &OrderScope,
        user_counts: &mut HashMap<i32, i64>,
    ) -> PResult<Vec<PromotionEvent>> {
        let mut kept = Vec::with_capacity(events.len());

        for mut event in events {
            let promotion = PromotionRef::Event(event.id);
            let own = scope.own_usage(promotion);
            event.current_usage_count -= i32::try_from(own).unwrap_or(i32::MAX);

            if let (Some(max), Some(user_id)) = (event.max_usage_per_user, scope.user_id) {
                if is_live(&event, instant) {
                    let used = match user_counts.get(&event.id) {
                        Some(used) => *used,
                        None => {
                            let used = bounded(
                                self.store_timeout,
                                "count_user_usage",
                                self.store.count_user_usage(promotion, user_id),
                            )
                            .await?;
                            user_counts.insert(event.id, used);
                            used
                        }
                    };
                    if used - own >= i64::from(max) {
                        tracing::debug!("User {} reached the per-user limit of event {}", user_id, event.id);
                        continue;
                    }
                }
            }

            kept.push(event);
        }

        Ok(kept)
    }

    async fn rules_for(&self, event_id: i32, cache: Option<&dyn Cache>) -> PResult<Vec<EventRule>> {
        let key = cache::event_rules_key(event_id);
        if let Some(rules) = cache::get_json::<Vec<EventRule>>(cache, &key, &self.metrics).await {
            return Ok(rules);
        }

        let rules = bounded(
            self.store_timeout,
            "find_event_rules",
            self.store.find_event_rules(event_id),
        )
        .await?;
        cache::put_json(cache, &key, &rules, self.events_ttl).await;
        Ok(rules)
    }
}
