// PostgreSQL-backed promotion and shipping stores
//
// Usage accounting runs in a single transaction per call: the promotion row is locked
// with FOR UPDATE, limits are checked against the ledger, then the ledger row and the
// counter increment are written together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use crate::promotions::{
    error::{PResult, PromotionError},
    models::{EventProduct, EventRule, PromoCode, PromotionEvent, ShippingConfiguration, UsageRecord},
    store::{NewUsage, PromotionStore, RecordOutcome, ReversalResult, ShippingStore},
    types::{PromotionKind, PromotionRef},
};

const EVENT_COLUMNS: &str = r#"
    e.id, e.name, e.description, e.tagline, e.promotion_type, e.discount_value,
    e.max_discount_amount, e.min_order_value, e.start_date, e.end_date,
    e.time_slot_start, e.time_slot_end, e.priority, e.max_usage_count,
    e.max_usage_per_user, e.current_usage_count, e.status, e.is_active,
    e.is_deleted, e.created_at
"#;

const PROMO_CODE_COLUMNS: &str = r#"
    id, code, description, promo_type, discount_value, max_discount_amount,
    min_order_amount, max_total_usage, max_usage_per_user, current_usage_count,
    start_date, end_date, is_active, is_deleted, apply_to_shipping,
    stackable_with_events, customer_tier, created_at
"#;

const USAGE_COLUMNS: &str =
    "id, promotion_kind, promotion_id, user_id, order_id, discount_amount, created_at";

const SHIPPING_COLUMNS: &str = r#"
    id, name, is_active, is_default, low_order_threshold, low_order_shipping_cost,
    high_order_shipping_cost, free_shipping_threshold, is_free_shipping_active,
    free_shipping_start_date, free_shipping_end_date, weekend_surcharge,
    holiday_surcharge, rush_delivery_surcharge, estimated_delivery_days,
    max_delivery_distance_km, require_location_validation,
    service_center_latitude, service_center_longitude, updated_at
"#;

/// Table holding the counters of a promotion kind
fn counter_table(kind: PromotionKind) -> &'static str {
    match kind {
        PromotionKind::Event => "promotion_events",
        PromotionKind::PromoCode => "promo_codes",
    }
}

/// Column holding the global usage limit of a promotion kind
fn total_limit_column(kind: PromotionKind) -> &'static str {
    match kind {
        PromotionKind::Event => "max_usage_count",
        PromotionKind::PromoCode => "max_total_usage",
    }
}

/// Promotion store over PostgreSQL
#[derive(Clone)]
pub struct PgPromotionStore {
    pool: PgPool,
}

impl PgPromotionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_usage(
        tx: &mut Transaction<'_, Postgres>,
        promotion: PromotionRef,
        order_id: Uuid,
    ) -> PResult<Option<UsageRecord>> {
        let query = format!(
            "SELECT {} FROM promotion_usages WHERE promotion_kind = $1 AND promotion_id = $2 AND order_id = $3",
            USAGE_COLUMNS
        );
        let record = sqlx::query_as::<_, UsageRecord>(&query)
            .bind(promotion.kind())
            .bind(promotion.id())
            .bind(order_id)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(record)
    }
}

#[async_trait]
impl PromotionStore for PgPromotionStore {
    async fn find_active_events(
        &self,
        product_ids: &[i32],
        category_ids: &[i32],
        instant: DateTime<Utc>,
    ) -> PResult<Vec<PromotionEvent>> {
        // Rule targets are stored as text
        let product_targets: Vec<String> = product_ids.iter().map(i32::to_string).collect();
        let category_targets: Vec<String> = category_ids.iter().map(i32::to_string).collect();

        let query = format!(
            r#"
            SELECT {}
            FROM promotion_events e
            WHERE e.is_active = TRUE
              AND e.is_deleted = FALSE
              AND e.start_date <= $1
              AND e.end_date >= $1
              AND (
                EXISTS (
                    SELECT 1 FROM event_products p
                    WHERE p.event_id = e.id AND p.product_id = ANY($2)
                )
                OR EXISTS (
                    SELECT 1 FROM event_rules r
                    WHERE r.event_id = e.id
                      AND (
                        r.target_type = 'global'
                        OR (r.target_type = 'product' AND TRIM(r.target_value) = ANY($3))
                        OR (r.target_type IN ('category', 'subcategory') AND TRIM(r.target_value) = ANY($4))
                      )
                )
              )
            ORDER BY e.priority DESC, e.id ASC
            "#,
            EVENT_COLUMNS
        );

        let mut events = sqlx::query_as::<_, PromotionEvent>(&query)
            .bind(instant)
            .bind(product_ids)
            .bind(&product_targets)
            .bind(&category_targets)
            .fetch_all(&self.pool)
            .await?;

        if events.is_empty() {
            return Ok(events);
        }

        let event_ids: Vec<i32> = events.iter().map(|event| event.id).collect();
        let links = sqlx::query_as::<_, EventProduct>(
            r#"
            SELECT event_id, product_id, specific_discount
            FROM event_products
            WHERE event_id = ANY($1) AND product_id = ANY($2)
            "#,
        )
        .bind(&event_ids)
        .bind(product_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_event: HashMap<i32, Vec<EventProduct>> = HashMap::new();
        for link in links {
            by_event.entry(link.event_id).or_default().push(link);
        }
        for event in &mut events {
            event.products = by_event.remove(&event.id).unwrap_or_default();
        }

        Ok(events)
    }

    async fn find_event_rules(&self, event_id: i32) -> PResult<Vec<EventRule>> {
        let rules = sqlx::query_as::<_, EventRule>(
            r#"
            SELECT id, event_id, target_type, target_value, promotion_type, discount_value,
                   max_discount_amount, min_order_value, priority
            FROM event_rules
            WHERE event_id = $1
            ORDER BY priority DESC, id ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }

    async fn find_promo_code_by_code(&self, code: &str) -> PResult<Option<PromoCode>> {
        let query = format!(
            "SELECT {} FROM promo_codes WHERE UPPER(TRIM(code)) = UPPER(TRIM($1)) ORDER BY is_deleted ASC, id DESC LIMIT 1",
            PROMO_CODE_COLUMNS
        );
        let promo = sqlx::query_as::<_, PromoCode>(&query)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        Ok(promo)
    }

    async fn count_user_usage(&self, promotion: PromotionRef, user_id: i32) -> PResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM promotion_usages
            WHERE promotion_kind = $1 AND promotion_id = $2 AND user_id = $3
            "#,
        )
        .bind(promotion.kind())
        .bind(promotion.id())
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn record_usage(&self, usage: &NewUsage) -> PResult<RecordOutcome> {
        let kind = usage.promotion.kind();
        let table = counter_table(kind);
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent confirmations of the same promotion
        let limits_query = format!(
            "SELECT current_usage_count, {}, max_usage_per_user FROM {} WHERE id = $1 FOR UPDATE",
            total_limit_column(kind),
            table
        );
        let limits: Option<(i32, Option<i32>, Option<i32>)> = sqlx::query_as(&limits_query)
            .bind(usage.promotion.id())
            .fetch_optional(&mut *tx)
            .await?;
        let (current, max_total, max_per_user) = limits.ok_or_else(|| {
            PromotionError::ValidationError(format!("Unknown promotion {}", usage.promotion))
        })?;

        if let Some(existing) = Self::find_usage(&mut tx, usage.promotion, usage.order_id).await? {
            tx.commit().await?;
            return Ok(RecordOutcome::AlreadyRecorded(existing));
        }

        if let Some(max) = max_per_user {
            let (used,): (i64,) = sqlx::query_as(
                r#"
                SELECT COUNT(*)
                FROM promotion_usages
                WHERE promotion_kind = $1 AND promotion_id = $2 AND user_id = $3
                "#,
            )
            .bind(kind)
            .bind(usage.promotion.id())
            .bind(usage.user_id)
            .fetch_one(&mut *tx)
            .await?;

            if used >= i64::from(max.max(0)) {
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

        let insert = format!(
            r#"
            INSERT INTO promotion_usages (id, promotion_kind, promotion_id, user_id, order_id, discount_amount)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (promotion_kind, promotion_id, order_id) DO NOTHING
            RETURNING {}
            "#,
            USAGE_COLUMNS
        );
        let inserted = sqlx::query_as::<_, UsageRecord>(&insert)
            .bind(Uuid::new_v4())
            .bind(kind)
            .bind(usage.promotion.id())
            .bind(usage.user_id)
            .bind(usage.order_id)
            .bind(usage.discount_amount)
            .fetch_optional(&mut *tx)
            .await?;

        let record = match inserted {
            Some(record) => record,
            None => {
                let existing = Self::find_usage(&mut tx, usage.promotion, usage.order_id).await?;
                tx.commit().await?;
                return existing.map(RecordOutcome::AlreadyRecorded).ok_or_else(|| {
                    PromotionError::ConcurrencyConflict {
                        promotion: usage.promotion,
                        reason: "usage row vanished during insert".to_string(),
                    }
                });
            }
        };

        let increment = format!(
            r#"
            UPDATE {table}
            SET current_usage_count = current_usage_count + 1
            WHERE id = $1 AND ({limit} IS NULL OR current_usage_count < {limit})
            "#,
            table = table,
            limit = total_limit_column(kind)
        );
        let updated = sqlx::query(&increment)
            .bind(usage.promotion.id())
            .execute(&mut *tx)
            .await?;

        if updated.rows_affected() == 0 {
            // Dropping the transaction rolls back the ledger insert
            return Err(PromotionError::ConcurrencyConflict {
                promotion: usage.promotion,
                reason: "usage limit reached".to_string(),
            });
        }

        tx.commit().await?;
        Ok(RecordOutcome::Recorded(record))
    }

    async fn reverse_usage(&self, order_id: Uuid) -> PResult<ReversalResult> {
        let mut tx = self.pool.begin().await?;

        let delete = format!(
            "DELETE FROM promotion_usages WHERE order_id = $1 RETURNING {}",
            USAGE_COLUMNS
        );
        let reversed = sqlx::query_as::<_, UsageRecord>(&delete)
            .bind(order_id)
            .fetch_all(&mut *tx)
            .await?;

        for record in &reversed {
            let decrement = format!(
                "UPDATE {} SET current_usage_count = GREATEST(current_usage_count - 1, 0) WHERE id = $1",
                counter_table(record.promotion_kind)
            );
            sqlx::query(&decrement)
                .bind(record.promotion_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(ReversalResult { order_id, reversed })
    }

    async fn find_usage_by_order(&self, order_id: Uuid) -> PResult<Vec<UsageRecord>> {
        let query = format!(
            "SELECT {} FROM promotion_usages WHERE order_id = $1 ORDER BY created_at ASC",
            USAGE_COLUMNS
        );
        let records = sqlx::query_as::<_, UsageRecord>(&query)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }
}

/// Shipping configuration store over PostgreSQL
#[derive(Clone)]
pub struct PgShippingStore {
    pool: PgPool,
}

impl PgShippingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ShippingStore for PgShippingStore {
    async fn get_active_configuration(&self) -> PResult<Option<ShippingConfiguration>> {
        let query = format!(
            r#"
            SELECT {}
            FROM shipping_configurations
            WHERE is_active = TRUE
            ORDER BY is_default DESC, updated_at DESC
            LIMIT 1
            "#,
            SHIPPING_COLUMNS
        );
        let configuration = sqlx::query_as::<_, ShippingConfiguration>(&query)
            .fetch_optional(&self.pool)
            .await?;

        Ok(configuration)
    }
}
