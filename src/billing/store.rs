use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::models::{
    BillingPlan, DueOccurrence, Occurrence, Subscription, SubscriptionStatus,
    CURRENT_SCHEMA_VERSION,
};

// key: billing-store -> persisted subscription and occurrence state
/// Every mutating method is a conditional transition: it reports whether the
/// row still matched the expected state, so a duplicate task delivery after a
/// committed transition observes `false` and does nothing else.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn upsert_plan(&self, plan: &BillingPlan) -> Result<()>;
    async fn find_plan(&self, plan_id: Uuid) -> Result<Option<BillingPlan>>;

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()>;
    async fn find_subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>>;
    async fn find_occurrence(&self, occurrence_id: Uuid) -> Result<Option<Occurrence>>;
    async fn list_occurrences(&self, subscription_id: Uuid) -> Result<Vec<Occurrence>>;

    /// Whether the subscription has a FAILED occurrence other than `excluding`.
    async fn has_other_failed_occurrence(
        &self,
        subscription_id: Uuid,
        excluding: Uuid,
    ) -> Result<bool>;
    async fn has_open_occurrence(&self, subscription_id: Uuid) -> Result<bool>;

    /// Occurrences of ACTIVE subscriptions that are due, FAILED first, then by
    /// schedule.
    async fn due_occurrences(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<DueOccurrence>>;
    async fn subscriptions_due_for_expiry(&self, now: DateTime<Utc>, limit: i64)
        -> Result<Vec<Uuid>>;
    async fn subscriptions_missing_occurrences(&self, limit: i64) -> Result<Vec<Uuid>>;

    /// Inserts occurrences, skipping any (subscription, scheduled_at) pair that
    /// already exists. Returns how many rows were created.
    async fn insert_occurrences(&self, occurrences: &[Occurrence]) -> Result<u64>;

    /// Marks the occurrence CHARGED and moves the subscription's cycle end to
    /// `new_end` in one unit. Applies only while the occurrence is still
    /// PENDING/FAILED.
    async fn record_successful_charge(
        &self,
        occurrence_id: Uuid,
        transaction_id: &str,
        subscription_id: Uuid,
        new_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Flags a CHARGED occurrence whose entitlement extension has been applied.
    /// `false` when it was already flagged or is not CHARGED.
    async fn mark_entitlement_synced(&self, occurrence_id: Uuid, now: DateTime<Utc>)
        -> Result<bool>;

    /// Moves a PENDING/FAILED occurrence to FAILED with the given retry time.
    async fn mark_occurrence_failed(
        &self,
        occurrence_id: Uuid,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Records the grace deadline on a FAILED occurrence that has none yet and
    /// sets the subscription's end date to it. `true` only for the caller that
    /// established the deadline.
    async fn establish_grace_period(
        &self,
        occurrence_id: Uuid,
        subscription_id: Uuid,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Moves the subscription to EXPIRED when its status is in `from` (and, if
    /// given, its end date is at or before `ended_by`), expiring every
    /// PENDING/FAILED occurrence alongside.
    async fn expire_subscription(
        &self,
        subscription_id: Uuid,
        from: &[SubscriptionStatus],
        ended_by: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn transition_subscription_status(
        &self,
        subscription_id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Cancels the earliest PENDING occurrence. Returns its id.
    async fn cancel_next_pending_occurrence(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>>;

    /// Restores the earliest CANCELLED occurrence scheduled after `after` back
    /// to PENDING. Returns its id.
    async fn restore_cancelled_occurrence(
        &self,
        subscription_id: Uuid,
        after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>>;

    /// One-shot upgrade of rows written before `CURRENT_SCHEMA_VERSION`.
    async fn upgrade_legacy_subscriptions(&self, now: DateTime<Utc>) -> Result<u64>;
}

// key: billing-store-postgres -> sqlx implementation
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, owner_id, plan_id, status, billing_cycle, start_date, end_date,
    original_end_date, original_price, entitlement_code, payer_key,
    contact_email, locale, schema_version, created_at, updated_at
"#;

const OCCURRENCE_COLUMNS: &str = r#"
    id, subscription_id, scheduled_at, amount_cents, currency, state,
    grace_period_deadline, retry_at, transaction_id, entitlement_synced, attempts,
    created_at, updated_at
"#;

fn subscription_from_row(row: &PgRow) -> Result<Subscription> {
    let status: String = row.try_get("status")?;
    let billing_cycle: String = row.try_get("billing_cycle")?;
    let end_date: DateTime<Utc> = row.try_get("end_date")?;
    let original_end_date: Option<DateTime<Utc>> = row.try_get("original_end_date")?;
    let original_price: Option<i64> = row.try_get("original_price")?;

    Ok(Subscription {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        plan_id: row.try_get("plan_id")?,
        status: status.parse()?,
        billing_cycle: billing_cycle.parse()?,
        start_date: row.try_get("start_date")?,
        end_date,
        original_end_date: original_end_date.unwrap_or(end_date),
        original_price: original_price.unwrap_or_default(),
        entitlement_code: row.try_get("entitlement_code")?,
        payer_key: row.try_get("payer_key")?,
        contact_email: row.try_get("contact_email")?,
        locale: row.try_get("locale")?,
        schema_version: row.try_get("schema_version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn occurrence_from_row(row: &PgRow) -> Result<Occurrence> {
    let state: String = row.try_get("state")?;
    Ok(Occurrence {
        id: row.try_get("id")?,
        subscription_id: row.try_get("subscription_id")?,
        scheduled_at: row.try_get("scheduled_at")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: row.try_get("currency")?,
        state: state.parse()?,
        grace_period_deadline: row.try_get("grace_period_deadline")?,
        retry_at: row.try_get("retry_at")?,
        transaction_id: row.try_get("transaction_id")?,
        entitlement_synced: row.try_get("entitlement_synced")?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn status_list(statuses: &[SubscriptionStatus]) -> Vec<String> {
    statuses.iter().map(|status| status.as_str().to_string()).collect()
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn upsert_plan(&self, plan: &BillingPlan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_plans (id, code, name, billing_cycle, currency, amount_cents, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id)
            DO UPDATE SET
                code = EXCLUDED.code,
                name = EXCLUDED.name,
                billing_cycle = EXCLUDED.billing_cycle,
                currency = EXCLUDED.currency,
                amount_cents = EXCLUDED.amount_cents,
                active = EXCLUDED.active,
                updated_at = NOW()
            "#,
        )
        .bind(plan.id)
        .bind(&plan.code)
        .bind(&plan.name)
        .bind(plan.billing_cycle.as_str())
        .bind(&plan.currency)
        .bind(plan.amount_cents)
        .bind(plan.active)
        .execute(&self.pool)
        .await
        .context("failed to upsert billing plan")?;
        Ok(())
    }

    async fn find_plan(&self, plan_id: Uuid) -> Result<Option<BillingPlan>> {
        let row = sqlx::query(
            "SELECT id, code, name, billing_cycle, currency, amount_cents, active FROM billing_plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let billing_cycle: String = row.try_get("billing_cycle")?;
        Ok(Some(BillingPlan {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            name: row.try_get("name")?,
            billing_cycle: billing_cycle.parse()?,
            currency: row.try_get("currency")?,
            amount_cents: row.try_get("amount_cents")?,
            active: row.try_get("active")?,
        }))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_subscriptions (
                id, owner_id, plan_id, status, billing_cycle, start_date, end_date,
                original_end_date, original_price, entitlement_code, payer_key,
                contact_email, locale, schema_version, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.owner_id)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.billing_cycle.as_str())
        .bind(subscription.start_date)
        .bind(subscription.end_date)
        .bind(subscription.original_end_date)
        .bind(subscription.original_price)
        .bind(&subscription.entitlement_code)
        .bind(&subscription.payer_key)
        .bind(&subscription.contact_email)
        .bind(&subscription.locale)
        .bind(subscription.schema_version)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert subscription")?;
        Ok(())
    }

    async fn find_subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM billing_subscriptions WHERE id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn find_occurrence(&self, occurrence_id: Uuid) -> Result<Option<Occurrence>> {
        let row = sqlx::query(&format!(
            "SELECT {OCCURRENCE_COLUMNS} FROM billing_occurrences WHERE id = $1"
        ))
        .bind(occurrence_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(occurrence_from_row).transpose()
    }

    async fn list_occurrences(&self, subscription_id: Uuid) -> Result<Vec<Occurrence>> {
        let rows = sqlx::query(&format!(
            "SELECT {OCCURRENCE_COLUMNS} FROM billing_occurrences WHERE subscription_id = $1 ORDER BY scheduled_at ASC"
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(occurrence_from_row).collect()
    }

    async fn has_other_failed_occurrence(
        &self,
        subscription_id: Uuid,
        excluding: Uuid,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM billing_occurrences
                WHERE subscription_id = $1 AND state = 'FAILED' AND id <> $2
            )
            "#,
        )
        .bind(subscription_id)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn has_open_occurrence(&self, subscription_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM billing_occurrences
                WHERE subscription_id = $1 AND state IN ('PENDING', 'FAILED')
            )
            "#,
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn due_occurrences(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<DueOccurrence>> {
        let rows = sqlx::query(
            r#"
            SELECT o.id, o.subscription_id, o.state, o.scheduled_at
            FROM billing_occurrences o
            JOIN billing_subscriptions s ON s.id = o.subscription_id
            WHERE s.status = 'ACTIVE'
              AND (
                (o.state = 'PENDING' AND o.scheduled_at <= $1)
                OR (o.state = 'FAILED' AND COALESCE(o.retry_at, o.scheduled_at) <= $1)
              )
            ORDER BY CASE WHEN o.state = 'FAILED' THEN 0 ELSE 1 END, o.scheduled_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let state: String = row.try_get("state")?;
                Ok(DueOccurrence {
                    occurrence_id: row.try_get("id")?,
                    subscription_id: row.try_get("subscription_id")?,
                    state: state.parse()?,
                    scheduled_at: row.try_get("scheduled_at")?,
                })
            })
            .collect()
    }

    async fn subscriptions_due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM billing_subscriptions
            WHERE status IN ('ACTIVE', 'CANCELLATION_REQUESTED') AND end_date <= $1
            ORDER BY end_date ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn subscriptions_missing_occurrences(&self, limit: i64) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT s.id FROM billing_subscriptions s
            WHERE s.status = 'ACTIVE'
              AND NOT EXISTS (
                SELECT 1 FROM billing_occurrences o
                WHERE o.subscription_id = s.id AND o.state IN ('PENDING', 'FAILED')
              )
            ORDER BY s.end_date ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn insert_occurrences(&self, occurrences: &[Occurrence]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for occurrence in occurrences {
            let result = sqlx::query(
                r#"
                INSERT INTO billing_occurrences (
                    id, subscription_id, scheduled_at, amount_cents, currency, state,
                    grace_period_deadline, retry_at, transaction_id, entitlement_synced, attempts,
                    created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (subscription_id, scheduled_at) DO NOTHING
                "#,
            )
            .bind(occurrence.id)
            .bind(occurrence.subscription_id)
            .bind(occurrence.scheduled_at)
            .bind(occurrence.amount_cents)
            .bind(&occurrence.currency)
            .bind(occurrence.state.as_str())
            .bind(occurrence.grace_period_deadline)
            .bind(occurrence.retry_at)
            .bind(&occurrence.transaction_id)
            .bind(occurrence.entitlement_synced)
            .bind(occurrence.attempts)
            .bind(occurrence.created_at)
            .bind(occurrence.updated_at)
            .execute(&mut tx)
            .await
            .context("failed to insert occurrence")?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn record_successful_charge(
        &self,
        occurrence_id: Uuid,
        transaction_id: &str,
        subscription_id: Uuid,
        new_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let charged = sqlx::query(
            r#"
            UPDATE billing_occurrences
            SET state = 'CHARGED', transaction_id = $2, retry_at = NULL,
                attempts = attempts + 1, updated_at = $3
            WHERE id = $1 AND state IN ('PENDING', 'FAILED')
            "#,
        )
        .bind(occurrence_id)
        .bind(transaction_id)
        .bind(now)
        .execute(&mut tx)
        .await?
        .rows_affected();

        if charged == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE billing_subscriptions
            SET end_date = $2, original_end_date = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(new_end)
        .bind(now)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_entitlement_synced(
        &self,
        occurrence_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE billing_occurrences
            SET entitlement_synced = TRUE, updated_at = $2
            WHERE id = $1 AND state = 'CHARGED' AND NOT entitlement_synced
            "#,
        )
        .bind(occurrence_id)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn mark_occurrence_failed(
        &self,
        occurrence_id: Uuid,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE billing_occurrences
            SET state = 'FAILED', retry_at = $2, attempts = attempts + 1, updated_at = $3
            WHERE id = $1 AND state IN ('PENDING', 'FAILED')
            "#,
        )
        .bind(occurrence_id)
        .bind(retry_at)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn establish_grace_period(
        &self,
        occurrence_id: Uuid,
        subscription_id: Uuid,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let established = sqlx::query(
            r#"
            UPDATE billing_occurrences
            SET grace_period_deadline = $2, updated_at = $3
            WHERE id = $1 AND state = 'FAILED' AND grace_period_deadline IS NULL
            "#,
        )
        .bind(occurrence_id)
        .bind(deadline)
        .bind(now)
        .execute(&mut tx)
        .await?
        .rows_affected();

        if established == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE billing_subscriptions
            SET end_date = $2, updated_at = $3
            WHERE id = $1 AND status = 'ACTIVE'
            "#,
        )
        .bind(subscription_id)
        .bind(deadline)
        .bind(now)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn expire_subscription(
        &self,
        subscription_id: Uuid,
        from: &[SubscriptionStatus],
        ended_by: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let expired = sqlx::query(
            r#"
            UPDATE billing_subscriptions
            SET status = 'EXPIRED', updated_at = $4
            WHERE id = $1
              AND status = ANY($2)
              AND ($3::timestamptz IS NULL OR end_date <= $3)
            "#,
        )
        .bind(subscription_id)
        .bind(status_list(from))
        .bind(ended_by)
        .bind(now)
        .execute(&mut tx)
        .await?
        .rows_affected();

        if expired == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE billing_occurrences
            SET state = 'EXPIRED', retry_at = NULL, updated_at = $2
            WHERE subscription_id = $1 AND state IN ('PENDING', 'FAILED')
            "#,
        )
        .bind(subscription_id)
        .bind(now)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn transition_subscription_status(
        &self,
        subscription_id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE billing_subscriptions SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2",
        )
        .bind(subscription_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn cancel_next_pending_occurrence(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE billing_occurrences
            SET state = 'CANCELLED', updated_at = $2
            WHERE id = (
                SELECT id FROM billing_occurrences
                WHERE subscription_id = $1 AND state = 'PENDING'
                ORDER BY scheduled_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(subscription_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn restore_cancelled_occurrence(
        &self,
        subscription_id: Uuid,
        after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE billing_occurrences
            SET state = 'PENDING', updated_at = $3
            WHERE id = (
                SELECT id FROM billing_occurrences
                WHERE subscription_id = $1 AND state = 'CANCELLED' AND scheduled_at > $2
                ORDER BY scheduled_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(subscription_id)
        .bind(after)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn upgrade_legacy_subscriptions(&self, now: DateTime<Utc>) -> Result<u64> {
        let upgraded = sqlx::query(
            r#"
            UPDATE billing_subscriptions s
            SET original_end_date = COALESCE(s.original_end_date, s.end_date),
                original_price = COALESCE(
                    s.original_price,
                    (SELECT p.amount_cents FROM billing_plans p WHERE p.id = s.plan_id),
                    0
                ),
                schema_version = $1,
                updated_at = $2
            WHERE s.schema_version < $1
            "#,
        )
        .bind(CURRENT_SCHEMA_VERSION)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to upgrade legacy subscription rows")?
        .rows_affected();
        Ok(upgraded)
    }
}
