//! Durable subscription state
//!
//! One row per user. Controller writes are tentative; webhook writes are
//! authoritative and expressed as absolute-value updates keyed by the
//! processor subscription id. The single additive operation is the key
//! balance increment, which is a SQL-level atomic add.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;
use workbridge_shared::{BillingUser, PlanTier, SubscriptionRecord, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};

/// Fields written when a subscription is created or re-created for a user
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub user_id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub stripe_price_id: String,
    pub plan_type: PlanTier,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn get_user(&self, user_id: Uuid) -> BillingResult<BillingUser> {
        sqlx::query_as::<_, BillingUser>(
            "SELECT id, email, key_balance, stripe_customer_id, stripe_account_id
             FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))
    }

    /// Upsert the one subscription row a user may have
    pub async fn upsert(&self, up: SubscriptionUpsert) -> BillingResult<SubscriptionRecord> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            "INSERT INTO subscriptions
                (id, user_id, stripe_subscription_id, stripe_customer_id, stripe_price_id,
                 plan_type, status, current_period_start, current_period_end,
                 cancel_at_period_end, schedule_for_downgrade, downgrade_plan)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, FALSE, NULL)
             ON CONFLICT (user_id) DO UPDATE SET
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_price_id = EXCLUDED.stripe_price_id,
                plan_type = EXCLUDED.plan_type,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = FALSE,
                schedule_for_downgrade = FALSE,
                downgrade_plan = NULL,
                updated_at = NOW()
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(up.user_id)
        .bind(&up.stripe_subscription_id)
        .bind(&up.stripe_customer_id)
        .bind(&up.stripe_price_id)
        .bind(up.plan_type)
        .bind(up.status)
        .bind(up.current_period_start)
        .bind(up.current_period_end)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn find_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            "SELECT * FROM subscriptions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn find_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            "SELECT * FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Authoritative plan change: new price, status, and period bounds, with
    /// allocation timestamps reset and any pending downgrade cleared
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_plan_change(
        &self,
        stripe_subscription_id: &str,
        stripe_price_id: &str,
        plan_type: PlanTier,
        status: SubscriptionStatus,
        current_period_start: OffsetDateTime,
        current_period_end: Option<OffsetDateTime>,
        last_allocation: OffsetDateTime,
        next_allocation: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            "UPDATE subscriptions SET
                stripe_price_id = $2,
                plan_type = $3,
                status = $4,
                current_period_start = $5,
                current_period_end = $6,
                last_key_allocation = $7,
                next_key_allocation = $8,
                schedule_for_downgrade = FALSE,
                downgrade_plan = NULL,
                updated_at = NOW()
             WHERE stripe_subscription_id = $1
             RETURNING *",
        )
        .bind(stripe_subscription_id)
        .bind(stripe_price_id)
        .bind(plan_type)
        .bind(status)
        .bind(current_period_start)
        .bind(current_period_end)
        .bind(last_allocation)
        .bind(next_allocation)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Refresh the renewal flag and period end; clears any pending downgrade
    /// since a cancellation state change supersedes it
    pub async fn set_cancel_at_period_end(
        &self,
        stripe_subscription_id: &str,
        cancel_at_period_end: bool,
        current_period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            "UPDATE subscriptions SET
                cancel_at_period_end = $2,
                current_period_end = COALESCE($3, current_period_end),
                schedule_for_downgrade = FALSE,
                downgrade_plan = NULL,
                updated_at = NOW()
             WHERE stripe_subscription_id = $1
             RETURNING *",
        )
        .bind(stripe_subscription_id)
        .bind(cancel_at_period_end)
        .bind(current_period_end)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Record a pending downgrade without touching the active plan
    pub async fn mark_downgrade_pending(
        &self,
        stripe_subscription_id: &str,
        target_plan: PlanTier,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            "UPDATE subscriptions SET
                schedule_for_downgrade = TRUE,
                downgrade_plan = $2,
                updated_at = NOW()
             WHERE stripe_subscription_id = $1
             RETURNING *",
        )
        .bind(stripe_subscription_id)
        .bind(target_plan)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Terminal transition on processor-confirmed deletion. The row is kept
    /// for history.
    pub async fn mark_cancelled(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            "UPDATE subscriptions SET
                status = $2,
                cancel_at_period_end = FALSE,
                schedule_for_downgrade = FALSE,
                downgrade_plan = NULL,
                updated_at = NOW()
             WHERE stripe_subscription_id = $1
             RETURNING *",
        )
        .bind(stripe_subscription_id)
        .bind(SubscriptionStatus::Cancelled)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Stamp a completed grant and when the next one is due
    pub async fn record_allocation(
        &self,
        subscription_id: Uuid,
        allocated_at: OffsetDateTime,
        next_allocation: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE subscriptions SET
                last_key_allocation = $2,
                next_key_allocation = $3,
                updated_at = NOW()
             WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(allocated_at)
        .bind(next_allocation)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomic key grant. Returns the new balance.
    pub async fn grant_keys(&self, user_id: Uuid, amount: i64) -> BillingResult<i64> {
        let balance: (i64,) = sqlx::query_as(
            "UPDATE users SET key_balance = key_balance + $2, updated_at = NOW()
             WHERE id = $1
             RETURNING key_balance",
        )
        .bind(user_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;
        Ok(balance.0)
    }

    /// Subscriptions whose next allocation falls inside the window and whose
    /// paid period has not lapsed, restricted to the given plan
    pub async fn due_for_allocation(
        &self,
        plan_type: PlanTier,
        window_start: OffsetDateTime,
        window_end: OffsetDateTime,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let records = sqlx::query_as::<_, SubscriptionRecord>(
            "SELECT * FROM subscriptions
             WHERE plan_type = $1
               AND next_key_allocation >= $2
               AND next_key_allocation < $3
               AND current_period_end > $4",
        )
        .bind(plan_type)
        .bind(window_start)
        .bind(window_end)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
