//! Billing event audit log
//!
//! Append-only record of billing state changes, written best-effort: a failed
//! audit insert is logged and never fails the operation that produced it.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCancelled,
    DowngradeScheduled,
    KeysGranted,
    ContractCreated,
    OrderCharged,
    OrderCancelled,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::SubscriptionCreated => "subscription_created",
            BillingEventType::SubscriptionUpdated => "subscription_updated",
            BillingEventType::SubscriptionCancelled => "subscription_cancelled",
            BillingEventType::DowngradeScheduled => "downgrade_scheduled",
            BillingEventType::KeysGranted => "keys_granted",
            BillingEventType::ContractCreated => "contract_created",
            BillingEventType::OrderCharged => "order_charged",
            BillingEventType::OrderCancelled => "order_cancelled",
        }
    }
}

#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log(
        &self,
        user_id: Option<Uuid>,
        event_type: BillingEventType,
        data: Value,
    ) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO billing_events (id, user_id, event_type, data)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(event_type.as_str())
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Log and swallow failures; audit rows must never break billing flows
    pub async fn log_best_effort(
        &self,
        user_id: Option<Uuid>,
        event_type: BillingEventType,
        data: Value,
    ) {
        if let Err(e) = self.log(user_id, event_type, data).await {
            tracing::warn!(
                event_type = event_type.as_str(),
                error = %e,
                "failed to write billing event"
            );
        }
    }
}
