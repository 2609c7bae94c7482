//! Subscription controller: create, change plan, cancel, query
//!
//! Upgrades bill immediately at the new price; downgrades are deferred to the
//! end of the paid-for period through a processor-side schedule. Local plan
//! fields are only tentatively written here; the webhook reconciler owns the
//! authoritative transitions.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;
use workbridge_shared::{PlanTier, SubscriptionRecord, SubscriptionStatus};

use crate::catalog::{PlanCatalog, PlanChange};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewaySubscription, PaymentGateway};
use crate::store::{SubscriptionStore, SubscriptionUpsert};

/// Result of creating a subscription, returned to the client for payment
/// confirmation
#[derive(Debug, Clone)]
pub struct CreatedSubscription {
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub client_secret: Option<String>,
}

/// What a plan-change request resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanChangeOutcome {
    /// Same rank as the current plan, nothing done
    Unchanged,
    /// Price swapped immediately, billed now
    Upgraded { plan: PlanTier },
    /// Schedule created; takes effect at the current period's end
    DowngradeScheduled { target: PlanTier },
}

pub struct SubscriptionService {
    store: SubscriptionStore,
    gateway: Arc<dyn PaymentGateway>,
    catalog: PlanCatalog,
}

impl SubscriptionService {
    pub fn new(
        store: SubscriptionStore,
        gateway: Arc<dyn PaymentGateway>,
        catalog: PlanCatalog,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
        }
    }

    /// Create a subscription for the user at the given price
    ///
    /// Keys are not granted here. The webhook path grants them once the
    /// processor confirms the subscription is active, so a failed first
    /// payment never credits the account.
    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        price_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<CreatedSubscription> {
        let user = self.store.get_user(user_id).await?;
        let customer_id = user
            .stripe_customer_id
            .ok_or_else(|| BillingError::CustomerNotFound(user_id.to_string()))?;

        self.gateway
            .attach_default_payment_method(&customer_id, payment_method_id)
            .await?;

        let sub = self
            .gateway
            .create_subscription(&customer_id, price_id)
            .await?;

        let plan = self.catalog.resolve(price_id);
        if !plan.is_recognized() {
            warn!(user_id = %user_id, price_id, "subscribed to unconfigured price");
        }

        let (period_start, period_end) =
            period_bounds(sub.current_period_start, sub.current_period_end)?;
        self.store
            .upsert(SubscriptionUpsert {
                user_id,
                stripe_subscription_id: sub.id.clone(),
                stripe_customer_id: customer_id,
                stripe_price_id: price_id.to_string(),
                plan_type: plan,
                status: sub.status,
                current_period_start: period_start,
                current_period_end: period_end,
            })
            .await?;

        info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            plan = %plan,
            "subscription created"
        );

        Ok(CreatedSubscription {
            subscription_id: sub.id,
            status: sub.status,
            client_secret: sub.client_secret,
        })
    }

    /// Change the user's plan: immediate for upgrades, scheduled for
    /// downgrades, no-op for same rank
    pub async fn change_plan(
        &self,
        user_id: Uuid,
        new_price_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<PlanChangeOutcome> {
        let record = self
            .store
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        self.gateway
            .attach_default_payment_method(&record.stripe_customer_id, payment_method_id)
            .await?;

        // The processor is the authority on the currently billed price; the
        // local row may lag behind a pending webhook.
        let live = self
            .gateway
            .retrieve_subscription(&record.stripe_subscription_id)
            .await?;
        let current_price = live.price_id.clone().ok_or_else(|| {
            BillingError::Internal(format!(
                "subscription {} has no billed item",
                record.stripe_subscription_id
            ))
        })?;

        match self.catalog.classify(&current_price, new_price_id) {
            PlanChange::NoChange => {
                info!(user_id = %user_id, price_id = new_price_id, "plan unchanged, skipping");
                Ok(PlanChangeOutcome::Unchanged)
            }
            PlanChange::Unknown => Err(BillingError::UnrecognizedPlan(new_price_id.to_string())),
            PlanChange::Upgrade => {
                apply_upgrade(self.gateway.as_ref(), &live, new_price_id).await?;
                let plan = self.catalog.resolve(new_price_id);
                info!(user_id = %user_id, plan = %plan, "upgraded immediately");
                Ok(PlanChangeOutcome::Upgraded { plan })
            }
            PlanChange::Downgrade => {
                schedule_downgrade(self.gateway.as_ref(), &live, &current_price, new_price_id)
                    .await?;
                let target = self.catalog.resolve(new_price_id);
                info!(user_id = %user_id, target = %target, "downgrade scheduled for period end");
                Ok(PlanChangeOutcome::DowngradeScheduled { target })
            }
        }
    }

    /// Set or clear deferred cancellation
    ///
    /// A pending downgrade schedule is released first in either direction: a
    /// cancellation request supersedes a scheduled downgrade, and reversing a
    /// cancellation should not resurrect one.
    pub async fn cancel_subscription(
        &self,
        user_id: Uuid,
        cancel_at_period_end: bool,
    ) -> BillingResult<SubscriptionRecord> {
        let record = self
            .store
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        let live = self
            .gateway
            .retrieve_subscription(&record.stripe_subscription_id)
            .await?;
        apply_cancellation(self.gateway.as_ref(), &live, cancel_at_period_end).await?;

        info!(
            user_id = %user_id,
            cancel_at_period_end,
            "cancellation flag sent, awaiting webhook confirmation"
        );

        // Local status only transitions on webhook confirmation; return the
        // current local view.
        Ok(record)
    }

    /// The user's usable subscription, or None
    ///
    /// A lapsed subscription and a never-created one look identical to
    /// callers.
    pub async fn check_status(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record = self.store.find_by_user(user_id).await?;
        Ok(record.filter(|r| r.status.is_active()))
    }
}

/// Swap the billed item to the new price, charged now with no proration
async fn apply_upgrade(
    gateway: &dyn PaymentGateway,
    live: &GatewaySubscription,
    new_price_id: &str,
) -> BillingResult<GatewaySubscription> {
    let item_id = live.item_id.as_deref().ok_or_else(|| {
        BillingError::Internal(format!("subscription {} has no billed item", live.id))
    })?;
    gateway
        .change_subscription_price(&live.id, item_id, new_price_id)
        .await
}

/// Release any existing schedule, then create a fresh two-phase downgrade
/// schedule. Releasing first keeps at most one schedule pending no matter how
/// many times the user changes their mind.
async fn schedule_downgrade(
    gateway: &dyn PaymentGateway,
    live: &GatewaySubscription,
    current_price_id: &str,
    new_price_id: &str,
) -> BillingResult<String> {
    if let Some(schedule_id) = &live.schedule_id {
        gateway.release_schedule(schedule_id).await?;
    }
    gateway
        .create_downgrade_schedule(
            &live.id,
            current_price_id,
            new_price_id,
            live.current_period_start,
            live.current_period_end,
        )
        .await
}

/// Release any pending downgrade schedule, then apply the cancellation flag
async fn apply_cancellation(
    gateway: &dyn PaymentGateway,
    live: &GatewaySubscription,
    cancel_at_period_end: bool,
) -> BillingResult<GatewaySubscription> {
    if let Some(schedule_id) = &live.schedule_id {
        gateway.release_schedule(schedule_id).await?;
    }
    gateway
        .set_cancel_at_period_end(&live.id, cancel_at_period_end)
        .await
}

fn period_bounds(
    start: i64,
    end: i64,
) -> BillingResult<(OffsetDateTime, Option<OffsetDateTime>)> {
    let start = OffsetDateTime::from_unix_timestamp(start)
        .map_err(|_| BillingError::Internal(format!("invalid period start: {start}")))?;
    let end = OffsetDateTime::from_unix_timestamp(end).ok();
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{subscription_fixture, GatewayCall, MockGateway};

    fn snapshot(gateway: &MockGateway) -> GatewaySubscription {
        gateway.subscription.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn upgrade_swaps_price_without_touching_schedules() {
        let gateway = MockGateway::new(subscription_fixture());
        let live = snapshot(&gateway);

        apply_upgrade(&gateway, &live, "price_pro_789").await.unwrap();

        let calls = gateway.calls();
        assert!(calls.contains(&GatewayCall::ChangeSubscriptionPrice {
            subscription_id: "sub_mock_1".to_string(),
            item_id: "si_mock_1".to_string(),
            price_id: "price_pro_789".to_string(),
        }));
        assert!(!calls
            .iter()
            .any(|c| matches!(c, GatewayCall::CreateDowngradeSchedule { .. })));
        assert!(!calls
            .iter()
            .any(|c| matches!(c, GatewayCall::ReleaseSchedule { .. })));
    }

    #[tokio::test]
    async fn downgrade_without_pending_schedule_creates_one() {
        let gateway = MockGateway::new(subscription_fixture());
        let live = snapshot(&gateway);

        schedule_downgrade(&gateway, &live, "price_premium_456", "price_basic_123")
            .await
            .unwrap();

        assert_eq!(
            gateway.calls(),
            vec![GatewayCall::CreateDowngradeSchedule {
                subscription_id: "sub_mock_1".to_string(),
                current_price_id: "price_premium_456".to_string(),
                new_price_id: "price_basic_123".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn repeated_downgrade_releases_previous_schedule_first() {
        let gateway = MockGateway::new(subscription_fixture());

        let live = snapshot(&gateway);
        schedule_downgrade(&gateway, &live, "price_premium_456", "price_basic_123")
            .await
            .unwrap();

        // Second request sees the schedule the first one attached.
        let live = snapshot(&gateway);
        assert!(live.schedule_id.is_some());
        schedule_downgrade(&gateway, &live, "price_premium_456", "price_basic_123")
            .await
            .unwrap();

        let calls = gateway.calls();
        let releases = calls
            .iter()
            .filter(|c| matches!(c, GatewayCall::ReleaseSchedule { .. }))
            .count();
        let creates = calls
            .iter()
            .filter(|c| matches!(c, GatewayCall::CreateDowngradeSchedule { .. }))
            .count();
        assert_eq!(releases, 1);
        assert_eq!(creates, 2);
        // The release lands between the two creates.
        assert_eq!(
            calls[1],
            GatewayCall::ReleaseSchedule {
                schedule_id: "sub_sched_mock_1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn cancel_then_uncancel_leaves_flag_off_and_no_schedule() {
        let gateway = MockGateway::new(subscription_fixture());

        // User downgrades, then cancels, then changes their mind.
        let live = snapshot(&gateway);
        schedule_downgrade(&gateway, &live, "price_premium_456", "price_basic_123")
            .await
            .unwrap();

        let live = snapshot(&gateway);
        apply_cancellation(&gateway, &live, true).await.unwrap();

        let live = snapshot(&gateway);
        apply_cancellation(&gateway, &live, false).await.unwrap();

        let final_state = snapshot(&gateway);
        assert!(!final_state.cancel_at_period_end);
        assert!(final_state.schedule_id.is_none());
    }

    #[test]
    fn period_bounds_parse_epoch_seconds() {
        let (start, end) = period_bounds(1_700_000_000, 1_702_592_000).unwrap();
        assert_eq!(start.unix_timestamp(), 1_700_000_000);
        assert_eq!(end.map(|e| e.unix_timestamp()), Some(1_702_592_000));
    }
}
