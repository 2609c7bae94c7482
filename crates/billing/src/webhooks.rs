//! Stripe webhook reconciliation
//!
//! The single authority for transitioning local subscription state. Events
//! arrive out of order, duplicated, or for rows that do not exist yet; every
//! write here is an absolute-value update keyed by the processor subscription
//! id, and the only additive operation is the key grant.
//!
//! Error policy: an invalid signature is the only terminal failure. Every
//! handler failure is caught, recorded, and acknowledged anyway, because the
//! processor retries unacknowledged events indefinitely and most handlers are
//! not safely re-driveable from scratch.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use stripe::{Event, EventObject, EventType, Expandable, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;
use workbridge_shared::{ContractStatus, OrderStatus, PaymentType, SubscriptionStatus};

use crate::allocation::one_month_after;
use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventLogger, BillingEventType};
use crate::gateway::map_status;
use crate::notify::{contract_room, RealtimeNotifier};
use crate::store::SubscriptionStore;

type HmacSha256 = Hmac<Sha256>;

/// Marketplace cut per order, in cents
const PLATFORM_FEE_CENTS: i64 = 100;

/// Events stuck in processing longer than this can be re-claimed
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

pub struct WebhookHandler {
    store: SubscriptionStore,
    catalog: PlanCatalog,
    notifier: Arc<dyn RealtimeNotifier>,
    event_logger: BillingEventLogger,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(
        store: SubscriptionStore,
        catalog: PlanCatalog,
        notifier: Arc<dyn RealtimeNotifier>,
        webhook_secret: String,
    ) -> Self {
        let event_logger = BillingEventLogger::new(store.pool().clone());
        Self {
            store,
            catalog,
            notifier,
            event_logger,
            webhook_secret,
        }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// Tries the SDK's verification first, then falls back to manual
    /// signature verification, which tolerates payloads from newer Stripe API
    /// versions that the SDK's parser rejects.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        match Webhook::construct_event(payload, signature, &self.webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        check_signature(payload, signature, &self.webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::debug!(
            event_type = %event.type_,
            event_id = %event.id,
            "manual webhook verification succeeded"
        );
        Ok(event)
    }

    /// Process a verified event
    ///
    /// An INSERT..ON CONFLICT..RETURNING claim gives exactly one concurrent
    /// delivery processing rights for an event id; duplicates are
    /// acknowledged without side effects. Handler failures are recorded on
    /// the claim row and acknowledged.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(self.store.pool())
        .await?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "duplicate webhook event, already claimed"
            );
            return Ok(());
        }

        tracing::info!(event_id = %event_id, event_type = %event_type, "processing webhook event");

        let result = self.dispatch(&event).await;
        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            "UPDATE stripe_webhook_events
             SET processing_result = $1, error_message = $2
             WHERE stripe_event_id = $3",
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(self.store.pool())
        .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "failed to update webhook audit record"
            );
        }

        if let Err(e) = result {
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                error = %e,
                "webhook handler failed, acknowledging anyway"
            );
        }
        Ok(())
    }

    async fn dispatch(&self, event: &Event) -> BillingResult<()> {
        match event.type_ {
            EventType::ChargeSucceeded => self.handle_charge_succeeded(event).await,
            EventType::PaymentIntentSucceeded => self.handle_payment_succeeded(event).await,
            EventType::PaymentIntentPaymentFailed => self.handle_payment_failed(event).await,
            EventType::CustomerSubscriptionCreated => {
                self.handle_subscription_created(event).await
            }
            EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_updated(event).await
            }
            EventType::SubscriptionScheduleUpdated => self.handle_schedule_updated(event).await,
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event).await
            }
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "unhandled webhook event type"
                );
                Ok(())
            }
        }
    }

    /// charge.succeeded: open a contract and its order from charge metadata
    ///
    /// Charges without the full contract metadata are unrelated to this flow
    /// and skipped without error.
    async fn handle_charge_succeeded(&self, event: &Event) -> BillingResult<()> {
        let charge = match &event.data.object {
            EventObject::Charge(charge) => charge,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected Charge".to_string(),
                ))
            }
        };

        let Some(meta) = ContractMetadata::parse(&charge.metadata) else {
            tracing::info!(charge_id = %charge.id, "charge without contract metadata, skipping");
            return Ok(());
        };

        let payment_intent_id = match &charge.payment_intent {
            Some(Expandable::Id(id)) => id.to_string(),
            Some(Expandable::Object(pi)) => pi.id.to_string(),
            None => String::new(),
        };

        let contract_id: (Uuid,) = sqlx::query_as(
            "INSERT INTO contracts
                (id, job_id, client_id, talent_id, description, status, rate,
                 payment_type, timeline, stripe_payment_intent_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(meta.job_id)
        .bind(meta.client_id)
        .bind(meta.talent_id)
        .bind(&meta.description)
        .bind(meta.status)
        .bind(meta.rate)
        .bind(meta.payment_type)
        .bind(&meta.timeline)
        .bind(&payment_intent_id)
        .fetch_one(self.store.pool())
        .await?;

        let talent = self.store.get_user(meta.talent_id).await?;

        sqlx::query(
            "INSERT INTO orders
                (id, contract_id, client_id, talent_id, amount, platform_fee,
                 status, stripe_account_id, stripe_payment_intent_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(Uuid::new_v4())
        .bind(contract_id.0)
        .bind(meta.client_id)
        .bind(meta.talent_id)
        .bind(meta.rate)
        .bind(PLATFORM_FEE_CENTS)
        .bind(OrderStatus::Pending)
        .bind(talent.stripe_account_id.unwrap_or_default())
        .bind(&payment_intent_id)
        .execute(self.store.pool())
        .await?;

        self.event_logger
            .log_best_effort(
                Some(meta.talent_id),
                BillingEventType::ContractCreated,
                json!({ "contract_id": contract_id.0, "job_id": meta.job_id }),
            )
            .await;

        if let Err(e) = self
            .notifier
            .publish(
                &contract_room(&meta.talent_id.to_string()),
                "contract created",
                json!({
                    "contract_id": contract_id.0,
                    "job_id": meta.job_id,
                    "client_id": meta.client_id,
                    "rate": meta.rate,
                }),
            )
            .await
        {
            tracing::warn!(error = %e, "failed to publish contract notification");
        }

        tracing::info!(
            contract_id = %contract_id.0,
            talent_id = %meta.talent_id,
            "contract and order created from charge"
        );
        Ok(())
    }

    /// payment_intent.succeeded: mark the order charged
    async fn handle_payment_succeeded(&self, event: &Event) -> BillingResult<()> {
        let intent = match &event.data.object {
            EventObject::PaymentIntent(intent) => intent,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected PaymentIntent".to_string(),
                ))
            }
        };

        let Some(order_id) = parse_order_id(&intent.metadata) else {
            tracing::info!(payment_intent_id = %intent.id, "payment without order id, skipping");
            return Ok(());
        };

        sqlx::query("UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(order_id)
            .bind(OrderStatus::Charged)
            .execute(self.store.pool())
            .await?;

        self.event_logger
            .log_best_effort(
                None,
                BillingEventType::OrderCharged,
                json!({ "order_id": order_id }),
            )
            .await;
        tracing::info!(order_id = %order_id, "order marked charged");
        Ok(())
    }

    /// payment_intent.payment_failed: cancel the order
    async fn handle_payment_failed(&self, event: &Event) -> BillingResult<()> {
        let intent = match &event.data.object {
            EventObject::PaymentIntent(intent) => intent,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected PaymentIntent".to_string(),
                ))
            }
        };

        let Some(order_id) = parse_order_id(&intent.metadata) else {
            tracing::info!(payment_intent_id = %intent.id, "failed payment without order id, skipping");
            return Ok(());
        };

        sqlx::query("UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(order_id)
            .bind(OrderStatus::Cancelled)
            .execute(self.store.pool())
            .await?;

        self.event_logger
            .log_best_effort(
                None,
                BillingEventType::OrderCancelled,
                json!({ "order_id": order_id }),
            )
            .await;
        tracing::info!(order_id = %order_id, "order cancelled after failed payment");
        Ok(())
    }

    /// customer.subscription.created: activate the locally created row and
    /// grant the first month's keys
    async fn handle_subscription_created(&self, event: &Event) -> BillingResult<()> {
        let sub = match &event.data.object {
            EventObject::Subscription(sub) => sub,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected Subscription".to_string(),
                ))
            }
        };

        let sub_id = sub.id.to_string();
        let Some(price_id) = first_price_id(sub) else {
            tracing::warn!(subscription_id = %sub_id, "created subscription has no billed item");
            return Ok(());
        };

        let plan = self.catalog.resolve(&price_id);
        let now = OffsetDateTime::now_utc();
        let period_start = OffsetDateTime::from_unix_timestamp(sub.current_period_start)
            .unwrap_or(now);
        let period_end = OffsetDateTime::from_unix_timestamp(sub.current_period_end).ok();

        let record = self
            .store
            .apply_plan_change(
                &sub_id,
                &price_id,
                plan,
                SubscriptionStatus::Active,
                period_start,
                period_end,
                now,
                one_month_after(now),
            )
            .await?;

        let Some(record) = record else {
            // Webhook beat the controller's local write; the controller's
            // upsert will carry the same state shortly.
            tracing::warn!(subscription_id = %sub_id, "created event for unknown subscription");
            return Ok(());
        };

        // Every recognized tier gets its first month of keys on activation.
        let amount = plan.monthly_keys();
        if amount > 0 {
            let balance = self.store.grant_keys(record.user_id, amount).await?;
            self.event_logger
                .log_best_effort(
                    Some(record.user_id),
                    BillingEventType::KeysGranted,
                    json!({ "amount": amount, "balance": balance, "reason": "subscription_created" }),
                )
                .await;
            tracing::info!(
                user_id = %record.user_id,
                plan = %plan,
                amount,
                "initial keys granted"
            );
        }

        self.event_logger
            .log_best_effort(
                Some(record.user_id),
                BillingEventType::SubscriptionCreated,
                json!({ "plan": plan, "subscription_id": sub_id }),
            )
            .await;
        Ok(())
    }

    /// customer.subscription.updated: reconcile plan and renewal state
    ///
    /// A plan change is detected by comparing the incoming price against the
    /// stored row, not against the processor's previous-attributes diff,
    /// which guards against unrelated field changes firing the grant twice.
    async fn handle_subscription_updated(&self, event: &Event) -> BillingResult<()> {
        let sub = match &event.data.object {
            EventObject::Subscription(sub) => sub,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected Subscription".to_string(),
                ))
            }
        };

        let sub_id = sub.id.to_string();
        let Some(record) = self.store.find_by_stripe_id(&sub_id).await? else {
            tracing::warn!(subscription_id = %sub_id, "update for unknown subscription, skipping");
            return Ok(());
        };

        let now = OffsetDateTime::now_utc();
        let period_start = OffsetDateTime::from_unix_timestamp(sub.current_period_start)
            .unwrap_or(now);
        let period_end = OffsetDateTime::from_unix_timestamp(sub.current_period_end).ok();

        let incoming_price = first_price_id(sub);
        if let Some(price_id) = changed_price(&record.stripe_price_id, incoming_price) {
            let plan = self.catalog.resolve(&price_id);
            self.store
                .apply_plan_change(
                    &sub_id,
                    &price_id,
                    plan,
                    map_status(sub.status),
                    period_start,
                    period_end,
                    now,
                    one_month_after(now),
                )
                .await?;

            let amount = plan.monthly_keys();
            if amount > 0 {
                let balance = self.store.grant_keys(record.user_id, amount).await?;
                self.event_logger
                    .log_best_effort(
                        Some(record.user_id),
                        BillingEventType::KeysGranted,
                        json!({ "amount": amount, "balance": balance, "reason": "plan_changed" }),
                    )
                    .await;
            }

            self.event_logger
                .log_best_effort(
                    Some(record.user_id),
                    BillingEventType::SubscriptionUpdated,
                    json!({ "from": record.plan_type, "to": plan }),
                )
                .await;
            tracing::info!(
                user_id = %record.user_id,
                from = %record.plan_type,
                to = %plan,
                "plan change confirmed"
            );
        }

        // Always refresh renewal state; a pending downgrade is superseded by
        // whatever the processor now reports.
        self.store
            .set_cancel_at_period_end(&sub_id, sub.cancel_at_period_end, period_end)
            .await?;
        Ok(())
    }

    /// subscription_schedule.updated: record a pending downgrade
    ///
    /// Only schedules tagged as downgrades are ours; the active plan is left
    /// untouched until the scheduled phase actually starts.
    async fn handle_schedule_updated(&self, event: &Event) -> BillingResult<()> {
        let schedule = match &event.data.object {
            EventObject::SubscriptionSchedule(schedule) => schedule,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected SubscriptionSchedule".to_string(),
                ))
            }
        };

        let is_downgrade = schedule
            .metadata
            .as_ref()
            .and_then(|m| m.get("type"))
            .is_some_and(|t| t == "downgrade");
        if !is_downgrade {
            return Ok(());
        }

        let Some(sub_id) = schedule.subscription.as_ref().map(|s| s.id().to_string()) else {
            tracing::warn!(schedule_id = %schedule.id, "downgrade schedule without subscription");
            return Ok(());
        };

        // The second phase carries the post-downgrade price.
        let target_price = schedule
            .phases
            .get(1)
            .and_then(|phase| phase.items.first())
            .map(|item| item.price.id().to_string());
        let Some(target_price) = target_price else {
            tracing::warn!(schedule_id = %schedule.id, "downgrade schedule without target phase");
            return Ok(());
        };

        let target = self.catalog.resolve(&target_price);
        let record = self.store.mark_downgrade_pending(&sub_id, target).await?;
        match record {
            Some(record) => {
                self.event_logger
                    .log_best_effort(
                        Some(record.user_id),
                        BillingEventType::DowngradeScheduled,
                        json!({ "target": target }),
                    )
                    .await;
                tracing::info!(
                    subscription_id = %sub_id,
                    target = %target,
                    "downgrade pending at period end"
                );
            }
            None => {
                tracing::warn!(subscription_id = %sub_id, "downgrade schedule for unknown subscription");
            }
        }
        Ok(())
    }

    /// customer.subscription.deleted: terminal local transition
    async fn handle_subscription_deleted(&self, event: &Event) -> BillingResult<()> {
        let sub = match &event.data.object {
            EventObject::Subscription(sub) => sub,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected Subscription".to_string(),
                ))
            }
        };

        let sub_id = sub.id.to_string();
        match self.store.mark_cancelled(&sub_id).await? {
            Some(record) => {
                self.event_logger
                    .log_best_effort(
                        Some(record.user_id),
                        BillingEventType::SubscriptionCancelled,
                        json!({ "subscription_id": sub_id }),
                    )
                    .await;
                tracing::info!(subscription_id = %sub_id, "subscription cancelled");
            }
            None => {
                tracing::warn!(subscription_id = %sub_id, "deletion for unknown subscription");
            }
        }
        Ok(())
    }
}

/// Manual verification of the Stripe-Signature header
///
/// Header format: `t=<epoch>,v1=<hex hmac>`. The signed payload is
/// `<timestamp>.<body>` keyed with the webhook secret, and timestamps more
/// than five minutes from `now` are rejected.
fn check_signature(payload: &str, signature: &str, secret: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => v1_signature = Some(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    if (now - timestamp).abs() > 300 {
        tracing::warn!(timestamp, now, "webhook timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// Contract fields a charge must carry for the marketplace flow
#[derive(Debug, Clone, PartialEq)]
struct ContractMetadata {
    job_id: Uuid,
    client_id: Uuid,
    talent_id: Uuid,
    description: String,
    status: ContractStatus,
    rate: f64,
    payment_type: PaymentType,
    timeline: String,
}

impl ContractMetadata {
    /// None when any required field is missing or malformed; such charges
    /// are unrelated to contract creation
    fn parse(metadata: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            job_id: metadata.get("jobId").and_then(|v| Uuid::parse_str(v).ok())?,
            client_id: metadata
                .get("clientId")
                .and_then(|v| Uuid::parse_str(v).ok())?,
            talent_id: metadata
                .get("talentId")
                .and_then(|v| Uuid::parse_str(v).ok())?,
            description: metadata.get("description").filter(|v| !v.is_empty())?.clone(),
            status: ContractStatus::from_metadata(
                metadata.get("status").map(String::as_str).unwrap_or(""),
            ),
            rate: metadata.get("rate").and_then(|v| v.parse().ok())?,
            payment_type: PaymentType::from_metadata(
                metadata.get("paymentType").map(String::as_str).unwrap_or(""),
            ),
            timeline: metadata.get("timeline").filter(|v| !v.is_empty())?.clone(),
        })
    }
}

/// The price the stored row must move to, or None when the event carries no
/// price change
///
/// Comparing against the stored row (rather than the event's diff) keeps
/// unrelated subscription updates and replayed events from re-firing the
/// plan-change grant.
fn changed_price(stored_price_id: &str, incoming_price_id: Option<String>) -> Option<String> {
    incoming_price_id.filter(|p| p != stored_price_id)
}

fn parse_order_id(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata.get("orderId").and_then(|v| Uuid::parse_str(v).ok())
}

fn first_price_id(sub: &stripe::Subscription) -> Option<String> {
    sub.items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={sig}")
    }

    #[test]
    fn valid_signature_passes() {
        let payload = r#"{"id":"evt_1","type":"charge.succeeded"}"#;
        let secret = "whsec_test_secret";
        let now = 1_700_000_000;
        let header = sign(payload, secret, now);
        assert!(check_signature(payload, &header, secret, now).is_ok());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let secret = "whsec_test_secret";
        let now = 1_700_000_000;
        let header = sign(r#"{"id":"evt_1"}"#, secret, now);
        let result = check_signature(r#"{"id":"evt_2"}"#, &header, secret, now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "whsec_test_secret";
        let signed_at = 1_700_000_000;
        let header = sign(payload, secret, signed_at);
        let result = check_signature(payload, &header, secret, signed_at + 301);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn malformed_header_is_rejected() {
        let result = check_signature("{}", "not-a-signature-header", "whsec_x", 0);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));

        let result = check_signature("{}", "t=123", "whsec_x", 123);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn contract_metadata_requires_all_fields() {
        let talent = Uuid::new_v4();
        let mut meta = HashMap::new();
        meta.insert("jobId".to_string(), Uuid::new_v4().to_string());
        meta.insert("clientId".to_string(), Uuid::new_v4().to_string());
        meta.insert("talentId".to_string(), talent.to_string());
        meta.insert("description".to_string(), "Landing page build".to_string());
        meta.insert("rate".to_string(), "250".to_string());
        meta.insert("paymentType".to_string(), "FIXED".to_string());
        meta.insert("timeline".to_string(), "2 weeks".to_string());

        let parsed = ContractMetadata::parse(&meta).unwrap();
        assert_eq!(parsed.talent_id, talent);
        assert_eq!(parsed.payment_type, PaymentType::Fixed);
        assert_eq!(parsed.status, ContractStatus::Active);
        assert!((parsed.rate - 250.0).abs() < f64::EPSILON);

        meta.remove("timeline");
        assert!(ContractMetadata::parse(&meta).is_none());
    }

    #[test]
    fn unrelated_charge_metadata_is_skipped() {
        let mut meta = HashMap::new();
        meta.insert("invoice".to_string(), "in_123".to_string());
        assert!(ContractMetadata::parse(&meta).is_none());
        assert!(ContractMetadata::parse(&HashMap::new()).is_none());
    }

    #[test]
    fn price_change_fires_only_on_a_differing_incoming_price() {
        assert_eq!(
            changed_price("price_basic_123", Some("price_pro_789".to_string())),
            Some("price_pro_789".to_string())
        );
        // Same price again (renewal, metadata edit, replayed event): no change.
        assert_eq!(
            changed_price("price_basic_123", Some("price_basic_123".to_string())),
            None
        );
        // Event without a billed item never counts as a change.
        assert_eq!(changed_price("price_basic_123", None), None);
    }

    #[test]
    fn order_id_parses_only_valid_uuids() {
        let id = Uuid::new_v4();
        let mut meta = HashMap::new();
        meta.insert("orderId".to_string(), id.to_string());
        assert_eq!(parse_order_id(&meta), Some(id));

        meta.insert("orderId".to_string(), "order_42".to_string());
        assert_eq!(parse_order_id(&meta), None);
    }
}
