//! Payment gateway abstraction over Stripe
//!
//! The services talk to [`PaymentGateway`] rather than to the Stripe SDK
//! directly so the plan-change and cancellation flows can be exercised with a
//! mock gateway. [`StripeGateway`] is the production implementation.
//!
//! Subscription schedules are driven through raw form posts because the
//! generated schedule params in async-stripe do not cover from-subscription
//! creation or phase replacement (same workaround as the webhook module).

use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use stripe::{
    AttachPaymentMethod, CreateSubscription, CreateSubscriptionItems,
    CreateSubscriptionPaymentSettings, CreateSubscriptionPaymentSettingsPaymentMethodTypes,
    CreateSubscriptionPaymentSettingsSaveDefaultPaymentMethod, CustomerId,
    CustomerInvoiceSettings, Expandable, PaymentMethod, PaymentMethodId, Subscription,
    SubscriptionId, SubscriptionSchedule, UpdateCustomer, UpdateSubscription,
    UpdateSubscriptionItems,
};
use stripe::generated::billing::subscription::{
    SubscriptionBillingCycleAnchor, SubscriptionPaymentBehavior, SubscriptionProrationBehavior,
};
use workbridge_shared::SubscriptionStatus;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Snapshot of a processor-side subscription, reduced to the fields the
/// billing flows act on
#[derive(Debug, Clone)]
pub struct GatewaySubscription {
    pub id: String,
    pub status: SubscriptionStatus,
    /// Price id of the first subscription item
    pub price_id: Option<String>,
    /// Item id of the first subscription item (needed for price swaps)
    pub item_id: Option<String>,
    /// Attached subscription schedule, if any
    pub schedule_id: Option<String>,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub cancel_at_period_end: bool,
    /// Payment intent client secret from the latest invoice, present on
    /// freshly created subscriptions that still need confirmation
    pub client_secret: Option<String>,
}

/// Operations the billing flows need from the payment processor
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Attach a payment method to a customer and make it the default for
    /// invoices
    async fn attach_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    /// Create a subscription on the given price, returning it with the
    /// payment intent expanded
    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> BillingResult<GatewaySubscription>;

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<GatewaySubscription>;

    /// Swap the subscription item to a new price, billed immediately with no
    /// proration and the billing cycle re-anchored to now
    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
    ) -> BillingResult<GatewaySubscription>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<GatewaySubscription>;

    /// Create a two-phase schedule that keeps the current price until the
    /// period ends, then runs one iteration of the new price. Returns the
    /// schedule id.
    async fn create_downgrade_schedule(
        &self,
        subscription_id: &str,
        current_price_id: &str,
        new_price_id: &str,
        period_start: i64,
        period_end: i64,
    ) -> BillingResult<String>;

    /// Detach a schedule from its subscription, leaving the subscription on
    /// its current price
    async fn release_schedule(&self, schedule_id: &str) -> BillingResult<()>;
}

/// Production gateway backed by the Stripe API
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

fn parse_customer_id(raw: &str) -> BillingResult<CustomerId> {
    CustomerId::from_str(raw)
        .map_err(|_| BillingError::InvalidInput(format!("invalid customer id: {raw}")))
}

fn parse_subscription_id(raw: &str) -> BillingResult<SubscriptionId> {
    SubscriptionId::from_str(raw)
        .map_err(|_| BillingError::InvalidInput(format!("invalid subscription id: {raw}")))
}

pub(crate) fn map_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    match status {
        stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
        stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
        stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
        stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
        stripe::SubscriptionStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
        stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Cancelled,
        stripe::SubscriptionStatus::Paused => SubscriptionStatus::Paused,
    }
}

/// Parameters for a new card subscription
///
/// Created incomplete so the client confirms the first payment, with the
/// payment method saved as the subscription default on the first successful
/// charge. The payment intent is expanded for its client secret.
fn create_subscription_params(customer: CustomerId, price_id: &str) -> CreateSubscription<'static> {
    let mut params = CreateSubscription::new(customer);
    params.items = Some(vec![CreateSubscriptionItems {
        price: Some(price_id.to_string()),
        ..Default::default()
    }]);
    params.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);
    params.payment_settings = Some(CreateSubscriptionPaymentSettings {
        payment_method_types: Some(vec![
            CreateSubscriptionPaymentSettingsPaymentMethodTypes::Card,
        ]),
        save_default_payment_method: Some(
            CreateSubscriptionPaymentSettingsSaveDefaultPaymentMethod::OnSubscription,
        ),
        ..Default::default()
    });
    params.expand = &["latest_invoice.payment_intent"];
    params
}

fn to_gateway_subscription(sub: Subscription) -> GatewaySubscription {
    let item = sub.items.data.first();
    let client_secret = match &sub.latest_invoice {
        Some(Expandable::Object(invoice)) => match &invoice.payment_intent {
            Some(Expandable::Object(intent)) => intent.client_secret.clone(),
            _ => None,
        },
        _ => None,
    };
    GatewaySubscription {
        id: sub.id.to_string(),
        status: map_status(sub.status),
        price_id: item.and_then(|i| i.price.as_ref()).map(|p| p.id.to_string()),
        item_id: item.map(|i| i.id.to_string()),
        schedule_id: sub.schedule.as_ref().map(|s| s.id().to_string()),
        current_period_start: sub.current_period_start,
        current_period_end: sub.current_period_end,
        cancel_at_period_end: sub.cancel_at_period_end,
        client_secret,
    }
}

// Form payloads for the schedule endpoints the SDK does not generate params
// for. Field paths follow the Stripe API reference.
#[derive(Serialize)]
struct CreateScheduleFromSubscription<'a> {
    from_subscription: &'a str,
}

#[derive(Serialize)]
struct SchedulePhaseItem<'a> {
    price: &'a str,
    quantity: u64,
}

#[derive(Serialize)]
struct SchedulePhase<'a> {
    items: Vec<SchedulePhaseItem<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iterations: Option<u64>,
}

#[derive(Serialize)]
struct ScheduleMetadata<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Serialize)]
struct UpdateSchedulePhases<'a> {
    phases: Vec<SchedulePhase<'a>>,
    metadata: ScheduleMetadata<'a>,
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn attach_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let customer = parse_customer_id(customer_id)?;
        let pm_id = PaymentMethodId::from_str(payment_method_id).map_err(|_| {
            BillingError::InvalidInput(format!("invalid payment method id: {payment_method_id}"))
        })?;

        PaymentMethod::attach(
            self.stripe.inner(),
            &pm_id,
            AttachPaymentMethod {
                customer: customer.clone(),
            },
        )
        .await?;

        stripe::Customer::update(
            self.stripe.inner(),
            &customer,
            UpdateCustomer {
                invoice_settings: Some(CustomerInvoiceSettings {
                    default_payment_method: Some(payment_method_id.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await?;

        Ok(())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        let customer = parse_customer_id(customer_id)?;
        let params = create_subscription_params(customer, price_id);
        let sub = Subscription::create(self.stripe.inner(), params).await?;
        Ok(to_gateway_subscription(sub))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let sub = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        Ok(to_gateway_subscription(sub))
    }

    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let mut params = UpdateSubscription::new();
        params.items = Some(vec![UpdateSubscriptionItems {
            id: Some(item_id.to_string()),
            price: Some(price_id.to_string()),
            ..Default::default()
        }]);
        params.proration_behavior = Some(SubscriptionProrationBehavior::None);
        params.billing_cycle_anchor = Some(SubscriptionBillingCycleAnchor::Now);

        let sub = Subscription::update(self.stripe.inner(), &sub_id, params).await?;
        Ok(to_gateway_subscription(sub))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<GatewaySubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(cancel);

        let sub = Subscription::update(self.stripe.inner(), &sub_id, params).await?;
        Ok(to_gateway_subscription(sub))
    }

    async fn create_downgrade_schedule(
        &self,
        subscription_id: &str,
        current_price_id: &str,
        new_price_id: &str,
        period_start: i64,
        period_end: i64,
    ) -> BillingResult<String> {
        let schedule: SubscriptionSchedule = self
            .stripe
            .inner()
            .post_form(
                "/subscription_schedules",
                CreateScheduleFromSubscription {
                    from_subscription: subscription_id,
                },
            )
            .await?;

        // Replace the inherited single phase: current price to period end,
        // then one iteration of the new price.
        let updated: SubscriptionSchedule = self
            .stripe
            .inner()
            .post_form(
                &format!("/subscription_schedules/{}", schedule.id),
                UpdateSchedulePhases {
                    phases: vec![
                        SchedulePhase {
                            items: vec![SchedulePhaseItem {
                                price: current_price_id,
                                quantity: 1,
                            }],
                            start_date: Some(period_start),
                            end_date: Some(period_end),
                            iterations: None,
                        },
                        SchedulePhase {
                            items: vec![SchedulePhaseItem {
                                price: new_price_id,
                                quantity: 1,
                            }],
                            start_date: None,
                            end_date: None,
                            iterations: Some(1),
                        },
                    ],
                    metadata: ScheduleMetadata { kind: "downgrade" },
                },
            )
            .await?;

        Ok(updated.id.to_string())
    }

    async fn release_schedule(&self, schedule_id: &str) -> BillingResult<()> {
        let _: SubscriptionSchedule = self
            .stripe
            .inner()
            .post(&format!("/subscription_schedules/{schedule_id}/release"))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory gateway for exercising the billing flows without Stripe

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum GatewayCall {
        AttachDefaultPaymentMethod {
            customer_id: String,
            payment_method_id: String,
        },
        CreateSubscription {
            customer_id: String,
            price_id: String,
        },
        RetrieveSubscription {
            subscription_id: String,
        },
        ChangeSubscriptionPrice {
            subscription_id: String,
            item_id: String,
            price_id: String,
        },
        SetCancelAtPeriodEnd {
            subscription_id: String,
            cancel: bool,
        },
        CreateDowngradeSchedule {
            subscription_id: String,
            current_price_id: String,
            new_price_id: String,
        },
        ReleaseSchedule {
            schedule_id: String,
        },
    }

    /// Records every call and answers from a canned subscription
    pub struct MockGateway {
        pub calls: Mutex<Vec<GatewayCall>>,
        pub subscription: Mutex<GatewaySubscription>,
    }

    impl MockGateway {
        pub fn new(subscription: GatewaySubscription) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                subscription: Mutex::new(subscription),
            }
        }

        pub fn calls(&self) -> Vec<GatewayCall> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: GatewayCall) {
            self.calls.lock().unwrap().push(call);
        }

        fn current(&self) -> GatewaySubscription {
            self.subscription.lock().unwrap().clone()
        }
    }

    pub fn subscription_fixture() -> GatewaySubscription {
        GatewaySubscription {
            id: "sub_mock_1".to_string(),
            status: SubscriptionStatus::Active,
            price_id: Some("price_premium_456".to_string()),
            item_id: Some("si_mock_1".to_string()),
            schedule_id: None,
            current_period_start: 1_700_000_000,
            current_period_end: 1_702_592_000,
            cancel_at_period_end: false,
            client_secret: Some("pi_secret_mock".to_string()),
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn attach_default_payment_method(
            &self,
            customer_id: &str,
            payment_method_id: &str,
        ) -> BillingResult<()> {
            self.record(GatewayCall::AttachDefaultPaymentMethod {
                customer_id: customer_id.to_string(),
                payment_method_id: payment_method_id.to_string(),
            });
            Ok(())
        }

        async fn create_subscription(
            &self,
            customer_id: &str,
            price_id: &str,
        ) -> BillingResult<GatewaySubscription> {
            self.record(GatewayCall::CreateSubscription {
                customer_id: customer_id.to_string(),
                price_id: price_id.to_string(),
            });
            let mut sub = self.current();
            sub.price_id = Some(price_id.to_string());
            Ok(sub)
        }

        async fn retrieve_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<GatewaySubscription> {
            self.record(GatewayCall::RetrieveSubscription {
                subscription_id: subscription_id.to_string(),
            });
            Ok(self.current())
        }

        async fn change_subscription_price(
            &self,
            subscription_id: &str,
            item_id: &str,
            price_id: &str,
        ) -> BillingResult<GatewaySubscription> {
            self.record(GatewayCall::ChangeSubscriptionPrice {
                subscription_id: subscription_id.to_string(),
                item_id: item_id.to_string(),
                price_id: price_id.to_string(),
            });
            let mut sub = self.subscription.lock().unwrap();
            sub.price_id = Some(price_id.to_string());
            Ok(sub.clone())
        }

        async fn set_cancel_at_period_end(
            &self,
            subscription_id: &str,
            cancel: bool,
        ) -> BillingResult<GatewaySubscription> {
            self.record(GatewayCall::SetCancelAtPeriodEnd {
                subscription_id: subscription_id.to_string(),
                cancel,
            });
            let mut sub = self.subscription.lock().unwrap();
            sub.cancel_at_period_end = cancel;
            Ok(sub.clone())
        }

        async fn create_downgrade_schedule(
            &self,
            subscription_id: &str,
            current_price_id: &str,
            new_price_id: &str,
            _period_start: i64,
            _period_end: i64,
        ) -> BillingResult<String> {
            self.record(GatewayCall::CreateDowngradeSchedule {
                subscription_id: subscription_id.to_string(),
                current_price_id: current_price_id.to_string(),
                new_price_id: new_price_id.to_string(),
            });
            let schedule_id = "sub_sched_mock_1".to_string();
            self.subscription.lock().unwrap().schedule_id = Some(schedule_id.clone());
            Ok(schedule_id)
        }

        async fn release_schedule(&self, schedule_id: &str) -> BillingResult<()> {
            self.record(GatewayCall::ReleaseSchedule {
                schedule_id: schedule_id.to_string(),
            });
            self.subscription.lock().unwrap().schedule_id = None;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_subscription_saves_card_as_default_on_first_charge() {
        let customer = CustomerId::from_str("cus_test_1").unwrap();
        let params = create_subscription_params(customer, "price_pro_789");

        assert_eq!(
            params.payment_behavior,
            Some(SubscriptionPaymentBehavior::DefaultIncomplete)
        );

        let settings = params.payment_settings.expect("payment settings set");
        assert_eq!(
            settings.save_default_payment_method,
            Some(CreateSubscriptionPaymentSettingsSaveDefaultPaymentMethod::OnSubscription)
        );
        assert_eq!(
            settings.payment_method_types,
            Some(vec![CreateSubscriptionPaymentSettingsPaymentMethodTypes::Card])
        );

        let items = params.items.expect("subscription item set");
        assert_eq!(items[0].price.as_deref(), Some("price_pro_789"));
        assert!(params.expand.contains(&"latest_invoice.payment_intent"));
    }
}
