// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Workbridge Billing Module
//!
//! Stripe integration for the marketplace: subscription plans with monthly
//! key grants, webhook-driven state reconciliation, and contract/order
//! creation from confirmed charges.
//!
//! ## Features
//!
//! - **Subscriptions**: Create, upgrade immediately, downgrade at period end,
//!   cancel
//! - **Key Allocation**: Monthly key grants per plan tier, with a daily
//!   scheduler backstop for cycles no webhook covers
//! - **Webhooks**: Idempotent reconciliation of Stripe events into local
//!   subscription state

pub mod allocation;
pub mod catalog;
pub mod client;
pub mod error;
pub mod events;
pub mod gateway;
pub mod notify;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

pub use allocation::{AllocationSummary, KeyAllocationService};
pub use catalog::{PlanCatalog, PlanChange};
pub use client::{PriceIds, StripeClient, StripeConfig};
pub use error::{BillingError, BillingResult};
pub use events::{BillingEventLogger, BillingEventType};
pub use gateway::{GatewaySubscription, PaymentGateway, StripeGateway};
pub use notify::{NullNotifier, RealtimeNotifier, RedisNotifier};
pub use store::{SubscriptionStore, SubscriptionUpsert};
pub use subscriptions::{CreatedSubscription, PlanChangeOutcome, SubscriptionService};
pub use webhooks::WebhookHandler;

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub allocation: KeyAllocationService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a billing service from environment variables, talking to the
    /// live Stripe API
    pub fn from_env(pool: PgPool, notifier: Arc<dyn RealtimeNotifier>) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_gateway(
            pool,
            stripe.config().clone(),
            Arc::new(StripeGateway::new(stripe)),
            notifier,
        ))
    }

    /// Create a billing service with an explicit gateway, used in tests to
    /// substitute a double for the Stripe API
    pub fn with_gateway(
        pool: PgPool,
        config: StripeConfig,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn RealtimeNotifier>,
    ) -> Self {
        let store = SubscriptionStore::new(pool);
        let catalog = PlanCatalog::new(config.price_ids.clone());

        Self {
            subscriptions: SubscriptionService::new(store.clone(), gateway, catalog.clone()),
            allocation: KeyAllocationService::new(store.clone()),
            webhooks: WebhookHandler::new(store, catalog, notifier, config.webhook_secret),
        }
    }
}
