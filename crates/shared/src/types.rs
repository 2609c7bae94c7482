//! Common types used across Workbridge

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Plans
// =============================================================================

/// Subscription plan tier for billing
///
/// `Unrecognized` is an explicit variant rather than an Option so that every
/// consumer is forced to handle a price id the catalog does not know about
/// (e.g. a price created in the Stripe dashboard but not yet configured here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Basic,
    Premium,
    Pro,
    Unrecognized,
}

impl PlanTier {
    /// Strict total order used to classify a plan change as upgrade or
    /// downgrade. `Unrecognized` has no rank and can never be compared.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Basic => Some(1),
            Self::Premium => Some(2),
            Self::Pro => Some(3),
            Self::Unrecognized => None,
        }
    }

    /// Keys granted per billing month on this tier
    pub fn monthly_keys(&self) -> i64 {
        match self {
            Self::Basic => 100,
            Self::Premium | Self::Pro => 200,
            Self::Unrecognized => 0,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Pro => "pro",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Subscription lifecycle
// =============================================================================

/// Local mirror of the processor's subscription status.
///
/// `Active` is the only status that authorizes a key grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Cancelled,
    Paused,
}

impl SubscriptionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Unpaid => "unpaid",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One subscription row per user (UNIQUE on user_id)
///
/// The row is created by the subscription controller and is thereafter
/// authoritatively transitioned by the webhook reconciler. It is retained
/// (status = cancelled) rather than deleted when the processor confirms
/// deletion.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub stripe_price_id: String,
    pub plan_type: PlanTier,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// True while a downgrade schedule is pending at the processor.
    /// Always set/cleared together with `downgrade_plan`.
    pub schedule_for_downgrade: bool,
    /// The tier that takes effect at the next period boundary, if a
    /// downgrade is pending.
    pub downgrade_plan: Option<PlanTier>,
    pub last_key_allocation: Option<OffsetDateTime>,
    /// Always strictly after `last_key_allocation`
    pub next_key_allocation: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Users (billing-relevant subset)
// =============================================================================

/// Billing-relevant user columns
///
/// `key_balance` is mutated only through atomic increments (grants) and
/// guarded decrements (application debits); it never goes negative.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingUser {
    pub id: Uuid,
    pub email: String,
    pub key_balance: i64,
    pub stripe_customer_id: Option<String>,
    pub stripe_account_id: Option<String>,
}

// =============================================================================
// Contracts and orders (created by the webhook reconciler)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl ContractStatus {
    /// Parse the status carried in charge metadata; unknown values fall
    /// back to Active, matching how contracts are opened on payment.
    pub fn from_metadata(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    Hourly,
    Fixed,
}

impl PaymentType {
    pub fn from_metadata(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "fixed" => Self::Fixed,
            _ => Self::Hourly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Charged,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_order_is_strict() {
        assert!(PlanTier::Basic.rank() < PlanTier::Premium.rank());
        assert!(PlanTier::Premium.rank() < PlanTier::Pro.rank());
        assert_eq!(PlanTier::Unrecognized.rank(), None);
    }

    #[test]
    fn monthly_key_amounts() {
        assert_eq!(PlanTier::Basic.monthly_keys(), 100);
        assert_eq!(PlanTier::Premium.monthly_keys(), 200);
        assert_eq!(PlanTier::Pro.monthly_keys(), 200);
        assert_eq!(PlanTier::Unrecognized.monthly_keys(), 0);
    }

    #[test]
    fn only_active_status_is_active() {
        assert!(SubscriptionStatus::Active.is_active());
        assert!(!SubscriptionStatus::PastDue.is_active());
        assert!(!SubscriptionStatus::Cancelled.is_active());
        assert!(!SubscriptionStatus::Trialing.is_active());
    }

    #[test]
    fn contract_status_metadata_fallback() {
        assert_eq!(
            ContractStatus::from_metadata("PENDING"),
            ContractStatus::Pending
        );
        assert_eq!(
            ContractStatus::from_metadata("garbage"),
            ContractStatus::Active
        );
    }
}
