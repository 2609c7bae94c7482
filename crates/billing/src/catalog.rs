//! Plan catalog: typed price-id → plan lookup
//!
//! The catalog is built once at startup from [`PriceIds`] and is the single
//! place that knows which processor price belongs to which plan. Downstream
//! code never compares raw price id strings.

use workbridge_shared::PlanTier;

use crate::client::PriceIds;

/// How a requested plan change relates to the currently billed plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanChange {
    /// Same rank: treat as idempotent, touch nothing
    NoChange,
    /// Strictly higher rank: applied immediately, billed now
    Upgrade,
    /// Strictly lower rank: deferred to period end via a schedule
    Downgrade,
    /// One side did not resolve to a ranked plan; refuse to act
    Unknown,
}

/// Static mapping from processor price ids to plan tiers
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    price_ids: PriceIds,
}

impl PlanCatalog {
    pub fn new(price_ids: PriceIds) -> Self {
        Self { price_ids }
    }

    /// Resolve a processor price id to a plan tier
    ///
    /// Unknown price ids resolve to [`PlanTier::Unrecognized`] rather than an
    /// error: a subscription on an unconfigured price is surfaced through its
    /// plan field and left for manual classification, it does not fail the
    /// operation that saw it.
    pub fn resolve(&self, price_id: &str) -> PlanTier {
        if price_id == self.price_ids.basic {
            PlanTier::Basic
        } else if price_id == self.price_ids.premium {
            PlanTier::Premium
        } else if price_id == self.price_ids.pro {
            PlanTier::Pro
        } else {
            PlanTier::Unrecognized
        }
    }

    /// Get the configured price id for a recognized tier
    pub fn price_for(&self, tier: PlanTier) -> Option<&str> {
        match tier {
            PlanTier::Basic => Some(&self.price_ids.basic),
            PlanTier::Premium => Some(&self.price_ids.premium),
            PlanTier::Pro => Some(&self.price_ids.pro),
            PlanTier::Unrecognized => None,
        }
    }

    /// Classify a plan change by comparing ranks of the two price ids
    pub fn classify(&self, current_price_id: &str, new_price_id: &str) -> PlanChange {
        let current = self.resolve(current_price_id).rank();
        let new = self.resolve(new_price_id).rank();
        match (current, new) {
            (Some(c), Some(n)) if n > c => PlanChange::Upgrade,
            (Some(c), Some(n)) if n < c => PlanChange::Downgrade,
            (Some(_), Some(_)) => PlanChange::NoChange,
            _ => PlanChange::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PlanCatalog {
        PlanCatalog::new(PriceIds {
            basic: "price_basic_123".to_string(),
            premium: "price_premium_456".to_string(),
            pro: "price_pro_789".to_string(),
        })
    }

    #[test]
    fn resolves_configured_prices() {
        let c = catalog();
        assert_eq!(c.resolve("price_basic_123"), PlanTier::Basic);
        assert_eq!(c.resolve("price_premium_456"), PlanTier::Premium);
        assert_eq!(c.resolve("price_pro_789"), PlanTier::Pro);
    }

    #[test]
    fn unknown_price_is_unrecognized_not_error() {
        let c = catalog();
        assert_eq!(c.resolve("price_from_dashboard"), PlanTier::Unrecognized);
        assert_eq!(c.resolve(""), PlanTier::Unrecognized);
    }

    #[test]
    fn price_roundtrip_for_recognized_tiers() {
        let c = catalog();
        for tier in [PlanTier::Basic, PlanTier::Premium, PlanTier::Pro] {
            let price = c.price_for(tier).unwrap();
            assert_eq!(c.resolve(price), tier);
        }
        assert!(c.price_for(PlanTier::Unrecognized).is_none());
    }

    #[test]
    fn classify_upgrade_and_downgrade() {
        let c = catalog();
        assert_eq!(
            c.classify("price_basic_123", "price_pro_789"),
            PlanChange::Upgrade
        );
        assert_eq!(
            c.classify("price_pro_789", "price_basic_123"),
            PlanChange::Downgrade
        );
        assert_eq!(
            c.classify("price_premium_456", "price_premium_456"),
            PlanChange::NoChange
        );
    }

    #[test]
    fn classify_with_unknown_side_is_unknown() {
        let c = catalog();
        assert_eq!(
            c.classify("price_mystery", "price_pro_789"),
            PlanChange::Unknown
        );
        assert_eq!(
            c.classify("price_basic_123", "price_mystery"),
            PlanChange::Unknown
        );
    }
}
