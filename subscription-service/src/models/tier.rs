//! Subscription catalog: tiers, billing cycles and per-tier service configuration.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Subscription tier (plan) catalog entry.
///
/// Ordering for upgrades and downgrades uses `rank`, never `tier_id`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionTier {
    pub tier_id: i32,
    pub tier_name: String,
    /// Monthly unit price.
    pub base_price: Decimal,
    pub rank: i32,
    pub display_order: i32,
    pub is_active: bool,
}

impl SubscriptionTier {
    pub fn outranks(&self, other: &SubscriptionTier) -> bool {
        self.rank > other.rank
    }
}

/// Renewal period and its discount.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingCycle {
    pub billing_cycle_id: i32,
    pub cycle_name: String,
    pub months: i32,
    pub discount_percentage: Decimal,
    pub is_active: bool,
}

impl BillingCycle {
    pub fn is_annual(&self) -> bool {
        self.months == 12
    }

    /// Number of monthly base prices billed per cycle.
    pub fn price_multiplier(&self) -> Decimal {
        if self.is_annual() {
            Decimal::from(12)
        } else {
            Decimal::ONE
        }
    }
}

/// What a tier includes for one species/life-stage/category combination.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TierConfig {
    pub config_id: i32,
    pub tier_id: i32,
    pub species_id: i32,
    pub life_stage_id: i32,
    pub category_id: i32,
    pub quota_monthly: Option<i32>,
    pub quota_annual: Option<i32>,
    pub is_included: bool,
}

impl TierConfig {
    /// Quota for the given cycle; `None` means unlimited.
    pub fn quota_for(&self, cycle: &BillingCycle) -> Option<i32> {
        if cycle.is_annual() {
            self.quota_annual
        } else {
            self.quota_monthly
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(months: i32) -> BillingCycle {
        BillingCycle {
            billing_cycle_id: months,
            cycle_name: "test".to_string(),
            months,
            discount_percentage: Decimal::ZERO,
            is_active: true,
        }
    }

    #[test]
    fn annual_cycle_uses_annual_quota() {
        let config = TierConfig {
            config_id: 1,
            tier_id: 1,
            species_id: 1,
            life_stage_id: 1,
            category_id: 1,
            quota_monthly: Some(2),
            quota_annual: None,
            is_included: true,
        };

        assert_eq!(config.quota_for(&cycle(1)), Some(2));
        assert_eq!(config.quota_for(&cycle(12)), None);
        assert_eq!(cycle(12).price_multiplier(), Decimal::from(12));
        assert_eq!(cycle(1).price_multiplier(), Decimal::ONE);
    }
}
