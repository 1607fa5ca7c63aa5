//! Price computation for a tier, billing cycle and optional promo code.

use crate::config::PricingPolicy;
use crate::models::{BillingCycle, PriceBreakdown, PromoDecision, SubscriptionTier};
use crate::services::database::Database;
use crate::services::error::SubscriptionError;
use crate::services::promo::PromoValidator;
use rust_decimal::Decimal;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

/// Pure pricing over already-loaded reference data.
///
/// The promo discount is taken from the subtotal and can never exceed it,
/// so `final_price` is never negative.
pub fn breakdown(
    tier: &SubscriptionTier,
    cycle: &BillingCycle,
    promo: Option<&PromoDecision>,
    policy: &PricingPolicy,
) -> PriceBreakdown {
    let hundred = Decimal::from(100);

    let base_price = tier.base_price * cycle.price_multiplier();
    let cycle_discount = base_price * cycle.discount_percentage / hundred;
    let subtotal = base_price - cycle_discount;

    let promo_discount = promo.map_or(Decimal::ZERO, |p| p.discount_on(subtotal));
    let final_price = (subtotal - promo_discount).max(Decimal::ZERO);

    let tax_amount = final_price * policy.tax_percentage / hundred;

    PriceBreakdown {
        tier_id: tier.tier_id,
        billing_cycle_id: cycle.billing_cycle_id,
        base_price,
        cycle_discount,
        subtotal,
        promo_id: promo.map(|p| p.promo_id),
        promo_code: promo.map(|p| p.promo_code.clone()),
        promo_discount,
        final_price,
        tax_percentage: policy.tax_percentage,
        tax_amount,
        total_amount: final_price + tax_amount,
    }
}

/// Computes price breakdowns against the store. Read-only: promo usage is
/// booked by the lifecycle when a subscription is actually created.
#[derive(Clone)]
pub struct PricingCalculator {
    db: Database,
    promos: PromoValidator,
    policy: PricingPolicy,
}

impl PricingCalculator {
    pub fn new(db: Database, policy: PricingPolicy) -> Self {
        Self {
            promos: PromoValidator::new(db.clone()),
            db,
            policy,
        }
    }

    /// Price a tier and billing cycle, applying `promo_code` when both a
    /// code and a user are given. Promo failures are returned, not skipped.
    #[instrument(skip(self))]
    pub async fn calculate_price(
        &self,
        tier_id: i32,
        billing_cycle_id: i32,
        promo_code: Option<&str>,
        user_id: Option<Uuid>,
    ) -> Result<PriceBreakdown, SubscriptionError> {
        let mut conn = self.db.acquire().await?;
        self.calculate_in(&mut conn, tier_id, billing_cycle_id, promo_code, user_id)
            .await
    }

    /// Same as [`calculate_price`](Self::calculate_price) on the caller's
    /// connection, so the reads see the caller's transaction.
    pub async fn calculate_in(
        &self,
        conn: &mut PgConnection,
        tier_id: i32,
        billing_cycle_id: i32,
        promo_code: Option<&str>,
        user_id: Option<Uuid>,
    ) -> Result<PriceBreakdown, SubscriptionError> {
        let cycle = self
            .db
            .get_billing_cycle(&mut *conn, billing_cycle_id)
            .await?
            .ok_or(SubscriptionError::InvalidBillingCycle(billing_cycle_id))?;

        let tier = self
            .db
            .get_tier(&mut *conn, tier_id)
            .await?
            .ok_or(SubscriptionError::InvalidTier(tier_id))?;

        let promo = match (promo_code.map(str::trim).filter(|c| !c.is_empty()), user_id) {
            (Some(code), Some(user_id)) => Some(
                self.promos
                    .validate_in(&mut *conn, code, user_id, tier_id, billing_cycle_id)
                    .await?,
            ),
            _ => None,
        };

        Ok(breakdown(&tier, &cycle, promo.as_ref(), &self.policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiscountType;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn tier(price: &str) -> SubscriptionTier {
        SubscriptionTier {
            tier_id: 1,
            tier_name: "basic".to_string(),
            base_price: dec(price),
            rank: 1,
            display_order: 1,
            is_active: true,
        }
    }

    fn cycle(months: i32, discount: &str) -> BillingCycle {
        BillingCycle {
            billing_cycle_id: if months == 12 { 2 } else { 1 },
            cycle_name: if months == 12 { "annual" } else { "monthly" }.to_string(),
            months,
            discount_percentage: dec(discount),
            is_active: true,
        }
    }

    fn promo(discount_type: DiscountType, value: &str, cap: Option<&str>) -> PromoDecision {
        PromoDecision {
            promo_id: 3,
            promo_code: "WELCOME".to_string(),
            discount_type,
            discount_value: dec(value),
            max_discount_amount: cap.map(dec),
        }
    }

    #[test]
    fn annual_cycle_with_discount() {
        let price = breakdown(
            &tier("999"),
            &cycle(12, "10"),
            None,
            &PricingPolicy::default(),
        );

        assert_eq!(price.base_price, dec("11988"));
        assert_eq!(price.cycle_discount, dec("1198.8"));
        assert_eq!(price.subtotal, dec("10789.2"));
        assert_eq!(price.final_price, dec("10789.2"));
        assert_eq!(price.tax_amount, dec("1942.056"));
        assert_eq!(price.total_amount, dec("12731.256"));
        assert_eq!(price.total_amount.round_dp(2), dec("12731.26"));
    }

    #[test]
    fn zero_percent_promo_matches_no_promo() {
        let policy = PricingPolicy::default();
        let without = breakdown(&tier("999"), &cycle(1, "0"), None, &policy);
        let zero = promo(DiscountType::Percentage, "0", None);
        let with = breakdown(&tier("999"), &cycle(1, "0"), Some(&zero), &policy);

        assert_eq!(without.final_price, with.final_price);
        assert_eq!(with.promo_id, Some(3));
    }

    #[test]
    fn percentage_promo_respects_cap() {
        let capped = promo(DiscountType::Percentage, "50", Some("100"));
        let price = breakdown(
            &tier("999"),
            &cycle(1, "0"),
            Some(&capped),
            &PricingPolicy::default(),
        );

        assert_eq!(price.promo_discount, dec("100"));
        assert_eq!(price.final_price, dec("899"));
    }

    #[test]
    fn oversized_fixed_promo_clamps_to_zero() {
        let huge = promo(DiscountType::Fixed, "5000", None);
        let price = breakdown(
            &tier("999"),
            &cycle(1, "0"),
            Some(&huge),
            &PricingPolicy::default(),
        );

        assert_eq!(price.promo_discount, dec("999"));
        assert_eq!(price.final_price, Decimal::ZERO);
        assert_eq!(price.total_amount, Decimal::ZERO);
    }

    #[test]
    fn tax_rate_comes_from_policy() {
        let policy = PricingPolicy {
            tax_percentage: dec("5"),
        };
        let price = breakdown(&tier("100"), &cycle(1, "0"), None, &policy);
        assert_eq!(price.tax_amount, dec("5"));
        assert_eq!(price.total_amount, dec("105"));
    }
}
