//! Promo code model and validation rules.

use crate::services::error::SubscriptionError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Discount type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "percentage",
            DiscountType::Fixed => "fixed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "fixed" => DiscountType::Fixed,
            _ => DiscountType::Percentage,
        }
    }
}

/// Promo code row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromoCode {
    pub promo_id: i32,
    pub promo_code: String,
    pub discount_type: String,
    pub discount_value: Decimal,
    pub max_discount_amount: Option<Decimal>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub max_uses_total: Option<i32>,
    pub max_uses_per_user: i32,
    /// Allowed tiers; `None` means any tier.
    pub tier_ids: Option<Vec<i32>>,
    /// Allowed billing cycles; `None` means any cycle.
    pub billing_cycle_ids: Option<Vec<i32>>,
    pub current_uses: i32,
    pub is_active: bool,
}

impl PromoCode {
    /// Apply the validation rules in order: availability, per-user cap,
    /// then tier/cycle applicability.
    pub fn evaluate(
        &self,
        user_uses: i64,
        tier_id: i32,
        billing_cycle_id: i32,
        now: DateTime<Utc>,
    ) -> Result<PromoDecision, SubscriptionError> {
        let within_window = self.valid_from <= now && now <= self.valid_until;
        let under_global_cap = self
            .max_uses_total
            .is_none_or(|max| self.current_uses < max);
        if !self.is_active || !within_window || !under_global_cap {
            return Err(SubscriptionError::InvalidOrExpiredPromo(
                self.promo_code.clone(),
            ));
        }

        if user_uses >= i64::from(self.max_uses_per_user) {
            return Err(SubscriptionError::PromoLimitReached(self.promo_code.clone()));
        }

        let tier_allowed = self
            .tier_ids
            .as_ref()
            .is_none_or(|ids| ids.contains(&tier_id));
        let cycle_allowed = self
            .billing_cycle_ids
            .as_ref()
            .is_none_or(|ids| ids.contains(&billing_cycle_id));
        if !tier_allowed || !cycle_allowed {
            return Err(SubscriptionError::PromoNotApplicable(self.promo_code.clone()));
        }

        Ok(PromoDecision {
            promo_id: self.promo_id,
            promo_code: self.promo_code.clone(),
            discount_type: DiscountType::from_string(&self.discount_type),
            discount_value: self.discount_value,
            max_discount_amount: self.max_discount_amount,
        })
    }
}

/// A validated promo. Booking the usage happens when a subscription is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoDecision {
    pub promo_id: i32,
    pub promo_code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub max_discount_amount: Option<Decimal>,
}

impl PromoDecision {
    /// Discount on `amount`, capped for percentages and never above `amount`.
    pub fn discount_on(&self, amount: Decimal) -> Decimal {
        let raw = match self.discount_type {
            DiscountType::Percentage => {
                let pct = amount * self.discount_value / Decimal::from(100);
                match self.max_discount_amount {
                    Some(cap) => pct.min(cap),
                    None => pct,
                }
            }
            DiscountType::Fixed => self.discount_value,
        };
        raw.max(Decimal::ZERO).min(amount.max(Decimal::ZERO))
    }
}
