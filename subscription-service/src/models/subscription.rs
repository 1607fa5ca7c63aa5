//! Subscription model.

use super::{Entitlement, PriceBreakdown};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Paused,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "trial" => SubscriptionStatus::Trial,
            "paused" => SubscriptionStatus::Paused,
            "cancelled" => SubscriptionStatus::Cancelled,
            _ => SubscriptionStatus::Active,
        }
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, SubscriptionStatus::Paused)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Paused)
    }

    pub fn can_change_tier(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }
}

/// Subscription.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub pet_id: Uuid,
    pub tier_id: i32,
    pub billing_cycle_id: i32,
    pub status: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub next_billing_date: DateTime<Utc>,
    pub base_price: Decimal,
    pub discount_applied: Decimal,
    pub final_price: Decimal,
    pub promo_code: Option<String>,
    pub auto_renew: bool,
    pub pause_reason: Option<String>,
    pub paused_utc: Option<DateTime<Utc>>,
    pub resume_date: Option<DateTime<Utc>>,
    pub cancellation_date: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<Uuid>,
    pub pending_tier_id: Option<i32>,
    pub pending_billing_cycle_id: Option<i32>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }

    /// Whether services may be consumed at `now`.
    ///
    /// A subscription cancelled at period end keeps access until
    /// `current_period_end`, so status alone is not enough.
    pub fn grants_access_at(&self, now: DateTime<Utc>) -> bool {
        match self.status() {
            SubscriptionStatus::Trial | SubscriptionStatus::Active => true,
            SubscriptionStatus::Paused => false,
            SubscriptionStatus::Cancelled => self.end_date.is_some_and(|end| now < end),
        }
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscription {
    pub pet_id: Uuid,
    pub tier_id: i32,
    pub billing_cycle_id: i32,
    pub promo_code: Option<String>,
}

/// Target of an upgrade or downgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeTierRequest {
    pub new_tier_id: i32,
    /// Keeps the current billing cycle when absent.
    pub new_billing_cycle_id: Option<i32>,
}

/// Result of a successful creation.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedSubscription {
    pub subscription: Subscription,
    pub pricing: PriceBreakdown,
    pub entitlements: Vec<Entitlement>,
    pub invoice_id: Uuid,
}

/// Result of an upgrade. The charge is collected outside this service.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeOutcome {
    pub subscription: Subscription,
    pub pricing: PriceBreakdown,
    pub prorated_charge: Decimal,
    pub remaining_days: i64,
    pub entitlements: Vec<Entitlement>,
}

/// Result of scheduling a downgrade for the next billing date.
#[derive(Debug, Clone, Serialize)]
pub struct DowngradeOutcome {
    pub subscription: Subscription,
    pub pricing: PriceBreakdown,
    pub effective_date: DateTime<Utc>,
}

/// Result of a cancellation.
#[derive(Debug, Clone, Serialize)]
pub struct CancellationOutcome {
    pub subscription: Subscription,
    /// Only set for immediate cancellations; refund execution is external.
    pub refund_amount: Option<Decimal>,
    pub access_until: DateTime<Utc>,
    pub message: String,
}

/// Price the subscription would renew at, computed without side effects.
#[derive(Debug, Clone, Serialize)]
pub struct RenewalPreview {
    pub subscription_id: Uuid,
    pub next_billing_date: DateTime<Utc>,
    pub tier_id: i32,
    pub billing_cycle_id: i32,
    pub auto_renew: bool,
    pub pricing: PriceBreakdown,
}

/// Row values for inserting a subscription.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub pet_id: Uuid,
    pub tier_id: i32,
    pub billing_cycle_id: i32,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub base_price: Decimal,
    pub discount_applied: Decimal,
    pub final_price: Decimal,
    pub promo_code: Option<String>,
}

/// New tier and price written in place on upgrade or applied downgrade.
#[derive(Debug, Clone)]
pub struct TierChange {
    pub tier_id: i32,
    pub billing_cycle_id: i32,
    pub base_price: Decimal,
    pub discount_applied: Decimal,
    pub final_price: Decimal,
}

impl TierChange {
    /// Money columns rounded to cents, keeping `final = base - discount`.
    pub fn from_pricing(pricing: &PriceBreakdown) -> Self {
        let base_price = pricing.base_price.round_dp(2);
        let discount_applied = pricing.total_discount().round_dp(2).min(base_price);
        Self {
            tier_id: pricing.tier_id,
            billing_cycle_id: pricing.billing_cycle_id,
            base_price,
            discount_applied,
            final_price: base_price - discount_applied,
        }
    }
}
