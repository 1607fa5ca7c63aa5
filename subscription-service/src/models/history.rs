//! Append-only subscription history ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle transition recorded in the history ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Upgraded,
    DowngradeScheduled,
    DowngradeApplied,
    Paused,
    Resumed,
    Cancelled,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Created => "created",
            HistoryAction::Upgraded => "upgraded",
            HistoryAction::DowngradeScheduled => "downgrade_scheduled",
            HistoryAction::DowngradeApplied => "downgrade_applied",
            HistoryAction::Paused => "paused",
            HistoryAction::Resumed => "resumed",
            HistoryAction::Cancelled => "cancelled",
        }
    }
}

/// Persisted history row. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionHistory {
    pub history_id: Uuid,
    pub subscription_id: Uuid,
    pub action: String,
    pub old_tier_id: Option<i32>,
    pub new_tier_id: Option<i32>,
    pub old_price: Option<Decimal>,
    pub new_price: Option<Decimal>,
    pub price_difference: Option<Decimal>,
    pub prorated_amount: Option<Decimal>,
    pub performed_by: Uuid,
    pub effective_date: DateTime<Utc>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Input for appending a history row.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub subscription_id: Uuid,
    pub action: HistoryAction,
    pub old_tier_id: Option<i32>,
    pub new_tier_id: Option<i32>,
    pub old_price: Option<Decimal>,
    pub new_price: Option<Decimal>,
    pub prorated_amount: Option<Decimal>,
    pub performed_by: Uuid,
    pub effective_date: DateTime<Utc>,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

impl NewHistoryEntry {
    /// Entry with no tier or price movement.
    pub fn status_change(
        subscription_id: Uuid,
        action: HistoryAction,
        performed_by: Uuid,
        effective_date: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription_id,
            action,
            old_tier_id: None,
            new_tier_id: None,
            old_price: None,
            new_price: None,
            prorated_amount: None,
            performed_by,
            effective_date,
            reason: None,
            notes: None,
        }
    }

    pub fn price_difference(&self) -> Option<Decimal> {
        match (self.old_price, self.new_price) {
            (Some(old), Some(new)) => Some(new - old),
            _ => None,
        }
    }
}
