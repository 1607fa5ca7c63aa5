//! Entitlement (per-category usage quota) model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One quota row per (subscription, service category).
///
/// When `quota_total` is set, `quota_used + quota_remaining == quota_total`.
/// A `None` total means unlimited and `quota_remaining` is also `None`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Entitlement {
    pub entitlement_id: Uuid,
    pub subscription_id: Uuid,
    pub category_id: i32,
    pub quota_total: Option<i32>,
    pub quota_used: i32,
    pub quota_remaining: Option<i32>,
    pub reset_date: DateTime<Utc>,
    pub last_used_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl Entitlement {
    pub fn is_unlimited(&self) -> bool {
        self.quota_total.is_none()
    }
}

/// Read-only answer to "may this subscription consume `quantity` of a category".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementCheck {
    pub has_access: bool,
    pub is_included: bool,
    pub is_unlimited: bool,
    pub quota_remaining: Option<i32>,
}

impl EntitlementCheck {
    pub fn evaluate(entitlement: Option<&Entitlement>, quantity: i32) -> Self {
        match entitlement {
            None => EntitlementCheck {
                has_access: false,
                is_included: false,
                is_unlimited: false,
                quota_remaining: None,
            },
            Some(e) if e.is_unlimited() => EntitlementCheck {
                has_access: true,
                is_included: true,
                is_unlimited: true,
                quota_remaining: None,
            },
            Some(e) => {
                let remaining = e.quota_remaining.unwrap_or(0);
                EntitlementCheck {
                    has_access: remaining >= quantity,
                    is_included: true,
                    is_unlimited: false,
                    quota_remaining: Some(remaining),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entitlement(total: Option<i32>, used: i32) -> Entitlement {
        Entitlement {
            entitlement_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            category_id: 1,
            quota_total: total,
            quota_used: used,
            quota_remaining: total.map(|t| t - used),
            reset_date: Utc::now(),
            last_used_utc: None,
            created_utc: Utc::now(),
        }
    }

    #[test]
    fn missing_row_is_not_included() {
        let check = EntitlementCheck::evaluate(None, 1);
        assert!(!check.has_access);
        assert!(!check.is_included);
    }

    #[test]
    fn unlimited_always_has_access() {
        let e = entitlement(None, 1_000);
        let check = EntitlementCheck::evaluate(Some(&e), 50);
        assert!(check.has_access);
        assert!(check.is_unlimited);
        assert_eq!(check.quota_remaining, None);
    }

    #[test]
    fn bounded_access_depends_on_remaining() {
        let e = entitlement(Some(5), 3);
        assert!(EntitlementCheck::evaluate(Some(&e), 2).has_access);
        let check = EntitlementCheck::evaluate(Some(&e), 3);
        assert!(!check.has_access);
        assert!(check.is_included);
        assert_eq!(check.quota_remaining, Some(2));
    }

    #[test]
    fn exhausted_quota_denies_access() {
        let e = entitlement(Some(5), 5);
        assert!(!EntitlementCheck::evaluate(Some(&e), 1).has_access);
    }
}
