//! Domain errors for subscription-service.

use serde::Serialize;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Machine-readable error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    InvalidTransition,
    LimitExceeded,
    Conflict,
    ValidationFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::LimitExceeded => "limit_exceeded",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Invalid tier: {0}")]
    InvalidTier(i32),

    #[error("Invalid billing cycle: {0}")]
    InvalidBillingCycle(i32),

    #[error("Pet {0} not found or not active for this user")]
    PetNotFound(Uuid),

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(Uuid),

    #[error("Pet {0} already has an active subscription")]
    ActiveSubscriptionExists(Uuid),

    #[error("Tier {to} does not rank above current tier {from}")]
    InvalidUpgrade { from: i32, to: i32 },

    #[error("Tier {to} does not rank below current tier {from}")]
    InvalidDowngrade { from: i32, to: i32 },

    #[error("Cannot {operation} a subscription in status '{status}'")]
    InvalidState {
        operation: &'static str,
        status: String,
    },

    #[error("Pause cannot exceed {max_days} days")]
    MaxPauseExceeded { max_days: i64 },

    #[error("Resume date must be in the future")]
    InvalidResumeDate,

    #[error("Promo code '{0}' is invalid or expired")]
    InvalidOrExpiredPromo(String),

    #[error("Promo code '{0}' usage limit reached for this user")]
    PromoLimitReached(String),

    #[error("Promo code '{0}' is not applicable to this plan")]
    PromoNotApplicable(String),

    #[error("Service category {0} is not included in this subscription")]
    ServiceNotIncluded(i32),

    #[error("Quota exceeded for category {category_id}: {remaining} remaining, {requested} requested")]
    QuotaExceeded {
        category_id: i32,
        remaining: i32,
        requested: i32,
    },

    #[error("Quantity must be positive, got {0}")]
    InvalidQuantity(i32),

    #[error("Database error: {0}")]
    Database(anyhow::Error),
}

impl SubscriptionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubscriptionError::InvalidTier(_)
            | SubscriptionError::InvalidBillingCycle(_)
            | SubscriptionError::PetNotFound(_)
            | SubscriptionError::SubscriptionNotFound(_) => ErrorKind::NotFound,
            SubscriptionError::InvalidState { .. } => ErrorKind::InvalidState,
            SubscriptionError::InvalidUpgrade { .. } | SubscriptionError::InvalidDowngrade { .. } => {
                ErrorKind::InvalidTransition
            }
            SubscriptionError::MaxPauseExceeded { .. }
            | SubscriptionError::PromoLimitReached(_)
            | SubscriptionError::QuotaExceeded { .. } => ErrorKind::LimitExceeded,
            SubscriptionError::ActiveSubscriptionExists(_) => ErrorKind::Conflict,
            SubscriptionError::InvalidResumeDate
            | SubscriptionError::InvalidOrExpiredPromo(_)
            | SubscriptionError::PromoNotApplicable(_)
            | SubscriptionError::ServiceNotIncluded(_)
            | SubscriptionError::InvalidQuantity(_) => ErrorKind::ValidationFailure,
            SubscriptionError::Database(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn invalid_state(operation: &'static str, status: &str) -> Self {
        SubscriptionError::InvalidState {
            operation,
            status: status.to_string(),
        }
    }
}

/// Wrap a store failure with the operation that hit it.
pub(crate) fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> SubscriptionError {
    move |e| SubscriptionError::Database(anyhow::anyhow!("{}: {}", context, e))
}

impl From<SubscriptionError> for AppError {
    fn from(err: SubscriptionError) -> Self {
        let kind = err.kind();
        match err {
            SubscriptionError::Database(e) => AppError::DatabaseError(e),
            other => {
                let e = anyhow::anyhow!(other.to_string());
                match kind {
                    ErrorKind::NotFound => AppError::NotFound(e),
                    ErrorKind::InvalidState | ErrorKind::InvalidTransition => {
                        AppError::Unprocessable(e)
                    }
                    ErrorKind::LimitExceeded => AppError::LimitExceeded(e),
                    ErrorKind::Conflict => AppError::Conflict(e),
                    ErrorKind::ValidationFailure => AppError::BadRequest(e),
                    ErrorKind::Internal => AppError::InternalError(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            SubscriptionError::InvalidUpgrade { from: 2, to: 1 }.kind(),
            ErrorKind::InvalidTransition
        );
        assert_eq!(
            SubscriptionError::MaxPauseExceeded { max_days: 90 }.kind(),
            ErrorKind::LimitExceeded
        );
        assert_eq!(
            SubscriptionError::ActiveSubscriptionExists(Uuid::nil()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            SubscriptionError::invalid_state("upgrade", "cancelled").kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn converts_into_app_error() {
        let app: AppError = SubscriptionError::QuotaExceeded {
            category_id: 1,
            remaining: 0,
            requested: 1,
        }
        .into();
        assert_eq!(app.kind(), "limit_exceeded");

        let app: AppError = SubscriptionError::PetNotFound(Uuid::nil()).into();
        assert!(matches!(app, AppError::NotFound(_)));
    }
}
