//! Promo code validation.

use crate::models::PromoDecision;
use crate::services::database::Database;
use crate::services::error::SubscriptionError;
use chrono::Utc;
use sqlx::PgConnection;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct PromoValidator {
    db: Database,
}

impl PromoValidator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Decide whether `code` may be used by `user_id` for the given plan.
    /// Nothing is booked.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn validate_promo_code(
        &self,
        code: &str,
        user_id: Uuid,
        tier_id: i32,
        billing_cycle_id: i32,
    ) -> Result<PromoDecision, SubscriptionError> {
        let mut conn = self.db.acquire().await?;
        self.validate_in(&mut conn, code, user_id, tier_id, billing_cycle_id)
            .await
    }

    pub async fn validate_in(
        &self,
        conn: &mut PgConnection,
        code: &str,
        user_id: Uuid,
        tier_id: i32,
        billing_cycle_id: i32,
    ) -> Result<PromoDecision, SubscriptionError> {
        let promo = self
            .db
            .find_promo_code(&mut *conn, code)
            .await?
            .ok_or_else(|| SubscriptionError::InvalidOrExpiredPromo(code.trim().to_string()))?;

        let user_uses = self
            .db
            .count_promo_usage(&mut *conn, promo.promo_id, user_id)
            .await?;

        let decision = promo.evaluate(user_uses, tier_id, billing_cycle_id, Utc::now())?;
        debug!(promo_id = decision.promo_id, user_uses, "Promo code accepted");
        Ok(decision)
    }
}
