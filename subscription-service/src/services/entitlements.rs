//! Entitlement manager: per-category quota initialization and metering.

use crate::models::{BillingCycle, Entitlement, EntitlementCheck};
use crate::services::database::Database;
use crate::services::error::SubscriptionError;
use crate::services::metrics::record_entitlement_usage;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Upper bound on reset passes per run; each pass moves due rows one cycle.
const MAX_RESET_PASSES: usize = 24;

#[derive(Clone)]
pub struct EntitlementManager {
    db: Database,
}

impl EntitlementManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert one entitlement per included category of the tier config for
    /// this species and life stage. Excluded categories get no row.
    #[instrument(skip(self, conn, cycle), fields(subscription_id = %subscription_id))]
    pub async fn initialize_entitlements(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        tier_id: i32,
        species_id: i32,
        life_stage_id: i32,
        cycle: &BillingCycle,
        reset_date: DateTime<Utc>,
    ) -> Result<Vec<Entitlement>, SubscriptionError> {
        let configs = self
            .db
            .get_tier_configs(&mut *conn, tier_id, species_id, life_stage_id)
            .await?;

        let mut entitlements = Vec::with_capacity(configs.len());
        for config in configs.iter().filter(|c| c.is_included) {
            let entitlement = self
                .db
                .insert_entitlement(
                    &mut *conn,
                    subscription_id,
                    config.category_id,
                    config.quota_for(cycle),
                    reset_date,
                )
                .await?;
            entitlements.push(entitlement);
        }

        if entitlements.is_empty() {
            warn!(
                tier_id,
                species_id, life_stage_id, "No included categories for tier configuration"
            );
        }

        Ok(entitlements)
    }

    /// Drop every entitlement and initialize afresh. Usage so far is discarded.
    #[allow(clippy::too_many_arguments)]
    pub async fn reinitialize_entitlements(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        tier_id: i32,
        species_id: i32,
        life_stage_id: i32,
        cycle: &BillingCycle,
        reset_date: DateTime<Utc>,
    ) -> Result<Vec<Entitlement>, SubscriptionError> {
        let removed = self.db.delete_entitlements(&mut *conn, subscription_id).await?;
        info!(%subscription_id, removed, "Entitlements reset");
        self.initialize_entitlements(
            conn,
            subscription_id,
            tier_id,
            species_id,
            life_stage_id,
            cycle,
            reset_date,
        )
        .await
    }

    /// Whether `quantity` units of a category may be consumed. Read-only.
    #[instrument(skip(self))]
    pub async fn check_entitlement(
        &self,
        subscription_id: Uuid,
        category_id: i32,
        quantity: i32,
    ) -> Result<EntitlementCheck, SubscriptionError> {
        if quantity <= 0 {
            return Err(SubscriptionError::InvalidQuantity(quantity));
        }

        let mut conn = self.db.acquire().await?;
        let entitlement = self
            .db
            .get_entitlement(&mut conn, subscription_id, category_id)
            .await?;

        Ok(EntitlementCheck::evaluate(entitlement.as_ref(), quantity))
    }

    /// Consume `quantity` units. Bounded quotas are decremented in a single
    /// conditional UPDATE, so concurrent callers serialize on the row and
    /// cannot jointly overdraw.
    #[instrument(skip(self))]
    pub async fn use_entitlement(
        &self,
        subscription_id: Uuid,
        category_id: i32,
        quantity: i32,
    ) -> Result<Entitlement, SubscriptionError> {
        if quantity <= 0 {
            return Err(SubscriptionError::InvalidQuantity(quantity));
        }

        let mut tx = self.db.begin().await?;

        let consumed = match self
            .db
            .consume_entitlement(&mut *tx, subscription_id, category_id, quantity, Utc::now())
            .await
        {
            Ok(consumed) => consumed,
            Err(e) => {
                tx.rollback().await.ok();
                record_entitlement_usage(category_id, "error");
                return Err(e);
            }
        };

        let Some(entitlement) = consumed else {
            // Nothing matched: either no row, or not enough quota left.
            let current = self
                .db
                .get_entitlement(&mut *tx, subscription_id, category_id)
                .await;
            tx.rollback().await.ok();

            let err = match current? {
                None => {
                    record_entitlement_usage(category_id, "not_included");
                    SubscriptionError::ServiceNotIncluded(category_id)
                }
                Some(e) => {
                    record_entitlement_usage(category_id, "quota_exceeded");
                    SubscriptionError::QuotaExceeded {
                        category_id,
                        remaining: e.quota_remaining.unwrap_or(0),
                        requested: quantity,
                    }
                }
            };
            return Err(err);
        };

        tx.commit()
            .await
            .map_err(|e| SubscriptionError::Database(anyhow::anyhow!("Failed to commit: {}", e)))?;

        record_entitlement_usage(category_id, "consumed");
        info!(
            %subscription_id,
            category_id,
            quantity,
            remaining = ?entitlement.quota_remaining,
            "Entitlement consumed"
        );

        Ok(entitlement)
    }

    pub async fn list_entitlements(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
    ) -> Result<Vec<Entitlement>, SubscriptionError> {
        self.db.list_entitlements(conn, subscription_id).await
    }

    /// Refill quotas whose reset date has passed. Rows several cycles behind
    /// are moved forward until their reset date is in the future.
    #[instrument(skip(self))]
    pub async fn reset_due_entitlements(&self, now: DateTime<Utc>) -> Result<u64, SubscriptionError> {
        let mut conn = self.db.acquire().await?;
        let mut first_pass = 0;

        for pass in 0..MAX_RESET_PASSES {
            let touched = self.db.reset_due_entitlements(&mut conn, now).await?;
            if pass == 0 {
                first_pass = touched;
            }
            if touched == 0 {
                break;
            }
        }

        if first_pass > 0 {
            info!(reset = first_pass, "Entitlement quotas reset");
        }
        Ok(first_pass)
    }
}
