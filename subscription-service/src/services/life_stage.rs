//! Nightly life-stage reconciliation.

use crate::services::database::Database;
use crate::services::error::{db_error, SubscriptionError};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

/// Result of one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifeStageSummary {
    pub updated_count: i64,
    pub scanned_count: i64,
    pub batches: u32,
}

/// Recomputes each active pet's life stage from its date of birth and
/// corrects stored values that have drifted.
///
/// Pets are processed in pages ordered by id, one transaction per page, so
/// no transaction stays open for the whole population. Subscription
/// entitlements are not touched: they stay as granted at creation or the
/// last tier change.
#[derive(Clone)]
pub struct LifeStageReconciler {
    db: Database,
    batch_size: i64,
}

impl LifeStageReconciler {
    pub fn new(db: Database, batch_size: i64) -> Self {
        Self {
            db,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn update_all_pet_life_stages(&self) -> Result<LifeStageSummary, SubscriptionError> {
        self.update_all_as_of(Utc::now().date_naive()).await
    }

    /// Run against a fixed calendar date. Every page uses the same date.
    #[instrument(skip(self))]
    pub async fn update_all_as_of(
        &self,
        as_of: NaiveDate,
    ) -> Result<LifeStageSummary, SubscriptionError> {
        let mut summary = LifeStageSummary::default();
        let mut cursor = None;

        loop {
            let mut tx = self.db.begin().await?;
            let batch = match self
                .db
                .reconcile_life_stage_batch(&mut *tx, cursor, as_of, self.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    tx.rollback().await.ok();
                    return Err(e);
                }
            };
            tx.commit()
                .await
                .map_err(db_error("Failed to commit life stage batch"))?;

            summary.batches += 1;
            summary.scanned_count += batch.scanned;
            summary.updated_count += batch.updated;
            debug!(
                batch = summary.batches,
                scanned = batch.scanned,
                updated = batch.updated,
                "Life stage batch committed"
            );

            if batch.scanned < self.batch_size || batch.last_pet_id.is_none() {
                break;
            }
            cursor = batch.last_pet_id;
        }

        info!(
            updated = summary.updated_count,
            scanned = summary.scanned_count,
            batches = summary.batches,
            "Life stage reconciliation finished"
        );

        Ok(summary)
    }
}
