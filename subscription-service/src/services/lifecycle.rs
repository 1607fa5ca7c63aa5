//! Subscription lifecycle: create, change tier, pause, resume and cancel.
//!
//! Every mutating operation runs in one transaction. Any error rolls the
//! whole transaction back before it is returned, including invoice rows
//! written through the [`InvoiceCreator`]. Audit events are emitted only
//! after a successful commit.

use crate::config::{LifecyclePolicy, PricingPolicy};
use crate::models::{
    age_in_months, BillingCycle, CancellationOutcome, ChangeTierRequest, CreateSubscription,
    CreatedSubscription, DowngradeOutcome, Entitlement, HistoryAction, InvoiceLineItem,
    InvoiceRequest, InvoiceType, LifeStage, NewHistoryEntry, NewSubscription, Pet, RenewalPreview,
    Subscription, SubscriptionHistory, SubscriptionStatus, TierChange, UpgradeOutcome,
};
use crate::services::audit::{AuditEvent, AuditSink};
use crate::services::database::{CancellationUpdate, Database, PromoBooking};
use crate::services::entitlements::EntitlementManager;
use crate::services::error::{db_error, ErrorKind, SubscriptionError};
use crate::services::invoice::InvoiceCreator;
use crate::services::metrics::{record_error, record_subscription_operation};
use crate::services::pricing::PricingCalculator;
use crate::services::proration::ProrationWindow;
use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, Postgres, Transaction};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Actor recorded for changes made by background processing.
pub const SYSTEM_ACTOR: Uuid = Uuid::nil();

/// Subscriptions handled per scheduled-downgrade run.
const DOWNGRADE_BATCH_LIMIT: i64 = 500;

/// End of a billing period starting at `start`.
pub fn period_end(start: DateTime<Utc>, cycle: &BillingCycle) -> DateTime<Utc> {
    let months = cycle.months.max(1);
    start
        .checked_add_months(Months::new(months as u32))
        .unwrap_or_else(|| start + Duration::days(30 * i64::from(months)))
}

async fn finish<T>(
    tx: Transaction<'static, Postgres>,
    result: Result<T, SubscriptionError>,
) -> Result<T, SubscriptionError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(db_error("Failed to commit transaction"))?;
            Ok(value)
        }
        Err(e) => {
            tx.rollback().await.ok();
            Err(e)
        }
    }
}

fn observe<T>(operation: &'static str, result: &Result<T, SubscriptionError>) {
    match result {
        Ok(_) => record_subscription_operation(operation, "success"),
        Err(e) => {
            let kind = e.kind();
            record_subscription_operation(operation, kind.as_str());
            if kind == ErrorKind::Internal {
                record_error("database", operation);
            }
        }
    }
}

/// Orchestrates subscription state transitions.
#[derive(Clone)]
pub struct SubscriptionService {
    db: Database,
    pricing: PricingCalculator,
    entitlements: EntitlementManager,
    invoices: Arc<dyn InvoiceCreator>,
    audit: Arc<dyn AuditSink>,
    policy: LifecyclePolicy,
}

impl SubscriptionService {
    pub fn new(
        db: Database,
        pricing_policy: PricingPolicy,
        policy: LifecyclePolicy,
        invoices: Arc<dyn InvoiceCreator>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            pricing: PricingCalculator::new(db.clone(), pricing_policy),
            entitlements: EntitlementManager::new(db.clone()),
            db,
            invoices,
            audit,
            policy,
        }
    }

    pub fn pricing(&self) -> &PricingCalculator {
        &self.pricing
    }

    pub fn entitlements(&self) -> &EntitlementManager {
        &self.entitlements
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create an active subscription for one of the user's pets.
    #[instrument(skip(self, input), fields(user_id = %user_id, pet_id = %input.pet_id))]
    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        input: CreateSubscription,
    ) -> Result<CreatedSubscription, SubscriptionError> {
        let mut tx = self.db.begin().await?;
        let result = self.create_in(&mut *tx, user_id, &input).await;
        let result = finish(tx, result).await;
        observe("create", &result);

        if let Ok(created) = &result {
            info!(
                subscription_id = %created.subscription.subscription_id,
                tier_id = created.subscription.tier_id,
                final_price = %created.subscription.final_price,
                "Subscription created"
            );
            self.audit
                .log(
                    AuditEvent::subscription(
                        user_id,
                        "subscription.created",
                        created.subscription.subscription_id,
                    )
                    .with_values(None, Some(&created.subscription)),
                )
                .await;
        }

        result
    }

    async fn create_in(
        &self,
        conn: &mut PgConnection,
        user_id: Uuid,
        input: &CreateSubscription,
    ) -> Result<CreatedSubscription, SubscriptionError> {
        let pet = self
            .db
            .get_owned_active_pet(conn, input.pet_id, user_id)
            .await?
            .ok_or(SubscriptionError::PetNotFound(input.pet_id))?;

        if self
            .db
            .find_live_subscription_for_pet(conn, pet.pet_id)
            .await?
            .is_some()
        {
            return Err(SubscriptionError::ActiveSubscriptionExists(pet.pet_id));
        }

        let pricing = self
            .pricing
            .calculate_in(
                conn,
                input.tier_id,
                input.billing_cycle_id,
                input.promo_code.as_deref(),
                Some(user_id),
            )
            .await?;

        let cycle = self
            .db
            .get_billing_cycle(conn, input.billing_cycle_id)
            .await?
            .ok_or(SubscriptionError::InvalidBillingCycle(input.billing_cycle_id))?;

        let now = Utc::now();
        let end = period_end(now, &cycle);
        let change = TierChange::from_pricing(&pricing);

        let subscription = self
            .db
            .insert_subscription(
                conn,
                &NewSubscription {
                    user_id,
                    pet_id: pet.pet_id,
                    tier_id: change.tier_id,
                    billing_cycle_id: change.billing_cycle_id,
                    status: SubscriptionStatus::Active,
                    start_date: now,
                    current_period_end: end,
                    base_price: change.base_price,
                    discount_applied: change.discount_applied,
                    final_price: change.final_price,
                    promo_code: pricing.promo_code.clone(),
                },
            )
            .await?;

        let entitlements = self
            .grant_entitlements(conn, &subscription, &pet, &cycle, end, false)
            .await?;

        if let (Some(promo_id), Some(code)) = (pricing.promo_id, pricing.promo_code.as_ref()) {
            let booking = self
                .db
                .record_promo_usage(
                    conn,
                    promo_id,
                    user_id,
                    subscription.subscription_id,
                    pricing.promo_discount.round_dp(2),
                )
                .await?;
            // Limits may have been reached between validation and booking
            match booking {
                PromoBooking::Booked => {}
                PromoBooking::TotalLimitReached => {
                    return Err(SubscriptionError::InvalidOrExpiredPromo(code.clone()));
                }
                PromoBooking::UserLimitReached => {
                    return Err(SubscriptionError::PromoLimitReached(code.clone()));
                }
            }
        }

        self.db
            .insert_history(
                conn,
                &NewHistoryEntry {
                    new_tier_id: Some(subscription.tier_id),
                    new_price: Some(subscription.final_price),
                    notes: Some(format!("Billing cycle: {}", cycle.cycle_name)),
                    ..NewHistoryEntry::status_change(
                        subscription.subscription_id,
                        HistoryAction::Created,
                        user_id,
                        now,
                    )
                },
            )
            .await?;

        let invoice = InvoiceRequest {
            user_id,
            subscription_id: subscription.subscription_id,
            invoice_type: InvoiceType::Subscription,
            line_items: vec![InvoiceLineItem {
                description: format!(
                    "Pet care subscription, tier {} ({})",
                    subscription.tier_id, cycle.cycle_name
                ),
                quantity: Decimal::ONE,
                unit_price: subscription.base_price,
            }],
            tax_percentage: pricing.tax_percentage,
            discount_amount: subscription.discount_applied,
            due_date: (now + Duration::days(self.policy.invoice_due_days)).date_naive(),
        };
        let invoice_id = self.invoices.create_invoice(conn, &invoice).await?;

        Ok(CreatedSubscription {
            subscription,
            pricing,
            entitlements,
            invoice_id,
        })
    }

    // =========================================================================
    // Tier Changes
    // =========================================================================

    /// Move to a strictly higher-ranked tier now. Entitlements are rebuilt
    /// from scratch for the new tier, discarding usage in the current period.
    #[instrument(skip(self, request), fields(subscription_id = %subscription_id, new_tier_id = request.new_tier_id))]
    pub async fn upgrade_subscription(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
        request: ChangeTierRequest,
    ) -> Result<UpgradeOutcome, SubscriptionError> {
        let mut tx = self.db.begin().await?;
        let result = self
            .upgrade_in(&mut *tx, subscription_id, user_id, &request)
            .await;
        let result = finish(tx, result).await;
        observe("upgrade", &result);

        if let Ok((before, outcome)) = &result {
            info!(
                from_tier = before.tier_id,
                to_tier = outcome.subscription.tier_id,
                prorated_charge = %outcome.prorated_charge,
                "Subscription upgraded"
            );
            self.audit
                .log(
                    AuditEvent::subscription(user_id, "subscription.upgraded", subscription_id)
                        .with_values(Some(before), Some(&outcome.subscription)),
                )
                .await;
        }

        result.map(|(_, outcome)| outcome)
    }

    async fn upgrade_in(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        user_id: Uuid,
        request: &ChangeTierRequest,
    ) -> Result<(Subscription, UpgradeOutcome), SubscriptionError> {
        let current = self.lock_owned(conn, subscription_id, user_id).await?;
        if !current.status().can_change_tier() {
            return Err(SubscriptionError::invalid_state("upgrade", &current.status));
        }

        let from_tier = self
            .db
            .get_tier(conn, current.tier_id)
            .await?
            .ok_or(SubscriptionError::InvalidTier(current.tier_id))?;
        let to_tier = self
            .db
            .get_tier(conn, request.new_tier_id)
            .await?
            .ok_or(SubscriptionError::InvalidTier(request.new_tier_id))?;
        if !to_tier.outranks(&from_tier) {
            return Err(SubscriptionError::InvalidUpgrade {
                from: from_tier.tier_id,
                to: to_tier.tier_id,
            });
        }

        let billing_cycle_id = request
            .new_billing_cycle_id
            .unwrap_or(current.billing_cycle_id);
        let pricing = self
            .pricing
            .calculate_in(conn, to_tier.tier_id, billing_cycle_id, None, None)
            .await?;
        let cycle = self
            .db
            .get_billing_cycle(conn, billing_cycle_id)
            .await?
            .ok_or(SubscriptionError::InvalidBillingCycle(billing_cycle_id))?;

        let now = Utc::now();
        let change = TierChange::from_pricing(&pricing);
        let window =
            ProrationWindow::at(current.current_period_start, current.current_period_end, now);
        // A new cycle length starts a new period at the new price
        let (prorated_charge, new_period) = if billing_cycle_id != current.billing_cycle_id {
            (
                window.cycle_switch_charge(current.final_price, change.final_price),
                Some((now, period_end(now, &cycle))),
            )
        } else {
            (
                window.upgrade_charge(current.final_price, change.final_price),
                None,
            )
        };

        let updated = self
            .db
            .update_subscription_tier(conn, subscription_id, &change, new_period)
            .await?;

        let pet = self
            .db
            .get_pet(conn, updated.pet_id)
            .await?
            .ok_or(SubscriptionError::PetNotFound(updated.pet_id))?;
        let entitlements = self
            .grant_entitlements(conn, &updated, &pet, &cycle, updated.current_period_end, true)
            .await?;

        self.db
            .insert_history(
                conn,
                &NewHistoryEntry {
                    subscription_id,
                    action: HistoryAction::Upgraded,
                    old_tier_id: Some(current.tier_id),
                    new_tier_id: Some(updated.tier_id),
                    old_price: Some(current.final_price),
                    new_price: Some(updated.final_price),
                    prorated_amount: Some(prorated_charge),
                    performed_by: user_id,
                    effective_date: now,
                    reason: None,
                    notes: Some(format!(
                        "{} of {} days remaining in period",
                        window.remaining_days, window.total_days
                    )),
                },
            )
            .await?;

        let outcome = UpgradeOutcome {
            subscription: updated,
            pricing,
            prorated_charge,
            remaining_days: window.remaining_days,
            entitlements,
        };
        Ok((current, outcome))
    }

    /// Schedule a move to a strictly lower-ranked tier at the next billing
    /// date. Price and entitlements stay as they are until then.
    #[instrument(skip(self, request), fields(subscription_id = %subscription_id, new_tier_id = request.new_tier_id))]
    pub async fn downgrade_subscription(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
        request: ChangeTierRequest,
    ) -> Result<DowngradeOutcome, SubscriptionError> {
        let mut tx = self.db.begin().await?;
        let result = self
            .downgrade_in(&mut *tx, subscription_id, user_id, &request)
            .await;
        let result = finish(tx, result).await;
        observe("downgrade", &result);

        if let Ok(outcome) = &result {
            info!(
                pending_tier = ?outcome.subscription.pending_tier_id,
                effective_date = %outcome.effective_date,
                "Downgrade scheduled"
            );
            self.audit
                .log(
                    AuditEvent::subscription(
                        user_id,
                        "subscription.downgrade_scheduled",
                        subscription_id,
                    )
                    .with_summary(format!(
                        "Tier {} from {}",
                        outcome.pricing.tier_id, outcome.effective_date
                    )),
                )
                .await;
        }

        result
    }

    async fn downgrade_in(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        user_id: Uuid,
        request: &ChangeTierRequest,
    ) -> Result<DowngradeOutcome, SubscriptionError> {
        let current = self.lock_owned(conn, subscription_id, user_id).await?;
        if !current.status().can_change_tier() {
            return Err(SubscriptionError::invalid_state("downgrade", &current.status));
        }

        let from_tier = self
            .db
            .get_tier(conn, current.tier_id)
            .await?
            .ok_or(SubscriptionError::InvalidTier(current.tier_id))?;
        let to_tier = self
            .db
            .get_tier(conn, request.new_tier_id)
            .await?
            .ok_or(SubscriptionError::InvalidTier(request.new_tier_id))?;
        if !from_tier.outranks(&to_tier) {
            return Err(SubscriptionError::InvalidDowngrade {
                from: from_tier.tier_id,
                to: to_tier.tier_id,
            });
        }

        let billing_cycle_id = request
            .new_billing_cycle_id
            .unwrap_or(current.billing_cycle_id);
        let pricing = self
            .pricing
            .calculate_in(conn, to_tier.tier_id, billing_cycle_id, None, None)
            .await?;
        let new_price = TierChange::from_pricing(&pricing).final_price;

        let updated = self
            .db
            .schedule_downgrade(conn, subscription_id, to_tier.tier_id, billing_cycle_id)
            .await?;

        let effective_date = current.next_billing_date;
        self.db
            .insert_history(
                conn,
                &NewHistoryEntry {
                    subscription_id,
                    action: HistoryAction::DowngradeScheduled,
                    old_tier_id: Some(current.tier_id),
                    new_tier_id: Some(to_tier.tier_id),
                    old_price: Some(current.final_price),
                    new_price: Some(new_price),
                    prorated_amount: None,
                    performed_by: user_id,
                    effective_date,
                    reason: None,
                    notes: Some("Takes effect at next billing date".to_string()),
                },
            )
            .await?;

        Ok(DowngradeOutcome {
            subscription: updated,
            pricing,
            effective_date,
        })
    }

    /// Apply downgrades whose billing date has arrived. Each subscription is
    /// handled in its own transaction; a failure is logged and skipped.
    /// Returns how many were applied.
    #[instrument(skip(self))]
    pub async fn apply_scheduled_downgrades(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, SubscriptionError> {
        let due = {
            let mut conn = self.db.acquire().await?;
            self.db
                .find_due_downgrades(&mut conn, now, DOWNGRADE_BATCH_LIMIT)
                .await?
        };

        let mut applied = 0;
        for subscription_id in due {
            let mut tx = self.db.begin().await?;
            let result = self.apply_downgrade_in(&mut *tx, subscription_id, now).await;
            let result = finish(tx, result).await;
            observe("apply_downgrade", &result);

            match result {
                Ok(Some(subscription)) => {
                    applied += 1;
                    info!(
                        %subscription_id,
                        tier_id = subscription.tier_id,
                        "Scheduled downgrade applied"
                    );
                    self.audit
                        .log(AuditEvent::subscription(
                            SYSTEM_ACTOR,
                            "subscription.downgrade_applied",
                            subscription_id,
                        ))
                        .await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%subscription_id, error = %e, "Failed to apply scheduled downgrade");
                }
            }
        }

        Ok(applied)
    }

    async fn apply_downgrade_in(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let Some(current) = self.db.lock_subscription_by_id(conn, subscription_id).await? else {
            return Ok(None);
        };

        // Re-check under the row lock; the row may have changed since the scan.
        let (Some(tier_id), true) = (
            current.pending_tier_id,
            current.status() == SubscriptionStatus::Active && current.next_billing_date <= now,
        ) else {
            return Ok(None);
        };
        let billing_cycle_id = current
            .pending_billing_cycle_id
            .unwrap_or(current.billing_cycle_id);

        let pricing = self
            .pricing
            .calculate_in(conn, tier_id, billing_cycle_id, None, None)
            .await?;
        let cycle = self
            .db
            .get_billing_cycle(conn, billing_cycle_id)
            .await?
            .ok_or(SubscriptionError::InvalidBillingCycle(billing_cycle_id))?;

        let change = TierChange::from_pricing(&pricing);
        let period_start = current.next_billing_date;
        let new_period_end = period_end(period_start, &cycle);

        let updated = self
            .db
            .apply_downgrade(conn, subscription_id, &change, period_start, new_period_end)
            .await?;

        let pet = self
            .db
            .get_pet(conn, updated.pet_id)
            .await?
            .ok_or(SubscriptionError::PetNotFound(updated.pet_id))?;
        self.grant_entitlements(conn, &updated, &pet, &cycle, new_period_end, true)
            .await?;

        self.db
            .insert_history(
                conn,
                &NewHistoryEntry {
                    subscription_id,
                    action: HistoryAction::DowngradeApplied,
                    old_tier_id: Some(current.tier_id),
                    new_tier_id: Some(updated.tier_id),
                    old_price: Some(current.final_price),
                    new_price: Some(updated.final_price),
                    prorated_amount: None,
                    performed_by: SYSTEM_ACTOR,
                    effective_date: period_start,
                    reason: None,
                    notes: None,
                },
            )
            .await?;

        Ok(Some(updated))
    }

    // =========================================================================
    // Pause / Resume / Cancel
    // =========================================================================

    /// Pause an active subscription until `resume_date`, at most
    /// `max_pause_days` ahead.
    #[instrument(skip(self, reason), fields(subscription_id = %subscription_id))]
    pub async fn pause_subscription(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
        reason: &str,
        resume_date: DateTime<Utc>,
    ) -> Result<Subscription, SubscriptionError> {
        let mut tx = self.db.begin().await?;
        let result = self
            .pause_in(&mut *tx, subscription_id, user_id, reason, resume_date)
            .await;
        let result = finish(tx, result).await;
        observe("pause", &result);

        if result.is_ok() {
            info!(%resume_date, "Subscription paused");
            self.audit
                .log(
                    AuditEvent::subscription(user_id, "subscription.paused", subscription_id)
                        .with_summary(reason),
                )
                .await;
        }

        result
    }

    async fn pause_in(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        user_id: Uuid,
        reason: &str,
        resume_date: DateTime<Utc>,
    ) -> Result<Subscription, SubscriptionError> {
        let current = self.lock_owned(conn, subscription_id, user_id).await?;
        if !current.status().can_pause() {
            return Err(SubscriptionError::invalid_state("pause", &current.status));
        }

        let now = Utc::now();
        if resume_date <= now {
            return Err(SubscriptionError::InvalidResumeDate);
        }
        if resume_date > now + Duration::days(self.policy.max_pause_days) {
            return Err(SubscriptionError::MaxPauseExceeded {
                max_days: self.policy.max_pause_days,
            });
        }

        let updated = self
            .db
            .pause_subscription(conn, subscription_id, reason, now, resume_date)
            .await?;

        self.db
            .insert_history(
                conn,
                &NewHistoryEntry {
                    reason: Some(reason.to_string()),
                    notes: Some(format!("Resume on {}", resume_date.date_naive())),
                    ..NewHistoryEntry::status_change(
                        subscription_id,
                        HistoryAction::Paused,
                        user_id,
                        now,
                    )
                },
            )
            .await?;

        Ok(updated)
    }

    /// Return a paused subscription to active.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn resume_subscription(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
    ) -> Result<Subscription, SubscriptionError> {
        let mut tx = self.db.begin().await?;
        let result = self.resume_in(&mut *tx, subscription_id, user_id).await;
        let result = finish(tx, result).await;
        observe("resume", &result);

        if result.is_ok() {
            info!("Subscription resumed");
            self.audit
                .log(AuditEvent::subscription(
                    user_id,
                    "subscription.resumed",
                    subscription_id,
                ))
                .await;
        }

        result
    }

    async fn resume_in(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        user_id: Uuid,
    ) -> Result<Subscription, SubscriptionError> {
        let current = self.lock_owned(conn, subscription_id, user_id).await?;
        if !current.status().can_resume() {
            return Err(SubscriptionError::invalid_state("resume", &current.status));
        }

        let updated = self
            .db
            .resume_subscription(conn, subscription_id, current.pet_id)
            .await?;

        self.db
            .insert_history(
                conn,
                &NewHistoryEntry::status_change(
                    subscription_id,
                    HistoryAction::Resumed,
                    user_id,
                    Utc::now(),
                ),
            )
            .await?;

        Ok(updated)
    }

    /// Cancel an active or paused subscription.
    ///
    /// Immediate cancellation ends access now and reports a prorated refund.
    /// Otherwise the status becomes cancelled but access continues until the
    /// end of the current period, so callers gate on
    /// [`Subscription::grants_access_at`] rather than status.
    #[instrument(skip(self, reason), fields(subscription_id = %subscription_id))]
    pub async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
        reason: Option<&str>,
        immediate: bool,
    ) -> Result<CancellationOutcome, SubscriptionError> {
        let mut tx = self.db.begin().await?;
        let result = self
            .cancel_in(&mut *tx, subscription_id, user_id, reason, immediate)
            .await;
        let result = finish(tx, result).await;
        observe("cancel", &result);

        if let Ok(outcome) = &result {
            info!(
                refund = ?outcome.refund_amount,
                access_until = %outcome.access_until,
                "Subscription cancelled"
            );
            self.audit
                .log(
                    AuditEvent::subscription(user_id, "subscription.cancelled", subscription_id)
                        .with_summary(outcome.message.clone()),
                )
                .await;
        }

        result
    }

    async fn cancel_in(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        user_id: Uuid,
        reason: Option<&str>,
        immediate: bool,
    ) -> Result<CancellationOutcome, SubscriptionError> {
        let current = self.lock_owned(conn, subscription_id, user_id).await?;
        if !current.status().can_cancel() {
            return Err(SubscriptionError::invalid_state("cancel", &current.status));
        }

        let now = Utc::now();
        let (end_date, refund_amount) = if immediate {
            let window =
                ProrationWindow::at(current.current_period_start, current.current_period_end, now);
            (now, Some(window.refund(current.final_price)))
        } else {
            (current.current_period_end, None)
        };

        let updated = self
            .db
            .cancel_subscription(
                conn,
                subscription_id,
                &CancellationUpdate {
                    end_date,
                    cancellation_date: now,
                    reason: reason.map(str::to_string),
                    cancelled_by: user_id,
                },
            )
            .await?;

        self.db
            .insert_history(
                conn,
                &NewHistoryEntry {
                    old_tier_id: Some(current.tier_id),
                    old_price: Some(current.final_price),
                    prorated_amount: refund_amount,
                    reason: reason.map(str::to_string),
                    notes: Some(if immediate { "Immediate" } else { "At period end" }.to_string()),
                    ..NewHistoryEntry::status_change(
                        subscription_id,
                        HistoryAction::Cancelled,
                        user_id,
                        end_date,
                    )
                },
            )
            .await?;

        let message = match refund_amount {
            Some(refund) => format!(
                "Subscription cancelled immediately. A refund of {} will be processed.",
                refund
            ),
            None => format!(
                "Subscription cancelled. Access continues until {}.",
                end_date.date_naive()
            ),
        };

        Ok(CancellationOutcome {
            subscription: updated,
            refund_amount,
            access_until: end_date,
            message,
        })
    }

    // =========================================================================
    // Read / Update Helpers
    // =========================================================================

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn toggle_auto_renewal(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
        auto_renew: bool,
    ) -> Result<Subscription, SubscriptionError> {
        let mut tx = self.db.begin().await?;
        let result = self
            .toggle_auto_renewal_in(&mut *tx, subscription_id, user_id, auto_renew)
            .await;
        let result = finish(tx, result).await;
        observe("toggle_auto_renewal", &result);

        if result.is_ok() {
            self.audit
                .log(
                    AuditEvent::subscription(user_id, "subscription.auto_renew", subscription_id)
                        .with_summary(format!("auto_renew = {}", auto_renew)),
                )
                .await;
        }

        result
    }

    async fn toggle_auto_renewal_in(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        user_id: Uuid,
        auto_renew: bool,
    ) -> Result<Subscription, SubscriptionError> {
        let current = self.lock_owned(conn, subscription_id, user_id).await?;
        if current.status() == SubscriptionStatus::Cancelled {
            return Err(SubscriptionError::invalid_state(
                "change auto-renewal of",
                &current.status,
            ));
        }
        self.db.set_auto_renew(conn, subscription_id, auto_renew).await
    }

    pub async fn get_subscription(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
    ) -> Result<Subscription, SubscriptionError> {
        let mut conn = self.db.acquire().await?;
        self.db
            .get_subscription(&mut conn, subscription_id, user_id)
            .await?
            .ok_or(SubscriptionError::SubscriptionNotFound(subscription_id))
    }

    pub async fn list_user_subscriptions(
        &self,
        user_id: Uuid,
        status: Option<SubscriptionStatus>,
    ) -> Result<Vec<Subscription>, SubscriptionError> {
        let mut conn = self.db.acquire().await?;
        self.db
            .list_user_subscriptions(&mut conn, user_id, status)
            .await
    }

    /// History newest first.
    pub async fn get_subscription_history(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<SubscriptionHistory>, SubscriptionError> {
        let mut conn = self.db.acquire().await?;
        self.db
            .get_subscription(&mut conn, subscription_id, user_id)
            .await?
            .ok_or(SubscriptionError::SubscriptionNotFound(subscription_id))?;
        self.db.list_history(&mut conn, subscription_id).await
    }

    pub async fn list_entitlements(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Entitlement>, SubscriptionError> {
        let mut conn = self.db.acquire().await?;
        self.db
            .get_subscription(&mut conn, subscription_id, user_id)
            .await?
            .ok_or(SubscriptionError::SubscriptionNotFound(subscription_id))?;
        self.entitlements
            .list_entitlements(&mut conn, subscription_id)
            .await
    }

    /// Price of the next renewal, taking a scheduled downgrade into account.
    /// Nothing is written.
    pub async fn preview_renewal(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
    ) -> Result<RenewalPreview, SubscriptionError> {
        let mut conn = self.db.acquire().await?;
        let subscription = self
            .db
            .get_subscription(&mut conn, subscription_id, user_id)
            .await?
            .ok_or(SubscriptionError::SubscriptionNotFound(subscription_id))?;

        if subscription.status() == SubscriptionStatus::Cancelled {
            return Err(SubscriptionError::invalid_state(
                "preview renewal of",
                &subscription.status,
            ));
        }

        let tier_id = subscription.pending_tier_id.unwrap_or(subscription.tier_id);
        let billing_cycle_id = subscription
            .pending_billing_cycle_id
            .unwrap_or(subscription.billing_cycle_id);
        let pricing = self
            .pricing
            .calculate_in(&mut conn, tier_id, billing_cycle_id, None, None)
            .await?;

        Ok(RenewalPreview {
            subscription_id,
            next_billing_date: subscription.next_billing_date,
            tier_id,
            billing_cycle_id,
            auto_renew: subscription.auto_renew,
            pricing,
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn lock_owned(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        user_id: Uuid,
    ) -> Result<Subscription, SubscriptionError> {
        self.db
            .lock_subscription(conn, subscription_id, user_id)
            .await?
            .ok_or(SubscriptionError::SubscriptionNotFound(subscription_id))
    }

    /// Stored life stage, or the one derived from the date of birth when the
    /// reconciliation job has not assigned one yet.
    async fn pet_life_stage(
        &self,
        conn: &mut PgConnection,
        pet: &Pet,
    ) -> Result<Option<i32>, SubscriptionError> {
        if let Some(life_stage_id) = pet.life_stage_id {
            return Ok(Some(life_stage_id));
        }
        let Some(date_of_birth) = pet.date_of_birth else {
            return Ok(None);
        };

        let stages = self.db.list_life_stages(conn, pet.species_id).await?;
        let age = age_in_months(date_of_birth, Utc::now().date_naive());
        Ok(LifeStage::resolve(&stages, pet.species_id, age).map(|s| s.life_stage_id))
    }

    async fn grant_entitlements(
        &self,
        conn: &mut PgConnection,
        subscription: &Subscription,
        pet: &Pet,
        cycle: &BillingCycle,
        reset_date: DateTime<Utc>,
        replace: bool,
    ) -> Result<Vec<Entitlement>, SubscriptionError> {
        let Some(life_stage_id) = self.pet_life_stage(conn, pet).await? else {
            warn!(pet_id = %pet.pet_id, "Pet has no life stage; no entitlements granted");
            if replace {
                self.db
                    .delete_entitlements(conn, subscription.subscription_id)
                    .await?;
            }
            return Ok(Vec::new());
        };

        if replace {
            self.entitlements
                .reinitialize_entitlements(
                    conn,
                    subscription.subscription_id,
                    subscription.tier_id,
                    pet.species_id,
                    life_stage_id,
                    cycle,
                    reset_date,
                )
                .await
        } else {
            self.entitlements
                .initialize_entitlements(
                    conn,
                    subscription.subscription_id,
                    subscription.tier_id,
                    pet.species_id,
                    life_stage_id,
                    cycle,
                    reset_date,
                )
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cycle(months: i32) -> BillingCycle {
        BillingCycle {
            billing_cycle_id: 1,
            cycle_name: "test".to_string(),
            months,
            discount_percentage: Decimal::ZERO,
            is_active: true,
        }
    }

    #[test]
    fn monthly_period_ends_same_day_next_month() {
        let start = Utc.with_ymd_and_hms(2026, 1, 15, 9, 30, 0).unwrap();
        assert_eq!(
            period_end(start, &cycle(1)),
            Utc.with_ymd_and_hms(2026, 2, 15, 9, 30, 0).unwrap()
        );
    }

    #[test]
    fn month_end_clamps_to_shorter_month() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        assert_eq!(
            period_end(start, &cycle(1)),
            Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn annual_period_spans_twelve_months() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let end = period_end(start, &cycle(12));
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 3, 1, 0, 0, 0).unwrap());
        assert!(end >= start);
    }
}
