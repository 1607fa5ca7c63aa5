//! Database service for subscription-service.
//!
//! Methods that take a `&mut PgConnection` run on whatever connection the
//! caller holds, so lifecycle operations can compose them inside one
//! transaction.

use crate::models::{
    BillingCycle, Entitlement, LifeStage, NewHistoryEntry, NewSubscription, Pet, PromoCode,
    Subscription, SubscriptionHistory, SubscriptionStatus, SubscriptionTier, TierChange,
    TierConfig,
};
use crate::services::error::{db_error, SubscriptionError};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, user_id, pet_id, tier_id, billing_cycle_id, status, start_date, end_date, current_period_start, current_period_end, next_billing_date, base_price, discount_applied, final_price, promo_code, auto_renew, pause_reason, paused_utc, resume_date, cancellation_date, cancellation_reason, cancelled_by, pending_tier_id, pending_billing_cycle_id, created_utc, updated_utc";

const ENTITLEMENT_COLUMNS: &str = "entitlement_id, subscription_id, category_id, quota_total, quota_used, quota_remaining, reset_date, last_used_utc, created_utc";

/// Outcome of one life-stage reconciliation page.
#[derive(Debug, Clone, Copy)]
pub struct LifeStageBatch {
    pub last_pet_id: Option<Uuid>,
    pub scanned: i64,
    pub updated: i64,
}

/// Cancellation columns written by `cancel_subscription`.
#[derive(Debug, Clone)]
pub struct CancellationUpdate {
    pub end_date: DateTime<Utc>,
    pub cancellation_date: DateTime<Utc>,
    pub reason: Option<String>,
    pub cancelled_by: Uuid,
}

/// Result of trying to book a promo redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoBooking {
    Booked,
    /// `max_uses_total` was reached by other redemptions.
    TotalLimitReached,
    /// The user already holds `max_uses_per_user` redemptions.
    UserLimitReached,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "subscription-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Begin a transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, SubscriptionError> {
        self.pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))
    }

    /// Acquire a plain connection for read-only work.
    pub async fn acquire(
        &self,
    ) -> Result<sqlx::pool::PoolConnection<Postgres>, SubscriptionError> {
        self.pool
            .acquire()
            .await
            .map_err(db_error("Failed to acquire connection"))
    }

    // =========================================================================
    // Reference Data
    // =========================================================================

    /// Get an active tier.
    #[instrument(skip(self, conn))]
    pub async fn get_tier(
        &self,
        conn: &mut PgConnection,
        tier_id: i32,
    ) -> Result<Option<SubscriptionTier>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["get_tier"])
            .start_timer();

        sqlx::query_as::<_, SubscriptionTier>(
            r#"
            SELECT tier_id, tier_name, base_price, rank, display_order, is_active
            FROM subscription_tiers
            WHERE tier_id = $1 AND is_active = TRUE
            "#,
        )
        .bind(tier_id)
        .fetch_optional(conn)
        .await
        .map_err(db_error("Failed to get tier"))
    }

    /// Get an active billing cycle.
    #[instrument(skip(self, conn))]
    pub async fn get_billing_cycle(
        &self,
        conn: &mut PgConnection,
        billing_cycle_id: i32,
    ) -> Result<Option<BillingCycle>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["get_billing_cycle"])
            .start_timer();

        sqlx::query_as::<_, BillingCycle>(
            r#"
            SELECT billing_cycle_id, cycle_name, months, discount_percentage, is_active
            FROM billing_cycles
            WHERE billing_cycle_id = $1 AND is_active = TRUE
            "#,
        )
        .bind(billing_cycle_id)
        .fetch_optional(conn)
        .await
        .map_err(db_error("Failed to get billing cycle"))
    }

    /// Get tier configuration rows for a tier/species/life-stage triple.
    #[instrument(skip(self, conn))]
    pub async fn get_tier_configs(
        &self,
        conn: &mut PgConnection,
        tier_id: i32,
        species_id: i32,
        life_stage_id: i32,
    ) -> Result<Vec<TierConfig>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["get_tier_configs"])
            .start_timer();

        sqlx::query_as::<_, TierConfig>(
            r#"
            SELECT config_id, tier_id, species_id, life_stage_id, category_id, quota_monthly, quota_annual, is_included
            FROM tier_configs
            WHERE tier_id = $1 AND species_id = $2 AND life_stage_id = $3
            ORDER BY category_id
            "#,
        )
        .bind(tier_id)
        .bind(species_id)
        .bind(life_stage_id)
        .fetch_all(conn)
        .await
        .map_err(db_error("Failed to get tier configs"))
    }

    /// Life-stage ranges for a species.
    #[instrument(skip(self, conn))]
    pub async fn list_life_stages(
        &self,
        conn: &mut PgConnection,
        species_id: i32,
    ) -> Result<Vec<LifeStage>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["list_life_stages"])
            .start_timer();

        sqlx::query_as::<_, LifeStage>(
            r#"
            SELECT life_stage_id, species_id, life_stage_name, min_age_months, max_age_months
            FROM life_stages
            WHERE species_id = $1
            ORDER BY min_age_months
            "#,
        )
        .bind(species_id)
        .fetch_all(conn)
        .await
        .map_err(db_error("Failed to list life stages"))
    }

    /// Get a pet regardless of owner.
    #[instrument(skip(self, conn), fields(pet_id = %pet_id))]
    pub async fn get_pet(
        &self,
        conn: &mut PgConnection,
        pet_id: Uuid,
    ) -> Result<Option<Pet>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["get_pet"])
            .start_timer();

        sqlx::query_as::<_, Pet>(
            r#"
            SELECT pet_id, owner_id, name, species_id, life_stage_id, date_of_birth, is_active, updated_utc
            FROM pets
            WHERE pet_id = $1
            "#,
        )
        .bind(pet_id)
        .fetch_optional(conn)
        .await
        .map_err(db_error("Failed to get pet"))
    }

    /// Get an active pet owned by `user_id`, share-locked for the transaction.
    #[instrument(skip(self, conn), fields(pet_id = %pet_id, user_id = %user_id))]
    pub async fn get_owned_active_pet(
        &self,
        conn: &mut PgConnection,
        pet_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Pet>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["get_owned_active_pet"])
            .start_timer();

        sqlx::query_as::<_, Pet>(
            r#"
            SELECT pet_id, owner_id, name, species_id, life_stage_id, date_of_birth, is_active, updated_utc
            FROM pets
            WHERE pet_id = $1 AND owner_id = $2 AND is_active = TRUE
            FOR SHARE
            "#,
        )
        .bind(pet_id)
        .bind(user_id)
        .fetch_optional(conn)
        .await
        .map_err(db_error("Failed to get pet"))
    }

    // =========================================================================
    // Promo Codes
    // =========================================================================

    /// Find a promo code by its (case-insensitive) code.
    #[instrument(skip(self, conn))]
    pub async fn find_promo_code(
        &self,
        conn: &mut PgConnection,
        code: &str,
    ) -> Result<Option<PromoCode>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["find_promo_code"])
            .start_timer();

        sqlx::query_as::<_, PromoCode>(
            r#"
            SELECT promo_id, promo_code, discount_type, discount_value, max_discount_amount, valid_from, valid_until, max_uses_total, max_uses_per_user, tier_ids, billing_cycle_ids, current_uses, is_active
            FROM promo_codes
            WHERE UPPER(promo_code) = UPPER($1)
            "#,
        )
        .bind(code.trim())
        .fetch_optional(conn)
        .await
        .map_err(db_error("Failed to find promo code"))
    }

    /// Count how many times a user has redeemed a promo.
    #[instrument(skip(self, conn), fields(user_id = %user_id))]
    pub async fn count_promo_usage(
        &self,
        conn: &mut PgConnection,
        promo_id: i32,
        user_id: Uuid,
    ) -> Result<i64, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["count_promo_usage"])
            .start_timer();

        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM promo_code_usage WHERE promo_id = $1 AND user_id = $2",
        )
        .bind(promo_id)
        .bind(user_id)
        .fetch_one(conn)
        .await
        .map_err(db_error("Failed to count promo usage"))
    }

    /// Book one redemption for `user_id`.
    ///
    /// The counter bump takes the promo row lock, so concurrent bookings of
    /// the same code are serialized and the per-user count that follows
    /// sees every redemption committed before it.
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id))]
    pub async fn record_promo_usage(
        &self,
        conn: &mut PgConnection,
        promo_id: i32,
        user_id: Uuid,
        subscription_id: Uuid,
        discount_amount: Decimal,
    ) -> Result<PromoBooking, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["record_promo_usage"])
            .start_timer();

        let per_user_limit: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE promo_codes
            SET current_uses = current_uses + 1
            WHERE promo_id = $1 AND (max_uses_total IS NULL OR current_uses < max_uses_total)
            RETURNING max_uses_per_user
            "#,
        )
        .bind(promo_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("Failed to increment promo usage"))?;

        let Some(per_user_limit) = per_user_limit else {
            return Ok(PromoBooking::TotalLimitReached);
        };

        let user_uses = self.count_promo_usage(&mut *conn, promo_id, user_id).await?;
        if user_uses >= i64::from(per_user_limit) {
            return Ok(PromoBooking::UserLimitReached);
        }

        sqlx::query(
            r#"
            INSERT INTO promo_code_usage (usage_id, promo_id, user_id, subscription_id, discount_amount)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(promo_id)
        .bind(user_id)
        .bind(subscription_id)
        .bind(discount_amount)
        .execute(conn)
        .await
        .map_err(db_error("Failed to record promo usage"))?;

        Ok(PromoBooking::Booked)
    }

    // =========================================================================
    // Subscription Operations
    // =========================================================================

    /// Find the live (active or trial) subscription for a pet.
    #[instrument(skip(self, conn), fields(pet_id = %pet_id))]
    pub async fn find_live_subscription_for_pet(
        &self,
        conn: &mut PgConnection,
        pet_id: Uuid,
    ) -> Result<Option<Uuid>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["find_live_subscription_for_pet"])
            .start_timer();

        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT subscription_id
            FROM subscriptions
            WHERE pet_id = $1 AND status IN ('active', 'trial')
            LIMIT 1
            "#,
        )
        .bind(pet_id)
        .fetch_optional(conn)
        .await
        .map_err(db_error("Failed to check existing subscription"))
    }

    /// Insert a subscription row.
    #[instrument(skip(self, conn, input), fields(pet_id = %input.pet_id))]
    pub async fn insert_subscription(
        &self,
        conn: &mut PgConnection,
        input: &NewSubscription,
    ) -> Result<Subscription, SubscriptionError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_subscription"])
            .start_timer();

        let subscription_id = Uuid::new_v4();
        let sql = format!(
            r#"
            INSERT INTO subscriptions (subscription_id, user_id, pet_id, tier_id, billing_cycle_id, status, start_date, current_period_start, current_period_end, next_billing_date, base_price, discount_applied, final_price, promo_code)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $8, $8, $9, $10, $11, $12)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );

        let subscription = sqlx::query_as::<_, Subscription>(&sql)
            .bind(subscription_id)
            .bind(input.user_id)
            .bind(input.pet_id)
            .bind(input.tier_id)
            .bind(input.billing_cycle_id)
            .bind(input.status.as_str())
            .bind(input.start_date)
            .bind(input.current_period_end)
            .bind(input.base_price)
            .bind(input.discount_applied)
            .bind(input.final_price)
            .bind(&input.promo_code)
            .fetch_one(conn)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    // Another request created a live subscription for this pet first
                    SubscriptionError::ActiveSubscriptionExists(input.pet_id)
                }
                _ => SubscriptionError::Database(anyhow::anyhow!(
                    "Failed to create subscription: {}",
                    e
                )),
            })?;

        timer.observe_duration();
        info!(subscription_id = %subscription.subscription_id, "Subscription created");

        Ok(subscription)
    }

    /// Get a subscription owned by `user_id`.
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id, user_id = %user_id))]
    pub async fn get_subscription(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE subscription_id = $1 AND user_id = $2"
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(subscription_id)
            .bind(user_id)
            .fetch_optional(conn)
            .await
            .map_err(db_error("Failed to get subscription"))
    }

    /// Get and row-lock a subscription owned by `user_id`.
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id, user_id = %user_id))]
    pub async fn lock_subscription(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["lock_subscription"])
            .start_timer();

        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE subscription_id = $1 AND user_id = $2 FOR UPDATE"
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(subscription_id)
            .bind(user_id)
            .fetch_optional(conn)
            .await
            .map_err(db_error("Failed to lock subscription"))
    }

    /// Row-lock a subscription without an ownership check (batch jobs).
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id))]
    pub async fn lock_subscription_by_id(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["lock_subscription_by_id"])
            .start_timer();

        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE subscription_id = $1 FOR UPDATE"
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(subscription_id)
            .fetch_optional(conn)
            .await
            .map_err(db_error("Failed to lock subscription"))
    }

    /// List a user's subscriptions, newest first.
    #[instrument(skip(self, conn), fields(user_id = %user_id))]
    pub async fn list_user_subscriptions(
        &self,
        conn: &mut PgConnection,
        user_id: Uuid,
        status: Option<SubscriptionStatus>,
    ) -> Result<Vec<Subscription>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["list_user_subscriptions"])
            .start_timer();

        let sql = format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE user_id = $1 AND ($2::varchar IS NULL OR status = $2)
            ORDER BY created_utc DESC
            "#
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(user_id)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(conn)
            .await
            .map_err(db_error("Failed to list subscriptions"))
    }

    /// Write a new tier and price in place, clearing any scheduled downgrade.
    /// When `new_period` is given the billing period restarts on it.
    #[instrument(skip(self, conn, change), fields(subscription_id = %subscription_id))]
    pub async fn update_subscription_tier(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        change: &TierChange,
        new_period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Subscription, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription_tier"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE subscriptions
            SET tier_id = $2, billing_cycle_id = $3, base_price = $4, discount_applied = $5, final_price = $6,
                promo_code = NULL, pending_tier_id = NULL, pending_billing_cycle_id = NULL,
                current_period_start = COALESCE($7, current_period_start),
                current_period_end = COALESCE($8, current_period_end),
                next_billing_date = COALESCE($8, next_billing_date),
                updated_utc = NOW()
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(subscription_id)
            .bind(change.tier_id)
            .bind(change.billing_cycle_id)
            .bind(change.base_price)
            .bind(change.discount_applied)
            .bind(change.final_price)
            .bind(new_period.map(|(start, _)| start))
            .bind(new_period.map(|(_, end)| end))
            .fetch_one(conn)
            .await
            .map_err(db_error("Failed to update subscription tier"))
    }

    /// Record the tier and cycle a subscription moves to at its next billing date.
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id))]
    pub async fn schedule_downgrade(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        pending_tier_id: i32,
        pending_billing_cycle_id: i32,
    ) -> Result<Subscription, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["schedule_downgrade"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE subscriptions
            SET pending_tier_id = $2, pending_billing_cycle_id = $3, updated_utc = NOW()
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(subscription_id)
            .bind(pending_tier_id)
            .bind(pending_billing_cycle_id)
            .fetch_one(conn)
            .await
            .map_err(db_error("Failed to schedule downgrade"))
    }

    /// Apply a scheduled downgrade and start a new billing period.
    #[instrument(skip(self, conn, change), fields(subscription_id = %subscription_id))]
    pub async fn apply_downgrade(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        change: &TierChange,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Subscription, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["apply_downgrade"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE subscriptions
            SET tier_id = $2, billing_cycle_id = $3, base_price = $4, discount_applied = $5, final_price = $6,
                promo_code = NULL, pending_tier_id = NULL, pending_billing_cycle_id = NULL,
                current_period_start = $7, current_period_end = $8, next_billing_date = $8,
                updated_utc = NOW()
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(subscription_id)
            .bind(change.tier_id)
            .bind(change.billing_cycle_id)
            .bind(change.base_price)
            .bind(change.discount_applied)
            .bind(change.final_price)
            .bind(period_start)
            .bind(period_end)
            .fetch_one(conn)
            .await
            .map_err(db_error("Failed to apply downgrade"))
    }

    /// Active subscriptions whose scheduled downgrade is due.
    #[instrument(skip(self, conn))]
    pub async fn find_due_downgrades(
        &self,
        conn: &mut PgConnection,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["find_due_downgrades"])
            .start_timer();

        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT subscription_id
            FROM subscriptions
            WHERE status = 'active' AND pending_tier_id IS NOT NULL AND next_billing_date <= $1
            ORDER BY next_billing_date
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(conn)
        .await
        .map_err(db_error("Failed to find due downgrades"))
    }

    /// Mark a subscription paused.
    #[instrument(skip(self, conn, reason), fields(subscription_id = %subscription_id))]
    pub async fn pause_subscription(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        reason: &str,
        paused_utc: DateTime<Utc>,
        resume_date: DateTime<Utc>,
    ) -> Result<Subscription, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["pause_subscription"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE subscriptions
            SET status = 'paused', pause_reason = $2, paused_utc = $3, resume_date = $4, updated_utc = NOW()
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(subscription_id)
            .bind(reason)
            .bind(paused_utc)
            .bind(resume_date)
            .fetch_one(conn)
            .await
            .map_err(db_error("Failed to pause subscription"))
    }

    /// Return a paused subscription to active and clear pause metadata.
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id))]
    pub async fn resume_subscription(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        pet_id: Uuid,
    ) -> Result<Subscription, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["resume_subscription"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE subscriptions
            SET status = 'active', pause_reason = NULL, paused_utc = NULL, resume_date = NULL,
                pending_tier_id = NULL, pending_billing_cycle_id = NULL, updated_utc = NOW()
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(subscription_id)
            .fetch_one(conn)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    // The pet got a new live subscription while this one was paused
                    SubscriptionError::ActiveSubscriptionExists(pet_id)
                }
                _ => SubscriptionError::Database(anyhow::anyhow!(
                    "Failed to resume subscription: {}",
                    e
                )),
            })
    }

    /// Mark a subscription cancelled and stop renewal.
    #[instrument(skip(self, conn, update), fields(subscription_id = %subscription_id))]
    pub async fn cancel_subscription(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        update: &CancellationUpdate,
    ) -> Result<Subscription, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_subscription"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled', auto_renew = FALSE, end_date = $2, cancellation_date = $3,
                cancellation_reason = $4, cancelled_by = $5,
                pending_tier_id = NULL, pending_billing_cycle_id = NULL, updated_utc = NOW()
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(subscription_id)
            .bind(update.end_date)
            .bind(update.cancellation_date)
            .bind(&update.reason)
            .bind(update.cancelled_by)
            .fetch_one(conn)
            .await
            .map_err(db_error("Failed to cancel subscription"))
    }

    /// Set the auto-renew flag.
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id))]
    pub async fn set_auto_renew(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        auto_renew: bool,
    ) -> Result<Subscription, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["set_auto_renew"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE subscriptions
            SET auto_renew = $2, updated_utc = NOW()
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(subscription_id)
            .bind(auto_renew)
            .fetch_one(conn)
            .await
            .map_err(db_error("Failed to update auto renewal"))
    }

    // =========================================================================
    // History Operations
    // =========================================================================

    /// Append a history row.
    #[instrument(skip(self, conn, entry), fields(subscription_id = %entry.subscription_id, action = entry.action.as_str()))]
    pub async fn insert_history(
        &self,
        conn: &mut PgConnection,
        entry: &NewHistoryEntry,
    ) -> Result<SubscriptionHistory, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["insert_history"])
            .start_timer();

        sqlx::query_as::<_, SubscriptionHistory>(
            r#"
            INSERT INTO subscription_history (history_id, subscription_id, action, old_tier_id, new_tier_id, old_price, new_price, price_difference, prorated_amount, performed_by, effective_date, reason, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING history_id, subscription_id, action, old_tier_id, new_tier_id, old_price, new_price, price_difference, prorated_amount, performed_by, effective_date, reason, notes, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.subscription_id)
        .bind(entry.action.as_str())
        .bind(entry.old_tier_id)
        .bind(entry.new_tier_id)
        .bind(entry.old_price)
        .bind(entry.new_price)
        .bind(entry.price_difference())
        .bind(entry.prorated_amount)
        .bind(entry.performed_by)
        .bind(entry.effective_date)
        .bind(&entry.reason)
        .bind(&entry.notes)
        .fetch_one(conn)
        .await
        .map_err(db_error("Failed to record subscription history"))
    }

    /// History for a subscription, newest first.
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id))]
    pub async fn list_history(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionHistory>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["list_history"])
            .start_timer();

        sqlx::query_as::<_, SubscriptionHistory>(
            r#"
            SELECT history_id, subscription_id, action, old_tier_id, new_tier_id, old_price, new_price, price_difference, prorated_amount, performed_by, effective_date, reason, notes, created_utc
            FROM subscription_history
            WHERE subscription_id = $1
            ORDER BY created_utc DESC, history_id
            "#,
        )
        .bind(subscription_id)
        .fetch_all(conn)
        .await
        .map_err(db_error("Failed to list subscription history"))
    }

    // =========================================================================
    // Entitlement Operations
    // =========================================================================

    /// Insert one entitlement with a full quota.
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id))]
    pub async fn insert_entitlement(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        category_id: i32,
        quota_total: Option<i32>,
        reset_date: DateTime<Utc>,
    ) -> Result<Entitlement, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["insert_entitlement"])
            .start_timer();

        let sql = format!(
            r#"
            INSERT INTO subscription_entitlements (entitlement_id, subscription_id, category_id, quota_total, quota_used, quota_remaining, reset_date)
            VALUES ($1, $2, $3, $4, 0, $4, $5)
            RETURNING {ENTITLEMENT_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Entitlement>(&sql)
            .bind(Uuid::new_v4())
            .bind(subscription_id)
            .bind(category_id)
            .bind(quota_total)
            .bind(reset_date)
            .fetch_one(conn)
            .await
            .map_err(db_error("Failed to create entitlement"))
    }

    /// Delete every entitlement of a subscription.
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id))]
    pub async fn delete_entitlements(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
    ) -> Result<u64, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["delete_entitlements"])
            .start_timer();

        let result = sqlx::query("DELETE FROM subscription_entitlements WHERE subscription_id = $1")
            .bind(subscription_id)
            .execute(conn)
            .await
            .map_err(db_error("Failed to delete entitlements"))?;

        Ok(result.rows_affected())
    }

    /// Get one entitlement.
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id))]
    pub async fn get_entitlement(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        category_id: i32,
    ) -> Result<Option<Entitlement>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["get_entitlement"])
            .start_timer();

        let sql = format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM subscription_entitlements WHERE subscription_id = $1 AND category_id = $2"
        );
        sqlx::query_as::<_, Entitlement>(&sql)
            .bind(subscription_id)
            .bind(category_id)
            .fetch_optional(conn)
            .await
            .map_err(db_error("Failed to get entitlement"))
    }

    /// All entitlements of a subscription.
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id))]
    pub async fn list_entitlements(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
    ) -> Result<Vec<Entitlement>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["list_entitlements"])
            .start_timer();

        let sql = format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM subscription_entitlements WHERE subscription_id = $1 ORDER BY category_id"
        );
        sqlx::query_as::<_, Entitlement>(&sql)
            .bind(subscription_id)
            .fetch_all(conn)
            .await
            .map_err(db_error("Failed to list entitlements"))
    }

    /// Consume quota in one statement. The row lock taken by the UPDATE
    /// serializes concurrent consumers, and the `quota_remaining >= $3`
    /// guard is evaluated against the locked row, so two callers cannot
    /// both pass the check. Returns `None` when nothing was consumed.
    #[instrument(skip(self, conn), fields(subscription_id = %subscription_id))]
    pub async fn consume_entitlement(
        &self,
        conn: &mut PgConnection,
        subscription_id: Uuid,
        category_id: i32,
        quantity: i32,
        used_at: DateTime<Utc>,
    ) -> Result<Option<Entitlement>, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["consume_entitlement"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE subscription_entitlements
            SET quota_used = quota_used + $3,
                quota_remaining = CASE WHEN quota_total IS NULL THEN NULL ELSE quota_remaining - $3 END,
                last_used_utc = $4
            WHERE subscription_id = $1 AND category_id = $2
              AND (quota_total IS NULL OR quota_remaining >= $3)
            RETURNING {ENTITLEMENT_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Entitlement>(&sql)
            .bind(subscription_id)
            .bind(category_id)
            .bind(quantity)
            .bind(used_at)
            .fetch_optional(conn)
            .await
            .map_err(db_error("Failed to consume entitlement"))
    }

    /// Refill quotas whose reset date has passed, moving the reset date one
    /// billing cycle forward. Returns rows touched.
    #[instrument(skip(self, conn))]
    pub async fn reset_due_entitlements(
        &self,
        conn: &mut PgConnection,
        now: DateTime<Utc>,
    ) -> Result<u64, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["reset_due_entitlements"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE subscription_entitlements e
            SET quota_used = 0,
                quota_remaining = e.quota_total,
                reset_date = e.reset_date + make_interval(months => bc.months)
            FROM subscriptions s
            JOIN billing_cycles bc ON bc.billing_cycle_id = s.billing_cycle_id
            WHERE e.subscription_id = s.subscription_id
              AND s.status IN ('active', 'trial')
              AND e.reset_date <= $1
            "#,
        )
        .bind(now)
        .execute(conn)
        .await
        .map_err(db_error("Failed to reset entitlements"))?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Life Stage Reconciliation
    // =========================================================================

    /// Recompute life stages for the next page of active pets after
    /// `after_pet_id` and update the ones that drifted.
    ///
    /// Age is measured against `as_of` rather than the clock so every page
    /// of one run agrees on "today".
    #[instrument(skip(self, conn))]
    pub async fn reconcile_life_stage_batch(
        &self,
        conn: &mut PgConnection,
        after_pet_id: Option<Uuid>,
        as_of: NaiveDate,
        batch_size: i64,
    ) -> Result<LifeStageBatch, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["reconcile_life_stage_batch"])
            .start_timer();

        let (last_pet_id, scanned, updated) = sqlx::query_as::<_, (Option<Uuid>, i64, i64)>(
            r#"
            WITH page AS (
                SELECT pet_id, species_id, life_stage_id,
                       (DATE_PART('year', AGE($3::date, date_of_birth)) * 12
                        + DATE_PART('month', AGE($3::date, date_of_birth)))::int AS age_months
                FROM pets
                WHERE is_active = TRUE
                  AND date_of_birth IS NOT NULL
                  AND ($1::uuid IS NULL OR pet_id > $1)
                ORDER BY pet_id
                LIMIT $2
            ),
            targets AS (
                SELECT DISTINCT ON (page.pet_id) page.pet_id, ls.life_stage_id AS target_stage
                FROM page
                JOIN life_stages ls
                  ON ls.species_id = page.species_id
                 AND page.age_months >= ls.min_age_months
                 AND (ls.max_age_months IS NULL OR page.age_months < ls.max_age_months)
                ORDER BY page.pet_id, ls.min_age_months DESC
            ),
            updated AS (
                UPDATE pets p
                SET life_stage_id = t.target_stage, updated_utc = NOW()
                FROM targets t
                WHERE p.pet_id = t.pet_id
                  AND p.life_stage_id IS DISTINCT FROM t.target_stage
                RETURNING p.pet_id
            )
            SELECT (SELECT pet_id FROM page ORDER BY pet_id DESC LIMIT 1) AS last_pet_id,
                   (SELECT COUNT(*) FROM page) AS scanned,
                   (SELECT COUNT(*) FROM updated) AS updated
            "#,
        )
        .bind(after_pet_id)
        .bind(batch_size)
        .bind(as_of)
        .fetch_one(conn)
        .await
        .map_err(db_error("Failed to reconcile life stages"))?;

        Ok(LifeStageBatch {
            last_pet_id,
            scanned,
            updated,
        })
    }
}
