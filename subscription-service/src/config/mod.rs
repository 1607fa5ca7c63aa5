//! Configuration module for subscription-service.

use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub pricing: PricingPolicy,
    pub lifecycle: LifecyclePolicy,
    pub life_stage_job: LifeStageJobConfig,
    pub renewal_job: RenewalJobConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Jurisdiction-specific pricing rules.
#[derive(Debug, Clone)]
pub struct PricingPolicy {
    pub tax_percentage: Decimal,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            tax_percentage: Decimal::from(18),
        }
    }
}

/// Business rules for lifecycle transitions.
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    pub max_pause_days: i64,
    /// Days after creation an invoice falls due.
    pub invoice_due_days: i64,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            max_pause_days: 90,
            invoice_due_days: 7,
        }
    }
}

/// Nightly life-stage reconciliation.
#[derive(Debug, Clone)]
pub struct LifeStageJobConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Pets scanned per transaction.
    pub batch_size: i64,
}

impl Default for LifeStageJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 86_400,
            batch_size: 5_000,
        }
    }
}

/// Scheduled downgrade application and entitlement quota resets.
#[derive(Debug, Clone)]
pub struct RenewalJobConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for RenewalJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3_600,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl SubscriptionConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let tax_percentage = match env::var("PRICING_TAX_PERCENTAGE") {
            Ok(raw) => Decimal::from_str(&raw).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!(
                    "PRICING_TAX_PERCENTAGE is not a decimal: {}",
                    e
                ))
            })?,
            Err(_) => PricingPolicy::default().tax_percentage,
        };
        if tax_percentage.is_sign_negative() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PRICING_TAX_PERCENTAGE must not be negative"
            )));
        }

        let lifecycle_defaults = LifecyclePolicy::default();
        let life_stage_defaults = LifeStageJobConfig::default();
        let renewal_defaults = RenewalJobConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "subscription-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            pricing: PricingPolicy { tax_percentage },
            lifecycle: LifecyclePolicy {
                max_pause_days: env_or("LIFECYCLE_MAX_PAUSE_DAYS", lifecycle_defaults.max_pause_days),
                invoice_due_days: env_or(
                    "LIFECYCLE_INVOICE_DUE_DAYS",
                    lifecycle_defaults.invoice_due_days,
                ),
            },
            life_stage_job: LifeStageJobConfig {
                enabled: env_or("LIFE_STAGE_JOB_ENABLED", life_stage_defaults.enabled),
                interval_secs: env_or(
                    "LIFE_STAGE_JOB_INTERVAL_SECS",
                    life_stage_defaults.interval_secs,
                ),
                batch_size: env_or("LIFE_STAGE_JOB_BATCH_SIZE", life_stage_defaults.batch_size)
                    .max(1),
            },
            renewal_job: RenewalJobConfig {
                enabled: env_or("RENEWAL_JOB_ENABLED", renewal_defaults.enabled),
                interval_secs: env_or("RENEWAL_JOB_INTERVAL_SECS", renewal_defaults.interval_secs),
            },
        })
    }
}
