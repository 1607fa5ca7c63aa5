use crate::config::{LifeStageJobConfig, RenewalJobConfig};
use crate::services::metrics::record_job_run;
use crate::services::{LifeStageReconciler, SubscriptionError, SubscriptionService};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What one renewal pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenewalSummary {
    pub downgrades_applied: u64,
    pub entitlements_reset: u64,
}

/// Apply due scheduled downgrades, then refill quotas whose reset date has
/// passed. Downgrades go first so their fresh entitlements are not reset twice.
pub async fn run_renewal_cycle(
    service: &SubscriptionService,
    now: DateTime<Utc>,
) -> Result<RenewalSummary, SubscriptionError> {
    let downgrades_applied = service.apply_scheduled_downgrades(now).await?;
    let entitlements_reset = service.entitlements().reset_due_entitlements(now).await?;
    Ok(RenewalSummary {
        downgrades_applied,
        entitlements_reset,
    })
}

/// Runs the life-stage reconciliation and renewal loops on fixed intervals
/// until shut down. A failed run is logged and the loop waits for the next tick.
pub struct JobScheduler {
    life_stage: LifeStageJobConfig,
    renewal: RenewalJobConfig,
    reconciler: LifeStageReconciler,
    subscriptions: SubscriptionService,
    shutdown_token: CancellationToken,
}

impl JobScheduler {
    pub fn new(
        life_stage: LifeStageJobConfig,
        renewal: RenewalJobConfig,
        reconciler: LifeStageReconciler,
        subscriptions: SubscriptionService,
    ) -> Self {
        Self {
            life_stage,
            renewal,
            reconciler,
            subscriptions,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.life_stage.enabled {
            tracing::info!(
                interval_secs = self.life_stage.interval_secs,
                batch_size = self.life_stage.batch_size,
                "Starting life stage job"
            );
            let reconciler = self.reconciler.clone();
            handles.push(spawn_periodic(
                "life_stage",
                self.life_stage.interval_secs,
                self.shutdown_token.clone(),
                move || {
                    let reconciler = reconciler.clone();
                    async move {
                        let summary = reconciler.update_all_pet_life_stages().await?;
                        Ok(summary.updated_count.max(0) as u64)
                    }
                },
            ));
        } else {
            tracing::info!("Life stage job disabled by configuration");
        }

        if self.renewal.enabled {
            tracing::info!(
                interval_secs = self.renewal.interval_secs,
                "Starting renewal job"
            );
            let subscriptions = self.subscriptions.clone();
            handles.push(spawn_periodic(
                "renewal",
                self.renewal.interval_secs,
                self.shutdown_token.clone(),
                move || {
                    let subscriptions = subscriptions.clone();
                    async move {
                        let summary = run_renewal_cycle(&subscriptions, Utc::now()).await?;
                        tracing::info!(
                            downgrades_applied = summary.downgrades_applied,
                            entitlements_reset = summary.entitlements_reset,
                            "Renewal cycle finished"
                        );
                        Ok(summary.downgrades_applied + summary.entitlements_reset)
                    }
                },
            ));
        } else {
            tracing::info!("Renewal job disabled by configuration");
        }

        handles
    }

    pub fn shutdown(&self) {
        tracing::info!("Stopping background jobs");
        self.shutdown_token.cancel();
    }
}

fn spawn_periodic<F, Fut>(
    job: &'static str,
    interval_secs: u64,
    shutdown: CancellationToken,
    run: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<u64, SubscriptionError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(job, "Background job shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match run().await {
                        Ok(rows) => record_job_run(job, "success", rows),
                        Err(e) => {
                            tracing::error!(job, error = %e, "Background job run failed");
                            record_job_run(job, "error", 0);
                        }
                    }
                }
            }
        }
    })
}
