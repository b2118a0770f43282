//! Periodic billing sweep: renewals, trial expirations, grace-period
//! expirations, scheduled plan changes, and ended-subscription cleanup.
//!
//! Invoked by an external scheduler. Failures are isolated per
//! subscription: one bad row is recorded and the batch keeps going.

use crate::services::lifecycle::SubscriptionService;
use crate::services::metrics::record_sweep_result;
use crate::services::Database;
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::error::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// One subscription the sweep could not process.
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub subscription_id: Uuid,
    pub error: String,
}

/// Outcome of one sweep task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSection {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub failures: Vec<SweepFailure>,
}

impl SweepSection {
    fn success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    fn failure(&mut self, subscription_id: Uuid, error: &AppError) {
        self.processed += 1;
        self.failed += 1;
        self.failures.push(SweepFailure {
            subscription_id,
            error: error.to_string(),
        });
    }
}

/// Full sweep report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub renewals: SweepSection,
    pub trial_expirations: SweepSection,
    pub grace_expirations: SweepSection,
    pub scheduled_plan_changes: SweepSection,
    pub ended_cleanup: SweepSection,
}

impl SweepReport {
    pub fn total_failed(&self) -> u32 {
        self.renewals.failed
            + self.trial_expirations.failed
            + self.grace_expirations.failed
            + self.scheduled_plan_changes.failed
            + self.ended_cleanup.failed
    }
}

/// The sweep engine.
#[derive(Clone)]
pub struct BillingSweep {
    db: Database,
    subscriptions: SubscriptionService,
}

impl BillingSweep {
    pub fn new(db: Database, subscriptions: SubscriptionService) -> Self {
        Self { db, subscriptions }
    }

    /// Run every sweep task once.
    #[instrument(skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        info!("Billing sweep started");

        let report = SweepReport {
            renewals: self.process_renewals(now).await?,
            trial_expirations: self.process_trial_expirations(now).await?,
            grace_expirations: self.process_grace_expirations(now).await?,
            scheduled_plan_changes: self.process_scheduled_plan_changes(now).await?,
            ended_cleanup: self.cleanup_ended(now).await?,
        };

        info!(failed = report.total_failed(), "Billing sweep finished");

        Ok(report)
    }

    /// Advance every active/trialing subscription whose period lapsed.
    #[instrument(skip(self))]
    pub async fn process_renewals(&self, now: DateTime<Utc>) -> Result<SweepSection, AppError> {
        let mut section = SweepSection::default();

        for subscription in self.db.find_renewals_due(now).await? {
            match self.subscriptions.renew(subscription.subscription_id).await {
                Ok(_) => {
                    record_sweep_result("renewal", "succeeded");
                    section.success();
                }
                Err(e) => {
                    record_sweep_result("renewal", "failed");
                    warn!(subscription_id = %subscription.subscription_id, error = %e, "Renewal failed");
                    section.failure(subscription.subscription_id, &e);
                }
            }
        }

        Ok(section)
    }

    /// Settle trials that have ended.
    #[instrument(skip(self))]
    pub async fn process_trial_expirations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SweepSection, AppError> {
        let mut section = SweepSection::default();

        for subscription in self.db.find_expiring_trials(now).await? {
            match self
                .subscriptions
                .expire_trial(subscription.subscription_id)
                .await
            {
                Ok(_) => {
                    record_sweep_result("trial_expiration", "succeeded");
                    section.success();
                }
                Err(e) => {
                    record_sweep_result("trial_expiration", "failed");
                    warn!(subscription_id = %subscription.subscription_id, error = %e, "Trial expiration failed");
                    section.failure(subscription.subscription_id, &e);
                }
            }
        }

        Ok(section)
    }

    /// Suspend past-due subscriptions whose grace period ran out.
    #[instrument(skip(self))]
    pub async fn process_grace_expirations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SweepSection, AppError> {
        let mut section = SweepSection::default();

        for subscription in self.db.find_past_due().await? {
            match self
                .subscriptions
                .suspend_if_grace_expired(&subscription, now)
                .await
            {
                Ok(suspended) => {
                    if suspended {
                        record_sweep_result("grace_expiration", "succeeded");
                        section.success();
                    }
                }
                Err(e) => {
                    record_sweep_result("grace_expiration", "failed");
                    warn!(subscription_id = %subscription.subscription_id, error = %e, "Grace check failed");
                    section.failure(subscription.subscription_id, &e);
                }
            }
        }

        Ok(section)
    }

    /// Apply scheduled plan changes that have come due.
    #[instrument(skip(self))]
    pub async fn process_scheduled_plan_changes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SweepSection, AppError> {
        let mut section = SweepSection::default();

        for subscription in self.db.find_due_scheduled_changes(now).await? {
            match self
                .subscriptions
                .apply_scheduled_plan_change(subscription.subscription_id)
                .await
            {
                Ok(applied) => {
                    if applied {
                        record_sweep_result("scheduled_plan_change", "succeeded");
                        section.success();
                    }
                }
                Err(e) => {
                    record_sweep_result("scheduled_plan_change", "failed");
                    warn!(subscription_id = %subscription.subscription_id, error = %e, "Scheduled plan change failed");
                    section.failure(subscription.subscription_id, &e);
                }
            }
        }

        Ok(section)
    }

    /// Account for canceled subscriptions past their end date. They are
    /// kept (not deleted) but excluded from active billing; this pass
    /// only reports them.
    #[instrument(skip(self))]
    pub async fn cleanup_ended(&self, now: DateTime<Utc>) -> Result<SweepSection, AppError> {
        let mut section = SweepSection::default();

        for _subscription in self.db.find_ended(now).await? {
            record_sweep_result("ended_cleanup", "succeeded");
            section.success();
        }

        Ok(section)
    }
}
