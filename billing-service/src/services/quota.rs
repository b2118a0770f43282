//! Quota tracking: usage counters, combined limits, and
//! threshold-crossing notifications.

use crate::config::BillingConfig;
use crate::models::{
    combine_limits, evaluate_thresholds, should_reset_warnings, BillableRef, QuotaNotification,
    QuotaUsage, ThresholdEvaluation,
};
use crate::services::events::{BillingEvent, EventSink};
use crate::services::metrics::record_quota_notification;
use crate::services::Database;
use chrono::Utc;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};

/// Quota orchestration.
#[derive(Clone)]
pub struct QuotaService {
    db: Database,
    config: BillingConfig,
    events: Arc<dyn EventSink>,
}

impl QuotaService {
    pub fn new(db: Database, config: BillingConfig, events: Arc<dyn EventSink>) -> Self {
        Self { db, config, events }
    }

    /// Combined quota limits across all of the billable's active
    /// subscriptions: per key, the sum of `limit × quantity` over the
    /// subscription items. Items whose plan has no limits are skipped; a
    /// `null` per-key limit contributes zero rather than making the
    /// combined key unlimited (see DESIGN.md).
    #[instrument(skip(self), fields(billable = %billable))]
    pub async fn combined_limits(
        &self,
        billable: &BillableRef,
    ) -> Result<HashMap<String, f64>, AppError> {
        let Some(customer) = self.db.get_customer_by_billable(billable).await? else {
            return Ok(HashMap::new());
        };

        let mut entries = Vec::new();
        for subscription in self
            .db
            .active_subscriptions_for_customer(customer.customer_id)
            .await?
        {
            for item in self
                .db
                .get_subscription_items(subscription.subscription_id)
                .await?
            {
                if let Some(plan) = self.db.get_plan(item.plan_id).await? {
                    entries.push((plan.limit_map(), item.quantity));
                }
            }
        }

        Ok(combine_limits(entries))
    }

    /// The combined limit for one key; `None` when no active plan grants
    /// it (treated as unlimited by the checks).
    pub async fn get_limit(
        &self,
        billable: &BillableRef,
        quota_key: &str,
    ) -> Result<Option<f64>, AppError> {
        Ok(self.combined_limits(billable).await?.get(quota_key).copied())
    }

    /// Current usage for a key; zero when never recorded.
    pub async fn get_usage(
        &self,
        billable: &BillableRef,
        quota_key: &str,
    ) -> Result<f64, AppError> {
        Ok(self
            .db
            .get_quota_usage(billable, quota_key)
            .await?
            .map(|usage| usage.current_usage)
            .unwrap_or(0.0))
    }

    /// Increment usage by `delta` (clamped at zero) and check thresholds.
    #[instrument(skip(self), fields(billable = %billable, quota_key = quota_key))]
    pub async fn record_usage(
        &self,
        billable: &BillableRef,
        quota_key: &str,
        delta: f64,
    ) -> Result<Vec<QuotaNotification>, AppError> {
        let usage = self.db.get_or_create_quota_usage(billable, quota_key).await?;
        let new_usage = (usage.current_usage + delta).max(0.0);

        let usage = self
            .db
            .update_quota_usage(
                usage.quota_usage_id,
                new_usage,
                &usage.warning_thresholds_triggered,
                usage.last_exceeded_at,
            )
            .await?;

        self.check_thresholds(billable, usage).await
    }

    /// Set absolute usage (clamped at zero) and check thresholds.
    #[instrument(skip(self), fields(billable = %billable, quota_key = quota_key))]
    pub async fn set_usage(
        &self,
        billable: &BillableRef,
        quota_key: &str,
        amount: f64,
    ) -> Result<Vec<QuotaNotification>, AppError> {
        let usage = self.db.get_or_create_quota_usage(billable, quota_key).await?;

        let usage = self
            .db
            .update_quota_usage(
                usage.quota_usage_id,
                amount.max(0.0),
                &usage.warning_thresholds_triggered,
                usage.last_exceeded_at,
            )
            .await?;

        self.check_thresholds(billable, usage).await
    }

    /// Decrement usage. Dropping back below the combined limit resets
    /// the triggered warning set and the exceeded marker so future
    /// crossings notify again.
    #[instrument(skip(self), fields(billable = %billable, quota_key = quota_key))]
    pub async fn decrement_usage(
        &self,
        billable: &BillableRef,
        quota_key: &str,
        amount: f64,
    ) -> Result<(), AppError> {
        let usage = self.db.get_or_create_quota_usage(billable, quota_key).await?;
        let new_usage = (usage.current_usage - amount).max(0.0);

        let limit = self.get_limit(billable, quota_key).await?;

        if should_reset_warnings(limit, new_usage) {
            self.db
                .update_quota_usage(
                    usage.quota_usage_id,
                    new_usage,
                    &serde_json::Value::Array(Vec::new()),
                    None,
                )
                .await?;
        } else {
            self.db
                .update_quota_usage(
                    usage.quota_usage_id,
                    new_usage,
                    &usage.warning_thresholds_triggered,
                    usage.last_exceeded_at,
                )
                .await?;
        }

        Ok(())
    }

    /// Reset a counter to zero, clearing warning state.
    #[instrument(skip(self), fields(billable = %billable, quota_key = quota_key))]
    pub async fn reset_usage(
        &self,
        billable: &BillableRef,
        quota_key: &str,
    ) -> Result<(), AppError> {
        if let Some(usage) = self.db.get_quota_usage(billable, quota_key).await? {
            self.db
                .update_quota_usage(
                    usage.quota_usage_id,
                    0.0,
                    &serde_json::Value::Array(Vec::new()),
                    None,
                )
                .await?;
        }
        Ok(())
    }

    /// Remaining headroom for a key; `None` means unlimited.
    pub async fn get_remaining_quota(
        &self,
        billable: &BillableRef,
        quota_key: &str,
    ) -> Result<Option<f64>, AppError> {
        let Some(limit) = self.get_limit(billable, quota_key).await? else {
            return Ok(None);
        };
        let usage = self.get_usage(billable, quota_key).await?;
        Ok(Some((limit - usage).max(0.0)))
    }

    /// Whether usage exceeds the combined limit. Unlimited never
    /// exceeds.
    pub async fn is_over_quota(
        &self,
        billable: &BillableRef,
        quota_key: &str,
    ) -> Result<bool, AppError> {
        let Some(limit) = self.get_limit(billable, quota_key).await? else {
            return Ok(false);
        };
        Ok(self.get_usage(billable, quota_key).await? > limit)
    }

    /// Percentage of the limit consumed, capped at 100.
    pub async fn quota_percentage(
        &self,
        billable: &BillableRef,
        quota_key: &str,
    ) -> Result<f64, AppError> {
        let limit = self.get_limit(billable, quota_key).await?;
        let Some(limit) = limit.filter(|l| *l > 0.0) else {
            return Ok(0.0);
        };
        let usage = self.get_usage(billable, quota_key).await?;
        Ok((usage / limit * 100.0).min(100.0))
    }

    /// Evaluate a counter against its combined limit, persist the
    /// crossing state, and emit notifications.
    ///
    /// Exceeding the limit records `last_exceeded_at` and emits one
    /// exceeded notification, skipping warning checks. Otherwise each
    /// newly crossed warning threshold (ascending) is marked and emitted
    /// once; marked thresholds stay silent until explicitly reset.
    async fn check_thresholds(
        &self,
        billable: &BillableRef,
        usage: QuotaUsage,
    ) -> Result<Vec<QuotaNotification>, AppError> {
        let limit = self.get_limit(billable, &usage.quota_key).await?;
        let triggered = usage.triggered_thresholds();

        match evaluate_thresholds(
            usage.current_usage,
            limit,
            &triggered,
            &self.config.quota_warning_thresholds,
        ) {
            ThresholdEvaluation::Unlimited => Ok(Vec::new()),
            ThresholdEvaluation::Exceeded { overage } => {
                let limit = limit.expect("exceeded implies a limit");
                self.db
                    .update_quota_usage(
                        usage.quota_usage_id,
                        usage.current_usage,
                        &usage.warning_thresholds_triggered,
                        Some(Utc::now()),
                    )
                    .await?;

                record_quota_notification("exceeded");
                info!(
                    billable = %billable,
                    quota_key = %usage.quota_key,
                    overage = overage,
                    "Quota exceeded"
                );
                let notification = QuotaNotification::Exceeded {
                    quota_key: usage.quota_key.clone(),
                    current_usage: usage.current_usage,
                    limit,
                    overage,
                };
                self.events.publish(BillingEvent::QuotaExceeded {
                    billable: billable.clone(),
                    quota_key: usage.quota_key,
                    current_usage: usage.current_usage,
                    limit,
                    overage,
                });
                Ok(vec![notification])
            }
            ThresholdEvaluation::Warnings(newly_crossed) => {
                if newly_crossed.is_empty() {
                    return Ok(Vec::new());
                }
                let limit = limit.expect("warnings imply a limit");

                let mut all_triggered = triggered;
                all_triggered.extend(newly_crossed.iter().copied());
                self.db
                    .update_quota_usage(
                        usage.quota_usage_id,
                        usage.current_usage,
                        &serde_json::json!(all_triggered),
                        usage.last_exceeded_at,
                    )
                    .await?;

                let mut notifications = Vec::with_capacity(newly_crossed.len());
                for threshold in newly_crossed {
                    record_quota_notification("warning");
                    notifications.push(QuotaNotification::Warning {
                        quota_key: usage.quota_key.clone(),
                        current_usage: usage.current_usage,
                        limit,
                        threshold,
                    });
                    self.events.publish(BillingEvent::QuotaWarning {
                        billable: billable.clone(),
                        quota_key: usage.quota_key.clone(),
                        current_usage: usage.current_usage,
                        limit,
                        threshold,
                    });
                }
                Ok(notifications)
            }
        }
    }
}
