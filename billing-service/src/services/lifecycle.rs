//! Subscription lifecycle state machine.
//!
//! Status transitions, plan changes (immediate and scheduled), proration
//! preview, trial and grace-period handling. Remote sync is best-effort:
//! gateway failures are logged and local state stands, except initial
//! remote creation which downgrades the subscription to `incomplete`.

use crate::config::BillingConfig;
use crate::models::{
    max_grace_period_days, preview_plan_change, BillableRef, CancellationOutcome,
    ChangePlanOptions, CreateCustomer, CreateSubscription, Customer, Plan, PlanChangePreview,
    SubscribeOptions, Subscription, SubscriptionItem, SubscriptionStatus,
};
use crate::services::events::{BillingEvent, EventSink};
use crate::services::metrics::record_subscription_operation;
use crate::services::payments::PaymentGateway;
use crate::services::Database;
use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Subscription lifecycle orchestration.
#[derive(Clone)]
pub struct SubscriptionService {
    db: Database,
    #[allow(dead_code)]
    config: BillingConfig,
    gateway: Option<Arc<dyn PaymentGateway>>,
    events: Arc<dyn EventSink>,
}

impl SubscriptionService {
    pub fn new(
        db: Database,
        config: BillingConfig,
        gateway: Option<Arc<dyn PaymentGateway>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            db,
            config,
            gateway,
            events,
        }
    }

    /// Subscribe a billable principal to a base plan.
    ///
    /// Starts `trialing` when the plan grants trial days (or the caller
    /// passes an explicit trial end), `active` otherwise. Remote creation
    /// is attempted when a gateway is configured; its failure leaves the
    /// subscription `incomplete` instead of failing the call.
    #[instrument(skip(self, customer_input, options), fields(plan_id = %plan_id))]
    pub async fn subscribe(
        &self,
        customer_input: &CreateCustomer,
        plan_id: Uuid,
        options: SubscribeOptions,
    ) -> Result<Subscription, AppError> {
        let now = Utc::now();

        let plan = self
            .db
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Plan not found")))?;

        if !plan.is_active {
            return Err(AppError::BadRequest(anyhow!("Plan is not available")));
        }
        if plan.is_addon() {
            return Err(AppError::BadRequest(anyhow!(
                "Cannot subscribe directly to an addon"
            )));
        }

        let customer = self.db.get_or_create_customer(customer_input).await?;

        let trial_ends_at = options.trial_ends_at.or_else(|| {
            plan.has_trial()
                .then(|| now + Duration::days(plan.trial_period_days as i64))
        });
        let status = if trial_ends_at.is_some() {
            SubscriptionStatus::Trialing
        } else {
            SubscriptionStatus::Active
        };

        let subscription = self
            .db
            .create_subscription(&CreateSubscription {
                customer_id: customer.customer_id,
                status,
                trial_ends_at,
                current_period_start: now,
                current_period_end: plan.period_end_from(now),
                metadata: options.metadata.clone(),
            })
            .await?;

        self.db
            .add_subscription_item(subscription.subscription_id, plan.plan_id, options.quantity)
            .await?;

        record_subscription_operation("created");
        self.events.publish(BillingEvent::SubscriptionCreated {
            subscription_id: subscription.subscription_id,
            customer_id: customer.customer_id,
        });

        let subscription = self.create_remote_subscription(customer, subscription).await?;

        Ok(subscription)
    }

    /// Attach an additional plan item. Addons flagged `requires_plan`
    /// need a base-plan item already present.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, plan_id = %plan_id))]
    pub async fn add_item(
        &self,
        subscription_id: Uuid,
        plan_id: Uuid,
        quantity: i32,
    ) -> Result<SubscriptionItem, AppError> {
        let plan = self
            .db
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Plan not found")))?;

        if plan.requires_base_plan() && !self.db.has_base_plan_item(subscription_id).await? {
            return Err(AppError::BadRequest(anyhow!(
                "This addon requires a base plan"
            )));
        }

        self.db
            .add_subscription_item(subscription_id, plan_id, quantity)
            .await
    }

    /// The subscription's primary base plan, if any.
    pub async fn get_current_plan(&self, subscription_id: Uuid) -> Result<Option<Plan>, AppError> {
        let Some(item) = self.db.get_primary_item(subscription_id).await? else {
            return Ok(None);
        };
        self.db.get_plan(item.plan_id).await
    }

    /// Cancel a subscription. The plan's cancellation behavior decides
    /// between immediate and end-of-period unless the caller forces
    /// immediate.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        immediately: bool,
    ) -> Result<Subscription, AppError> {
        let now = Utc::now();

        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        let behavior = self
            .get_current_plan(subscription_id)
            .await?
            .map(|plan| plan.parsed_cancellation_behavior())
            .unwrap_or_default();

        let outcome = CancellationOutcome::resolve(
            behavior,
            immediately,
            now,
            subscription.current_period_end,
        );

        let subscription = self
            .db
            .cancel_subscription(subscription_id, now, outcome.ends_at)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        if let Some(gateway) = &self.gateway {
            if let Some(processor_id) = subscription.processor_id.as_deref() {
                if let Err(e) = gateway
                    .cancel_subscription(processor_id, outcome.immediately)
                    .await
                {
                    warn!(error = %e, "Failed to cancel subscription remotely; local state kept");
                }
            }
        }

        record_subscription_operation("canceled");
        self.events.publish(BillingEvent::SubscriptionCanceled {
            subscription_id,
            immediately: outcome.immediately,
        });

        Ok(subscription)
    }

    /// Resume a subscription canceled onto its grace period: clears the
    /// cancellation and returns it to `active`.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn resume(&self, subscription_id: Uuid) -> Result<Subscription, AppError> {
        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        if !subscription.on_grace_period(Utc::now()) {
            return Err(AppError::BadRequest(anyhow!(
                "Subscription cannot be resumed"
            )));
        }

        let subscription = self
            .db
            .resume_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        record_subscription_operation("resumed");
        self.events.publish(BillingEvent::SubscriptionResumed { subscription_id });

        Ok(subscription)
    }

    /// Change the subscription's primary plan.
    ///
    /// Rejects when no base-plan item exists or the target equals the
    /// current plan. With `schedule` set this defers instead of mutating.
    /// When proration applies and the subscription is remotely synced,
    /// the proration invoice is the processor's job; nothing is charged
    /// locally in the immediate path.
    #[instrument(skip(self, options), fields(subscription_id = %subscription_id, new_plan_id = %new_plan_id))]
    pub async fn change_plan(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        options: ChangePlanOptions,
    ) -> Result<Subscription, AppError> {
        let now = Utc::now();

        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        let new_plan = self
            .db
            .get_plan(new_plan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("New plan not found")))?;

        if !new_plan.is_active {
            return Err(AppError::BadRequest(anyhow!(
                "Cannot change to an inactive plan"
            )));
        }

        let primary_item = self
            .db
            .get_primary_item(subscription_id)
            .await?
            .ok_or_else(|| AppError::BadRequest(anyhow!("No plan found in subscription")))?;

        let current_plan = self
            .db
            .get_plan(primary_item.plan_id)
            .await?
            .ok_or_else(|| {
                AppError::InternalError(anyhow!("Current plan missing for subscription item"))
            })?;

        if current_plan.plan_id == new_plan.plan_id {
            return Err(AppError::BadRequest(anyhow!(
                "New plan is the same as current plan"
            )));
        }

        if current_plan.currency != new_plan.currency {
            return Err(AppError::BadRequest(anyhow!(
                "Cannot change to plan with different currency"
            )));
        }

        if options.schedule {
            return self
                .schedule_plan_change(subscription_id, new_plan_id, options.schedule_for)
                .await;
        }

        let prorate = options.prorate.unwrap_or(current_plan.prorate_changes);

        let updated = self
            .db
            .change_subscription_plan(
                subscription_id,
                primary_item.item_id,
                current_plan.plan_id,
                new_plan.plan_id,
                options.quantity,
                now,
            )
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        if prorate && subscription.has_processor_id() {
            // The processor computes and invoices the proration; the
            // local preview endpoint is the only local proration math.
            debug!(subscription_id = %subscription_id, "Proration delegated to payment processor");
        }

        record_subscription_operation("plan_changed");
        self.events.publish(BillingEvent::PlanChanged {
            subscription_id,
            previous_plan_id: current_plan.plan_id,
            new_plan_id: new_plan.plan_id,
            prorated: prorate,
        });
        info!(
            subscription_id = %subscription_id,
            from = %current_plan.slug,
            to = %new_plan.slug,
            "Plan changed"
        );

        Ok(updated)
    }

    /// Defer a plan change: records the target plan and effective time
    /// (defaulting to the current period end) without mutating the
    /// subscription's items.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, new_plan_id = %new_plan_id))]
    pub async fn schedule_plan_change(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        schedule_for: Option<DateTime<Utc>>,
    ) -> Result<Subscription, AppError> {
        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        let scheduled_for = schedule_for.unwrap_or(subscription.current_period_end);

        let subscription = self
            .db
            .schedule_plan_change(subscription_id, new_plan_id, scheduled_for)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        record_subscription_operation("plan_change_scheduled");
        self.events.publish(BillingEvent::PlanChangeScheduled {
            subscription_id,
            new_plan_id,
            scheduled_for,
        });

        Ok(subscription)
    }

    /// Drop a scheduled plan change.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn cancel_scheduled_plan_change(
        &self,
        subscription_id: Uuid,
    ) -> Result<Subscription, AppError> {
        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        if !subscription.has_scheduled_plan_change() {
            return Err(AppError::BadRequest(anyhow!(
                "No scheduled plan change found"
            )));
        }

        let subscription = self
            .db
            .clear_scheduled_plan_change(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        record_subscription_operation("scheduled_plan_change_canceled");

        Ok(subscription)
    }

    /// Apply a due scheduled plan change. Idempotent: returns false when
    /// nothing is scheduled, the schedule is still in the future, or the
    /// target plan no longer exists (the stale schedule is dropped).
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn apply_scheduled_plan_change(
        &self,
        subscription_id: Uuid,
    ) -> Result<bool, AppError> {
        let now = Utc::now();

        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        if !subscription.scheduled_change_due(now) {
            return Ok(false);
        }

        let new_plan_id = subscription
            .scheduled_plan_id
            .expect("scheduled_change_due implies a scheduled plan");

        if self.db.get_plan(new_plan_id).await?.is_none() {
            self.db.clear_scheduled_plan_change(subscription_id).await?;
            return Ok(false);
        }

        self.db.clear_scheduled_plan_change(subscription_id).await?;
        self.change_plan(
            subscription_id,
            new_plan_id,
            ChangePlanOptions {
                prorate: Some(false),
                ..ChangePlanOptions::default()
            },
        )
        .await?;

        Ok(true)
    }

    /// Preview the proration of changing to `new_plan_id`. Read-only.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, new_plan_id = %new_plan_id))]
    pub async fn preview_plan_change(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
    ) -> Result<PlanChangePreview, AppError> {
        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        let new_plan = self
            .db
            .get_plan(new_plan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("New plan not found")))?;

        let current_plan = self
            .get_current_plan(subscription_id)
            .await?
            .ok_or_else(|| AppError::BadRequest(anyhow!("No plan found in subscription")))?;

        Ok(preview_plan_change(
            &subscription,
            &current_plan,
            &new_plan,
            Utc::now(),
        ))
    }

    /// Advance a lapsed billing period by one plan interval. The new
    /// period starts where the old one ended.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn renew(&self, subscription_id: Uuid) -> Result<Subscription, AppError> {
        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        let new_start = subscription.current_period_end;
        let new_end = match self.get_current_plan(subscription_id).await? {
            Some(plan) => plan.period_end_from(new_start),
            // No surviving base item; fall back to one month.
            None => new_start + chrono::Months::new(1),
        };

        let subscription = self
            .db
            .update_subscription_period(subscription_id, new_start, new_end)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        record_subscription_operation("renewed");

        Ok(subscription)
    }

    /// Settle an ended trial: `active` when the customer can pay,
    /// `incomplete` when no payment method is on file.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn expire_trial(&self, subscription_id: Uuid) -> Result<Subscription, AppError> {
        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        let has_payment_method = self
            .db
            .has_payment_method(subscription.customer_id)
            .await?;
        let status = if has_payment_method {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::Incomplete
        };

        let subscription = self
            .db
            .update_subscription_status(subscription_id, status)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        record_subscription_operation(if has_payment_method {
            "trial_activated"
        } else {
            "trial_incomplete"
        });

        Ok(subscription)
    }

    /// Suspend a past-due subscription whose grace period has run out.
    /// The grace period is the longest `grace_period_days` across the
    /// subscription's base-plan items; zero means no grace handling.
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    pub async fn suspend_if_grace_expired(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let Some(last_failed_payment_at) = subscription.last_failed_payment_at else {
            return Ok(false);
        };

        let mut plans = Vec::new();
        for item in self
            .db
            .get_subscription_items(subscription.subscription_id)
            .await?
        {
            if let Some(plan) = self.db.get_plan(item.plan_id).await? {
                plans.push(plan);
            }
        }

        let grace_days = max_grace_period_days(plans.iter());
        if grace_days == 0 {
            return Ok(false);
        }

        let grace_expires_at = last_failed_payment_at + Duration::days(grace_days as i64);
        if now <= grace_expires_at {
            return Ok(false);
        }

        self.db
            .update_subscription_status(
                subscription.subscription_id,
                SubscriptionStatus::Suspended,
            )
            .await?;
        record_subscription_operation("suspended");
        info!(subscription_id = %subscription.subscription_id, "Subscription suspended after grace period");

        Ok(true)
    }

    /// Active or trialing subscriptions owned by a billable principal.
    pub async fn active_subscriptions(
        &self,
        billable: &BillableRef,
    ) -> Result<Vec<Subscription>, AppError> {
        let Some(customer) = self.db.get_customer_by_billable(billable).await? else {
            return Ok(Vec::new());
        };
        self.db
            .active_subscriptions_for_customer(customer.customer_id)
            .await
    }

    /// Whether any active subscription grants a feature.
    pub async fn has_feature(
        &self,
        billable: &BillableRef,
        feature: &str,
    ) -> Result<bool, AppError> {
        Ok(self.features(billable).await?.iter().any(|f| f == feature))
    }

    /// All distinct features granted by active subscriptions.
    pub async fn features(&self, billable: &BillableRef) -> Result<Vec<String>, AppError> {
        let mut features: Vec<String> = Vec::new();

        for subscription in self.active_subscriptions(billable).await? {
            for item in self
                .db
                .get_subscription_items(subscription.subscription_id)
                .await?
            {
                if let Some(plan) = self.db.get_plan(item.plan_id).await? {
                    for feature in plan.feature_list() {
                        if !features.contains(&feature) {
                            features.push(feature);
                        }
                    }
                }
            }
        }

        Ok(features)
    }

    /// (item, plan) pairs for a subscription.
    pub async fn items_with_plans(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<(SubscriptionItem, Plan)>, AppError> {
        let mut pairs = Vec::new();
        for item in self.db.get_subscription_items(subscription_id).await? {
            if let Some(plan) = self.db.get_plan(item.plan_id).await? {
                pairs.push((item, plan));
            }
        }
        Ok(pairs)
    }

    /// Mirror a fresh subscription to the processor. Failure downgrades
    /// the local subscription to `incomplete` instead of erroring.
    async fn create_remote_subscription(
        &self,
        mut customer: Customer,
        subscription: Subscription,
    ) -> Result<Subscription, AppError> {
        let Some(gateway) = &self.gateway else {
            return Ok(subscription);
        };

        if !customer.has_processor_id() {
            match gateway.sync_customer(&customer).await {
                Ok(processor_id) => {
                    if let Some(updated) = self
                        .db
                        .set_customer_processor_id(customer.customer_id, &processor_id)
                        .await?
                    {
                        customer = updated;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to sync customer to processor");
                    return self.mark_incomplete(subscription).await;
                }
            }
        }

        let items = self
            .items_with_plans(subscription.subscription_id)
            .await?;

        match gateway
            .create_subscription(&customer, &subscription, &items)
            .await
        {
            Ok(remote) => Ok(self
                .db
                .set_subscription_processor(
                    subscription.subscription_id,
                    &remote.processor_id,
                    Some(&remote.processor_status),
                )
                .await?
                .unwrap_or(subscription)),
            Err(e) => {
                warn!(error = %e, "Failed to create subscription remotely");
                self.mark_incomplete(subscription).await
            }
        }
    }

    async fn mark_incomplete(
        &self,
        subscription: Subscription,
    ) -> Result<Subscription, AppError> {
        record_subscription_operation("incomplete");
        Ok(self
            .db
            .update_subscription_status(
                subscription.subscription_id,
                SubscriptionStatus::Incomplete,
            )
            .await?
            .unwrap_or(subscription))
    }
}
