//! Discount engine: validity, applicability, stacking, and attachment.

use crate::models::{stack_discounts, AppliedDiscount, Discount, DiscountDuration, Subscription};
use crate::services::events::EventSink;
use crate::services::metrics::record_discount_operation;
use crate::services::payments::PaymentGateway;
use crate::services::Database;
use anyhow::anyhow;
use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Discount orchestration over the database and the remote processor.
#[derive(Clone)]
pub struct DiscountService {
    db: Database,
    gateway: Option<Arc<dyn PaymentGateway>>,
    #[allow(dead_code)]
    events: Arc<dyn EventSink>,
}

impl DiscountService {
    pub fn new(
        db: Database,
        gateway: Option<Arc<dyn PaymentGateway>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            db,
            gateway,
            events,
        }
    }

    /// Look up an end-user-redeemable discount by code and require it to
    /// be valid right now.
    #[instrument(skip(self))]
    pub async fn find_valid_by_code(&self, code: &str) -> Result<Discount, AppError> {
        let discount = self
            .db
            .find_discount_by_code(code)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Discount code not found")))?;

        if !discount.is_valid(Utc::now()) {
            return Err(AppError::NotFound(anyhow!(
                "Discount code not found or has expired"
            )));
        }

        Ok(discount)
    }

    /// Attach a discount to a subscription.
    ///
    /// Precondition failures (invalid discount, no applicable plan,
    /// already applied) are the caller's fault and surface as rejections.
    /// The redemption increment and the join-row creation are atomic.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, discount_id = %discount_id))]
    pub async fn apply_discount(
        &self,
        subscription_id: Uuid,
        discount_id: Uuid,
    ) -> Result<AppliedDiscount, AppError> {
        let now = Utc::now();

        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        let discount = self
            .db
            .get_discount(discount_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Discount not found")))?;

        if !discount.is_valid(now) {
            return Err(AppError::BadRequest(anyhow!("Discount is not valid")));
        }

        let mut applies_to_any = false;
        for item in self.db.get_subscription_items(subscription_id).await? {
            if let Some(plan) = self.db.get_plan(item.plan_id).await? {
                if discount.can_apply_to_plan(&plan) {
                    applies_to_any = true;
                    break;
                }
            }
        }
        if !applies_to_any {
            return Err(AppError::BadRequest(anyhow!(
                "Discount cannot be applied to any plans in this subscription"
            )));
        }

        if self
            .db
            .get_active_applied_discount(subscription_id, discount_id, now)
            .await?
            .is_some()
        {
            return Err(AppError::BadRequest(anyhow!(
                "Discount is already applied to this subscription"
            )));
        }

        let expires_at = applied_discount_expiry(&discount, &subscription, now);

        let applied = self
            .db
            .apply_discount(subscription_id, discount_id, now, expires_at)
            .await?;

        if let Some(gateway) = &self.gateway {
            if let Some(processor_id) = subscription.processor_id.as_deref() {
                if let Err(e) = gateway.apply_discount(processor_id, &discount).await {
                    warn!(error = %e, "Failed to apply discount remotely; local state kept");
                }
            }
        }

        record_discount_operation("applied");

        Ok(applied)
    }

    /// Attach a discount by its redemption code.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn apply_discount_code(
        &self,
        subscription_id: Uuid,
        code: &str,
    ) -> Result<AppliedDiscount, AppError> {
        let discount = self.find_valid_by_code(code).await?;
        self.apply_discount(subscription_id, discount.discount_id)
            .await
    }

    /// Detach a discount from a subscription.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, discount_id = %discount_id))]
    pub async fn remove_discount(
        &self,
        subscription_id: Uuid,
        discount_id: Uuid,
    ) -> Result<(), AppError> {
        let now = Utc::now();

        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        if self
            .db
            .get_active_applied_discount(subscription_id, discount_id, now)
            .await?
            .is_none()
        {
            return Err(AppError::BadRequest(anyhow!(
                "Discount is not applied to this subscription"
            )));
        }

        self.db
            .remove_applied_discount(subscription_id, discount_id)
            .await?;

        // When the last active discount goes away, drop it remotely too.
        if let Some(gateway) = &self.gateway {
            if let Some(processor_id) = subscription.processor_id.as_deref() {
                if self.active_discounts(subscription_id).await?.is_empty() {
                    if let Err(e) = gateway.remove_discount(processor_id).await {
                        warn!(error = %e, "Failed to remove discount remotely; local state kept");
                    }
                }
            }
        }

        record_discount_operation("removed");

        Ok(())
    }

    /// Active (applied discount, discount) pairs in application order.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn active_discount_pairs(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<(AppliedDiscount, Discount)>, AppError> {
        let now = Utc::now();
        let mut pairs = Vec::new();

        for applied in self.db.get_applied_discounts(subscription_id).await? {
            if let Some(discount) = self.db.get_discount(applied.discount_id).await? {
                if applied.is_active(&discount, now) {
                    pairs.push((applied, discount));
                }
            }
        }

        Ok(pairs)
    }

    /// Active discounts for a subscription, in application order.
    pub async fn active_discounts(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<Discount>, AppError> {
        Ok(self
            .active_discount_pairs(subscription_id)
            .await?
            .into_iter()
            .map(|(_, discount)| discount)
            .collect())
    }

    /// Total discount against `amount` from the subscription's active
    /// discounts, stacked sequentially against the remaining amount.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn calculate_discount_amount(
        &self,
        subscription_id: Uuid,
        amount: Decimal,
        currency: Option<&str>,
    ) -> Result<Decimal, AppError> {
        let discounts = self.active_discounts(subscription_id).await?;
        Ok(stack_discounts(&discounts, amount, currency))
    }
}

/// Expiry for a newly applied discount, derived from its duration policy:
/// `once` runs out with the current period, `repeating(N)` N months from
/// now, `forever` never.
pub fn applied_discount_expiry(
    discount: &Discount,
    subscription: &Subscription,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match discount.parsed_duration() {
        DiscountDuration::Once => Some(subscription.current_period_end),
        DiscountDuration::Repeating => discount
            .duration_in_months
            .and_then(|months| now.checked_add_months(Months::new(months.max(0) as u32))),
        DiscountDuration::Forever => None,
    }
}
