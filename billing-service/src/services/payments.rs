//! Payment processor boundary.
//!
//! The processor is an opaque remote collaborator reached through the
//! [`PaymentGateway`] trait. Local state is authoritative: the core works
//! with no gateway configured, remote sync is best-effort, and gateway
//! failures are logged rather than propagated — except initial
//! subscription creation, which downgrades the subscription to
//! `incomplete`.
//!
//! Inbound processor events arrive through [`WebhookService`], whose
//! handlers are idempotent: redelivering an event must not double-apply
//! its effects.

use crate::services::events::{BillingEvent, EventSink};
use crate::services::metrics::record_subscription_operation;
use crate::services::Database;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::models::{Customer, Discount, Plan, Refund, Subscription, SubscriptionItem};

/// Remote subscription handle returned by the processor.
#[derive(Debug, Clone)]
pub struct RemoteSubscription {
    pub processor_id: String,
    pub processor_status: String,
}

/// Outbound operations the core delegates to the payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create or update the remote customer; returns its processor id.
    async fn sync_customer(&self, customer: &Customer) -> Result<String, AppError>;

    /// Create or update the remote product/price pair for a plan;
    /// returns (product id, price id).
    async fn sync_plan(&self, plan: &Plan) -> Result<(String, String), AppError>;

    /// Create the remote subscription mirroring the local one.
    async fn create_subscription(
        &self,
        customer: &Customer,
        subscription: &Subscription,
        items: &[(SubscriptionItem, Plan)],
    ) -> Result<RemoteSubscription, AppError>;

    /// Cancel the remote subscription, immediately or at period end.
    async fn cancel_subscription(
        &self,
        processor_id: &str,
        immediately: bool,
    ) -> Result<(), AppError>;

    /// Attach a discount to the remote subscription.
    async fn apply_discount(
        &self,
        subscription_processor_id: &str,
        discount: &Discount,
    ) -> Result<(), AppError>;

    /// Remove any discount from the remote subscription.
    async fn remove_discount(&self, subscription_processor_id: &str) -> Result<(), AppError>;

    /// Create the remote refund; returns its processor id.
    async fn create_refund(
        &self,
        refund: &Refund,
        invoice_processor_id: Option<&str>,
    ) -> Result<String, AppError>;
}

/// Idempotent handlers for inbound processor events.
///
/// Events reference processor-side ids; unknown ids are ignored (the
/// processor may emit events for objects this installation never synced).
/// Each handler returns whether it changed local state.
#[derive(Clone)]
pub struct WebhookService {
    db: Database,
    events: Arc<dyn EventSink>,
}

impl WebhookService {
    pub fn new(db: Database, events: Arc<dyn EventSink>) -> Self {
        Self { db, events }
    }

    /// `invoice.paid`: mark the local invoice paid. Re-delivery is a
    /// no-op — an already-paid invoice keeps its original `paid_at`.
    #[instrument(skip(self))]
    pub async fn handle_invoice_paid(&self, processor_invoice_id: &str) -> Result<bool, AppError> {
        let Some(invoice) = self.db.get_invoice_by_processor_id(processor_invoice_id).await? else {
            warn!(processor_invoice_id, "Paid event for unknown invoice");
            return Ok(false);
        };

        if invoice.is_paid() {
            return Ok(false);
        }

        self.db.mark_invoice_paid(invoice.invoice_id, Utc::now()).await?;
        self.events.publish(BillingEvent::PaymentSucceeded {
            invoice_id: invoice.invoice_id,
        });
        info!(invoice_id = %invoice.invoice_id, "Invoice marked paid from processor event");

        Ok(true)
    }

    /// `invoice.payment_failed`: bump the failure counter and drop the
    /// subscription to past_due.
    #[instrument(skip(self))]
    pub async fn handle_payment_failed(
        &self,
        processor_subscription_id: &str,
        failure_message: Option<String>,
    ) -> Result<bool, AppError> {
        let Some(subscription) = self
            .db
            .get_subscription_by_processor_id(processor_subscription_id)
            .await?
        else {
            warn!(processor_subscription_id, "Payment failure for unknown subscription");
            return Ok(false);
        };

        self.db
            .record_payment_failure(subscription.subscription_id, Utc::now())
            .await?;
        record_subscription_operation("payment_failed");
        self.events.publish(BillingEvent::PaymentFailed {
            subscription_id: subscription.subscription_id,
            failure_message,
        });

        Ok(true)
    }

    /// `subscription.updated`: sync period dates and processor status.
    #[instrument(skip(self))]
    pub async fn handle_subscription_updated(
        &self,
        processor_subscription_id: &str,
        processor_status: Option<&str>,
        period_start: Option<DateTime<Utc>>,
        period_end: Option<DateTime<Utc>>,
    ) -> Result<bool, AppError> {
        let Some(subscription) = self
            .db
            .get_subscription_by_processor_id(processor_subscription_id)
            .await?
        else {
            return Ok(false);
        };

        if let (Some(start), Some(end)) = (period_start, period_end) {
            self.db
                .update_subscription_period(subscription.subscription_id, start, end)
                .await?;
        }

        if let Some(status) = processor_status {
            self.db
                .set_subscription_processor(
                    subscription.subscription_id,
                    processor_subscription_id,
                    Some(status),
                )
                .await?;
        }

        Ok(true)
    }

    /// `subscription.deleted`: mark canceled, ending now. Re-delivery
    /// for an already-ended subscription is a no-op.
    #[instrument(skip(self))]
    pub async fn handle_subscription_deleted(
        &self,
        processor_subscription_id: &str,
    ) -> Result<bool, AppError> {
        let Some(subscription) = self
            .db
            .get_subscription_by_processor_id(processor_subscription_id)
            .await?
        else {
            return Ok(false);
        };

        let now = Utc::now();
        if subscription.is_canceled() && subscription.has_ended(now) {
            return Ok(false);
        }

        self.db
            .cancel_subscription(subscription.subscription_id, now, now)
            .await?;
        record_subscription_operation("canceled_by_processor");
        self.events.publish(BillingEvent::SubscriptionCanceled {
            subscription_id: subscription.subscription_id,
            immediately: true,
        });

        Ok(true)
    }
}
