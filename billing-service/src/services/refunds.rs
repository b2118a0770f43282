//! Refund accounting: creation against the remaining refundable amount,
//! settlement, and credit-on-refund.

use crate::config::BillingConfig;
use crate::models::{validate_refund_amount, Refund, RefundOptions, RefundReason};
use crate::services::events::{BillingEvent, EventSink};
use crate::services::metrics::record_refund_operation;
use crate::services::payments::PaymentGateway;
use crate::services::Database;
use anyhow::anyhow;
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Refund orchestration.
#[derive(Clone)]
pub struct RefundService {
    db: Database,
    config: BillingConfig,
    gateway: Option<Arc<dyn PaymentGateway>>,
    events: Arc<dyn EventSink>,
}

impl RefundService {
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

    /// Refund an invoice. `amount` defaults to the invoice total; a
    /// request exceeding the remaining refundable amount (total minus
    /// succeeded refunds) is rejected.
    ///
    /// The refund starts pending. When a gateway is configured the remote
    /// refund is attempted right away: success settles the refund,
    /// failure records it as failed with the gateway's reason — local
    /// accounting of a remote outcome, never a propagated error.
    #[instrument(skip(self, options), fields(invoice_id = %invoice_id))]
    pub async fn refund(
        &self,
        invoice_id: Uuid,
        amount: Option<Decimal>,
        reason: RefundReason,
        options: RefundOptions,
    ) -> Result<Refund, AppError> {
        let invoice = self
            .db
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Invoice not found")))?;

        let refund_amount = amount.unwrap_or(invoice.total);
        let already_refunded = self.db.sum_succeeded_refunds(invoice_id).await?;
        validate_refund_amount(invoice.total, already_refunded, refund_amount)?;

        let mut options = options;
        if options.description.is_none() {
            options.description = Some(format!("Refund for invoice {}", invoice.invoice_number));
        }

        let refund = self
            .db
            .create_refund(
                invoice.customer_id,
                Some(invoice_id),
                refund_amount,
                &invoice.currency,
                reason,
                &options,
            )
            .await?;

        record_refund_operation("created");
        self.events.publish(BillingEvent::RefundCreated {
            refund_id: refund.refund_id,
            invoice_id: Some(invoice_id),
            amount: refund.amount,
        });

        if let Some(gateway) = &self.gateway {
            match gateway
                .create_refund(&refund, invoice.processor_id.as_deref())
                .await
            {
                Ok(processor_refund_id) => {
                    self.db
                        .set_refund_processor_id(refund.refund_id, &processor_refund_id)
                        .await?;
                    return self.mark_succeeded(refund.refund_id).await;
                }
                Err(e) => {
                    warn!(error = %e, "Remote refund failed");
                    return self
                        .mark_failed(refund.refund_id, Some(e.to_string()))
                        .await;
                }
            }
        }

        Ok(refund)
    }

    /// Settle a refund: status, processed timestamp, and (when
    /// configured) the refund-typed customer credit, atomically.
    #[instrument(skip(self), fields(refund_id = %refund_id))]
    pub async fn mark_succeeded(&self, refund_id: Uuid) -> Result<Refund, AppError> {
        let (refund, credit) = self
            .db
            .mark_refund_succeeded(refund_id, self.config.refunds_create_credit, Utc::now())
            .await?;

        record_refund_operation("succeeded");
        self.events.publish(BillingEvent::RefundSucceeded {
            refund_id: refund.refund_id,
        });
        if let Some(credit) = credit {
            self.events.publish(BillingEvent::CreditAdded {
                credit_id: credit.credit_id,
                customer_id: credit.customer_id,
                amount: credit.amount,
            });
        }

        Ok(refund)
    }

    /// Record a refund failure. No ledger effect.
    #[instrument(skip(self), fields(refund_id = %refund_id))]
    pub async fn mark_failed(
        &self,
        refund_id: Uuid,
        reason: Option<String>,
    ) -> Result<Refund, AppError> {
        let refund = self
            .db
            .mark_refund_failed(refund_id, reason.as_deref(), Utc::now())
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Refund not found")))?;

        record_refund_operation("failed");
        self.events.publish(BillingEvent::RefundFailed {
            refund_id: refund.refund_id,
            reason,
        });

        Ok(refund)
    }

    /// Cancel a pending refund. Any other status is a state conflict.
    #[instrument(skip(self), fields(refund_id = %refund_id))]
    pub async fn cancel(&self, refund_id: Uuid) -> Result<Refund, AppError> {
        let existing = self
            .db
            .get_refund(refund_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Refund not found")))?;

        if !existing.is_pending() {
            return Err(AppError::Conflict(anyhow!(
                "Can only cancel pending refunds"
            )));
        }

        let refund = self
            .db
            .cancel_refund(refund_id, Utc::now())
            .await?
            .ok_or_else(|| {
                AppError::Conflict(anyhow!("Refund settled before it could be canceled"))
            })?;

        record_refund_operation("canceled");
        info!(refund_id = %refund.refund_id, "Refund canceled");

        Ok(refund)
    }

    /// Total succeeded refund amount for an invoice.
    pub async fn total_refunded(&self, invoice_id: Uuid) -> Result<Decimal, AppError> {
        self.db.sum_succeeded_refunds(invoice_id).await
    }

    /// What is still refundable on an invoice.
    pub async fn remaining_refundable(&self, invoice_id: Uuid) -> Result<Decimal, AppError> {
        let invoice = self
            .db
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Invoice not found")))?;
        let refunded = self.db.sum_succeeded_refunds(invoice_id).await?;
        Ok((invoice.total - refunded).max(Decimal::ZERO))
    }

    /// Whether the invoice has been refunded in full.
    pub async fn is_fully_refunded(&self, invoice_id: Uuid) -> Result<bool, AppError> {
        let invoice = self
            .db
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Invoice not found")))?;
        let refunded = self.db.sum_succeeded_refunds(invoice_id).await?;
        Ok(refunded >= invoice.total)
    }

    /// Whether the invoice has been refunded in part but not in full.
    pub async fn is_partially_refunded(&self, invoice_id: Uuid) -> Result<bool, AppError> {
        let invoice = self
            .db
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Invoice not found")))?;
        let refunded = self.db.sum_succeeded_refunds(invoice_id).await?;
        Ok(refunded > Decimal::ZERO && refunded < invoice.total)
    }
}
