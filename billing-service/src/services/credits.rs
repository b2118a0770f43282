//! Credit ledger: append-only balance mutations over the customer's
//! signed credit entries.

use crate::models::{CreditOptions, CreditType, CustomerCredit};
use crate::services::events::{BillingEvent, EventSink};
use crate::services::metrics::record_credit_operation;
use crate::services::Database;
use anyhow::anyhow;
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::config::BillingConfig;

/// Credit ledger orchestration.
#[derive(Clone)]
pub struct CreditService {
    db: Database,
    config: BillingConfig,
    events: Arc<dyn EventSink>,
}

impl CreditService {
    pub fn new(db: Database, config: BillingConfig, events: Arc<dyn EventSink>) -> Self {
        Self { db, config, events }
    }

    /// Append a credit (or, with a negative amount, a debit) to the
    /// customer's ledger. Balance snapshots and the cached customer
    /// balance land in the same transaction as the entry itself.
    #[instrument(skip(self, options), fields(customer_id = %customer_id))]
    pub async fn add_credit(
        &self,
        customer_id: Uuid,
        amount: Decimal,
        credit_type: CreditType,
        description: Option<&str>,
        options: CreditOptions,
    ) -> Result<CustomerCredit, AppError> {
        let credit = self
            .db
            .add_credit(
                customer_id,
                amount,
                credit_type,
                &self.config.currency,
                description,
                &options,
                Utc::now(),
            )
            .await?;

        record_credit_operation("added");
        self.events.publish(BillingEvent::CreditAdded {
            credit_id: credit.credit_id,
            customer_id,
            amount: credit.amount,
        });

        Ok(credit)
    }

    /// Debit the customer's ledger. Same primitive as `add_credit` with
    /// the amount negated; defaults to the `invoice_payment` type.
    #[instrument(skip(self, options), fields(customer_id = %customer_id))]
    pub async fn deduct_credit(
        &self,
        customer_id: Uuid,
        amount: Decimal,
        description: Option<&str>,
        options: CreditOptions,
    ) -> Result<CustomerCredit, AppError> {
        self.add_credit(
            customer_id,
            -amount,
            CreditType::InvoicePayment,
            description,
            options,
        )
        .await
    }

    /// Apply available credit to an invoice. Returns the amount applied;
    /// zero when the customer has no credit or the invoice owes nothing.
    #[instrument(skip(self), fields(customer_id = %customer_id, invoice_id = %invoice_id))]
    pub async fn apply_credits_to_invoice(
        &self,
        customer_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Decimal, AppError> {
        let (amount, credit, _invoice) = self
            .db
            .apply_credits_to_invoice(customer_id, invoice_id, Utc::now())
            .await?;

        if let Some(credit) = credit {
            record_credit_operation("applied_to_invoice");
            self.events.publish(BillingEvent::CreditApplied {
                credit_id: credit.credit_id,
                invoice_id,
                amount,
            });
        }

        Ok(amount)
    }

    /// The customer's usable credit balance. Lapsed entries are flagged
    /// expired (and the cached balance recomputed) before reading.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn available_credit(&self, customer_id: Uuid) -> Result<Decimal, AppError> {
        self.expire_due_credits(customer_id).await?;

        let customer = self
            .db
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Customer not found")))?;

        Ok(customer.credit_balance)
    }

    /// Flag lapsed credits as expired; returns how many were flagged.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn expire_due_credits(&self, customer_id: Uuid) -> Result<u64, AppError> {
        let expired = self.db.expire_due_credits(customer_id, Utc::now()).await?;
        if expired > 0 {
            record_credit_operation("expired");
        }
        Ok(expired)
    }

    /// Full ledger history for a customer, newest first.
    pub async fn ledger(&self, customer_id: Uuid) -> Result<Vec<CustomerCredit>, AppError> {
        self.db.list_credits(customer_id).await
    }
}
