//! Invoice calculator: line items, derived totals, numbering, and
//! discount line materialization.

use crate::config::BillingConfig;
use crate::models::{
    AppliedDiscount, CreateInvoiceItem, Discount, DiscountDuration, DiscountLine, Invoice,
    InvoiceItem, InvoiceStatus,
};
use crate::services::discounts::DiscountService;
use crate::services::events::{BillingEvent, EventSink};
use crate::services::metrics::{record_invoice_amount, record_invoice_operation};
use crate::services::Database;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Invoice orchestration.
#[derive(Clone)]
pub struct InvoiceService {
    db: Database,
    config: BillingConfig,
    discounts: DiscountService,
    events: Arc<dyn EventSink>,
}

impl InvoiceService {
    pub fn new(
        db: Database,
        config: BillingConfig,
        discounts: DiscountService,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            db,
            config,
            discounts,
            events,
        }
    }

    /// Create an empty draft invoice with the next sequential number.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn create_invoice(
        &self,
        customer_id: Uuid,
        subscription_id: Option<Uuid>,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<Invoice, AppError> {
        let invoice = self
            .db
            .create_invoice(
                customer_id,
                subscription_id,
                &self.config.currency,
                due_date,
                &self.config.invoice_number_prefix,
                self.config.invoice_starting_number,
            )
            .await?;

        record_invoice_operation("created");
        self.events.publish(BillingEvent::InvoiceCreated {
            invoice_id: invoice.invoice_id,
            customer_id,
        });

        Ok(invoice)
    }

    /// Add a line item; totals are recomputed in the same transaction.
    #[instrument(skip(self, input), fields(invoice_id = %input.invoice_id))]
    pub async fn add_item(
        &self,
        input: CreateInvoiceItem,
    ) -> Result<(InvoiceItem, Invoice), AppError> {
        let (item, invoice) = self.db.add_invoice_item(&input).await?;
        record_invoice_operation("item_added");
        Ok((item, invoice))
    }

    /// Materialize one charge line per live subscription item for the
    /// subscription's current period.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, subscription_id = %subscription_id))]
    pub async fn add_subscription_items(
        &self,
        invoice_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Vec<InvoiceItem>, AppError> {
        let now = Utc::now();

        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        let mut added = Vec::new();
        for item in self.db.get_subscription_items(subscription_id).await? {
            if item.has_ended(now) {
                continue;
            }
            let Some(plan) = self.db.get_plan(item.plan_id).await? else {
                continue;
            };

            let amount = plan.price * Decimal::from(item.quantity);
            let input = CreateInvoiceItem {
                invoice_id,
                subscription_id: Some(subscription_id),
                plan_id: Some(plan.plan_id),
                discount_id: None,
                description: plan.name.clone(),
                quantity: item.quantity,
                unit_price: plan.price,
                amount,
                is_discount: false,
                is_proration: false,
                period_start: Some(subscription.current_period_start),
                period_end: Some(subscription.current_period_end),
                metadata: None,
            };
            let (line, _) = self.db.add_invoice_item(&input).await?;
            added.push(line);
        }

        Ok(added)
    }

    /// Emit one negative line per active discount, each computed against
    /// the base amount remaining after the discounts before it, and apply
    /// the expiration-after-use policy.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, subscription_id = %subscription_id))]
    pub async fn add_discount_items(
        &self,
        invoice_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Vec<InvoiceItem>, AppError> {
        let invoice = self
            .db
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Invoice not found")))?;

        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        let pairs = self.discounts.active_discount_pairs(subscription_id).await?;

        let base_amount: Decimal = self
            .db
            .get_invoice_items(invoice_id)
            .await?
            .iter()
            .filter(|item| !item.is_discount && item.subscription_id == Some(subscription_id))
            .map(|item| item.amount)
            .sum();

        let lines = build_discount_lines(&pairs, base_amount, Some(&invoice.currency));
        if lines.is_empty() {
            return Ok(Vec::new());
        }

        let (items, _invoice) = self
            .db
            .insert_discount_items(
                invoice_id,
                subscription_id,
                &lines,
                subscription.current_period_start,
                subscription.current_period_end,
                Utc::now(),
            )
            .await?;

        record_invoice_operation("discounts_added");

        Ok(items)
    }

    /// Move a draft invoice to open.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn open_invoice(
        &self,
        invoice_id: Uuid,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<Invoice, AppError> {
        match self.db.get_invoice(invoice_id).await? {
            Some(inv) if inv.parsed_status() == InvoiceStatus::Draft => {}
            Some(_) => {
                return Err(AppError::BadRequest(anyhow!(
                    "Only draft invoices can be opened"
                )))
            }
            None => return Err(AppError::NotFound(anyhow!("Invoice not found"))),
        }

        let invoice = self
            .db
            .open_invoice(invoice_id, due_date)
            .await?
            .ok_or_else(|| AppError::Conflict(anyhow!("Invoice is no longer a draft")))?;

        record_invoice_operation("opened");
        if let Some(total) = invoice.total.to_f64() {
            record_invoice_amount(&invoice.currency, total);
        }
        info!(invoice_number = %invoice.invoice_number, total = %invoice.total, "Invoice opened");

        Ok(invoice)
    }

    /// Mark an invoice paid. Idempotent: an already-paid invoice is
    /// returned untouched, keeping its original `paid_at`.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn mark_paid(&self, invoice_id: Uuid) -> Result<Invoice, AppError> {
        let invoice = self
            .db
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Invoice not found")))?;

        if invoice.is_paid() {
            return Ok(invoice);
        }

        let invoice = self
            .db
            .mark_invoice_paid(invoice_id, Utc::now())
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Invoice not found")))?;

        record_invoice_operation("paid");

        Ok(invoice)
    }

    /// Void an invoice. Paid invoices cannot be voided.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn void_invoice(&self, invoice_id: Uuid) -> Result<Invoice, AppError> {
        match self.db.get_invoice(invoice_id).await? {
            Some(inv) if inv.is_paid() => {
                return Err(AppError::BadRequest(anyhow!(
                    "Paid invoices cannot be voided"
                )))
            }
            Some(inv) if inv.is_void() => return Ok(inv),
            Some(_) => {}
            None => return Err(AppError::NotFound(anyhow!("Invoice not found"))),
        }

        let invoice = self
            .db
            .void_invoice(invoice_id, Utc::now())
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Invoice not found")))?;

        record_invoice_operation("voided");

        Ok(invoice)
    }

    /// Recompute an invoice's totals from its line items.
    pub async fn recalculate_totals(&self, invoice_id: Uuid) -> Result<Invoice, AppError> {
        self.db.recalculate_invoice_totals(invoice_id).await
    }

    /// Bill a subscription's current period: draft invoice, one charge
    /// line per item, then discount lines.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn materialize_period_invoice(
        &self,
        subscription_id: Uuid,
    ) -> Result<Invoice, AppError> {
        let subscription = self
            .db
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Subscription not found")))?;

        let invoice = self
            .create_invoice(subscription.customer_id, Some(subscription_id), None)
            .await?;
        self.add_subscription_items(invoice.invoice_id, subscription_id)
            .await?;
        self.add_discount_items(invoice.invoice_id, subscription_id)
            .await?;

        self.db.recalculate_invoice_totals(invoice.invoice_id).await
    }
}

/// Build the discount lines for one invoice application: each active
/// discount computes against what remains of `base_amount` after the
/// discounts applied before it, stopping once nothing remains. Returns
/// nothing when the base amount is non-positive.
pub fn build_discount_lines(
    pairs: &[(AppliedDiscount, Discount)],
    base_amount: Decimal,
    currency: Option<&str>,
) -> Vec<DiscountLine> {
    if base_amount <= Decimal::ZERO {
        return Vec::new();
    }

    let mut lines = Vec::new();
    let mut remaining = base_amount;

    for (applied, discount) in pairs {
        if remaining <= Decimal::ZERO {
            break;
        }

        let amount = discount.calculate_discount(remaining, currency);
        if amount > Decimal::ZERO {
            lines.push(DiscountLine {
                applied_discount_id: applied.applied_discount_id,
                discount_id: discount.discount_id,
                description: format!("{} ({})", discount.name, discount.format_value()),
                amount,
                expires_after_uses: match discount.parsed_duration() {
                    DiscountDuration::Once => Some(1),
                    DiscountDuration::Repeating => discount.duration_in_months,
                    DiscountDuration::Forever => None,
                },
            });
            remaining -= amount;
        }
    }

    lines
}
