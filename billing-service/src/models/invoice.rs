//! Invoice model and totals arithmetic.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Uncollectible => "uncollectible",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "open" => InvoiceStatus::Open,
            "paid" => InvoiceStatus::Paid,
            "void" => InvoiceStatus::Void,
            "uncollectible" => InvoiceStatus::Uncollectible,
            _ => InvoiceStatus::Draft,
        }
    }
}

/// Invoice. Totals are always derived from the item rows, never hand-set:
/// `total = max(0, subtotal - discount + tax)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub processor_id: Option<String>,
    pub invoice_number: String,
    pub status: String,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub due_date: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub voided_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn parsed_status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    pub fn is_draft(&self) -> bool {
        self.parsed_status() == InvoiceStatus::Draft
    }

    pub fn is_open(&self) -> bool {
        self.parsed_status() == InvoiceStatus::Open
    }

    pub fn is_paid(&self) -> bool {
        self.parsed_status() == InvoiceStatus::Paid
    }

    pub fn is_void(&self) -> bool {
        self.parsed_status() == InvoiceStatus::Void
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && self.due_date.is_some_and(|due| due < now)
    }
}

/// One invoice line. Discount lines carry negative amounts and
/// `is_discount = true`; proration lines are flagged `is_proration`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceItem {
    pub item_id: Uuid,
    pub invoice_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub discount_id: Option<Uuid>,
    pub description: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub is_discount: bool,
    pub is_proration: bool,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}

/// Input for adding an invoice line.
#[derive(Debug, Clone)]
pub struct CreateInvoiceItem {
    pub invoice_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub discount_id: Option<Uuid>,
    pub description: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub is_discount: bool,
    pub is_proration: bool,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl CreateInvoiceItem {
    /// A positive charge line.
    pub fn charge(invoice_id: Uuid, description: impl Into<String>, amount: Decimal) -> Self {
        Self {
            invoice_id,
            subscription_id: None,
            plan_id: None,
            discount_id: None,
            description: description.into(),
            quantity: 1,
            unit_price: amount,
            amount,
            is_discount: false,
            is_proration: false,
            period_start: None,
            period_end: None,
            metadata: None,
        }
    }

    /// A negative discount line.
    pub fn discount(invoice_id: Uuid, description: impl Into<String>, amount: Decimal) -> Self {
        Self {
            invoice_id,
            subscription_id: None,
            plan_id: None,
            discount_id: None,
            description: description.into(),
            quantity: 1,
            unit_price: -amount,
            amount: -amount,
            is_discount: true,
            is_proration: false,
            period_start: None,
            period_end: None,
            metadata: None,
        }
    }
}

/// One discount application to materialize as a negative invoice line.
/// Built by the invoice calculator from the subscription's active
/// discounts, in application order.
#[derive(Debug, Clone)]
pub struct DiscountLine {
    pub applied_discount_id: Uuid,
    pub discount_id: Uuid,
    pub description: String,
    /// Positive discount amount; stored negated on the line item.
    pub amount: Decimal,
    /// Expire the applied discount once its use counter reaches this
    /// value (`once` = 1, `repeating(N)` = N, `forever` = none).
    pub expires_after_uses: Option<i32>,
}

/// Derived invoice totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvoiceTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
}

/// Recompute totals from line items: subtotal is the sum of non-discount
/// amounts, discount is the absolute sum of discount-flagged amounts, and
/// the total never drops below zero.
pub fn calculate_totals(items: &[InvoiceItem], tax: Decimal) -> InvoiceTotals {
    let subtotal: Decimal = items
        .iter()
        .filter(|item| !item.is_discount)
        .map(|item| item.amount)
        .sum();

    let discount: Decimal = items
        .iter()
        .filter(|item| item.is_discount)
        .map(|item| item.amount)
        .sum::<Decimal>()
        .abs();

    InvoiceTotals {
        subtotal,
        discount,
        total: (subtotal - discount + tax).max(Decimal::ZERO),
    }
}

/// Next invoice number given the most recently issued one.
///
/// Numbers are `prefix` + integer; the next number is the parsed last
/// number plus one, floored at `starting_number`. Must be called under a
/// lock serializing concurrent creators.
pub fn next_invoice_number(last: Option<&str>, prefix: &str, starting_number: i64) -> String {
    let next = match last {
        None => starting_number,
        Some(number) => {
            let last_number = number
                .strip_prefix(prefix)
                .unwrap_or(number)
                .parse::<i64>()
                .unwrap_or(0);
            (last_number + 1).max(starting_number)
        }
    };

    format!("{}{}", prefix, next)
}
