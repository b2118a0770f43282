//! Customer credit ledger model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Ledger entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditType {
    Refund,
    Promotional,
    ManualAdjustment,
    InvoicePayment,
    Other,
}

impl CreditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditType::Refund => "refund",
            CreditType::Promotional => "promotional",
            CreditType::ManualAdjustment => "manual_adjustment",
            CreditType::InvoicePayment => "invoice_payment",
            CreditType::Other => "other",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "refund" => CreditType::Refund,
            "promotional" => CreditType::Promotional,
            "invoice_payment" => CreditType::InvoicePayment,
            "other" => CreditType::Other,
            _ => CreditType::ManualAdjustment,
        }
    }
}

/// Signed ledger entry backing a customer's credit balance. Positive
/// amounts are credits, negative amounts debits. Append-only except for
/// the expiry flag.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CustomerCredit {
    pub credit_id: Uuid,
    pub customer_id: Uuid,
    pub credit_type: String,
    pub amount: Decimal,
    pub currency: String,
    /// Customer balance observed when this entry was appended.
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub invoice_id: Option<Uuid>,
    pub refund_id: Option<Uuid>,
    pub reference_kind: Option<String>,
    pub reference_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}

impl CustomerCredit {
    pub fn parsed_type(&self) -> CreditType {
        CreditType::from_string(&self.credit_type)
    }

    /// Not flagged expired and, if an expiry is set, still in the future.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.is_expired {
            return false;
        }
        !self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn is_credit(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn is_debit(&self) -> bool {
        self.amount < Decimal::ZERO
    }
}

/// Typed optional fields for ledger entries.
#[derive(Debug, Clone, Default)]
pub struct CreditOptions {
    pub invoice_id: Option<Uuid>,
    pub refund_id: Option<Uuid>,
    pub reference_kind: Option<String>,
    pub reference_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Amount of credit to apply to an invoice: the smaller of the available
/// balance and the invoice total, or zero when either is non-positive.
pub fn credit_application_amount(available_credit: Decimal, invoice_total: Decimal) -> Decimal {
    if available_credit <= Decimal::ZERO || invoice_total <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    available_credit.min(invoice_total)
}
