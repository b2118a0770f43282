//! Refund model.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

/// Refund status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Succeeded => "succeeded",
            RefundStatus::Failed => "failed",
            RefundStatus::Canceled => "canceled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "succeeded" => RefundStatus::Succeeded,
            "failed" => RefundStatus::Failed,
            "canceled" => RefundStatus::Canceled,
            _ => RefundStatus::Pending,
        }
    }
}

/// Refund reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    Duplicate,
    Fraudulent,
    RequestedByCustomer,
    Other,
}

impl RefundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundReason::Duplicate => "duplicate",
            RefundReason::Fraudulent => "fraudulent",
            RefundReason::RequestedByCustomer => "requested_by_customer",
            RefundReason::Other => "other",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "duplicate" => RefundReason::Duplicate,
            "fraudulent" => RefundReason::Fraudulent,
            "other" => RefundReason::Other,
            _ => RefundReason::RequestedByCustomer,
        }
    }
}

/// Refund of (part of) a paid invoice.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Refund {
    pub refund_id: Uuid,
    pub customer_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub processor_refund_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub reason: String,
    pub description: Option<String>,
    pub failure_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Refund {
    pub fn parsed_status(&self) -> RefundStatus {
        RefundStatus::from_string(&self.status)
    }

    pub fn is_pending(&self) -> bool {
        self.parsed_status() == RefundStatus::Pending
    }

    pub fn is_succeeded(&self) -> bool {
        self.parsed_status() == RefundStatus::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        self.parsed_status() == RefundStatus::Failed
    }

    pub fn is_canceled(&self) -> bool {
        self.parsed_status() == RefundStatus::Canceled
    }

    pub fn has_processor_id(&self) -> bool {
        self.processor_refund_id.is_some()
    }
}

/// Typed optional fields for refund creation.
#[derive(Debug, Clone, Default)]
pub struct RefundOptions {
    pub description: Option<String>,
    pub notes: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Validate a requested refund amount against what is still refundable:
/// the invoice total minus all previously succeeded refunds.
pub fn validate_refund_amount(
    invoice_total: Decimal,
    already_refunded: Decimal,
    requested: Decimal,
) -> Result<(), AppError> {
    let remaining = invoice_total - already_refunded;
    if requested > remaining {
        return Err(AppError::BadRequest(anyhow!(
            "Refund amount ({}) exceeds remaining refundable amount ({})",
            requested,
            remaining
        )));
    }
    Ok(())
}
