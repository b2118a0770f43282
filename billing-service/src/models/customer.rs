//! Customer model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// Tagged reference to the external principal that owns billing state.
///
/// Any principal type can be billable; the pair replaces a true
/// polymorphic foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillableRef {
    pub kind: String,
    pub id: Uuid,
}

impl BillableRef {
    pub fn new(kind: impl Into<String>, id: Uuid) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }
}

impl std::fmt::Display for BillableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Billing customer: the identity anchor for a billable principal.
///
/// `credit_balance` is a cached derivation of the customer's active
/// (non-expired) credit ledger rows and is recomputed transactionally
/// whenever a ledger row is added or expires.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub customer_id: Uuid,
    pub billable_kind: String,
    pub billable_id: Uuid,
    pub processor_id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub credit_balance: Decimal,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Customer {
    pub fn billable(&self) -> BillableRef {
        BillableRef::new(self.billable_kind.clone(), self.billable_id)
    }

    pub fn has_processor_id(&self) -> bool {
        self.processor_id.is_some()
    }

    pub fn available_credit(&self) -> Decimal {
        self.credit_balance
    }
}

/// Input for creating (or looking up) a customer.
#[derive(Debug, Clone, Validate)]
pub struct CreateCustomer {
    pub billable: BillableRef,
    #[validate(email)]
    pub email: Option<String>,
    pub name: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl CreateCustomer {
    pub fn for_billable(billable: BillableRef) -> Self {
        Self {
            billable,
            email: None,
            name: None,
            metadata: None,
        }
    }
}

/// Stored payment method reference.
///
/// The processor holds the actual instrument; locally only enough is kept
/// to answer "does this customer have a way to pay" and to render a label.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentMethod {
    pub payment_method_id: Uuid,
    pub customer_id: Uuid,
    pub processor_id: String,
    pub method_type: String,
    pub brand: Option<String>,
    pub last_four: Option<String>,
    pub is_default: bool,
    pub created_utc: DateTime<Utc>,
}
