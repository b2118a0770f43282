//! Domain events and the event sink seam.
//!
//! Events are published to an injected sink rather than a global
//! dispatcher, keeping side effects explicit and testable. Notification
//! collaborators subscribe by providing their own `EventSink`.

use crate::models::BillableRef;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Mutex;
use uuid::Uuid;

/// Domain event emitted by the billing services.
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    SubscriptionCreated {
        subscription_id: Uuid,
        customer_id: Uuid,
    },
    SubscriptionCanceled {
        subscription_id: Uuid,
        immediately: bool,
    },
    SubscriptionResumed {
        subscription_id: Uuid,
    },
    PlanChanged {
        subscription_id: Uuid,
        previous_plan_id: Uuid,
        new_plan_id: Uuid,
        prorated: bool,
    },
    PlanChangeScheduled {
        subscription_id: Uuid,
        new_plan_id: Uuid,
        scheduled_for: DateTime<Utc>,
    },
    InvoiceCreated {
        invoice_id: Uuid,
        customer_id: Uuid,
    },
    PaymentSucceeded {
        invoice_id: Uuid,
    },
    PaymentFailed {
        subscription_id: Uuid,
        failure_message: Option<String>,
    },
    CreditAdded {
        credit_id: Uuid,
        customer_id: Uuid,
        amount: Decimal,
    },
    CreditApplied {
        credit_id: Uuid,
        invoice_id: Uuid,
        amount: Decimal,
    },
    RefundCreated {
        refund_id: Uuid,
        invoice_id: Option<Uuid>,
        amount: Decimal,
    },
    RefundSucceeded {
        refund_id: Uuid,
    },
    RefundFailed {
        refund_id: Uuid,
        reason: Option<String>,
    },
    QuotaWarning {
        billable: BillableRef,
        quota_key: String,
        current_usage: f64,
        limit: f64,
        threshold: u32,
    },
    QuotaExceeded {
        billable: BillableRef,
        quota_key: String,
        current_usage: f64,
        limit: f64,
        overage: f64,
    },
}

/// Outbound event seam.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: BillingEvent);
}

/// Sink that drops every event. Default when the consumer wires nothing.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _event: BillingEvent) {}
}

/// Sink that buffers events in memory; used by tests to assert on what
/// was published.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<BillingEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BillingEvent> {
        self.events.lock().expect("event sink poisoned").clone()
    }

    pub fn take(&self) -> Vec<BillingEvent> {
        std::mem::take(&mut *self.events.lock().expect("event sink poisoned"))
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&self, event: BillingEvent) {
        self.events.lock().expect("event sink poisoned").push(event);
    }
}
