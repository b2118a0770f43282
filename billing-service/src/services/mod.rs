//! Services module for billing-service.

pub mod credits;
pub mod database;
pub mod discounts;
pub mod events;
pub mod invoices;
pub mod lifecycle;
pub mod metrics;
pub mod payments;
pub mod quota;
pub mod refunds;
pub mod sweep;

pub use credits::CreditService;
pub use database::Database;
pub use discounts::DiscountService;
pub use events::{BillingEvent, EventSink, NullEventSink, RecordingEventSink};
pub use invoices::InvoiceService;
pub use lifecycle::SubscriptionService;
pub use metrics::{
    get_metrics, init_metrics, record_credit_operation, record_discount_operation, record_error,
    record_invoice_amount, record_invoice_operation, record_quota_notification,
    record_refund_operation, record_subscription_operation, record_sweep_result,
};
pub use payments::{PaymentGateway, RemoteSubscription, WebhookService};
pub use quota::QuotaService;
pub use refunds::RefundService;
pub use sweep::{BillingSweep, SweepFailure, SweepReport, SweepSection};
