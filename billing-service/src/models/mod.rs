//! Domain models for billing-service.

mod credit;
mod customer;
mod discount;
mod invoice;
mod plan;
mod quota;
mod refund;
mod subscription;

pub use credit::{credit_application_amount, CreditOptions, CreditType, CustomerCredit};
pub use customer::{BillableRef, CreateCustomer, Customer, PaymentMethod};
pub use discount::{
    stack_discounts, AppliedDiscount, CreateDiscount, Discount, DiscountAppliesTo,
    DiscountDuration, DiscountType,
};
pub use invoice::{
    calculate_totals, next_invoice_number, CreateInvoiceItem, DiscountLine, Invoice, InvoiceItem,
    InvoiceStatus, InvoiceTotals,
};
pub use plan::{
    BillingInterval, CancellationBehavior, ChangeBehavior, CreatePlan, Plan, PlanType,
};
pub use quota::{
    combine_limits, evaluate_thresholds, should_reset_warnings, QuotaNotification, QuotaUsage,
    ThresholdEvaluation,
};
pub use refund::{validate_refund_amount, Refund, RefundOptions, RefundReason, RefundStatus};
pub use subscription::{
    max_grace_period_days, preview_plan_change, CancellationOutcome, ChangePlanOptions,
    CreateSubscription, PlanChangePreview, PreviewPeriod, PreviewPlanSide, ProrationFigures,
    SubscribeOptions, Subscription, SubscriptionItem, SubscriptionStatus,
};
