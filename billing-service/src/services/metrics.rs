//! Metrics module for billing-service.
//! Provides Prometheus metrics for billing operations and monetary flows.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Subscription operations counter
pub static SUBSCRIPTION_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoice operations counter
pub static INVOICE_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Credit ledger operations counter
pub static CREDIT_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Refund operations counter
pub static REFUND_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Discount operations counter
pub static DISCOUNT_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Quota notifications counter
pub static QUOTA_NOTIFICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Sweep task results counter
pub static SWEEP_RESULTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoiced amount counter by currency (monetary tracking)
pub static INVOICE_AMOUNT_TOTAL: OnceLock<prometheus::CounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    SUBSCRIPTION_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_subscription_operations_total",
                "Total subscription operations by operation type"
            ),
            &["operation"]
        )
        .expect("Failed to register SUBSCRIPTION_OPERATIONS_TOTAL")
    });

    INVOICE_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_invoice_operations_total",
                "Total invoice operations by operation type"
            ),
            &["operation"]
        )
        .expect("Failed to register INVOICE_OPERATIONS_TOTAL")
    });

    CREDIT_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_credit_operations_total",
                "Total credit ledger operations by operation type"
            ),
            &["operation"]
        )
        .expect("Failed to register CREDIT_OPERATIONS_TOTAL")
    });

    REFUND_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_refund_operations_total",
                "Total refund operations by operation type"
            ),
            &["operation"]
        )
        .expect("Failed to register REFUND_OPERATIONS_TOTAL")
    });

    DISCOUNT_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_discount_operations_total",
                "Total discount operations by operation type"
            ),
            &["operation"]
        )
        .expect("Failed to register DISCOUNT_OPERATIONS_TOTAL")
    });

    QUOTA_NOTIFICATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_quota_notifications_total",
                "Total quota notifications by kind"
            ),
            &["kind"]
        )
        .expect("Failed to register QUOTA_NOTIFICATIONS_TOTAL")
    });

    SWEEP_RESULTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_sweep_results_total",
                "Total sweep task results by task and status"
            ),
            &["task", "status"]
        )
        .expect("Failed to register SWEEP_RESULTS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    INVOICE_AMOUNT_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            prometheus::opts!(
                "billing_invoice_amount_total",
                "Total invoiced amount by currency"
            ),
            &["currency"]
        )
        .expect("Failed to register INVOICE_AMOUNT_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a subscription operation.
pub fn record_subscription_operation(operation: &str) {
    if let Some(counter) = SUBSCRIPTION_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record an invoice operation.
pub fn record_invoice_operation(operation: &str) {
    if let Some(counter) = INVOICE_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record a credit ledger operation.
pub fn record_credit_operation(operation: &str) {
    if let Some(counter) = CREDIT_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record a refund operation.
pub fn record_refund_operation(operation: &str) {
    if let Some(counter) = REFUND_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record a discount operation.
pub fn record_discount_operation(operation: &str) {
    if let Some(counter) = DISCOUNT_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record a quota notification.
pub fn record_quota_notification(kind: &str) {
    if let Some(counter) = QUOTA_NOTIFICATIONS_TOTAL.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

/// Record a sweep task result.
pub fn record_sweep_result(task: &str, status: &str) {
    if let Some(counter) = SWEEP_RESULTS_TOTAL.get() {
        counter.with_label_values(&[task, status]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}

/// Record an invoiced amount for financial tracking.
pub fn record_invoice_amount(currency: &str, amount: f64) {
    if let Some(counter) = INVOICE_AMOUNT_TOTAL.get() {
        counter.with_label_values(&[currency]).inc_by(amount.abs());
    }
}
