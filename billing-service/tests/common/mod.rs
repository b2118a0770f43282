//! Test helper module for billing-service tests.
//!
//! Builders for domain models so the pure billing logic can be exercised
//! without a database.

#![allow(dead_code)]

use billing_service::models::{
    AppliedDiscount, CustomerCredit, Discount, Invoice, InvoiceItem, Plan, Subscription,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

pub fn base_plan(name: &str, price: Decimal) -> Plan {
    let now = Utc::now();
    Plan {
        plan_id: Uuid::new_v4(),
        name: name.to_string(),
        slug: name.to_lowercase().replace(' ', "-"),
        description: None,
        processor_product_id: None,
        processor_price_id: None,
        price,
        currency: "usd".to_string(),
        billing_interval: "monthly".to_string(),
        interval_count: 1,
        plan_type: "plan".to_string(),
        requires_plan: false,
        is_active: true,
        trial_period_days: 0,
        grace_period_days: 0,
        cancellation_behavior: "end_of_period".to_string(),
        change_behavior: "immediate".to_string(),
        prorate_changes: true,
        prorate_cancellations: false,
        features: None,
        limits: None,
        metadata: None,
        sort_order: 0,
        created_utc: now,
        updated_utc: now,
    }
}

pub fn addon_plan(name: &str, price: Decimal) -> Plan {
    let mut plan = base_plan(name, price);
    plan.plan_type = "addon".to_string();
    plan.requires_plan = true;
    plan
}

pub fn subscription(
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Subscription {
    let now = Utc::now();
    Subscription {
        subscription_id: Uuid::new_v4(),
        customer_id: Uuid::new_v4(),
        processor_id: None,
        processor_status: None,
        status: "active".to_string(),
        trial_ends_at: None,
        current_period_start: period_start,
        current_period_end: period_end,
        canceled_at: None,
        ends_at: None,
        previous_plan_id: None,
        scheduled_plan_id: None,
        plan_changed_at: None,
        plan_change_scheduled_for: None,
        failed_payment_count: 0,
        last_failed_payment_at: None,
        metadata: None,
        created_utc: now,
        updated_utc: now,
    }
}

pub fn monthly_subscription() -> Subscription {
    let now = Utc::now();
    subscription(now - Duration::days(15), now + Duration::days(15))
}

pub fn percentage_discount(name: &str, value: Decimal) -> Discount {
    let now = Utc::now();
    Discount {
        discount_id: Uuid::new_v4(),
        code: Some(name.to_uppercase()),
        name: name.to_string(),
        description: None,
        processor_coupon_id: None,
        processor_promotion_code_id: None,
        discount_type: "percentage".to_string(),
        value,
        currency: None,
        applies_to: "all".to_string(),
        applicable_plan_ids: None,
        duration: "forever".to_string(),
        duration_in_months: None,
        max_redemptions: None,
        redemptions_count: 0,
        starts_at: None,
        expires_at: None,
        is_active: true,
        created_utc: now,
        updated_utc: now,
    }
}

pub fn fixed_discount(name: &str, value: Decimal, currency: Option<&str>) -> Discount {
    let mut discount = percentage_discount(name, value);
    discount.discount_type = "fixed".to_string();
    discount.currency = currency.map(str::to_string);
    discount
}

pub fn applied(discount: &Discount, subscription_id: Uuid) -> AppliedDiscount {
    let now = Utc::now();
    AppliedDiscount {
        applied_discount_id: Uuid::new_v4(),
        subscription_id,
        discount_id: discount.discount_id,
        applied_at: now,
        expires_at: None,
        total_uses: 0,
        created_utc: now,
        updated_utc: now,
    }
}

pub fn invoice(subtotal: Decimal, total: Decimal) -> Invoice {
    let now = Utc::now();
    Invoice {
        invoice_id: Uuid::new_v4(),
        customer_id: Uuid::new_v4(),
        subscription_id: None,
        processor_id: None,
        invoice_number: "INV-1000".to_string(),
        status: "open".to_string(),
        subtotal,
        discount: Decimal::ZERO,
        tax: Decimal::ZERO,
        total,
        currency: "usd".to_string(),
        due_date: None,
        paid_at: None,
        voided_at: None,
        notes: None,
        metadata: None,
        created_utc: now,
        updated_utc: now,
    }
}

pub fn charge_item(invoice_id: Uuid, amount: Decimal) -> InvoiceItem {
    InvoiceItem {
        item_id: Uuid::new_v4(),
        invoice_id,
        subscription_id: None,
        plan_id: None,
        discount_id: None,
        description: "Charge".to_string(),
        quantity: 1,
        unit_price: amount,
        amount,
        is_discount: false,
        is_proration: false,
        period_start: None,
        period_end: None,
        metadata: None,
        created_utc: Utc::now(),
    }
}

pub fn discount_item(invoice_id: Uuid, amount: Decimal) -> InvoiceItem {
    let mut item = charge_item(invoice_id, -amount);
    item.description = "Discount".to_string();
    item.is_discount = true;
    item
}

pub fn credit_entry(customer_id: Uuid, amount: Decimal) -> CustomerCredit {
    CustomerCredit {
        credit_id: Uuid::new_v4(),
        customer_id,
        credit_type: "manual_adjustment".to_string(),
        amount,
        currency: "usd".to_string(),
        balance_before: Decimal::ZERO,
        balance_after: amount,
        description: None,
        notes: None,
        invoice_id: None,
        refund_id: None,
        reference_kind: None,
        reference_id: None,
        expires_at: None,
        is_expired: false,
        metadata: None,
        created_utc: Utc::now(),
    }
}
