//! Invoice calculator tests: totals, numbering, and discount lines.

mod common;

use billing_service::models::{calculate_totals, next_invoice_number, CreateInvoiceItem};
use billing_service::services::invoices::build_discount_lines;
use chrono::{Duration, Utc};
use common::{
    applied, charge_item, discount_item, fixed_discount, invoice, monthly_subscription,
    percentage_discount,
};
use rust_decimal::Decimal;
use uuid::Uuid;

#[test]
fn totals_derive_from_items() {
    let invoice_id = Uuid::new_v4();
    let items = vec![
        charge_item(invoice_id, Decimal::from(100)),
        discount_item(invoice_id, Decimal::new(1450, 2)),
    ];

    let totals = calculate_totals(&items, Decimal::from(5));

    assert_eq!(totals.subtotal, Decimal::from(100));
    assert_eq!(totals.discount, Decimal::new(1450, 2));
    assert_eq!(totals.total, Decimal::new(9050, 2));
}

#[test]
fn total_never_drops_below_zero() {
    let invoice_id = Uuid::new_v4();
    let items = vec![
        charge_item(invoice_id, Decimal::from(20)),
        discount_item(invoice_id, Decimal::from(50)),
    ];

    let totals = calculate_totals(&items, Decimal::ZERO);

    assert_eq!(totals.subtotal, Decimal::from(20));
    assert_eq!(totals.discount, Decimal::from(50));
    assert_eq!(totals.total, Decimal::ZERO);
}

#[test]
fn empty_invoice_totals_are_zero() {
    let totals = calculate_totals(&[], Decimal::ZERO);
    assert_eq!(totals.subtotal, Decimal::ZERO);
    assert_eq!(totals.discount, Decimal::ZERO);
    assert_eq!(totals.total, Decimal::ZERO);
}

#[test]
fn invoice_numbers_increase_from_the_last_issued() {
    assert_eq!(next_invoice_number(None, "INV-", 1000), "INV-1000");
    assert_eq!(next_invoice_number(Some("INV-1042"), "INV-", 1000), "INV-1043");
    // The configured floor wins over small historical numbers.
    assert_eq!(next_invoice_number(Some("INV-7"), "INV-", 1000), "INV-1000");
    // Unparseable history falls back to the floor.
    assert_eq!(next_invoice_number(Some("XYZ-20"), "INV-", 1000), "INV-1000");
}

#[test]
fn discount_lines_apply_in_order_against_the_remaining_base() {
    let sub = monthly_subscription();
    let a = percentage_discount("a", Decimal::from(10));
    let b = percentage_discount("b", Decimal::from(5));
    let pairs = vec![
        (applied(&a, sub.subscription_id), a.clone()),
        (applied(&b, sub.subscription_id), b.clone()),
    ];

    let lines = build_discount_lines(&pairs, Decimal::from(100), Some("usd"));

    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].amount, Decimal::from(10));
    assert_eq!(lines[1].amount, Decimal::new(450, 2));
    assert_eq!(lines[0].discount_id, a.discount_id);
    assert_eq!(lines[1].discount_id, b.discount_id);
}

#[test]
fn discount_lines_stop_at_zero_and_skip_nonpositive_bases() {
    let sub = monthly_subscription();
    let a = fixed_discount("a", Decimal::from(100), None);
    let b = percentage_discount("b", Decimal::from(10));
    let pairs = vec![
        (applied(&a, sub.subscription_id), a),
        (applied(&b, sub.subscription_id), b),
    ];

    let lines = build_discount_lines(&pairs, Decimal::from(100), None);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].amount, Decimal::from(100));

    assert!(build_discount_lines(&pairs, Decimal::ZERO, None).is_empty());
    assert!(build_discount_lines(&pairs, Decimal::from(-5), None).is_empty());
}

#[test]
fn discount_lines_carry_the_expiration_policy() {
    let sub = monthly_subscription();

    let mut once = percentage_discount("once", Decimal::from(10));
    once.duration = "once".to_string();
    let mut repeating = percentage_discount("rep", Decimal::from(5));
    repeating.duration = "repeating".to_string();
    repeating.duration_in_months = Some(6);
    let forever = percentage_discount("forever", Decimal::from(5));

    let pairs = vec![
        (applied(&once, sub.subscription_id), once),
        (applied(&repeating, sub.subscription_id), repeating),
        (applied(&forever, sub.subscription_id), forever),
    ];

    let lines = build_discount_lines(&pairs, Decimal::from(100), None);

    assert_eq!(lines[0].expires_after_uses, Some(1));
    assert_eq!(lines[1].expires_after_uses, Some(6));
    assert_eq!(lines[2].expires_after_uses, None);
}

#[test]
fn discount_item_constructor_negates_the_amount() {
    let item = CreateInvoiceItem::discount(Uuid::new_v4(), "Account Credit", Decimal::from(50));
    assert_eq!(item.amount, Decimal::from(-50));
    assert_eq!(item.unit_price, Decimal::from(-50));
    assert!(item.is_discount);
}

#[test]
fn overdue_requires_open_status_and_a_past_due_date() {
    let now = Utc::now();
    let mut inv = invoice(Decimal::from(100), Decimal::from(100));

    assert!(!inv.is_overdue(now));

    inv.due_date = Some(now - Duration::days(1));
    assert!(inv.is_overdue(now));

    inv.status = "paid".to_string();
    assert!(!inv.is_overdue(now));
}
