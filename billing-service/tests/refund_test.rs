//! Refund accounting tests: remaining-refundable validation and status
//! predicates.

mod common;

use billing_service::models::{validate_refund_amount, RefundReason, RefundStatus};
use rust_decimal::Decimal;
use service_core::error::AppError;

#[test]
fn refund_within_the_remaining_amount_is_accepted() {
    assert!(validate_refund_amount(Decimal::from(100), Decimal::ZERO, Decimal::from(100)).is_ok());
    assert!(validate_refund_amount(Decimal::from(100), Decimal::from(60), Decimal::from(40)).is_ok());
}

#[test]
fn refund_exceeding_the_remaining_amount_is_rejected() {
    // total=100, 60 already refunded: 50 more must be rejected.
    let result = validate_refund_amount(Decimal::from(100), Decimal::from(60), Decimal::from(50));
    assert!(matches!(result, Err(AppError::BadRequest(_))));

    let over_total =
        validate_refund_amount(Decimal::from(100), Decimal::ZERO, Decimal::from(101));
    assert!(matches!(over_total, Err(AppError::BadRequest(_))));
}

#[test]
fn fully_refunded_invoices_accept_nothing_more() {
    let result =
        validate_refund_amount(Decimal::from(100), Decimal::from(100), Decimal::new(1, 2));
    assert!(matches!(result, Err(AppError::BadRequest(_))));
    // A zero refund of a fully refunded invoice is still within bounds.
    assert!(validate_refund_amount(Decimal::from(100), Decimal::from(100), Decimal::ZERO).is_ok());
}

#[test]
fn status_strings_round_trip() {
    for status in [
        RefundStatus::Pending,
        RefundStatus::Succeeded,
        RefundStatus::Failed,
        RefundStatus::Canceled,
    ] {
        assert_eq!(RefundStatus::from_string(status.as_str()), status);
    }
    assert_eq!(RefundStatus::from_string("unknown"), RefundStatus::Pending);
}

#[test]
fn reason_strings_round_trip() {
    for reason in [
        RefundReason::Duplicate,
        RefundReason::Fraudulent,
        RefundReason::RequestedByCustomer,
        RefundReason::Other,
    ] {
        assert_eq!(RefundReason::from_string(reason.as_str()), reason);
    }
    assert_eq!(
        RefundReason::from_string("unknown"),
        RefundReason::RequestedByCustomer
    );
}
