//! Credit ledger tests: activity, sign predicates, and application
//! amounts.

mod common;

use billing_service::models::credit_application_amount;
use chrono::{Duration, Utc};
use common::credit_entry;
use rust_decimal::Decimal;
use uuid::Uuid;

#[test]
fn application_amount_is_capped_by_both_sides() {
    // $50 of credit against a $100 invoice applies exactly $50.
    assert_eq!(
        credit_application_amount(Decimal::from(50), Decimal::from(100)),
        Decimal::from(50)
    );
    assert_eq!(
        credit_application_amount(Decimal::from(150), Decimal::from(100)),
        Decimal::from(100)
    );
}

#[test]
fn nothing_applies_when_either_side_is_nonpositive() {
    assert_eq!(
        credit_application_amount(Decimal::ZERO, Decimal::from(100)),
        Decimal::ZERO
    );
    assert_eq!(
        credit_application_amount(Decimal::from(50), Decimal::ZERO),
        Decimal::ZERO
    );
    assert_eq!(
        credit_application_amount(Decimal::from(-10), Decimal::from(100)),
        Decimal::ZERO
    );
    assert_eq!(
        credit_application_amount(Decimal::from(50), Decimal::from(-1)),
        Decimal::ZERO
    );
}

#[test]
fn activity_tracks_the_expiry_flag_and_timestamp() {
    let now = Utc::now();
    let mut credit = credit_entry(Uuid::new_v4(), Decimal::from(25));

    assert!(credit.is_active(now));

    credit.expires_at = Some(now + Duration::days(1));
    assert!(credit.is_active(now));

    credit.expires_at = Some(now - Duration::hours(1));
    assert!(!credit.is_active(now));

    credit.expires_at = None;
    credit.is_expired = true;
    assert!(!credit.is_active(now));
}

#[test]
fn sign_determines_credit_or_debit() {
    let credit = credit_entry(Uuid::new_v4(), Decimal::from(25));
    assert!(credit.is_credit());
    assert!(!credit.is_debit());

    let debit = credit_entry(Uuid::new_v4(), Decimal::from(-25));
    assert!(debit.is_debit());
    assert!(!debit.is_credit());

    let zero = credit_entry(Uuid::new_v4(), Decimal::ZERO);
    assert!(!zero.is_credit());
    assert!(!zero.is_debit());
}

#[test]
fn balance_snapshots_chain_through_the_ledger() {
    // balance_after of each entry equals balance_before plus its amount;
    // the running balance is the sum of active entries.
    let customer_id = Uuid::new_v4();
    let amounts = [Decimal::from(50), Decimal::from(-20), Decimal::from(5)];

    let mut balance = Decimal::ZERO;
    for amount in amounts {
        let mut entry = credit_entry(customer_id, amount);
        entry.balance_before = balance;
        entry.balance_after = balance + amount;
        assert_eq!(entry.balance_after - entry.balance_before, amount);
        balance = entry.balance_after;
    }

    assert_eq!(balance, Decimal::from(35));
}
