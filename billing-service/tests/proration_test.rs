//! Plan-change proration preview tests. The preview is pure and must
//! not mutate anything, so it is exercised directly on the models.

mod common;

use billing_service::models::preview_plan_change;
use chrono::{Duration, Utc};
use common::{base_plan, subscription};
use rust_decimal::Decimal;

#[test]
fn mid_period_upgrade_splits_evenly() {
    // $10 plan, 15 days into a 30-day period, moving to $20.
    let now = Utc::now();
    let sub = subscription(now - Duration::days(15), now + Duration::days(15));
    let current = base_plan("Basic", Decimal::from(10));
    let target = base_plan("Premium", Decimal::from(20));

    let preview = preview_plan_change(&sub, &current, &target, now);

    assert_eq!(preview.proration.unused_amount, Decimal::new(500, 2));
    assert_eq!(preview.proration.charge_for_new, Decimal::new(1000, 2));
    assert_eq!(preview.proration.amount_due, Decimal::new(500, 2));
    assert!(preview.proration.is_upgrade);
    assert!(!preview.proration.is_downgrade);
    assert_eq!(preview.period.remaining_days, 15);
    assert_eq!(preview.current_plan.price, Decimal::from(10));
    assert_eq!(preview.new_plan.price, Decimal::from(20));
}

#[test]
fn downgrade_produces_a_negative_amount_due() {
    let now = Utc::now();
    let sub = subscription(now - Duration::days(15), now + Duration::days(15));
    let current = base_plan("Premium", Decimal::from(20));
    let target = base_plan("Basic", Decimal::from(10));

    let preview = preview_plan_change(&sub, &current, &target, now);

    assert_eq!(preview.proration.amount_due, Decimal::new(-500, 2));
    assert!(preview.proration.is_downgrade);
    assert!(!preview.proration.is_upgrade);
}

#[test]
fn lapsed_period_has_no_remaining_value() {
    let now = Utc::now();
    let sub = subscription(now - Duration::days(45), now - Duration::days(15));
    let current = base_plan("Basic", Decimal::from(10));
    let target = base_plan("Premium", Decimal::from(20));

    let preview = preview_plan_change(&sub, &current, &target, now);

    assert_eq!(preview.proration.unused_amount, Decimal::ZERO);
    assert_eq!(preview.proration.charge_for_new, Decimal::ZERO);
    assert_eq!(preview.proration.amount_due, Decimal::ZERO);
    assert_eq!(preview.period.remaining_days, 0);
}

#[test]
fn zero_length_period_prorates_to_zero() {
    let now = Utc::now();
    let sub = subscription(now, now);
    let current = base_plan("Basic", Decimal::from(10));
    let target = base_plan("Premium", Decimal::from(20));

    let preview = preview_plan_change(&sub, &current, &target, now);

    assert_eq!(preview.proration.unused_amount, Decimal::ZERO);
    assert_eq!(preview.proration.charge_for_new, Decimal::ZERO);
}

#[test]
fn preview_before_period_start_clamps_to_the_full_period() {
    let now = Utc::now();
    let sub = subscription(now + Duration::days(1), now + Duration::days(31));
    let current = base_plan("Basic", Decimal::from(10));
    let target = base_plan("Premium", Decimal::from(20));

    let preview = preview_plan_change(&sub, &current, &target, now);

    assert_eq!(preview.proration.unused_amount, Decimal::from(10));
    assert_eq!(preview.proration.charge_for_new, Decimal::from(20));
    assert_eq!(preview.proration.amount_due, Decimal::from(10));
}

#[test]
fn equal_prices_are_neither_upgrade_nor_downgrade() {
    let now = Utc::now();
    let sub = subscription(now - Duration::days(10), now + Duration::days(20));
    let current = base_plan("Monthly A", Decimal::from(15));
    let target = base_plan("Monthly B", Decimal::from(15));

    let preview = preview_plan_change(&sub, &current, &target, now);

    assert!(!preview.proration.is_upgrade);
    assert!(!preview.proration.is_downgrade);
    assert_eq!(preview.proration.amount_due, Decimal::ZERO);
}
