//! Subscription lifecycle tests: status predicates, cancellation
//! resolution, grace periods, and period arithmetic.

mod common;

use billing_service::models::{
    max_grace_period_days, BillingInterval, CancellationBehavior, CancellationOutcome,
    SubscriptionStatus,
};
use chrono::{Datelike, Duration, TimeZone, Utc};
use common::{addon_plan, base_plan, monthly_subscription, subscription};
use rust_decimal::Decimal;

#[test]
fn cancellation_honors_the_plan_behavior() {
    let now = Utc::now();
    let period_end = now + Duration::days(12);

    let outcome =
        CancellationOutcome::resolve(CancellationBehavior::EndOfPeriod, false, now, period_end);
    assert!(!outcome.immediately);
    assert_eq!(outcome.ends_at, period_end);

    let outcome =
        CancellationOutcome::resolve(CancellationBehavior::Immediate, false, now, period_end);
    assert!(outcome.immediately);
    assert_eq!(outcome.ends_at, now);
}

#[test]
fn caller_override_forces_immediate_cancellation() {
    let now = Utc::now();
    let period_end = now + Duration::days(12);

    let outcome =
        CancellationOutcome::resolve(CancellationBehavior::EndOfPeriod, true, now, period_end);
    assert!(outcome.immediately);
    assert_eq!(outcome.ends_at, now);
}

#[test]
fn grace_period_comes_from_base_plans_only() {
    let mut base = base_plan("Pro", Decimal::from(20));
    base.grace_period_days = 7;
    let mut other_base = base_plan("Extra", Decimal::from(5));
    other_base.grace_period_days = 3;
    let mut addon = addon_plan("Support", Decimal::from(9));
    addon.grace_period_days = 30;

    assert_eq!(max_grace_period_days([&base, &other_base, &addon]), 7);
    assert_eq!(max_grace_period_days([&addon]), 0);
    assert_eq!(max_grace_period_days(Vec::<&billing_service::models::Plan>::new()), 0);
}

#[test]
fn grace_period_resumability() {
    let now = Utc::now();
    let mut sub = monthly_subscription();

    assert!(!sub.on_grace_period(now));

    // Canceled at period end: still resumable until it ends.
    sub.status = "canceled".to_string();
    sub.canceled_at = Some(now);
    sub.ends_at = Some(sub.current_period_end);
    assert!(sub.on_grace_period(now));

    // Past its end: no longer resumable.
    sub.ends_at = Some(now - Duration::hours(1));
    assert!(!sub.on_grace_period(now));
    assert!(sub.has_ended(now));
}

#[test]
fn renewal_is_due_only_for_live_lapsed_subscriptions() {
    let now = Utc::now();

    let mut sub = subscription(now - Duration::days(40), now - Duration::days(10));
    assert!(sub.renewal_due(now));

    sub.status = "trialing".to_string();
    assert!(sub.renewal_due(now));

    sub.status = "canceled".to_string();
    assert!(!sub.renewal_due(now));

    let future = monthly_subscription();
    assert!(!future.renewal_due(now));
}

#[test]
fn scheduled_change_due_handles_missing_timestamps() {
    let now = Utc::now();
    let mut sub = monthly_subscription();

    assert!(!sub.scheduled_change_due(now));

    sub.scheduled_plan_id = Some(uuid::Uuid::new_v4());
    // No timestamp: treated as due.
    assert!(sub.scheduled_change_due(now));

    sub.plan_change_scheduled_for = Some(now + Duration::days(3));
    assert!(!sub.scheduled_change_due(now));

    sub.plan_change_scheduled_for = Some(now - Duration::hours(1));
    assert!(sub.scheduled_change_due(now));
}

#[test]
fn trialing_requires_a_future_trial_end() {
    let now = Utc::now();
    let mut sub = monthly_subscription();
    sub.status = "trialing".to_string();

    assert!(!sub.is_trialing(now));

    sub.trial_ends_at = Some(now + Duration::days(5));
    assert!(sub.is_trialing(now));

    sub.trial_ends_at = Some(now - Duration::days(1));
    assert!(!sub.is_trialing(now));
}

#[test]
fn status_strings_round_trip() {
    for status in [
        SubscriptionStatus::Active,
        SubscriptionStatus::Trialing,
        SubscriptionStatus::PastDue,
        SubscriptionStatus::Canceled,
        SubscriptionStatus::Suspended,
        SubscriptionStatus::Incomplete,
    ] {
        assert_eq!(SubscriptionStatus::from_string(status.as_str()), status);
    }
}

#[test]
fn billing_intervals_advance_by_calendar_months() {
    let start = Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();

    let monthly = BillingInterval::Monthly.period_end(start, 1);
    assert_eq!((monthly.year(), monthly.month(), monthly.day()), (2024, 2, 15));

    let quarterly = BillingInterval::Monthly.period_end(start, 3);
    assert_eq!((quarterly.year(), quarterly.month()), (2024, 4));

    let yearly = BillingInterval::Yearly.period_end(start, 1);
    assert_eq!((yearly.year(), yearly.month(), yearly.day()), (2025, 1, 15));
}

#[test]
fn month_end_periods_clamp_to_valid_dates() {
    let start = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
    let end = BillingInterval::Monthly.period_end(start, 1);
    // January 31 + 1 month clamps to February 29 in a leap year.
    assert_eq!((end.year(), end.month(), end.day()), (2024, 2, 29));
}
