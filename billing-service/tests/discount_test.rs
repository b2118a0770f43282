//! Discount engine tests: validity, applicability, calculation, and
//! stacking.

mod common;

use billing_service::models::stack_discounts;
use billing_service::services::discounts::applied_discount_expiry;
use chrono::{Duration, Months, Utc};
use common::{
    applied, base_plan, fixed_discount, monthly_subscription, percentage_discount,
};
use rust_decimal::Decimal;

#[test]
fn percentage_discount_rounds_to_two_places() {
    let discount = percentage_discount("save10", Decimal::from(10));
    assert_eq!(
        discount.calculate_discount(Decimal::from(100), None),
        Decimal::from(10)
    );

    let odd = percentage_discount("odd", Decimal::new(3333, 2)); // 33.33%
    assert_eq!(
        odd.calculate_discount(Decimal::from(10), None),
        Decimal::new(333, 2)
    );
}

#[test]
fn fixed_discount_never_exceeds_amount() {
    let discount = fixed_discount("flat50", Decimal::from(50), None);
    assert_eq!(
        discount.calculate_discount(Decimal::from(30), None),
        Decimal::from(30)
    );
    assert_eq!(
        discount.calculate_discount(Decimal::from(80), None),
        Decimal::from(50)
    );
}

#[test]
fn fixed_discount_currency_mismatch_applies_nothing() {
    let discount = fixed_discount("flat10", Decimal::from(10), Some("eur"));
    assert_eq!(
        discount.calculate_discount(Decimal::from(100), Some("usd")),
        Decimal::ZERO
    );
    assert_eq!(
        discount.calculate_discount(Decimal::from(100), Some("eur")),
        Decimal::from(10)
    );
    // No currency on either side: applies.
    let unscoped = fixed_discount("flat10", Decimal::from(10), None);
    assert_eq!(
        unscoped.calculate_discount(Decimal::from(100), Some("usd")),
        Decimal::from(10)
    );
}

#[test]
fn validity_checks_active_flag_window_and_cap() {
    let now = Utc::now();

    let mut discount = percentage_discount("save", Decimal::from(10));
    assert!(discount.is_valid(now));

    discount.is_active = false;
    assert!(!discount.is_valid(now));
    discount.is_active = true;

    discount.starts_at = Some(now + Duration::days(1));
    assert!(!discount.is_valid(now));
    discount.starts_at = Some(now - Duration::days(1));
    assert!(discount.is_valid(now));

    discount.expires_at = Some(now - Duration::hours(1));
    assert!(!discount.is_valid(now));
    discount.expires_at = Some(now + Duration::hours(1));
    assert!(discount.is_valid(now));

    discount.max_redemptions = Some(5);
    discount.redemptions_count = 5;
    assert!(!discount.is_valid(now));
    discount.redemptions_count = 4;
    assert!(discount.is_valid(now));
}

#[test]
fn applicability_honors_specific_plan_lists() {
    let plan = base_plan("Pro", Decimal::from(20));
    let other = base_plan("Starter", Decimal::from(5));

    let all = percentage_discount("all", Decimal::from(10));
    assert!(all.can_apply_to_plan(&plan));

    let mut specific = percentage_discount("specific", Decimal::from(10));
    specific.applies_to = "specific_plans".to_string();
    specific.applicable_plan_ids = Some(serde_json::json!([plan.plan_id.to_string()]));
    assert!(specific.can_apply_to_plan(&plan));
    assert!(!specific.can_apply_to_plan(&other));
}

#[test]
fn admin_only_discounts_have_no_code() {
    let mut discount = percentage_discount("save", Decimal::from(10));
    assert!(!discount.is_admin_only());
    discount.code = None;
    assert!(discount.is_admin_only());
}

#[test]
fn discounts_stack_against_the_remaining_amount() {
    // 10% then 5%: 10.00 + (90 x 0.05) = 14.50, not 15.00.
    let a = percentage_discount("a", Decimal::from(10));
    let b = percentage_discount("b", Decimal::from(5));

    let total = stack_discounts(&[a, b], Decimal::from(100), None);
    assert_eq!(total, Decimal::new(1450, 2));
}

#[test]
fn stacking_stops_once_the_amount_is_consumed() {
    let a = fixed_discount("a", Decimal::from(80), None);
    let b = fixed_discount("b", Decimal::from(50), None);

    let total = stack_discounts(&[a, b], Decimal::from(100), None);
    assert_eq!(total, Decimal::from(100));
}

#[test]
fn applied_discount_expires_per_duration_policy() {
    let subscription = monthly_subscription();
    let mut row = applied(
        &percentage_discount("save", Decimal::from(10)),
        subscription.subscription_id,
    );

    let mut once = percentage_discount("once", Decimal::from(10));
    once.duration = "once".to_string();
    row.total_uses = 1;
    assert!(row.should_expire_after_use(&once));

    let mut repeating = percentage_discount("rep", Decimal::from(10));
    repeating.duration = "repeating".to_string();
    repeating.duration_in_months = Some(3);
    row.total_uses = 2;
    assert!(!row.should_expire_after_use(&repeating));
    row.total_uses = 3;
    assert!(row.should_expire_after_use(&repeating));

    let forever = percentage_discount("forever", Decimal::from(10));
    row.total_uses = 100;
    assert!(!row.should_expire_after_use(&forever));
}

#[test]
fn applied_discount_activity_tracks_its_own_expiry_and_the_discount() {
    let now = Utc::now();
    let subscription = monthly_subscription();
    let discount = percentage_discount("save", Decimal::from(10));
    let mut row = applied(&discount, subscription.subscription_id);

    assert!(row.is_active(&discount, now));

    row.expires_at = Some(now - Duration::hours(1));
    assert!(!row.is_active(&discount, now));

    row.expires_at = Some(now + Duration::days(1));
    let mut inactive = discount.clone();
    inactive.is_active = false;
    assert!(!row.is_active(&inactive, now));
}

#[test]
fn apply_time_expiry_follows_duration() {
    let now = Utc::now();
    let subscription = monthly_subscription();

    let mut once = percentage_discount("once", Decimal::from(10));
    once.duration = "once".to_string();
    assert_eq!(
        applied_discount_expiry(&once, &subscription, now),
        Some(subscription.current_period_end)
    );

    let mut repeating = percentage_discount("rep", Decimal::from(10));
    repeating.duration = "repeating".to_string();
    repeating.duration_in_months = Some(3);
    assert_eq!(
        applied_discount_expiry(&repeating, &subscription, now),
        now.checked_add_months(Months::new(3))
    );

    let forever = percentage_discount("forever", Decimal::from(10));
    assert_eq!(applied_discount_expiry(&forever, &subscription, now), None);
}
