//! Quota tracking tests: threshold evaluation and combined limits.

mod common;

use billing_service::models::{
    combine_limits, evaluate_thresholds, should_reset_warnings, ThresholdEvaluation,
};
use std::collections::HashMap;

fn limits(entries: &[(&str, Option<f64>)]) -> HashMap<String, Option<f64>> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect()
}

#[test]
fn unlimited_keys_are_never_checked() {
    assert_eq!(
        evaluate_thresholds(900.0, None, &[], &[80, 90]),
        ThresholdEvaluation::Unlimited
    );
}

#[test]
fn warnings_fire_in_ascending_order_when_crossed() {
    // 900 of 1000 crosses both the 80% and 90% thresholds.
    assert_eq!(
        evaluate_thresholds(900.0, Some(1000.0), &[], &[80, 90]),
        ThresholdEvaluation::Warnings(vec![80, 90])
    );

    // Threshold order in configuration does not matter.
    assert_eq!(
        evaluate_thresholds(900.0, Some(1000.0), &[], &[90, 80]),
        ThresholdEvaluation::Warnings(vec![80, 90])
    );
}

#[test]
fn already_triggered_thresholds_stay_silent() {
    assert_eq!(
        evaluate_thresholds(900.0, Some(1000.0), &[80], &[80, 90]),
        ThresholdEvaluation::Warnings(vec![90])
    );
    assert_eq!(
        evaluate_thresholds(950.0, Some(1000.0), &[80, 90], &[80, 90]),
        ThresholdEvaluation::Warnings(vec![])
    );
}

#[test]
fn usage_below_all_thresholds_warns_nothing() {
    assert_eq!(
        evaluate_thresholds(500.0, Some(1000.0), &[], &[80, 90]),
        ThresholdEvaluation::Warnings(vec![])
    );
}

#[test]
fn exceeding_the_limit_skips_warning_checks() {
    assert_eq!(
        evaluate_thresholds(1100.0, Some(1000.0), &[], &[80, 90]),
        ThresholdEvaluation::Exceeded { overage: 100.0 }
    );
}

#[test]
fn usage_exactly_at_the_limit_is_not_exceeded() {
    // 100% of the limit crosses every warning threshold but is not over.
    assert_eq!(
        evaluate_thresholds(1000.0, Some(1000.0), &[], &[80, 90]),
        ThresholdEvaluation::Warnings(vec![80, 90])
    );
}

#[test]
fn decrementing_below_the_limit_resets_warning_state() {
    // 900 of 1000 fires 80 and 90; dropping to 500 resets them.
    assert_eq!(
        evaluate_thresholds(900.0, Some(1000.0), &[], &[80, 90]),
        ThresholdEvaluation::Warnings(vec![80, 90])
    );
    assert!(should_reset_warnings(Some(1000.0), 500.0));
    // After the reset, crossing again re-fires.
    assert_eq!(
        evaluate_thresholds(850.0, Some(1000.0), &[], &[80, 90]),
        ThresholdEvaluation::Warnings(vec![80])
    );
}

#[test]
fn warnings_do_not_reset_without_a_positive_limit_or_below_it() {
    assert!(!should_reset_warnings(None, 100.0));
    assert!(!should_reset_warnings(Some(0.0), 0.0));
    assert!(!should_reset_warnings(Some(1000.0), 1000.0));
}

#[test]
fn combined_limits_sum_per_key_scaled_by_quantity() {
    let combined = combine_limits(vec![
        (limits(&[("projects", Some(10.0))]), 1),
        (limits(&[("projects", Some(5.0)), ("seats", Some(3.0))]), 2),
    ]);

    assert_eq!(combined.get("projects"), Some(&20.0));
    assert_eq!(combined.get("seats"), Some(&6.0));
}

#[test]
fn plans_without_limits_are_skipped() {
    let combined = combine_limits(vec![
        (HashMap::new(), 1),
        (limits(&[("projects", Some(10.0))]), 1),
    ]);

    assert_eq!(combined.len(), 1);
    assert_eq!(combined.get("projects"), Some(&10.0));
}

#[test]
fn null_limits_register_the_key_but_contribute_zero() {
    // An unlimited (`null`) entry does not make the combined key
    // unlimited; it adds nothing to the sum.
    let combined = combine_limits(vec![
        (limits(&[("storage", None)]), 1),
        (limits(&[("storage", Some(50.0))]), 1),
    ]);
    assert_eq!(combined.get("storage"), Some(&50.0));

    let only_null = combine_limits(vec![(limits(&[("storage", None)]), 3)]);
    assert_eq!(only_null.get("storage"), Some(&0.0));
}
