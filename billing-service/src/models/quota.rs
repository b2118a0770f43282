//! Quota usage tracking model and threshold evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

/// Per (billable, quota key) usage counter. One row per pair, enforced by
/// a uniqueness constraint.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuotaUsage {
    pub quota_usage_id: Uuid,
    pub billable_kind: String,
    pub billable_id: Uuid,
    pub quota_key: String,
    pub current_usage: f64,
    /// JSON array of warning percentages already fired for this counter.
    pub warning_thresholds_triggered: serde_json::Value,
    pub last_exceeded_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl QuotaUsage {
    pub fn triggered_thresholds(&self) -> Vec<u32> {
        match &self.warning_thresholds_triggered {
            serde_json::Value::Array(values) => values
                .iter()
                .filter_map(|v| v.as_u64().map(|n| n as u32))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn has_triggered_warning(&self, threshold: u32) -> bool {
        self.triggered_thresholds().contains(&threshold)
    }
}

/// Notification emitted when usage crosses a threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QuotaNotification {
    Warning {
        quota_key: String,
        current_usage: f64,
        limit: f64,
        threshold: u32,
    },
    Exceeded {
        quota_key: String,
        current_usage: f64,
        limit: f64,
        overage: f64,
    },
}

/// Outcome of evaluating usage against a limit.
#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdEvaluation {
    /// No limit configured; nothing to check.
    Unlimited,
    /// Usage is over the limit by `overage`. Warning checks are skipped.
    Exceeded { overage: f64 },
    /// Warning thresholds newly crossed, ascending, excluding any already
    /// triggered.
    Warnings(Vec<u32>),
}

/// Evaluate `current_usage` against `limit`. `already_triggered` holds
/// warning percentages that fired earlier and must not re-fire until
/// reset.
pub fn evaluate_thresholds(
    current_usage: f64,
    limit: Option<f64>,
    already_triggered: &[u32],
    warning_thresholds: &[u32],
) -> ThresholdEvaluation {
    let Some(limit) = limit else {
        return ThresholdEvaluation::Unlimited;
    };

    if current_usage > limit {
        return ThresholdEvaluation::Exceeded {
            overage: current_usage - limit,
        };
    }

    if limit <= 0.0 {
        return ThresholdEvaluation::Warnings(Vec::new());
    }

    let percentage = current_usage / limit * 100.0;
    let mut thresholds: Vec<u32> = warning_thresholds.to_vec();
    thresholds.sort_unstable();

    let newly_crossed = thresholds
        .into_iter()
        .filter(|threshold| {
            percentage >= *threshold as f64 && !already_triggered.contains(threshold)
        })
        .collect();

    ThresholdEvaluation::Warnings(newly_crossed)
}

/// Whether a usage decrement clears previously triggered warnings: only
/// when a positive limit exists and the new usage has dropped back below
/// it.
pub fn should_reset_warnings(limit: Option<f64>, new_usage: f64) -> bool {
    limit.is_some_and(|limit| limit > 0.0 && new_usage < limit)
}

/// Combine quota limits across subscription items.
///
/// Each entry is a plan's limit map with the item quantity. Items whose
/// plan carries no limits are skipped entirely; a key mapped to `null`
/// (unlimited) registers the key but contributes zero to the combined sum
/// rather than making the combined limit unlimited. See DESIGN.md for
/// the rationale behind this interpretation.
pub fn combine_limits<I>(entries: I) -> HashMap<String, f64>
where
    I: IntoIterator<Item = (HashMap<String, Option<f64>>, i32)>,
{
    let mut limits: HashMap<String, f64> = HashMap::new();

    for (limit_map, quantity) in entries {
        if limit_map.is_empty() {
            continue;
        }

        for (key, value) in limit_map {
            let contribution = value.unwrap_or(0.0) * quantity as f64;
            *limits.entry(key).or_insert(0.0) += contribution;
        }
    }

    limits
}
