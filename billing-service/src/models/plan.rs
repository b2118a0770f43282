//! Billing plan model.

use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

/// Billing interval for plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Yearly => "yearly",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "yearly" => BillingInterval::Yearly,
            _ => BillingInterval::Monthly,
        }
    }

    /// End of a billing period starting at `start` spanning `count`
    /// intervals.
    pub fn period_end(&self, start: DateTime<Utc>, count: i32) -> DateTime<Utc> {
        let months = match self {
            BillingInterval::Monthly => count.max(1) as u32,
            BillingInterval::Yearly => (count.max(1) * 12) as u32,
        };
        start
            .checked_add_months(Months::new(months))
            .unwrap_or(start)
    }
}

/// Plan type: a base plan anchors a subscription's primary pricing, an
/// addon supplements it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Plan,
    Addon,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Plan => "plan",
            PlanType::Addon => "addon",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "addon" => PlanType::Addon,
            _ => PlanType::Plan,
        }
    }
}

/// How a cancellation takes effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationBehavior {
    #[default]
    EndOfPeriod,
    Immediate,
}

impl CancellationBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationBehavior::EndOfPeriod => "end_of_period",
            CancellationBehavior::Immediate => "immediate",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "immediate" => CancellationBehavior::Immediate,
            _ => CancellationBehavior::EndOfPeriod,
        }
    }
}

/// How a plan change takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeBehavior {
    Immediate,
    EndOfPeriod,
}

impl ChangeBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeBehavior::Immediate => "immediate",
            ChangeBehavior::EndOfPeriod => "end_of_period",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "end_of_period" => ChangeBehavior::EndOfPeriod,
            _ => ChangeBehavior::Immediate,
        }
    }
}

/// Priced, named product definition.
///
/// Price changes do not retroactively alter items on existing
/// subscriptions; those carry the plan id and are billed at the price read
/// when the invoice is materialized.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub plan_id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub processor_product_id: Option<String>,
    pub processor_price_id: Option<String>,
    pub price: Decimal,
    pub currency: String,
    pub billing_interval: String,
    pub interval_count: i32,
    pub plan_type: String,
    pub requires_plan: bool,
    pub is_active: bool,
    pub trial_period_days: i32,
    pub grace_period_days: i32,
    pub cancellation_behavior: String,
    pub change_behavior: String,
    pub prorate_changes: bool,
    pub prorate_cancellations: bool,
    /// JSON array of feature strings.
    pub features: Option<serde_json::Value>,
    /// JSON object of quota key -> numeric limit; a `null` limit means
    /// unlimited for that key.
    pub limits: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Plan {
    pub fn parsed_type(&self) -> PlanType {
        PlanType::from_string(&self.plan_type)
    }

    pub fn is_base_plan(&self) -> bool {
        self.parsed_type() == PlanType::Plan
    }

    pub fn is_addon(&self) -> bool {
        self.parsed_type() == PlanType::Addon
    }

    pub fn requires_base_plan(&self) -> bool {
        self.requires_plan
    }

    pub fn parsed_interval(&self) -> BillingInterval {
        BillingInterval::from_string(&self.billing_interval)
    }

    pub fn parsed_cancellation_behavior(&self) -> CancellationBehavior {
        CancellationBehavior::from_string(&self.cancellation_behavior)
    }

    pub fn parsed_change_behavior(&self) -> ChangeBehavior {
        ChangeBehavior::from_string(&self.change_behavior)
    }

    pub fn has_trial(&self) -> bool {
        self.trial_period_days > 0
    }

    pub fn has_processor_price_id(&self) -> bool {
        self.processor_price_id.is_some()
    }

    /// End of a billing period starting at `start`.
    pub fn period_end_from(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        self.parsed_interval().period_end(start, self.interval_count)
    }

    pub fn feature_list(&self) -> Vec<String> {
        match &self.features {
            Some(serde_json::Value::Array(values)) => values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.feature_list().iter().any(|f| f == feature)
    }

    /// Quota limits as a typed map. `None` values are unlimited keys.
    pub fn limit_map(&self) -> HashMap<String, Option<f64>> {
        match &self.limits {
            Some(serde_json::Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_f64()))
                .collect(),
            _ => HashMap::new(),
        }
    }

    pub fn has_limits(&self) -> bool {
        matches!(&self.limits, Some(serde_json::Value::Object(map)) if !map.is_empty())
    }
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub currency: String,
    pub billing_interval: BillingInterval,
    pub interval_count: i32,
    pub plan_type: PlanType,
    pub requires_plan: bool,
    pub trial_period_days: i32,
    pub grace_period_days: i32,
    pub cancellation_behavior: CancellationBehavior,
    pub change_behavior: ChangeBehavior,
    pub prorate_changes: bool,
    pub prorate_cancellations: bool,
    pub features: Option<serde_json::Value>,
    pub limits: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub sort_order: i32,
}

impl CreatePlan {
    /// A monthly base plan with the package defaults for the behavioral
    /// fields.
    pub fn base_plan(name: impl Into<String>, slug: impl Into<String>, price: Decimal) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            description: None,
            price,
            currency: "usd".to_string(),
            billing_interval: BillingInterval::Monthly,
            interval_count: 1,
            plan_type: PlanType::Plan,
            requires_plan: false,
            trial_period_days: 0,
            grace_period_days: 0,
            cancellation_behavior: CancellationBehavior::EndOfPeriod,
            change_behavior: ChangeBehavior::Immediate,
            prorate_changes: true,
            prorate_cancellations: false,
            features: None,
            limits: None,
            metadata: None,
            sort_order: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(features: Option<serde_json::Value>, limits: Option<serde_json::Value>) -> Plan {
        let now = Utc::now();
        Plan {
            plan_id: Uuid::new_v4(),
            name: "Pro".to_string(),
            slug: "pro".to_string(),
            description: None,
            processor_product_id: None,
            processor_price_id: None,
            price: Decimal::from(20),
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
            features,
            limits,
            metadata: None,
            sort_order: 0,
            created_utc: now,
            updated_utc: now,
        }
    }

    #[test]
    fn feature_list_parses_string_arrays_only() {
        let plan = plan_with(Some(serde_json::json!(["api", "sso", 42])), None);
        assert_eq!(plan.feature_list(), vec!["api", "sso"]);
        assert!(plan.has_feature("sso"));
        assert!(!plan.has_feature("audit"));

        let no_features = plan_with(None, None);
        assert!(no_features.feature_list().is_empty());
    }

    #[test]
    fn limit_map_keeps_null_entries_as_unlimited() {
        let plan = plan_with(
            None,
            Some(serde_json::json!({"projects": 10, "storage_gb": null})),
        );
        let limits = plan.limit_map();
        assert_eq!(limits.get("projects"), Some(&Some(10.0)));
        assert_eq!(limits.get("storage_gb"), Some(&None));
        assert!(plan.has_limits());

        assert!(!plan_with(None, None).has_limits());
        assert!(!plan_with(None, Some(serde_json::json!({}))).has_limits());
    }
}
