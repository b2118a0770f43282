//! Subscription model and lifecycle arithmetic.

use crate::models::plan::{CancellationBehavior, Plan};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Suspended,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "suspended" => SubscriptionStatus::Suspended,
            "incomplete" => SubscriptionStatus::Incomplete,
            _ => SubscriptionStatus::Active,
        }
    }
}

/// The central mutable billing entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub customer_id: Uuid,
    pub processor_id: Option<String>,
    pub processor_status: Option<String>,
    pub status: String,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub previous_plan_id: Option<Uuid>,
    pub scheduled_plan_id: Option<Uuid>,
    pub plan_changed_at: Option<DateTime<Utc>>,
    pub plan_change_scheduled_for: Option<DateTime<Utc>>,
    pub failed_payment_count: i32,
    pub last_failed_payment_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    pub fn parsed_status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|ends_at| ends_at <= now)
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.parsed_status() == SubscriptionStatus::Active && !self.has_ended(now)
    }

    pub fn is_trialing(&self, now: DateTime<Utc>) -> bool {
        self.parsed_status() == SubscriptionStatus::Trialing
            && self.trial_ends_at.is_some_and(|t| t > now)
    }

    pub fn is_past_due(&self) -> bool {
        self.parsed_status() == SubscriptionStatus::PastDue
    }

    pub fn is_canceled(&self) -> bool {
        self.parsed_status() == SubscriptionStatus::Canceled
    }

    pub fn is_suspended(&self) -> bool {
        self.parsed_status() == SubscriptionStatus::Suspended
    }

    /// Canceled but still inside the paid-for window; resumable.
    pub fn on_grace_period(&self, now: DateTime<Utc>) -> bool {
        self.canceled_at.is_some() && !self.has_ended(now)
    }

    pub fn has_processor_id(&self) -> bool {
        self.processor_id.is_some()
    }

    pub fn has_scheduled_plan_change(&self) -> bool {
        self.scheduled_plan_id.is_some()
    }

    /// Whether the scheduled plan change is due at `now`. A schedule with
    /// no timestamp is treated as due.
    pub fn scheduled_change_due(&self, now: DateTime<Utc>) -> bool {
        self.has_scheduled_plan_change()
            && self
                .plan_change_scheduled_for
                .is_none_or(|scheduled_for| scheduled_for <= now)
    }

    pub fn renewal_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.parsed_status(),
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        ) && self.current_period_end <= now
    }
}

/// Subscription line: plan + quantity. Exactly one item of type "plan"
/// is the subscription's primary plan; addons attach alongside it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionItem {
    pub item_id: Uuid,
    pub subscription_id: Uuid,
    pub plan_id: Uuid,
    pub processor_id: Option<String>,
    pub quantity: i32,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl SubscriptionItem {
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|ends_at| ends_at <= now)
    }
}

/// Input for creating a subscription row.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub customer_id: Uuid,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Options for `subscribe`.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub quantity: i32,
    /// Overrides the trial end derived from the plan's trial days.
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            quantity: 1,
            trial_ends_at: None,
            metadata: None,
        }
    }
}

/// Options for `change_plan`.
#[derive(Debug, Clone, Default)]
pub struct ChangePlanOptions {
    /// Overrides the current plan's `prorate_changes` flag.
    pub prorate: Option<bool>,
    pub quantity: Option<i32>,
    /// Defer the change instead of applying it now.
    pub schedule: bool,
    /// When scheduling: the effective time; defaults to the current
    /// period end.
    pub schedule_for: Option<DateTime<Utc>>,
}

/// Resolved effect of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancellationOutcome {
    pub immediately: bool,
    pub ends_at: DateTime<Utc>,
}

impl CancellationOutcome {
    /// Resolve whether a cancellation takes effect now or at period end.
    /// The caller's `immediately` flag wins over the plan behavior.
    pub fn resolve(
        behavior: CancellationBehavior,
        immediately: bool,
        now: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        let immediate = immediately || behavior == CancellationBehavior::Immediate;
        Self {
            immediately: immediate,
            ends_at: if immediate { now } else { period_end },
        }
    }
}

/// Grace period for a subscription: the longest grace period granted by
/// any of its base-plan items.
pub fn max_grace_period_days<'a>(items: impl IntoIterator<Item = &'a Plan>) -> i32 {
    items
        .into_iter()
        .filter(|plan| plan.is_base_plan())
        .map(|plan| plan.grace_period_days)
        .max()
        .unwrap_or(0)
}

/// One side of a plan-change preview.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PreviewPlanSide {
    pub plan_id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub prorated_amount: Decimal,
}

/// Proration figures for a plan-change preview.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProrationFigures {
    pub unused_amount: Decimal,
    pub charge_for_new: Decimal,
    pub amount_due: Decimal,
    pub is_upgrade: bool,
    pub is_downgrade: bool,
}

/// Period bounds for a plan-change preview.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PreviewPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub remaining_days: i64,
}

/// Read-only cost breakdown for a prospective plan change.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlanChangePreview {
    pub current_plan: PreviewPlanSide,
    pub new_plan: PreviewPlanSide,
    pub proration: ProrationFigures,
    pub period: PreviewPeriod,
}

/// Preview the cost of changing `subscription` from `current_plan` to
/// `new_plan` at `now`. Pure: mutates nothing.
///
/// The remaining ratio is clamped to [0, 1] and is zero for a zero-length
/// period.
pub fn preview_plan_change(
    subscription: &Subscription,
    current_plan: &Plan,
    new_plan: &Plan,
    now: DateTime<Utc>,
) -> PlanChangePreview {
    let period_start = subscription.current_period_start;
    let period_end = subscription.current_period_end;

    let total_seconds = (period_end - period_start).num_seconds();
    let remaining_seconds = (period_end - now).num_seconds().clamp(0, total_seconds.max(0));

    let remaining_ratio = if total_seconds > 0 {
        Decimal::from(remaining_seconds) / Decimal::from(total_seconds)
    } else {
        Decimal::ZERO
    };

    let unused_credit = (current_plan.price * remaining_ratio).round_dp(2);
    let new_plan_prorated = (new_plan.price * remaining_ratio).round_dp(2);
    let amount_due = new_plan_prorated - unused_credit;

    PlanChangePreview {
        current_plan: PreviewPlanSide {
            plan_id: current_plan.plan_id,
            name: current_plan.name.clone(),
            price: current_plan.price,
            prorated_amount: unused_credit,
        },
        new_plan: PreviewPlanSide {
            plan_id: new_plan.plan_id,
            name: new_plan.name.clone(),
            price: new_plan.price,
            prorated_amount: new_plan_prorated,
        },
        proration: ProrationFigures {
            unused_amount: unused_credit,
            charge_for_new: new_plan_prorated,
            amount_due,
            is_upgrade: new_plan.price > current_plan.price,
            is_downgrade: new_plan.price < current_plan.price,
        },
        period: PreviewPeriod {
            start: period_start,
            end: period_end,
            remaining_days: remaining_seconds / 86_400,
        },
    }
}
