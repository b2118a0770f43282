//! Discount and applied-discount models.

use crate::models::plan::Plan;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Discount value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "percentage",
            DiscountType::Fixed => "fixed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "fixed" => DiscountType::Fixed,
            _ => DiscountType::Percentage,
        }
    }
}

/// How long a discount keeps applying once attached to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountDuration {
    Once,
    Repeating,
    Forever,
}

impl DiscountDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountDuration::Once => "once",
            DiscountDuration::Repeating => "repeating",
            DiscountDuration::Forever => "forever",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "repeating" => DiscountDuration::Repeating,
            "forever" => DiscountDuration::Forever,
            _ => DiscountDuration::Once,
        }
    }
}

/// Which plans a discount can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountAppliesTo {
    All,
    SpecificPlans,
}

impl DiscountAppliesTo {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountAppliesTo::All => "all",
            DiscountAppliesTo::SpecificPlans => "specific_plans",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "specific_plans" => DiscountAppliesTo::SpecificPlans,
            _ => DiscountAppliesTo::All,
        }
    }
}

/// Discount definition. A `code` of `None` means the discount is
/// admin-only and cannot be redeemed by end users.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Discount {
    pub discount_id: Uuid,
    pub code: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub processor_coupon_id: Option<String>,
    pub processor_promotion_code_id: Option<String>,
    pub discount_type: String,
    pub value: Decimal,
    /// Required to match the charged currency for fixed discounts.
    pub currency: Option<String>,
    pub applies_to: String,
    /// JSON array of plan ids when `applies_to` is `specific_plans`.
    pub applicable_plan_ids: Option<serde_json::Value>,
    pub duration: String,
    pub duration_in_months: Option<i32>,
    pub max_redemptions: Option<i32>,
    pub redemptions_count: i32,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Discount {
    pub fn parsed_type(&self) -> DiscountType {
        DiscountType::from_string(&self.discount_type)
    }

    pub fn parsed_duration(&self) -> DiscountDuration {
        DiscountDuration::from_string(&self.duration)
    }

    pub fn parsed_applies_to(&self) -> DiscountAppliesTo {
        DiscountAppliesTo::from_string(&self.applies_to)
    }

    pub fn is_admin_only(&self) -> bool {
        self.code.is_none()
    }

    /// Active flag, validity window, and redemption cap all hold at `now`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }

        if self.starts_at.is_some_and(|starts_at| starts_at > now) {
            return false;
        }

        if self.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return false;
        }

        if self
            .max_redemptions
            .is_some_and(|cap| self.redemptions_count >= cap)
        {
            return false;
        }

        true
    }

    fn applicable_plan_id_list(&self) -> Vec<Uuid> {
        match &self.applicable_plan_ids {
            Some(serde_json::Value::Array(values)) => values
                .iter()
                .filter_map(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn can_apply_to_plan(&self, plan: &Plan) -> bool {
        match self.parsed_applies_to() {
            DiscountAppliesTo::All => true,
            DiscountAppliesTo::SpecificPlans => {
                self.applicable_plan_id_list().contains(&plan.plan_id)
            }
        }
    }

    /// Discount amount against `amount` in `currency`.
    ///
    /// Percentage values round to 2 decimal places. Fixed values return
    /// zero on a currency mismatch (no silent conversion) and never
    /// discount past the amount itself.
    pub fn calculate_discount(&self, amount: Decimal, currency: Option<&str>) -> Decimal {
        match self.parsed_type() {
            DiscountType::Percentage => {
                (amount * (self.value / Decimal::from(100))).round_dp(2)
            }
            DiscountType::Fixed => {
                if let (Some(own), Some(given)) = (self.currency.as_deref(), currency) {
                    if own != given {
                        return Decimal::ZERO;
                    }
                }
                self.value.min(amount)
            }
        }
    }

    pub fn discounted_price(&self, amount: Decimal, currency: Option<&str>) -> Decimal {
        (amount - self.calculate_discount(amount, currency)).max(Decimal::ZERO)
    }

    /// Human-readable value, used on invoice discount lines.
    pub fn format_value(&self) -> String {
        match self.parsed_type() {
            DiscountType::Percentage => format!("{}% off", self.value),
            DiscountType::Fixed => format!(
                "{} {} off",
                self.currency.as_deref().unwrap_or("").to_uppercase(),
                self.value
            ),
        }
    }
}

/// Join of a discount onto one subscription, with its own expiry distinct
/// from the discount definition's window.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AppliedDiscount {
    pub applied_discount_id: Uuid,
    pub subscription_id: Uuid,
    pub discount_id: Uuid,
    pub applied_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Billing-cycle application counter.
    pub total_uses: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl AppliedDiscount {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Still applying: not expired itself and the underlying discount is
    /// still valid.
    pub fn is_active(&self, discount: &Discount, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && discount.is_valid(now)
    }

    /// Whether this application exhausted the discount's duration policy.
    /// Evaluated against `total_uses` after the increment for the current
    /// invoice application.
    pub fn should_expire_after_use(&self, discount: &Discount) -> bool {
        match discount.parsed_duration() {
            DiscountDuration::Once => true,
            DiscountDuration::Repeating => discount
                .duration_in_months
                .is_some_and(|months| self.total_uses >= months),
            DiscountDuration::Forever => false,
        }
    }
}

/// Input for creating a discount definition.
#[derive(Debug, Clone)]
pub struct CreateDiscount {
    /// `None` makes the discount admin-only.
    pub code: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub currency: Option<String>,
    pub applies_to: DiscountAppliesTo,
    pub applicable_plan_ids: Option<serde_json::Value>,
    pub duration: DiscountDuration,
    pub duration_in_months: Option<i32>,
    pub max_redemptions: Option<i32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CreateDiscount {
    /// A percentage-off discount applying to all plans.
    pub fn percentage(name: impl Into<String>, value: Decimal) -> Self {
        Self {
            code: None,
            name: name.into(),
            description: None,
            discount_type: DiscountType::Percentage,
            value,
            currency: None,
            applies_to: DiscountAppliesTo::All,
            applicable_plan_ids: None,
            duration: DiscountDuration::Once,
            duration_in_months: None,
            max_redemptions: None,
            starts_at: None,
            expires_at: None,
        }
    }
}

/// Stack `discounts` sequentially against `amount`: each discount applies
/// to what remains after the ones before it, in application order, and
/// stacking stops once the amount is consumed. Returns the total discount.
pub fn stack_discounts(
    discounts: &[Discount],
    amount: Decimal,
    currency: Option<&str>,
) -> Decimal {
    let mut total_discount = Decimal::ZERO;

    for discount in discounts {
        let discount_amount = discount.calculate_discount(amount - total_discount, currency);
        total_discount += discount_amount;

        if total_discount >= amount {
            return amount;
        }
    }

    total_discount
}
