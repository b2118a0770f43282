//! Database service for billing-service.
//!
//! Wraps the PostgreSQL pool and owns every SQL statement. Operations
//! touching more than one persisted entity (credit append + balance
//! recompute, invoice item + totals, discount apply + redemption
//! increment, refund success + credit) run inside a single transaction so
//! no reader ever observes a half-updated balance or total.

use crate::models::{
    next_invoice_number, AppliedDiscount, BillableRef, CreateCustomer, CreateDiscount,
    CreateInvoiceItem, CreatePlan, CreateSubscription, CreditOptions, CreditType, Customer,
    CustomerCredit, Discount, DiscountLine, Invoice, InvoiceItem, PaymentMethod, Plan,
    QuotaUsage, Refund, RefundOptions, RefundReason, Subscription, SubscriptionItem,
    SubscriptionStatus,
};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const CUSTOMER_COLUMNS: &str = "customer_id, billable_kind, billable_id, processor_id, email, name, credit_balance, metadata, created_utc, updated_utc";
const PLAN_COLUMNS: &str = "plan_id, name, slug, description, processor_product_id, processor_price_id, price, currency, billing_interval, interval_count, plan_type, requires_plan, is_active, trial_period_days, grace_period_days, cancellation_behavior, change_behavior, prorate_changes, prorate_cancellations, features, limits, metadata, sort_order, created_utc, updated_utc";
const SUBSCRIPTION_COLUMNS: &str = "subscription_id, customer_id, processor_id, processor_status, status, trial_ends_at, current_period_start, current_period_end, canceled_at, ends_at, previous_plan_id, scheduled_plan_id, plan_changed_at, plan_change_scheduled_for, failed_payment_count, last_failed_payment_at, metadata, created_utc, updated_utc";
const SUBSCRIPTION_ITEM_COLUMNS: &str = "item_id, subscription_id, plan_id, processor_id, quantity, trial_ends_at, ends_at, metadata, created_utc, updated_utc";
const DISCOUNT_COLUMNS: &str = "discount_id, code, name, description, processor_coupon_id, processor_promotion_code_id, discount_type, value, currency, applies_to, applicable_plan_ids, duration, duration_in_months, max_redemptions, redemptions_count, starts_at, expires_at, is_active, created_utc, updated_utc";
const APPLIED_DISCOUNT_COLUMNS: &str = "applied_discount_id, subscription_id, discount_id, applied_at, expires_at, total_uses, created_utc, updated_utc";
const INVOICE_COLUMNS: &str = "invoice_id, customer_id, subscription_id, processor_id, invoice_number, status, subtotal, discount, tax, total, currency, due_date, paid_at, voided_at, notes, metadata, created_utc, updated_utc";
const INVOICE_ITEM_COLUMNS: &str = "item_id, invoice_id, subscription_id, plan_id, discount_id, description, quantity, unit_price, amount, is_discount, is_proration, period_start, period_end, metadata, created_utc";
const CREDIT_COLUMNS: &str = "credit_id, customer_id, credit_type, amount, currency, balance_before, balance_after, description, notes, invoice_id, refund_id, reference_kind, reference_id, expires_at, is_expired, metadata, created_utc";
const REFUND_COLUMNS: &str = "refund_id, customer_id, invoice_id, processor_refund_id, amount, currency, status, reason, description, failure_reason, processed_at, notes, metadata, created_utc, updated_utc";
const QUOTA_USAGE_COLUMNS: &str = "quota_usage_id, billable_kind, billable_id, quota_key, current_usage, warning_thresholds_triggered, last_exceeded_at, created_utc, updated_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, AppError> {
        self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })
    }

    // =========================================================================
    // Customer Operations
    // =========================================================================

    /// Create a customer for a billable principal.
    #[instrument(skip(self, input), fields(billable = %input.billable))]
    pub async fn create_customer(&self, input: &CreateCustomer) -> Result<Customer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_customer"])
            .start_timer();

        let customer_id = Uuid::new_v4();
        let customer = sqlx::query_as::<_, Customer>(&format!(
            r#"
            INSERT INTO billing_customers (customer_id, billable_kind, billable_id, email, name, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {CUSTOMER_COLUMNS}
            "#,
        ))
        .bind(customer_id)
        .bind(&input.billable.kind)
        .bind(input.billable.id)
        .bind(&input.email)
        .bind(&input.name)
        .bind(&input.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Customer already exists for billable {}",
                    input.billable
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create customer: {}", e)),
        })?;

        timer.observe_duration();
        info!(customer_id = %customer.customer_id, "Customer created");

        Ok(customer)
    }

    /// Get a customer by ID.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM billing_customers WHERE customer_id = $1",
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get customer: {}", e)))?;

        timer.observe_duration();

        Ok(customer)
    }

    /// Get the customer owned by a billable principal.
    #[instrument(skip(self), fields(billable = %billable))]
    pub async fn get_customer_by_billable(
        &self,
        billable: &BillableRef,
    ) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer_by_billable"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(&format!(
            r#"
            SELECT {CUSTOMER_COLUMNS}
            FROM billing_customers
            WHERE billable_kind = $1 AND billable_id = $2
            "#,
        ))
        .bind(&billable.kind)
        .bind(billable.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get customer: {}", e)))?;

        timer.observe_duration();

        Ok(customer)
    }

    /// Get the customer for a billable principal, creating it if absent.
    pub async fn get_or_create_customer(
        &self,
        input: &CreateCustomer,
    ) -> Result<Customer, AppError> {
        if let Some(customer) = self.get_customer_by_billable(&input.billable).await? {
            return Ok(customer);
        }

        match self.create_customer(input).await {
            Ok(customer) => Ok(customer),
            // Concurrent creation: another request won the insert.
            Err(AppError::Conflict(_)) => self
                .get_customer_by_billable(&input.billable)
                .await?
                .ok_or_else(|| {
                    AppError::DatabaseError(anyhow::anyhow!("Customer vanished after conflict"))
                }),
            Err(e) => Err(e),
        }
    }

    /// Record the external processor id assigned to a customer.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn set_customer_processor_id(
        &self,
        customer_id: Uuid,
        processor_id: &str,
    ) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_customer_processor_id"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(&format!(
            r#"
            UPDATE billing_customers
            SET processor_id = $2
            WHERE customer_id = $1
            RETURNING {CUSTOMER_COLUMNS}
            "#,
        ))
        .bind(customer_id)
        .bind(processor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set processor id: {}", e))
        })?;

        timer.observe_duration();

        Ok(customer)
    }

    /// Whether the customer has any stored payment method.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn has_payment_method(&self, customer_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["has_payment_method"])
            .start_timer();

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM billing_payment_methods WHERE customer_id = $1)",
        )
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to check payment methods: {}", e))
        })?;

        timer.observe_duration();

        Ok(exists)
    }

    /// Store a payment method reference.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn add_payment_method(
        &self,
        customer_id: Uuid,
        processor_id: &str,
        method_type: &str,
        brand: Option<&str>,
        last_four: Option<&str>,
        is_default: bool,
    ) -> Result<PaymentMethod, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_payment_method"])
            .start_timer();

        let payment_method = sqlx::query_as::<_, PaymentMethod>(
            r#"
            INSERT INTO billing_payment_methods (payment_method_id, customer_id, processor_id, method_type, brand, last_four, is_default)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING payment_method_id, customer_id, processor_id, method_type, brand, last_four, is_default, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(processor_id)
        .bind(method_type)
        .bind(brand)
        .bind(last_four)
        .bind(is_default)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to add payment method: {}", e))
        })?;

        timer.observe_duration();

        Ok(payment_method)
    }

    // =========================================================================
    // Plan Operations
    // =========================================================================

    /// Create a plan.
    #[instrument(skip(self, input), fields(slug = %input.slug))]
    pub async fn create_plan(&self, input: &CreatePlan) -> Result<Plan, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_plan"])
            .start_timer();

        let plan_id = Uuid::new_v4();
        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"
            INSERT INTO billing_plans (plan_id, name, slug, description, price, currency, billing_interval, interval_count, plan_type, requires_plan, trial_period_days, grace_period_days, cancellation_behavior, change_behavior, prorate_changes, prorate_cancellations, features, limits, metadata, sort_order)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            RETURNING {PLAN_COLUMNS}
            "#,
        ))
        .bind(plan_id)
        .bind(&input.name)
        .bind(&input.slug)
        .bind(&input.description)
        .bind(input.price)
        .bind(&input.currency)
        .bind(input.billing_interval.as_str())
        .bind(input.interval_count)
        .bind(input.plan_type.as_str())
        .bind(input.requires_plan)
        .bind(input.trial_period_days)
        .bind(input.grace_period_days)
        .bind(input.cancellation_behavior.as_str())
        .bind(input.change_behavior.as_str())
        .bind(input.prorate_changes)
        .bind(input.prorate_cancellations)
        .bind(&input.features)
        .bind(&input.limits)
        .bind(&input.metadata)
        .bind(input.sort_order)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Plan with slug '{}' already exists",
                    input.slug
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create plan: {}", e)),
        })?;

        timer.observe_duration();
        info!(plan_id = %plan.plan_id, name = %plan.name, "Plan created");

        Ok(plan)
    }

    /// Get a plan by ID.
    #[instrument(skip(self), fields(plan_id = %plan_id))]
    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM billing_plans WHERE plan_id = $1",
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get plan: {}", e)))?;

        timer.observe_duration();

        Ok(plan)
    }

    /// Get a plan by slug.
    #[instrument(skip(self))]
    pub async fn get_plan_by_slug(&self, slug: &str) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan_by_slug"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM billing_plans WHERE slug = $1",
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get plan: {}", e)))?;

        timer.observe_duration();

        Ok(plan)
    }

    /// List active plans ordered for display.
    #[instrument(skip(self))]
    pub async fn list_active_plans(&self) -> Result<Vec<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_plans"])
            .start_timer();

        let plans = sqlx::query_as::<_, Plan>(&format!(
            r#"
            SELECT {PLAN_COLUMNS}
            FROM billing_plans
            WHERE is_active = TRUE
            ORDER BY sort_order, name
            "#,
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list plans: {}", e)))?;

        timer.observe_duration();

        Ok(plans)
    }

    /// Record the processor product/price ids for a plan.
    #[instrument(skip(self), fields(plan_id = %plan_id))]
    pub async fn set_plan_processor_refs(
        &self,
        plan_id: Uuid,
        product_id: &str,
        price_id: &str,
    ) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_plan_processor_refs"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"
            UPDATE billing_plans
            SET processor_product_id = $2, processor_price_id = $3
            WHERE plan_id = $1
            RETURNING {PLAN_COLUMNS}
            "#,
        ))
        .bind(plan_id)
        .bind(product_id)
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set processor refs: {}", e))
        })?;

        timer.observe_duration();

        Ok(plan)
    }

    // =========================================================================
    // Subscription Operations
    // =========================================================================

    /// Create a subscription.
    #[instrument(skip(self, input), fields(customer_id = %input.customer_id))]
    pub async fn create_subscription(
        &self,
        input: &CreateSubscription,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        let subscription_id = Uuid::new_v4();
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            INSERT INTO billing_subscriptions (subscription_id, customer_id, status, trial_ends_at, current_period_start, current_period_end, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#,
        ))
        .bind(subscription_id)
        .bind(input.customer_id)
        .bind(input.status.as_str())
        .bind(input.trial_ends_at)
        .bind(input.current_period_start)
        .bind(input.current_period_end)
        .bind(&input.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create subscription: {}", e))
        })?;

        timer.observe_duration();
        info!(subscription_id = %subscription.subscription_id, "Subscription created");

        Ok(subscription)
    }

    /// Get a subscription by ID.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM billing_subscriptions WHERE subscription_id = $1",
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get subscription: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// Get a subscription by its processor id.
    #[instrument(skip(self))]
    pub async fn get_subscription_by_processor_id(
        &self,
        processor_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription_by_processor_id"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM billing_subscriptions WHERE processor_id = $1",
        ))
        .bind(processor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get subscription: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// Record the processor id/status assigned to a subscription.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn set_subscription_processor(
        &self,
        subscription_id: Uuid,
        processor_id: &str,
        processor_status: Option<&str>,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_subscription_processor"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE billing_subscriptions
            SET processor_id = $2, processor_status = $3
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#,
        ))
        .bind(subscription_id)
        .bind(processor_id)
        .bind(processor_status)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set processor: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// Update subscription status.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn update_subscription_status(
        &self,
        subscription_id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription_status"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE billing_subscriptions
            SET status = $2
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#,
        ))
        .bind(subscription_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update status: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// Cancel a subscription, recording when the cancellation takes effect.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        canceled_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE billing_subscriptions
            SET status = 'canceled', canceled_at = $2, ends_at = $3
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#,
        ))
        .bind(subscription_id)
        .bind(canceled_at)
        .bind(ends_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to cancel subscription: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// Resume a subscription that is on its cancellation grace period.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn resume_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["resume_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE billing_subscriptions
            SET status = 'active', canceled_at = NULL, ends_at = NULL
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#,
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to resume subscription: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// Record a failed payment: bump the counter and drop to past_due.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn record_payment_failure(
        &self,
        subscription_id: Uuid,
        failed_at: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_payment_failure"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE billing_subscriptions
            SET status = 'past_due',
                failed_payment_count = failed_payment_count + 1,
                last_failed_payment_at = $2
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#,
        ))
        .bind(subscription_id)
        .bind(failed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record payment failure: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// Advance (or sync) the current billing period.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn update_subscription_period(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription_period"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE billing_subscriptions
            SET current_period_start = $2, current_period_end = $3
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#,
        ))
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update period: {}", e)))?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// Swap the primary item's plan and record the change, atomically.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, new_plan_id = %new_plan_id))]
    pub async fn change_subscription_plan(
        &self,
        subscription_id: Uuid,
        item_id: Uuid,
        previous_plan_id: Uuid,
        new_plan_id: Uuid,
        quantity: Option<i32>,
        changed_at: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["change_subscription_plan"])
            .start_timer();

        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            UPDATE billing_subscription_items
            SET plan_id = $2, quantity = COALESCE($3, quantity)
            WHERE item_id = $1
            "#,
        )
        .bind(item_id)
        .bind(new_plan_id)
        .bind(quantity)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update item: {}", e)))?;

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE billing_subscriptions
            SET previous_plan_id = $2, plan_changed_at = $3
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#,
        ))
        .bind(subscription_id)
        .bind(previous_plan_id)
        .bind(changed_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record plan change: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit plan change: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// Schedule a deferred plan change.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn schedule_plan_change(
        &self,
        subscription_id: Uuid,
        plan_id: Uuid,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["schedule_plan_change"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE billing_subscriptions
            SET scheduled_plan_id = $2, plan_change_scheduled_for = $3
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#,
        ))
        .bind(subscription_id)
        .bind(plan_id)
        .bind(scheduled_for)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to schedule plan change: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// Clear a scheduled plan change.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn clear_scheduled_plan_change(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["clear_scheduled_plan_change"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE billing_subscriptions
            SET scheduled_plan_id = NULL, plan_change_scheduled_for = NULL
            WHERE subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#,
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to clear scheduled change: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// Add a plan item to a subscription.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, plan_id = %plan_id))]
    pub async fn add_subscription_item(
        &self,
        subscription_id: Uuid,
        plan_id: Uuid,
        quantity: i32,
    ) -> Result<SubscriptionItem, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_subscription_item"])
            .start_timer();

        let item = sqlx::query_as::<_, SubscriptionItem>(&format!(
            r#"
            INSERT INTO billing_subscription_items (item_id, subscription_id, plan_id, quantity)
            VALUES ($1, $2, $3, $4)
            RETURNING {SUBSCRIPTION_ITEM_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(plan_id)
        .bind(quantity)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to add item: {}", e)))?;

        timer.observe_duration();

        Ok(item)
    }

    /// Items of a subscription in insertion order.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn get_subscription_items(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription_items"])
            .start_timer();

        let items = sqlx::query_as::<_, SubscriptionItem>(&format!(
            r#"
            SELECT {SUBSCRIPTION_ITEM_COLUMNS}
            FROM billing_subscription_items
            WHERE subscription_id = $1
            ORDER BY created_utc
            "#,
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get items: {}", e)))?;

        timer.observe_duration();

        Ok(items)
    }

    /// The subscription's primary base-plan item, if any.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn get_primary_item(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<SubscriptionItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_primary_item"])
            .start_timer();

        let item = sqlx::query_as::<_, SubscriptionItem>(
            r#"
            SELECT si.item_id, si.subscription_id, si.plan_id, si.processor_id, si.quantity, si.trial_ends_at, si.ends_at, si.metadata, si.created_utc, si.updated_utc
            FROM billing_subscription_items si
            JOIN billing_plans p ON si.plan_id = p.plan_id
            WHERE si.subscription_id = $1 AND p.plan_type = 'plan'
            ORDER BY si.created_utc
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get primary item: {}", e))
        })?;

        timer.observe_duration();

        Ok(item)
    }

    /// Whether the subscription carries any base-plan item.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn has_base_plan_item(&self, subscription_id: Uuid) -> Result<bool, AppError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1
                FROM billing_subscription_items si
                JOIN billing_plans p ON si.plan_id = p.plan_id
                WHERE si.subscription_id = $1 AND p.plan_type = 'plan'
            )
            "#,
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to check base plan: {}", e))
        })?;

        Ok(exists)
    }

    /// Active or trialing subscriptions for a customer.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn active_subscriptions_for_customer(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["active_subscriptions_for_customer"])
            .start_timer();

        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM billing_subscriptions
            WHERE customer_id = $1 AND status IN ('active', 'trialing')
            ORDER BY created_utc
            "#,
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list subscriptions: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscriptions)
    }

    // -------------------------------------------------------------------------
    // Sweep queries
    // -------------------------------------------------------------------------

    /// Active or trialing subscriptions whose period has lapsed.
    #[instrument(skip(self))]
    pub async fn find_renewals_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM billing_subscriptions
            WHERE status IN ('active', 'trialing') AND current_period_end <= $1
            ORDER BY current_period_end
            "#,
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find renewals: {}", e)))?;

        Ok(subscriptions)
    }

    /// Trialing subscriptions whose trial has ended.
    #[instrument(skip(self))]
    pub async fn find_expiring_trials(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM billing_subscriptions
            WHERE status = 'trialing' AND trial_ends_at IS NOT NULL AND trial_ends_at <= $1
            ORDER BY trial_ends_at
            "#,
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find trials: {}", e)))?;

        Ok(subscriptions)
    }

    /// Past-due subscriptions with a recorded payment failure.
    #[instrument(skip(self))]
    pub async fn find_past_due(&self) -> Result<Vec<Subscription>, AppError> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM billing_subscriptions
            WHERE status = 'past_due' AND last_failed_payment_at IS NOT NULL
            ORDER BY last_failed_payment_at
            "#,
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find past due: {}", e)))?;

        Ok(subscriptions)
    }

    /// Subscriptions with a scheduled plan change that is due.
    #[instrument(skip(self))]
    pub async fn find_due_scheduled_changes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM billing_subscriptions
            WHERE scheduled_plan_id IS NOT NULL
              AND (plan_change_scheduled_for IS NULL OR plan_change_scheduled_for <= $1)
            ORDER BY plan_change_scheduled_for
            "#,
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find scheduled changes: {}", e))
        })?;

        Ok(subscriptions)
    }

    /// Canceled subscriptions whose end date has passed.
    #[instrument(skip(self))]
    pub async fn find_ended(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, AppError> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM billing_subscriptions
            WHERE status = 'canceled' AND ends_at IS NOT NULL AND ends_at <= $1
            ORDER BY ends_at
            "#,
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find ended: {}", e)))?;

        Ok(subscriptions)
    }
}

impl Database {
    // =========================================================================
    // Discount Operations
    // =========================================================================

    /// Create a discount definition.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_discount(&self, input: &CreateDiscount) -> Result<Discount, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_discount"])
            .start_timer();

        let discount = sqlx::query_as::<_, Discount>(&format!(
            r#"
            INSERT INTO billing_discounts (discount_id, code, name, description, discount_type, value, currency, applies_to, applicable_plan_ids, duration, duration_in_months, max_redemptions, starts_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {DISCOUNT_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(&input.code)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.discount_type.as_str())
        .bind(input.value)
        .bind(&input.currency)
        .bind(input.applies_to.as_str())
        .bind(&input.applicable_plan_ids)
        .bind(input.duration.as_str())
        .bind(input.duration_in_months)
        .bind(input.max_redemptions)
        .bind(input.starts_at)
        .bind(input.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!("Discount code already exists"))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create discount: {}", e)),
        })?;

        timer.observe_duration();

        Ok(discount)
    }

    /// Get a discount by ID.
    #[instrument(skip(self), fields(discount_id = %discount_id))]
    pub async fn get_discount(&self, discount_id: Uuid) -> Result<Option<Discount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_discount"])
            .start_timer();

        let discount = sqlx::query_as::<_, Discount>(&format!(
            "SELECT {DISCOUNT_COLUMNS} FROM billing_discounts WHERE discount_id = $1",
        ))
        .bind(discount_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get discount: {}", e)))?;

        timer.observe_duration();

        Ok(discount)
    }

    /// Find an end-user-redeemable discount by its code.
    #[instrument(skip(self))]
    pub async fn find_discount_by_code(&self, code: &str) -> Result<Option<Discount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_discount_by_code"])
            .start_timer();

        let discount = sqlx::query_as::<_, Discount>(&format!(
            "SELECT {DISCOUNT_COLUMNS} FROM billing_discounts WHERE code = $1",
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find discount: {}", e)))?;

        timer.observe_duration();

        Ok(discount)
    }

    /// Attach a discount to a subscription: the redemption increment and
    /// the join-row insert land together or not at all. The increment is
    /// guarded against the redemption cap so concurrent redemptions
    /// cannot overshoot it.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, discount_id = %discount_id))]
    pub async fn apply_discount(
        &self,
        subscription_id: Uuid,
        discount_id: Uuid,
        applied_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AppliedDiscount, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_discount"])
            .start_timer();

        let mut tx = self.begin().await?;

        let redeemed = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE billing_discounts
            SET redemptions_count = redemptions_count + 1
            WHERE discount_id = $1
              AND (max_redemptions IS NULL OR redemptions_count < max_redemptions)
            RETURNING discount_id
            "#,
        )
        .bind(discount_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to increment redemptions: {}", e))
        })?;

        if redeemed.is_none() {
            tx.rollback().await.ok();
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Discount redemption limit reached"
            )));
        }

        let applied = sqlx::query_as::<_, AppliedDiscount>(&format!(
            r#"
            INSERT INTO billing_applied_discounts (applied_discount_id, subscription_id, discount_id, applied_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {APPLIED_DISCOUNT_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(discount_id)
        .bind(applied_at)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to apply discount: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit discount apply: {}", e))
        })?;

        timer.observe_duration();
        info!(applied_discount_id = %applied.applied_discount_id, "Discount applied");

        Ok(applied)
    }

    /// Applied discounts for a subscription, in application order.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn get_applied_discounts(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<AppliedDiscount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_applied_discounts"])
            .start_timer();

        let applied = sqlx::query_as::<_, AppliedDiscount>(&format!(
            r#"
            SELECT {APPLIED_DISCOUNT_COLUMNS}
            FROM billing_applied_discounts
            WHERE subscription_id = $1
            ORDER BY applied_at, created_utc
            "#,
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get applied discounts: {}", e))
        })?;

        timer.observe_duration();

        Ok(applied)
    }

    /// The non-expired join row for a (subscription, discount) pair.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, discount_id = %discount_id))]
    pub async fn get_active_applied_discount(
        &self,
        subscription_id: Uuid,
        discount_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<AppliedDiscount>, AppError> {
        let applied = sqlx::query_as::<_, AppliedDiscount>(&format!(
            r#"
            SELECT {APPLIED_DISCOUNT_COLUMNS}
            FROM billing_applied_discounts
            WHERE subscription_id = $1 AND discount_id = $2
              AND (expires_at IS NULL OR expires_at > $3)
            LIMIT 1
            "#,
        ))
        .bind(subscription_id)
        .bind(discount_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get applied discount: {}", e))
        })?;

        Ok(applied)
    }

    /// Detach a discount from a subscription. Explicit removal deletes
    /// the join row.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, discount_id = %discount_id))]
    pub async fn remove_applied_discount(
        &self,
        subscription_id: Uuid,
        discount_id: Uuid,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["remove_applied_discount"])
            .start_timer();

        let result = sqlx::query(
            "DELETE FROM billing_applied_discounts WHERE subscription_id = $1 AND discount_id = $2",
        )
        .bind(subscription_id)
        .bind(discount_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to remove discount: {}", e))
        })?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    /// Create a draft invoice with the next sequential number.
    ///
    /// Number generation locks the most recent invoice row so concurrent
    /// creators serialize and numbers stay unique and strictly increasing.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn create_invoice(
        &self,
        customer_id: Uuid,
        subscription_id: Option<Uuid>,
        currency: &str,
        due_date: Option<DateTime<Utc>>,
        number_prefix: &str,
        starting_number: i64,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let mut tx = self.begin().await?;

        let last_number: Option<String> = sqlx::query_scalar(
            r#"
            SELECT invoice_number
            FROM billing_invoices
            ORDER BY created_utc DESC, invoice_number DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to lock last invoice: {}", e))
        })?;

        let invoice_number =
            next_invoice_number(last_number.as_deref(), number_prefix, starting_number);

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO billing_invoices (invoice_id, customer_id, subscription_id, invoice_number, currency, due_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {INVOICE_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(subscription_id)
        .bind(&invoice_number)
        .bind(currency)
        .bind(due_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create invoice: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit invoice: {}", e))
        })?;

        timer.observe_duration();
        info!(invoice_id = %invoice.invoice_id, invoice_number = %invoice.invoice_number, "Invoice created");

        Ok(invoice)
    }

    /// Get an invoice by ID.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM billing_invoices WHERE invoice_id = $1",
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// Get an invoice by its processor id.
    #[instrument(skip(self))]
    pub async fn get_invoice_by_processor_id(
        &self,
        processor_id: &str,
    ) -> Result<Option<Invoice>, AppError> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM billing_invoices WHERE processor_id = $1",
        ))
        .bind(processor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        Ok(invoice)
    }

    /// Line items of an invoice in insertion order.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_invoice_items(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoiceItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_items"])
            .start_timer();

        let items = sqlx::query_as::<_, InvoiceItem>(&format!(
            r#"
            SELECT {INVOICE_ITEM_COLUMNS}
            FROM billing_invoice_items
            WHERE invoice_id = $1
            ORDER BY created_utc
            "#,
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice items: {}", e))
        })?;

        timer.observe_duration();

        Ok(items)
    }

    /// Add a line item and recompute the invoice totals atomically.
    #[instrument(skip(self, input), fields(invoice_id = %input.invoice_id))]
    pub async fn add_invoice_item(
        &self,
        input: &CreateInvoiceItem,
    ) -> Result<(InvoiceItem, Invoice), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_invoice_item"])
            .start_timer();

        let mut tx = self.begin().await?;

        let item = Self::insert_invoice_item_tx(&mut tx, input).await?;
        let invoice = Self::recalculate_invoice_totals_tx(&mut tx, input.invoice_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit invoice item: {}", e))
        })?;

        timer.observe_duration();

        Ok((item, invoice))
    }

    /// Materialize discount lines on an invoice: one negative item per
    /// line, use-counter bookkeeping on the applied discounts, and the
    /// totals recompute, all in one transaction.
    #[instrument(skip(self, lines), fields(invoice_id = %invoice_id, subscription_id = %subscription_id))]
    pub async fn insert_discount_items(
        &self,
        invoice_id: Uuid,
        subscription_id: Uuid,
        lines: &[DiscountLine],
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Vec<InvoiceItem>, Invoice), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_discount_items"])
            .start_timer();

        let mut tx = self.begin().await?;
        let mut items = Vec::with_capacity(lines.len());

        for line in lines {
            let input = CreateInvoiceItem {
                invoice_id,
                subscription_id: Some(subscription_id),
                plan_id: None,
                discount_id: Some(line.discount_id),
                description: line.description.clone(),
                quantity: 1,
                unit_price: -line.amount,
                amount: -line.amount,
                is_discount: true,
                is_proration: false,
                period_start: Some(period_start),
                period_end: Some(period_end),
                metadata: None,
            };
            items.push(Self::insert_invoice_item_tx(&mut tx, &input).await?);

            let total_uses: i32 = sqlx::query_scalar(
                r#"
                UPDATE billing_applied_discounts
                SET total_uses = total_uses + 1
                WHERE applied_discount_id = $1
                RETURNING total_uses
                "#,
            )
            .bind(line.applied_discount_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to record discount use: {}", e))
            })?;

            if line
                .expires_after_uses
                .is_some_and(|threshold| total_uses >= threshold)
            {
                sqlx::query(
                    "UPDATE billing_applied_discounts SET expires_at = $2 WHERE applied_discount_id = $1",
                )
                .bind(line.applied_discount_id)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to expire discount: {}", e))
                })?;
            }
        }

        let invoice = Self::recalculate_invoice_totals_tx(&mut tx, invoice_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit discount items: {}", e))
        })?;

        timer.observe_duration();

        Ok((items, invoice))
    }

    /// Recompute and persist an invoice's totals from its line items.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn recalculate_invoice_totals(
        &self,
        invoice_id: Uuid,
    ) -> Result<Invoice, AppError> {
        let mut tx = self.begin().await?;
        let invoice = Self::recalculate_invoice_totals_tx(&mut tx, invoice_id).await?;
        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit totals: {}", e))
        })?;
        Ok(invoice)
    }

    /// Move a draft invoice to open.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn open_invoice(
        &self,
        invoice_id: Uuid,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<Option<Invoice>, AppError> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE billing_invoices
            SET status = 'open', due_date = COALESCE($2, due_date)
            WHERE invoice_id = $1 AND status = 'draft'
            RETURNING {INVOICE_COLUMNS}
            "#,
        ))
        .bind(invoice_id)
        .bind(due_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to open invoice: {}", e)))?;

        Ok(invoice)
    }

    /// Mark an invoice paid.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        paid_at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_paid"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE billing_invoices
            SET status = 'paid', paid_at = $2
            WHERE invoice_id = $1
            RETURNING {INVOICE_COLUMNS}
            "#,
        ))
        .bind(invoice_id)
        .bind(paid_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark invoice paid: {}", e))
        })?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// Void an invoice.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn void_invoice(
        &self,
        invoice_id: Uuid,
        voided_at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE billing_invoices
            SET status = 'void', voided_at = $2
            WHERE invoice_id = $1
            RETURNING {INVOICE_COLUMNS}
            "#,
        ))
        .bind(invoice_id)
        .bind(voided_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to void invoice: {}", e)))?;

        Ok(invoice)
    }

    async fn insert_invoice_item_tx(
        tx: &mut Transaction<'_, Postgres>,
        input: &CreateInvoiceItem,
    ) -> Result<InvoiceItem, AppError> {
        sqlx::query_as::<_, InvoiceItem>(&format!(
            r#"
            INSERT INTO billing_invoice_items (item_id, invoice_id, subscription_id, plan_id, discount_id, description, quantity, unit_price, amount, is_discount, is_proration, period_start, period_end, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {INVOICE_ITEM_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(input.invoice_id)
        .bind(input.subscription_id)
        .bind(input.plan_id)
        .bind(input.discount_id)
        .bind(&input.description)
        .bind(input.quantity)
        .bind(input.unit_price)
        .bind(input.amount)
        .bind(input.is_discount)
        .bind(input.is_proration)
        .bind(input.period_start)
        .bind(input.period_end)
        .bind(&input.metadata)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert invoice item: {}", e))
        })
    }

    async fn recalculate_invoice_totals_tx(
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: Uuid,
    ) -> Result<Invoice, AppError> {
        let (subtotal, discount): (Decimal, Decimal) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(amount) FILTER (WHERE is_discount = FALSE), 0),
                ABS(COALESCE(SUM(amount) FILTER (WHERE is_discount = TRUE), 0))
            FROM billing_invoice_items
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum items: {}", e)))?;

        sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE billing_invoices
            SET subtotal = $2,
                discount = $3,
                total = GREATEST(0, $2 - $3 + tax)
            WHERE invoice_id = $1
            RETURNING {INVOICE_COLUMNS}
            "#,
        ))
        .bind(invoice_id)
        .bind(subtotal)
        .bind(discount)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update totals: {}", e)))
    }
}

impl Database {
    // =========================================================================
    // Credit Ledger Operations
    // =========================================================================

    /// Append a signed ledger entry and recompute the cached customer
    /// balance, atomically. Positive amounts credit, negative debit.
    #[instrument(skip(self, options), fields(customer_id = %customer_id))]
    #[allow(clippy::too_many_arguments)]
    pub async fn add_credit(
        &self,
        customer_id: Uuid,
        amount: Decimal,
        credit_type: CreditType,
        currency: &str,
        description: Option<&str>,
        options: &CreditOptions,
        now: DateTime<Utc>,
    ) -> Result<CustomerCredit, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_credit"])
            .start_timer();

        let mut tx = self.begin().await?;

        Self::lock_customer_tx(&mut tx, customer_id).await?;
        let credit =
            Self::insert_credit_tx(&mut tx, customer_id, amount, credit_type, currency, description, options, now)
                .await?;
        Self::refresh_customer_balance_tx(&mut tx, customer_id, now).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit credit: {}", e))
        })?;

        timer.observe_duration();
        info!(credit_id = %credit.credit_id, amount = %credit.amount, "Credit ledger entry added");

        Ok(credit)
    }

    /// Apply available credit to an invoice: deduct from the ledger, add
    /// a negative line item, and recompute invoice totals in one
    /// transaction. Returns the applied amount (zero when nothing could
    /// be applied) together with the debit entry and updated invoice.
    #[instrument(skip(self), fields(customer_id = %customer_id, invoice_id = %invoice_id))]
    pub async fn apply_credits_to_invoice(
        &self,
        customer_id: Uuid,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Decimal, Option<CustomerCredit>, Option<Invoice>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_credits_to_invoice"])
            .start_timer();

        let mut tx = self.begin().await?;

        Self::lock_customer_tx(&mut tx, customer_id).await?;
        let available = Self::active_credit_sum_tx(&mut tx, customer_id, now).await?;

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM billing_invoices WHERE invoice_id = $1 FOR UPDATE",
        ))
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock invoice: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

        let amount = crate::models::credit_application_amount(available, invoice.total);
        if amount <= Decimal::ZERO {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok((Decimal::ZERO, None, None));
        }

        let options = CreditOptions {
            invoice_id: Some(invoice_id),
            ..CreditOptions::default()
        };
        let description = format!("Applied to invoice {}", invoice.invoice_number);
        let credit = Self::insert_credit_tx(
            &mut tx,
            customer_id,
            -amount,
            CreditType::InvoicePayment,
            &invoice.currency,
            Some(&description),
            &options,
            now,
        )
        .await?;
        Self::refresh_customer_balance_tx(&mut tx, customer_id, now).await?;

        let item_input = CreateInvoiceItem {
            invoice_id,
            subscription_id: invoice.subscription_id,
            plan_id: None,
            discount_id: None,
            description: "Account Credit".to_string(),
            quantity: 1,
            unit_price: -amount,
            amount: -amount,
            is_discount: true,
            is_proration: false,
            period_start: None,
            period_end: None,
            metadata: None,
        };
        Self::insert_invoice_item_tx(&mut tx, &item_input).await?;
        let invoice = Self::recalculate_invoice_totals_tx(&mut tx, invoice_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit credit application: {}", e))
        })?;

        timer.observe_duration();
        info!(invoice_id = %invoice_id, amount = %amount, "Credits applied to invoice");

        Ok((amount, Some(credit), Some(invoice)))
    }

    /// Flag lapsed-but-unflagged credits as expired and recompute the
    /// cached balance.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn expire_due_credits(
        &self,
        customer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["expire_due_credits"])
            .start_timer();

        let mut tx = self.begin().await?;

        Self::lock_customer_tx(&mut tx, customer_id).await?;
        let result = sqlx::query(
            r#"
            UPDATE billing_customer_credits
            SET is_expired = TRUE
            WHERE customer_id = $1
              AND is_expired = FALSE
              AND expires_at IS NOT NULL
              AND expires_at <= $2
            "#,
        )
        .bind(customer_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to expire credits: {}", e))
        })?;

        Self::refresh_customer_balance_tx(&mut tx, customer_id, now).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit expiry: {}", e))
        })?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    /// Ledger entries for a customer, newest first.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn list_credits(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<CustomerCredit>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_credits"])
            .start_timer();

        let credits = sqlx::query_as::<_, CustomerCredit>(&format!(
            r#"
            SELECT {CREDIT_COLUMNS}
            FROM billing_customer_credits
            WHERE customer_id = $1
            ORDER BY created_utc DESC
            "#,
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list credits: {}", e)))?;

        timer.observe_duration();

        Ok(credits)
    }

    async fn lock_customer_tx(
        tx: &mut Transaction<'_, Postgres>,
        customer_id: Uuid,
    ) -> Result<(), AppError> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT customer_id FROM billing_customers WHERE customer_id = $1 FOR UPDATE",
        )
        .bind(customer_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock customer: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Customer not found")))?;
        Ok(())
    }

    async fn active_credit_sum_tx(
        tx: &mut Transaction<'_, Postgres>,
        customer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Decimal, AppError> {
        let sum: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT SUM(amount)
            FROM billing_customer_credits
            WHERE customer_id = $1
              AND is_expired = FALSE
              AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(customer_id)
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum credits: {}", e)))?;

        Ok(sum.unwrap_or(Decimal::ZERO))
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_credit_tx(
        tx: &mut Transaction<'_, Postgres>,
        customer_id: Uuid,
        amount: Decimal,
        credit_type: CreditType,
        currency: &str,
        description: Option<&str>,
        options: &CreditOptions,
        now: DateTime<Utc>,
    ) -> Result<CustomerCredit, AppError> {
        let balance_before = Self::active_credit_sum_tx(tx, customer_id, now).await?;

        sqlx::query_as::<_, CustomerCredit>(&format!(
            r#"
            INSERT INTO billing_customer_credits (credit_id, customer_id, credit_type, amount, currency, balance_before, balance_after, description, notes, invoice_id, refund_id, reference_kind, reference_id, expires_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {CREDIT_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(credit_type.as_str())
        .bind(amount)
        .bind(currency)
        .bind(balance_before)
        .bind(balance_before + amount)
        .bind(description)
        .bind(&options.notes)
        .bind(options.invoice_id)
        .bind(options.refund_id)
        .bind(&options.reference_kind)
        .bind(options.reference_id)
        .bind(options.expires_at)
        .bind(&options.metadata)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert credit: {}", e)))
    }

    /// Recompute `credit_balance` as the sum of active ledger rows.
    async fn refresh_customer_balance_tx(
        tx: &mut Transaction<'_, Postgres>,
        customer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Decimal, AppError> {
        let balance = Self::active_credit_sum_tx(tx, customer_id, now).await?;

        sqlx::query("UPDATE billing_customers SET credit_balance = $2 WHERE customer_id = $1")
            .bind(customer_id)
            .bind(balance)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to refresh balance: {}", e))
            })?;

        Ok(balance)
    }

    // =========================================================================
    // Refund Operations
    // =========================================================================

    /// Create a pending refund.
    #[instrument(skip(self, options), fields(customer_id = %customer_id))]
    #[allow(clippy::too_many_arguments)]
    pub async fn create_refund(
        &self,
        customer_id: Uuid,
        invoice_id: Option<Uuid>,
        amount: Decimal,
        currency: &str,
        reason: RefundReason,
        options: &RefundOptions,
    ) -> Result<Refund, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_refund"])
            .start_timer();

        let refund = sqlx::query_as::<_, Refund>(&format!(
            r#"
            INSERT INTO billing_refunds (refund_id, customer_id, invoice_id, amount, currency, reason, description, notes, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {REFUND_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(invoice_id)
        .bind(amount)
        .bind(currency)
        .bind(reason.as_str())
        .bind(&options.description)
        .bind(&options.notes)
        .bind(&options.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create refund: {}", e)))?;

        timer.observe_duration();
        info!(refund_id = %refund.refund_id, amount = %refund.amount, "Refund created");

        Ok(refund)
    }

    /// Get a refund by ID.
    #[instrument(skip(self), fields(refund_id = %refund_id))]
    pub async fn get_refund(&self, refund_id: Uuid) -> Result<Option<Refund>, AppError> {
        let refund = sqlx::query_as::<_, Refund>(&format!(
            "SELECT {REFUND_COLUMNS} FROM billing_refunds WHERE refund_id = $1",
        ))
        .bind(refund_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get refund: {}", e)))?;

        Ok(refund)
    }

    /// Refunds linked to an invoice.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn list_refunds_for_invoice(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<Refund>, AppError> {
        let refunds = sqlx::query_as::<_, Refund>(&format!(
            r#"
            SELECT {REFUND_COLUMNS}
            FROM billing_refunds
            WHERE invoice_id = $1
            ORDER BY created_utc
            "#,
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list refunds: {}", e)))?;

        Ok(refunds)
    }

    /// Sum of succeeded refund amounts for an invoice. Never stored
    /// redundantly; always derived from the refund rows.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn sum_succeeded_refunds(&self, invoice_id: Uuid) -> Result<Decimal, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sum_succeeded_refunds"])
            .start_timer();

        let sum: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT SUM(amount)
            FROM billing_refunds
            WHERE invoice_id = $1 AND status = 'succeeded'
            "#,
        )
        .bind(invoice_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum refunds: {}", e)))?;

        timer.observe_duration();

        Ok(sum.unwrap_or(Decimal::ZERO))
    }

    /// Mark a refund succeeded and, when requested, create the matching
    /// refund-typed ledger credit in the same transaction.
    #[instrument(skip(self), fields(refund_id = %refund_id))]
    pub async fn mark_refund_succeeded(
        &self,
        refund_id: Uuid,
        create_credit: bool,
        now: DateTime<Utc>,
    ) -> Result<(Refund, Option<CustomerCredit>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_refund_succeeded"])
            .start_timer();

        let mut tx = self.begin().await?;

        let refund = sqlx::query_as::<_, Refund>(&format!(
            r#"
            UPDATE billing_refunds
            SET status = 'succeeded', processed_at = $2
            WHERE refund_id = $1
            RETURNING {REFUND_COLUMNS}
            "#,
        ))
        .bind(refund_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update refund: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Refund not found")))?;

        let credit = if create_credit {
            Self::lock_customer_tx(&mut tx, refund.customer_id).await?;
            let description = format!(
                "Refund: {}",
                refund.description.as_deref().unwrap_or("Invoice refund")
            );
            let options = CreditOptions {
                invoice_id: refund.invoice_id,
                refund_id: Some(refund.refund_id),
                ..CreditOptions::default()
            };
            let credit = Self::insert_credit_tx(
                &mut tx,
                refund.customer_id,
                refund.amount,
                CreditType::Refund,
                &refund.currency,
                Some(&description),
                &options,
                now,
            )
            .await?;
            Self::refresh_customer_balance_tx(&mut tx, refund.customer_id, now).await?;
            Some(credit)
        } else {
            None
        };

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit refund: {}", e))
        })?;

        timer.observe_duration();
        info!(refund_id = %refund.refund_id, "Refund succeeded");

        Ok((refund, credit))
    }

    /// Mark a refund failed. No ledger effect.
    #[instrument(skip(self), fields(refund_id = %refund_id))]
    pub async fn mark_refund_failed(
        &self,
        refund_id: Uuid,
        failure_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Refund>, AppError> {
        let refund = sqlx::query_as::<_, Refund>(&format!(
            r#"
            UPDATE billing_refunds
            SET status = 'failed', processed_at = $2, failure_reason = $3
            WHERE refund_id = $1
            RETURNING {REFUND_COLUMNS}
            "#,
        ))
        .bind(refund_id)
        .bind(now)
        .bind(failure_reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark refund failed: {}", e))
        })?;

        Ok(refund)
    }

    /// Cancel a refund. Only legal while it is still pending; the guard
    /// lives in the WHERE clause so a concurrent settle cannot race it.
    #[instrument(skip(self), fields(refund_id = %refund_id))]
    pub async fn cancel_refund(
        &self,
        refund_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Refund>, AppError> {
        let refund = sqlx::query_as::<_, Refund>(&format!(
            r#"
            UPDATE billing_refunds
            SET status = 'canceled', processed_at = $2
            WHERE refund_id = $1 AND status = 'pending'
            RETURNING {REFUND_COLUMNS}
            "#,
        ))
        .bind(refund_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to cancel refund: {}", e))
        })?;

        Ok(refund)
    }

    /// Record the processor id assigned to a refund.
    #[instrument(skip(self), fields(refund_id = %refund_id))]
    pub async fn set_refund_processor_id(
        &self,
        refund_id: Uuid,
        processor_refund_id: &str,
    ) -> Result<Option<Refund>, AppError> {
        let refund = sqlx::query_as::<_, Refund>(&format!(
            r#"
            UPDATE billing_refunds
            SET processor_refund_id = $2
            WHERE refund_id = $1
            RETURNING {REFUND_COLUMNS}
            "#,
        ))
        .bind(refund_id)
        .bind(processor_refund_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set refund processor: {}", e))
        })?;

        Ok(refund)
    }

    // =========================================================================
    // Quota Usage Operations
    // =========================================================================

    /// Get the usage counter for a (billable, key) pair.
    #[instrument(skip(self), fields(billable = %billable, quota_key = quota_key))]
    pub async fn get_quota_usage(
        &self,
        billable: &BillableRef,
        quota_key: &str,
    ) -> Result<Option<QuotaUsage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_quota_usage"])
            .start_timer();

        let usage = sqlx::query_as::<_, QuotaUsage>(&format!(
            r#"
            SELECT {QUOTA_USAGE_COLUMNS}
            FROM billing_quota_usage
            WHERE billable_kind = $1 AND billable_id = $2 AND quota_key = $3
            "#,
        ))
        .bind(&billable.kind)
        .bind(billable.id)
        .bind(quota_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get quota usage: {}", e)))?;

        timer.observe_duration();

        Ok(usage)
    }

    /// Get or create the usage counter for a (billable, key) pair. The
    /// uniqueness constraint makes concurrent creation safe.
    #[instrument(skip(self), fields(billable = %billable, quota_key = quota_key))]
    pub async fn get_or_create_quota_usage(
        &self,
        billable: &BillableRef,
        quota_key: &str,
    ) -> Result<QuotaUsage, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_or_create_quota_usage"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO billing_quota_usage (quota_usage_id, billable_kind, billable_id, quota_key)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (billable_kind, billable_id, quota_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&billable.kind)
        .bind(billable.id)
        .bind(quota_key)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create quota usage: {}", e))
        })?;

        let usage = self
            .get_quota_usage(billable, quota_key)
            .await?
            .ok_or_else(|| {
                AppError::DatabaseError(anyhow::anyhow!("Quota usage vanished after insert"))
            })?;

        timer.observe_duration();

        Ok(usage)
    }

    /// Persist a usage counter's state.
    #[instrument(skip(self, warning_thresholds_triggered), fields(quota_usage_id = %quota_usage_id))]
    pub async fn update_quota_usage(
        &self,
        quota_usage_id: Uuid,
        current_usage: f64,
        warning_thresholds_triggered: &serde_json::Value,
        last_exceeded_at: Option<DateTime<Utc>>,
    ) -> Result<QuotaUsage, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_quota_usage"])
            .start_timer();

        let usage = sqlx::query_as::<_, QuotaUsage>(&format!(
            r#"
            UPDATE billing_quota_usage
            SET current_usage = $2, warning_thresholds_triggered = $3, last_exceeded_at = $4
            WHERE quota_usage_id = $1
            RETURNING {QUOTA_USAGE_COLUMNS}
            "#,
        ))
        .bind(quota_usage_id)
        .bind(current_usage)
        .bind(warning_thresholds_triggered)
        .bind(last_exceeded_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update quota usage: {}", e))
        })?;

        timer.observe_duration();

        Ok(usage)
    }

    /// All usage counters for a billable principal.
    #[instrument(skip(self), fields(billable = %billable))]
    pub async fn list_quota_usage(
        &self,
        billable: &BillableRef,
    ) -> Result<Vec<QuotaUsage>, AppError> {
        let usages = sqlx::query_as::<_, QuotaUsage>(&format!(
            r#"
            SELECT {QUOTA_USAGE_COLUMNS}
            FROM billing_quota_usage
            WHERE billable_kind = $1 AND billable_id = $2
            ORDER BY quota_key
            "#,
        ))
        .bind(&billable.kind)
        .bind(billable.id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list quota usage: {}", e))
        })?;

        Ok(usages)
    }
}
